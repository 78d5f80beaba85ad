mod company;
mod container;
mod delegate;
mod group;
mod scope;
mod user;

pub use company::*;
pub use container::*;
pub use delegate::*;
pub use group::*;
pub use scope::*;
pub use user::*;

use std::collections::BTreeMap;

use serde::Serialize;

/// The in-memory graph: every entity keyed by normalized id, relationships
/// held as id sets on both ends.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DirectoryData {
    pub companies: BTreeMap<String, Company>,
    pub groups: BTreeMap<String, Group>,
    pub users: BTreeMap<String, User>,
}
