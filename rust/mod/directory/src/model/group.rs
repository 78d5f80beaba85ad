use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A group of users and nested groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub dn: String,

    /// Set when the closest group scope is locked.
    #[serde(default)]
    pub locked: bool,

    /// Member user ids. Never holds the schema placeholder.
    #[serde(default)]
    pub members: BTreeSet<String>,

    /// Nested group ids.
    #[serde(default)]
    pub sub_groups: BTreeSet<String>,

    /// Ids of the groups this group is nested in.
    #[serde(default)]
    pub groups: BTreeSet<String>,
}

/// Input for creating a group.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupEdition {
    pub name: String,

    /// Name of the group scope the entry is created in. Without it, the
    /// entry goes under the parent or the groups base.
    #[serde(default, rename = "type")]
    pub scope: Option<String>,

    /// Group the new group is nested into, and created under. Must sit
    /// inside `scope` when both are given.
    #[serde(default)]
    pub parent: Option<String>,

    /// Departments linked to this group.
    #[serde(default)]
    pub departments: Vec<String>,
}
