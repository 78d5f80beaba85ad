use orgsync_ldap::dn;
use serde::{Deserialize, Serialize};

use super::ContainerType;

/// Named DN under which containers of one kind are created.
///
/// A locked scope forbids creating or deleting containers inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerScope {
    pub id: String,
    pub name: String,

    /// DN as written in the directory.
    pub dn: String,

    #[serde(rename = "type")]
    pub container_type: ContainerType,

    #[serde(default)]
    pub locked: bool,

    pub created_at: String,
    pub updated_at: String,
}

impl ContainerScope {
    /// Whether `target_dn` is the scope DN or below it.
    pub fn contains(&self, target_dn: &str) -> bool {
        dn::equals_or_parent_of(&self.dn, target_dn)
    }
}

/// The first scope of `scopes` containing `target_dn`.
///
/// `scopes` are expected deepest first, so the finest scope wins.
pub fn closest_scope<'a>(scopes: &'a [ContainerScope], target_dn: &str) -> Option<&'a ContainerScope> {
    scopes.iter().find(|s| s.contains(target_dn))
}

/// Input for creating or updating a scope.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerScopeEdition {
    pub name: String,
    pub dn: String,

    #[serde(rename = "type")]
    pub container_type: ContainerType,

    #[serde(default)]
    pub locked: bool,
}
