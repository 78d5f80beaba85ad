use orgsync_ldap::dn;
use serde::{Deserialize, Serialize};

/// What a delegation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegateType {
    /// Groups under the scope.
    Group,
    /// Companies, and the users in them, under the scope.
    Company,
    /// Anything under the scope.
    Tree,
}

impl DelegateType {
    pub fn as_str(self) -> &'static str {
        match self {
            DelegateType::Group => "group",
            DelegateType::Company => "company",
            DelegateType::Tree => "tree",
        }
    }
}

/// Who receives a delegation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiverType {
    User,
    /// Every member of the group.
    Group,
    /// Every user of the company.
    Company,
}

impl ReceiverType {
    pub fn as_str(self) -> &'static str {
        match self {
            ReceiverType::User => "user",
            ReceiverType::Group => "group",
            ReceiverType::Company => "company",
        }
    }
}

/// A grant of rights over a DN subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub id: String,

    /// Container id for GROUP/COMPANY delegations, the DN for TREE ones.
    pub name: String,

    /// Normalized scope DN.
    pub dn: String,

    #[serde(rename = "type")]
    pub delegate_type: DelegateType,

    pub receiver: String,
    pub receiver_type: ReceiverType,

    #[serde(default)]
    pub can_write: bool,
    #[serde(default)]
    pub can_admin: bool,

    pub created_at: String,
    pub updated_at: String,
}

impl Delegation {
    /// Whether this grant covers `target_dn` for an entity of kind `target`.
    ///
    /// Existence of the grant gives read access; `require_write` also needs
    /// `can_write` or `can_admin`.
    pub fn grants(&self, target_dn: &str, target: DelegateType, require_write: bool) -> bool {
        (self.delegate_type == target || self.delegate_type == DelegateType::Tree)
            && (!require_write || self.can_write || self.can_admin)
            && dn::equals_or_parent_of(&self.dn, target_dn)
    }

    /// Whether this grant gives administration of `target_dn`.
    pub fn administers(&self, target_dn: &str, target: DelegateType) -> bool {
        self.can_admin && self.grants(target_dn, target, true)
    }
}

/// Input for creating or updating a delegation.
#[derive(Debug, Clone, Deserialize)]
pub struct DelegationEdition {
    /// Container id, or a DN for TREE delegations.
    pub name: String,

    #[serde(rename = "type")]
    pub delegate_type: DelegateType,

    pub receiver: String,
    pub receiver_type: ReceiverType,

    #[serde(default)]
    pub can_write: bool,
    #[serde(default)]
    pub can_admin: bool,
}
