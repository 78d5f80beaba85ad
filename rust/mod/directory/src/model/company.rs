use serde::{Deserialize, Serialize};

/// An organizational unit users belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    /// Normalized OU name.
    pub id: String,

    /// OU name as stored in the directory.
    pub name: String,

    pub dn: String,

    /// Locked companies cannot be deleted. The quarantine company is always
    /// locked, the others follow their closest scope.
    #[serde(default)]
    pub locked: bool,

    /// Ids of every known company whose DN contains this one, root first,
    /// ending with this company.
    #[serde(default)]
    pub company_tree: Vec<String>,
}

/// Input for creating a company.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompanyEdition {
    pub name: String,

    /// Parent company id. Must sit inside `scope` when both are given.
    #[serde(default)]
    pub parent: Option<String>,

    /// Name of the company scope the OU is created in. Without it, the OU
    /// goes under the parent or the companies base.
    #[serde(default, rename = "type")]
    pub scope: Option<String>,
}
