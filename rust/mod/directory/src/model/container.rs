use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Company, DelegateType, DirectoryData, Group};

/// Kind of container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerType {
    Company,
    Group,
}

impl ContainerType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerType::Company => "company",
            ContainerType::Group => "group",
        }
    }

    /// Delegation type matching this kind of container.
    pub fn delegate_type(self) -> DelegateType {
        match self {
            ContainerType::Company => DelegateType::Company,
            ContainerType::Group => DelegateType::Group,
        }
    }
}

/// Capabilities shared by companies and groups.
pub trait Container: Clone {
    const TYPE: ContainerType;

    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn dn(&self) -> &str;
    fn locked(&self) -> bool;

    /// Every container of this kind in the graph.
    fn all(data: &DirectoryData) -> &BTreeMap<String, Self>;
}

impl Container for Company {
    const TYPE: ContainerType = ContainerType::Company;

    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn dn(&self) -> &str {
        &self.dn
    }
    fn locked(&self) -> bool {
        self.locked
    }
    fn all(data: &DirectoryData) -> &BTreeMap<String, Self> {
        &data.companies
    }
}

impl Container for Group {
    const TYPE: ContainerType = ContainerType::Group;

    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn dn(&self) -> &str {
        &self.dn
    }
    fn locked(&self) -> bool {
        self.locked
    }
    fn all(data: &DirectoryData) -> &BTreeMap<String, Self> {
        &data.groups
    }
}

/// A container as seen by a principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerView {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub container_type: ContainerType,
    /// Name of the closest scope, if any.
    pub scope: Option<String>,
    /// Locked by itself or by its scope.
    pub locked: bool,
    pub can_write: bool,
    pub can_admin: bool,
    /// Members, from the relational mirror.
    pub count: usize,
    /// Members the principal can see.
    pub count_visible: usize,
}
