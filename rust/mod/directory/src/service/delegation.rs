//! Delegation resolution and management.

use tracing::{info, warn};

use orgsync_core::{ListParams, ListResult, new_id, now_rfc3339};
use orgsync_ldap::dn::{self, normalize, normalize_dn};
use orgsync_sql::{SQLStore, Value};

use crate::model::{
    Company, DelegateType, Delegation, DelegationEdition, DirectoryData, Group, ReceiverType, User,
};
use crate::service::{DirectoryError, DirectoryService, codes, query_records_in};

/// Delegations received by `principal`: directly, through one of its groups,
/// or through its company or one of the companies containing it.
pub fn delegates_of(
    sql: &dyn SQLStore,
    data: &DirectoryData,
    principal: &str,
) -> Result<Vec<Delegation>, DirectoryError> {
    let principal = normalize(principal);
    let user = data.users.get(&principal);
    let groups: Vec<String> = user.map(|u| u.groups.iter().cloned().collect()).unwrap_or_default();
    let companies: Vec<String> = user
        .and_then(|u| u.company.as_deref())
        .and_then(|c| data.companies.get(c))
        .map(|c| c.company_tree.clone())
        .unwrap_or_default();

    let mut params: Vec<Value> = vec![ReceiverType::User.as_str().into(), principal.into()];
    let mut clauses = vec!["(receiver_type = ?1 AND receiver = ?2)".to_string()];
    for (receiver_type, ids) in [(ReceiverType::Group, &groups), (ReceiverType::Company, &companies)] {
        if ids.is_empty() {
            continue;
        }
        let type_index = params.len() + 1;
        params.push(receiver_type.as_str().into());
        let first = params.len() + 1;
        params.extend(ids.iter().map(|id| Value::from(id.as_str())));
        let list = (first..first + ids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        clauses.push(format!("(receiver_type = ?{type_index} AND receiver IN ({list}))"));
    }
    query_records_in(sql, "delegates", &clauses.join(" OR "), &params)
}

/// Effective rights of one principal.
#[derive(Debug, Clone, Default)]
pub struct Rights {
    delegates: Vec<Delegation>,
    own_company: Option<String>,
}

impl Rights {
    pub fn new(delegates: Vec<Delegation>, own_company: Option<String>) -> Self {
        Self {
            delegates,
            own_company,
        }
    }

    pub fn delegates(&self) -> &[Delegation] {
        &self.delegates
    }

    /// Any grant covering `target_dn` for `target`.
    pub fn grants(&self, target_dn: &str, target: DelegateType, require_write: bool) -> bool {
        self.delegates
            .iter()
            .any(|d| d.grants(target_dn, target, require_write))
    }

    pub fn can_read(&self, target_dn: &str, target: DelegateType) -> bool {
        self.grants(target_dn, target, false)
    }

    pub fn can_write(&self, target_dn: &str, target: DelegateType) -> bool {
        self.grants(target_dn, target, true)
    }

    pub fn can_admin(&self, target_dn: &str, target: DelegateType) -> bool {
        self.delegates.iter().any(|d| d.administers(target_dn, target))
    }

    fn company_grant(&self, data: &DirectoryData, company: &Company, require_write: bool) -> bool {
        let tree = company.company_tree.iter().filter_map(|id| data.companies.get(id));
        std::iter::once(company)
            .chain(tree)
            .any(|c| self.grants(&c.dn, DelegateType::Company, require_write))
    }

    /// Read access on a company, through any company of its tree. The
    /// principal's own company is always readable.
    pub fn can_see_company(&self, data: &DirectoryData, id: &str) -> bool {
        if self.own_company.as_deref() == Some(id) {
            return true;
        }
        data.companies
            .get(id)
            .is_some_and(|c| self.company_grant(data, c, false))
    }

    pub fn can_write_company(&self, data: &DirectoryData, id: &str) -> bool {
        data.companies
            .get(id)
            .is_some_and(|c| self.company_grant(data, c, true))
    }

    /// Users are seen through their company.
    pub fn can_see_user(&self, data: &DirectoryData, user: &User) -> bool {
        user.company
            .as_deref()
            .is_some_and(|c| self.can_see_company(data, c))
    }

    pub fn can_write_user(&self, data: &DirectoryData, user: &User) -> bool {
        user.company
            .as_deref()
            .is_some_and(|c| self.can_write_company(data, c))
    }

    pub fn can_see_group(&self, group: &Group) -> bool {
        self.can_read(&group.dn, DelegateType::Group)
    }

    pub fn can_write_group(&self, group: &Group) -> bool {
        self.can_write(&group.dn, DelegateType::Group)
    }

    /// Ids of the companies the principal can see, sorted.
    pub fn visible_companies(&self, data: &DirectoryData) -> Vec<String> {
        data.companies
            .keys()
            .filter(|id| self.can_see_company(data, id))
            .cloned()
            .collect()
    }

    /// Ids of the groups the principal can see, sorted.
    pub fn visible_groups(&self, data: &DirectoryData) -> Vec<String> {
        data.groups
            .values()
            .filter(|g| self.can_see_group(g))
            .map(|g| g.id.clone())
            .collect()
    }

    /// Whether the receiver of a delegation exists and is visible.
    fn can_see_receiver(&self, data: &DirectoryData, receiver: &str, receiver_type: ReceiverType) -> bool {
        match receiver_type {
            ReceiverType::User => data
                .users
                .get(receiver)
                .is_some_and(|u| self.can_see_user(data, u)),
            ReceiverType::Group => data.groups.get(receiver).is_some_and(|g| self.can_see_group(g)),
            ReceiverType::Company => self.can_see_company(data, receiver),
        }
    }
}

fn rights_in(sql: &dyn SQLStore, data: &DirectoryData, principal: &str) -> Result<Rights, DirectoryError> {
    let delegates = delegates_of(sql, data, principal)?;
    let own_company = data
        .users
        .get(&normalize(principal))
        .and_then(|u| u.company.clone());
    Ok(Rights::new(delegates, own_company))
}

impl DirectoryService {
    /// Rights of `principal` against the current graph.
    pub fn rights(&self, principal: &str) -> Result<Rights, DirectoryError> {
        self.read(|data| rights_in(self.sql.as_ref(), data, principal))
    }

    /// Whether `principal` holds a grant on `target_dn` for `target_type`.
    ///
    /// Company checks also succeed through any company containing the target.
    pub fn is_granted(
        &self,
        principal: &str,
        target_dn: &str,
        target_type: DelegateType,
        require_write: bool,
    ) -> Result<bool, DirectoryError> {
        self.read(|data| {
            let rights = rights_in(self.sql.as_ref(), data, principal)?;
            if rights.grants(target_dn, target_type, require_write) {
                return Ok(true);
            }
            if target_type != DelegateType::Company {
                return Ok(false);
            }
            let target = normalize_dn(target_dn);
            Ok(data
                .companies
                .values()
                .find(|c| normalize_dn(&c.dn) == target)
                .is_some_and(|c| rights.company_grant(data, c, require_write)))
        })
    }

    /// Normalized scope DN of a delegation.
    fn scope_dn(&self, edition: &DelegationEdition) -> Result<String, DirectoryError> {
        let name = edition.name.trim();
        match edition.delegate_type {
            DelegateType::Tree => {
                if !dn::is_valid(name) {
                    return Err(DirectoryError::validation("name", codes::DISTINGUISHED_NAME, name));
                }
                Ok(normalize_dn(name))
            }
            DelegateType::Group => self.read(|data| {
                data.groups
                    .get(&normalize(name))
                    .map(|g| normalize_dn(&g.dn))
                    .ok_or_else(|| DirectoryError::unknown("group", name))
            }),
            DelegateType::Company => self.read(|data| {
                data.companies
                    .get(&normalize(name))
                    .map(|c| normalize_dn(&c.dn))
                    .ok_or_else(|| DirectoryError::unknown("company", name))
            }),
        }
    }

    fn to_delegation(
        &self,
        id: String,
        edition: &DelegationEdition,
        created_at: String,
    ) -> Result<Delegation, DirectoryError> {
        let dn = self.scope_dn(edition)?;
        let name = match edition.delegate_type {
            DelegateType::Tree => dn.clone(),
            _ => normalize(&edition.name),
        };
        Ok(Delegation {
            id,
            name,
            dn,
            delegate_type: edition.delegate_type,
            receiver: normalize(&edition.receiver),
            receiver_type: edition.receiver_type,
            can_write: edition.can_write,
            can_admin: edition.can_admin,
            created_at,
            updated_at: now_rfc3339(),
        })
    }

    fn delegate_indexes(d: &Delegation) -> Vec<(&'static str, Value)> {
        vec![
            ("name", d.name.as_str().into()),
            ("dn", d.dn.as_str().into()),
            ("type", d.delegate_type.as_str().into()),
            ("receiver", d.receiver.as_str().into()),
            ("receiver_type", d.receiver_type.as_str().into()),
            ("can_write", d.can_write.into()),
            ("can_admin", d.can_admin.into()),
            ("created_at", d.created_at.as_str().into()),
            ("updated_at", d.updated_at.as_str().into()),
        ]
    }

    /// Check the principal may hand out `delegation`.
    fn check_delegation(&self, principal: &str, delegation: &Delegation) -> Result<(), DirectoryError> {
        self.read(|data| {
            let rights = rights_in(self.sql.as_ref(), data, principal)?;
            if !rights.can_see_receiver(data, &delegation.receiver, delegation.receiver_type) {
                return Err(DirectoryError::unknown(
                    delegation.receiver_type.as_str(),
                    delegation.receiver.as_str(),
                ));
            }
            if !rights.can_admin(&delegation.dn, delegation.delegate_type) {
                warn!(principal, dn = %delegation.dn, "delegation outside of the principal's scope");
                return Err(DirectoryError::Forbidden(delegation.dn.clone()));
            }
            Ok(())
        })
    }

    fn get_delegate(&self, id: &str) -> Result<Delegation, DirectoryError> {
        self.get_record("delegates", id)?
            .ok_or_else(|| DirectoryError::unknown("delegate", id))
    }

    /// Create a delegation. The principal needs an admin grant on its scope.
    pub fn create_delegate(
        &self,
        principal: &str,
        edition: DelegationEdition,
    ) -> Result<Delegation, DirectoryError> {
        let delegation = self.to_delegation(new_id(), &edition, now_rfc3339())?;
        self.check_delegation(principal, &delegation)?;
        self.insert_record("delegates", &delegation.id, &delegation, &Self::delegate_indexes(&delegation))?;
        info!(principal, id = %delegation.id, dn = %delegation.dn, receiver = %delegation.receiver, "delegation created");
        Ok(delegation)
    }

    /// Store a delegation without checking any principal.
    pub fn seed_delegate(&self, edition: DelegationEdition) -> Result<Delegation, DirectoryError> {
        let delegation = self.to_delegation(new_id(), &edition, now_rfc3339())?;
        self.insert_record("delegates", &delegation.id, &delegation, &Self::delegate_indexes(&delegation))?;
        Ok(delegation)
    }

    /// Replace a delegation. Needs admin on both the stored and the new scope.
    pub fn update_delegate(
        &self,
        principal: &str,
        id: &str,
        edition: DelegationEdition,
    ) -> Result<Delegation, DirectoryError> {
        let current = self.get_delegate(id)?;
        if !self.rights(principal)?.can_admin(&current.dn, current.delegate_type) {
            warn!(principal, id, "delegation update outside of the principal's scope");
            return Err(DirectoryError::Forbidden(current.dn));
        }
        let delegation = self.to_delegation(current.id, &edition, current.created_at)?;
        self.check_delegation(principal, &delegation)?;
        self.update_record("delegates", id, &delegation, &Self::delegate_indexes(&delegation))?;
        info!(principal, id, dn = %delegation.dn, "delegation updated");
        Ok(delegation)
    }

    pub fn delete_delegate(&self, principal: &str, id: &str) -> Result<(), DirectoryError> {
        let current = self.get_delegate(id)?;
        if !self.rights(principal)?.can_admin(&current.dn, current.delegate_type) {
            warn!(principal, id, "delegation removal outside of the principal's scope");
            return Err(DirectoryError::Forbidden(current.dn));
        }
        self.delete_record("delegates", id)?;
        info!(principal, id, "delegation deleted");
        Ok(())
    }

    /// Delegations the principal received or can read the scope of.
    pub fn list_delegates(
        &self,
        principal: &str,
        params: &ListParams,
    ) -> Result<ListResult<Delegation>, DirectoryError> {
        let rights = self.rights(principal)?;
        let received: Vec<String> = rights.delegates().iter().map(|d| d.id.clone()).collect();
        let criteria = params.criteria();

        let all: Vec<Delegation> = self.query_records("delegates", "", &[])?;
        let visible: Vec<Delegation> = all
            .into_iter()
            .filter(|d| received.contains(&d.id) || rights.can_read(&d.dn, d.delegate_type))
            .filter(|d| {
                criteria
                    .as_deref()
                    .is_none_or(|q| d.name.contains(q) || d.receiver.contains(q))
            })
            .collect();

        let total = visible.len();
        let items = visible
            .into_iter()
            .skip(params.offset)
            .take(params.limit)
            .collect();
        Ok(ListResult { items, total })
    }
}
