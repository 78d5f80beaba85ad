//! Operations shared by companies and groups.

use std::collections::HashMap;

use tracing::warn;

use orgsync_core::{ListParams, ListResult, SortOrder};
use orgsync_ldap::dn::{self, normalize};
use orgsync_ldap::{Attributes, LdapError};

use crate::model::{Container, ContainerType, ContainerView, DelegateType, DirectoryData, closest_scope};
use crate::service::delegation::Rights;
use crate::service::{DirectoryError, DirectoryService, codes, mirror};

pub(crate) fn can_see<T: Container>(rights: &Rights, data: &DirectoryData, container: &T) -> bool {
    match T::TYPE {
        ContainerType::Company => rights.can_see_company(data, container.id()),
        ContainerType::Group => rights.can_read(container.dn(), DelegateType::Group),
    }
}

pub(crate) fn can_write<T: Container>(rights: &Rights, data: &DirectoryData, container: &T) -> bool {
    match T::TYPE {
        ContainerType::Company => rights.can_write_company(data, container.id()),
        ContainerType::Group => rights.can_write(container.dn(), DelegateType::Group),
    }
}

pub(crate) fn can_admin<T: Container>(rights: &Rights, container: &T) -> bool {
    rights.can_admin(container.dn(), T::TYPE.delegate_type())
}

/// Container `id` if the principal can see it; otherwise an unknown id,
/// whether it exists or not.
pub(crate) fn visible<'a, T: Container>(
    rights: &Rights,
    data: &'a DirectoryData,
    id: &str,
) -> Result<&'a T, DirectoryError> {
    T::all(data)
        .get(&normalize(id))
        .filter(|c| can_see(rights, data, *c))
        .ok_or_else(|| DirectoryError::unknown(T::TYPE.as_str(), id))
}

/// Like [`visible`], also requiring write access.
pub(crate) fn writable<'a, T: Container>(
    rights: &Rights,
    data: &'a DirectoryData,
    id: &str,
) -> Result<&'a T, DirectoryError> {
    let container = visible::<T>(rights, data, id)?;
    if !can_write(rights, data, container) {
        warn!(kind = T::TYPE.as_str(), id, "write outside of the principal's scope");
        return Err(DirectoryError::unknown(T::TYPE.as_str(), id));
    }
    Ok(container)
}

/// Checks before creating a container named `id` at `target_dn`.
///
/// A scope the principal cannot administer is reported as an existing
/// container.
pub(crate) fn check_new<T: Container>(
    rights: &Rights,
    data: &DirectoryData,
    id: &str,
    target_dn: &str,
) -> Result<(), DirectoryError> {
    if id.is_empty() {
        return Err(DirectoryError::validation("name", codes::NOT_NULL, id));
    }
    if !rights.can_admin(target_dn, T::TYPE.delegate_type()) {
        warn!(kind = T::TYPE.as_str(), dn = target_dn, "creation outside of the principal's scope");
        return Err(DirectoryError::conflict("name", codes::ALREADY_EXIST, id));
    }
    if T::all(data).contains_key(id) {
        return Err(DirectoryError::conflict("name", codes::ALREADY_EXIST, id));
    }
    Ok(())
}

/// Checks before deleting container `id`; returns a copy of it.
pub(crate) fn check_delete<T: Container>(
    rights: &Rights,
    data: &DirectoryData,
    id: &str,
) -> Result<T, DirectoryError> {
    let container = visible::<T>(rights, data, id)?;
    if !can_admin(rights, container) {
        warn!(kind = T::TYPE.as_str(), id, "deletion outside of the principal's scope");
        return Err(DirectoryError::unknown(T::TYPE.as_str(), id));
    }
    if container.locked() {
        return Err(DirectoryError::conflict("id", codes::LOCKED, container.id()));
    }
    Ok(container.clone())
}

/// Ids of the containers at or below `base_dn`, deepest first.
pub(crate) fn subtree<T: Container>(data: &DirectoryData, base_dn: &str) -> Vec<String> {
    let mut found: Vec<&T> = T::all(data)
        .values()
        .filter(|c| dn::equals_or_parent_of(base_dn, c.dn()))
        .collect();
    found.sort_by_key(|c| std::cmp::Reverse(dn::depth(c.dn())));
    found.into_iter().map(|c| c.id().to_string()).collect()
}

fn by_name<T: Container>(order: SortOrder) -> impl FnMut(&&T, &&T) -> std::cmp::Ordering {
    move |a, b| {
        let ordering = normalize(a.name()).cmp(&normalize(b.name()));
        match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }
}

impl DirectoryService {
    /// Bind a new container entry; an existing entry is a unicity conflict.
    pub(crate) fn bind_container(&self, dn: &str, attributes: &Attributes) -> Result<(), DirectoryError> {
        self.ldap.bind(dn, attributes).map_err(|e| match e {
            LdapError::AlreadyBound(dn) => DirectoryError::conflict("id", codes::INTEGRITY_UNICITY, dn),
            other => DirectoryError::from(other),
        })
    }

    /// One page of the containers visible to `principal`, sorted by name,
    /// with their closest scope and member counts from the relational mirror.
    pub(crate) fn list_containers<T: Container>(
        &self,
        principal: &str,
        params: &ListParams,
    ) -> Result<ListResult<ContainerView>, DirectoryError> {
        let rights = self.rights(principal)?;
        let scopes = self.scopes(T::TYPE)?;
        self.read(|data| {
            let criteria = params.criteria();
            let order = params.sort_by().map(|(_, order)| order).unwrap_or(SortOrder::Asc);
            let mut found: Vec<&T> = T::all(data)
                .values()
                .filter(|c| can_see(&rights, data, *c))
                .filter(|c| {
                    criteria
                        .as_deref()
                        .is_none_or(|q| c.id().contains(q) || normalize(c.name()).contains(q))
                })
                .collect();
            found.sort_by(by_name::<T>(order));

            let counts = mirror::member_counts(self.sql.as_ref(), T::TYPE, None)?;
            let companies = rights.visible_companies(data);
            let visible_counts: HashMap<String, usize> =
                mirror::member_counts(self.sql.as_ref(), T::TYPE, Some(&companies))?;

            let total = found.len();
            let items = found
                .into_iter()
                .skip(params.offset)
                .take(params.limit)
                .map(|c| ContainerView {
                    id: c.id().to_string(),
                    name: c.name().to_string(),
                    container_type: T::TYPE,
                    scope: closest_scope(&scopes, c.dn()).map(|s| s.name.clone()),
                    locked: c.locked(),
                    can_write: can_write(&rights, data, c),
                    can_admin: can_admin(&rights, c),
                    count: counts.get(c.id()).copied().unwrap_or(0),
                    count_visible: visible_counts.get(c.id()).copied().unwrap_or(0),
                })
                .collect();
            Ok(ListResult { items, total })
        })
    }
}
