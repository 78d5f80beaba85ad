//! Container scopes: where new companies and groups go, and which of them
//! are locked.

use tracing::{info, warn};

use orgsync_core::{ListParams, ListResult, SortOrder, new_id, now_rfc3339};
use orgsync_ldap::dn::{self, normalize, normalize_dn};
use orgsync_sql::Value;

use crate::model::{ContainerScope, ContainerScopeEdition, ContainerType, DirectoryData, closest_scope};
use crate::service::{DirectoryError, DirectoryService, codes, mirror};

const TABLE: &str = "container_scopes";

fn scope_indexes(scope: &ContainerScope) -> Vec<(&'static str, Value)> {
    vec![
        ("name", normalize(&scope.name).into()),
        ("dn", normalize_dn(&scope.dn).into()),
        ("type", scope.container_type.as_str().into()),
        ("locked", scope.locked.into()),
        ("created_at", scope.created_at.as_str().into()),
        ("updated_at", scope.updated_at.as_str().into()),
    ]
}

fn check_edition(edition: &ContainerScopeEdition) -> Result<(String, String), DirectoryError> {
    let name = edition.name.trim();
    if name.is_empty() {
        return Err(DirectoryError::validation("name", codes::NOT_NULL, name));
    }
    let scope_dn = edition.dn.trim();
    if !dn::is_valid(scope_dn) {
        return Err(DirectoryError::validation("dn", codes::DISTINGUISHED_NAME, scope_dn));
    }
    Ok((name.to_string(), scope_dn.to_string()))
}

impl DirectoryService {
    /// Scopes of one kind, deepest DN first.
    pub fn scopes(&self, container_type: ContainerType) -> Result<Vec<ContainerScope>, DirectoryError> {
        let mut scopes: Vec<ContainerScope> =
            self.query_records(TABLE, "type = ?1", &[container_type.as_str().into()])?;
        scopes.sort_by_key(|s| std::cmp::Reverse((dn::depth(&s.dn), s.dn.len())));
        Ok(scopes)
    }

    /// Scope named `name` for containers of `container_type`.
    ///
    /// A scope of that name existing only for the other kind is a type
    /// mismatch rather than an unknown id.
    pub fn find_scope(&self, container_type: ContainerType, name: &str) -> Result<ContainerScope, DirectoryError> {
        let found: Vec<ContainerScope> = self.query_records(TABLE, "name = ?1", &[normalize(name).into()])?;
        if let Some(scope) = found.iter().find(|s| s.container_type == container_type) {
            return Ok(scope.clone());
        }
        if found.is_empty() {
            return Err(DirectoryError::unknown("scope", name));
        }
        Err(DirectoryError::validation("type", codes::CONTAINER_TYPE_MATCH, name))
    }

    pub fn list_scopes(
        &self,
        container_type: ContainerType,
        params: &ListParams,
    ) -> Result<ListResult<ContainerScope>, DirectoryError> {
        let criteria = params.criteria();
        let mut found: Vec<ContainerScope> = self
            .scopes(container_type)?
            .into_iter()
            .filter(|s| {
                criteria
                    .as_deref()
                    .is_none_or(|q| normalize(&s.name).contains(q) || normalize_dn(&s.dn).contains(q))
            })
            .collect();

        let (field, order) = params.sort_by().unwrap_or(("name", SortOrder::Asc));
        found.sort_by(|a, b| {
            let ordering = match field {
                "dn" => normalize_dn(&a.dn).cmp(&normalize_dn(&b.dn)),
                "locked" => a.locked.cmp(&b.locked),
                _ => normalize(&a.name).cmp(&normalize(&b.name)),
            };
            match order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let total = found.len();
        let items = found.into_iter().skip(params.offset).take(params.limit).collect();
        Ok(ListResult { items, total })
    }

    /// Needs administration of the scope DN for its kind of container.
    fn check_scope_admin(&self, principal: &str, scope: &ContainerScope) -> Result<(), DirectoryError> {
        if !self
            .rights(principal)?
            .can_admin(&scope.dn, scope.container_type.delegate_type())
        {
            warn!(principal, dn = %scope.dn, "scope change outside of the principal's scope");
            return Err(DirectoryError::Forbidden(scope.dn.clone()));
        }
        Ok(())
    }

    /// Reject a name already used by another scope of the same kind, or a DN
    /// already used by any other scope.
    fn check_scope_unique(&self, scope: &ContainerScope) -> Result<(), DirectoryError> {
        let taken: Vec<ContainerScope> = self.query_records(
            TABLE,
            "id <> ?1 AND ((name = ?2 AND type = ?3) OR dn = ?4)",
            &[
                scope.id.as_str().into(),
                normalize(&scope.name).into(),
                scope.container_type.as_str().into(),
                normalize_dn(&scope.dn).into(),
            ],
        )?;
        match taken.first() {
            Some(other) if normalize_dn(&other.dn) == normalize_dn(&scope.dn) => {
                Err(DirectoryError::conflict("dn", codes::ALREADY_EXIST, scope.dn.as_str()))
            }
            Some(_) => Err(DirectoryError::conflict("name", codes::ALREADY_EXIST, scope.name.as_str())),
            None => Ok(()),
        }
    }

    fn get_scope(&self, id: &str) -> Result<ContainerScope, DirectoryError> {
        self.get_record(TABLE, id)?
            .ok_or_else(|| DirectoryError::unknown("scope", id))
    }

    pub fn create_scope(
        &self,
        principal: &str,
        edition: ContainerScopeEdition,
    ) -> Result<ContainerScope, DirectoryError> {
        let (name, scope_dn) = check_edition(&edition)?;
        let now = now_rfc3339();
        let scope = ContainerScope {
            id: new_id(),
            name,
            dn: scope_dn,
            container_type: edition.container_type,
            locked: edition.locked,
            created_at: now.clone(),
            updated_at: now,
        };
        self.check_scope_admin(principal, &scope)?;
        self.check_scope_unique(&scope)?;
        self.insert_record(TABLE, &scope.id, &scope, &scope_indexes(&scope))?;
        info!(principal, id = %scope.id, name = %scope.name, dn = %scope.dn, "scope created");
        self.write(|data| self.apply_scope_locks(data))?;
        Ok(scope)
    }

    /// Replace a scope. Needs administration of both the stored and the new DN.
    pub fn update_scope(
        &self,
        principal: &str,
        id: &str,
        edition: ContainerScopeEdition,
    ) -> Result<ContainerScope, DirectoryError> {
        let current = self.get_scope(id)?;
        self.check_scope_admin(principal, &current)?;
        let (name, scope_dn) = check_edition(&edition)?;
        let scope = ContainerScope {
            name,
            dn: scope_dn,
            container_type: edition.container_type,
            locked: edition.locked,
            updated_at: now_rfc3339(),
            ..current
        };
        self.check_scope_admin(principal, &scope)?;
        self.check_scope_unique(&scope)?;
        self.update_record(TABLE, id, &scope, &scope_indexes(&scope))?;
        info!(principal, id, name = %scope.name, locked = scope.locked, "scope updated");
        self.write(|data| self.apply_scope_locks(data))?;
        Ok(scope)
    }

    /// Delete an unlocked scope.
    pub fn delete_scope(&self, principal: &str, id: &str) -> Result<(), DirectoryError> {
        let scope = self.get_scope(id)?;
        self.check_scope_admin(principal, &scope)?;
        if scope.locked {
            return Err(DirectoryError::conflict("id", codes::LOCKED, scope.name));
        }
        self.delete_record(TABLE, id)?;
        info!(principal, id, "scope deleted");
        self.write(|data| self.apply_scope_locks(data))
    }

    /// Recompute the lock flag of every container from the scopes, in the
    /// graph and in the mirror.
    pub(crate) fn apply_scope_locks(&self, data: &mut DirectoryData) -> Result<(), DirectoryError> {
        self.lock_containers(data)?;
        mirror::update_locks(self.sql.as_ref(), data)?;
        Ok(())
    }

    /// Graph-only part of [`Self::apply_scope_locks`], also run by the rebuild.
    pub(crate) fn lock_containers(&self, data: &mut DirectoryData) -> Result<(), DirectoryError> {
        let company_scopes = self.scopes(ContainerType::Company)?;
        let group_scopes = self.scopes(ContainerType::Group)?;
        let quarantine = normalize_dn(&self.config.quarantine_dn);
        for company in data.companies.values_mut() {
            company.locked = normalize_dn(&company.dn) == quarantine
                || closest_scope(&company_scopes, &company.dn).is_some_and(|s| s.locked);
        }
        for group in data.groups.values_mut() {
            group.locked = closest_scope(&group_scopes, &group.dn).is_some_and(|s| s.locked);
        }
        Ok(())
    }

    /// Base DN of a new container of kind `container_type`.
    ///
    /// A named scope must be of the right kind and contain `parent_dn` when
    /// one is given. Without a name, the closest scope of the parent or of
    /// `default_base` applies. The container goes under its parent, else
    /// under the scope, else under `default_base`. Locked scopes refuse new
    /// containers.
    pub(crate) fn new_container_base(
        &self,
        container_type: ContainerType,
        scope: Option<&str>,
        parent_dn: Option<&str>,
        default_base: &str,
    ) -> Result<String, DirectoryError> {
        let scope = match scope.map(str::trim).filter(|s| !s.is_empty()) {
            Some(name) => {
                let scope = self.find_scope(container_type, name)?;
                if parent_dn.is_some_and(|parent| !scope.contains(parent)) {
                    return Err(DirectoryError::validation(
                        "parent",
                        codes::CONTAINER_PARENT_TYPE_MATCH,
                        scope.name,
                    ));
                }
                Some(scope)
            }
            None => {
                let scopes = self.scopes(container_type)?;
                closest_scope(&scopes, parent_dn.unwrap_or(default_base)).cloned()
            }
        };
        if let Some(locked) = scope.as_ref().filter(|s| s.locked) {
            return Err(DirectoryError::conflict("type", codes::LOCKED, locked.name.as_str()));
        }
        Ok(match (parent_dn, scope) {
            (Some(parent), _) => parent.to_string(),
            (None, Some(scope)) => scope.dn,
            (None, None) => default_base.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CompanyEdition, GroupEdition};
    use crate::service::fixture::{self, ADMIN, dn_of};
    use orgsync_ldap::DirectoryClient;
    use orgsync_sql::SQLExecutor;

    fn edition(name: &str, rdns: &str, container_type: ContainerType, locked: bool) -> ContainerScopeEdition {
        ContainerScopeEdition {
            name: name.into(),
            dn: dn_of(rdns),
            container_type,
            locked,
        }
    }

    fn group(name: &str, scope: Option<&str>, parent: Option<&str>) -> GroupEdition {
        GroupEdition {
            name: name.into(),
            scope: scope.map(str::to_string),
            parent: parent.map(str::to_string),
            departments: Vec::new(),
        }
    }

    #[test]
    fn test_scope_crud() {
        let fx = fixture::fixture();
        let created = fx
            .svc
            .create_scope(ADMIN, edition("Project", "ou=project,ou=groups", ContainerType::Group, false))
            .unwrap();
        assert_eq!(fx.svc.find_scope(ContainerType::Group, "PROJECT").unwrap().id, created.id);

        let err = fx
            .svc
            .create_scope(ADMIN, edition("project", "ou=other,ou=groups", ContainerType::Group, false))
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::ALREADY_EXIST));
        let err = fx
            .svc
            .create_scope(ADMIN, edition("Other", "ou=PROJECT,ou=groups", ContainerType::Group, false))
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::ALREADY_EXIST));

        let listed = fx.svc.list_scopes(ContainerType::Group, &ListParams::default()).unwrap();
        let names: Vec<&str> = listed.items.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Department", "Project", "Root"]);
        assert_eq!(listed.items[1].id, created.id);
        assert!(fx.svc.list_scopes(ContainerType::Company, &ListParams::default()).unwrap().total > 0);

        let updated = fx
            .svc
            .update_scope(ADMIN, &created.id, edition("Projects", "ou=project,ou=groups", ContainerType::Group, true))
            .unwrap();
        assert_eq!(updated.created_at, created.created_at);
        let err = fx.svc.delete_scope(ADMIN, &created.id).unwrap_err();
        assert_eq!(err.code(), Some(codes::LOCKED));

        fx.svc
            .update_scope(ADMIN, &created.id, edition("Projects", "ou=project,ou=groups", ContainerType::Group, false))
            .unwrap();
        fx.svc.delete_scope(ADMIN, &created.id).unwrap();
        assert!(matches!(
            fx.svc.find_scope(ContainerType::Group, "projects").unwrap_err(),
            DirectoryError::UnknownId { kind: "scope", .. }
        ));
    }

    #[test]
    fn test_scope_needs_admin() {
        let fx = fixture::fixture();
        let err = fx
            .svc
            .create_scope("jdoe", edition("Project", "ou=project,ou=groups", ContainerType::Group, false))
            .unwrap_err();
        assert!(matches!(err, DirectoryError::Forbidden(_)));
        let err = fx
            .svc
            .create_scope(ADMIN, edition("Broken", "not a dn", ContainerType::Group, false))
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::DISTINGUISHED_NAME));
    }

    fn lock_department(fx: &fixture::Fixture, locked: bool) {
        let department = fx.svc.find_scope(ContainerType::Group, "department").unwrap();
        fx.svc
            .update_scope(ADMIN, &department.id, edition("Department", "cn=dig,ou=groups", ContainerType::Group, locked))
            .unwrap();
    }

    fn locked_row(fx: &fixture::Fixture, id: &str) -> Option<bool> {
        let rows = fx
            .svc
            .sql
            .query("SELECT locked FROM cache_group WHERE id = ?1", &[id.into()])
            .unwrap();
        rows[0].get_bool("locked")
    }

    #[test]
    fn test_locked_scope_locks_containers() {
        let fx = fixture::fixture();
        lock_department(&fx, true);
        let data = fx.svc.snapshot().unwrap();
        assert!(data.groups["dig"].locked);
        assert!(data.groups["dig-rha"].locked);
        assert!(!data.groups["dev"].locked);
        assert!(data.companies["quarantine"].locked);
        assert!(!data.companies["gfi"].locked);
        assert_eq!(locked_row(&fx, "dig-rha"), Some(true));

        let err = fx.svc.delete_group(ADMIN, "dig-rha").unwrap_err();
        assert_eq!(err.code(), Some(codes::LOCKED));
        let err = fx.svc.create_group(ADMIN, group("DIG-AS", None, Some("dig"))).unwrap_err();
        assert_eq!(err.code(), Some(codes::LOCKED));
        assert!(fx.ldap.entry(&dn_of("cn=DIG-AS,cn=dig,ou=groups")).is_none());
        let err = fx.svc.create_group(ADMIN, group("DIG-AS", Some("Department"), None)).unwrap_err();
        assert_eq!(err.code(), Some(codes::LOCKED));
        fx.svc.create_group(ADMIN, group("Ops", None, None)).unwrap();

        let listed = fx.svc.list_groups(ADMIN, &ListParams::default()).unwrap();
        let dig = listed.items.iter().find(|g| g.id == "dig").unwrap();
        assert_eq!(dig.scope.as_deref(), Some("Department"));
        assert!(dig.locked);

        lock_department(&fx, false);
        assert!(!fx.svc.snapshot().unwrap().groups["dig-rha"].locked);
        assert_eq!(locked_row(&fx, "dig-rha"), Some(false));
        fx.svc.delete_group(ADMIN, "dig-rha").unwrap();
    }

    #[test]
    fn test_locks_survive_rebuild() {
        let fx = fixture::fixture();
        lock_department(&fx, true);
        let data = fx.svc.refresh().unwrap();
        assert!(data.groups["dig"].locked);
        assert!(!data.groups["sales"].locked);
        assert_eq!(locked_row(&fx, "dig"), Some(true));
    }

    #[test]
    fn test_locked_company_scope() {
        let fx = fixture::fixture();
        let france = fx.svc.find_scope(ContainerType::Company, "france").unwrap();
        fx.svc
            .update_scope(ADMIN, &france.id, edition("France", "ou=france,ou=people", ContainerType::Company, true))
            .unwrap();
        assert!(fx.svc.snapshot().unwrap().companies["ligoj"].locked);
        let err = fx
            .svc
            .create_company(
                ADMIN,
                CompanyEdition {
                    name: "Acme".into(),
                    parent: Some("gfi".into()),
                    scope: None,
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::LOCKED));
    }

    #[test]
    fn test_create_in_named_scope() {
        let fx = fixture::fixture();
        fx.svc
            .create_scope(ADMIN, edition("Project", "ou=project,ou=groups", ContainerType::Group, false))
            .unwrap();
        fx.ldap
            .bind(
                &dn_of("ou=project,ou=groups"),
                &orgsync_ldap::Attributes::new()
                    .with("objectClass", "organizationalUnit")
                    .with("ou", "project"),
            )
            .unwrap();

        let created = fx.svc.create_group(ADMIN, group("P1", Some("project"), None)).unwrap();
        assert_eq!(created.dn, dn_of("cn=P1,ou=project,ou=groups"));

        let nested = fx.svc.create_group(ADMIN, group("P1-A", Some("Project"), Some("p1"))).unwrap();
        assert_eq!(nested.dn, dn_of("cn=P1-A,cn=P1,ou=project,ou=groups"));

        let err = fx.svc.create_group(ADMIN, group("P2", Some("project"), Some("dev"))).unwrap_err();
        assert_eq!(err.code(), Some(codes::CONTAINER_PARENT_TYPE_MATCH));

        let err = fx.svc.create_group(ADMIN, group("P3", Some("France"), None)).unwrap_err();
        assert_eq!(err.code(), Some(codes::CONTAINER_TYPE_MATCH));

        let err = fx.svc.create_group(ADMIN, group("P4", Some("nowhere"), None)).unwrap_err();
        assert!(matches!(err, DirectoryError::UnknownId { kind: "scope", .. }));
    }

    #[test]
    fn test_company_in_named_scope() {
        let fx = fixture::fixture();
        let created = fx
            .svc
            .create_company(
                ADMIN,
                CompanyEdition {
                    name: "Acme".into(),
                    parent: None,
                    scope: Some("france".into()),
                },
            )
            .unwrap();
        assert_eq!(created.dn, dn_of("ou=Acme,ou=france,ou=people"));
        assert_eq!(created.company_tree, vec!["france", "acme"]);

        let err = fx
            .svc
            .create_company(
                ADMIN,
                CompanyEdition {
                    name: "Ext".into(),
                    parent: Some("external".into()),
                    scope: Some("France".into()),
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::CONTAINER_PARENT_TYPE_MATCH));
    }
}
