use tracing::info;

use orgsync_core::{ListParams, ListResult};
use orgsync_ldap::Attributes;
use orgsync_ldap::dn::normalize;

use crate::model::{Company, CompanyEdition, ContainerType, ContainerView, DirectoryData};
use crate::service::container::{self, check_delete, check_new, visible};
use crate::service::graph::company_tree;
use crate::service::{DirectoryError, DirectoryService, codes, mirror};

impl DirectoryService {
    pub fn find_company(&self, principal: &str, id: &str) -> Result<Company, DirectoryError> {
        let rights = self.rights(principal)?;
        self.read(|data| visible::<Company>(&rights, data, id).cloned())
    }

    pub fn list_companies(
        &self,
        principal: &str,
        params: &ListParams,
    ) -> Result<ListResult<ContainerView>, DirectoryError> {
        self.list_containers::<Company>(principal, params)
    }

    /// Create a company OU under its parent company, the given scope, or the
    /// companies base.
    pub fn create_company(&self, principal: &str, edition: CompanyEdition) -> Result<Company, DirectoryError> {
        let rights = self.rights(principal)?;
        let name = edition.name.trim().to_string();
        let id = normalize(&name);

        self.write(|data| {
            let parent = match edition.parent.as_deref() {
                Some(parent) => Some(visible::<Company>(&rights, data, parent)?.dn.clone()),
                None => None,
            };
            let parent_dn = self.new_container_base(
                ContainerType::Company,
                edition.scope.as_deref(),
                parent.as_deref(),
                &self.config.companies_dn,
            )?;
            let dn = format!("ou={name},{parent_dn}");
            check_new::<Company>(&rights, data, &id, &dn)?;
            self.create_company_in(data, &dn, &name)
        })
    }

    pub(crate) fn create_company_in(
        &self,
        data: &mut DirectoryData,
        dn: &str,
        name: &str,
    ) -> Result<Company, DirectoryError> {
        self.bind_container(
            dn,
            &Attributes::new()
                .with("objectClass", self.config.company_class.as_str())
                .with("ou", name),
        )?;

        let id = normalize(name);
        data.companies.insert(
            id.clone(),
            Company {
                id: id.clone(),
                name: name.to_string(),
                dn: dn.to_string(),
                locked: false,
                company_tree: Vec::new(),
            },
        );
        let tree = company_tree(&data.companies, dn);
        let company = match data.companies.get_mut(&id) {
            Some(company) => {
                company.company_tree = tree;
                company.clone()
            }
            None => return Err(DirectoryError::Internal(format!("company '{id}' vanished"))),
        };
        mirror::insert_company(self.sql.as_ref(), &company)?;
        info!(id = %company.id, dn, "company created");
        Ok(company)
    }

    /// Delete a company and every company below it. Rejected while any user
    /// belongs to one of them.
    pub fn delete_company(&self, principal: &str, id: &str) -> Result<(), DirectoryError> {
        let rights = self.rights(principal)?;
        self.write(|data| {
            let company = check_delete::<Company>(&rights, data, id)?;
            let not_empty = data.users.values().any(|u| {
                u.company
                    .as_deref()
                    .and_then(|c| data.companies.get(c))
                    .is_some_and(|c| c.company_tree.contains(&company.id))
            });
            if not_empty {
                return Err(DirectoryError::conflict("company", codes::NOT_EMPTY_COMPANY, company.id));
            }
            self.delete_company_in(data, &company)
        })
    }

    pub(crate) fn delete_company_in(&self, data: &mut DirectoryData, company: &Company) -> Result<(), DirectoryError> {
        self.ldap.unbind(&company.dn, true)?;
        let removed = container::subtree::<Company>(data, &company.dn);
        for id in &removed {
            data.companies.remove(id);
            mirror::delete_company(self.sql.as_ref(), id)?;
        }
        info!(id = %company.id, removed = removed.len(), "company deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::fixture::{self, ADMIN, dn_of};
    use orgsync_ldap::DirectoryClient;
    use orgsync_sql::SQLExecutor;

    fn edition(name: &str, parent: Option<&str>) -> CompanyEdition {
        CompanyEdition {
            name: name.into(),
            parent: parent.map(str::to_string),
            scope: None,
        }
    }

    #[test]
    fn test_find_company() {
        let fx = fixture::fixture();
        assert_eq!(fx.svc.find_company("jdoe", "gfi").unwrap().name, "Gfi");
        assert!(matches!(
            fx.svc.find_company("jdoe", "external").unwrap_err(),
            DirectoryError::UnknownId { kind: "company", .. }
        ));
    }

    #[test]
    fn test_create_company() {
        let fx = fixture::fixture();
        let created = fx.svc.create_company(ADMIN, edition("Acme", Some("france"))).unwrap();
        assert_eq!(created.id, "acme");
        assert_eq!(created.dn, dn_of("ou=Acme,ou=france,ou=people"));
        assert_eq!(created.company_tree, vec!["france", "acme"]);
        assert!(fx.ldap.entry(&created.dn).is_some());

        let listed = fx.svc.list_companies(ADMIN, &ListParams::default()).unwrap();
        assert!(listed.items.iter().any(|c| c.id == "acme"));

        let err = fx.svc.create_company(ADMIN, edition("ACME", None)).unwrap_err();
        assert_eq!(err.code(), Some(codes::ALREADY_EXIST));
    }

    #[test]
    fn test_create_company_needs_admin() {
        let fx = fixture::fixture();
        let err = fx.svc.create_company("jdoe", edition("Acme", None)).unwrap_err();
        assert_eq!(err.code(), Some(codes::ALREADY_EXIST));
        assert!(fx.ldap.entry(&dn_of("ou=Acme,ou=people")).is_none());
    }

    #[test]
    fn test_delete_not_empty() {
        let fx = fixture::fixture();
        let err = fx.svc.delete_company(ADMIN, "france").unwrap_err();
        assert_eq!(err.code(), Some(codes::NOT_EMPTY_COMPANY));
        assert!(fx.svc.snapshot().unwrap().companies.contains_key("gfi"));
    }

    #[test]
    fn test_delete_cascade() {
        let fx = fixture::fixture();
        fx.svc.create_company(ADMIN, edition("Acme", None)).unwrap();
        fx.svc.create_company(ADMIN, edition("Acme-East", Some("acme"))).unwrap();
        fx.svc.create_company(ADMIN, edition("Acme-West", Some("acme"))).unwrap();

        fx.svc.delete_company(ADMIN, "acme").unwrap();

        let data = fx.svc.snapshot().unwrap();
        for id in ["acme", "acme-east", "acme-west"] {
            assert!(!data.companies.contains_key(id));
        }
        let rows = fx
            .svc
            .sql
            .query("SELECT id FROM cache_company WHERE id LIKE 'acme%'", &[])
            .unwrap();
        assert!(rows.is_empty());
        assert!(fx.ldap.entry(&dn_of("ou=Acme-East,ou=Acme,ou=people")).is_none());
        assert!(fx.ldap.search(&dn_of("ou=people"), &orgsync_ldap::Filter::eq("ou", "Acme")).unwrap().is_empty());
    }

    #[test]
    fn test_delete_cascade_after_users_left() {
        let fx = fixture::fixture();
        fx.svc
            .write(|data| {
                for uid in ["admin", "jdoe", "alice", "bob", "paul"] {
                    fx.svc.ldap.unbind(&data.users[uid].dn.clone(), false)?;
                    for group in data.users[uid].groups.clone() {
                        if let Some(g) = data.groups.get_mut(&group) {
                            g.members.remove(uid);
                        }
                    }
                    data.users.remove(uid);
                    mirror::delete_user(fx.svc.sql.as_ref(), uid)?;
                }
                Ok(())
            })
            .unwrap();

        fx.svc.delete_company(ADMIN, "france").unwrap();
        let data = fx.svc.snapshot().unwrap();
        for id in ["france", "gfi", "ligoj"] {
            assert!(!data.companies.contains_key(id));
        }
        let left = fx.svc.sql.query("SELECT id FROM cache_company", &[]).unwrap();
        assert_eq!(left.len(), data.companies.len());
    }
}
