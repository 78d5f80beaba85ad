use tracing::info;

use orgsync_core::{ListParams, ListResult};
use orgsync_ldap::dn::{normalize, normalize_dn};
use orgsync_ldap::{Attributes, Filter, LdapError, Modification};

use crate::model::{ContainerType, ContainerView, DirectoryData, Group, GroupEdition};
use crate::service::container::{check_delete, check_new, subtree, visible, writable};
use crate::service::graph::{DEPARTMENT_ATTRIBUTE, DUMMY_MEMBER};
use crate::service::{DirectoryError, DirectoryService, codes, mirror};

fn group_dn(data: &DirectoryData, id: &str) -> Result<String, DirectoryError> {
    data.groups
        .get(id)
        .map(|g| g.dn.clone())
        .ok_or_else(|| DirectoryError::unknown("group", id))
}

fn user_dn(data: &DirectoryData, id: &str) -> Result<String, DirectoryError> {
    data.users
        .get(id)
        .map(|u| u.dn.clone())
        .ok_or_else(|| DirectoryError::unknown("user", id))
}

impl DirectoryService {
    /// Apply one membership change to a group entry.
    ///
    /// A value already present, or already missing, is success. A schema
    /// violation means the group would lose its last member.
    fn modify_members(&self, group: &str, group_dn: &str, modification: Modification) -> Result<(), DirectoryError> {
        match self.ldap.modify(group_dn, &[modification]) {
            Ok(()) => Ok(()),
            Err(LdapError::AlreadyPresent { value, .. }) => {
                info!(group, value = %value, "member already present");
                Ok(())
            }
            Err(LdapError::NoSuchAttribute { value, .. }) => {
                info!(group, value = %value, "member already missing");
                Ok(())
            }
            Err(LdapError::SchemaViolation { .. }) => {
                Err(DirectoryError::conflict("groups", codes::LAST_MEMBER_OF_GROUP, group))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn add_user_to_group_in(
        &self,
        data: &mut DirectoryData,
        user: &str,
        group: &str,
    ) -> Result<(), DirectoryError> {
        let member = user_dn(data, user)?;
        let dn = group_dn(data, group)?;
        self.modify_members(group, &dn, Modification::add(&self.config.member_attribute, member))?;

        if let Some(u) = data.users.get_mut(user) {
            u.groups.insert(group.to_string());
        }
        if let Some(g) = data.groups.get_mut(group) {
            g.members.insert(user.to_string());
        }
        mirror::add_user_to_group(self.sql.as_ref(), user, group)?;
        Ok(())
    }

    pub(crate) fn remove_user_from_group_in(
        &self,
        data: &mut DirectoryData,
        user: &str,
        group: &str,
    ) -> Result<(), DirectoryError> {
        let member = user_dn(data, user)?;
        let dn = group_dn(data, group)?;
        self.modify_members(group, &dn, Modification::remove(&self.config.member_attribute, member))?;

        if let Some(u) = data.users.get_mut(user) {
            u.groups.remove(group);
        }
        if let Some(g) = data.groups.get_mut(group) {
            g.members.remove(user);
        }
        mirror::remove_user_from_group(self.sql.as_ref(), user, group)?;
        Ok(())
    }

    pub(crate) fn add_group_to_group_in(
        &self,
        data: &mut DirectoryData,
        sub: &str,
        group: &str,
    ) -> Result<(), DirectoryError> {
        let member = group_dn(data, sub)?;
        let dn = group_dn(data, group)?;
        self.modify_members(group, &dn, Modification::add(&self.config.member_attribute, member))?;

        if let Some(s) = data.groups.get_mut(sub) {
            s.groups.insert(group.to_string());
        }
        if let Some(g) = data.groups.get_mut(group) {
            g.sub_groups.insert(sub.to_string());
        }
        mirror::add_group_to_group(self.sql.as_ref(), sub, group)?;
        Ok(())
    }

    pub(crate) fn remove_group_from_group_in(
        &self,
        data: &mut DirectoryData,
        sub: &str,
        group: &str,
    ) -> Result<(), DirectoryError> {
        let member = group_dn(data, sub)?;
        let dn = group_dn(data, group)?;
        self.modify_members(group, &dn, Modification::remove(&self.config.member_attribute, member))?;

        if let Some(s) = data.groups.get_mut(sub) {
            s.groups.remove(group);
        }
        if let Some(g) = data.groups.get_mut(group) {
            g.sub_groups.remove(sub);
        }
        mirror::remove_group_from_group(self.sql.as_ref(), sub, group)?;
        Ok(())
    }

    /// Replace a member value after the member entry moved.
    pub(crate) fn update_member_dn(
        &self,
        group: &str,
        group_dn: &str,
        old_dn: &str,
        new_dn: &str,
    ) -> Result<(), DirectoryError> {
        let attribute = &self.config.member_attribute;
        match self.ldap.modify(
            group_dn,
            &[Modification::remove(attribute, old_dn), Modification::add(attribute, new_dn)],
        ) {
            Ok(()) => Ok(()),
            Err(LdapError::NoSuchAttribute { .. }) => {
                info!(group, old_dn, "stale member value already gone");
                self.modify_members(group, group_dn, Modification::add(attribute, new_dn))
            }
            Err(LdapError::AlreadyPresent { .. }) => {
                self.modify_members(group, group_dn, Modification::remove(attribute, old_dn))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every user member; nested groups stay.
    pub(crate) fn empty_group_in(&self, data: &mut DirectoryData, id: &str) -> Result<(), DirectoryError> {
        let group = data
            .groups
            .get(id)
            .cloned()
            .ok_or_else(|| DirectoryError::unknown("group", id))?;

        let mut values = vec![DUMMY_MEMBER.to_string()];
        values.extend(
            group
                .sub_groups
                .iter()
                .filter_map(|sub| data.groups.get(sub))
                .map(|sub| sub.dn.clone()),
        );
        self.ldap
            .modify(&group.dn, &[Modification::replace(&self.config.member_attribute, values)])?;

        for user in &group.members {
            if let Some(u) = data.users.get_mut(user) {
                u.groups.remove(id);
            }
        }
        if let Some(g) = data.groups.get_mut(id) {
            g.members.clear();
        }
        mirror::empty_group(self.sql.as_ref(), id)?;
        info!(group = id, removed = group.members.len(), "group emptied");
        Ok(())
    }

    /// Delete a group and every group below its DN, unlinking them from
    /// the groups and users that reference them.
    pub(crate) fn delete_group_in(&self, data: &mut DirectoryData, id: &str) -> Result<(), DirectoryError> {
        let root = group_dn(data, id)?;
        let doomed = subtree::<Group>(data, &root);

        // Parents outside the deleted subtree still hold a member value.
        let mut external = Vec::new();
        for d in &doomed {
            let Some(group) = data.groups.get(d) else {
                continue;
            };
            for parent in group.groups.iter().filter(|p| !doomed.contains(p)) {
                external.push((parent.clone(), group_dn(data, parent)?, group.dn.clone()));
            }
        }
        let attribute = &self.config.member_attribute;
        for (parent, parent_dn, member) in external {
            match self.ldap.modify(&parent_dn, &[Modification::remove(attribute, member.as_str())]) {
                Ok(()) => {}
                Err(LdapError::NoSuchAttribute { .. }) => {
                    info!(group = %parent, value = %member, "member already missing");
                }
                Err(LdapError::SchemaViolation { .. }) => {
                    // Last member value of the parent: the placeholder takes its place.
                    self.ldap.modify(
                        &parent_dn,
                        &[
                            Modification::remove(attribute, member.as_str()),
                            Modification::add(attribute, DUMMY_MEMBER),
                        ],
                    )?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.ldap.unbind(&root, true)?;
        for d in &doomed {
            self.unlink_group(data, d)?;
        }
        info!(group = id, removed = doomed.len(), "group deleted");
        Ok(())
    }

    fn unlink_group(&self, data: &mut DirectoryData, id: &str) -> Result<(), DirectoryError> {
        let Some(group) = data.groups.remove(id) else {
            return Ok(());
        };
        for parent in &group.groups {
            if let Some(p) = data.groups.get_mut(parent) {
                p.sub_groups.remove(id);
            }
        }
        for sub in &group.sub_groups {
            if let Some(s) = data.groups.get_mut(sub) {
                s.groups.remove(id);
            }
        }
        for user in &group.members {
            if let Some(u) = data.users.get_mut(user) {
                u.groups.remove(id);
            }
        }
        mirror::delete_group(self.sql.as_ref(), id)?;
        Ok(())
    }

    /// Bind a group entry holding only the placeholder member.
    pub(crate) fn create_group_in(
        &self,
        data: &mut DirectoryData,
        dn: &str,
        name: &str,
        departments: &[String],
    ) -> Result<Group, DirectoryError> {
        self.bind_container(
            dn,
            &Attributes::new()
                .with("objectClass", self.config.group_class.as_str())
                .with("cn", name)
                .with(&self.config.member_attribute, DUMMY_MEMBER)
                .with_all(DEPARTMENT_ATTRIBUTE, departments.iter().cloned()),
        )?;

        let group = Group {
            id: normalize(name),
            name: name.to_string(),
            dn: dn.to_string(),
            locked: false,
            members: Default::default(),
            sub_groups: Default::default(),
            groups: Default::default(),
        };
        data.groups.insert(group.id.clone(), group.clone());
        mirror::insert_group(self.sql.as_ref(), &group)?;
        info!(id = %group.id, dn, "group created");
        Ok(group)
    }

    /// Id of the group linked to `department`, from the directory.
    pub(crate) fn group_by_department(
        &self,
        data: &DirectoryData,
        department: &str,
    ) -> Result<Option<String>, DirectoryError> {
        let filter = Filter::eq("objectClass", self.config.group_class.as_str())
            .and(Filter::eq(DEPARTMENT_ATTRIBUTE, department));
        let found = self.ldap.search(&self.config.groups_dn, &filter)?;
        let Some(entry) = found.first() else {
            return Ok(None);
        };
        let target = normalize_dn(&entry.dn);
        Ok(data
            .groups
            .values()
            .find(|g| normalize_dn(&g.dn) == target)
            .map(|g| g.id.clone()))
    }

    pub fn find_group_by_department(&self, department: &str) -> Result<Option<Group>, DirectoryError> {
        self.read(|data| {
            let id = self.group_by_department(data, department)?;
            Ok(id.and_then(|id| data.groups.get(&id).cloned()))
        })
    }

    pub fn find_group(&self, principal: &str, id: &str) -> Result<Group, DirectoryError> {
        let rights = self.rights(principal)?;
        self.read(|data| visible::<Group>(&rights, data, id).cloned())
    }

    pub fn list_groups(
        &self,
        principal: &str,
        params: &ListParams,
    ) -> Result<ListResult<ContainerView>, DirectoryError> {
        self.list_containers::<Group>(principal, params)
    }

    /// Create a group under its parent group, the given scope, or the groups
    /// base. A parent group also gets the new group as a member. Locked
    /// scopes refuse new groups.
    pub fn create_group(&self, principal: &str, edition: GroupEdition) -> Result<Group, DirectoryError> {
        let rights = self.rights(principal)?;
        let name = edition.name.trim().to_string();
        let id = normalize(&name);
        let departments: Vec<String> = edition
            .departments
            .iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();

        self.write(|data| {
            let parent = match edition.parent.as_deref() {
                Some(parent) => {
                    let group = writable::<Group>(&rights, data, parent)?;
                    Some((group.id.clone(), group.dn.clone()))
                }
                None => None,
            };
            let base = self.new_container_base(
                ContainerType::Group,
                edition.scope.as_deref(),
                parent.as_ref().map(|(_, dn)| dn.as_str()),
                &self.config.groups_dn,
            )?;
            let dn = format!("cn={name},{base}");
            check_new::<Group>(&rights, data, &id, &dn)?;

            let mut group = self.create_group_in(data, &dn, &name, &departments)?;
            if let Some((parent, _)) = parent {
                self.add_group_to_group_in(data, &id, &parent)?;
                group.groups.insert(parent);
            }
            Ok(group)
        })
    }

    pub fn delete_group(&self, principal: &str, id: &str) -> Result<(), DirectoryError> {
        let rights = self.rights(principal)?;
        self.write(|data| {
            let group = check_delete::<Group>(&rights, data, id)?;
            self.delete_group_in(data, &group.id)
        })
    }

    pub fn empty_group(&self, principal: &str, id: &str) -> Result<(), DirectoryError> {
        let rights = self.rights(principal)?;
        self.write(|data| {
            let id = writable::<Group>(&rights, data, id)?.id.clone();
            self.empty_group_in(data, &id)
        })
    }

    /// Nest `sub` into `group`. Needs write access on `group`.
    pub fn add_group_to_group(&self, principal: &str, sub: &str, group: &str) -> Result<(), DirectoryError> {
        let rights = self.rights(principal)?;
        self.write(|data| {
            let sub = visible::<Group>(&rights, data, sub)?.id.clone();
            let group = writable::<Group>(&rights, data, group)?.id.clone();
            self.add_group_to_group_in(data, &sub, &group)
        })
    }

    pub fn remove_group_from_group(&self, principal: &str, sub: &str, group: &str) -> Result<(), DirectoryError> {
        let rights = self.rights(principal)?;
        self.write(|data| {
            let sub = visible::<Group>(&rights, data, sub)?.id.clone();
            let group = writable::<Group>(&rights, data, group)?.id.clone();
            self.remove_group_from_group_in(data, &sub, &group)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::fixture::{self, ADMIN, assert_consistent, dn_of};
    use orgsync_sql::SQLExecutor;

    fn edition(name: &str, parent: Option<&str>) -> GroupEdition {
        GroupEdition {
            name: name.into(),
            scope: None,
            parent: parent.map(str::to_string),
            departments: Vec::new(),
        }
    }

    fn member_values(fx: &fixture::Fixture, dn: &str) -> Vec<String> {
        fx.ldap.entry(dn).unwrap().get_all("uniqueMember").to_vec()
    }

    fn membership_rows(fx: &fixture::Fixture, group: &str) -> i64 {
        fx.svc
            .sql
            .query(
                "SELECT COUNT(*) AS n FROM cache_membership WHERE group_id = ?1 OR sub_group_id = ?1",
                &[group.into()],
            )
            .unwrap()[0]
            .get_i64("n")
            .unwrap()
    }

    #[test]
    fn test_create_group() {
        let fx = fixture::fixture();
        let mut request = edition("DIG-AS", Some("dig"));
        request.departments = vec![" D7 ".into(), "".into()];
        let created = fx.svc.create_group(ADMIN, request).unwrap();
        assert_eq!(created.id, "dig-as");
        assert_eq!(created.dn, dn_of("cn=DIG-AS,cn=dig,ou=groups"));
        assert!(created.groups.contains("dig"));

        let entry = fx.ldap.entry(&created.dn).unwrap();
        assert_eq!(entry.get_all("uniqueMember"), ["uid=none"]);
        assert_eq!(entry.get_all("businessCategory"), ["D7"]);
        assert!(member_values(&fx, &dn_of("cn=dig,ou=groups")).contains(&created.dn));

        let data = fx.svc.snapshot().unwrap();
        assert!(data.groups["dig"].sub_groups.contains("dig-as"));
        assert!(data.groups["dig-as"].members.is_empty());
        assert_consistent(&data);

        let err = fx.svc.create_group(ADMIN, edition("dig-as", None)).unwrap_err();
        assert_eq!(err.code(), Some(codes::ALREADY_EXIST));
    }

    #[test]
    fn test_membership_is_idempotent() {
        let fx = fixture::fixture();
        fx.svc
            .write(|data| {
                fx.svc.add_user_to_group_in(data, "carol", "sales")?;
                fx.svc.add_user_to_group_in(data, "carol", "sales")?;
                fx.svc.remove_user_from_group_in(data, "jdoe", "sales")?;
                Ok(())
            })
            .unwrap();
        let data = fx.svc.snapshot().unwrap();
        assert!(data.groups["sales"].members.contains("carol"));
        assert!(data.users["carol"].groups.contains("sales"));
        assert_eq!(membership_rows(&fx, "sales"), 1);
        assert_consistent(&data);
    }

    #[test]
    fn test_last_member_is_a_conflict() {
        let fx = fixture::fixture();
        let err = fx
            .svc
            .write(|data| fx.svc.remove_user_from_group_in(data, "jdoe", "dev"))
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::LAST_MEMBER_OF_GROUP));
        let data = fx.svc.snapshot().unwrap();
        assert!(data.groups["dev"].members.contains("jdoe"));
        assert!(data.users["jdoe"].groups.contains("dev"));
    }

    #[test]
    fn test_empty_group_keeps_sub_groups() {
        let fx = fixture::fixture();
        fx.svc.empty_group(ADMIN, "DIG").unwrap();

        let data = fx.svc.snapshot().unwrap();
        assert!(data.groups["dig"].members.is_empty());
        assert!(data.groups["dig"].sub_groups.contains("dig-rha"));
        assert!(!data.users["jdoe"].groups.contains("dig"));
        assert_eq!(
            member_values(&fx, &dn_of("cn=dig,ou=groups")),
            vec!["uid=none".to_string(), dn_of("cn=dig-rha,cn=dig,ou=groups")]
        );
        assert_eq!(membership_rows(&fx, "dig"), 1);
        assert_consistent(&data);

        assert!(matches!(
            fx.svc.empty_group("jdoe", "dev").unwrap_err(),
            DirectoryError::UnknownId { kind: "group", .. }
        ));
    }

    #[test]
    fn test_delete_group_cascade() {
        let fx = fixture::fixture();
        fx.svc.delete_group(ADMIN, "dig").unwrap();

        let data = fx.svc.snapshot().unwrap();
        assert!(!data.groups.contains_key("dig"));
        assert!(!data.groups.contains_key("dig-rha"));
        assert!(!data.users["jdoe"].groups.contains("dig"));
        assert!(data.users["alice"].groups.is_empty());
        assert_eq!(membership_rows(&fx, "dig") + membership_rows(&fx, "dig-rha"), 0);
        assert!(fx.ldap.entry(&dn_of("cn=dig-rha,cn=dig,ou=groups")).is_none());
        assert_consistent(&data);
    }

    #[test]
    fn test_delete_group_unlinks_external_parent() {
        let fx = fixture::fixture();
        fx.svc.add_group_to_group(ADMIN, "dev", "sales").unwrap();
        assert!(member_values(&fx, &dn_of("cn=sales,ou=groups")).contains(&dn_of("cn=dev,ou=groups")));

        fx.svc.delete_group(ADMIN, "dev").unwrap();
        let data = fx.svc.snapshot().unwrap();
        assert!(data.groups["sales"].sub_groups.is_empty());
        assert!(!data.users["jdoe"].groups.contains("dev"));
        assert_eq!(member_values(&fx, &dn_of("cn=sales,ou=groups")), vec!["uid=none"]);
        assert_consistent(&data);
    }

    #[test]
    fn test_delete_last_value_of_parent() {
        let fx = fixture::fixture();
        fx.svc.create_group(ADMIN, edition("Ops", None)).unwrap();
        fx.svc.add_group_to_group(ADMIN, "ops", "dev").unwrap();
        fx.svc.remove_user_from_group(ADMIN, "jdoe", "dev").unwrap();

        fx.svc.delete_group(ADMIN, "ops").unwrap();
        assert_eq!(member_values(&fx, &dn_of("cn=dev,ou=groups")), vec!["uid=none"]);
        let data = fx.svc.refresh().unwrap();
        assert!(data.groups["dev"].members.is_empty());
        assert!(data.groups["dev"].sub_groups.is_empty());
    }

    #[test]
    fn test_nesting_needs_write_on_parent() {
        let fx = fixture::fixture();
        fixture::grant(
            &fx.svc,
            "jdoe",
            crate::model::ReceiverType::User,
            crate::model::DelegateType::Group,
            "dev",
            false,
            false,
        );
        let err = fx.svc.add_group_to_group("jdoe", "dev", "dev").unwrap_err();
        assert!(matches!(err, DirectoryError::UnknownId { kind: "group", .. }));
        fx.svc.remove_group_from_group(ADMIN, "dig-rha", "dig").unwrap();
        let data = fx.svc.snapshot().unwrap();
        assert!(data.groups["dig-rha"].groups.is_empty());
        assert_consistent(&data);
    }

    #[test]
    fn test_find_group_by_department() {
        let fx = fixture::fixture();
        assert_eq!(fx.svc.find_group_by_department("D1").unwrap().unwrap().id, "dev");
        assert!(fx.svc.find_group_by_department("D9").unwrap().is_none());
    }

    #[test]
    fn test_invariant_across_sequence() {
        let fx = fixture::fixture();
        let check = || assert_consistent(&fx.svc.snapshot().unwrap());

        fx.svc.create_group(ADMIN, edition("Ops", None)).unwrap();
        check();
        fx.svc.create_group(ADMIN, edition("Ops-Night", Some("ops"))).unwrap();
        check();
        fx.svc.add_group_to_group(ADMIN, "dev", "ops-night").unwrap();
        check();
        fx.svc
            .write(|data| fx.svc.add_user_to_group_in(data, "bob", "ops-night"))
            .unwrap();
        check();
        fx.svc.empty_group(ADMIN, "ops-night").unwrap();
        check();
        fx.svc.delete_group(ADMIN, "ops").unwrap();
        check();
        let data = fx.svc.snapshot().unwrap();
        assert!(data.groups["dev"].groups.is_empty());
        assert!(!data.groups.contains_key("ops-night"));
    }

    #[test]
    fn test_random_sequences_match_rebuild() {
        use rand::{Rng, SeedableRng};
        use rand_chacha::ChaCha20Rng;

        let fx = fixture::fixture();
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let users = ["jdoe", "alice", "bob", "carol", "paul"];

        for step in 0..80 {
            let groups: Vec<String> = fx.svc.snapshot().unwrap().groups.keys().cloned().collect();
            let pick = |rng: &mut ChaCha20Rng| groups[rng.random_range(0..groups.len())].clone();
            let op = if groups.len() < 3 { 0 } else { rng.random_range(0..7) };
            let outcome = match op {
                0 => {
                    let parent = rng.random_bool(0.5).then(|| pick(&mut rng));
                    let mut e = edition(&format!("g{step}"), parent.as_deref());
                    e.departments = vec![format!("D{step}")];
                    fx.svc.create_group(ADMIN, e).map(|_| ())
                }
                1 => {
                    let (sub, group) = (pick(&mut rng), pick(&mut rng));
                    if sub == group {
                        continue;
                    }
                    fx.svc.add_group_to_group(ADMIN, &sub, &group)
                }
                2 => {
                    let (sub, group) = (pick(&mut rng), pick(&mut rng));
                    fx.svc.remove_group_from_group(ADMIN, &sub, &group)
                }
                3 => {
                    let user = users[rng.random_range(0..users.len())];
                    fx.svc.add_user_to_group(ADMIN, user, &pick(&mut rng))
                }
                4 => {
                    let user = users[rng.random_range(0..users.len())];
                    fx.svc.remove_user_from_group(ADMIN, user, &pick(&mut rng))
                }
                5 => fx.svc.empty_group(ADMIN, &pick(&mut rng)),
                _ => fx.svc.delete_group(ADMIN, &pick(&mut rng)),
            };
            match outcome {
                Ok(()) | Err(DirectoryError::Conflict(_)) => {}
                Err(e) => panic!("step {step}, op {op}: {e}"),
            }
            assert_consistent(&fx.svc.snapshot().unwrap());
        }

        // The graph edited in place matches a fresh scan of the directory.
        let edited = fx.svc.snapshot().unwrap();
        let rebuilt = fx.svc.refresh().unwrap();
        assert_eq!(edited.groups, rebuilt.groups);
        for (id, user) in &edited.users {
            assert_eq!(user.groups, rebuilt.users[id].groups, "{id}");
        }
    }
}
