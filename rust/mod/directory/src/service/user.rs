//! Users: creation, update with group merge, deletion, queries and
//! authentication.

use std::collections::{BTreeSet, VecDeque};

use tracing::{debug, info, warn};

use orgsync_core::{ListParams, ListResult};
use orgsync_ldap::dn::normalize;
use orgsync_ldap::{Attributes, Filter, LdapError, Modification};

use crate::model::{Company, DirectoryData, Group, GroupRef, User, UserEdition, UserView};
use crate::service::container::{visible, writable};
use crate::service::delegation::Rights;
use crate::service::{DirectoryError, DirectoryService, codes, mirror};

/// Filters of [`DirectoryService::list_users`].
#[derive(Debug, Clone, Default)]
pub struct UserQuery {
    /// Only users of this company and the companies below it.
    pub company: Option<String>,
    /// Only members of this group and of the groups nested in it.
    pub group: Option<String>,
    pub params: ListParams,
}

/// Upper case the first letter of each word, lower case the rest.
pub(crate) fn capitalize_fully(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut word_start = true;
    for c in value.trim().chars() {
        if word_start {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        word_start = c.is_whitespace() || c == '-';
    }
    out
}

fn clean(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn normalize_edition(edition: UserEdition) -> UserEdition {
    let mut groups: Vec<String> = edition.groups.iter().map(|g| normalize(g)).collect();
    groups.sort();
    groups.dedup();
    UserEdition {
        id: normalize(&edition.id),
        first_name: capitalize_fully(&edition.first_name),
        last_name: capitalize_fully(&edition.last_name),
        company: normalize(&edition.company),
        department: clean(edition.department),
        local_id: clean(edition.local_id),
        mail: clean(edition.mail),
        groups,
    }
}

fn check_required(edition: &UserEdition) -> Result<(), DirectoryError> {
    for (field, value) in [
        ("id", &edition.id),
        ("firstName", &edition.first_name),
        ("lastName", &edition.last_name),
        ("company", &edition.company),
    ] {
        if value.is_empty() {
            return Err(DirectoryError::validation(field, codes::NOT_NULL, value.as_str()));
        }
    }
    Ok(())
}

/// Groups a user ends up in: current groups the principal cannot write are
/// kept, everything else is replaced by the requested set.
pub(crate) fn merge_groups(
    current: &BTreeSet<String>,
    requested: &BTreeSet<String>,
    can_write: impl Fn(&str) -> bool,
) -> BTreeSet<String> {
    current
        .iter()
        .filter(|g| !can_write(g))
        .chain(requested)
        .cloned()
        .collect()
}

/// `root` and every group nested in it, at any depth.
fn nested_groups(data: &DirectoryData, root: &str) -> Vec<String> {
    let mut found = BTreeSet::new();
    let mut queue = VecDeque::from([root.to_string()]);
    while let Some(id) = queue.pop_front() {
        if !found.insert(id.clone()) {
            continue;
        }
        if let Some(group) = data.groups.get(&id) {
            queue.extend(group.sub_groups.iter().cloned());
        }
    }
    found.into_iter().collect()
}

fn to_view(rights: &Rights, data: &DirectoryData, user: &User) -> UserView {
    let groups = user
        .groups
        .iter()
        .filter_map(|id| data.groups.get(id))
        .filter(|g| rights.can_see_group(g))
        .map(|g| GroupRef {
            id: g.id.clone(),
            name: g.name.clone(),
            can_write: rights.can_write_group(g),
        })
        .collect();
    UserView {
        id: user.id.clone(),
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
        company: user.company.clone(),
        department: user.department.clone(),
        local_id: user.local_id.clone(),
        mails: user.mails.clone(),
        locked: user.locked,
        locked_by: user.locked_by.clone(),
        isolated: user.isolated.clone(),
        groups,
        can_write: rights.can_write_user(data, user),
    }
}

fn visible_user<'a>(rights: &Rights, data: &'a DirectoryData, id: &str) -> Result<&'a User, DirectoryError> {
    data.users
        .get(&normalize(id))
        .filter(|u| rights.can_see_user(data, u))
        .ok_or_else(|| DirectoryError::unknown("user", id))
}

impl DirectoryService {
    /// Resolve the groups a user should end up in after an edition.
    ///
    /// Requested groups the user is not already in must be writable. A
    /// department change drops the group linked to the old department and
    /// adds the one linked to the new department.
    fn target_groups(
        &self,
        rights: &Rights,
        data: &DirectoryData,
        current: &BTreeSet<String>,
        old_department: Option<&str>,
        edition: &UserEdition,
    ) -> Result<BTreeSet<String>, DirectoryError> {
        let mut requested = BTreeSet::new();
        for id in &edition.groups {
            let group = data
                .groups
                .get(id)
                .filter(|g| rights.can_see_group(g))
                .ok_or_else(|| DirectoryError::unknown("group", id.as_str()))?;
            if !current.contains(id) && !rights.can_write_group(group) {
                warn!(group = %id, user = %edition.id, "membership outside of the principal's scope");
                return Err(DirectoryError::unknown("group", id.as_str()));
            }
            requested.insert(id.clone());
        }

        if old_department != edition.department.as_deref() {
            if let Some(old) = old_department {
                if let Some(group) = self.group_by_department(data, old)? {
                    requested.remove(&group);
                }
            }
            if let Some(new) = edition.department.as_deref() {
                if let Some(group) = self.group_by_department(data, new)? {
                    requested.insert(group);
                }
            }
        }

        Ok(merge_groups(current, &requested, |id| {
            data.groups.get(id).is_some_and(|g| rights.can_write_group(g))
        }))
    }

    /// Directory changes turning `user` into `edition`.
    fn attribute_changes(&self, user: &User, edition: &UserEdition) -> Vec<Modification> {
        let cfg = &self.config;
        let mut changes = Vec::new();
        let names_changed = user.first_name.as_deref() != Some(edition.first_name.as_str())
            || user.last_name.as_deref() != Some(edition.last_name.as_str());
        if names_changed {
            changes.push(Modification::set("givenName", Some(edition.first_name.clone())));
            changes.push(Modification::set("sn", Some(edition.last_name.clone())));
            changes.push(Modification::set(
                "cn",
                Some(format!("{} {}", edition.first_name, edition.last_name)),
            ));
        }
        if user.mails.first() != edition.mail.as_ref() {
            changes.push(Modification::set("mail", edition.mail.clone()));
        }
        if user.department != edition.department {
            changes.push(Modification::set(&cfg.department_attribute, edition.department.clone()));
        }
        if user.local_id != edition.local_id {
            changes.push(Modification::set(&cfg.local_id_attribute, edition.local_id.clone()));
        }
        changes
    }

    /// Reject a change that would leave a group without any member.
    fn check_not_last_member<'a>(
        data: &DirectoryData,
        user: &str,
        groups: impl IntoIterator<Item = &'a String>,
    ) -> Result<(), DirectoryError> {
        for id in groups {
            let sole = data.groups.get(id).is_some_and(|g| {
                g.sub_groups.is_empty() && g.members.len() == 1 && g.members.contains(user)
            });
            if sole {
                return Err(DirectoryError::conflict("groups", codes::LAST_MEMBER_OF_GROUP, id.as_str()));
            }
        }
        Ok(())
    }

    /// Move `user` from `current` to `target` groups, additions first.
    fn apply_groups(
        &self,
        data: &mut DirectoryData,
        user: &str,
        current: &BTreeSet<String>,
        target: &BTreeSet<String>,
    ) -> Result<(), DirectoryError> {
        for group in target.difference(current) {
            self.add_user_to_group_in(data, user, group)?;
        }
        for group in current.difference(target) {
            self.remove_user_from_group_in(data, user, group)?;
        }
        Ok(())
    }

    pub fn find_user(&self, principal: &str, id: &str) -> Result<UserView, DirectoryError> {
        let rights = self.rights(principal)?;
        self.read(|data| visible_user(&rights, data, id).map(|u| to_view(&rights, data, u)))
    }

    /// One page of the users visible to `principal`.
    pub fn list_users(&self, principal: &str, query: &UserQuery) -> Result<ListResult<UserView>, DirectoryError> {
        let rights = self.rights(principal)?;
        self.read(|data| {
            let mut companies = rights.visible_companies(data);
            if let Some(company) = query.company.as_deref() {
                let root = visible::<Company>(&rights, data, company)?.id.clone();
                companies.retain(|c| {
                    data.companies
                        .get(c)
                        .is_some_and(|c| c.company_tree.contains(&root))
                });
            }
            let groups = match query.group.as_deref() {
                Some(group) => {
                    let root = visible::<Group>(&rights, data, group)?;
                    Some(nested_groups(data, &root.id))
                }
                None => None,
            };

            let (ids, total) = mirror::find_users(self.sql.as_ref(), &companies, groups.as_deref(), &query.params)?;
            let items = ids
                .iter()
                .filter_map(|id| data.users.get(id))
                .map(|u| to_view(&rights, data, u))
                .collect();
            Ok(ListResult { items, total })
        })
    }

    /// Create a user entry in its company, then add it to its groups.
    pub fn create_user(&self, principal: &str, edition: UserEdition) -> Result<UserView, DirectoryError> {
        let rights = self.rights(principal)?;
        let edition = normalize_edition(edition);
        check_required(&edition)?;

        self.write(|data| {
            let id = edition.id.clone();
            if data.users.contains_key(&id) {
                return Err(DirectoryError::conflict("id", codes::ALREADY_EXIST, id));
            }
            if !rights.can_write_company(data, &edition.company) {
                warn!(user = %id, company = %edition.company, "creation outside of the principal's scope");
                return Err(DirectoryError::unknown("company", edition.company.as_str()));
            }
            let company_dn = data
                .companies
                .get(&edition.company)
                .map(|c| c.dn.clone())
                .ok_or_else(|| DirectoryError::unknown("company", edition.company.as_str()))?;
            let groups = self.target_groups(&rights, data, &BTreeSet::new(), None, &edition)?;

            let cfg = &self.config;
            let dn = format!("{}={},{}", cfg.uid_attribute, id, company_dn);
            let attributes = Attributes::new()
                .with("objectClass", cfg.people_class.as_str())
                .with(&cfg.uid_attribute, id.as_str())
                .with("cn", format!("{} {}", edition.first_name, edition.last_name))
                .with("givenName", edition.first_name.as_str())
                .with("sn", edition.last_name.as_str())
                .with_opt("mail", edition.mail.clone())
                .with_opt(&cfg.department_attribute, edition.department.clone())
                .with_opt(&cfg.local_id_attribute, edition.local_id.clone());
            self.ldap.bind(&dn, &attributes).map_err(|e| match e {
                LdapError::AlreadyBound(_) => DirectoryError::conflict("id", codes::ALREADY_EXIST, id.as_str()),
                other => other.into(),
            })?;

            let user = User {
                id: id.clone(),
                first_name: Some(edition.first_name.clone()),
                last_name: Some(edition.last_name.clone()),
                dn,
                company: Some(edition.company.clone()),
                department: edition.department.clone(),
                local_id: edition.local_id.clone(),
                mails: edition.mail.iter().cloned().collect(),
                groups: BTreeSet::new(),
                locked: None,
                locked_by: None,
                isolated: None,
                secured: false,
            };
            mirror::insert_user(self.sql.as_ref(), &user, data)?;
            data.users.insert(id.clone(), user);
            self.apply_groups(data, &id, &BTreeSet::new(), &groups)?;

            info!(user = %id, company = %edition.company, groups = groups.len(), "user created");
            let user = data
                .users
                .get(&id)
                .ok_or_else(|| DirectoryError::Internal(format!("user '{id}' vanished")))?;
            Ok(to_view(&rights, data, user))
        })
    }

    /// Update attributes, company and groups of a user.
    ///
    /// Attribute changes need write access on the company, group changes
    /// only read access. Changing company needs write access on both.
    pub fn update_user(&self, principal: &str, edition: UserEdition) -> Result<UserView, DirectoryError> {
        let rights = self.rights(principal)?;
        let edition = normalize_edition(edition);
        check_required(&edition)?;

        self.write(|data| {
            let user = visible_user(&rights, data, &edition.id)?.clone();
            let changes = self.attribute_changes(&user, &edition);
            let moving = user.company.as_deref() != Some(edition.company.as_str());

            if moving {
                if !rights.can_write_user(data, &user) {
                    warn!(user = %user.id, "move outside of the principal's scope");
                    return Err(DirectoryError::unknown("user", user.id));
                }
                if user.isolated.is_some() {
                    return Err(DirectoryError::conflict("company", codes::LOCKED, user.id));
                }
            }
            let allowed = if moving || !changes.is_empty() {
                rights.can_write_company(data, &edition.company)
            } else {
                rights.can_see_company(data, &edition.company)
            };
            if !allowed {
                warn!(user = %user.id, company = %edition.company, "update outside of the principal's scope");
                return Err(DirectoryError::unknown("company", edition.company.as_str()));
            }

            let groups = self.target_groups(&rights, data, &user.groups, user.department.as_deref(), &edition)?;
            Self::check_not_last_member(data, &user.id, user.groups.difference(&groups))?;

            if !changes.is_empty() {
                self.ldap.modify(&user.dn, &changes)?;
            }
            if moving {
                self.move_user_in(data, &user.id, &edition.company)?;
            }
            if let Some(u) = data.users.get_mut(&user.id) {
                u.first_name = Some(edition.first_name.clone());
                u.last_name = Some(edition.last_name.clone());
                u.department = edition.department.clone();
                u.local_id = edition.local_id.clone();
                if u.mails.first() != edition.mail.as_ref() {
                    u.mails = edition.mail.iter().cloned().collect();
                }
            }
            if let Some(u) = data.users.get(&user.id) {
                mirror::update_user(self.sql.as_ref(), u, data)?;
            }
            self.apply_groups(data, &user.id, &user.groups, &groups)?;

            info!(user = %user.id, changes = changes.len(), moved = moving, "user updated");
            let updated = data
                .users
                .get(&user.id)
                .ok_or_else(|| DirectoryError::Internal(format!("user '{}' vanished", user.id)))?;
            Ok(to_view(&rights, data, updated))
        })
    }

    /// Remove a user from its groups, then delete its entry.
    pub fn delete_user(&self, principal: &str, id: &str) -> Result<(), DirectoryError> {
        let rights = self.rights(principal)?;
        self.write(|data| {
            let user = visible_user(&rights, data, id)?.clone();
            if !rights.can_write_user(data, &user) {
                warn!(user = %user.id, "deletion outside of the principal's scope");
                return Err(DirectoryError::unknown("user", user.id));
            }
            Self::check_not_last_member(data, &user.id, &user.groups)?;

            for group in &user.groups {
                self.remove_user_from_group_in(data, &user.id, group)?;
            }
            self.ldap.unbind(&user.dn, false)?;
            data.users.remove(&user.id);
            mirror::delete_user(self.sql.as_ref(), &user.id)?;
            info!(user = %user.id, "user deleted");
            Ok(())
        })
    }

    /// Needs read access on the user and write access on the group.
    pub fn add_user_to_group(&self, principal: &str, user: &str, group: &str) -> Result<(), DirectoryError> {
        let rights = self.rights(principal)?;
        self.write(|data| {
            let user = visible_user(&rights, data, user)?.id.clone();
            let group = writable::<Group>(&rights, data, group)?.id.clone();
            self.add_user_to_group_in(data, &user, &group)
        })
    }

    pub fn remove_user_from_group(&self, principal: &str, user: &str, group: &str) -> Result<(), DirectoryError> {
        let rights = self.rights(principal)?;
        self.write(|data| {
            let user = visible_user(&rights, data, user)?.id.clone();
            let group = writable::<Group>(&rights, data, group)?.id.clone();
            self.remove_user_from_group_in(data, &user, &group)
        })
    }

    /// Check a password against the user entry named by login or mail.
    pub fn authenticate(&self, name: &str, password: &str) -> Result<bool, DirectoryError> {
        let name = name.trim();
        if name.is_empty() || password.is_empty() {
            return Ok(false);
        }
        let cfg = &self.config;
        let by_name = if name.contains('@') {
            Filter::eq("mail", name)
        } else {
            Filter::eq(&cfg.uid_attribute, normalize(name))
        };
        let filter = Filter::eq("objectClass", cfg.people_class.as_str()).and(by_name);
        let granted = self.ldap.authenticate(&cfg.people_dn, &filter, password)?;
        debug!(name, granted, "authentication");
        Ok(granted)
    }
}
