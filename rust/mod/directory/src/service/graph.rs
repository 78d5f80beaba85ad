//! Full directory scan into the in-memory graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use chrono::{NaiveDateTime, TimeZone, Utc};
use tracing::{info, warn};

use orgsync_ldap::dn::{self, normalize, normalize_dn, to_rdn};
use orgsync_ldap::memory::PASSWORD_ATTRIBUTE;
use orgsync_ldap::{Entry, Filter};

use crate::model::{Company, DirectoryData, Group, LockMarker, User};
use crate::service::{DirectoryError, DirectoryService};

/// Placeholder member value kept in every group entry we create.
pub const DUMMY_MEMBER: &str = "uid=none";

/// RDN attribute of user entries; member values starting with it are users.
pub const USER_RDN: &str = "uid";

/// Password policy lock time, set by the server after too many failures.
pub const PPOLICY_LOCKED_ATTRIBUTE: &str = "pwdAccountLockedTime";

/// `locked_by` of users locked by the password policy.
pub const PPOLICY_AUTHOR: &str = "_ppolicy";

pub const DEPARTMENT_ATTRIBUTE: &str = "businessCategory";

/// A group entry with its member values not yet resolved.
struct PendingGroup {
    group: Group,
    user_refs: Vec<String>,
    group_refs: Vec<String>,
}

/// Whether `member` is exactly the placeholder value, in any case.
pub(crate) fn is_placeholder(member: &str) -> bool {
    normalize_dn(member) == DUMMY_MEMBER
}

pub(crate) fn is_user_reference(member: &str) -> bool {
    normalize_dn(member).starts_with(&format!("{USER_RDN}="))
}

/// First component value, original case.
fn rdn_value(dn: &str) -> String {
    dn.split(',')
        .next()
        .and_then(|c| c.split_once('='))
        .map(|(_, v)| v.trim().to_string())
        .unwrap_or_else(|| dn.trim().to_string())
}

/// Ids of companies containing `target`, root first.
pub(crate) fn company_tree(companies: &BTreeMap<String, Company>, target: &str) -> Vec<String> {
    let mut tree: Vec<&Company> = companies
        .values()
        .filter(|c| dn::equals_or_parent_of(&c.dn, target))
        .collect();
    tree.sort_by(|a, b| {
        dn::depth(&a.dn)
            .cmp(&dn::depth(&b.dn))
            .then_with(|| normalize_dn(&a.dn).cmp(&normalize_dn(&b.dn)))
    });
    tree.into_iter().map(|c| c.id.clone()).collect()
}

fn parse_ppolicy_time(value: &str) -> Option<chrono::DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value.trim(), "%Y%m%d%H%M%SZ").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

impl DirectoryService {
    /// Scan the directory and assemble companies, groups and users.
    ///
    /// Never fails on inconsistent directory content: unresolvable member
    /// values are logged and dropped. Only directory access errors surface.
    pub fn rebuild(&self) -> Result<DirectoryData, DirectoryError> {
        let started = Instant::now();

        let companies = self.fetch_companies()?;
        let mut pending = self.fetch_groups()?;
        let mut groups = link_groups(&mut pending);
        let mut users = self.fetch_users()?;
        link_users(pending, &mut groups, &mut users);
        let mut data = DirectoryData {
            companies,
            groups,
            users,
        };
        self.lock_containers(&mut data)?;

        info!(
            companies = data.companies.len(),
            groups = data.groups.len(),
            users = data.users.len(),
            elapsed = ?started.elapsed(),
            "directory graph rebuilt"
        );
        Ok(data)
    }

    fn fetch_companies(&self) -> Result<BTreeMap<String, Company>, DirectoryError> {
        let cfg = &self.config;
        let entries = self
            .ldap
            .search(&cfg.companies_dn, &Filter::eq("objectClass", cfg.company_class.as_str()))?;

        let mut companies = BTreeMap::new();
        for entry in entries {
            let name = entry
                .get("ou")
                .map(str::to_string)
                .unwrap_or_else(|| rdn_value(&entry.dn));
            let id = normalize(&name);
            companies.insert(
                id.clone(),
                Company {
                    id,
                    name,
                    dn: entry.dn,
                    locked: false,
                    company_tree: Vec::new(),
                },
            );
        }

        let quarantine_id = to_rdn(&cfg.quarantine_dn);
        companies.insert(
            quarantine_id.clone(),
            Company {
                id: quarantine_id,
                name: rdn_value(&cfg.quarantine_dn),
                dn: cfg.quarantine_dn.clone(),
                locked: true,
                company_tree: Vec::new(),
            },
        );

        let trees: Vec<(String, Vec<String>)> = companies
            .values()
            .map(|c| (c.id.clone(), company_tree(&companies, &c.dn)))
            .collect();
        for (id, tree) in trees {
            if let Some(company) = companies.get_mut(&id) {
                company.company_tree = tree;
            }
        }
        Ok(companies)
    }

    fn fetch_groups(&self) -> Result<Vec<PendingGroup>, DirectoryError> {
        let cfg = &self.config;
        let entries = self
            .ldap
            .search(&cfg.groups_dn, &Filter::eq("objectClass", cfg.group_class.as_str()))?;

        let mut pending = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = entry
                .get("cn")
                .map(str::to_string)
                .unwrap_or_else(|| rdn_value(&entry.dn));
            let (user_refs, group_refs): (Vec<String>, Vec<String>) = entry
                .get_all(&cfg.member_attribute)
                .iter()
                .cloned()
                .partition(|member| is_user_reference(member));
            pending.push(PendingGroup {
                group: Group {
                    id: normalize(&name),
                    name,
                    dn: entry.dn,
                    locked: false,
                    members: BTreeSet::new(),
                    sub_groups: BTreeSet::new(),
                    groups: BTreeSet::new(),
                },
                user_refs,
                group_refs,
            });
        }
        Ok(pending)
    }

    fn fetch_users(&self) -> Result<BTreeMap<String, User>, DirectoryError> {
        let cfg = &self.config;
        let entries = self
            .ldap
            .search(&cfg.people_dn, &Filter::eq("objectClass", cfg.people_class.as_str()))?;

        let mut users = BTreeMap::new();
        for entry in entries {
            let user = self.to_user(entry);
            users.insert(user.id.clone(), user);
        }
        Ok(users)
    }

    fn to_user(&self, entry: Entry) -> User {
        let cfg = &self.config;
        let id = entry
            .get(&cfg.uid_attribute)
            .map(normalize)
            .unwrap_or_else(|| to_rdn(&entry.dn));
        let mut user = User {
            company: self.to_company(&entry.dn),
            first_name: entry.get("givenName").map(str::to_string),
            last_name: entry.get("sn").map(str::to_string),
            department: entry.get(&cfg.department_attribute).map(str::to_string),
            local_id: entry.get(&cfg.local_id_attribute).map(str::to_string),
            mails: entry.get_all("mail").to_vec(),
            groups: BTreeSet::new(),
            locked: None,
            locked_by: None,
            isolated: None,
            secured: entry.get(PASSWORD_ATTRIBUTE).is_some(),
            dn: entry.dn.clone(),
            id,
        };

        let marker = entry
            .get(&cfg.locked_attribute)
            .and_then(|value| LockMarker::parse(value, &cfg.locked_value));
        if let Some(marker) = marker {
            user.locked = Some(marker.locked);
            user.locked_by = Some(marker.locked_by);
            user.isolated = marker.isolated;
        } else if let Some(locked) = entry
            .get(PPOLICY_LOCKED_ATTRIBUTE)
            .and_then(parse_ppolicy_time)
        {
            user.locked = Some(locked);
            user.locked_by = Some(PPOLICY_AUTHOR.to_string());
        }
        user
    }

    /// Company id of a user DN, from the configured pattern.
    ///
    /// With a capturing group the first group is the company, and a DN that
    /// does not match has none. Without one, the pattern is itself the
    /// company of every DN it does not match.
    pub(crate) fn to_company(&self, user_dn: &str) -> Option<String> {
        let has_group = self.company_pattern.captures_len() > 1;
        match self.company_pattern.captures(&normalize_dn(user_dn)) {
            Some(captures) if has_group => captures.get(1).map(|m| normalize(m.as_str())),
            Some(_) => None,
            None if has_group => None,
            None => Some(normalize(&self.config.company_pattern)),
        }
    }
}

/// Resolve group-to-group references, linking both ends.
fn link_groups(pending: &mut [PendingGroup]) -> BTreeMap<String, Group> {
    let by_dn: HashMap<String, String> = pending
        .iter()
        .map(|p| (normalize_dn(&p.group.dn), p.group.id.clone()))
        .collect();

    let mut links = Vec::new();
    for p in pending.iter_mut() {
        for reference in p.group_refs.drain(..) {
            match by_dn.get(&normalize_dn(&reference)) {
                Some(sub) => links.push((p.group.id.clone(), sub.clone())),
                None => warn!(group = %p.group.id, reference = %reference, "broken group reference"),
            }
        }
    }

    let mut groups: BTreeMap<String, Group> = BTreeMap::new();
    for p in pending.iter() {
        if groups.insert(p.group.id.clone(), p.group.clone()).is_some() {
            warn!(group = %p.group.id, dn = %p.group.dn, "duplicate group name, keeping the last entry");
        }
    }
    for (parent, sub) in links {
        if let Some(g) = groups.get_mut(&parent) {
            g.sub_groups.insert(sub.clone());
        }
        if let Some(g) = groups.get_mut(&sub) {
            g.groups.insert(parent);
        }
    }
    groups
}

/// Resolve user references, replacing raw DNs with user ids on both ends.
fn link_users(
    pending: Vec<PendingGroup>,
    groups: &mut BTreeMap<String, Group>,
    users: &mut BTreeMap<String, User>,
) {
    for p in pending {
        let Some(group) = groups.get_mut(&p.group.id) else {
            continue;
        };
        for reference in p.user_refs {
            let uid = to_rdn(&reference);
            match users.get_mut(&uid) {
                Some(user) => {
                    if normalize_dn(&reference) != normalize_dn(&user.dn) {
                        warn!(group = %group.id, user = %uid, reference = %reference, dn = %user.dn,
                            "broken user DN reference");
                    }
                    user.groups.insert(group.id.clone());
                    group.members.insert(uid);
                }
                None => {
                    if !is_placeholder(&reference) {
                        warn!(group = %group.id, reference = %reference, "broken user reference");
                    }
                }
            }
        }
    }
}
