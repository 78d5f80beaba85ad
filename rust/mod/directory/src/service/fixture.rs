//! Sample directory shared by the service tests.
//!
//! ```text
//! ou=people
//!   ou=france ── ou=gfi (admin, jdoe)
//!             └─ ou=ligoj (alice, bob, paul)
//!   ou=external (carol)
//!   ou=quarantine (lucy)
//! ou=groups
//!   cn=dig (jdoe) ── cn=dig-rha (alice, bob)
//!   cn=dev (jdoe, department D1)
//!   cn=sales (placeholder only, department D2)
//!   cn=external (carol)
//! ```
//!
//! Scopes, all unlocked: companies "People" and "France", groups "Root" and
//! "Department" (`cn=dig`).

use std::sync::Arc;

use orgsync_ldap::{Attributes, DirectoryClient, MemoryDirectory};
use orgsync_sql::SqliteStore;

use crate::model::{
    ContainerScopeEdition, ContainerType, DelegateType, Delegation, DelegationEdition, DirectoryData, ReceiverType,
};
use crate::service::{DirectoryConfig, DirectoryService};

pub(crate) const BASE: &str = "dc=sample,dc=com";

/// Principal holding a TREE admin delegation on the whole base.
pub(crate) const ADMIN: &str = "admin";

pub(crate) fn dn_of(rdns: &str) -> String {
    format!("{rdns},{BASE}")
}

pub(crate) struct Fixture {
    pub svc: Arc<DirectoryService>,
    pub ldap: Arc<MemoryDirectory>,
}

pub(crate) fn fixture() -> Fixture {
    fixture_with(|_| {})
}

pub(crate) fn fixture_with(tune: impl FnOnce(&mut DirectoryConfig)) -> Fixture {
    let ldap = Arc::new(MemoryDirectory::default());
    seed(&ldap);
    let mut config = DirectoryConfig::default();
    tune(&mut config);
    let sql = Arc::new(SqliteStore::open_in_memory().unwrap());
    let svc = DirectoryService::new(sql, ldap.clone(), config).unwrap();
    grant(&svc, ADMIN, ReceiverType::User, DelegateType::Tree, BASE, true, true);
    let scopes = [
        ("People", "ou=people", ContainerType::Company),
        ("France", "ou=france,ou=people", ContainerType::Company),
        ("Root", "ou=groups", ContainerType::Group),
        ("Department", "cn=dig,ou=groups", ContainerType::Group),
    ];
    for (name, rdns, container_type) in scopes {
        svc.create_scope(
            ADMIN,
            ContainerScopeEdition {
                name: name.to_string(),
                dn: dn_of(rdns),
                container_type,
                locked: false,
            },
        )
        .unwrap();
    }
    Fixture { svc, ldap }
}

fn ou(name: &str) -> Attributes {
    Attributes::new()
        .with("objectClass", "organizationalUnit")
        .with("ou", name)
}

fn person(uid: &str, first: &str, last: &str) -> Attributes {
    Attributes::new()
        .with("objectClass", "inetOrgPerson")
        .with("uid", uid)
        .with("cn", format!("{first} {last}"))
        .with("givenName", first)
        .with("sn", last)
}

fn group(name: &str, members: &[String]) -> Attributes {
    Attributes::new()
        .with("objectClass", "groupOfUniqueNames")
        .with("cn", name)
        .with_all("uniqueMember", members.iter().cloned())
}

pub(crate) fn seed(ldap: &MemoryDirectory) {
    let entries = [
        (dn_of("ou=france,ou=people"), ou("France")),
        (dn_of("ou=gfi,ou=france,ou=people"), ou("Gfi")),
        (dn_of("ou=ligoj,ou=france,ou=people"), ou("Ligoj")),
        (dn_of("ou=external,ou=people"), ou("External")),
        (dn_of("ou=quarantine,ou=people"), ou("Quarantine")),
        (
            dn_of("uid=admin,ou=gfi,ou=france,ou=people"),
            person("admin", "Ada", "Admin"),
        ),
        (
            dn_of("uid=jdoe,ou=gfi,ou=france,ou=people"),
            person("jdoe", "John", "Doe")
                .with("mail", "john.doe@sample.com")
                .with("employeeNumber", "D1")
                .with("userPassword", "Secret1"),
        ),
        (
            dn_of("uid=alice,ou=ligoj,ou=france,ou=people"),
            person("alice", "Alice", "Martin").with("mail", "alice@ligoj.org"),
        ),
        (
            dn_of("uid=bob,ou=ligoj,ou=france,ou=people"),
            person("bob", "Bob", "Durand").with("mail", "bob@ligoj.org"),
        ),
        (
            dn_of("uid=paul,ou=ligoj,ou=france,ou=people"),
            person("paul", "Paul", "Policy").with("pwdAccountLockedTime", "20240102030405Z"),
        ),
        (
            dn_of("uid=carol,ou=external,ou=people"),
            person("carol", "Carol", "Smith").with("mail", "carol@external.net"),
        ),
        (
            dn_of("uid=lucy,ou=quarantine,ou=people"),
            person("lucy", "Lucy", "Locked").with("employeeType", "LOCKED|1700000000000|admin|ligoj|"),
        ),
        (
            dn_of("cn=dig,ou=groups"),
            group(
                "DIG",
                &[
                    dn_of("uid=jdoe,ou=gfi,ou=france,ou=people"),
                    dn_of("cn=dig-rha,cn=dig,ou=groups"),
                ],
            ),
        ),
        (
            dn_of("cn=dig-rha,cn=dig,ou=groups"),
            group(
                "DIG-RHA",
                &[
                    dn_of("uid=alice,ou=ligoj,ou=france,ou=people"),
                    dn_of("uid=bob,ou=ligoj,ou=france,ou=people"),
                ],
            ),
        ),
        (
            dn_of("cn=dev,ou=groups"),
            group("Dev", &[dn_of("uid=jdoe,ou=gfi,ou=france,ou=people")]).with("businessCategory", "D1"),
        ),
        (
            dn_of("cn=sales,ou=groups"),
            group("Sales", &["uid=none".to_string()]).with("businessCategory", "D2"),
        ),
        (
            dn_of("cn=external,ou=groups"),
            group("External", &[dn_of("uid=carol,ou=external,ou=people")]),
        ),
    ];
    for (dn, attributes) in entries {
        ldap.bind(&dn, &attributes).unwrap();
    }
}

/// Store a delegation without any principal check.
pub(crate) fn grant(
    svc: &DirectoryService,
    receiver: &str,
    receiver_type: ReceiverType,
    delegate_type: DelegateType,
    name: &str,
    can_write: bool,
    can_admin: bool,
) -> Delegation {
    svc.seed_delegate(DelegationEdition {
        name: name.to_string(),
        delegate_type,
        receiver: receiver.to_string(),
        receiver_type,
        can_write,
        can_admin,
    })
    .unwrap()
}

/// Every relationship is recorded on both ends and points at a known entity.
pub(crate) fn assert_consistent(data: &DirectoryData) {
    for (id, group) in &data.groups {
        for sub in &group.sub_groups {
            let sub = data.groups.get(sub).unwrap_or_else(|| panic!("{id}: unknown sub group {sub}"));
            assert!(sub.groups.contains(id), "{} misses parent {id}", sub.id);
        }
        for parent in &group.groups {
            let parent = data.groups.get(parent).unwrap_or_else(|| panic!("{id}: unknown parent {parent}"));
            assert!(parent.sub_groups.contains(id), "{} misses sub group {id}", parent.id);
        }
        for member in &group.members {
            let user = data.users.get(member).unwrap_or_else(|| panic!("{id}: unknown member {member}"));
            assert!(user.groups.contains(id), "{member} misses group {id}");
        }
    }
    for (id, user) in &data.users {
        for group in &user.groups {
            let group = data.groups.get(group).unwrap_or_else(|| panic!("{id}: unknown group {group}"));
            assert!(group.members.contains(id), "{} misses member {id}", group.id);
        }
    }
}
