//! Relational mirror of the graph, used for filtered and paginated listing.
//!
//! Every function takes the store explicitly so the same code runs on the
//! service store and inside a transaction.

use std::collections::HashMap;

use tracing::info;

use orgsync_core::ListParams;
use orgsync_ldap::dn::normalize_dn;
use orgsync_sql::{SQLError, SQLExecutor, SQLStore, Value};

use crate::model::{Company, ContainerType, DelegateType, DirectoryData, Group, ReceiverType, User};

/// Row counts written by [`reset`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetStats {
    pub companies: usize,
    pub groups: usize,
    pub users: usize,
    pub memberships: usize,
    pub delegates_moved: usize,
    pub delegates_removed: usize,
}

/// Wipe and repopulate the mirror from `data`, in one transaction.
///
/// Delegations are re-pointed in the same transaction: GROUP and COMPANY
/// delegations follow the DN of their container, and delegations whose
/// container or receiving group/company is gone are deleted.
pub fn reset(sql: &dyn SQLStore, data: &DirectoryData) -> Result<ResetStats, SQLError> {
    let mut stats = ResetStats::default();
    sql.transaction(&mut |tx| {
        stats = fill(tx, data)?;
        Ok(())
    })?;
    info!(
        companies = stats.companies,
        groups = stats.groups,
        users = stats.users,
        memberships = stats.memberships,
        delegates_moved = stats.delegates_moved,
        delegates_removed = stats.delegates_removed,
        "relational mirror reset"
    );
    Ok(stats)
}

fn fill<S: SQLExecutor + ?Sized>(sql: &S, data: &DirectoryData) -> Result<ResetStats, SQLError> {
    for table in ["cache_membership", "cache_user", "cache_group", "cache_company"] {
        sql.exec(&format!("DELETE FROM {table}"), &[])?;
    }

    let mut stats = ResetStats::default();
    for company in data.companies.values() {
        insert_company(sql, company)?;
        stats.companies += 1;
    }
    for group in data.groups.values() {
        insert_group(sql, group)?;
        stats.groups += 1;
    }
    for user in data.users.values() {
        insert_user(sql, user, data)?;
        stats.users += 1;
    }
    for user in data.users.values() {
        for group in &user.groups {
            add_user_to_group(sql, &user.id, group)?;
            stats.memberships += 1;
        }
    }
    for group in data.groups.values() {
        for sub in &group.sub_groups {
            add_group_to_group(sql, sub, &group.id)?;
            stats.memberships += 1;
        }
    }

    let (moved, removed) = refresh_delegates(sql, data)?;
    stats.delegates_moved = moved;
    stats.delegates_removed = removed;
    Ok(stats)
}

fn refresh_delegates<S: SQLExecutor + ?Sized>(sql: &S, data: &DirectoryData) -> Result<(usize, usize), SQLError> {
    let rows = sql.query(
        "SELECT id, name, dn, type, receiver, receiver_type, data FROM delegates",
        &[],
    )?;

    let mut moved = 0;
    let mut removed = 0;
    for row in &rows {
        let id = row.get_str("id").unwrap_or_default();
        let name = row.get_str("name").unwrap_or_default();
        let receiver = row.get_str("receiver").unwrap_or_default();

        let receiver_gone = match row.get_str("receiver_type") {
            Some(t) if t == ReceiverType::Group.as_str() => !data.groups.contains_key(receiver),
            Some(t) if t == ReceiverType::Company.as_str() => !data.companies.contains_key(receiver),
            _ => false,
        };
        let container_dn = match row.get_str("type") {
            Some(t) if t == DelegateType::Group.as_str() => Some(data.groups.get(name).map(|g| g.dn.as_str())),
            Some(t) if t == DelegateType::Company.as_str() => {
                Some(data.companies.get(name).map(|c| c.dn.as_str()))
            }
            _ => None,
        };

        if receiver_gone || matches!(container_dn, Some(None)) {
            sql.exec("DELETE FROM delegates WHERE id = ?1", &[id.into()])?;
            removed += 1;
            continue;
        }
        let Some(Some(container_dn)) = container_dn else {
            continue;
        };
        let current = normalize_dn(container_dn);
        if row.get_str("dn") == Some(current.as_str()) {
            continue;
        }

        let mut record: serde_json::Value = serde_json::from_str(row.get_str("data").unwrap_or("{}"))
            .map_err(|e| SQLError::Execution(e.to_string()))?;
        record["dn"] = serde_json::Value::String(current.clone());
        sql.exec(
            "UPDATE delegates SET dn = ?1, data = ?2 WHERE id = ?3",
            &[current.into(), record.to_string().into(), id.into()],
        )?;
        moved += 1;
    }
    Ok((moved, removed))
}

// ── Row-level operations ──

pub fn insert_company<S: SQLExecutor + ?Sized>(sql: &S, company: &Company) -> Result<(), SQLError> {
    sql.exec(
        "INSERT INTO cache_company (id, name, dn, locked) VALUES (?1, ?2, ?3, ?4)",
        &[
            company.id.as_str().into(),
            company.name.as_str().into(),
            normalize_dn(&company.dn).into(),
            company.locked.into(),
        ],
    )?;
    Ok(())
}

/// Delete a company row. Users still pointing at it lose their company.
pub fn delete_company<S: SQLExecutor + ?Sized>(sql: &S, id: &str) -> Result<(), SQLError> {
    sql.exec("UPDATE cache_user SET company = NULL WHERE company = ?1", &[id.into()])?;
    sql.exec("DELETE FROM cache_company WHERE id = ?1", &[id.into()])?;
    Ok(())
}

pub fn insert_group<S: SQLExecutor + ?Sized>(sql: &S, group: &Group) -> Result<(), SQLError> {
    sql.exec(
        "INSERT INTO cache_group (id, name, dn, locked) VALUES (?1, ?2, ?3, ?4)",
        &[
            group.id.as_str().into(),
            group.name.as_str().into(),
            normalize_dn(&group.dn).into(),
            group.locked.into(),
        ],
    )?;
    Ok(())
}

/// Copy the lock flag of every company and group of `data` to its row.
pub fn update_locks<S: SQLExecutor + ?Sized>(sql: &S, data: &DirectoryData) -> Result<(), SQLError> {
    for company in data.companies.values() {
        sql.exec(
            "UPDATE cache_company SET locked = ?1 WHERE id = ?2",
            &[company.locked.into(), company.id.as_str().into()],
        )?;
    }
    for group in data.groups.values() {
        sql.exec(
            "UPDATE cache_group SET locked = ?1 WHERE id = ?2",
            &[group.locked.into(), group.id.as_str().into()],
        )?;
    }
    Ok(())
}

/// Delete a group row and every membership row it takes part in.
pub fn delete_group<S: SQLExecutor + ?Sized>(sql: &S, id: &str) -> Result<(), SQLError> {
    sql.exec(
        "DELETE FROM cache_membership WHERE group_id = ?1 OR sub_group_id = ?1",
        &[id.into()],
    )?;
    sql.exec("DELETE FROM cache_group WHERE id = ?1", &[id.into()])?;
    Ok(())
}

/// Company column value: `NULL` when the company is not in the graph.
fn known_company(user: &User, data: &DirectoryData) -> Value {
    user.company
        .as_deref()
        .filter(|c| data.companies.contains_key(*c))
        .into()
}

pub fn insert_user<S: SQLExecutor + ?Sized>(sql: &S, user: &User, data: &DirectoryData) -> Result<(), SQLError> {
    sql.exec(
        "INSERT INTO cache_user (id, first_name, last_name, mail, company) VALUES (?1, ?2, ?3, ?4, ?5)",
        &[
            user.id.as_str().into(),
            user.first_name.as_deref().into(),
            user.last_name.as_deref().into(),
            user.mails.first().map(String::as_str).into(),
            known_company(user, data),
        ],
    )?;
    Ok(())
}

pub fn update_user<S: SQLExecutor + ?Sized>(sql: &S, user: &User, data: &DirectoryData) -> Result<(), SQLError> {
    sql.exec(
        "UPDATE cache_user SET first_name = ?1, last_name = ?2, mail = ?3, company = ?4 WHERE id = ?5",
        &[
            user.first_name.as_deref().into(),
            user.last_name.as_deref().into(),
            user.mails.first().map(String::as_str).into(),
            known_company(user, data),
            user.id.as_str().into(),
        ],
    )?;
    Ok(())
}

pub fn delete_user<S: SQLExecutor + ?Sized>(sql: &S, id: &str) -> Result<(), SQLError> {
    sql.exec("DELETE FROM cache_membership WHERE user_id = ?1", &[id.into()])?;
    sql.exec("DELETE FROM cache_user WHERE id = ?1", &[id.into()])?;
    Ok(())
}

pub fn add_user_to_group<S: SQLExecutor + ?Sized>(sql: &S, user: &str, group: &str) -> Result<(), SQLError> {
    sql.exec(
        "INSERT OR IGNORE INTO cache_membership (group_id, user_id) VALUES (?1, ?2)",
        &[group.into(), user.into()],
    )?;
    Ok(())
}

pub fn remove_user_from_group<S: SQLExecutor + ?Sized>(sql: &S, user: &str, group: &str) -> Result<(), SQLError> {
    sql.exec(
        "DELETE FROM cache_membership WHERE group_id = ?1 AND user_id = ?2",
        &[group.into(), user.into()],
    )?;
    Ok(())
}

pub fn add_group_to_group<S: SQLExecutor + ?Sized>(sql: &S, sub: &str, group: &str) -> Result<(), SQLError> {
    sql.exec(
        "INSERT OR IGNORE INTO cache_membership (group_id, sub_group_id) VALUES (?1, ?2)",
        &[group.into(), sub.into()],
    )?;
    Ok(())
}

pub fn remove_group_from_group<S: SQLExecutor + ?Sized>(sql: &S, sub: &str, group: &str) -> Result<(), SQLError> {
    sql.exec(
        "DELETE FROM cache_membership WHERE group_id = ?1 AND sub_group_id = ?2",
        &[group.into(), sub.into()],
    )?;
    Ok(())
}

/// Remove the user members of a group; nested groups stay.
pub fn empty_group<S: SQLExecutor + ?Sized>(sql: &S, group: &str) -> Result<(), SQLError> {
    sql.exec(
        "DELETE FROM cache_membership WHERE group_id = ?1 AND user_id IS NOT NULL",
        &[group.into()],
    )?;
    Ok(())
}

// ── Listing ──

fn placeholders(from: usize, count: usize) -> String {
    (from..from + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn user_sort_column(field: &str) -> &'static str {
    match field {
        "firstName" => "u.first_name",
        "lastName" => "u.last_name",
        "mail" => "u.mail",
        "company" => "u.company",
        _ => "u.id",
    }
}

/// One page of user ids and the total match count.
///
/// Users are restricted to `companies`, then to members of `groups` when
/// given. The criteria matches id, names and mail, case-insensitively.
pub fn find_users<S: SQLExecutor + ?Sized>(
    sql: &S,
    companies: &[String],
    groups: Option<&[String]>,
    params: &ListParams,
) -> Result<(Vec<String>, usize), SQLError> {
    if companies.is_empty() || groups.is_some_and(|g| g.is_empty()) {
        return Ok((Vec::new(), 0));
    }

    let mut values: Vec<Value> = companies.iter().map(|c| c.as_str().into()).collect();
    let mut clauses = vec![format!("u.company IN ({})", placeholders(1, companies.len()))];

    if let Some(groups) = groups {
        clauses.push(format!(
            "u.id IN (SELECT user_id FROM cache_membership WHERE user_id IS NOT NULL AND group_id IN ({}))",
            placeholders(values.len() + 1, groups.len())
        ));
        values.extend(groups.iter().map(|g| Value::from(g.as_str())));
    }

    if let Some(criteria) = params.criteria() {
        let n = values.len() + 1;
        clauses.push(format!(
            "(lower(u.id) LIKE ?{n} OR lower(u.first_name) LIKE ?{n} \
             OR lower(u.last_name) LIKE ?{n} OR lower(u.mail) LIKE ?{n})"
        ));
        values.push(format!("%{criteria}%").into());
    }

    let where_sql = clauses.join(" AND ");
    let total = sql
        .query(&format!("SELECT COUNT(*) AS total FROM cache_user u WHERE {where_sql}"), &values)?
        .first()
        .and_then(|r| r.get_i64("total"))
        .unwrap_or(0) as usize;

    let (column, order) = params
        .sort_by()
        .map(|(field, order)| (user_sort_column(field), order))
        .unwrap_or(("u.id", orgsync_core::SortOrder::Asc));
    let n = values.len() + 1;
    values.push((params.limit as i64).into());
    values.push((params.offset as i64).into());
    let rows = sql.query(
        &format!(
            "SELECT u.id FROM cache_user u WHERE {where_sql} ORDER BY {column} {}, u.id LIMIT ?{n} OFFSET ?{}",
            order.as_sql(),
            n + 1
        ),
        &values,
    )?;
    let ids = rows
        .iter()
        .filter_map(|r| r.get_str("id").map(str::to_string))
        .collect();
    Ok((ids, total))
}

/// Member count per container id, optionally restricted to users of
/// `visible_companies`.
pub fn member_counts<S: SQLExecutor + ?Sized>(
    sql: &S,
    container: ContainerType,
    visible_companies: Option<&[String]>,
) -> Result<HashMap<String, usize>, SQLError> {
    let mut values: Vec<Value> = Vec::new();
    let visible = match visible_companies {
        Some([]) => return Ok(HashMap::new()),
        Some(companies) => {
            values.extend(companies.iter().map(|c| Value::from(c.as_str())));
            format!(" AND u.company IN ({})", placeholders(1, companies.len()))
        }
        None => String::new(),
    };
    let query = match container {
        ContainerType::Group => format!(
            "SELECT m.group_id AS id, COUNT(*) AS total FROM cache_membership m \
             JOIN cache_user u ON u.id = m.user_id WHERE 1 = 1{visible} GROUP BY m.group_id"
        ),
        ContainerType::Company => format!(
            "SELECT u.company AS id, COUNT(*) AS total FROM cache_user u \
             WHERE u.company IS NOT NULL{visible} GROUP BY u.company"
        ),
    };
    let rows = sql.query(&query, &values)?;
    Ok(rows
        .iter()
        .filter_map(|r| Some((r.get_str("id")?.to_string(), r.get_i64("total")? as usize)))
        .collect())
}
