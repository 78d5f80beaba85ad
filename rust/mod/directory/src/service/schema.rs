use orgsync_sql::{SQLExecutor, SQLStore};

use crate::service::DirectoryError;

/// Initialize the SQLite schema: the relational mirror, the delegations and
/// the container scopes.
pub fn init_schema(sql: &dyn SQLStore) -> Result<(), DirectoryError> {
    let statements = [
        // Mirror of companies
        "CREATE TABLE IF NOT EXISTS cache_company (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            dn TEXT NOT NULL,
            locked INTEGER NOT NULL DEFAULT 0
        )",

        // Mirror of groups
        "CREATE TABLE IF NOT EXISTS cache_group (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            dn TEXT NOT NULL,
            locked INTEGER NOT NULL DEFAULT 0
        )",

        // Mirror of users; company is NULL when unknown
        "CREATE TABLE IF NOT EXISTS cache_user (
            id TEXT PRIMARY KEY,
            first_name TEXT,
            last_name TEXT,
            mail TEXT,
            company TEXT,
            FOREIGN KEY (company) REFERENCES cache_company(id)
        )",
        "CREATE INDEX IF NOT EXISTS idx_cache_user_company ON cache_user(company)",

        // One row per user->group or subgroup->group edge
        "CREATE TABLE IF NOT EXISTS cache_membership (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            group_id TEXT NOT NULL,
            user_id TEXT,
            sub_group_id TEXT,
            FOREIGN KEY (group_id) REFERENCES cache_group(id),
            FOREIGN KEY (user_id) REFERENCES cache_user(id),
            FOREIGN KEY (sub_group_id) REFERENCES cache_group(id),
            CHECK ((user_id IS NULL) <> (sub_group_id IS NULL))
        )",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_cache_membership_user
            ON cache_membership(group_id, user_id) WHERE user_id IS NOT NULL",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_cache_membership_group
            ON cache_membership(group_id, sub_group_id) WHERE sub_group_id IS NOT NULL",
        "CREATE INDEX IF NOT EXISTS idx_cache_membership_user_id ON cache_membership(user_id)",

        // Delegations: source of truth, not rebuilt from the directory
        "CREATE TABLE IF NOT EXISTS delegates (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            dn TEXT NOT NULL,
            type TEXT NOT NULL,
            receiver TEXT NOT NULL,
            receiver_type TEXT NOT NULL,
            can_write INTEGER NOT NULL DEFAULT 0,
            can_admin INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_delegates_receiver ON delegates(receiver_type, receiver)",
        "CREATE INDEX IF NOT EXISTS idx_delegates_dn ON delegates(dn)",

        // Container scopes; name and dn are normalized
        "CREATE TABLE IF NOT EXISTS container_scopes (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            dn TEXT NOT NULL UNIQUE,
            type TEXT NOT NULL,
            locked INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (name, type)
        )",
    ];

    for stmt in &statements {
        sql.exec(stmt, &[])?;
    }

    Ok(())
}
