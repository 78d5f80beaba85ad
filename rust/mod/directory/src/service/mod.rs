pub mod cache;
pub mod company;
pub mod config;
pub mod container;
pub mod delegation;
pub mod graph;
pub mod group;
pub mod lifecycle;
pub mod mirror;
pub mod schema;
pub mod scope;
pub mod user;

#[cfg(test)]
pub(crate) mod fixture;

use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use orgsync_core::{FieldError, ServiceError};
use orgsync_ldap::{DirectoryClient, LdapError};
use orgsync_sql::{SQLError, SQLExecutor, SQLStore, Value};

pub use config::DirectoryConfig;

/// Directory service error type.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The entity does not exist, or the principal may not see it. Both
    /// cases are reported the same way.
    #[error("unknown-id: {kind} '{id}'")]
    UnknownId { kind: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(FieldError),

    #[error("validation: {0}")]
    Validation(FieldError),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("directory: {0}")]
    Directory(#[from] LdapError),

    #[error("storage: {0}")]
    Storage(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl DirectoryError {
    pub(crate) fn unknown(kind: &'static str, id: impl Into<String>) -> Self {
        DirectoryError::UnknownId { kind, id: id.into() }
    }

    pub(crate) fn conflict(field: &str, code: &str, value: impl Into<String>) -> Self {
        DirectoryError::Conflict(FieldError::new(field, code, value))
    }

    pub(crate) fn validation(field: &str, code: &str, value: impl Into<String>) -> Self {
        DirectoryError::Validation(FieldError::new(field, code, value))
    }

    /// Domain code of a conflict or validation failure.
    pub fn code(&self) -> Option<&str> {
        match self {
            DirectoryError::Conflict(f) | DirectoryError::Validation(f) => Some(&f.code),
            _ => None,
        }
    }
}

impl From<SQLError> for DirectoryError {
    fn from(e: SQLError) -> Self {
        DirectoryError::Storage(e.to_string())
    }
}

impl From<DirectoryError> for ServiceError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::UnknownId { .. } => ServiceError::NotFound(e.to_string()),
            DirectoryError::Conflict(f) => ServiceError::Conflict(f),
            DirectoryError::Validation(f) => ServiceError::Validation(f),
            DirectoryError::Forbidden(m) => ServiceError::PermissionDenied(m),
            DirectoryError::Directory(e) => ServiceError::Upstream(e.to_string()),
            DirectoryError::Storage(m) => ServiceError::Storage(m),
            DirectoryError::Internal(m) => ServiceError::Internal(m),
        }
    }
}

/// Error codes reported with conflicts and validation errors.
pub mod codes {
    pub const ALREADY_EXIST: &str = "already-exist";
    pub const NOT_EMPTY_COMPANY: &str = "not-empty-company";
    pub const LAST_MEMBER_OF_GROUP: &str = "last-member-of-group";
    pub const LOCKED: &str = "locked";
    pub const INTEGRITY_UNICITY: &str = "integrity-unicity";
    pub const DISTINGUISHED_NAME: &str = "DistinguishName";
    pub const NOT_NULL: &str = "NotNull";
    pub const CONTAINER_TYPE_MATCH: &str = "container-type-match";
    pub const CONTAINER_PARENT_TYPE_MATCH: &str = "container-parent-type-match";
}

/// The directory service: directory client, relational mirror and the
/// shared in-memory graph.
pub struct DirectoryService {
    pub(crate) sql: Arc<dyn SQLStore>,
    pub(crate) ldap: Arc<dyn DirectoryClient>,
    pub(crate) config: DirectoryConfig,
    pub(crate) company_pattern: Regex,
    pub(crate) cache: cache::DirectoryCache,
}

impl DirectoryService {
    /// Create a new DirectoryService, initializing the DB schema.
    ///
    /// The graph itself is loaded lazily on first access.
    pub fn new(
        sql: Arc<dyn SQLStore>,
        ldap: Arc<dyn DirectoryClient>,
        config: DirectoryConfig,
    ) -> Result<Arc<Self>, DirectoryError> {
        schema::init_schema(sql.as_ref())?;
        let company_pattern = Regex::new(&format!("(?i)^(?:{})$", config.company_pattern))
            .map_err(|e| DirectoryError::validation("companyPattern", "Pattern", e.to_string()))?;
        let cache = cache::DirectoryCache::new(config.cache_ttl);
        Ok(Arc::new(Self {
            sql,
            ldap,
            config,
            company_pattern,
            cache,
        }))
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    // ── Generic record helpers (JSON `data` column plus indexed columns) ──

    pub(crate) fn insert_record<T: Serialize>(
        &self,
        table: &str,
        id: &str,
        record: &T,
        indexes: &[(&str, Value)],
    ) -> Result<(), DirectoryError> {
        let json = serde_json::to_string(record)
            .map_err(|e| DirectoryError::Internal(e.to_string()))?;

        let mut cols = vec!["id", "data"];
        let mut placeholders = vec!["?1".to_string(), "?2".to_string()];
        let mut params = vec![Value::Text(id.to_string()), Value::Text(json)];

        for (i, (col, val)) in indexes.iter().enumerate() {
            cols.push(col);
            placeholders.push(format!("?{}", i + 3));
            params.push(val.clone());
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            cols.join(", "),
            placeholders.join(", "),
        );

        self.sql.exec(&sql, &params).map_err(|e| {
            if e.is_unique_violation() {
                DirectoryError::conflict("id", codes::INTEGRITY_UNICITY, id)
            } else {
                DirectoryError::from(e)
            }
        })?;
        Ok(())
    }

    /// Get a record by id; `None` when absent.
    pub(crate) fn get_record<T: DeserializeOwned>(
        &self,
        table: &str,
        id: &str,
    ) -> Result<Option<T>, DirectoryError> {
        let sql = format!("SELECT data FROM {} WHERE id = ?1", table);
        let rows = self.sql.query(&sql, &[Value::Text(id.to_string())])?;
        rows.first().map(decode_record).transpose()
    }

    pub(crate) fn update_record<T: Serialize>(
        &self,
        table: &str,
        id: &str,
        record: &T,
        indexes: &[(&str, Value)],
    ) -> Result<(), DirectoryError> {
        update_record_in(self.sql.as_ref(), table, id, record, indexes)
    }

    pub(crate) fn delete_record(&self, table: &str, id: &str) -> Result<bool, DirectoryError> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", table);
        let affected = self.sql.exec(&sql, &[Value::Text(id.to_string())])?;
        Ok(affected > 0)
    }

    /// Records matching a WHERE clause, in `created_at` order.
    pub(crate) fn query_records<T: DeserializeOwned>(
        &self,
        table: &str,
        where_sql: &str,
        params: &[Value],
    ) -> Result<Vec<T>, DirectoryError> {
        query_records_in(self.sql.as_ref(), table, where_sql, params)
    }
}

pub(crate) fn decode_record<T: DeserializeOwned>(row: &orgsync_sql::Row) -> Result<T, DirectoryError> {
    let data = row
        .get_str("data")
        .ok_or_else(|| DirectoryError::Internal("missing data column".into()))?;
    serde_json::from_str(data).map_err(|e| DirectoryError::Internal(e.to_string()))
}

pub(crate) fn query_records_in<T: DeserializeOwned>(
    sql: &dyn SQLStore,
    table: &str,
    where_sql: &str,
    params: &[Value],
) -> Result<Vec<T>, DirectoryError> {
    let where_sql = if where_sql.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", where_sql)
    };
    let query = format!("SELECT data FROM {}{} ORDER BY created_at, id", table, where_sql);
    let rows = sql.query(&query, params)?;
    rows.iter().map(decode_record).collect()
}

/// Update a record's JSON data and indexed columns.
pub(crate) fn update_record_in<T: Serialize>(
    sql: &dyn SQLStore,
    table: &str,
    id: &str,
    record: &T,
    indexes: &[(&str, Value)],
) -> Result<(), DirectoryError> {
    let json = serde_json::to_string(record)
        .map_err(|e| DirectoryError::Internal(e.to_string()))?;

    let mut sets = vec!["data = ?1".to_string()];
    let mut params: Vec<Value> = vec![Value::Text(json)];

    for (i, (col, val)) in indexes.iter().enumerate() {
        sets.push(format!("{} = ?{}", col, i + 2));
        params.push(val.clone());
    }

    let id_idx = params.len() + 1;
    params.push(Value::Text(id.to_string()));

    let statement = format!(
        "UPDATE {} SET {} WHERE id = ?{}",
        table,
        sets.join(", "),
        id_idx,
    );

    let affected = sql.exec(&statement, &params)?;
    if affected == 0 {
        return Err(DirectoryError::unknown("record", format!("{}/{}", table, id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_renders_as_not_found() {
        let hidden: ServiceError = DirectoryError::unknown("user", "jdoe").into();
        assert_eq!(hidden.error_code(), "NOT_FOUND");
        assert_eq!(hidden.to_string(), "unknown-id: user 'jdoe'");
    }

    #[test]
    fn test_conflict_keeps_field_context() {
        let err = DirectoryError::conflict("groups", codes::LAST_MEMBER_OF_GROUP, "dig");
        assert_eq!(err.code(), Some("last-member-of-group"));
        let service: ServiceError = err.into();
        let details = service.details().unwrap();
        assert_eq!(details.field, "groups");
        assert_eq!(details.value, "dig");
    }

    #[test]
    fn test_directory_errors_are_upstream() {
        let err: DirectoryError = LdapError::NoSuchObject("cn=x".into()).into();
        let service: ServiceError = err.into();
        assert_eq!(service.error_code(), "UPSTREAM_ERROR");
    }

    #[test]
    fn test_invalid_company_pattern() {
        let config = DirectoryConfig {
            company_pattern: "([".into(),
            ..Default::default()
        };
        let sql = Arc::new(orgsync_sql::SqliteStore::open_in_memory().unwrap());
        let ldap = Arc::new(orgsync_ldap::MemoryDirectory::default());
        let err = DirectoryService::new(sql, ldap, config).err().unwrap();
        assert!(matches!(err, DirectoryError::Validation(_)));
    }
}
