//! Directory module: organization directory with a relational mirror and
//! delegated administration.
//!
//! # Resources
//!
//! - **Company**: organizational unit users belong to (tree of OUs)
//! - **Group**: nestable group of users, optionally linked to departments
//! - **User**: person entry, with lock / quarantine lifecycle
//! - **Delegation**: grant of read/write/admin rights over a DN subtree
//!
//! The directory server is the source of truth for companies, groups and
//! users. An in-memory graph is rebuilt from it on demand and mirrored into
//! SQL tables for paginated queries. Delegations live only in SQL.
//!
//! # Usage
//!
//! ```ignore
//! use directory::{DirectoryModule, service::DirectoryConfig};
//!
//! let module = DirectoryModule::new(sql, ldap, DirectoryConfig::default())?;
//! let users = module.service().list_users("jdoe", &Default::default())?;
//! ```

pub mod model;
pub mod service;

use std::sync::Arc;

use orgsync_core::{ServiceConfig, ServiceError};
use orgsync_ldap::DirectoryClient;
use orgsync_sql::{SQLStore, SqliteStore};

use crate::service::{DirectoryConfig, DirectoryError, DirectoryService};

/// Directory module: owns the DirectoryService.
pub struct DirectoryModule {
    service: Arc<DirectoryService>,
}

impl DirectoryModule {
    /// Create a new DirectoryModule.
    pub fn new(
        sql: Arc<dyn SQLStore>,
        ldap: Arc<dyn DirectoryClient>,
        config: DirectoryConfig,
    ) -> Result<Self, ServiceError> {
        let service = DirectoryService::new(sql, ldap, config).map_err(ServiceError::from)?;
        Ok(Self { service })
    }

    /// Open the SQLite store named by `storage` and build the module on it.
    pub fn open(
        storage: &ServiceConfig,
        ldap: Arc<dyn DirectoryClient>,
        config: DirectoryConfig,
    ) -> Result<Self, ServiceError> {
        let path = storage.resolve_sqlite_path();
        let sql = SqliteStore::open(&path).map_err(|e| ServiceError::from(DirectoryError::from(e)))?;
        tracing::info!(path = %path.display(), "directory store opened");
        Self::new(Arc::new(sql), ldap, config)
    }

    /// Build the module from command-line flags of both configurations.
    pub fn from_args(args: &[String], ldap: Arc<dyn DirectoryClient>) -> Result<Self, ServiceError> {
        Self::open(&ServiceConfig::from_args(args), ldap, DirectoryConfig::from_args(args))
    }

    /// Get a reference to the underlying DirectoryService.
    pub fn service(&self) -> &Arc<DirectoryService> {
        &self.service
    }

    pub fn name(&self) -> &str {
        "directory"
    }
}
