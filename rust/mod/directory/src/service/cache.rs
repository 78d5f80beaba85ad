use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::model::DirectoryData;
use crate::service::{DirectoryError, DirectoryService, mirror};

/// Shared graph handed to every repository.
pub type SharedData = Arc<RwLock<DirectoryData>>;

struct Loaded {
    data: SharedData,
    loaded_at: Instant,
}

/// Process-wide snapshot of the directory graph.
///
/// Loaded lazily on first access, then mutated in place by every successful
/// write. A new load replaces the whole snapshot, so readers never see a
/// partially built graph.
pub struct DirectoryCache {
    ttl: Option<Duration>,
    loaded: RwLock<Option<Loaded>>,
    /// Serializes loads; counts them.
    loads: Mutex<u64>,
}

fn poisoned(e: impl std::fmt::Display) -> DirectoryError {
    DirectoryError::Internal(format!("lock poisoned: {e}"))
}

impl DirectoryCache {
    /// `ttl_secs == 0` keeps the snapshot until [`invalidate`](Self::invalidate).
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)),
            loaded: RwLock::new(None),
            loads: Mutex::new(0),
        }
    }

    /// The current snapshot, if loaded and not expired.
    fn current(&self) -> Result<Option<SharedData>, DirectoryError> {
        let loaded = self.loaded.read().map_err(poisoned)?;
        Ok(loaded.as_ref().and_then(|l| match self.ttl {
            Some(ttl) if l.loaded_at.elapsed() >= ttl => None,
            _ => Some(l.data.clone()),
        }))
    }

    /// Return the snapshot, running `load` when it is missing or expired.
    pub fn get_or_load(
        &self,
        load: impl FnOnce() -> Result<DirectoryData, DirectoryError>,
    ) -> Result<SharedData, DirectoryError> {
        if let Some(data) = self.current()? {
            return Ok(data);
        }

        let mut loads = self.loads.lock().map_err(poisoned)?;
        if let Some(data) = self.current()? {
            debug!("directory graph already loaded by another caller");
            return Ok(data);
        }

        let data = Arc::new(RwLock::new(load()?));
        *loads += 1;
        *self.loaded.write().map_err(poisoned)? = Some(Loaded {
            data: data.clone(),
            loaded_at: Instant::now(),
        });
        info!(loads = *loads, "directory graph loaded");
        Ok(data)
    }

    /// Drop the snapshot; the next access reloads it.
    pub fn invalidate(&self) -> Result<(), DirectoryError> {
        *self.loaded.write().map_err(poisoned)? = None;
        info!("directory graph invalidated");
        Ok(())
    }

    /// Number of loads performed so far.
    pub fn loads(&self) -> Result<u64, DirectoryError> {
        Ok(*self.loads.lock().map_err(poisoned)?)
    }
}

impl DirectoryService {
    /// The shared graph, loading it (directory scan plus mirror reset) when needed.
    pub(crate) fn data(&self) -> Result<SharedData, DirectoryError> {
        self.cache.get_or_load(|| {
            let data = self.rebuild()?;
            mirror::reset(self.sql.as_ref(), &data)?;
            Ok(data)
        })
    }

    /// Run `f` against the graph under a read lock.
    pub(crate) fn read<R>(
        &self,
        f: impl FnOnce(&DirectoryData) -> Result<R, DirectoryError>,
    ) -> Result<R, DirectoryError> {
        let data = self.data()?;
        let guard = data.read().map_err(poisoned)?;
        f(&guard)
    }

    /// Run `f` against the graph under the write lock. Writes are serialized.
    pub(crate) fn write<R>(
        &self,
        f: impl FnOnce(&mut DirectoryData) -> Result<R, DirectoryError>,
    ) -> Result<R, DirectoryError> {
        let data = self.data()?;
        let mut guard = data.write().map_err(poisoned)?;
        f(&mut guard)
    }

    /// A copy of the current graph.
    pub fn snapshot(&self) -> Result<DirectoryData, DirectoryError> {
        self.read(|data| Ok(data.clone()))
    }

    /// Drop the cached graph; the next read rescans the directory.
    pub fn invalidate(&self) -> Result<(), DirectoryError> {
        self.cache.invalidate()
    }

    /// Rescan the directory now and return the new graph.
    pub fn refresh(&self) -> Result<DirectoryData, DirectoryError> {
        self.invalidate()?;
        self.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::fixture::{self, dn_of};
    use orgsync_ldap::{Attributes, DirectoryClient};

    #[test]
    fn test_loads_once() {
        let cache = DirectoryCache::new(0);
        let first = cache.get_or_load(|| Ok(DirectoryData::default())).unwrap();
        let second = cache
            .get_or_load(|| Err(DirectoryError::Internal("should not reload".into())))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.loads().unwrap(), 1);
    }

    #[test]
    fn test_invalidate_reloads() {
        let cache = DirectoryCache::new(0);
        cache.get_or_load(|| Ok(DirectoryData::default())).unwrap();
        cache.invalidate().unwrap();
        cache.get_or_load(|| Ok(DirectoryData::default())).unwrap();
        assert_eq!(cache.loads().unwrap(), 2);
    }

    #[test]
    fn test_failed_load_keeps_nothing() {
        let cache = DirectoryCache::new(0);
        assert!(cache.get_or_load(|| Err(DirectoryError::Internal("down".into()))).is_err());
        cache.get_or_load(|| Ok(DirectoryData::default())).unwrap();
        assert_eq!(cache.loads().unwrap(), 1);
    }

    #[test]
    fn test_refresh_sees_external_changes() {
        let fx = fixture::fixture();
        assert!(!fx.svc.snapshot().unwrap().groups.contains_key("ops"));

        fx.ldap
            .bind(
                &dn_of("cn=ops,ou=groups"),
                &Attributes::new()
                    .with("objectClass", "groupOfUniqueNames")
                    .with("cn", "ops")
                    .with("uniqueMember", "uid=none"),
            )
            .unwrap();
        assert!(!fx.svc.snapshot().unwrap().groups.contains_key("ops"));
        assert!(fx.svc.refresh().unwrap().groups.contains_key("ops"));
    }
}
