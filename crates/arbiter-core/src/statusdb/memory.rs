//! Shared in-memory status store for tests.
//!
//! Clones share the same backing maps, so several `Synchronizer`s (one
//! per simulated host) can talk through one store exactly like peers
//! sharing a database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{BadnessRow, StatusRow, StatusStore, StoreError};

type Key = (String, u32, String);

#[derive(Debug, Default)]
struct Inner {
    status: HashMap<Key, StatusRow>,
    badness: HashMap<Key, BadnessRow>,
    failing: bool,
}

/// In-memory implementation of [`StatusStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStatusStore {
    inner: Arc<Mutex<Inner>>,
}

fn key(hostname: &str, uid: u32, sync_group: &str) -> Key {
    (hostname.to_string(), uid, sync_group.to_string())
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a database outage: every call fails until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().unwrap().failing = failing;
    }

    /// Seeds a status row directly (test setup).
    pub fn insert_status(&self, row: StatusRow) {
        let k = key(&row.hostname, row.uid, &row.sync_group);
        self.inner.lock().unwrap().status.insert(k, row);
    }

    pub fn status_rows(&self) -> Vec<StatusRow> {
        self.inner.lock().unwrap().status.values().cloned().collect()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.inner.lock().unwrap().failing {
            return Err(StoreError::Query("simulated outage".to_string()));
        }
        Ok(())
    }
}

impl StatusStore for MemoryStatusStore {
    fn upsert(&mut self, status: &StatusRow, badness: &BadnessRow) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().unwrap();
        inner.status.insert(
            key(&status.hostname, status.uid, &status.sync_group),
            status.clone(),
        );
        inner.badness.insert(
            key(&badness.hostname, badness.uid, &badness.sync_group),
            badness.clone(),
        );
        Ok(())
    }

    fn peer_rows(
        &mut self,
        sync_group: &str,
        uids: &[u32],
        exclude_hostname: &str,
    ) -> Result<Vec<StatusRow>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .status
            .values()
            .filter(|r| {
                r.sync_group == sync_group
                    && r.hostname != exclude_hostname
                    && uids.contains(&r.uid)
            })
            .cloned()
            .collect())
    }

    fn host_rows(
        &mut self,
        hostname: &str,
        sync_group: &str,
        newer_than: i64,
    ) -> Result<Vec<(StatusRow, Option<BadnessRow>)>, StoreError> {
        self.check()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .status
            .values()
            .filter(|r| {
                r.hostname == hostname && r.sync_group == sync_group && r.modified > newer_than
            })
            .map(|r| {
                let b = inner
                    .badness
                    .get(&key(&r.hostname, r.uid, &r.sync_group))
                    .cloned();
                (r.clone(), b)
            })
            .collect())
    }
}
