//! The shared SQL status store and cross-node synchronization.
//!
//! Every instance in a sync group upserts its per-user status and badness
//! rows each tick, reads the rows its peers wrote, and adopts a peer's
//! state when reconciliation says it wins. All store access goes through
//! the [`StatusStore`] trait; production uses Postgres, tests use the
//! shared in-memory store.

pub mod memory;
pub mod postgres;
pub mod reconcile;

use tracing::{debug, info, warn};

use crate::badness::Badness;
use crate::status::{Policy, Status};
use crate::user::{UserRegistry, UserSlice};

/// One host's status row for one user (the v2 schema, keyed by
/// hostname + uid + sync_group).
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRow {
    pub hostname: String,
    pub uid: u32,
    pub sync_group: String,
    pub current: String,
    pub default_group: String,
    pub occurrences: u32,
    pub penalty_expiry: Option<i64>,
    pub occur_expiry: Option<i64>,
    pub authority: Option<String>,
    pub modified: i64,
}

/// One host's badness row for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct BadnessRow {
    pub hostname: String,
    pub uid: u32,
    pub sync_group: String,
    pub cpu_score: f64,
    pub mem_score: f64,
    pub expiry: i64,
    pub modified: i64,
}

/// Error type for status-store round trips. Any error skips the sync
/// phase for the tick; local state keeps evolving.
#[derive(Debug)]
pub enum StoreError {
    Connect(String),
    Query(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Connect(msg) => write!(f, "statusdb connect: {}", msg),
            StoreError::Query(msg) => write!(f, "statusdb query: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Abstraction over the shared SQL store.
pub trait StatusStore: Send {
    /// Writes one user's rows (insert-or-update on the primary key).
    fn upsert(&mut self, status: &StatusRow, badness: &BadnessRow) -> Result<(), StoreError>;

    /// Rows other hosts wrote for the given uids in a sync group.
    fn peer_rows(
        &mut self,
        sync_group: &str,
        uids: &[u32],
        exclude_hostname: &str,
    ) -> Result<Vec<StatusRow>, StoreError>;

    /// This host's own rows, newer than the given timestamp. Used to
    /// rehydrate state across a restart.
    fn host_rows(
        &mut self,
        hostname: &str,
        sync_group: &str,
        newer_than: i64,
    ) -> Result<Vec<(StatusRow, Option<BadnessRow>)>, StoreError>;
}

/// Per-tick synchronization against the shared store.
pub struct Synchronizer {
    store: Box<dyn StatusStore>,
    hostname: String,
    sync_group: String,
    /// Rows older than this many seconds are ignored while reconciling
    /// and at bootstrap.
    stale_after: i64,
}

impl Synchronizer {
    pub fn new(
        store: Box<dyn StatusStore>,
        hostname: String,
        sync_group: String,
        stale_after: i64,
    ) -> Self {
        Self {
            store,
            hostname,
            sync_group,
            stale_after,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    fn rows_for(&self, slice: &UserSlice, now: i64) -> (StatusRow, BadnessRow) {
        let status = StatusRow {
            hostname: self.hostname.clone(),
            uid: slice.uid,
            sync_group: self.sync_group.clone(),
            current: slice.status.current.clone(),
            default_group: slice.status.default_group.clone(),
            occurrences: slice.status.occurrences,
            penalty_expiry: slice.status.penalty_expiry,
            occur_expiry: slice.status.occur_expiry,
            authority: slice.status.authority.clone(),
            // Status rows carry the last state-change time, not the
            // upsert time, so reconciliation converges on the latest
            // promotion instead of whoever wrote last.
            modified: slice.status.modified,
        };
        let badness = BadnessRow {
            hostname: self.hostname.clone(),
            uid: slice.uid,
            sync_group: self.sync_group.clone(),
            cpu_score: slice.badness.cpu,
            mem_score: slice.badness.mem,
            expiry: now + self.stale_after,
            modified: now,
        };
        (status, badness)
    }

    /// Upserts every tracked user's rows. Also the shutdown flush.
    pub fn push(&mut self, registry: &UserRegistry, now: i64) -> Result<(), StoreError> {
        for slice in registry.iter() {
            let (status, badness) = self.rows_for(slice, now);
            self.store.upsert(&status, &badness)?;
        }
        Ok(())
    }

    /// Runs one full sync round: push local rows, read peer rows, adopt
    /// winners. Returns the peer hostnames observed this tick so
    /// notifications can name every node the penalty applies on.
    ///
    /// Adoption is silent: notifications only originate on the authority
    /// host at the original transition.
    pub fn sync(
        &mut self,
        registry: &mut UserRegistry,
        policy: &Policy,
        now: i64,
    ) -> Result<Vec<String>, StoreError> {
        self.push(registry, now)?;

        let uids = registry.uids();
        let peers = self
            .store
            .peer_rows(&self.sync_group, &uids, &self.hostname)?;

        let mut peer_hosts: Vec<String> = peers.iter().map(|r| r.hostname.clone()).collect();
        peer_hosts.sort();
        peer_hosts.dedup();

        for uid in uids {
            let Some(slice) = registry.get_mut(uid) else {
                continue;
            };
            let (local, _) = self.rows_for(slice, now);
            let candidates: Vec<&StatusRow> = std::iter::once(&local)
                .chain(peers.iter().filter(|r| r.uid == uid))
                .collect();

            let winner = reconcile::pick_winner(&candidates, now, self.stale_after, &|name| {
                policy.is_penalty(name)
            });
            if let Some(winner) = winner
                && winner.hostname != self.hostname
            {
                debug!(uid, winner = %winner.hostname, "adopting peer status");
                adopt(slice, winner, policy, now);
            }
        }

        Ok(peer_hosts)
    }

    /// Rehydrates registry state from this host's own recent rows.
    pub fn bootstrap(
        &mut self,
        registry: &mut UserRegistry,
        policy: &Policy,
        lookup: &dyn Fn(u32) -> (String, u32),
        now: i64,
    ) -> Result<usize, StoreError> {
        let rows = self
            .store
            .host_rows(&self.hostname, &self.sync_group, now - self.stale_after)?;
        let count = rows.len();

        for (status_row, badness_row) in rows {
            let (username, gid) = lookup(status_row.uid);
            let slice = registry.observe(status_row.uid, &username, gid, policy);
            slice.status = validated_status(&status_row, &slice.status, policy);
            if let Some(b) = badness_row
                && b.expiry > now
                && !slice.status.in_penalty(policy)
            {
                slice.badness = Badness {
                    cpu: b.cpu_score.clamp(0.0, 100.0),
                    mem: b.mem_score.clamp(0.0, 100.0),
                    last_updated: b.modified,
                };
            }
            slice.present = false;
        }
        if count > 0 {
            info!(count, "rehydrated user state from status store");
        }
        Ok(count)
    }
}

/// Replaces a slice's status with an adopted row, keeping the invariant
/// that penalized users carry zero badness.
fn adopt(slice: &mut UserSlice, row: &StatusRow, policy: &Policy, now: i64) {
    slice.status = validated_status(row, &slice.status, policy);
    if slice.status.in_penalty(policy) {
        slice.badness.reset(now);
    }
}

/// Builds a `Status` from a row, falling back to the locally computed
/// default for group names this configuration does not know (the peers
/// or a previous run were configured differently).
fn validated_status(row: &StatusRow, local: &Status, policy: &Policy) -> Status {
    let default_group = if policy.group(&row.default_group).is_some() {
        row.default_group.clone()
    } else {
        warn!(
            uid = row.uid,
            group = %row.default_group,
            "unknown default group in status row, using local default"
        );
        local.default_group.clone()
    };
    let current = if policy.is_known(&row.current) {
        row.current.clone()
    } else {
        warn!(
            uid = row.uid,
            status = %row.current,
            "unknown status in status row, using default"
        );
        default_group.clone()
    };
    // Penalty timers and the authority tag only make sense inside a
    // penalty; a fallback to the default group drops them.
    let in_penalty = policy.is_penalty(&current);
    Status {
        current,
        default_group,
        occurrences: row.occurrences.min(policy.penalties.len() as u32),
        penalty_expiry: row.penalty_expiry.filter(|_| in_penalty),
        occur_expiry: row.occur_expiry,
        authority: row.authority.clone().filter(|_| in_penalty),
        modified: row.modified,
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStatusStore;
    use super::*;
    use crate::status::tests::test_policy;

    fn synchronizer(store: &MemoryStatusStore, host: &str) -> Synchronizer {
        Synchronizer::new(
            Box::new(store.clone()),
            host.to_string(),
            "g".to_string(),
            3600,
        )
    }

    fn registry_with_user(uid: u32) -> UserRegistry {
        let policy = test_policy();
        let mut registry = UserRegistry::new(4);
        registry.observe(uid, "alice", uid, &policy);
        registry
    }

    #[test]
    fn test_push_then_bootstrap_roundtrip() {
        let policy = test_policy();
        let store = MemoryStatusStore::new();
        let mut sync = synchronizer(&store, "node1");

        let mut registry = registry_with_user(1000);
        {
            let slice = registry.get_mut(1000).unwrap();
            slice.status.occurrences = 2;
            slice.badness.cpu = 40.0;
        }
        sync.push(&registry, 100).unwrap();

        // A fresh process on the same host picks the state back up.
        let mut restored = UserRegistry::new(4);
        let mut sync2 = synchronizer(&store, "node1");
        let n = sync2
            .bootstrap(&mut restored, &policy, &|_| ("alice".to_string(), 1000), 200)
            .unwrap();
        assert_eq!(n, 1);
        let slice = restored.get(1000).unwrap();
        assert_eq!(slice.status.occurrences, 2);
        assert_eq!(slice.badness.cpu, 40.0);
    }

    #[test]
    fn test_bootstrap_ignores_stale_rows() {
        let policy = test_policy();
        let store = MemoryStatusStore::new();
        let mut sync = synchronizer(&store, "node1");

        let registry = registry_with_user(1000);
        sync.push(&registry, 100).unwrap();

        let mut restored = UserRegistry::new(4);
        let n = sync
            .bootstrap(
                &mut restored,
                &policy,
                &|_| ("alice".to_string(), 1000),
                100 + 3601,
            )
            .unwrap();
        assert_eq!(n, 0);
        assert!(restored.is_empty());
    }

    #[test]
    fn test_bootstrap_unknown_group_falls_back() {
        let policy = test_policy();
        let store = MemoryStatusStore::new();
        store.insert_status(StatusRow {
            hostname: "node1".to_string(),
            uid: 1000,
            sync_group: "g".to_string(),
            current: "retired-tier".to_string(),
            default_group: "normal".to_string(),
            occurrences: 1,
            penalty_expiry: Some(10_000),
            occur_expiry: None,
            authority: Some("node1".to_string()),
            modified: 90,
        });

        let mut sync = synchronizer(&store, "node1");
        let mut registry = UserRegistry::new(4);
        sync.bootstrap(&mut registry, &policy, &|_| ("alice".to_string(), 1000), 100)
            .unwrap();

        let slice = registry.get(1000).unwrap();
        assert_eq!(slice.status.current, "normal");
        assert_eq!(slice.status.occurrences, 1);
    }

    #[test]
    fn test_split_brain_converges_to_later_promotion() {
        let policy = test_policy();
        let store = MemoryStatusStore::new();
        let mut sync_a = synchronizer(&store, "hostA");
        let mut sync_b = synchronizer(&store, "hostB");

        // Both hosts promoted the same user within one tick; B was later.
        let mut reg_a = registry_with_user(1000);
        {
            let slice = reg_a.get_mut(1000).unwrap();
            slice.status.current = "penalty1".to_string();
            slice.status.occurrences = 1;
            slice.status.penalty_expiry = Some(1800);
            slice.status.authority = Some("hostA".to_string());
            slice.status.modified = 100;
        }
        let mut reg_b = registry_with_user(1000);
        {
            let slice = reg_b.get_mut(1000).unwrap();
            slice.status.current = "penalty1".to_string();
            slice.status.occurrences = 1;
            slice.status.penalty_expiry = Some(1801);
            slice.status.authority = Some("hostB".to_string());
            slice.status.modified = 101;
        }

        sync_a.sync(&mut reg_a, &policy, 100).unwrap();
        let peers_b = sync_b.sync(&mut reg_b, &policy, 101).unwrap();
        assert_eq!(peers_b, vec!["hostA".to_string()]);
        // B's own row is newer; B keeps its state.
        assert_eq!(
            reg_b.get(1000).unwrap().status.authority.as_deref(),
            Some("hostB")
        );

        // A's next round sees B's newer row and adopts it wholesale.
        sync_a.sync(&mut reg_a, &policy, 102).unwrap();
        let status = &reg_a.get(1000).unwrap().status;
        assert_eq!(status.authority.as_deref(), Some("hostB"));
        assert_eq!(status.penalty_expiry, Some(1801));
    }

    #[test]
    fn test_sync_group_converges_after_one_round() {
        let policy = test_policy();
        let store = MemoryStatusStore::new();

        // Three hosts with divergent views of the same user.
        let mut hosts: Vec<(Synchronizer, UserRegistry)> = ["h1", "h2", "h3"]
            .into_iter()
            .map(|host| (synchronizer(&store, host), registry_with_user(1000)))
            .collect();
        {
            let slice = hosts[1].1.get_mut(1000).unwrap();
            slice.status.current = "penalty1".to_string();
            slice.status.occurrences = 1;
            slice.status.penalty_expiry = Some(5000);
            slice.status.authority = Some("h2".to_string());
            slice.status.modified = 50;
        }

        // One full round makes every host's in-memory state identical;
        // rows in the store catch up at the next round's push.
        for round in 0..2 {
            for (sync, registry) in hosts.iter_mut() {
                sync.sync(registry, &policy, 100 + round).unwrap();
            }
        }
        for (_, registry) in &hosts {
            let status = &registry.get(1000).unwrap().status;
            assert_eq!(status.current, "penalty1");
            assert_eq!(status.authority.as_deref(), Some("h2"));
        }

        for (sync, registry) in hosts.iter_mut() {
            sync.sync(registry, &policy, 102).unwrap();
        }
        let rows = store.status_rows();
        assert_eq!(rows.len(), 3);
        for row in &rows {
            assert_eq!(row.current, "penalty1");
            assert_eq!(row.occurrences, 1);
            assert_eq!(row.penalty_expiry, Some(5000));
            assert_eq!(row.authority.as_deref(), Some("h2"));
            assert_eq!(row.modified, 50);
        }
    }

    #[test]
    fn test_adoption_of_penalty_resets_badness() {
        let policy = test_policy();
        let store = MemoryStatusStore::new();
        store.insert_status(StatusRow {
            hostname: "hostB".to_string(),
            uid: 1000,
            sync_group: "g".to_string(),
            current: "penalty2".to_string(),
            default_group: "normal".to_string(),
            occurrences: 2,
            penalty_expiry: Some(10_000),
            occur_expiry: None,
            authority: Some("hostB".to_string()),
            modified: 99,
        });

        let mut sync = synchronizer(&store, "hostA");
        let mut registry = registry_with_user(1000);
        registry.get_mut(1000).unwrap().badness.cpu = 60.0;

        sync.sync(&mut registry, &policy, 100).unwrap();
        let slice = registry.get(1000).unwrap();
        assert_eq!(slice.status.current, "penalty2");
        assert_eq!(slice.status.occurrences, 2);
        assert!(slice.badness.is_zero());
    }

    #[test]
    fn test_store_outage_skips_tick() {
        let policy = test_policy();
        let store = MemoryStatusStore::new();
        let mut sync = synchronizer(&store, "node1");
        let mut registry = registry_with_user(1000);

        store.set_failing(true);
        assert!(sync.sync(&mut registry, &policy, 100).is_err());
        // Local state untouched.
        assert_eq!(registry.get(1000).unwrap().status.current, "normal");

        store.set_failing(false);
        assert!(sync.sync(&mut registry, &policy, 105).is_ok());
    }
}
