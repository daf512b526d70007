//! Postgres implementation of the status store.
//!
//! Connection handling mirrors the rest of the fleet's tooling: connect
//! lazily, remember the last error for the log, drop the client on any
//! query failure and reconnect on the next tick. `connect_timeout` and a
//! server-side `statement_timeout` keep one sync round bounded to a few
//! seconds even when the database is struggling.

use std::time::Duration;

use postgres::{Client, NoTls};
use tracing::{debug, info};

use super::{BadnessRow, StatusRow, StatusStore, StoreError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const STATEMENT_TIMEOUT_MS: u32 = 5_000;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS status (
    hostname TEXT NOT NULL,
    uid BIGINT NOT NULL,
    sync_group TEXT NOT NULL,
    current_status TEXT NOT NULL,
    default_status TEXT NOT NULL,
    occurrences INT NOT NULL,
    penalty_expiry BIGINT,
    occur_expiry BIGINT,
    authority TEXT,
    modified BIGINT NOT NULL,
    PRIMARY KEY (hostname, uid, sync_group)
);
CREATE TABLE IF NOT EXISTS badness (
    hostname TEXT NOT NULL,
    uid BIGINT NOT NULL,
    sync_group TEXT NOT NULL,
    cpu_score DOUBLE PRECISION NOT NULL,
    mem_score DOUBLE PRECISION NOT NULL,
    expiry BIGINT NOT NULL,
    modified BIGINT NOT NULL,
    PRIMARY KEY (hostname, uid, sync_group)
);";

/// Postgres-backed [`StatusStore`].
pub struct PostgresStatusStore {
    url: String,
    client: Option<Client>,
    last_error: Option<String>,
}

impl PostgresStatusStore {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: None,
            last_error: None,
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Connects and ensures the v2 schema exists. Called lazily by every
    /// store operation, and eagerly once at startup by the daemon so a
    /// misconfigured URL is loud.
    pub fn try_connect(&mut self) -> Result<(), StoreError> {
        if self.client.is_some() {
            return Ok(());
        }

        let mut config: postgres::Config = self.url.parse().map_err(|e| {
            StoreError::Connect(format!("invalid statusdb url: {e}"))
        })?;
        config
            .connect_timeout(CONNECT_TIMEOUT)
            .options(format!("-c statement_timeout={STATEMENT_TIMEOUT_MS}").as_str());

        let mut client = config
            .connect(NoTls)
            .map_err(|e| StoreError::Connect(e.to_string()))?;
        client
            .batch_execute(SCHEMA)
            .map_err(|e| StoreError::Query(e.to_string()))?;

        info!("connected to status store");
        self.client = Some(client);
        self.last_error = None;
        Ok(())
    }

    /// Runs an operation with a live client, dropping the connection on
    /// failure so the next tick reconnects from scratch.
    fn with_client<T>(
        &mut self,
        op: impl FnOnce(&mut Client) -> Result<T, postgres::Error>,
    ) -> Result<T, StoreError> {
        self.try_connect()?;
        let client = self.client.as_mut().ok_or_else(|| {
            StoreError::Connect("no client".to_string())
        })?;
        match op(client) {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!(error = %e, "statusdb query failed, dropping connection");
                self.last_error = Some(e.to_string());
                self.client = None;
                Err(StoreError::Query(e.to_string()))
            }
        }
    }
}

fn status_from_row(row: &postgres::Row) -> StatusRow {
    StatusRow {
        hostname: row.get("hostname"),
        uid: row.get::<_, i64>("uid") as u32,
        sync_group: row.get("sync_group"),
        current: row.get("current_status"),
        default_group: row.get("default_status"),
        occurrences: row.get::<_, i32>("occurrences").max(0) as u32,
        penalty_expiry: row.get("penalty_expiry"),
        occur_expiry: row.get("occur_expiry"),
        authority: row.get("authority"),
        modified: row.get("modified"),
    }
}

impl StatusStore for PostgresStatusStore {
    fn upsert(&mut self, status: &StatusRow, badness: &BadnessRow) -> Result<(), StoreError> {
        self.with_client(|client| {
            client.execute(
                "INSERT INTO status (hostname, uid, sync_group, current_status, default_status, \
                 occurrences, penalty_expiry, occur_expiry, authority, modified) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (hostname, uid, sync_group) DO UPDATE SET \
                 current_status = EXCLUDED.current_status, \
                 default_status = EXCLUDED.default_status, \
                 occurrences = EXCLUDED.occurrences, \
                 penalty_expiry = EXCLUDED.penalty_expiry, \
                 occur_expiry = EXCLUDED.occur_expiry, \
                 authority = EXCLUDED.authority, \
                 modified = EXCLUDED.modified",
                &[
                    &status.hostname,
                    &i64::from(status.uid),
                    &status.sync_group,
                    &status.current,
                    &status.default_group,
                    &(status.occurrences as i32),
                    &status.penalty_expiry,
                    &status.occur_expiry,
                    &status.authority,
                    &status.modified,
                ],
            )?;
            client.execute(
                "INSERT INTO badness (hostname, uid, sync_group, cpu_score, mem_score, expiry, \
                 modified) VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (hostname, uid, sync_group) DO UPDATE SET \
                 cpu_score = EXCLUDED.cpu_score, \
                 mem_score = EXCLUDED.mem_score, \
                 expiry = EXCLUDED.expiry, \
                 modified = EXCLUDED.modified",
                &[
                    &badness.hostname,
                    &i64::from(badness.uid),
                    &badness.sync_group,
                    &badness.cpu_score,
                    &badness.mem_score,
                    &badness.expiry,
                    &badness.modified,
                ],
            )?;
            Ok(())
        })
    }

    fn peer_rows(
        &mut self,
        sync_group: &str,
        uids: &[u32],
        exclude_hostname: &str,
    ) -> Result<Vec<StatusRow>, StoreError> {
        let uids: Vec<i64> = uids.iter().map(|&u| i64::from(u)).collect();
        self.with_client(|client| {
            let rows = client.query(
                "SELECT hostname, uid, sync_group, current_status, default_status, occurrences, \
                 penalty_expiry, occur_expiry, authority, modified \
                 FROM status \
                 WHERE sync_group = $1 AND hostname <> $2 AND uid = ANY($3)",
                &[&sync_group, &exclude_hostname, &uids],
            )?;
            Ok(rows.iter().map(status_from_row).collect())
        })
    }

    fn host_rows(
        &mut self,
        hostname: &str,
        sync_group: &str,
        newer_than: i64,
    ) -> Result<Vec<(StatusRow, Option<BadnessRow>)>, StoreError> {
        self.with_client(|client| {
            let rows = client.query(
                "SELECT s.hostname, s.uid, s.sync_group, s.current_status, s.default_status, \
                 s.occurrences, s.penalty_expiry, s.occur_expiry, s.authority, s.modified, \
                 b.cpu_score, b.mem_score, b.expiry AS b_expiry, b.modified AS b_modified \
                 FROM status s \
                 LEFT JOIN badness b \
                 ON b.hostname = s.hostname AND b.uid = s.uid AND b.sync_group = s.sync_group \
                 WHERE s.hostname = $1 AND s.sync_group = $2 AND s.modified > $3",
                &[&hostname, &sync_group, &newer_than],
            )?;
            Ok(rows
                .iter()
                .map(|row| {
                    let status = status_from_row(row);
                    let badness = row.get::<_, Option<f64>>("cpu_score").map(|cpu_score| {
                        BadnessRow {
                            hostname: status.hostname.clone(),
                            uid: status.uid,
                            sync_group: status.sync_group.clone(),
                            cpu_score,
                            mem_score: row.get::<_, Option<f64>>("mem_score").unwrap_or(0.0),
                            expiry: row.get::<_, Option<i64>>("b_expiry").unwrap_or(0),
                            modified: row.get::<_, Option<i64>>("b_modified").unwrap_or(0),
                        }
                    });
                    (status, badness)
                })
                .collect())
        })
    }
}
