//! Quota enforcement against the cgroup filesystem.
//!
//! Writes are idempotent: every file is read first and only written when
//! the on-disk value differs, so an unchanged status produces no
//! filesystem traffic at all. A slice that vanishes mid-write is a user
//! logging out, not an error.

use std::io;
use std::path::Path;

use tracing::{debug, warn};

use crate::collector::cgroup::CgroupPaths;
use crate::collector::traits::FileSystem;
use crate::status::Quota;

/// CFS period written for every tracked user: one second.
pub const CFS_PERIOD_US: i64 = 1_000_000;

/// Value written to quota files to lift a limit.
pub const UNLIMITED: i64 = -1;

/// memory.limit_in_bytes reports roughly i64::MAX (page-rounded) when
/// unlimited; anything at or above this counts as "no limit".
const MEM_UNLIMITED_FLOOR: i64 = 0x7FFF_FFFF_FFFF_F000;

/// Error type for enforcement failures that persist for a present cgroup.
#[derive(Debug)]
pub enum EnforceError {
    Write(std::path::PathBuf, io::Error),
}

impl std::fmt::Display for EnforceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnforceError::Write(path, e) => {
                write!(f, "failed to write {}: {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for EnforceError {}

/// Capability for making a quota file writable before a retry.
///
/// The production implementation shells out through sudo; the library
/// default does nothing and lets the write fail.
pub trait PermissionHelper: Send {
    fn make_writable(&self, path: &Path) -> io::Result<()>;
}

/// Helper that never repairs anything.
pub struct NoopPermissionHelper;

impl PermissionHelper for NoopPermissionHelper {
    fn make_writable(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}

/// Writes status quotas into the cgroup filesystem.
pub struct Enforcer<F: FileSystem> {
    fs: F,
    paths: CgroupPaths,
    /// Read-only mode: log what would change, write nothing.
    debug_mode: bool,
    memsw: bool,
    helper: Box<dyn PermissionHelper>,
}

impl<F: FileSystem> Enforcer<F> {
    pub fn new(fs: F, paths: CgroupPaths, debug_mode: bool, memsw: bool) -> Self {
        Self {
            fs,
            paths,
            debug_mode,
            memsw,
            helper: Box::new(NoopPermissionHelper),
        }
    }

    pub fn with_permission_helper(mut self, helper: Box<dyn PermissionHelper>) -> Self {
        self.helper = helper;
        self
    }

    pub fn set_permission_helper(&mut self, helper: Box<dyn PermissionHelper>) {
        self.helper = helper;
    }

    /// Makes the on-disk quota files of one user match `quota`.
    ///
    /// Returns `Ok` without touching anything when the user's slice is
    /// gone. Write failures for a present slice surface as an error; the
    /// caller logs and retries next tick.
    pub fn apply(&self, uid: u32, quota: &Quota) -> Result<(), EnforceError> {
        if !self.paths.slice_exists(&self.fs, uid) {
            debug!(uid, "slice gone, skipping enforcement");
            return Ok(());
        }

        let cpu_quota_us = if quota.cpu_pct <= 0.0 {
            UNLIMITED
        } else {
            (quota.cpu_pct * 10_000.0).round() as i64
        };
        let mem_limit = if quota.mem_bytes == 0 {
            UNLIMITED
        } else {
            quota.mem_bytes as i64
        };

        self.ensure(&self.paths.cpu_cfs_period(uid), CFS_PERIOD_US, false)?;
        self.ensure(&self.paths.cpu_cfs_quota(uid), cpu_quota_us, false)?;
        self.ensure(&self.paths.memory_limit(uid), mem_limit, true)?;
        if self.memsw {
            self.ensure(&self.paths.memsw_limit(uid), mem_limit, true)?;
        }
        Ok(())
    }

    /// Reads a quota file and rewrites it only when the value differs.
    fn ensure(&self, path: &Path, desired: i64, is_memory: bool) -> Result<(), EnforceError> {
        let current = match self.fs.read_to_string(path) {
            Ok(content) => content.trim().parse::<i64>().ok(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(_) => None,
        };

        if let Some(current) = current {
            let matches = if is_memory && desired == UNLIMITED {
                current >= MEM_UNLIMITED_FLOOR
            } else {
                current == desired
            };
            if matches {
                return Ok(());
            }
        }

        if self.debug_mode {
            debug!(path = %path.display(), desired, "debug mode: quota write suppressed");
            return Ok(());
        }

        let value = desired.to_string();
        match self.fs.write(path, &value) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                if let Err(fix) = self.helper.make_writable(path) {
                    warn!(path = %path.display(), error = %fix, "permission repair failed");
                }
                match self.fs.write(path, &value) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(EnforceError::Write(path.to_path_buf(), e)),
                }
            }
            Err(e) => Err(EnforceError::Write(path.to_path_buf(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    fn enforcer(fs: &MockFs, debug_mode: bool, memsw: bool) -> Enforcer<MockFs> {
        Enforcer::new(
            fs.clone(),
            CgroupPaths::new(CgroupPaths::DEFAULT_BASE),
            debug_mode,
            memsw,
        )
    }

    fn quota() -> Quota {
        Quota {
            cpu_pct: 200.0,
            mem_bytes: 2 << 30,
        }
    }

    #[test]
    fn test_apply_writes_expected_values() {
        let fs = MockFs::login_node();
        let e = enforcer(&fs, false, false);

        e.apply(1000, &quota()).unwrap();

        let base = "/sys/fs/cgroup";
        assert_eq!(
            fs.contents(format!("{base}/cpu/user.slice/user-1000.slice/cpu.cfs_period_us"))
                .unwrap(),
            "1000000"
        );
        assert_eq!(
            fs.contents(format!("{base}/cpu/user.slice/user-1000.slice/cpu.cfs_quota_us"))
                .unwrap(),
            "2000000"
        );
        assert_eq!(
            fs.contents(format!(
                "{base}/memory/user.slice/user-1000.slice/memory.limit_in_bytes"
            ))
            .unwrap(),
            (2i64 << 30).to_string()
        );
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let fs = MockFs::login_node();
        let e = enforcer(&fs, false, true);

        e.apply(1000, &quota()).unwrap();
        let first_pass = fs.write_log().len();
        assert!(first_pass > 0);

        e.apply(1000, &quota()).unwrap();
        assert_eq!(fs.write_log().len(), first_pass);
    }

    #[test]
    fn test_unlimited_quota_writes_minus_one_once() {
        let fs = MockFs::login_node();
        let e = enforcer(&fs, false, false);

        // Fixture starts at -1 cpu and unlimited memory, but the kernel
        // default period (100000) still gets asserted to one second.
        e.apply(
            1000,
            &Quota {
                cpu_pct: 0.0,
                mem_bytes: 0,
            },
        )
        .unwrap();
        let log = fs.write_log();
        assert_eq!(log.len(), 1);
        assert!(log[0].0.ends_with("cpu.cfs_period_us"));

        // After a limit was set, lifting it writes -1.
        e.apply(1000, &quota()).unwrap();
        fs.clear_write_log();
        e.apply(
            1000,
            &Quota {
                cpu_pct: 0.0,
                mem_bytes: 0,
            },
        )
        .unwrap();
        let log = fs.write_log();
        assert!(log.iter().all(|(_, v)| v == "-1"));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_memsw_limit_written_alongside() {
        let fs = MockFs::login_node();
        let e = enforcer(&fs, false, true);

        e.apply(1000, &quota()).unwrap();
        let memsw = fs
            .contents("/sys/fs/cgroup/memory/user.slice/user-1000.slice/memory.memsw.limit_in_bytes")
            .unwrap();
        assert_eq!(memsw, (2i64 << 30).to_string());
    }

    #[test]
    fn test_debug_mode_never_writes() {
        let fs = MockFs::login_node();
        let e = enforcer(&fs, true, true);

        e.apply(1000, &quota()).unwrap();
        assert!(fs.write_log().is_empty());
    }

    #[test]
    fn test_vanished_slice_is_soft() {
        let fs = MockFs::login_node();
        let e = enforcer(&fs, false, false);

        fs.remove_user_slice(1000);
        assert!(e.apply(1000, &quota()).is_ok());
        assert!(fs.write_log().is_empty());
    }
}
