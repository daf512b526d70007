//! Cgroup v1 access for per-user slices.
//!
//! systemd places every logged-in user in `user.slice/user-<uid>.slice`
//! under each mounted controller. This module knows that layout and reads
//! the counters the collector needs; the quota files the enforcer writes
//! are addressed through [`CgroupPaths`] as well so both sides agree.

pub mod parser;

use std::path::{Path, PathBuf};

use crate::collector::traits::FileSystem;

/// Path layout of the cgroup v1 hierarchies for user slices.
#[derive(Debug, Clone)]
pub struct CgroupPaths {
    base: PathBuf,
}

impl CgroupPaths {
    pub const DEFAULT_BASE: &'static str = "/sys/fs/cgroup";

    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn slice_dir(&self, controller: &str, uid: u32) -> PathBuf {
        self.base
            .join(controller)
            .join("user.slice")
            .join(format!("user-{uid}.slice"))
    }

    /// Directory enumerated to discover active users.
    pub fn systemd_user_slice(&self) -> PathBuf {
        self.base.join("systemd").join("user.slice")
    }

    pub fn cgroup_procs(&self, uid: u32) -> PathBuf {
        self.slice_dir("systemd", uid).join("cgroup.procs")
    }

    pub fn cpuacct_usage_user(&self, uid: u32) -> PathBuf {
        self.slice_dir("cpuacct", uid).join("cpuacct.usage_user")
    }

    pub fn cpuacct_usage_sys(&self, uid: u32) -> PathBuf {
        self.slice_dir("cpuacct", uid).join("cpuacct.usage_sys")
    }

    pub fn memory_stat(&self, uid: u32) -> PathBuf {
        self.slice_dir("memory", uid).join("memory.stat")
    }

    pub fn memsw_usage(&self, uid: u32) -> PathBuf {
        self.slice_dir("memory", uid)
            .join("memory.memsw.usage_in_bytes")
    }

    pub fn cpu_cfs_period(&self, uid: u32) -> PathBuf {
        self.slice_dir("cpu", uid).join("cpu.cfs_period_us")
    }

    pub fn cpu_cfs_quota(&self, uid: u32) -> PathBuf {
        self.slice_dir("cpu", uid).join("cpu.cfs_quota_us")
    }

    pub fn memory_limit(&self, uid: u32) -> PathBuf {
        self.slice_dir("memory", uid).join("memory.limit_in_bytes")
    }

    pub fn memsw_limit(&self, uid: u32) -> PathBuf {
        self.slice_dir("memory", uid)
            .join("memory.memsw.limit_in_bytes")
    }

    /// The hierarchy roots that must exist for accounting to work.
    pub fn required_hierarchies(&self) -> [PathBuf; 3] {
        [
            self.base.join("systemd").join("user.slice"),
            self.base.join("cpuacct"),
            self.base.join("memory"),
        ]
    }

    /// Whether a user's slice is still present (any controller will do;
    /// systemd is the authority on session lifetime).
    pub fn slice_exists<F: FileSystem>(&self, fs: &F, uid: u32) -> bool {
        fs.exists(&self.slice_dir("systemd", uid))
    }
}

/// Reader for per-user cgroup counters.
///
/// Every accessor returns `Option`: a vanished slice or an unreadable file
/// yields `None` and the caller drops that datum for the tick.
pub struct CgroupReader<F: FileSystem> {
    fs: F,
    paths: CgroupPaths,
}

impl<F: FileSystem> CgroupReader<F> {
    pub fn new(fs: F, paths: CgroupPaths) -> Self {
        Self { fs, paths }
    }

    pub fn paths(&self) -> &CgroupPaths {
        &self.paths
    }

    /// Enumerates uids with an active `user-<uid>.slice`.
    pub fn active_uids(&self) -> Vec<u32> {
        let dir = self.paths.systemd_user_slice();
        let Ok(entries) = self.fs.read_dir(&dir) else {
            return Vec::new();
        };
        let mut uids: Vec<u32> = entries
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .filter_map(parser::parse_slice_uid)
            .collect();
        uids.sort_unstable();
        uids
    }

    /// Total CPU time (user + sys) of a user slice, in nanoseconds.
    pub fn cpu_ns(&self, uid: u32) -> Option<u64> {
        let user = self.read_counter(&self.paths.cpuacct_usage_user(uid))?;
        let sys = self.read_counter(&self.paths.cpuacct_usage_sys(uid))?;
        Some(user + sys)
    }

    /// Memory usage of a user slice in bytes: `total_rss +
    /// total_mapped_file`, or the memsw usage counter when `memsw` is set.
    pub fn memory_bytes(&self, uid: u32, memsw: bool) -> Option<u64> {
        if memsw {
            return self.read_counter(&self.paths.memsw_usage(uid));
        }
        let content = self.fs.read_to_string(&self.paths.memory_stat(uid)).ok()?;
        let stat = parser::parse_memory_stat(&content);
        Some(stat.total_rss + stat.total_mapped_file)
    }

    /// Pids currently in a user slice.
    pub fn procs(&self, uid: u32) -> Option<Vec<u32>> {
        let content = self.fs.read_to_string(&self.paths.cgroup_procs(uid)).ok()?;
        Some(parser::parse_cgroup_procs(&content))
    }

    fn read_counter(&self, path: &Path) -> Option<u64> {
        self.fs
            .read_to_string(path)
            .ok()
            .and_then(|c| c.trim().parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    #[test]
    fn test_active_uids() {
        let fs = MockFs::login_node();
        let reader = CgroupReader::new(fs.clone(), CgroupPaths::new(CgroupPaths::DEFAULT_BASE));

        assert_eq!(reader.active_uids(), vec![1000, 1001]);

        fs.remove_user_slice(1001);
        assert_eq!(reader.active_uids(), vec![1000]);
    }

    #[test]
    fn test_cpu_and_memory_counters() {
        let fs = MockFs::login_node();
        let reader = CgroupReader::new(fs.clone(), CgroupPaths::new(CgroupPaths::DEFAULT_BASE));

        fs.set_cpuacct(1000, 2_000_000_000, 500_000_000);
        fs.set_memory_stat(1000, 1_073_741_824, 268_435_456);

        assert_eq!(reader.cpu_ns(1000), Some(2_500_000_000));
        assert_eq!(reader.memory_bytes(1000, false), Some(1_342_177_280));
        assert_eq!(reader.procs(1000), Some(vec![4001]));
    }

    #[test]
    fn test_memsw_counter_substitutes() {
        let fs = MockFs::login_node();
        let reader = CgroupReader::new(fs.clone(), CgroupPaths::new(CgroupPaths::DEFAULT_BASE));

        fs.set_memsw_usage(1000, 2_147_483_648);
        assert_eq!(reader.memory_bytes(1000, true), Some(2_147_483_648));
        // Not configured for memsw: falls back to memory.stat totals.
        assert_eq!(reader.memory_bytes(1000, false), Some(0));
    }

    #[test]
    fn test_vanished_slice_is_none() {
        let fs = MockFs::login_node();
        let reader = CgroupReader::new(fs.clone(), CgroupPaths::new(CgroupPaths::DEFAULT_BASE));

        fs.remove_user_slice(1000);
        assert_eq!(reader.cpu_ns(1000), None);
        assert_eq!(reader.memory_bytes(1000, false), None);
        assert_eq!(reader.procs(1000), None);
    }
}
