//! The collector: user discovery, counter deltas, sample emission.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::collector::cgroup::{CgroupPaths, CgroupReader};
use crate::collector::procfs::{
    self, CLK_TCK, CpuTopology, UserResolver, parse_cpuinfo, parse_meminfo, parse_pid_stat,
    parse_pid_status, parse_smaps_pss,
};
use crate::collector::traits::FileSystem;
use crate::model::{ProcSample, UsageSample};

/// Error type for collection failures that are fatal at startup.
///
/// Mid-run failures never surface as errors; individual identifiers are
/// silently dropped for the tick instead.
#[derive(Debug)]
pub enum CollectError {
    /// A required cgroup hierarchy is not mounted.
    MissingHierarchy(PathBuf),
    /// PSS accounting was requested but smaps is not readable.
    PssUnavailable(String),
    /// I/O error outside the per-identifier soft-failure paths.
    Io(io::Error),
}

impl std::fmt::Display for CollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectError::MissingHierarchy(p) => {
                write!(f, "cgroup hierarchy missing: {}", p.display())
            }
            CollectError::PssUnavailable(msg) => write!(f, "pss accounting unavailable: {}", msg),
            CollectError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for CollectError {}

impl From<io::Error> for CollectError {
    fn from(e: io::Error) -> Self {
        CollectError::Io(e)
    }
}

/// Collection knobs threaded in from the configuration.
#[derive(Debug, Clone)]
pub struct CollectorParams {
    /// Base path to the proc filesystem (usually "/proc").
    pub proc_path: String,
    /// Users below this uid are never tracked.
    pub min_uid: u32,
    /// Account shared pages proportionally for heavy file/shmem mappers.
    pub pss: bool,
    /// RssFile + RssShmem bytes above which PSS is consulted.
    pub pss_threshold: u64,
    /// Read the memory+swap counter instead of memory.stat totals.
    pub memsw: bool,
}

impl Default for CollectorParams {
    fn default() -> Self {
        Self {
            proc_path: "/proc".to_string(),
            min_uid: 1000,
            pss: false,
            pss_threshold: 4 * 1024 * 1024,
            memsw: false,
        }
    }
}

/// One user's sample for one sub-tick.
#[derive(Debug, Clone)]
pub struct UserSample {
    pub uid: u32,
    pub username: String,
    pub gid: u32,
    pub sample: UsageSample,
}

/// The result of one collection sweep.
#[derive(Debug, Clone, Default)]
pub struct Sweep {
    /// Uids whose slice was present at enumeration, monitored or not yet
    /// rate-resolved. Drives registry retirement.
    pub active: BTreeSet<u32>,
    pub samples: Vec<UserSample>,
}

#[derive(Debug, Clone, Copy)]
struct CgroupPrev {
    cpu_ns: u64,
    mono: f64,
}

#[derive(Debug, Clone, Copy)]
struct PidPrev {
    ticks: u64,
    starttime: u64,
    mono: f64,
}

/// Collects per-user cgroup usage and per-process usage.
pub struct Collector<F: FileSystem + Clone> {
    fs: F,
    cgroup: CgroupReader<F>,
    params: CollectorParams,
    resolver: UserResolver,
    /// The daemon's own primary gid; accounts sharing it are service
    /// accounts and are never tracked.
    own_gid: u32,
    prev_cgroup: HashMap<u32, CgroupPrev>,
    prev_pid: HashMap<u32, PidPrev>,
}

impl<F: FileSystem + Clone> Collector<F> {
    pub fn new(fs: F, cgroup_base: &str, params: CollectorParams) -> Self {
        let mut resolver = UserResolver::new();
        if let Ok(content) = fs.read_to_string(Path::new("/etc/passwd")) {
            resolver.load_from_content(&content);
        }

        let own_gid = fs
            .read_to_string(&Path::new(&params.proc_path).join("self/status"))
            .ok()
            .and_then(|c| parse_pid_status(&c).ok())
            .map(|s| s.gid)
            .unwrap_or(0);

        let cgroup = CgroupReader::new(fs.clone(), CgroupPaths::new(cgroup_base));
        Self {
            fs,
            cgroup,
            params,
            resolver,
            own_gid,
            prev_cgroup: HashMap::new(),
            prev_pid: HashMap::new(),
        }
    }

    pub fn cgroup_paths(&self) -> &CgroupPaths {
        self.cgroup.paths()
    }

    pub fn resolver(&self) -> &UserResolver {
        &self.resolver
    }

    /// Verifies at startup that per-user accounting hierarchies exist.
    pub fn verify_accounting(&self) -> Result<(), CollectError> {
        for path in self.cgroup.paths().required_hierarchies() {
            if !self.fs.exists(&path) {
                return Err(CollectError::MissingHierarchy(path));
            }
        }
        Ok(())
    }

    /// Verifies at startup that PSS can actually be read. Permission
    /// errors here are fatal (running without CAP_SYS_PTRACE); the same
    /// errors mid-run degrade to RSS per process instead.
    pub fn probe_pss(&self) -> Result<(), CollectError> {
        if !self.params.pss {
            return Ok(());
        }
        let base = Path::new(&self.params.proc_path).join("self");
        for name in ["smaps_rollup", "smaps"] {
            match self.fs.read_to_string(&base.join(name)) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    return Err(CollectError::PssUnavailable(e.to_string()));
                }
                Err(_) => continue,
            }
        }
        Err(CollectError::PssUnavailable(
            "neither smaps_rollup nor smaps is readable".to_string(),
        ))
    }

    /// Reads the CPU topology (for quota division by SMT siblings and the
    /// node-wide high-usage watcher).
    pub fn topology(&self) -> CpuTopology {
        self.fs
            .read_to_string(&Path::new(&self.params.proc_path).join("cpuinfo"))
            .map(|c| parse_cpuinfo(&c))
            .unwrap_or_default()
    }

    /// Total machine memory in bytes.
    pub fn mem_total_bytes(&self) -> u64 {
        self.fs
            .read_to_string(&Path::new(&self.params.proc_path).join("meminfo"))
            .ok()
            .and_then(|c| parse_meminfo(&c).ok())
            .map(|m| m.mem_total_kb * 1024)
            .unwrap_or(0)
    }

    /// Performs one collection sweep.
    ///
    /// `now_wall` stamps the emitted samples; `now_mono` (seconds from an
    /// arbitrary monotonic origin) is what rates are computed against.
    pub fn sample(&mut self, now_wall: i64, now_mono: f64) -> Sweep {
        let mut sweep = Sweep::default();
        let mut seen_pids: BTreeSet<u32> = BTreeSet::new();
        let mut reloaded_passwd = false;

        for uid in self.cgroup.active_uids() {
            if uid < self.params.min_uid {
                continue;
            }

            // Sessions can belong to accounts created after startup.
            if self.resolver.entry(uid).is_none() && !reloaded_passwd {
                reloaded_passwd = true;
                if let Ok(content) = self.fs.read_to_string(Path::new("/etc/passwd")) {
                    self.resolver.load_from_content(&content);
                }
            }
            let (username, gid) = match self.resolver.entry(uid) {
                Some(e) => (e.username.clone(), e.gid),
                None => (uid.to_string(), u32::MAX),
            };
            if gid == self.own_gid {
                continue;
            }

            sweep.active.insert(uid);

            let cpu_pct = self.cgroup_cpu_pct(uid, now_mono);
            let mem_bytes = self.cgroup.memory_bytes(uid, self.params.memsw);

            let procs = self
                .cgroup
                .procs(uid)
                .map(|pids| self.sample_pids(&pids, now_mono, &mut seen_pids))
                .unwrap_or_default();

            // Both axes must have resolved, otherwise the whole sample for
            // this user is dropped for the sub-tick.
            let (Some(cpu_pct), Some(mem_bytes)) = (cpu_pct, mem_bytes) else {
                debug!(uid, "no rate-resolved sample this sub-tick");
                continue;
            };

            sweep.samples.push(UserSample {
                uid,
                username,
                gid,
                sample: UsageSample {
                    ts: now_wall,
                    cpu_pct,
                    mem_bytes,
                    procs,
                },
            });
        }

        self.prev_cgroup.retain(|uid, _| sweep.active.contains(uid));
        self.prev_pid.retain(|pid, _| seen_pids.contains(pid));

        sweep
    }

    /// Rate-resolves the cgroup CPU counter. `None` until two reads exist
    /// or when the counter regressed (slice deleted and recreated).
    fn cgroup_cpu_pct(&mut self, uid: u32, now_mono: f64) -> Option<f64> {
        let cpu_ns = self.cgroup.cpu_ns(uid)?;
        let prev = self.prev_cgroup.insert(
            uid,
            CgroupPrev {
                cpu_ns,
                mono: now_mono,
            },
        )?;

        let dt = now_mono - prev.mono;
        if cpu_ns < prev.cpu_ns || dt <= 0.0 {
            return None;
        }
        Some(100.0 * (cpu_ns - prev.cpu_ns) as f64 / (dt * 1e9))
    }

    fn sample_pids(
        &mut self,
        pids: &[u32],
        now_mono: f64,
        seen: &mut BTreeSet<u32>,
    ) -> Vec<ProcSample> {
        let mut out = Vec::new();
        for &pid in pids {
            seen.insert(pid);
            if let Some(proc_sample) = self.sample_pid(pid, now_mono) {
                out.push(proc_sample);
            }
        }
        out
    }

    /// Samples one pid; `None` drops it for this sub-tick (vanished,
    /// first sighting, or reused pid number).
    fn sample_pid(&mut self, pid: u32, now_mono: f64) -> Option<ProcSample> {
        let base = Path::new(&self.params.proc_path).join(pid.to_string());

        let stat = parse_pid_stat(&self.fs.read_to_string(&base.join("stat")).ok()?).ok()?;
        let status = parse_pid_status(&self.fs.read_to_string(&base.join("status")).ok()?).ok()?;

        let ticks = stat.utime + stat.stime;
        let prev = self.prev_pid.insert(
            pid,
            PidPrev {
                ticks,
                starttime: stat.starttime,
                mono: now_mono,
            },
        )?;

        // A different starttime means the pid number was reused for a new
        // process; a regressed counter means the same. Either way the
        // datum is dropped, never extrapolated.
        if prev.starttime != stat.starttime || ticks < prev.ticks {
            return None;
        }
        let dt = now_mono - prev.mono;
        if dt <= 0.0 {
            return None;
        }
        let cpu_pct = 100.0 * ((ticks - prev.ticks) as f64 / CLK_TCK as f64) / dt;

        Some(ProcSample {
            pid,
            name: stat.comm,
            uid_owner: status.uid,
            cpu_pct,
            mem_bytes: self.pid_mem_bytes(&base, &status),
        })
    }

    fn pid_mem_bytes(&self, base: &Path, status: &procfs::PidStatus) -> u64 {
        let rss = status.vm_rss_kb * 1024;
        if !self.params.pss {
            return rss;
        }
        let shared = (status.rss_file_kb + status.rss_shmem_kb) * 1024;
        if shared < self.params.pss_threshold {
            return rss;
        }
        for name in ["smaps_rollup", "smaps"] {
            if let Ok(content) = self.fs.read_to_string(&base.join(name)) {
                return parse_smaps_pss(&content) * 1024;
            }
        }
        rss
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    fn collector(fs: &MockFs) -> Collector<MockFs> {
        Collector::new(
            fs.clone(),
            CgroupPaths::DEFAULT_BASE,
            CollectorParams::default(),
        )
    }

    #[test]
    fn test_first_sweep_emits_nothing() {
        let fs = MockFs::login_node();
        let mut c = collector(&fs);

        let sweep = c.sample(0, 0.0);
        assert!(sweep.samples.is_empty());
        assert_eq!(sweep.active.len(), 2);
    }

    #[test]
    fn test_second_sweep_resolves_rates() {
        let fs = MockFs::login_node();
        let mut c = collector(&fs);
        c.sample(0, 0.0);

        // 5 s later: alice burned 10 s of CPU across the slice (200%),
        // her process 500 ticks (100%).
        fs.set_cpuacct(1000, 10_000_000_000, 0);
        fs.set_memory_stat(1000, 1_073_741_824, 0);
        fs.advance_process(4001, "python3", 500, 0);

        let sweep = c.sample(5, 5.0);
        let alice = sweep.samples.iter().find(|s| s.uid == 1000).unwrap();
        assert_eq!(alice.username, "alice");
        assert!((alice.sample.cpu_pct - 200.0).abs() < 0.01);
        assert_eq!(alice.sample.mem_bytes, 1_073_741_824);

        assert_eq!(alice.sample.procs.len(), 1);
        let p = &alice.sample.procs[0];
        assert_eq!(p.pid, 4001);
        assert_eq!(p.name, "python3");
        assert_eq!(p.uid_owner, 1000);
        assert!((p.cpu_pct - 100.0).abs() < 0.01);
        assert_eq!(p.mem_bytes, 204800 * 1024);
    }

    #[test]
    fn test_counter_regression_drops_sample() {
        let fs = MockFs::login_node();
        let mut c = collector(&fs);
        c.sample(0, 0.0);

        fs.set_cpuacct(1000, 10_000_000_000, 0);
        c.sample(5, 5.0);

        // Slice recreated: counter went backwards.
        fs.set_cpuacct(1000, 1_000_000, 0);
        let sweep = c.sample(10, 10.0);
        assert!(sweep.samples.iter().all(|s| s.uid != 1000));

        // Next sweep rates from the new baseline, no inflated value.
        fs.set_cpuacct(1000, 5_001_000_000, 0);
        let sweep = c.sample(15, 15.0);
        let alice = sweep.samples.iter().find(|s| s.uid == 1000).unwrap();
        assert!((alice.sample.cpu_pct - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_pid_reuse_is_dropped() {
        let fs = MockFs::login_node();
        let mut c = collector(&fs);
        c.sample(0, 0.0);

        fs.set_cpuacct(1000, 1_000_000_000, 0);
        // Same pid number, different starttime (new process).
        fs.add_file(
            "/proc/4001/stat",
            "4001 (python3) S 1 4001 4001 0 -1 4194304 120 0 3 0 200 0 0 0 20 0 1 0 9999 22020096 1250 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 1 0 0 0 0 0 0 0 0 0 0 0 0 0",
        );

        let sweep = c.sample(5, 5.0);
        let alice = sweep.samples.iter().find(|s| s.uid == 1000).unwrap();
        assert!(alice.sample.procs.is_empty());
    }

    #[test]
    fn test_vanished_user_missing_from_sweep() {
        let fs = MockFs::login_node();
        let mut c = collector(&fs);
        c.sample(0, 0.0);

        fs.remove_user_slice(1001);
        let sweep = c.sample(5, 5.0);
        assert!(!sweep.active.contains(&1001));
        assert!(sweep.samples.iter().all(|s| s.uid != 1001));
    }

    #[test]
    fn test_service_accounts_are_skipped() {
        let fs = MockFs::login_node();
        // A session slice for the daemon's own service account (gid 979)
        // and one below min_uid.
        fs.add_user_slice(979, &[]);
        fs.add_file(
            "/etc/passwd",
            "root:x:0:0::/root:/bin/bash\n\
             arbiter:x:979:979::/var/lib/arbiter:/usr/sbin/nologin\n\
             svc:x:1500:979::/srv:/usr/sbin/nologin\n\
             alice:x:1000:1000::/home/alice:/bin/bash\n\
             bob:x:1001:1001::/home/bob:/bin/bash\n",
        );
        fs.add_user_slice(1500, &[]);

        let mut c = collector(&fs);
        let sweep = c.sample(0, 0.0);
        // 979 fails min_uid; 1500 shares the daemon's primary group.
        assert_eq!(
            sweep.active.iter().copied().collect::<Vec<_>>(),
            vec![1000, 1001]
        );
    }

    #[test]
    fn test_verify_accounting() {
        let fs = MockFs::login_node();
        assert!(collector(&fs).verify_accounting().is_ok());

        let bare = MockFs::new();
        bare.add_dir("/proc");
        let err = collector(&bare).verify_accounting().unwrap_err();
        assert!(matches!(err, CollectError::MissingHierarchy(_)));
    }

    #[test]
    fn test_pss_gate_uses_threshold() {
        let fs = MockFs::login_node();
        let params = CollectorParams {
            pss: true,
            ..CollectorParams::default()
        };
        let mut c = Collector::new(fs.clone(), CgroupPaths::DEFAULT_BASE, params);

        // alice's pid 4001 has RssFile 10240 kB (10 MiB ≥ threshold) and
        // a smaps_rollup reporting 50 MiB PSS.
        fs.add_file("/proc/4001/smaps_rollup", "Pss:             51200 kB\n");

        c.sample(0, 0.0);
        fs.set_cpuacct(1000, 1_000_000_000, 0);
        fs.advance_process(4001, "python3", 100, 0);
        fs.set_cpuacct(1001, 1_000_000_000, 0);
        fs.advance_process(4002, "stress", 100, 0);

        let sweep = c.sample(5, 5.0);
        let alice = sweep.samples.iter().find(|s| s.uid == 1000).unwrap();
        assert_eq!(alice.sample.procs[0].mem_bytes, 51200 * 1024);

        // bob's pid 4002 is below the shared-page threshold: plain RSS.
        let bob = sweep.samples.iter().find(|s| s.uid == 1001).unwrap();
        assert_eq!(bob.sample.procs[0].mem_bytes, 102400 * 1024);
    }
}
