//! Prebuilt login-node fixtures for collector, enforcer, and engine tests.
//!
//! The builders write the same path layout the real collector reads:
//! `/sys/fs/cgroup/{systemd,cpuacct,cpu,memory}/user.slice/user-<uid>.slice`
//! plus `/proc/<pid>/{stat,status}` and the passwd/meminfo/cpuinfo files.

use super::filesystem::MockFs;

const CGROUP: &str = "/sys/fs/cgroup";

fn stat_line(pid: u32, comm: &str, utime: u64, stime: u64, starttime: u64) -> String {
    format!(
        "{pid} ({comm}) S 1 {pid} {pid} 0 -1 4194304 120 0 3 0 {utime} {stime} 0 0 20 0 1 0 \
         {starttime} 22020096 1250 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 1 0 0 0 0 0 \
         0 0 0 0 0 0 0 0"
    )
}

fn status_content(
    pid: u32,
    comm: &str,
    uid: u32,
    gid: u32,
    vmrss_kb: u64,
    rss_file_kb: u64,
    rss_shmem_kb: u64,
) -> String {
    format!(
        "Name:\t{comm}\nUmask:\t0022\nState:\tS (sleeping)\nPid:\t{pid}\nPPid:\t1\n\
         Uid:\t{uid}\t{uid}\t{uid}\t{uid}\nGid:\t{gid}\t{gid}\t{gid}\t{gid}\n\
         VmPeak:\t{peak} kB\nVmSize:\t{peak} kB\nVmRSS:\t{vmrss_kb} kB\n\
         RssAnon:\t{anon} kB\nRssFile:\t{rss_file_kb} kB\nRssShmem:\t{rss_shmem_kb} kB\n",
        peak = vmrss_kb + 4096,
        anon = vmrss_kb.saturating_sub(rss_file_kb + rss_shmem_kb),
    )
}

impl MockFs {
    /// Adds `/proc/<pid>/{stat,status}` for one process.
    #[allow(clippy::too_many_arguments)]
    pub fn add_process(
        &self,
        pid: u32,
        comm: &str,
        uid: u32,
        utime_ticks: u64,
        stime_ticks: u64,
        vmrss_kb: u64,
        rss_file_kb: u64,
        rss_shmem_kb: u64,
    ) {
        let base = format!("/proc/{pid}");
        self.add_dir(&base);
        self.add_file(
            format!("{base}/stat"),
            stat_line(pid, comm, utime_ticks, stime_ticks, 1000 + u64::from(pid)),
        );
        self.add_file(
            format!("{base}/status"),
            status_content(pid, comm, uid, uid, vmrss_kb, rss_file_kb, rss_shmem_kb),
        );
    }

    /// Updates the CPU tick counters of an existing process.
    pub fn advance_process(&self, pid: u32, comm: &str, utime_ticks: u64, stime_ticks: u64) {
        self.add_file(
            format!("/proc/{pid}/stat"),
            stat_line(pid, comm, utime_ticks, stime_ticks, 1000 + u64::from(pid)),
        );
    }

    /// Creates the systemd/cpuacct/cpu/memory slice directories for one
    /// user and lists `pids` in its `cgroup.procs`.
    pub fn add_user_slice(&self, uid: u32, pids: &[u32]) {
        let slice = format!("user-{uid}.slice");
        let procs: String = pids.iter().map(|p| format!("{p}\n")).collect();
        self.add_file(
            format!("{CGROUP}/systemd/user.slice/{slice}/cgroup.procs"),
            procs,
        );
        for controller in ["cpuacct", "cpu", "memory"] {
            self.add_dir(format!("{CGROUP}/{controller}/user.slice/{slice}"));
        }
        self.set_cpuacct(uid, 0, 0);
        self.set_memory_stat(uid, 0, 0);
        self.set_memsw_usage(uid, 0);
        self.add_file(
            format!("{CGROUP}/cpu/user.slice/{slice}/cpu.cfs_period_us"),
            "100000\n",
        );
        self.add_file(
            format!("{CGROUP}/cpu/user.slice/{slice}/cpu.cfs_quota_us"),
            "-1\n",
        );
        self.add_file(
            format!("{CGROUP}/memory/user.slice/{slice}/memory.limit_in_bytes"),
            "9223372036854771712\n",
        );
        self.add_file(
            format!("{CGROUP}/memory/user.slice/{slice}/memory.memsw.limit_in_bytes"),
            "9223372036854771712\n",
        );
    }

    /// Removes every cgroup trace of a user (logout).
    pub fn remove_user_slice(&self, uid: u32) {
        for controller in ["systemd", "cpuacct", "cpu", "memory"] {
            self.remove_tree(format!("{CGROUP}/{controller}/user.slice/user-{uid}.slice"));
        }
    }

    /// Sets the cpuacct counters (nanoseconds) for a user slice.
    pub fn set_cpuacct(&self, uid: u32, user_ns: u64, sys_ns: u64) {
        let dir = format!("{CGROUP}/cpuacct/user.slice/user-{uid}.slice");
        self.add_file(format!("{dir}/cpuacct.usage_user"), format!("{user_ns}\n"));
        self.add_file(format!("{dir}/cpuacct.usage_sys"), format!("{sys_ns}\n"));
    }

    /// Sets `memory.stat` totals (bytes) for a user slice.
    pub fn set_memory_stat(&self, uid: u32, total_rss: u64, total_mapped_file: u64) {
        let dir = format!("{CGROUP}/memory/user.slice/user-{uid}.slice");
        self.add_file(
            format!("{dir}/memory.stat"),
            format!(
                "cache {total_mapped_file}\nrss {total_rss}\nmapped_file {total_mapped_file}\n\
                 swap 0\ntotal_cache {total_mapped_file}\ntotal_rss {total_rss}\n\
                 total_mapped_file {total_mapped_file}\ntotal_swap 0\n"
            ),
        );
    }

    /// Sets the memsw usage counter (bytes) for a user slice.
    pub fn set_memsw_usage(&self, uid: u32, bytes: u64) {
        self.add_file(
            format!("{CGROUP}/memory/user.slice/user-{uid}.slice/memory.memsw.usage_in_bytes"),
            format!("{bytes}\n"),
        );
    }

    /// A small interactive login node:
    ///
    /// - daemon account `arbiter` (979:979), `/proc/self/status` to match
    /// - `alice` (1000) running pid 4001, `bob` (1001) running pid 4002
    /// - 2 cores, 1 thread per core, 16 GiB of memory
    pub fn login_node() -> Self {
        let fs = Self::new();

        fs.add_file(
            "/etc/passwd",
            "root:x:0:0:root:/root:/bin/bash\n\
             arbiter:x:979:979:arbiter daemon:/var/lib/arbiter:/usr/sbin/nologin\n\
             alice:x:1000:1000:Alice:/home/alice:/bin/bash\n\
             bob:x:1001:1001:Bob:/home/bob:/bin/bash\n",
        );
        fs.add_file(
            "/proc/self/status",
            "Name:\tarbiterd\nPid:\t900\nUid:\t979\t979\t979\t979\nGid:\t979\t979\t979\t979\n",
        );
        fs.add_file("/proc/meminfo", "MemTotal:       16777216 kB\nMemFree:         8388608 kB\n");
        fs.add_file(
            "/proc/cpuinfo",
            "processor\t: 0\nmodel name\t: mock\nsiblings\t: 2\ncpu cores\t: 2\n\n\
             processor\t: 1\nmodel name\t: mock\nsiblings\t: 2\ncpu cores\t: 2\n\n",
        );
        fs.add_file("/proc/self/smaps_rollup", "Rss:                1024 kB\nPss:                 512 kB\n");

        fs.add_user_slice(1000, &[4001]);
        fs.add_process(4001, "python3", 1000, 0, 0, 204800, 10240, 0);

        fs.add_user_slice(1001, &[4002]);
        fs.add_process(4002, "stress", 1001, 0, 0, 102400, 2048, 0);

        fs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::traits::FileSystem;
    use std::path::Path;

    #[test]
    fn test_login_node_layout() {
        let fs = MockFs::login_node();

        assert!(fs.exists(Path::new(
            "/sys/fs/cgroup/systemd/user.slice/user-1000.slice/cgroup.procs"
        )));
        assert!(fs.exists(Path::new(
            "/sys/fs/cgroup/cpuacct/user.slice/user-1001.slice/cpuacct.usage_user"
        )));
        assert!(fs.exists(Path::new("/proc/4001/stat")));

        fs.remove_user_slice(1000);
        assert!(!fs.exists(Path::new(
            "/sys/fs/cgroup/systemd/user.slice/user-1000.slice"
        )));
        // The other user is untouched.
        assert!(fs.exists(Path::new(
            "/sys/fs/cgroup/systemd/user.slice/user-1001.slice"
        )));
    }

    #[test]
    fn test_advance_process_only_touches_stat() {
        let fs = MockFs::login_node();
        let before = fs.read_to_string(Path::new("/proc/4001/status")).unwrap();

        fs.advance_process(4001, "python3", 500, 100);
        let stat = fs.read_to_string(Path::new("/proc/4001/stat")).unwrap();
        assert!(stat.contains(" 500 100 "));
        assert_eq!(
            fs.read_to_string(Path::new("/proc/4001/status")).unwrap(),
            before
        );
    }
}
