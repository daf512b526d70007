//! Parsers for `/proc` files.
//!
//! These are pure functions that parse file contents into structured data.
//! They are designed to be easily testable with string inputs.

use std::collections::HashMap;

/// Error type for parsing failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// The fields of `/proc/[pid]/stat` this daemon cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PidStat {
    pub pid: u32,
    /// Kernel comm, truncated to 15 bytes.
    pub comm: String,
    /// User-mode CPU time in clock ticks.
    pub utime: u64,
    /// Kernel-mode CPU time in clock ticks.
    pub stime: u64,
    /// Time the process started after boot, in clock ticks. Distinguishes
    /// a reused pid from the process previously seen under that number.
    pub starttime: u64,
}

/// Parses `/proc/[pid]/stat` content.
///
/// The comm field can contain spaces and parentheses, so the field split
/// happens after locating the last `)`.
pub fn parse_pid_stat(content: &str) -> Result<PidStat, ParseError> {
    let content = content.trim();

    let open_paren = content
        .find('(')
        .ok_or_else(|| ParseError::new("missing '(' in stat"))?;
    let close_paren = content
        .rfind(')')
        .ok_or_else(|| ParseError::new("missing ')' in stat"))?;
    if close_paren <= open_paren {
        return Err(ParseError::new("invalid parentheses in stat"));
    }

    let pid: u32 = content[..open_paren]
        .trim()
        .parse()
        .map_err(|_| ParseError::new("invalid pid"))?;

    let mut comm = content[open_paren + 1..close_paren].to_string();
    comm.truncate(15);

    let fields: Vec<&str> = content[close_paren + 1..].split_whitespace().collect();
    if fields.len() < 22 {
        return Err(ParseError::new(format!(
            "not enough fields in stat: expected 22+, got {}",
            fields.len()
        )));
    }

    let parse_u64 = |idx: usize, name: &str| -> Result<u64, ParseError> {
        fields[idx]
            .parse()
            .map_err(|_| ParseError::new(format!("invalid {}", name)))
    };

    Ok(PidStat {
        pid,
        comm,
        utime: parse_u64(11, "utime")?,
        stime: parse_u64(12, "stime")?,
        starttime: parse_u64(19, "starttime")?,
    })
}

/// The fields of `/proc/[pid]/status` this daemon cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PidStatus {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub vm_rss_kb: u64,
    pub rss_file_kb: u64,
    pub rss_shmem_kb: u64,
}

/// Parses `/proc/[pid]/status` content (key:\tvalue lines).
pub fn parse_pid_status(content: &str) -> Result<PidStatus, ParseError> {
    let mut fields: HashMap<&str, &str> = HashMap::new();
    for line in content.lines() {
        if let Some((key, value)) = line.split_once(':') {
            fields.insert(key.trim(), value.trim());
        }
    }

    let first_id = |key: &str| -> u32 {
        fields
            .get(key)
            .and_then(|s| s.split_whitespace().next())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    };
    let parse_kb = |key: &str| -> u64 {
        fields
            .get(key)
            .and_then(|s| s.split_whitespace().next())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    };

    Ok(PidStatus {
        name: fields.get("Name").unwrap_or(&"").to_string(),
        uid: first_id("Uid"),
        gid: first_id("Gid"),
        vm_rss_kb: parse_kb("VmRSS"),
        rss_file_kb: parse_kb("RssFile"),
        rss_shmem_kb: parse_kb("RssShmem"),
    })
}

/// Sums the `Pss:` lines of `/proc/[pid]/smaps_rollup` (or `smaps`),
/// returning kilobytes. The rollup file has a single line; plain smaps has
/// one per mapping.
pub fn parse_smaps_pss(content: &str) -> u64 {
    content
        .lines()
        .filter(|l| l.starts_with("Pss:"))
        .filter_map(|l| l.split_whitespace().nth(1))
        .filter_map(|v| v.parse::<u64>().ok())
        .sum()
}

/// Machine memory from `/proc/meminfo`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemInfo {
    pub mem_total_kb: u64,
}

/// Parses `/proc/meminfo` content.
pub fn parse_meminfo(content: &str) -> Result<MemInfo, ParseError> {
    let mut info = MemInfo::default();
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            info.mem_total_kb = rest
                .split_whitespace()
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
        }
    }
    if info.mem_total_kb == 0 {
        return Err(ParseError::new("missing MemTotal in meminfo"));
    }
    Ok(info)
}

/// CPU topology from `/proc/cpuinfo`.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuTopology {
    /// Number of logical CPUs (processor entries).
    pub logical_cpus: u32,
    /// SMT factor: siblings per physical core.
    pub threads_per_core: u32,
}

impl Default for CpuTopology {
    fn default() -> Self {
        Self {
            logical_cpus: 1,
            threads_per_core: 1,
        }
    }
}

/// Parses `/proc/cpuinfo` content.
///
/// `threads_per_core` is derived from the first `siblings` / `cpu cores`
/// pair; both default to 1 when absent (some virtualized guests omit them).
pub fn parse_cpuinfo(content: &str) -> CpuTopology {
    let mut logical = 0u32;
    let mut siblings = 0u32;
    let mut cores = 0u32;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "processor" => logical += 1,
            "siblings" if siblings == 0 => siblings = value.parse().unwrap_or(0),
            "cpu cores" if cores == 0 => cores = value.parse().unwrap_or(0),
            _ => {}
        }
    }

    let threads_per_core = if siblings > 0 && cores > 0 {
        (siblings / cores).max(1)
    } else {
        1
    };

    CpuTopology {
        logical_cpus: logical.max(1),
        threads_per_core,
    }
}

/// One `/etc/passwd` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PasswdEntry {
    pub username: String,
    pub gid: u32,
}

/// Parses `/etc/passwd` content into a uid → entry map.
///
/// Format: username:password:uid:gid:gecos:home:shell
pub fn parse_passwd(content: &str) -> HashMap<u32, PasswdEntry> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 4
            && let Ok(uid) = parts[2].parse::<u32>()
            && let Ok(gid) = parts[3].parse::<u32>()
        {
            map.insert(
                uid,
                PasswdEntry {
                    username: parts[0].to_string(),
                    gid,
                },
            );
        }
    }
    map
}

/// Resolver for uid → (username, primary gid).
#[derive(Debug, Clone, Default)]
pub struct UserResolver {
    entries: HashMap<u32, PasswdEntry>,
}

impl UserResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads user mappings from /etc/passwd content, replacing any
    /// previous contents.
    pub fn load_from_content(&mut self, content: &str) {
        self.entries = parse_passwd(content);
    }

    pub fn entry(&self, uid: u32) -> Option<&PasswdEntry> {
        self.entries.get(&uid)
    }

    /// Resolves uid to username, falling back to the uid rendered as a
    /// string for accounts that are not in passwd (LDAP hiccups).
    pub fn username(&self, uid: u32) -> String {
        self.entries
            .get(&uid)
            .map(|e| e.username.clone())
            .unwrap_or_else(|| uid.to_string())
    }

    pub fn is_loaded(&self) -> bool {
        !self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pid_stat_basic() {
        let content = "1234 (bash) S 1233 1234 1234 34816 1235 4194304 5000 50000 10 20 100 50 200 100 20 0 1 0 100000 25000000 2000 18446744073709551615 0 0 0 0 0 0 65536 3670020 1266777851 0 0 0 17 2 0 0 5 0 0 0 0 0 0 0 0 0 0";
        let stat = parse_pid_stat(content).unwrap();

        assert_eq!(stat.pid, 1234);
        assert_eq!(stat.comm, "bash");
        assert_eq!(stat.utime, 100);
        assert_eq!(stat.stime, 50);
        assert_eq!(stat.starttime, 100000);
    }

    #[test]
    fn test_parse_pid_stat_with_spaces_and_parens_in_comm() {
        let content = "5001 (Web (Content)) S 1 5001 5001 0 -1 4194304 1000 0 0 0 10 5 0 0 20 0 1 0 500100 10000000 1000 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0";
        let stat = parse_pid_stat(content).unwrap();

        assert_eq!(stat.pid, 5001);
        assert_eq!(stat.comm, "Web (Content)");
        assert_eq!(stat.utime, 10);
    }

    #[test]
    fn test_parse_pid_stat_truncates_comm() {
        let content = "42 (averyveryverylongname) S 1 42 42 0 -1 4194304 0 0 0 0 1 2 0 0 20 0 1 0 100 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0";
        let stat = parse_pid_stat(content).unwrap();
        assert_eq!(stat.comm.len(), 15);
        assert_eq!(stat.comm, "averyveryverylo");
    }

    #[test]
    fn test_parse_pid_stat_short_file() {
        assert!(parse_pid_stat("99 (x) S 1 99").is_err());
        assert!(parse_pid_stat("").is_err());
    }

    #[test]
    fn test_parse_pid_status() {
        let content = "Name:\tpython3\nPid:\t4001\nPPid:\t1\nUid:\t1000\t1000\t1000\t1000\nGid:\t1000\t1000\t1000\t1000\nVmRSS:\t  204800 kB\nRssFile:\t  10240 kB\nRssShmem:\t   512 kB\n";
        let status = parse_pid_status(content).unwrap();

        assert_eq!(status.name, "python3");
        assert_eq!(status.uid, 1000);
        assert_eq!(status.gid, 1000);
        assert_eq!(status.vm_rss_kb, 204800);
        assert_eq!(status.rss_file_kb, 10240);
        assert_eq!(status.rss_shmem_kb, 512);
    }

    #[test]
    fn test_parse_smaps_pss() {
        let content = "Rss:                1024 kB\nPss:                 300 kB\nShared_Clean:          0 kB\nPss:                 200 kB\n";
        assert_eq!(parse_smaps_pss(content), 500);
        assert_eq!(parse_smaps_pss(""), 0);
    }

    #[test]
    fn test_parse_meminfo() {
        let info = parse_meminfo("MemTotal:       16777216 kB\nMemFree:  1 kB\n").unwrap();
        assert_eq!(info.mem_total_kb, 16777216);
        assert!(parse_meminfo("MemFree: 1 kB\n").is_err());
    }

    #[test]
    fn test_parse_cpuinfo_smt() {
        let content = "processor\t: 0\nsiblings\t: 4\ncpu cores\t: 2\n\nprocessor\t: 1\nsiblings\t: 4\ncpu cores\t: 2\n\nprocessor\t: 2\n\nprocessor\t: 3\n";
        let topo = parse_cpuinfo(content);
        assert_eq!(topo.logical_cpus, 4);
        assert_eq!(topo.threads_per_core, 2);
    }

    #[test]
    fn test_parse_cpuinfo_missing_topology_fields() {
        let topo = parse_cpuinfo("processor\t: 0\n");
        assert_eq!(topo.logical_cpus, 1);
        assert_eq!(topo.threads_per_core, 1);
    }

    #[test]
    fn test_user_resolver() {
        let mut resolver = UserResolver::new();
        resolver.load_from_content(
            "root:x:0:0:root:/root:/bin/bash\nalice:x:1000:1000:Alice:/home/alice:/bin/bash\n",
        );

        assert_eq!(resolver.username(0), "root");
        assert_eq!(resolver.username(1000), "alice");
        assert_eq!(resolver.entry(1000).unwrap().gid, 1000);
        assert_eq!(resolver.username(9999), "9999");
        assert!(resolver.is_loaded());
    }
}
