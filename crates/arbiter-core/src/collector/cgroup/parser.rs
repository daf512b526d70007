//! Parsers for cgroup v1 files.

/// Memory totals from `memory.stat`.
///
/// The `total_*` lines include child cgroups (per-session scopes under the
/// user slice), which is what per-user accounting wants.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryStat {
    pub total_rss: u64,
    pub total_mapped_file: u64,
}

/// Parses `memory.stat` content (key value lines).
pub fn parse_memory_stat(content: &str) -> MemoryStat {
    let mut stat = MemoryStat::default();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value: u64 = value.parse().unwrap_or(0);
        match key {
            "total_rss" => stat.total_rss = value,
            "total_mapped_file" => stat.total_mapped_file = value,
            _ => {}
        }
    }
    stat
}

/// Parses `cgroup.procs` content: one pid per line.
pub fn parse_cgroup_procs(content: &str) -> Vec<u32> {
    content
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect()
}

/// Extracts the uid from a `user-<uid>.slice` directory name.
pub fn parse_slice_uid(name: &str) -> Option<u32> {
    name.strip_prefix("user-")?
        .strip_suffix(".slice")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_stat() {
        let content = "cache 268435456\nrss 1000\nmapped_file 500\n\
                       total_cache 268435456\ntotal_rss 1073741824\ntotal_mapped_file 268435456\n";
        let stat = parse_memory_stat(content);
        assert_eq!(stat.total_rss, 1_073_741_824);
        assert_eq!(stat.total_mapped_file, 268_435_456);
    }

    #[test]
    fn test_parse_memory_stat_missing_totals() {
        let stat = parse_memory_stat("rss 1000\n");
        assert_eq!(stat, MemoryStat::default());
    }

    #[test]
    fn test_parse_cgroup_procs() {
        assert_eq!(parse_cgroup_procs("101\n202\n\n303\n"), vec![101, 202, 303]);
        assert!(parse_cgroup_procs("").is_empty());
    }

    #[test]
    fn test_parse_slice_uid() {
        assert_eq!(parse_slice_uid("user-1000.slice"), Some(1000));
        assert_eq!(parse_slice_uid("user-0.slice"), Some(0));
        assert_eq!(parse_slice_uid("user.slice"), None);
        assert_eq!(parse_slice_uid("user-abc.slice"), None);
        assert_eq!(parse_slice_uid("session-4.scope"), None);
    }
}
