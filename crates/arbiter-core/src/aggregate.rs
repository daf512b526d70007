//! Sub-sample aggregation.
//!
//! Averages `poll` consecutive [`UsageSample`]s into one [`Event`] and
//! applies the whitelist decomposition that decides what the scorer sees.

use std::collections::BTreeMap;

use crate::model::{Event, ProcessUsage, UsageSample};
use crate::whitelist::Whitelist;

/// Combines consecutive samples of one user into a single event.
///
/// Per-process figures are averaged over the whole window, so a process
/// present in only some sub-samples is weighted by its presence. The
/// "other processes" mass — the nonnegative gap between cgroup usage and
/// the per-process sum — lands in the whitelisted or accounted bucket
/// according to `whitelist_other`.
pub fn assemble(
    samples: &[UsageSample],
    whitelist: &Whitelist,
    group_patterns: &[String],
    whitelist_other: bool,
) -> Option<Event> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;

    let cpu_pct = samples.iter().map(|s| s.cpu_pct).sum::<f64>() / n;
    let mem_bytes = (samples.iter().map(|s| s.mem_bytes).sum::<u64>() as f64 / n) as u64;

    // Merge processes by pid across the window.
    let mut merged: BTreeMap<u32, ProcessUsage> = BTreeMap::new();
    for sample in samples {
        for p in &sample.procs {
            let entry = merged.entry(p.pid).or_insert_with(|| ProcessUsage {
                pid: p.pid,
                name: p.name.clone(),
                uid_owner: p.uid_owner,
                cpu_pct: 0.0,
                mem_bytes: 0,
                whitelisted: false,
            });
            entry.cpu_pct += p.cpu_pct;
            entry.mem_bytes += p.mem_bytes;
        }
    }

    let mut procs: Vec<ProcessUsage> = merged.into_values().collect();
    let mut proc_cpu = 0.0;
    let mut proc_mem = 0u64;
    let mut wl_cpu = 0.0;
    let mut wl_mem = 0u64;
    for p in &mut procs {
        p.cpu_pct /= n;
        p.mem_bytes = (p.mem_bytes as f64 / n) as u64;
        p.whitelisted = whitelist.matches(&p.name, p.uid_owner, group_patterns);
        proc_cpu += p.cpu_pct;
        proc_mem += p.mem_bytes;
        if p.whitelisted {
            wl_cpu += p.cpu_pct;
            wl_mem += p.mem_bytes;
        }
    }

    // The kernel accounts short-lived work the pid sweep missed.
    let other_cpu = (cpu_pct - proc_cpu).max(0.0);
    let other_mem = mem_bytes.saturating_sub(proc_mem);
    if whitelist_other {
        wl_cpu += other_cpu;
        wl_mem += other_mem;
    }

    let total_cpu = proc_cpu + other_cpu;
    let total_mem = proc_mem + other_mem;

    Some(Event {
        ts_start: samples.first().map(|s| s.ts).unwrap_or(0),
        ts_end: samples.last().map(|s| s.ts).unwrap_or(0),
        cpu_pct,
        mem_bytes,
        procs,
        accounted_cpu_pct: (total_cpu - wl_cpu).max(0.0),
        accounted_mem_bytes: total_mem.saturating_sub(wl_mem),
        whitelisted_cpu_pct: wl_cpu,
        whitelisted_mem_bytes: wl_mem,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProcSample;

    fn proc_sample(pid: u32, name: &str, uid: u32, cpu: f64, mem: u64) -> ProcSample {
        ProcSample {
            pid,
            name: name.to_string(),
            uid_owner: uid,
            cpu_pct: cpu,
            mem_bytes: mem,
        }
    }

    fn sample(ts: i64, cpu: f64, mem: u64, procs: Vec<ProcSample>) -> UsageSample {
        UsageSample {
            ts,
            cpu_pct: cpu,
            mem_bytes: mem,
            procs,
        }
    }

    #[test]
    fn test_empty_window() {
        let wl = Whitelist::default();
        assert!(assemble(&[], &wl, &[], true).is_none());
    }

    #[test]
    fn test_averages_across_window() {
        let wl = Whitelist::new([0], vec![]);
        let samples = vec![
            sample(0, 100.0, 1000, vec![proc_sample(10, "a", 1000, 100.0, 1000)]),
            sample(5, 300.0, 3000, vec![proc_sample(10, "a", 1000, 300.0, 3000)]),
        ];

        let event = assemble(&samples, &wl, &[], true).unwrap();
        assert_eq!(event.ts_start, 0);
        assert_eq!(event.ts_end, 5);
        assert!((event.cpu_pct - 200.0).abs() < 1e-9);
        assert_eq!(event.mem_bytes, 2000);
        assert_eq!(event.procs.len(), 1);
        assert!((event.procs[0].cpu_pct - 200.0).abs() < 1e-9);
        assert_eq!(event.procs[0].mem_bytes, 2000);
        assert!((event.accounted_cpu_pct - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_partial_presence_is_presence_weighted() {
        let wl = Whitelist::default();
        let samples = vec![
            sample(0, 100.0, 0, vec![proc_sample(10, "a", 1000, 100.0, 0)]),
            sample(5, 0.0, 0, vec![]),
        ];

        let event = assemble(&samples, &wl, &[], true).unwrap();
        assert!((event.procs[0].cpu_pct - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_whitelist_decomposition() {
        let wl = Whitelist::new([0], vec!["rsync*".to_string()]);
        let samples = vec![sample(
            0,
            300.0,
            3000,
            vec![
                proc_sample(10, "rsync", 1000, 100.0, 1000),
                proc_sample(11, "python3", 1000, 150.0, 1500),
                proc_sample(12, "sshd", 0, 25.0, 250),
            ],
        )];

        // other mass: cpu 300 - 275 = 25; mem 3000 - 2750 = 250.
        let event = assemble(&samples, &wl, &[], true).unwrap();
        assert!((event.whitelisted_cpu_pct - 150.0).abs() < 1e-9);
        assert_eq!(event.whitelisted_mem_bytes, 1500);
        assert!((event.accounted_cpu_pct - 150.0).abs() < 1e-9);
        assert_eq!(event.accounted_mem_bytes, 1500);

        // Same trace, other-processes mass accounted instead.
        let event = assemble(&samples, &wl, &[], false).unwrap();
        assert!((event.accounted_cpu_pct - 175.0).abs() < 1e-9);
        assert_eq!(event.accounted_mem_bytes, 1750);
    }

    #[test]
    fn test_cgroup_below_process_sum_clamps_other_to_zero() {
        let wl = Whitelist::default();
        let samples = vec![sample(
            0,
            90.0,
            500,
            vec![proc_sample(10, "a", 1000, 100.0, 1000)],
        )];

        let event = assemble(&samples, &wl, &[], true).unwrap();
        assert!((event.whitelisted_cpu_pct - 0.0).abs() < 1e-9);
        assert_eq!(event.whitelisted_mem_bytes, 0);
        assert!((event.accounted_cpu_pct - 100.0).abs() < 1e-9);
        assert_eq!(event.accounted_mem_bytes, 1000);
    }

    #[test]
    fn test_group_patterns_extend_whitelist() {
        let wl = Whitelist::new([], vec![]);
        let samples = vec![sample(
            0,
            100.0,
            0,
            vec![proc_sample(10, "matlab", 1000, 100.0, 0)],
        )];

        let accounted = assemble(&samples, &wl, &[], true).unwrap();
        assert!((accounted.accounted_cpu_pct - 100.0).abs() < 1e-9);

        let patterns = vec!["matlab".to_string()];
        let whitelisted = assemble(&samples, &wl, &patterns, true).unwrap();
        assert!((whitelisted.accounted_cpu_pct - 0.0).abs() < 1e-9);
    }
}
