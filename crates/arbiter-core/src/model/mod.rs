//! Data model for collected usage.
//!
//! - [`UsageSample`]: one instantaneous observation of a user slice
//! - [`Event`]: `poll` consecutive samples averaged into one record, with
//!   the whitelisted/accounted decomposition already applied
//! - [`EventRing`]: bounded per-user history of events

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// One process observed in one sample.
///
/// `cpu_pct` is already rate-resolved: the collector only emits a process
/// once it has two reads of the same pid with non-decreasing counters.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcSample {
    pub pid: u32,
    /// Kernel comm, at most 15 bytes.
    pub name: String,
    pub uid_owner: u32,
    pub cpu_pct: f64,
    pub mem_bytes: u64,
}

/// One moment of observed consumption for a single user slice.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageSample {
    /// Wall-clock seconds since the epoch.
    pub ts: i64,
    /// Cgroup-level CPU usage, percent of one core (100.0 == one core).
    pub cpu_pct: f64,
    /// Cgroup-level memory usage in bytes.
    pub mem_bytes: u64,
    pub procs: Vec<ProcSample>,
}

/// One process inside one averaged event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessUsage {
    pub pid: u32,
    /// Kernel comm, at most 15 bytes.
    pub name: String,
    pub uid_owner: u32,
    pub cpu_pct: f64,
    pub mem_bytes: u64,
    pub whitelisted: bool,
}

/// Averaged usage over one sub-interval.
///
/// The accounted totals are what feed the scorer; the whitelisted totals
/// exist for reporting. Both include the "other processes" mass (the
/// nonnegative gap between cgroup usage and the per-process sum), assigned
/// to one bucket or the other at aggregation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub ts_start: i64,
    pub ts_end: i64,
    /// Cgroup-level CPU usage, percent of one core.
    pub cpu_pct: f64,
    /// Cgroup-level memory usage in bytes.
    pub mem_bytes: u64,
    pub procs: Vec<ProcessUsage>,
    pub accounted_cpu_pct: f64,
    pub accounted_mem_bytes: u64,
    pub whitelisted_cpu_pct: f64,
    pub whitelisted_mem_bytes: u64,
}

/// Bounded ring of the most recent events for one user.
///
/// Pushing beyond capacity evicts the oldest event.
#[derive(Debug, Clone)]
pub struct EventRing {
    events: VecDeque<Event>,
    cap: usize,
}

impl EventRing {
    pub fn new(cap: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(cap.max(1)),
            cap: cap.max(1),
        }
    }

    pub fn push(&mut self, event: Event) {
        if self.events.len() == self.cap {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Most recently pushed event.
    pub fn latest(&self) -> Option<&Event> {
        self.events.back()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// Copies the ring contents, oldest first. Used when handing history
    /// to the notifier and the historical log at a status transition.
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.iter().cloned().collect()
    }
}
