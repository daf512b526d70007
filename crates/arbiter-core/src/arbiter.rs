//! The control cycle.
//!
//! [`Arbiter`] owns every phase of the loop and runs them in a fixed
//! order once per tick:
//!
//! 1. collect sub-samples (driven by the caller at the sub-tick cadence)
//! 2. aggregate `poll` sub-samples into events
//! 3. score badness from the latest event
//! 4. advance the status machine
//! 5. enforce quotas into cgroupfs
//! 6. synchronize with the shared status store
//! 7. notify and log transitions
//!
//! The daemon binary only paces the clock and forwards timestamps; all
//! decisions live here, which is what lets the whole cycle run against
//! `MockFs` and the in-memory status store in tests.

use tracing::{debug, info, warn};

use crate::aggregate;
use crate::badness::ScoreParams;
use crate::collector::{CollectError, Collector, FileSystem};
use crate::config::Config;
use crate::enforce::Enforcer;
use crate::model::Event;
use crate::notify::{
    DefaultHooks, HistoryLog, LogNotifier, Notification, Notifier, NotifyKind, NullHistory,
    SiteHooks,
};
use crate::status::{Policy, Status, Transition, advance};
use crate::statusdb::Synchronizer;
use crate::user::UserRegistry;
use crate::whitelist::Whitelist;

/// What one tick did, for the daemon's log line.
#[derive(Debug, Clone, Default)]
pub struct TickSummary {
    pub users: usize,
    pub penalized: usize,
    pub transitions: usize,
    pub peer_hosts: Vec<String>,
}

/// The assembled control loop.
pub struct Arbiter<F: FileSystem + Clone> {
    config: Config,
    policy: Policy,
    score_params: ScoreParams,
    whitelist: Whitelist,
    collector: Collector<F>,
    enforcer: Enforcer<F>,
    registry: UserRegistry,
    synchronizer: Option<Synchronizer>,
    notifier: Box<dyn Notifier>,
    history: Box<dyn HistoryLog>,
    hostname: String,
    subsamples: usize,
    events: usize,
    high_usage_last: Option<i64>,
    cpu_capacity_pct: f64,
    mem_total_bytes: u64,
}

impl<F: FileSystem + Clone> Arbiter<F> {
    /// Builds the loop from an immutable configuration.
    ///
    /// `cgroup_base` and `proc_path` are overridable for tests; production
    /// passes `CgroupPaths::DEFAULT_BASE` and `/proc`.
    pub fn new(config: Config, fs: F, cgroup_base: &str, proc_path: &str, hostname: String) -> Self {
        let collector = Collector::new(fs.clone(), cgroup_base, config.collector_params(proc_path));
        let topology = collector.topology();
        let policy = config.policy(topology.threads_per_core);
        let enforcer = Enforcer::new(
            fs,
            collector.cgroup_paths().clone(),
            config.general.debug_mode,
            config.memory.memsw,
        );
        let hooks: Box<dyn SiteHooks> = Box::new(DefaultHooks {
            domain: config.email.domain.clone(),
        });

        Self {
            score_params: config.score_params(),
            whitelist: config.whitelist(),
            registry: UserRegistry::new(config.badness.max_history_kept),
            cpu_capacity_pct: f64::from(topology.logical_cpus) * 100.0,
            mem_total_bytes: collector.mem_total_bytes(),
            policy,
            collector,
            enforcer,
            synchronizer: None,
            notifier: Box::new(LogNotifier::new(hooks)),
            history: Box::new(NullHistory),
            hostname,
            subsamples: 0,
            events: 0,
            high_usage_last: None,
            config,
        }
    }

    pub fn with_synchronizer(mut self, synchronizer: Synchronizer) -> Self {
        self.synchronizer = Some(synchronizer);
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_history(mut self, history: Box<dyn HistoryLog>) -> Self {
        self.history = history;
        self
    }

    pub fn with_permission_helper(
        mut self,
        helper: Box<dyn crate::enforce::PermissionHelper>,
    ) -> Self {
        self.enforcer.set_permission_helper(helper);
        self
    }

    pub fn registry(&self) -> &UserRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Startup verification: cgroup accounting present, PSS readable.
    pub fn verify(&self) -> Result<(), CollectError> {
        self.collector.verify_accounting()?;
        self.collector.probe_pss()
    }

    /// Rehydrates state from this host's rows in the status store.
    pub fn bootstrap(&mut self, now: i64) {
        let Some(sync) = self.synchronizer.as_mut() else {
            return;
        };
        let resolver = self.collector.resolver();
        let lookup = |uid: u32| {
            resolver
                .entry(uid)
                .map(|e| (e.username.clone(), e.gid))
                .unwrap_or_else(|| (uid.to_string(), uid))
        };
        match sync.bootstrap(&mut self.registry, &self.policy, &lookup, now) {
            Ok(_) => {}
            Err(e) => warn!(error = %e, "bootstrap from status store failed"),
        }
    }

    /// Upserts every tracked user once more so peers see a fresh
    /// `modified` timestamp. Called on the way out.
    pub fn final_flush(&mut self, now: i64) {
        if let Some(sync) = self.synchronizer.as_mut()
            && let Err(e) = sync.push(&self.registry, now)
        {
            warn!(error = %e, "final status store flush failed");
        }
    }

    /// One sub-tick: sweep the collector, maybe assemble events, maybe
    /// run the full control cycle. Returns a summary when a tick ran.
    pub fn sub_sample(&mut self, now_wall: i64, now_mono: f64) -> Option<TickSummary> {
        let sweep = self.collector.sample(now_wall, now_mono);
        for user_sample in sweep.samples {
            let slice = self.registry.observe(
                user_sample.uid,
                &user_sample.username,
                user_sample.gid,
                &self.policy,
            );
            slice.pending.push(user_sample.sample);
        }
        self.registry.update_presence(&sweep.active);

        self.subsamples += 1;
        if self.subsamples < self.config.general.poll {
            return None;
        }
        self.subsamples = 0;
        self.assemble_events();

        self.events += 1;
        if self.events < self.config.general.history_per_refresh {
            return None;
        }
        self.events = 0;
        Some(self.run_tick(now_wall))
    }

    /// Phase 2: turn each user's pending sub-samples into one event.
    fn assemble_events(&mut self) {
        let policy = &self.policy;
        let whitelist = &self.whitelist;
        let whitelist_other = self.config.processes.whitelist_other_processes;
        for slice in self.registry.iter_mut() {
            if slice.pending.is_empty() {
                continue;
            }
            let patterns = group_patterns(policy, &slice.status);
            if let Some(event) =
                aggregate::assemble(&slice.pending, whitelist, patterns, whitelist_other)
            {
                slice.ring.push(event);
                slice.fresh_event = true;
            }
            slice.pending.clear();
        }
    }

    /// Phases 3–7.
    fn run_tick(&mut self, now: i64) -> TickSummary {
        let mut summary = TickSummary::default();

        // Scorer.
        let policy = &self.policy;
        let params = &self.score_params;
        for slice in self.registry.iter_mut() {
            if slice.status.in_penalty(policy) {
                // Badness does not accumulate inside a penalty.
                if !slice.badness.is_zero() {
                    warn!(uid = slice.uid, "nonzero badness inside penalty, clamping");
                    slice.badness.reset(now);
                }
                slice.fresh_event = false;
                continue;
            }
            if slice.fresh_event {
                slice.fresh_event = false;
                let quota = policy.quota_for(&slice.status);
                if let Some(event) = slice.ring.latest() {
                    let cpu_ratio = ratio(event.accounted_cpu_pct, quota.cpu_pct);
                    let mem_ratio = ratio(event.accounted_mem_bytes as f64, quota.mem_bytes as f64);
                    slice.badness.update(cpu_ratio, mem_ratio, params, now);
                }
            } else if !slice.present {
                // A departed user consumes nothing; their score decays
                // until the registry can let go of them.
                slice.badness.update(0.0, 0.0, params, now);
            }
        }

        // Status engine.
        let mut transitions: Vec<(u32, Transition)> = Vec::new();
        for slice in self.registry.iter_mut() {
            for transition in advance(
                &mut slice.status,
                &mut slice.badness,
                policy,
                &self.hostname,
                now,
            ) {
                transitions.push((slice.uid, transition));
            }
        }

        // Enforcer.
        for slice in self.registry.iter() {
            let quota = policy.quota_for(&slice.status);
            if let Err(e) = self.enforcer.apply(slice.uid, &quota) {
                warn!(uid = slice.uid, error = %e, "enforcement failed, retrying next tick");
            }
        }

        // Synchronizer.
        let peer_hosts = match self.synchronizer.as_mut() {
            Some(sync) => match sync.sync(&mut self.registry, &self.policy, now) {
                Ok(peers) => peers,
                Err(e) => {
                    warn!(error = %e, "status store sync skipped this tick");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        // Notifier and history log.
        summary.transitions = transitions.len();
        for (uid, transition) in transitions {
            self.dispatch(uid, &transition, &peer_hosts, now);
        }

        self.watch_high_usage(now);

        let retired = self.registry.retire_departed(&self.policy);
        if !retired.is_empty() {
            debug!(?retired, "retired departed users");
        }

        summary.users = self.registry.len();
        summary.penalized = self
            .registry
            .iter()
            .filter(|s| s.status.in_penalty(&self.policy))
            .count();
        summary.peer_hosts = peer_hosts;
        summary
    }

    fn dispatch(&mut self, uid: u32, transition: &Transition, peer_hosts: &[String], now: i64) {
        let Some(slice) = self.registry.get(uid) else {
            return;
        };
        let events: Vec<Event> = slice.ring.snapshot();
        let base = Notification {
            kind: NotifyKind::Violation,
            hostname: self.hostname.clone(),
            uid,
            username: slice.username.clone(),
            status: slice.status.current.clone(),
            occurrences: slice.status.occurrences,
            penalty_expiry: slice.status.penalty_expiry,
            events,
            peer_hosts: peer_hosts.to_vec(),
            debug: self.config.general.debug_mode,
        };

        match transition {
            Transition::Penalized { tier, occurrences } => {
                info!(
                    uid,
                    user = %base.username,
                    tier = %tier,
                    occurrences,
                    "user penalized"
                );
                self.history
                    .record_transition(uid, &base.username, &base.events);
                self.notifier.notify(base);
            }
            Transition::Released { notify } => {
                info!(uid, user = %base.username, notify, "penalty expired");
                self.history
                    .record_transition(uid, &base.username, &base.events);
                if *notify {
                    self.notifier.notify(Notification {
                        kind: NotifyKind::Release,
                        ..base
                    });
                }
            }
            Transition::Forgiven { occurrences } => {
                debug!(uid, occurrences, now, "occurrence forgiven");
            }
        }
    }

    /// Node-wide watcher: warn (rate-limited) when the whole machine runs
    /// hot, independent of any per-user penalty.
    fn watch_high_usage(&mut self, now: i64) {
        let cfg = &self.config.high_usage_watcher;
        if !cfg.enabled || self.cpu_capacity_pct <= 0.0 || self.mem_total_bytes == 0 {
            return;
        }

        let (mut cpu_pct, mut mem_bytes) = (0.0, 0u64);
        for slice in self.registry.iter().filter(|s| s.present) {
            if let Some(event) = slice.ring.latest() {
                cpu_pct += event.cpu_pct;
                mem_bytes += event.mem_bytes;
            }
        }
        let cpu_frac = cpu_pct / self.cpu_capacity_pct;
        let mem_frac = mem_bytes as f64 / self.mem_total_bytes as f64;
        if cpu_frac < cfg.cpu_usage_threshold && mem_frac < cfg.mem_usage_threshold {
            return;
        }
        if let Some(last) = self.high_usage_last
            && now - last < cfg.timeout
        {
            return;
        }
        self.high_usage_last = Some(now);
        self.history.record_high_usage(cpu_frac, mem_frac);
        self.notifier.notify(Notification {
            kind: NotifyKind::HighUsage,
            hostname: self.hostname.clone(),
            uid: 0,
            username: self.hostname.clone(),
            status: "-".to_string(),
            occurrences: 0,
            penalty_expiry: None,
            events: Vec::new(),
            peer_hosts: Vec::new(),
            debug: self.config.general.debug_mode,
        });
    }
}

/// Ratio of accounted usage to quota; unlimited quotas can't be overused.
fn ratio(usage: f64, quota: f64) -> f64 {
    if quota <= 0.0 { 0.0 } else { usage / quota }
}

/// Whitelist patterns contributed by the user's status: the current group
/// when it is a plain group, the default group while penalized.
fn group_patterns<'a>(policy: &'a Policy, status: &Status) -> &'a [String] {
    let name = if policy.is_penalty(&status.current) {
        &status.default_group
    } else {
        &status.current
    };
    policy
        .group(name)
        .map(|g| g.whitelist.as_slice())
        .unwrap_or(&[])
}
