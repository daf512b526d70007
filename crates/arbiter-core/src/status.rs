//! Status groups, penalty tiers, and the transition engine.
//!
//! Every user carries exactly one current and one default status. The
//! default comes from the ordered status list (matched by uid or gid,
//! with a configured fallback); penalties walk the ordered tier list,
//! indexed by the user's occurrence count.

use serde::{Deserialize, Serialize};

use crate::badness::Badness;

/// A non-penalty status group with its quotas and match lists.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusGroup {
    pub name: String,
    /// CPU quota in percent of one core (400.0 == four cores).
    pub cpu_quota: f64,
    /// Memory quota in bytes. 0 means unlimited.
    pub mem_quota: u64,
    /// Extra whitelist patterns for users in this group.
    pub whitelist: Vec<String>,
    pub uids: Vec<u32>,
    pub gids: Vec<u32>,
}

/// A penalty tier.
#[derive(Debug, Clone, PartialEq)]
pub struct PenaltyTier {
    pub name: String,
    /// Fraction of the default group's CPU quota when quotas are
    /// relative, absolute percent otherwise.
    pub cpu_quota: f64,
    /// Fraction of the default group's memory quota when quotas are
    /// relative, absolute bytes otherwise.
    pub mem_quota: f64,
    /// Seconds until the penalty expires.
    pub timeout: i64,
    /// Informational label shown in notifications.
    pub expression: Option<String>,
}

/// The immutable status policy, resolved from configuration at startup.
#[derive(Debug, Clone)]
pub struct Policy {
    pub order: Vec<StatusGroup>,
    pub fallback: String,
    pub penalties: Vec<PenaltyTier>,
    pub relative_quotas: bool,
    /// Seconds of quiet default-status time that forgives one occurrence.
    pub occur_timeout: i64,
    pub div_cpu_quotas_by_threads_per_core: bool,
    pub threads_per_core: u32,
}

/// Effective quota for one user, ready for the enforcer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quota {
    /// Percent of one core; <= 0 means unlimited.
    pub cpu_pct: f64,
    /// Bytes; 0 means unlimited.
    pub mem_bytes: u64,
}

impl Policy {
    /// Default group for a user: first entry in the configured order
    /// matching the uid or primary gid, else the fallback.
    pub fn default_group_for(&self, uid: u32, gid: u32) -> &StatusGroup {
        self.order
            .iter()
            .find(|g| g.uids.contains(&uid) || g.gids.contains(&gid))
            .unwrap_or_else(|| self.fallback_group())
    }

    pub fn fallback_group(&self) -> &StatusGroup {
        self.order
            .iter()
            .find(|g| g.name == self.fallback)
            .unwrap_or(&self.order[0])
    }

    pub fn group(&self, name: &str) -> Option<&StatusGroup> {
        self.order.iter().find(|g| g.name == name)
    }

    pub fn penalty(&self, name: &str) -> Option<&PenaltyTier> {
        self.penalties.iter().find(|t| t.name == name)
    }

    pub fn is_penalty(&self, name: &str) -> bool {
        self.penalty(name).is_some()
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.group(name).is_some() || self.is_penalty(name)
    }

    /// Penalty tier for an occurrence count, clamped to the last tier.
    pub fn tier_for_occurrences(&self, occurrences: u32) -> &PenaltyTier {
        let idx = (occurrences.max(1) as usize - 1).min(self.penalties.len() - 1);
        &self.penalties[idx]
    }

    /// Resolves the effective quota of a status.
    pub fn quota_for(&self, status: &Status) -> Quota {
        let default = self
            .group(&status.default_group)
            .unwrap_or_else(|| self.fallback_group());

        let mut quota = match self.penalty(&status.current) {
            Some(tier) if self.relative_quotas => Quota {
                cpu_pct: default.cpu_quota * tier.cpu_quota,
                mem_bytes: (default.mem_quota as f64 * tier.mem_quota) as u64,
            },
            Some(tier) => Quota {
                cpu_pct: tier.cpu_quota,
                mem_bytes: tier.mem_quota as u64,
            },
            None => {
                let group = self.group(&status.current).unwrap_or(default);
                Quota {
                    cpu_pct: group.cpu_quota,
                    mem_bytes: group.mem_quota,
                }
            }
        };

        if self.div_cpu_quotas_by_threads_per_core && self.threads_per_core > 1 {
            quota.cpu_pct /= f64::from(self.threads_per_core);
        }
        quota
    }
}

/// One user's status record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub current: String,
    pub default_group: String,
    pub occurrences: u32,
    /// When the active penalty ends. Only set while in a penalty tier.
    pub penalty_expiry: Option<i64>,
    /// When the next occurrence is forgiven. Only ticks in the default
    /// status with zero badness.
    pub occur_expiry: Option<i64>,
    /// Hostname that applied the current penalty. Cleared on release.
    pub authority: Option<String>,
    /// When the status last changed (promotion, release, forgiveness, or
    /// adoption). This is what peers compare during reconciliation, so it
    /// is deliberately not refreshed by unchanged upserts.
    pub modified: i64,
}

impl Status {
    pub fn new_default(group: &str) -> Self {
        Self {
            current: group.to_string(),
            default_group: group.to_string(),
            occurrences: 0,
            penalty_expiry: None,
            occur_expiry: None,
            authority: None,
            modified: 0,
        }
    }

    pub fn in_penalty(&self, policy: &Policy) -> bool {
        policy.is_penalty(&self.current)
    }
}

/// A transition produced by [`advance`], for the notifier and the log.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Badness reached 100: the user entered a penalty tier.
    Penalized { tier: String, occurrences: u32 },
    /// A penalty timed out. `notify` is set only on the authority host.
    Released { notify: bool },
    /// A quiet hour (occur_timeout) forgave one occurrence.
    Forgiven { occurrences: u32 },
}

/// Advances one user's status machine by one tick.
///
/// Badness accumulation already happened (or was skipped, in penalty);
/// this only moves the state and timers. Entering a penalty resets the
/// badness record, which stays zero for the penalty's whole lifetime.
pub fn advance(
    status: &mut Status,
    badness: &mut Badness,
    policy: &Policy,
    hostname: &str,
    now: i64,
) -> Vec<Transition> {
    let mut transitions = Vec::new();

    if status.in_penalty(policy) {
        let expired = status.penalty_expiry.map(|t| now >= t).unwrap_or(true);
        if expired {
            let notify = status.authority.as_deref() == Some(hostname);
            status.current = status.default_group.clone();
            status.penalty_expiry = None;
            status.occur_expiry = Some(now + policy.occur_timeout);
            status.authority = None;
            status.modified = now;
            transitions.push(Transition::Released { notify });
        }
        return transitions;
    }

    if badness.total() >= 100.0 {
        status.occurrences = (status.occurrences + 1).min(policy.penalties.len() as u32);
        let tier = policy.tier_for_occurrences(status.occurrences);
        status.current = tier.name.clone();
        status.penalty_expiry = Some(now + tier.timeout);
        status.occur_expiry = None;
        status.authority = Some(hostname.to_string());
        status.modified = now;
        badness.reset(now);
        transitions.push(Transition::Penalized {
            tier: tier.name.clone(),
            occurrences: status.occurrences,
        });
        return transitions;
    }

    if !badness.is_zero() {
        // Any nonzero badness restarts the forgiveness clock.
        status.occur_expiry = Some(now + policy.occur_timeout);
        return transitions;
    }

    if status.occurrences > 0 {
        match status.occur_expiry {
            Some(expiry) if now >= expiry => {
                status.occurrences -= 1;
                status.occur_expiry = Some(now + policy.occur_timeout);
                status.modified = now;
                transitions.push(Transition::Forgiven {
                    occurrences: status.occurrences,
                });
            }
            Some(_) => {}
            None => {
                status.occur_expiry = Some(now + policy.occur_timeout);
            }
        }
    }

    transitions
}
