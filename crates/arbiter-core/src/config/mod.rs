//! Declarative configuration.
//!
//! Configuration is YAML, loaded as a cascade: every `--config` file is
//! parsed into a YAML value and deep-merged over the previous ones, later
//! files overriding earlier ones key by key. String values support two
//! substitutions, applied after the merge:
//!
//! - `%H` — the machine hostname
//! - `${VAR}` — environment variable contents, empty when unset
//!
//! The merged value deserializes into an immutable [`Config`] that is
//! validated once and then threaded through component constructors.
//! Nothing in the daemon mutates configuration after startup.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::Value;

use crate::badness::ScoreParams;
use crate::collector::CollectorParams;
use crate::status::{PenaltyTier, Policy, StatusGroup};
use crate::whitelist::Whitelist;

/// Error type for configuration loading. Always fatal at startup.
#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, io::Error),
    Parse(PathBuf, String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "cannot read {}: {}", path.display(), e),
            ConfigError::Parse(path, msg) => write!(f, "cannot parse {}: {}", path.display(), msg),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

fn default_true() -> bool {
    true
}

/// Daemon-wide knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub debug_mode: bool,
    /// Seconds per full control cycle. Minimum 5.
    pub arbiter_refresh: u64,
    /// Events assembled per cycle.
    pub history_per_refresh: usize,
    /// Sub-samples averaged into one event.
    pub poll: usize,
    pub min_uid: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            debug_mode: false,
            arbiter_refresh: 60,
            history_per_refresh: 15,
            poll: 2,
            min_uid: 1000,
        }
    }
}

/// Scoring knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BadnessConfig {
    pub max_history_kept: usize,
    pub cpu_badness_threshold: f64,
    pub mem_badness_threshold: f64,
    pub time_to_max_bad: f64,
    pub time_to_min_bad: f64,
    pub cap_badness_incr: bool,
    /// Seconds after which store rows are too stale to reconcile or
    /// rehydrate from.
    pub imported_badness_timeout: i64,
}

impl Default for BadnessConfig {
    fn default() -> Self {
        Self {
            max_history_kept: 10,
            cpu_badness_threshold: 0.5,
            mem_badness_threshold: 0.5,
            time_to_max_bad: 900.0,
            time_to_min_bad: 900.0,
            cap_badness_incr: true,
            imported_badness_timeout: 3600,
        }
    }
}

/// Memory accounting knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub pss: bool,
    /// RssFile + RssShmem bytes above which PSS is consulted per pid.
    pub pss_threshold: u64,
    pub memsw: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            pss: false,
            pss_threshold: 4 * 1024 * 1024,
            memsw: true,
        }
    }
}

/// Process whitelisting.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessesConfig {
    /// Glob patterns matched against kernel comm names.
    pub whitelist: Vec<String>,
    /// Owners whose processes are always whitelisted.
    pub proc_owner_whitelist: Vec<u32>,
    /// Where the cgroup-minus-processes gap is booked.
    pub whitelist_other_processes: bool,
}

impl Default for ProcessesConfig {
    fn default() -> Self {
        Self {
            whitelist: Vec::new(),
            proc_owner_whitelist: vec![0],
            whitelist_other_processes: true,
        }
    }
}

/// One status group.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusGroupConfig {
    /// Percent of one core.
    pub cpu_quota: f64,
    /// Bytes; 0 is unlimited.
    pub mem_quota: u64,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub uids: Vec<u32>,
    #[serde(default)]
    pub gids: Vec<u32>,
}

/// One penalty tier.
#[derive(Debug, Clone, Deserialize)]
pub struct PenaltyTierConfig {
    /// Fraction of the default group's quota when `relative_quotas`,
    /// absolute percent otherwise.
    pub cpu_quota: f64,
    /// Fraction or absolute bytes, as above.
    pub mem_quota: f64,
    /// Seconds until release.
    pub timeout: i64,
    #[serde(default)]
    pub expression: Option<String>,
}

/// Penalty policy.
#[derive(Debug, Clone, Deserialize)]
pub struct PenaltyConfig {
    pub order: Vec<String>,
    #[serde(default = "default_true")]
    pub relative_quotas: bool,
    #[serde(default = "PenaltyConfig::default_occur_timeout")]
    pub occur_timeout: i64,
    pub tiers: HashMap<String, PenaltyTierConfig>,
}

impl PenaltyConfig {
    fn default_occur_timeout() -> i64 {
        3600
    }
}

/// Status policy: ordered groups plus the penalty ladder.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    /// Evaluation order for default-group matching.
    pub order: Vec<String>,
    pub fallback_status: String,
    #[serde(default)]
    pub div_cpu_quotas_by_threads_per_core: bool,
    pub groups: HashMap<String, StatusGroupConfig>,
    pub penalty: PenaltyConfig,
}

/// Shared status store coordinates.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StatusDbConfig {
    /// Postgres URL; empty disables the store entirely.
    pub url: String,
    /// Sync group name; empty disables cross-node synchronization.
    pub sync_group: String,
    /// This host's name in the store. `%H` expands to the hostname.
    pub hostname: String,
}

/// Node-wide high-usage alarms.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HighUsageConfig {
    pub enabled: bool,
    /// Fraction of total node CPU.
    pub cpu_usage_threshold: f64,
    /// Fraction of total node memory.
    pub mem_usage_threshold: f64,
    /// Seconds between consecutive warnings.
    pub timeout: i64,
}

impl Default for HighUsageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cpu_usage_threshold: 0.8,
            mem_usage_threshold: 0.8,
            timeout: 600,
        }
    }
}

/// Mail coordinates, carried opaquely for the external notifier.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EmailConfig {
    pub domain: Option<String>,
    pub admin_emails: Vec<String>,
}

/// The complete immutable configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub badness: BadnessConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub processes: ProcessesConfig,
    pub status: StatusConfig,
    #[serde(default)]
    pub statusdb: StatusDbConfig,
    #[serde(default)]
    pub high_usage_watcher: HighUsageConfig,
    #[serde(default)]
    pub email: EmailConfig,
}

impl Config {
    /// Loads and validates a configuration cascade from files.
    pub fn load(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let hostname = crate::util::local_hostname();
        let mut docs = Vec::new();
        for path in paths {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.clone(), e))?;
            docs.push((path.clone(), content));
        }
        let borrowed: Vec<(&Path, &str)> = docs
            .iter()
            .map(|(p, c)| (p.as_path(), c.as_str()))
            .collect();
        Self::from_docs(&borrowed, &hostname, &|var| std::env::var(var).ok())
    }

    /// Parses, merges, substitutes, deserializes, and validates.
    pub fn from_docs(
        docs: &[(&Path, &str)],
        hostname: &str,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut merged = Value::Mapping(serde_yaml::Mapping::new());
        for (path, content) in docs {
            let value: Value = serde_yaml::from_str(content)
                .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
            merge(&mut merged, value);
        }
        substitute_value(&mut merged, hostname, env);

        let config: Config = serde_yaml::from_value(merged)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.general.arbiter_refresh < 5 {
            return invalid(format!(
                "general.arbiter_refresh must be >= 5, got {}",
                self.general.arbiter_refresh
            ));
        }
        if self.general.poll == 0 || self.general.history_per_refresh == 0 {
            return invalid("general.poll and general.history_per_refresh must be >= 1".into());
        }
        if self.badness.max_history_kept == 0 {
            return invalid("badness.max_history_kept must be >= 1".into());
        }
        for (name, value) in [
            ("cpu_badness_threshold", self.badness.cpu_badness_threshold),
            ("mem_badness_threshold", self.badness.mem_badness_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return invalid(format!("badness.{} must be in (0, 1], got {}", name, value));
            }
        }
        if self.badness.time_to_max_bad <= 0.0 || self.badness.time_to_min_bad <= 0.0 {
            return invalid("badness time_to_max_bad/time_to_min_bad must be positive".into());
        }

        if self.status.order.is_empty() {
            return invalid("status.order must not be empty".into());
        }
        for name in &self.status.order {
            if !self.status.groups.contains_key(name) {
                return invalid(format!("status.order names unknown group '{}'", name));
            }
        }
        if !self.status.groups.contains_key(&self.status.fallback_status) {
            return invalid(format!(
                "status.fallback_status names unknown group '{}'",
                self.status.fallback_status
            ));
        }
        let penalty = &self.status.penalty;
        if penalty.order.is_empty() {
            return invalid("status.penalty.order must not be empty".into());
        }
        for name in &penalty.order {
            let Some(tier) = penalty.tiers.get(name) else {
                return invalid(format!("status.penalty.order names unknown tier '{}'", name));
            };
            if tier.timeout <= 0 {
                return invalid(format!("penalty tier '{}' must have a positive timeout", name));
            }
        }
        if penalty.occur_timeout <= 0 {
            return invalid("status.penalty.occur_timeout must be positive".into());
        }

        if !self.statusdb.sync_group.is_empty() && self.statusdb.url.is_empty() {
            return invalid("statusdb.sync_group is set but statusdb.url is empty".into());
        }
        Ok(())
    }

    /// Resolves the status policy against the machine's SMT factor.
    pub fn policy(&self, threads_per_core: u32) -> Policy {
        let order = self
            .status
            .order
            .iter()
            .map(|name| {
                let g = &self.status.groups[name];
                StatusGroup {
                    name: name.clone(),
                    cpu_quota: g.cpu_quota,
                    mem_quota: g.mem_quota,
                    whitelist: g.whitelist.clone(),
                    uids: g.uids.clone(),
                    gids: g.gids.clone(),
                }
            })
            .collect();
        let penalties = self
            .status
            .penalty
            .order
            .iter()
            .map(|name| {
                let t = &self.status.penalty.tiers[name];
                PenaltyTier {
                    name: name.clone(),
                    cpu_quota: t.cpu_quota,
                    mem_quota: t.mem_quota,
                    timeout: t.timeout,
                    expression: t.expression.clone(),
                }
            })
            .collect();
        Policy {
            order,
            fallback: self.status.fallback_status.clone(),
            penalties,
            relative_quotas: self.status.penalty.relative_quotas,
            occur_timeout: self.status.penalty.occur_timeout,
            div_cpu_quotas_by_threads_per_core: self.status.div_cpu_quotas_by_threads_per_core,
            threads_per_core,
        }
    }

    pub fn score_params(&self) -> ScoreParams {
        ScoreParams {
            cpu_threshold: self.badness.cpu_badness_threshold,
            mem_threshold: self.badness.mem_badness_threshold,
            time_to_max_bad: self.badness.time_to_max_bad,
            time_to_min_bad: self.badness.time_to_min_bad,
            cap_badness_incr: self.badness.cap_badness_incr,
            refresh: self.general.arbiter_refresh as f64,
        }
    }

    pub fn collector_params(&self, proc_path: &str) -> CollectorParams {
        CollectorParams {
            proc_path: proc_path.to_string(),
            min_uid: self.general.min_uid,
            pss: self.memory.pss,
            pss_threshold: self.memory.pss_threshold,
            memsw: self.memory.memsw,
        }
    }

    pub fn whitelist(&self) -> Whitelist {
        Whitelist::new(
            self.processes.proc_owner_whitelist.iter().copied(),
            self.processes.whitelist.clone(),
        )
    }

    /// Whether the synchronizer should run at all.
    pub fn sync_enabled(&self) -> bool {
        !self.statusdb.url.is_empty() && !self.statusdb.sync_group.is_empty()
    }
}

/// Deep-merges `overlay` into `base`: mappings merge key by key,
/// everything else is replaced.
fn merge(base: &mut Value, overlay: Value) {
    match overlay {
        Value::Mapping(overlay_map) => {
            if let Value::Mapping(base_map) = base {
                for (key, value) in overlay_map {
                    match base_map.entry(key) {
                        serde_yaml::mapping::Entry::Occupied(mut slot) => {
                            merge(slot.get_mut(), value)
                        }
                        serde_yaml::mapping::Entry::Vacant(slot) => {
                            slot.insert(value);
                        }
                    }
                }
            } else {
                *base = Value::Mapping(overlay_map);
            }
        }
        value => *base = value,
    }
}

/// Applies `%H` and `${VAR}` substitutions to one string.
pub fn substitute(input: &str, hostname: &str, env: &dyn Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    loop {
        if let Some(stripped) = rest.strip_prefix("%H") {
            out.push_str(hostname);
            rest = stripped;
        } else if rest.starts_with("${") {
            match rest[2..].find('}') {
                Some(end) => {
                    if let Some(value) = env(&rest[2..2 + end]) {
                        out.push_str(&value);
                    }
                    rest = &rest[2 + end + 1..];
                }
                None => {
                    // Unterminated reference stays literal.
                    out.push_str(rest);
                    break;
                }
            }
        } else {
            match rest.chars().next() {
                Some(c) => {
                    out.push(c);
                    rest = &rest[c.len_utf8()..];
                }
                None => break,
            }
        }
    }
    out
}

fn substitute_value(value: &mut Value, hostname: &str, env: &dyn Fn(&str) -> Option<String>) {
    match value {
        Value::String(s) => *s = substitute(s, hostname, env),
        Value::Sequence(seq) => {
            for item in seq {
                substitute_value(item, hostname, env);
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                substitute_value(item, hostname, env);
            }
        }
        _ => {}
    }
}
