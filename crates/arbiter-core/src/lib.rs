//! arbiter-core — shared library for the arbiter daemon.
//!
//! Provides:
//! - `config` — cascaded declarative configuration
//! - `collector` — per-user cgroup and per-process usage collection
//! - `model` — usage samples, averaged events, bounded event rings
//! - `aggregate` / `whitelist` — sub-sample averaging and usage decomposition
//! - `badness` — time-decayed per-user resource scoring
//! - `status` — status groups, penalty tiers, and the transition engine
//! - `user` — the flat uid → tracked-user registry
//! - `enforce` — idempotent cgroup quota enforcement
//! - `statusdb` — shared SQL status store and cross-node reconciliation
//! - `notify` — notification and site-hook capability interfaces
//! - `arbiter` — the per-tick control cycle tying the phases together

pub mod aggregate;
pub mod arbiter;
pub mod badness;
pub mod collector;
pub mod config;
pub mod enforce;
pub mod model;
pub mod notify;
pub mod status;
pub mod statusdb;
pub mod user;
pub mod util;
pub mod whitelist;
