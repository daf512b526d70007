//! Per-user usage collection.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Collector                         │
//! │   ┌───────────────────┐    ┌──────────────────────────┐  │
//! │   │   CgroupReader    │    │      procfs parsers      │  │
//! │   │  user.slice/*     │    │  /proc/<pid>/{stat,      │  │
//! │   │  cpuacct, memory  │    │    status,smaps_rollup}  │  │
//! │   └─────────┬─────────┘    └────────────┬─────────────┘  │
//! │             └──────────────┬────────────┘                │
//! │                     ┌──────▼──────┐                      │
//! │                     │  FileSystem │ (trait)              │
//! │                     └──────┬──────┘                      │
//! └────────────────────────────┼─────────────────────────────┘
//!                ┌─────────────┴─────────────┐
//!         ┌──────▼──────┐             ┌──────▼──────┐
//!         │   RealFs    │             │   MockFs    │
//!         │ (production)│             │  (testing)  │
//!         └─────────────┘             └─────────────┘
//! ```
//!
//! The collector emits one [`crate::model::UsageSample`] per tracked user
//! per sub-tick. CPU percentages are rate-resolved against the previous
//! sub-tick; identifiers whose counters regressed (pid reuse, recreated
//! cgroup) or that have no previous read are dropped, never extrapolated.

pub mod cgroup;
#[allow(clippy::module_inception)]
mod collector;
pub mod mock;
pub mod procfs;
pub mod traits;

pub use cgroup::{CgroupPaths, CgroupReader};
pub use collector::{CollectError, Collector, CollectorParams, Sweep, UserSample};
pub use mock::MockFs;
pub use traits::{FileSystem, RealFs};
