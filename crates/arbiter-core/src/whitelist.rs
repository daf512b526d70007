//! Whitelist matching for the usage decomposition.
//!
//! A process escapes accounting either by owner (uid on the owner
//! whitelist, root by default) or by name (kernel comm matched against
//! glob patterns: `*`, `?`, `[seq]`, `[!seq]`).

use std::collections::HashSet;

use glob_match::glob_match;

/// Owner-based whitelist plus the globally configured name patterns.
///
/// Status groups contribute additional per-group patterns; callers pass
/// the union to [`Whitelist::matches`].
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    owners: HashSet<u32>,
    global: Vec<String>,
}

impl Whitelist {
    pub fn new(owners: impl IntoIterator<Item = u32>, global: Vec<String>) -> Self {
        Self {
            owners: owners.into_iter().collect(),
            global,
        }
    }

    pub fn owner_whitelisted(&self, uid: u32) -> bool {
        self.owners.contains(&uid)
    }

    /// Whether a process is whitelisted, given the extra patterns of the
    /// user's current status group.
    pub fn matches(&self, name: &str, uid_owner: u32, extra_patterns: &[String]) -> bool {
        if self.owner_whitelisted(uid_owner) {
            return true;
        }
        self.global
            .iter()
            .chain(extra_patterns.iter())
            .any(|pattern| glob_match(pattern, name))
    }
}
