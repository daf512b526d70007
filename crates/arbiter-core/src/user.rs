//! The tracked-user registry.
//!
//! A flat `uid → UserSlice` map. Each slice exclusively owns its event
//! ring, badness record, and status; nothing else in the daemon holds
//! references into it.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::badness::Badness;
use crate::model::{EventRing, UsageSample};
use crate::status::{Policy, Status};

/// One tracked user.
#[derive(Debug, Clone)]
pub struct UserSlice {
    pub uid: u32,
    pub username: String,
    pub gid: u32,
    pub ring: EventRing,
    pub badness: Badness,
    pub status: Status,
    /// Samples accumulated toward the next event.
    pub pending: Vec<UsageSample>,
    /// Whether the user's cgroup existed at the last sweep.
    pub present: bool,
    /// Whether an event was assembled since the scorer last ran.
    pub fresh_event: bool,
}

/// Registry of all tracked users.
#[derive(Debug)]
pub struct UserRegistry {
    users: BTreeMap<u32, UserSlice>,
    ring_cap: usize,
}

impl UserRegistry {
    pub fn new(ring_cap: usize) -> Self {
        Self {
            users: BTreeMap::new(),
            ring_cap,
        }
    }

    /// Returns the slice for a user, creating it in their default status
    /// group on first observation.
    pub fn observe(
        &mut self,
        uid: u32,
        username: &str,
        gid: u32,
        policy: &Policy,
    ) -> &mut UserSlice {
        let ring_cap = self.ring_cap;
        self.users.entry(uid).or_insert_with(|| {
            let default = policy.default_group_for(uid, gid);
            UserSlice {
                uid,
                username: username.to_string(),
                gid,
                ring: EventRing::new(ring_cap),
                badness: Badness::default(),
                status: Status::new_default(&default.name),
                pending: Vec::new(),
                present: true,
                fresh_event: false,
            }
        })
    }

    /// Inserts a slice rehydrated from the status store, overwriting any
    /// placeholder for the same uid.
    pub fn restore(&mut self, slice: UserSlice) {
        self.users.insert(slice.uid, slice);
    }

    pub fn get(&self, uid: u32) -> Option<&UserSlice> {
        self.users.get(&uid)
    }

    pub fn get_mut(&mut self, uid: u32) -> Option<&mut UserSlice> {
        self.users.get_mut(&uid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserSlice> {
        self.users.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut UserSlice> {
        self.users.values_mut()
    }

    pub fn uids(&self) -> Vec<u32> {
        self.users.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Records which cgroups were present this sweep.
    pub fn update_presence(&mut self, active: &BTreeSet<u32>) {
        for (uid, slice) in self.users.iter_mut() {
            slice.present = active.contains(uid);
        }
    }

    /// Drops users whose cgroup is gone and who carry no state worth
    /// keeping: zero badness, zero occurrences, default status. Users
    /// with pending penalties or occurrences are retained so the state
    /// survives a logout/login cycle.
    pub fn retire_departed(&mut self, policy: &Policy) -> Vec<u32> {
        let mut retired = Vec::new();
        self.users.retain(|uid, slice| {
            let keep = slice.present
                || !slice.badness.is_zero()
                || slice.status.occurrences > 0
                || slice.status.current != slice.status.default_group
                || slice.status.in_penalty(policy);
            if !keep {
                retired.push(*uid);
            }
            keep
        });
        retired
    }
}
