// Contract Registry - the New / Used bookkeeping behind the supervisor
//
// A key lives in exactly one of the two sets. New entries carry a state so that a pass can
// claim them (Resolving) without another pass picking them up; failure hands them back
// (Discovered). Promotion to Used is one-way.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::types::{Contract, ContractKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Discovered,
    Resolving,
    Used,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    AlreadyPending,
    AlreadyUsed,
}

#[derive(Debug)]
struct Pending {
    contract: Contract,
    state: EntryState,
}

#[derive(Debug, Default)]
struct Sets {
    new: HashMap<ContractKey, Pending>,
    used: HashSet<ContractKey>,
}

/// Thread-safe New/Used sets. Never hold the returned data across the lock; every method
/// takes and drops the mutex internally.
#[derive(Debug, Default)]
pub struct ContractRegistry {
    sets: Mutex<Sets>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Sets> {
        // Every mutation is a single map operation, so a poisoned guard is still consistent.
        self.sets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Marks previously persisted contracts as used.
    pub fn seed_used<I: IntoIterator<Item = ContractKey>>(&self, keys: I) {
        let mut sets = self.lock();
        for key in keys {
            sets.new.remove(&key);
            sets.used.insert(key);
        }
    }

    pub fn admit(&self, contract: Contract) -> Admission {
        let key = contract.key();
        let mut sets = self.lock();
        if sets.used.contains(&key) {
            return Admission::AlreadyUsed;
        }
        if sets.new.contains_key(&key) {
            return Admission::AlreadyPending;
        }
        sets.new.insert(
            key,
            Pending {
                contract,
                state: EntryState::Discovered,
            },
        );
        Admission::Admitted
    }

    /// Moves every `Discovered` entry to `Resolving` and returns snapshots of them.
    pub fn claim_pending(&self) -> Vec<Contract> {
        let mut sets = self.lock();
        let mut claimed: Vec<Contract> = sets
            .new
            .values_mut()
            .filter(|p| p.state == EntryState::Discovered)
            .map(|p| {
                p.state = EntryState::Resolving;
                p.contract.clone()
            })
            .collect();
        claimed.sort_by_key(|c| (c.discovered_at_block, c.address));
        claimed
    }

    /// Resolving → Used. Returns false if the key was not pending.
    pub fn promote(&self, key: &ContractKey) -> bool {
        let mut sets = self.lock();
        if sets.new.remove(key).is_none() {
            return false;
        }
        sets.used.insert(*key);
        true
    }

    /// Resolving → Discovered, keeping whatever the failed attempt learned.
    pub fn release(&self, contract: Contract) {
        let key = contract.key();
        let mut sets = self.lock();
        if let Some(p) = sets.new.get_mut(&key) {
            p.contract = contract;
            p.state = EntryState::Discovered;
        }
    }

    /// Drops a pending key for good without marking it used.
    pub fn reject(&self, key: &ContractKey) -> bool {
        self.lock().new.remove(key).is_some()
    }

    pub fn state(&self, key: &ContractKey) -> Option<EntryState> {
        let sets = self.lock();
        if sets.used.contains(key) {
            return Some(EntryState::Used);
        }
        sets.new.get(key).map(|p| p.state)
    }

    /// Lowest block that still has a pending contract.
    pub fn pending_floor(&self) -> Option<u64> {
        self.lock()
            .new
            .values()
            .map(|p| p.contract.discovered_at_block)
            .min()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().new.len()
    }

    pub fn used_len(&self) -> usize {
        self.lock().used.len()
    }
}
