// Exception Set - addresses whose transfer logs should never become candidates

use dashmap::DashSet;
use ethers::types::Address;
use std::sync::Arc;

/// Denylist shared between the block walker and the supervisor.
///
/// Seeded from configuration with known non-token emitters; the supervisor adds contracts that
/// classified as `Unknown` so later blocks do not re-admit them.
#[derive(Clone, Default, Debug)]
pub struct ExceptionSet {
    inner: Arc<DashSet<Address>>,
}

impl ExceptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_addresses<I: IntoIterator<Item = Address>>(addresses: I) -> Self {
        let set = Self::new();
        for a in addresses {
            set.insert(a);
        }
        set
    }

    /// Returns true if the address was not already excluded.
    pub fn insert(&self, address: Address) -> bool {
        self.inner.insert(address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.inner.contains(address)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
