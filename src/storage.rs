//! Persistence boundary of the pipeline.
//!
//! [`ContractStore`] is what the supervisor and the subgraph service talk to. `PgStore` in
//! [`crate::database`] is the production implementation; [`MemoryStore`] backs tests and
//! dry runs.

use async_trait::async_trait;
use ethers::types::Address;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use crate::error::{ForgeError, Result};
use crate::types::{BlockCursor, ChainId, Contract, ContractKey};

#[async_trait]
pub trait ContractStore: Send + Sync {
    /// Upserts the contract and its deployment. Returns the contract row id.
    async fn save_contract(&self, contract: &Contract) -> Result<i64>;

    /// Records a scanned block (unhandled). Returns the existing id on repeat calls.
    async fn save_block(&self, number: u64, chain_id: ChainId) -> Result<i64>;

    /// Links a contract to the block it was found in. `None` for contracts created on request.
    async fn save_contract_forge(&self, block_id: Option<i64>, contract_id: i64) -> Result<()>;

    async fn block_handled(&self, number: u64, chain_id: ChainId) -> Result<()>;

    /// Earliest unhandled block for the chain, else the highest handled one.
    async fn last_block(&self, chain_id: ChainId) -> Result<Option<BlockCursor>>;

    /// Whether the contract has been fully persisted and linked.
    async fn initialized(&self, contract: &Contract) -> Result<bool>;

    /// Addresses of every initialized contract on the chain.
    async fn persisted_contracts(&self, chain_id: ChainId) -> Result<Vec<Address>>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_id: i64,
    blocks: BTreeMap<(ChainId, u64), (i64, bool)>,
    contracts: HashMap<ContractKey, (i64, Contract)>,
    forge: HashMap<i64, Option<i64>>,
    failing: HashSet<Address>,
}

impl MemoryInner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// [`ContractStore`] held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Makes `save_contract` fail for `address` until [`MemoryStore::heal`] is called.
    pub fn fail_saves_for(&self, address: Address) {
        self.lock().failing.insert(address);
    }

    pub fn heal(&self) {
        self.lock().failing.clear();
    }

    pub fn is_handled(&self, chain_id: ChainId, number: u64) -> Option<bool> {
        self.lock().blocks.get(&(chain_id, number)).map(|(_, h)| *h)
    }

    pub fn contract(&self, key: &ContractKey) -> Option<Contract> {
        self.lock().contracts.get(key).map(|(_, c)| c.clone())
    }

    pub fn contract_count(&self) -> usize {
        self.lock().contracts.len()
    }
}

#[async_trait]
impl ContractStore for MemoryStore {
    async fn save_contract(&self, contract: &Contract) -> Result<i64> {
        let mut inner = self.lock();
        if inner.failing.contains(&contract.address) {
            return Err(ForgeError::Persistence(format!(
                "simulated failure saving {:?}",
                contract.address
            )));
        }
        let key = contract.key();
        if let Some((id, stored)) = inner.contracts.get_mut(&key) {
            *stored = contract.clone();
            return Ok(*id);
        }
        let id = inner.next_id();
        inner.contracts.insert(key, (id, contract.clone()));
        Ok(id)
    }

    async fn save_block(&self, number: u64, chain_id: ChainId) -> Result<i64> {
        let mut inner = self.lock();
        if let Some((id, _)) = inner.blocks.get(&(chain_id, number)) {
            return Ok(*id);
        }
        let id = inner.next_id();
        inner.blocks.insert((chain_id, number), (id, false));
        Ok(id)
    }

    async fn save_contract_forge(&self, block_id: Option<i64>, contract_id: i64) -> Result<()> {
        self.lock().forge.entry(contract_id).or_insert(block_id);
        Ok(())
    }

    async fn block_handled(&self, number: u64, chain_id: ChainId) -> Result<()> {
        match self.lock().blocks.get_mut(&(chain_id, number)) {
            Some(entry) => {
                entry.1 = true;
                Ok(())
            }
            None => Err(ForgeError::Persistence(format!(
                "block {} on chain {} was never saved",
                number, chain_id
            ))),
        }
    }

    async fn last_block(&self, chain_id: ChainId) -> Result<Option<BlockCursor>> {
        let inner = self.lock();
        let rows = inner
            .blocks
            .range((chain_id, 0)..=(chain_id, u64::MAX))
            .map(|(&(_, number), &(_, handled))| BlockCursor {
                chain_id,
                block_number: number,
                is_handled: handled,
            });
        let mut last_handled = None;
        for row in rows {
            if !row.is_handled {
                return Ok(Some(row));
            }
            last_handled = Some(row);
        }
        Ok(last_handled)
    }

    async fn initialized(&self, contract: &Contract) -> Result<bool> {
        let inner = self.lock();
        Ok(inner
            .contracts
            .get(&contract.key())
            .is_some_and(|(id, _)| inner.forge.contains_key(id)))
    }

    async fn persisted_contracts(&self, chain_id: ChainId) -> Result<Vec<Address>> {
        let inner = self.lock();
        Ok(inner
            .contracts
            .iter()
            .filter(|(key, (id, _))| key.chain_id == chain_id && inner.forge.contains_key(id))
            .map(|(key, _)| key.address)
            .collect())
    }
}
