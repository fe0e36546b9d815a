//! # Block Walker
//!
//! Scans a chain block by block, pulling token-contract candidates out of transfer logs.
//!
//! The walker hands out one block at a time: after a block's candidates and its number have
//! been pushed downstream it parks until the consumer sends a "handled" credit. A fetch error
//! ends the walk; the error is pushed on the error stream and every stream is closed.

use async_trait::async_trait;
use ethers::types::{Log, TransactionReceipt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chain::ChainClient;
use crate::contracts::{TRANSFER_BATCH_TOPIC, TRANSFER_SINGLE_TOPIC, TRANSFER_TOPIC};
use crate::error::{ForgeError, Result};
use crate::exceptions::ExceptionSet;
use crate::metrics;
use crate::types::{Contract, Network, TokenType};

/// Receiving ends of one scan session.
pub struct ProducerStreams {
    /// Block numbers, pushed after every candidate of that block.
    pub blocks: mpsc::Receiver<u64>,
    pub contracts: mpsc::Receiver<Contract>,
    pub errors: mpsc::Receiver<ForgeError>,
    pub handle: JoinHandle<()>,
}

#[async_trait]
pub trait Producer: Send + Sync {
    /// Current chain head.
    async fn head(&self) -> Result<u64>;

    /// Starts scanning at `from_block`. Every block after the first waits for a credit on
    /// `handled`.
    fn produce(
        &self,
        from_block: u64,
        handled: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) -> ProducerStreams;
}

pub struct BlockWalker {
    network: Network,
    client: Arc<dyn ChainClient>,
    exceptions: ExceptionSet,
    poll_interval: Duration,
    contract_capacity: usize,
}

impl BlockWalker {
    pub fn new(
        network: Network,
        client: Arc<dyn ChainClient>,
        exceptions: ExceptionSet,
        poll_interval: Duration,
        contract_capacity: usize,
    ) -> Self {
        Self {
            network,
            client,
            exceptions,
            poll_interval,
            contract_capacity: contract_capacity.max(1),
        }
    }
}

#[async_trait]
impl Producer for BlockWalker {
    async fn head(&self) -> Result<u64> {
        self.client.block_number().await
    }

    fn produce(
        &self,
        from_block: u64,
        handled: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) -> ProducerStreams {
        let (block_tx, blocks) = mpsc::channel(1);
        let (contract_tx, contracts) = mpsc::channel(self.contract_capacity);
        let (error_tx, errors) = mpsc::channel(1);

        let walk = Walk {
            network: self.network,
            client: self.client.clone(),
            exceptions: self.exceptions.clone(),
            poll_interval: self.poll_interval,
            block_tx,
            contract_tx,
            cancel,
        };

        let handle = tokio::spawn(async move {
            if let Err(e) = walk.run(from_block, handled).await {
                log::error!("❌ [BlockWalker:{}] scan stopped: {}", walk.network, e);
                let _ = error_tx.send(e).await;
            }
        });

        ProducerStreams {
            blocks,
            contracts,
            errors,
            handle,
        }
    }
}

struct Walk {
    network: Network,
    client: Arc<dyn ChainClient>,
    exceptions: ExceptionSet,
    poll_interval: Duration,
    block_tx: mpsc::Sender<u64>,
    contract_tx: mpsc::Sender<Contract>,
    cancel: CancellationToken,
}

impl Walk {
    async fn run(&self, from_block: u64, mut handled: mpsc::Receiver<()>) -> Result<()> {
        log::info!("🔍 [BlockWalker:{}] scanning from block {}", self.network, from_block);
        let mut number = from_block;
        loop {
            let receipts = match self.fetch(number).await {
                Ok(r) => r,
                Err(ForgeError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            };

            let candidates = extract_candidates(self.network, number, &receipts, &self.exceptions);
            if !candidates.is_empty() {
                log::debug!(
                    "[BlockWalker:{}] block {}: {} candidates",
                    self.network,
                    number,
                    candidates.len()
                );
                metrics::increment_candidates(self.network.name(), candidates.len() as u64);
            }
            for c in candidates {
                if self.contract_tx.send(c).await.is_err() {
                    return Ok(());
                }
            }
            if self.block_tx.send(number).await.is_err() {
                return Ok(());
            }
            metrics::increment_blocks_scanned(self.network.name());

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                credit = handled.recv() => {
                    if credit.is_none() {
                        return Ok(());
                    }
                }
            }
            number += 1;
        }
    }

    /// Block `number` and all of its receipts. Waits at the head until the block exists.
    async fn fetch(&self, number: u64) -> Result<Vec<TransactionReceipt>> {
        let block = loop {
            let fetched = tokio::select! {
                _ = self.cancel.cancelled() => return Err(ForgeError::Cancelled),
                b = self.client.block(number) => b?,
            };
            match fetched {
                Some(b) => break b,
                None => {
                    log::trace!("[BlockWalker:{}] block {} not yet available", self.network, number);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(ForgeError::Cancelled),
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        };

        let mut receipts = Vec::with_capacity(block.transactions.len());
        for tx_hash in block.transactions {
            let receipt = tokio::select! {
                _ = self.cancel.cancelled() => return Err(ForgeError::Cancelled),
                r = self.client.receipt(tx_hash) => r?,
            };
            match receipt {
                Some(r) => receipts.push(r),
                None => {
                    return Err(ForgeError::Transport(format!(
                        "missing receipt for {:?} in block {}",
                        tx_hash, number
                    )))
                }
            }
        }
        Ok(receipts)
    }
}

/// Token standard suggested by a single log, if it is a transfer event at all.
pub fn hint_from_log(log: &Log) -> Option<TokenType> {
    let topic0 = log.topics.first()?;
    if *topic0 == *TRANSFER_TOPIC {
        // ERC-721 indexes the token id, ERC-20 leaves the amount in data.
        if log.topics.len() == 4 {
            Some(TokenType::Erc721)
        } else {
            Some(TokenType::Erc20)
        }
    } else if *topic0 == *TRANSFER_SINGLE_TOPIC || *topic0 == *TRANSFER_BATCH_TOPIC {
        Some(TokenType::Erc1155)
    } else {
        None
    }
}

/// Candidates emitted by one block, first occurrence wins, exception-set entries dropped.
pub fn extract_candidates(
    network: Network,
    block_number: u64,
    receipts: &[TransactionReceipt],
    exceptions: &ExceptionSet,
) -> Vec<Contract> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for log in receipts.iter().flat_map(|r| r.logs.iter()) {
        let Some(hint) = hint_from_log(log) else {
            continue;
        };
        if exceptions.contains(&log.address) || !seen.insert(log.address) {
            continue;
        }
        out.push(Contract::new(network, log.address, hint, block_number));
    }
    out
}
