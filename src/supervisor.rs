//! # Supervisor
//!
//! Drives one chain through discovery, classification, resolution and persistence.
//!
//! ## Tasks per scan session
//!
//! - **producer**: the [`Producer`] walking blocks
//! - **discovery**: admits candidates into the New set, then forwards the block number
//! - **cursor**: per block, records it, runs a pass over New, marks blocks handled, and sends
//!   the producer its next credit
//!
//! ## Cursor rules
//!
//! A block is marked handled only when no contract discovered at or before it is still pending,
//! and always in increasing order. Contracts are persisted before their block is marked, so a
//! crash never loses a discovered contract: resuming from the earliest unhandled block
//! re-discovers it, and everything already persisted is filtered by the Used seed.

use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::classifier::Classifier;
use crate::error::{ForgeError, Result};
use crate::exceptions::ExceptionSet;
use crate::metrics;
use crate::producer::{Producer, ProducerStreams};
use crate::registry::{Admission, ContractRegistry};
use crate::resolver::Resolver;
use crate::settings::{NetworkSettings, SupervisorSettings};
use crate::storage::ContractStore;
use crate::types::{Contract, ContractKey, Network, TokenType};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub network: Network,
    /// Used only when nothing has been persisted for the chain yet.
    pub start_block: Option<u64>,
    pub pass_concurrency: usize,
    pub restart_on_error: bool,
    pub restart_delay: Duration,
    /// Distance between the cursor and the oldest unhandled block that triggers a warning.
    pub unhandled_lag_warn: u64,
}

impl SupervisorConfig {
    pub fn new(network: Network) -> Self {
        let defaults = SupervisorSettings::default();
        Self {
            network,
            start_block: None,
            pass_concurrency: defaults.pass_concurrency,
            restart_on_error: defaults.restart_on_error,
            restart_delay: Duration::from_secs(defaults.restart_delay_seconds),
            unhandled_lag_warn: defaults.unhandled_lag_warn_blocks,
        }
    }

    pub fn from_settings(net: &NetworkSettings, sup: &SupervisorSettings) -> Result<Self> {
        Ok(Self {
            network: net.network()?,
            start_block: net.start_block,
            pass_concurrency: sup.pass_concurrency.max(1),
            restart_on_error: sup.restart_on_error,
            restart_delay: Duration::from_secs(sup.restart_delay_seconds),
            unhandled_lag_warn: sup.unhandled_lag_warn_blocks,
        })
    }
}

enum Outcome {
    Promoted,
    AlreadyInitialized,
    Rejected,
}

pub struct Supervisor {
    config: SupervisorConfig,
    producer: Arc<dyn Producer>,
    classifier: Arc<dyn Classifier>,
    resolver: Arc<dyn Resolver>,
    store: Arc<dyn ContractStore>,
    registry: ContractRegistry,
    exceptions: ExceptionSet,
    cancel: CancellationToken,
    /// First block the producer has not been acknowledged for.
    next_block: AtomicU64,
    /// Saved but not yet handled blocks, number -> row id.
    unhandled: Mutex<BTreeMap<u64, i64>>,
    lagging: AtomicBool,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        producer: Arc<dyn Producer>,
        classifier: Arc<dyn Classifier>,
        resolver: Arc<dyn Resolver>,
        store: Arc<dyn ContractStore>,
        exceptions: ExceptionSet,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            producer,
            classifier,
            resolver,
            store,
            registry: ContractRegistry::new(),
            exceptions,
            cancel,
            next_block: AtomicU64::new(0),
            unhandled: Mutex::new(BTreeMap::new()),
            lagging: AtomicBool::new(false),
        }
    }

    pub fn network(&self) -> Network {
        self.config.network
    }

    pub fn registry(&self) -> &ContractRegistry {
        &self.registry
    }

    pub fn exceptions(&self) -> &ExceptionSet {
        &self.exceptions
    }

    pub fn next_block(&self) -> u64 {
        self.next_block.load(Ordering::SeqCst)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Seeds the Used set from storage and works out where scanning resumes.
    ///
    /// Errors here are fatal for the chain.
    pub async fn bootstrap(&self) -> Result<u64> {
        let chain_id = self.config.network.chain_id();

        let persisted = self.store.persisted_contracts(chain_id).await?;
        let seeded = persisted.len();
        self.registry
            .seed_used(persisted.into_iter().map(|a| ContractKey::new(chain_id, a)));

        let from = match self.store.last_block(chain_id).await? {
            Some(cursor) => cursor.resume_from(),
            None => match self.config.start_block {
                Some(b) => b,
                None => self.producer.head().await?,
            },
        };

        self.next_block.store(from, Ordering::SeqCst);
        metrics::set_cursor_block(self.config.network.name(), from);
        tracing::info!(
            network = %self.config.network,
            seeded,
            from,
            "🚀 supervisor bootstrapped"
        );
        Ok(from)
    }

    /// Runs until cancelled. Scan errors restart the session after `restart_delay`.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let span = tracing::info_span!("supervisor", network = %self.config.network);
        async move {
            let mut from = self.bootstrap().await?;
            loop {
                match self.clone().session(from).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        if self.cancel.is_cancelled() {
                            return Ok(());
                        }
                        if !self.config.restart_on_error || !e.is_retryable() {
                            tracing::error!(error = %e, "❌ scan session failed, giving up");
                            return Err(e);
                        }
                        tracing::warn!(
                            error = %e,
                            delay = ?self.config.restart_delay,
                            "⚠️ scan session failed, restarting"
                        );
                        tokio::select! {
                            _ = self.cancel.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(self.config.restart_delay) => {}
                        }
                        from = self.next_block();
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn session(self: Arc<Self>, from: u64) -> Result<()> {
        let session = self.cancel.child_token();
        let (ack_tx, ack_rx) = mpsc::channel(1);
        let (block_tx, block_rx) = mpsc::channel(1);

        let ProducerStreams {
            blocks,
            contracts,
            errors,
            handle,
        } = self.producer.produce(from, ack_rx, session.clone());

        let discovery = tokio::spawn(
            self.clone()
                .discover(contracts, blocks, errors, block_tx, session.clone())
                .in_current_span(),
        );
        let cursor = tokio::spawn(
            self.clone()
                .advance(block_rx, ack_tx, session.clone())
                .in_current_span(),
        );

        let (discovered, advanced) = tokio::join!(discovery, cursor);
        session.cancel();
        let produced = handle
            .await
            .map_err(|e| ForgeError::Transport(format!("producer task failed: {}", e)));

        produced.and(flatten(discovered)).and(flatten(advanced))
    }

    /// Discovery consumer. Contracts are always drained before the block that carried them is
    /// forwarded. The producer closing its streams outside of cancellation is an error.
    async fn discover(
        self: Arc<Self>,
        mut contracts: mpsc::Receiver<Contract>,
        mut blocks: mpsc::Receiver<u64>,
        mut errors: mpsc::Receiver<ForgeError>,
        block_tx: mpsc::Sender<u64>,
        session: CancellationToken,
    ) -> Result<()> {
        let (mut contracts_open, mut blocks_open, mut errors_open) = (true, true, true);
        loop {
            if !contracts_open && !blocks_open {
                if session.is_cancelled() {
                    return Ok(());
                }
                if let Ok(e) = errors.try_recv() {
                    return Err(e);
                }
                tracing::error!("❌ producer stopped without reporting an error");
                return Err(ForgeError::Transport("producer stopped".into()));
            }
            tokio::select! {
                biased;
                _ = session.cancelled() => return Ok(()),
                contract = contracts.recv(), if contracts_open => match contract {
                    Some(contract) => self.admit(contract),
                    None => contracts_open = false,
                },
                number = blocks.recv(), if blocks_open => match number {
                    Some(number) => {
                        while let Ok(contract) = contracts.try_recv() {
                            self.admit(contract);
                        }
                        tokio::select! {
                            _ = session.cancelled() => return Ok(()),
                            sent = block_tx.send(number) => {
                                if sent.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                    }
                    None => blocks_open = false,
                },
                e = errors.recv(), if errors_open => match e {
                    Some(e) => return Err(e),
                    None => errors_open = false,
                },
            }
        }
    }

    fn admit(&self, contract: Contract) {
        let address = contract.address;
        let block = contract.discovered_at_block;
        if self.registry.admit(contract) == Admission::Admitted {
            tracing::debug!(?address, block, "📥 admitted contract");
        }
    }

    /// Cursor consumer.
    async fn advance(
        self: Arc<Self>,
        mut block_rx: mpsc::Receiver<u64>,
        ack_tx: mpsc::Sender<()>,
        session: CancellationToken,
    ) -> Result<()> {
        let chain_id = self.config.network.chain_id();
        loop {
            let number = tokio::select! {
                _ = session.cancelled() => return Ok(()),
                n = block_rx.recv() => match n {
                    Some(n) => n,
                    None => return Ok(()),
                },
            };

            let block_id = match self.guard(self.store.save_block(number, chain_id)).await {
                Ok(id) => id,
                Err(ForgeError::Cancelled) => return Ok(()),
                Err(e) => {
                    tracing::error!(block = number, error = %e, "failed to record block");
                    session.cancel();
                    return Err(e);
                }
            };
            self.lock_unhandled().insert(number, block_id);

            self.run_pass().await;
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            self.mark_handled().await;
            self.report_unhandled(number);

            self.next_block.store(number + 1, Ordering::SeqCst);
            metrics::set_cursor_block(self.config.network.name(), number + 1);
            // Producer may already be gone after an error; the next recv tells us.
            let _ = ack_tx.send(()).await;
        }
    }

    fn lock_unhandled(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, i64>> {
        self.unhandled.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// One pass over every Discovered contract.
    pub async fn run_pass(&self) {
        let claimed = self.registry.claim_pending();
        if claimed.is_empty() {
            return;
        }
        tracing::debug!(contracts = claimed.len(), "🔄 processing pass");

        stream::iter(claimed)
            .for_each_concurrent(self.config.pass_concurrency, |contract| self.process(contract))
            .await;

        metrics::set_pending_contracts(self.config.network.name(), self.registry.pending_len());
    }

    async fn process(&self, mut contract: Contract) {
        let key = contract.key();
        let network = self.config.network.name();
        match self.process_inner(&mut contract).await {
            Ok(Outcome::Promoted) => {
                self.registry.promote(&key);
                metrics::increment_contracts(network, "promoted");
                tracing::info!(
                    address = ?key.address,
                    token_type = %contract.token_type,
                    "✅ contract persisted"
                );
            }
            Ok(Outcome::AlreadyInitialized) => {
                self.registry.promote(&key);
                tracing::debug!(address = ?key.address, "contract already initialized");
            }
            Ok(Outcome::Rejected) => {
                self.registry.reject(&key);
                self.exceptions.insert(key.address);
                metrics::increment_contracts(network, "rejected");
                tracing::info!(address = ?key.address, "🚫 not a token contract, excluded");
            }
            Err(ForgeError::Cancelled) => self.registry.release(contract),
            Err(e) => {
                metrics::increment_contracts(network, "failed");
                tracing::warn!(
                    address = ?key.address,
                    error = %e,
                    kind = e.kind(),
                    "⚠️ contract stays pending"
                );
                self.registry.release(contract);
            }
        }
    }

    async fn process_inner(&self, contract: &mut Contract) -> Result<Outcome> {
        let chain_id = contract.chain_id();
        let address = contract.address;

        if self.guard(self.store.initialized(contract)).await? {
            return Ok(Outcome::AlreadyInitialized);
        }

        let token_type = self
            .guard(self.classifier.classify(chain_id, address))
            .await?;
        contract.token_type = token_type;
        if token_type == TokenType::Unknown {
            return Ok(Outcome::Rejected);
        }

        if contract.deployment.is_none() {
            let deployment = self
                .guard(self.resolver.resolve_one(chain_id, address))
                .await?;
            contract.deployment = Some(deployment);
        }

        let contract_id = self.guard(self.store.save_contract(contract)).await?;
        let block_id = self
            .lock_unhandled()
            .get(&contract.discovered_at_block)
            .copied();
        self.guard(self.store.save_contract_forge(block_id, contract_id))
            .await?;
        Ok(Outcome::Promoted)
    }

    /// Marks, lowest first, every saved block below the pending floor. Stops at the first
    /// failure so the handled prefix never has gaps.
    async fn mark_handled(&self) {
        let chain_id = self.config.network.chain_id();
        let floor = self.registry.pending_floor().unwrap_or(u64::MAX);
        let ready: Vec<u64> = self
            .lock_unhandled()
            .range(..floor)
            .map(|(n, _)| *n)
            .collect();

        for number in ready {
            match self.guard(self.store.block_handled(number, chain_id)).await {
                Ok(()) => {
                    self.lock_unhandled().remove(&number);
                    tracing::trace!(block = number, "block handled");
                }
                Err(ForgeError::Cancelled) => return,
                Err(e) => {
                    tracing::warn!(block = number, error = %e, "failed to mark block handled");
                    return;
                }
            }
        }
    }

    /// Publishes the unhandled backlog and warns once when its oldest block falls too far behind.
    fn report_unhandled(&self, cursor: u64) {
        let (len, oldest) = {
            let unhandled = self.lock_unhandled();
            (unhandled.len(), unhandled.keys().next().copied())
        };
        metrics::set_unhandled_blocks(self.config.network.name(), len);

        match oldest {
            Some(oldest) if cursor.saturating_sub(oldest) >= self.config.unhandled_lag_warn => {
                if !self.lagging.swap(true, Ordering::SeqCst) {
                    tracing::warn!(
                        oldest,
                        cursor,
                        backlog = len,
                        pending = self.registry.pending_len(),
                        "⚠️ unhandled blocks are falling behind, a contract keeps failing"
                    );
                }
            }
            _ => {
                if self.lagging.swap(false, Ordering::SeqCst) {
                    tracing::info!(cursor, "unhandled backlog caught up");
                }
            }
        }
    }

    /// True while the oldest unhandled block lags the cursor by at least `unhandled_lag_warn`.
    pub fn is_lagging(&self) -> bool {
        self.lagging.load(Ordering::SeqCst)
    }

    /// Blocks that were saved but are still waiting on pending contracts.
    pub fn unhandled_blocks(&self) -> HashSet<u64> {
        self.lock_unhandled().keys().copied().collect()
    }

    async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ForgeError::Cancelled),
            r = fut => r,
        }
    }
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(r) => r,
        Err(e) => Err(ForgeError::Transport(format!("supervisor task aborted: {}", e))),
    }
}
