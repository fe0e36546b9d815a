//! Token standard detection.
//!
//! Probes run in a fixed order and the first positive answer wins:
//! ERC-721 via ERC-165, ERC-1155 via ERC-165, ERC-1155 via recent `TransferSingle` /
//! `TransferBatch` logs, then ERC-20 via `balanceOf(0x0)`. A revert or an empty/garbled
//! return counts as "no"; any other RPC failure aborts classification.

use async_trait::async_trait;
use ethers::abi::{AbiDecode, AbiEncode};
use ethers::types::{Address, Bytes, Filter};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::chain::ChainClient;
use crate::contracts::{
    BalanceOfCall, SupportsInterfaceCall, ERC1155_INTERFACE_ID, ERC721_INTERFACE_ID,
    TRANSFER_BATCH_TOPIC, TRANSFER_SINGLE_TOPIC,
};
use crate::error::{ForgeError, Result};
use crate::settings::ClassifierSettings;
use crate::types::{ChainId, TokenType};

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, chain_id: ChainId, address: Address) -> Result<TokenType>;
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    pub probe_timeout: Duration,
    pub log_scan_timeout: Duration,
    pub log_scan_window: u64,
    pub log_scan_chunk: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ClassifierSettings::default().into()
    }
}

impl From<ClassifierSettings> for ProbeConfig {
    fn from(s: ClassifierSettings) -> Self {
        Self {
            probe_timeout: Duration::from_millis(s.probe_timeout_ms),
            log_scan_timeout: Duration::from_millis(s.log_scan_timeout_ms),
            log_scan_window: s.log_scan_window,
            log_scan_chunk: s.log_scan_chunk.max(1),
        }
    }
}

/// Classifier that probes contracts over JSON-RPC, one client per chain.
pub struct ProbeClassifier {
    clients: HashMap<ChainId, Arc<dyn ChainClient>>,
    config: ProbeConfig,
}

impl ProbeClassifier {
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            clients: HashMap::new(),
            config,
        }
    }

    pub fn with_chain(mut self, chain_id: ChainId, client: Arc<dyn ChainClient>) -> Self {
        self.clients.insert(chain_id, client);
        self
    }

    fn client(&self, chain_id: ChainId) -> Result<&Arc<dyn ChainClient>> {
        self.clients
            .get(&chain_id)
            .ok_or(ForgeError::UnsupportedChain(chain_id))
    }

    async fn supports_interface(
        &self,
        client: &dyn ChainClient,
        address: Address,
        interface_id: [u8; 4],
    ) -> Result<bool> {
        let data = SupportsInterfaceCall { interface_id }.encode();
        let raw = match with_timeout(self.config.probe_timeout, client.call(address, data.into()))
            .await
        {
            Ok(raw) => raw,
            Err(e) if e.is_revert() => return Ok(false),
            Err(e) => return Err(e),
        };
        // Non-165 contracts often return nothing or junk from the fallback.
        Ok(bool::decode(raw.as_ref()).unwrap_or(false))
    }

    /// Scans `[head - window, head]` newest chunk first, stopping at the first hit.
    async fn has_1155_transfer_logs(&self, client: &dyn ChainClient, address: Address) -> Result<bool> {
        let head = with_timeout(self.config.probe_timeout, client.block_number()).await?;
        let from = head.saturating_sub(self.config.log_scan_window);
        let chunk = self.config.log_scan_chunk.max(1);

        let mut end = head;
        loop {
            let start = end.saturating_sub(chunk - 1).max(from);
            let filter = Filter::new()
                .address(address)
                .topic0(vec![*TRANSFER_SINGLE_TOPIC, *TRANSFER_BATCH_TOPIC])
                .from_block(start)
                .to_block(end);
            let logs = with_timeout(self.config.log_scan_timeout, client.logs(&filter)).await?;
            if !logs.is_empty() {
                return Ok(true);
            }
            if start == from {
                return Ok(false);
            }
            end = start - 1;
        }
    }

    async fn answers_balance_of(&self, client: &dyn ChainClient, address: Address) -> Result<bool> {
        let data = BalanceOfCall {
            account: Address::zero(),
        }
        .encode();
        match with_timeout(self.config.probe_timeout, client.call(address, Bytes::from(data))).await {
            Ok(raw) => Ok(!raw.is_empty()),
            Err(e) if e.is_revert() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ForgeError::Timeout(limit))?
}

#[async_trait]
impl Classifier for ProbeClassifier {
    async fn classify(&self, chain_id: ChainId, address: Address) -> Result<TokenType> {
        let client = self.client(chain_id)?.as_ref();

        if self.supports_interface(client, address, ERC721_INTERFACE_ID).await? {
            log::debug!("[Classifier] {:?} supports ERC-721", address);
            return Ok(TokenType::Erc721);
        }
        if self.supports_interface(client, address, ERC1155_INTERFACE_ID).await? {
            log::debug!("[Classifier] {:?} supports ERC-1155", address);
            return Ok(TokenType::Erc1155);
        }
        if self.has_1155_transfer_logs(client, address).await? {
            log::debug!("[Classifier] {:?} emitted ERC-1155 transfers", address);
            return Ok(TokenType::Erc1155);
        }
        if self.answers_balance_of(client, address).await? {
            return Ok(TokenType::Erc20);
        }
        log::debug!("[Classifier] {:?} matched no token standard", address);
        Ok(TokenType::Unknown)
    }
}
