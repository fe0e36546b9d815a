//! # Deployment Resolver
//!
//! Looks up contract-creation metadata through an Etherscan-compatible
//! `module=contract&action=getcontractcreation` endpoint.
//!
//! Every HTTP request first takes a permit from the shared [`ExplorerRateLimiter`], so the
//! configured quota holds across all chains. Batch lookups are split into chunks of at most
//! `batch_size` addresses and each chunk is one request.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use ethers::types::{Address, Bytes, H256};
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ForgeError, Result};
use crate::metrics;
use crate::rate_limiter::ExplorerRateLimiter;
use crate::settings::ExplorerSettings;
use crate::types::{ChainId, Deployment, Network};

const NO_DATA_FOUND: &str = "No data found";

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve_one(&self, chain_id: ChainId, address: Address) -> Result<Deployment>;

    /// All-or-nothing: any failed chunk fails the whole call.
    async fn resolve_batch(&self, chain_id: ChainId, addresses: &[Address]) -> Result<Vec<Deployment>>;
}

/// Default explorer API base URL for a network.
pub fn default_endpoint(network: Network) -> &'static str {
    match network {
        Network::Mainnet => "https://api.etherscan.io/api",
        Network::Sepolia => "https://api-sepolia.etherscan.io/api",
        Network::Holesky => "https://api-holesky.etherscan.io/api",
    }
}

#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    #[serde(default)]
    message: Option<String>,
    result: ExplorerResult,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExplorerResult {
    Records(Vec<CreationRecord>),
    Message(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreationRecord {
    #[serde(default)]
    contract_address: Option<String>,
    contract_creator: String,
    tx_hash: String,
    #[serde(default)]
    block_number: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    contract_factory: Option<String>,
    #[serde(default)]
    creation_bytecode: Option<String>,
}

fn parse_address(field: &str, raw: &str) -> Result<Address> {
    Address::from_str(raw.trim())
        .map_err(|e| ForgeError::Decode(format!("{} '{}': {}", field, raw, e)))
}

fn non_empty(raw: &Option<String>) -> Option<&str> {
    raw.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl CreationRecord {
    fn into_deployment(self, fallback: Option<Address>) -> Result<Deployment> {
        let contract_address = match non_empty(&self.contract_address) {
            Some(raw) => parse_address("contractAddress", raw)?,
            None => fallback.ok_or_else(|| {
                ForgeError::Decode("record without contractAddress in a multi-address reply".into())
            })?,
        };
        let tx_hash = H256::from_str(self.tx_hash.trim())
            .map_err(|e| ForgeError::Decode(format!("txHash '{}': {}", self.tx_hash, e)))?;
        let block_number = match non_empty(&self.block_number) {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|e| ForgeError::Decode(format!("blockNumber '{}': {}", raw, e)))?,
            None => 0,
        };
        let timestamp = match non_empty(&self.timestamp) {
            Some(raw) => {
                let secs = raw
                    .parse::<i64>()
                    .map_err(|e| ForgeError::Decode(format!("timestamp '{}': {}", raw, e)))?;
                Utc.timestamp_opt(secs, 0).single()
            }
            None => None,
        };
        let factory = match non_empty(&self.contract_factory) {
            Some(raw) => Some(parse_address("contractFactory", raw)?),
            None => None,
        };
        let creation_bytecode = match non_empty(&self.creation_bytecode) {
            Some(raw) => Bytes::from(
                hex::decode(raw.trim_start_matches("0x"))
                    .map_err(|e| ForgeError::Decode(format!("creationBytecode: {}", e)))?,
            ),
            None => Bytes::new(),
        };

        Ok(Deployment {
            contract_address,
            creator: parse_address("contractCreator", &self.contract_creator)?,
            tx_hash,
            block_number,
            timestamp,
            factory,
            creation_bytecode,
        })
    }
}

/// Turns a raw explorer reply into deployments for `requested`.
fn parse_reply(chain_id: ChainId, requested: &[Address], body: &str) -> Result<Vec<Deployment>> {
    let reply: ExplorerResponse = serde_json::from_str(body)?;
    let not_found = || ForgeError::ResolutionNotFound {
        chain_id,
        address: requested.first().copied().unwrap_or_default(),
    };

    let records = match reply.result {
        ExplorerResult::Records(records) => records,
        ExplorerResult::Message(msg) => {
            if msg.contains(NO_DATA_FOUND)
                || reply.message.as_deref().is_some_and(|m| m.contains(NO_DATA_FOUND))
            {
                return Err(not_found());
            }
            return Err(ForgeError::Explorer(msg));
        }
    };
    if records.is_empty() {
        return Err(not_found());
    }

    let positional = records.len() == requested.len();
    records
        .into_iter()
        .enumerate()
        .map(|(i, r)| {
            let fallback = if positional { requested.get(i).copied() } else { None };
            r.into_deployment(fallback)
        })
        .collect()
}

pub struct ExplorerResolver {
    http: reqwest::Client,
    limiter: ExplorerRateLimiter,
    api_key: String,
    endpoints: HashMap<ChainId, String>,
    batch_size: usize,
}

impl ExplorerResolver {
    pub fn new(settings: &ExplorerSettings, limiter: ExplorerRateLimiter) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()?;

        let mut endpoints: HashMap<ChainId, String> = Network::ALL
            .iter()
            .map(|n| (n.chain_id(), default_endpoint(*n).to_string()))
            .collect();
        for (name, url) in &settings.endpoints {
            let network: Network = name.parse()?;
            endpoints.insert(network.chain_id(), url.clone());
        }

        Ok(Self {
            http,
            limiter,
            api_key: settings.api_key.clone(),
            endpoints,
            batch_size: settings.batch_size.max(1),
        })
    }

    pub fn with_endpoint(mut self, chain_id: ChainId, url: impl Into<String>) -> Self {
        self.endpoints.insert(chain_id, url.into());
        self
    }

    fn endpoint(&self, chain_id: ChainId) -> Result<&str> {
        self.endpoints
            .get(&chain_id)
            .map(String::as_str)
            .ok_or(ForgeError::UnsupportedChain(chain_id))
    }

    async fn fetch(&self, chain_id: ChainId, addresses: &[Address]) -> Result<Vec<Deployment>> {
        let endpoint = self.endpoint(chain_id)?;
        let joined = addresses
            .iter()
            .map(|a| format!("{:?}", a))
            .collect::<Vec<_>>()
            .join(",");

        self.limiter.acquire().await;
        log::debug!(
            "[Resolver] getcontractcreation chain={} addresses={}",
            chain_id,
            joined
        );

        let outcome = async {
            let resp = self
                .http
                .get(endpoint)
                .query(&[
                    ("module", "contract"),
                    ("action", "getcontractcreation"),
                    ("contractaddresses", joined.as_str()),
                    ("apikey", self.api_key.as_str()),
                ])
                .send()
                .await?;
            let status = resp.status();
            let body = resp.text().await?;
            if !status.is_success() {
                return Err(ForgeError::Explorer(format!("HTTP {}: {}", status, body.trim())));
            }
            parse_reply(chain_id, addresses, &body)
        }
        .await;

        match &outcome {
            Ok(_) => metrics::increment_explorer_requests("ok"),
            Err(ForgeError::ResolutionNotFound { .. }) => {
                log::debug!("[Resolver] no deployment data for {}", joined);
                metrics::increment_explorer_requests("not_found")
            }
            Err(e) => {
                log::warn!("⚠️ [Resolver] explorer request failed for {}: {}", joined, e);
                metrics::increment_explorer_requests("error")
            }
        }
        outcome
    }
}

#[async_trait]
impl Resolver for ExplorerResolver {
    async fn resolve_one(&self, chain_id: ChainId, address: Address) -> Result<Deployment> {
        let deployments = self.fetch(chain_id, &[address]).await?;
        deployments
            .into_iter()
            .find(|d| d.contract_address == address)
            .ok_or(ForgeError::ResolutionNotFound { chain_id, address })
    }

    async fn resolve_batch(&self, chain_id: ChainId, addresses: &[Address]) -> Result<Vec<Deployment>> {
        let mut out = Vec::with_capacity(addresses.len());
        for chunk in addresses.chunks(self.batch_size) {
            out.extend(self.fetch(chain_id, chunk).await?);
        }
        Ok(out)
    }
}
