use config::{Config, Environment, File, FileFormat};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::error::ForgeError;
use crate::types::Network;

const DEFAULT_CONFIG_PATH: &str = "Config.toml";

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkSettings {
    pub name: String,
    pub rpc_url: String,
    /// Block to start from when no cursor has been persisted yet. Chain head when unset.
    #[serde(default)]
    pub start_block: Option<u64>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Known non-token emitters skipped by the block walker.
    #[serde(default)]
    pub exceptions: Vec<Address>,
}

impl NetworkSettings {
    pub fn network(&self) -> Result<Network, ForgeError> {
        self.name.parse()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_poll_interval_ms() -> u64 {
    4000
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExplorerSettings {
    #[serde(default)]
    pub api_key: String,
    /// Shared across every chain.
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    /// Max addresses per `getcontractcreation` request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_explorer_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Per-network endpoint overrides, keyed by network name.
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
}

fn default_requests_per_second() -> u32 {
    5
}
fn default_batch_size() -> usize {
    5
}
fn default_explorer_timeout_seconds() -> u64 {
    10
}

impl Default for ExplorerSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            requests_per_second: default_requests_per_second(),
            batch_size: default_batch_size(),
            timeout_seconds: default_explorer_timeout_seconds(),
            endpoints: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierSettings {
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_log_scan_timeout_ms")]
    pub log_scan_timeout_ms: u64,
    /// How many blocks back from head the ERC-1155 log fallback looks.
    #[serde(default = "default_log_scan_window")]
    pub log_scan_window: u64,
    /// Blocks per `eth_getLogs` request inside the window.
    #[serde(default = "default_log_scan_chunk")]
    pub log_scan_chunk: u64,
}

fn default_probe_timeout_ms() -> u64 {
    2000
}
fn default_log_scan_timeout_ms() -> u64 {
    15000
}
fn default_log_scan_window() -> u64 {
    50_000
}
fn default_log_scan_chunk() -> u64 {
    5_000
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            log_scan_timeout_ms: default_log_scan_timeout_ms(),
            log_scan_window: default_log_scan_window(),
            log_scan_chunk: default_log_scan_chunk(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorSettings {
    #[serde(default = "default_contract_channel_capacity")]
    pub contract_channel_capacity: usize,
    /// Contracts processed concurrently within one pass.
    #[serde(default = "default_pass_concurrency")]
    pub pass_concurrency: usize,
    #[serde(default = "default_true")]
    pub restart_on_error: bool,
    #[serde(default = "default_restart_delay_seconds")]
    pub restart_delay_seconds: u64,
    /// Warn once the oldest unhandled block is this far behind the cursor.
    #[serde(default = "default_unhandled_lag_warn_blocks")]
    pub unhandled_lag_warn_blocks: u64,
}

fn default_contract_channel_capacity() -> usize {
    1024
}
fn default_pass_concurrency() -> usize {
    8
}
fn default_restart_delay_seconds() -> u64 {
    10
}
fn default_unhandled_lag_warn_blocks() -> u64 {
    1000
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            contract_channel_capacity: default_contract_channel_capacity(),
            pass_concurrency: default_pass_concurrency(),
            restart_on_error: true,
            restart_delay_seconds: default_restart_delay_seconds(),
            unhandled_lag_warn_blocks: default_unhandled_lag_warn_blocks(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SubgraphSettings {
    /// Directory `graph init` scaffolds projects into.
    #[serde(default = "default_subgraph_root")]
    pub root: String,
    #[serde(default = "default_graph_node_url")]
    pub node_url: String,
    #[serde(default = "default_abi_path")]
    pub abi_path: String,
    #[serde(default = "default_graph_program")]
    pub program: String,
    #[serde(default = "default_version_label")]
    pub version_label: String,
}

fn default_subgraph_root() -> String {
    "subgraphs".to_string()
}
fn default_graph_node_url() -> String {
    "http://localhost:8020".to_string()
}
fn default_abi_path() -> String {
    "../abi.json".to_string()
}
fn default_graph_program() -> String {
    "graph".to_string()
}
fn default_version_label() -> String {
    "v0.0.1".to_string()
}

impl Default for SubgraphSettings {
    fn default() -> Self {
        Self {
            root: default_subgraph_root(),
            node_url: default_graph_node_url(),
            abi_path: default_abi_path(),
            program: default_graph_program(),
            version_label: default_version_label(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

fn default_metrics_listen() -> String {
    "0.0.0.0:9100".to_string()
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub networks: Vec<NetworkSettings>,
    #[serde(default)]
    pub explorer: ExplorerSettings,
    #[serde(default)]
    pub classifier: ClassifierSettings,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub subgraph: SubgraphSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl Settings {
    /// Loads `Config.toml` (or `$FORGE_CONFIG`), then `FORGE__SECTION__KEY` overrides.
    pub fn new() -> Result<Self, ForgeError> {
        let path = env::var("FORGE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let s = Config::builder()
            .add_source(File::with_name(&path))
            .add_source(
                Environment::with_prefix("FORGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ForgeError> {
        let s = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?;
        let settings: Self = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                self.database.url = Some(url.trim().to_string());
            }
        }
        if let Ok(key) = env::var("FORGE_EXPLORER_API_KEY") {
            if !key.trim().is_empty() {
                self.explorer.api_key = key.trim().to_string();
            }
        }
        // FORGE_RPC_MAINNET, FORGE_RPC_SEPOLIA, ...
        for net in self.networks.iter_mut() {
            let var = format!("FORGE_RPC_{}", net.name.to_ascii_uppercase());
            if let Ok(url) = env::var(&var) {
                if !url.trim().is_empty() {
                    net.rpc_url = url.trim().to_string();
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ForgeError> {
        if self.networks.is_empty() {
            return Err(ForgeError::Config("no [[networks]] configured".into()));
        }
        for net in &self.networks {
            net.network()?;
            if net.rpc_url.trim().is_empty() {
                return Err(ForgeError::Config(format!("network '{}' has no rpc_url", net.name)));
            }
        }
        if self.explorer.requests_per_second == 0 {
            return Err(ForgeError::Config("explorer.requests_per_second must be > 0".into()));
        }
        if self.explorer.batch_size == 0 {
            return Err(ForgeError::Config("explorer.batch_size must be > 0".into()));
        }
        if self.classifier.log_scan_chunk == 0 {
            return Err(ForgeError::Config("classifier.log_scan_chunk must be > 0".into()));
        }
        if self.supervisor.contract_channel_capacity == 0 || self.supervisor.pass_concurrency == 0 {
            return Err(ForgeError::Config(
                "supervisor.contract_channel_capacity and pass_concurrency must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn network(&self, network: Network) -> Option<&NetworkSettings> {
        self.networks
            .iter()
            .find(|n| n.network().map(|x| x == network).unwrap_or(false))
    }

    pub fn enabled_networks(&self) -> impl Iterator<Item = &NetworkSettings> {
        self.networks.iter().filter(|n| n.enabled)
    }
}
