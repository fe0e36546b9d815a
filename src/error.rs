use std::time::Duration;

use ethers::types::Address;

use crate::types::ChainId;

/// Substrings a node puts in the error message when a call reverted.
const REVERT_MARKERS: [&str; 4] = [
    "execution reverted",
    "invalid opcode",
    "invalid jump destination",
    "unmarshal an empty string",
];

pub type Result<T, E = ForgeError> = std::result::Result<T, E>;

/// Errors produced by the discovery pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("no data found for {address:?} on chain {chain_id}")]
    ResolutionNotFound { chain_id: ChainId, address: Address },
    #[error("explorer error: {0}")]
    Explorer(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unsupported chain id {0}")]
    UnsupportedChain(ChainId),
    #[error("subgraph deployer failed: {0}")]
    Deployer(String),
    #[error("{0} is not implemented")]
    Unimplemented(&'static str),
    #[error("cancelled")]
    Cancelled,
}

impl ForgeError {
    /// True when a transport failure is really the node reporting a reverted call.
    pub fn is_revert(&self) -> bool {
        match self {
            ForgeError::Transport(msg) => {
                let msg = msg.to_ascii_lowercase();
                REVERT_MARKERS.iter().any(|m| msg.contains(m))
            }
            _ => false,
        }
    }

    /// Whether the failed operation may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ForgeError::Transport(_)
                | ForgeError::Timeout(_)
                | ForgeError::ResolutionNotFound { .. }
                | ForgeError::Explorer(_)
                | ForgeError::Decode(_)
                | ForgeError::Persistence(_)
        )
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ForgeError::Transport(_) => "transport",
            ForgeError::Timeout(_) => "timeout",
            ForgeError::ResolutionNotFound { .. } => "not_found",
            ForgeError::Explorer(_) => "explorer",
            ForgeError::Decode(_) => "decode",
            ForgeError::Persistence(_) => "persistence",
            ForgeError::Config(_) => "config",
            ForgeError::UnsupportedChain(_) => "unsupported_chain",
            ForgeError::Deployer(_) => "deployer",
            ForgeError::Unimplemented(_) => "unimplemented",
            ForgeError::Cancelled => "cancelled",
        }
    }
}

impl From<sqlx::Error> for ForgeError {
    fn from(e: sqlx::Error) -> Self {
        ForgeError::Persistence(e.to_string())
    }
}

impl From<reqwest::Error> for ForgeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ForgeError::Transport(format!("explorer request timed out: {}", e))
        } else if e.is_decode() {
            ForgeError::Decode(e.to_string())
        } else {
            ForgeError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ForgeError {
    fn from(e: serde_json::Error) -> Self {
        ForgeError::Decode(e.to_string())
    }
}

impl From<config::ConfigError> for ForgeError {
    fn from(e: config::ConfigError) -> Self {
        ForgeError::Config(e.to_string())
    }
}

impl From<ethers::providers::ProviderError> for ForgeError {
    fn from(e: ethers::providers::ProviderError) -> Self {
        ForgeError::Transport(e.to_string())
    }
}
