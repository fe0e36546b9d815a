use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ForgeError;

/// EIP-155 chain identifier.
pub type ChainId = u64;

/// Networks the pipeline knows how to scan and resolve against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Sepolia,
    Holesky,
}

impl Network {
    pub const ALL: [Network; 3] = [Network::Mainnet, Network::Sepolia, Network::Holesky];

    pub fn name(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Sepolia => "sepolia",
            Network::Holesky => "holesky",
        }
    }

    pub fn chain_id(&self) -> ChainId {
        match self {
            Network::Mainnet => 1,
            Network::Sepolia => 11_155_111,
            Network::Holesky => 17_000,
        }
    }

    pub fn from_chain_id(chain_id: ChainId) -> Result<Self, ForgeError> {
        Self::ALL
            .into_iter()
            .find(|n| n.chain_id() == chain_id)
            .ok_or(ForgeError::UnsupportedChain(chain_id))
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Network {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "ethereum" => Ok(Network::Mainnet),
            "sepolia" => Ok(Network::Sepolia),
            "holesky" => Ok(Network::Holesky),
            other => Err(ForgeError::Config(format!("unknown network '{}'", other))),
        }
    }
}

/// Token standard a contract was classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenType {
    Erc20,
    Erc721,
    Erc1155,
    Unknown,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Erc20 => "ERC20",
            TokenType::Erc721 => "ERC721",
            TokenType::Erc1155 => "ERC1155",
            TokenType::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenType {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ERC20" => Ok(TokenType::Erc20),
            "ERC721" => Ok(TokenType::Erc721),
            "ERC1155" => Ok(TokenType::Erc1155),
            "Unknown" => Ok(TokenType::Unknown),
            other => Err(ForgeError::Decode(format!("unknown token type '{}'", other))),
        }
    }
}

/// Identity of a contract across chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContractKey {
    pub chain_id: ChainId,
    pub address: Address,
}

impl ContractKey {
    pub fn new(chain_id: ChainId, address: Address) -> Self {
        Self { chain_id, address }
    }
}

impl fmt::Display for ContractKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.chain_id, self.address)
    }
}

/// Contract-creation metadata returned by the block explorer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub contract_address: Address,
    pub creator: Address,
    pub tx_hash: H256,
    pub block_number: u64,
    pub timestamp: Option<DateTime<Utc>>,
    pub factory: Option<Address>,
    pub creation_bytecode: Bytes,
}

/// A token contract observed on chain.
///
/// `token_type` starts as the hint derived from the log that surfaced the contract and is
/// overwritten by the classifier; `deployment` is filled by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub network: Network,
    pub address: Address,
    pub token_type: TokenType,
    pub deployment: Option<Deployment>,
    pub discovered_at_block: u64,
}

impl Contract {
    pub fn new(network: Network, address: Address, token_type: TokenType, block: u64) -> Self {
        Self {
            network,
            address,
            token_type,
            deployment: None,
            discovered_at_block: block,
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.network.chain_id()
    }

    pub fn key(&self) -> ContractKey {
        ContractKey::new(self.chain_id(), self.address)
    }

    /// Subgraph identifier, `network/0xaddress`.
    pub fn subgraph_id(&self) -> String {
        format!("{}/{:?}", self.network.name(), self.address)
    }
}

/// Persisted scan position for a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCursor {
    pub chain_id: ChainId,
    pub block_number: u64,
    pub is_handled: bool,
}

impl BlockCursor {
    /// First block the walker must fetch when resuming from this cursor.
    pub fn resume_from(&self) -> u64 {
        if self.is_handled {
            self.block_number + 1
        } else {
            self.block_number
        }
    }
}
