//! # Graph Forge
//!
//! Discovers token contracts (ERC20, ERC721, ERC1155) as they appear on Ethereum networks,
//! resolves how they were deployed and records them so that a subgraph can be created for each.
//!
//! ## Overview
//!
//! - **Discovery**: a block walker reads receipts one block at a time and extracts every
//!   address that emitted a transfer-like event.
//! - **Classification**: ERC-165 probes, a log-history fallback for ERC1155 and a
//!   `balanceOf` heuristic for ERC20.
//! - **Resolution**: creator, transaction and block of each contract from a block explorer,
//!   behind a shared rate limiter.
//! - **Supervision**: New/Used bookkeeping per network with a crash-safe block cursor.
//! - **Subgraphs**: request-driven creation through the Graph CLI.

// Core Types
/// Networks, token types, contracts and cursors
pub mod types;
/// Error taxonomy
pub mod error;

// Discovery Layer
/// Chain access behind a trait
pub mod chain;
/// Block walker
pub mod producer;
/// Addresses that are never considered
pub mod exceptions;
/// Token standard ABIs and event topics
pub mod contracts;

// Classification & Resolution
/// Token type detection
pub mod classifier;
/// Block explorer client
pub mod resolver;
/// Explorer request budget
pub mod rate_limiter;

// Supervision
/// New/Used sets
pub mod registry;
/// Per-network pipeline driver
pub mod supervisor;

// Infrastructure
/// Persistence boundary and in-memory store
pub mod storage;
/// PostgreSQL store
pub mod database;
/// Metrics and observability
pub mod metrics;
/// Graph CLI and subgraph service
pub mod subgraph;

// Settings & Configuration
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use classifier::{Classifier, ProbeClassifier};
pub use error::{ForgeError, Result};
pub use producer::{BlockWalker, Producer};
pub use resolver::{ExplorerResolver, Resolver};
pub use settings::Settings;
pub use storage::ContractStore;
pub use subgraph::{GraphCli, SubgraphService};
pub use supervisor::Supervisor;
pub use types::{Contract, Deployment, Network, TokenType};
