//! # Graph Forge
//!
//! Long-running token discovery service plus one-shot subgraph commands.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin graph_forge -- run
//! cargo run --bin graph_forge -- run --dry-run
//! cargo run --bin graph_forge -- classify --network sepolia --address 0x...
//! cargo run --bin graph_forge -- create-subgraph --network sepolia --address 0x...
//! ```
//!
//! Press Ctrl+C to stop gracefully.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ethers::types::Address;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use graph_forge::chain::{ChainClient, EthersChainClient};
use graph_forge::classifier::{Classifier, ProbeClassifier, ProbeConfig};
use graph_forge::database::{self, PgStore};
use graph_forge::exceptions::ExceptionSet;
use graph_forge::metrics;
use graph_forge::producer::BlockWalker;
use graph_forge::rate_limiter::ExplorerRateLimiter;
use graph_forge::resolver::ExplorerResolver;
use graph_forge::settings::Settings;
use graph_forge::storage::{ContractStore, MemoryStore};
use graph_forge::subgraph::{GraphCli, SubgraphService};
use graph_forge::supervisor::{Supervisor, SupervisorConfig};
use graph_forge::types::{ChainId, Network};

#[derive(Parser, Debug)]
#[command(name = "graph_forge")]
#[command(about = "Discover token contracts and forge subgraphs for them", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan every enabled network until Ctrl+C
    Run {
        /// Keep everything in memory instead of PostgreSQL
        #[arg(long)]
        dry_run: bool,
    },
    /// Classify, resolve and deploy a subgraph for one contract
    CreateSubgraph {
        #[arg(long)]
        network: Network,
        #[arg(long, value_parser = parse_address)]
        address: Address,
    },
    /// Print the token type of a contract
    Classify {
        #[arg(long)]
        network: Network,
        #[arg(long, value_parser = parse_address)]
        address: Address,
    },
}

fn parse_address(raw: &str) -> std::result::Result<Address, String> {
    raw.parse::<Address>()
        .map_err(|e| format!("invalid address '{}': {}", raw, e))
}

/// Per-network RPC clients, shared by the walker and the classifier.
fn chain_clients(settings: &Settings) -> Result<HashMap<ChainId, Arc<dyn ChainClient>>> {
    let mut clients = HashMap::new();
    for net in &settings.networks {
        let network = net.network()?;
        let client = EthersChainClient::connect_http(&net.rpc_url)?;
        clients.insert(network.chain_id(), Arc::new(client) as Arc<dyn ChainClient>);
    }
    Ok(clients)
}

fn classifier(settings: &Settings, clients: &HashMap<ChainId, Arc<dyn ChainClient>>) -> ProbeClassifier {
    clients.iter().fold(
        ProbeClassifier::new(ProbeConfig::from(settings.classifier.clone())),
        |c, (chain_id, client)| c.with_chain(*chain_id, client.clone()),
    )
}

async fn store(settings: &Settings, dry_run: bool) -> Result<Arc<dyn ContractStore>> {
    if dry_run {
        log::warn!("⚠️ dry run: nothing will be persisted");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let url = settings
        .database
        .url
        .as_deref()
        .context("DATABASE_URL (or database.url) is required unless --dry-run is set")?;
    let pool = database::connect(url, settings.database.max_connections).await?;
    println!("✅ Database connected");
    Ok(Arc::new(PgStore::new(pool)))
}

async fn run(settings: Settings, dry_run: bool) -> Result<()> {
    if settings.metrics.enabled {
        metrics::install_exporter(&settings.metrics.listen)?;
    }

    let clients = chain_clients(&settings)?;
    let classifier: Arc<dyn Classifier> = Arc::new(classifier(&settings, &clients));
    let limiter = ExplorerRateLimiter::new(settings.explorer.requests_per_second)?;
    let resolver = Arc::new(ExplorerResolver::new(&settings.explorer, limiter)?);
    let store = store(&settings, dry_run).await?;

    let cancel = CancellationToken::new();
    let mut handles = Vec::new();

    for net in settings.enabled_networks() {
        let network = net.network()?;
        let client = clients
            .get(&network.chain_id())
            .cloned()
            .context("missing rpc client")?;
        let exceptions = ExceptionSet::from_addresses(net.exceptions.iter().copied());
        let walker = BlockWalker::new(
            network,
            client,
            exceptions.clone(),
            net.poll_interval(),
            settings.supervisor.contract_channel_capacity,
        );
        let supervisor = Arc::new(Supervisor::new(
            SupervisorConfig::from_settings(net, &settings.supervisor)?,
            Arc::new(walker),
            classifier.clone(),
            resolver.clone(),
            store.clone(),
            exceptions,
            cancel.child_token(),
        ));
        println!("✅ Supervisor ready for {}", network);
        handles.push((network, tokio::spawn(supervisor.run())));
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n🛑 Shutdown signal received, stopping supervisors...");
            shutdown.cancel();
        }
    });

    let mut failed = 0;
    for (network, handle) in handles {
        match handle.await {
            Ok(Ok(())) => log::info!("[{}] supervisor stopped", network),
            Ok(Err(e)) => {
                failed += 1;
                log::error!("❌ [{}] supervisor failed: {}", network, e);
            }
            Err(e) => {
                failed += 1;
                log::error!("❌ [{}] supervisor task panicked: {}", network, e);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} supervisor(s) failed", failed);
    }
    println!("✅ Graph Forge stopped");
    Ok(())
}

async fn create_subgraph(settings: Settings, network: Network, address: Address) -> Result<()> {
    let clients = chain_clients(&settings)?;
    let limiter = ExplorerRateLimiter::new(settings.explorer.requests_per_second)?;
    let service = SubgraphService::new(
        store(&settings, false).await?,
        Arc::new(classifier(&settings, &clients)),
        Arc::new(ExplorerResolver::new(&settings.explorer, limiter)?),
        Arc::new(GraphCli::from_settings(&settings.subgraph)),
    );
    let id = service.create_subgraph(network, address).await?;
    println!("{}", id);
    Ok(())
}

async fn classify(settings: Settings, network: Network, address: Address) -> Result<()> {
    let clients = chain_clients(&settings)?;
    let token_type = classifier(&settings, &clients)
        .classify(network.chain_id(), address)
        .await?;
    println!("{}", token_type);
    Ok(())
}

fn init_logging() {
    #[cfg(feature = "observability")]
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .init();

    #[cfg(not(feature = "observability"))]
    env_logger::init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let settings = Settings::new()?;
    log::info!("✅ Settings loaded ({} networks)", settings.networks.len());

    match cli.command {
        Command::Run { dry_run } => run(settings, dry_run).await,
        Command::CreateSubgraph { network, address } => {
            create_subgraph(settings, network, address).await
        }
        Command::Classify { network, address } => classify(settings, network, address).await,
    }
}
