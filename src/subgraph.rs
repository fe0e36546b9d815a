//! Subgraph deployment and the request-driven entry points.
//!
//! [`GraphCli`] shells out to the `graph` CLI (`init`, `create`, `deploy`).
//! [`SubgraphService`] is the use-case layer an RPC front-end would call: it reuses the
//! classifier, resolver and store so a contract created on request is indistinguishable from
//! one the scanner found.

use async_trait::async_trait;
use ethers::types::Address;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;

use crate::classifier::Classifier;
use crate::error::{ForgeError, Result};
use crate::resolver::Resolver;
use crate::settings::SubgraphSettings;
use crate::storage::ContractStore;
use crate::types::{Contract, Network, TokenType};

#[async_trait]
pub trait SubgraphDeployer: Send + Sync {
    /// Scaffolds, registers and deploys a subgraph for the contract. Returns its id.
    async fn create_subgraph(&self, contract: &Contract) -> Result<String>;
}

/// Drives the Graph CLI in a working directory of per-contract projects.
#[derive(Debug, Clone)]
pub struct GraphCli {
    program: String,
    root: PathBuf,
    node_url: String,
    abi_path: String,
    version_label: String,
}

impl GraphCli {
    pub fn from_settings(settings: &SubgraphSettings) -> Self {
        Self {
            program: settings.program.clone(),
            root: PathBuf::from(&settings.root),
            node_url: settings.node_url.clone(),
            abi_path: settings.abi_path.clone(),
            version_label: settings.version_label.clone(),
        }
    }

    /// Project directory for a contract, `root/network/0xaddress`.
    pub fn project_dir(&self, contract: &Contract) -> PathBuf {
        self.root.join(contract.subgraph_id())
    }

    async fn run(&self, dir: &Path, args: &[&str]) -> Result<()> {
        let step = args.first().copied().unwrap_or_default();
        log::debug!("[GraphCli] {} {} (in {})", self.program, args.join(" "), dir.display());

        let output = Command::new(&self.program)
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| ForgeError::Deployer(format!("failed to spawn {} {}: {}", self.program, step, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ForgeError::Deployer(format!(
                "{} {} exited with {}: {}",
                self.program,
                step,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SubgraphDeployer for GraphCli {
    async fn create_subgraph(&self, contract: &Contract) -> Result<String> {
        let id = contract.subgraph_id();
        let address = format!("{:?}", contract.address);
        let network = contract.network.name();

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ForgeError::Deployer(format!("cannot create {}: {}", self.root.display(), e)))?;

        self.run(
            &self.root,
            &[
                "init",
                &id,
                &id,
                "--from-contract",
                &address,
                "--network",
                network,
                "--skip-install",
                "--skip-git",
                "--abi",
                &self.abi_path,
            ],
        )
        .await?;

        let project = self.project_dir(contract);
        self.run(&project, &["create", &id, "--node", &self.node_url])
            .await?;
        self.run(
            &project,
            &[
                "deploy",
                &id,
                "--node",
                &self.node_url,
                "--version-label",
                &self.version_label,
            ],
        )
        .await?;

        log::info!("🚀 [GraphCli] deployed subgraph {}", id);
        Ok(id)
    }
}

/// Request-driven subgraph management.
pub struct SubgraphService {
    store: Arc<dyn ContractStore>,
    classifier: Arc<dyn Classifier>,
    resolver: Arc<dyn Resolver>,
    deployer: Arc<dyn SubgraphDeployer>,
}

impl SubgraphService {
    pub fn new(
        store: Arc<dyn ContractStore>,
        classifier: Arc<dyn Classifier>,
        resolver: Arc<dyn Resolver>,
        deployer: Arc<dyn SubgraphDeployer>,
    ) -> Self {
        Self {
            store,
            classifier,
            resolver,
            deployer,
        }
    }

    /// Idempotent: an already initialized contract returns its id without side effects.
    pub async fn create_subgraph(&self, network: Network, address: Address) -> Result<String> {
        let mut contract = Contract::new(network, address, TokenType::Unknown, 0);
        if self.store.initialized(&contract).await? {
            return Ok(contract.subgraph_id());
        }

        contract.token_type = self.classifier.classify(network.chain_id(), address).await?;
        contract.deployment = Some(self.resolver.resolve_one(network.chain_id(), address).await?);
        self.deploy_and_link(&contract).await
    }

    /// All-or-nothing over the request: the first failure is returned and later entries are
    /// not attempted. Ids come back in request order.
    pub async fn create_subgraph_batch(&self, requests: &[(Network, Address)]) -> Result<Vec<String>> {
        let mut ids: Vec<Option<String>> = vec![None; requests.len()];
        let mut todo: Vec<(usize, Contract)> = Vec::new();

        for (i, (network, address)) in requests.iter().enumerate() {
            let mut contract = Contract::new(*network, *address, TokenType::Unknown, 0);
            if self.store.initialized(&contract).await? {
                ids[i] = Some(contract.subgraph_id());
                continue;
            }
            contract.token_type = self.classifier.classify(network.chain_id(), *address).await?;
            todo.push((i, contract));
        }

        // One explorer lookup per chain, chunked by the resolver.
        let mut by_chain: HashMap<u64, Vec<Address>> = HashMap::new();
        for (_, c) in &todo {
            by_chain.entry(c.chain_id()).or_default().push(c.address);
        }
        let mut deployments = HashMap::new();
        for (chain_id, addresses) in by_chain {
            for d in self.resolver.resolve_batch(chain_id, &addresses).await? {
                deployments.insert((chain_id, d.contract_address), d);
            }
        }

        for (i, mut contract) in todo {
            let deployment = deployments
                .remove(&(contract.chain_id(), contract.address))
                .ok_or(ForgeError::ResolutionNotFound {
                    chain_id: contract.chain_id(),
                    address: contract.address,
                })?;
            contract.deployment = Some(deployment);
            ids[i] = Some(self.deploy_and_link(&contract).await?);
        }

        Ok(ids.into_iter().flatten().collect())
    }

    pub async fn delete_subgraph(&self, _network: Network, _address: Address) -> Result<()> {
        Err(ForgeError::Unimplemented("delete_subgraph"))
    }

    async fn deploy_and_link(&self, contract: &Contract) -> Result<String> {
        let contract_id = self.store.save_contract(contract).await?;
        let id = self.deployer.create_subgraph(contract).await?;
        self.store.save_contract_forge(None, contract_id).await?;
        log::info!("deployed new contract {}", id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(root: &Path, program: &str) -> GraphCli {
        GraphCli::from_settings(&SubgraphSettings {
            root: root.to_string_lossy().into_owned(),
            program: program.to_string(),
            ..SubgraphSettings::default()
        })
    }

    fn contract() -> Contract {
        Contract::new(Network::Holesky, Address::repeat_byte(0x42), TokenType::Erc721, 0)
    }

    #[test]
    fn project_dir_nests_network_and_address() {
        let c = cli(Path::new("/srv/subgraphs"), "graph");
        assert_eq!(
            c.project_dir(&contract()),
            PathBuf::from("/srv/subgraphs/holesky/0x4242424242424242424242424242424242424242")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_cli_returns_subgraph_id() {
        let dir = tempfile::tempdir().unwrap();
        let c = cli(dir.path(), "true");
        let contract = contract();
        // `true` does not scaffold anything, so create the project dir up front.
        std::fs::create_dir_all(c.project_dir(&contract)).unwrap();

        let id = c.create_subgraph(&contract).await.unwrap();
        assert_eq!(id, "holesky/0x4242424242424242424242424242424242424242");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_cli_is_deployer_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = cli(dir.path(), "false")
            .create_subgraph(&contract())
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Deployer(_)));
    }

    #[tokio::test]
    async fn missing_program_is_deployer_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = cli(dir.path(), "graph-forge-no-such-binary")
            .create_subgraph(&contract())
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Deployer(_)));
    }
}
