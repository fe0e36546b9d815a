use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256};
use graph_forge::classifier::Classifier;
use graph_forge::error::{ForgeError, Result};
use graph_forge::resolver::Resolver;
use graph_forge::storage::{ContractStore, MemoryStore};
use graph_forge::subgraph::{SubgraphDeployer, SubgraphService};
use graph_forge::types::{ChainId, Contract, ContractKey, Deployment, Network, TokenType};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct FixedClassifier(TokenType);

#[async_trait]
impl Classifier for FixedClassifier {
    async fn classify(&self, _chain_id: ChainId, _address: Address) -> Result<TokenType> {
        Ok(self.0)
    }
}

#[derive(Default)]
struct CountingResolver {
    missing: HashSet<Address>,
    single: AtomicUsize,
    batches: Mutex<Vec<Vec<Address>>>,
}

fn deployment(address: Address) -> Deployment {
    Deployment {
        contract_address: address,
        creator: Address::repeat_byte(0x11),
        tx_hash: H256::repeat_byte(0x22),
        block_number: 42,
        timestamp: None,
        factory: None,
        creation_bytecode: Bytes::new(),
    }
}

#[async_trait]
impl Resolver for CountingResolver {
    async fn resolve_one(&self, chain_id: ChainId, address: Address) -> Result<Deployment> {
        self.single.fetch_add(1, Ordering::SeqCst);
        if self.missing.contains(&address) {
            return Err(ForgeError::ResolutionNotFound { chain_id, address });
        }
        Ok(deployment(address))
    }

    async fn resolve_batch(&self, chain_id: ChainId, addresses: &[Address]) -> Result<Vec<Deployment>> {
        self.batches.lock().unwrap().push(addresses.to_vec());
        addresses
            .iter()
            .map(|a| {
                if self.missing.contains(a) {
                    Err(ForgeError::ResolutionNotFound { chain_id, address: *a })
                } else {
                    Ok(deployment(*a))
                }
            })
            .collect()
    }
}

#[derive(Default)]
struct RecordingDeployer {
    deployed: Mutex<Vec<String>>,
    fail: bool,
}

#[async_trait]
impl SubgraphDeployer for RecordingDeployer {
    async fn create_subgraph(&self, contract: &Contract) -> Result<String> {
        if self.fail {
            return Err(ForgeError::Deployer("graph deploy exited with 1".into()));
        }
        let id = contract.subgraph_id();
        self.deployed.lock().unwrap().push(id.clone());
        Ok(id)
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    resolver: Arc<CountingResolver>,
    deployer: Arc<RecordingDeployer>,
    service: SubgraphService,
}

fn fixture(resolver: CountingResolver, deployer: RecordingDeployer) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let resolver = Arc::new(resolver);
    let deployer = Arc::new(deployer);
    let service = SubgraphService::new(
        store.clone(),
        Arc::new(FixedClassifier(TokenType::Erc721)),
        resolver.clone(),
        deployer.clone(),
    );
    Fixture {
        store,
        resolver,
        deployer,
        service,
    }
}

#[tokio::test]
async fn create_subgraph_persists_and_deploys() {
    let f = fixture(CountingResolver::default(), RecordingDeployer::default());
    let address = Address::repeat_byte(0xaa);

    let id = f.service.create_subgraph(Network::Sepolia, address).await.unwrap();
    assert_eq!(id, "sepolia/0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");

    let stored = f
        .store
        .contract(&ContractKey::new(Network::Sepolia.chain_id(), address))
        .unwrap();
    assert_eq!(stored.token_type, TokenType::Erc721);
    assert_eq!(stored.deployment.unwrap().block_number, 42);
    let contract = Contract::new(Network::Sepolia, address, TokenType::Unknown, 0);
    assert!(f.store.initialized(&contract).await.unwrap());
}

#[tokio::test]
async fn create_subgraph_is_idempotent() {
    let f = fixture(CountingResolver::default(), RecordingDeployer::default());
    let address = Address::repeat_byte(0xab);

    let first = f.service.create_subgraph(Network::Sepolia, address).await.unwrap();
    let second = f.service.create_subgraph(Network::Sepolia, address).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(f.deployer.deployed.lock().unwrap().len(), 1);
    assert_eq!(f.resolver.single.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_deploy_leaves_contract_uninitialized() {
    let deployer = RecordingDeployer {
        fail: true,
        ..RecordingDeployer::default()
    };
    let f = fixture(CountingResolver::default(), deployer);
    let address = Address::repeat_byte(0xac);

    let err = f
        .service
        .create_subgraph(Network::Holesky, address)
        .await
        .unwrap_err();
    assert!(matches!(err, ForgeError::Deployer(_)));
    let contract = Contract::new(Network::Holesky, address, TokenType::Unknown, 0);
    assert!(!f.store.initialized(&contract).await.unwrap());
}

#[tokio::test]
async fn batch_resolves_once_per_chain_and_keeps_order() {
    let f = fixture(CountingResolver::default(), RecordingDeployer::default());
    let a = Address::repeat_byte(0x01);
    let b = Address::repeat_byte(0x02);
    let c = Address::repeat_byte(0x03);

    // `b` already exists and must not be resolved again.
    f.service.create_subgraph(Network::Sepolia, b).await.unwrap();

    let ids = f
        .service
        .create_subgraph_batch(&[(Network::Sepolia, a), (Network::Sepolia, b), (Network::Sepolia, c)])
        .await
        .unwrap();
    assert_eq!(
        ids,
        vec![
            format!("sepolia/{:?}", a),
            format!("sepolia/{:?}", b),
            format!("sepolia/{:?}", c),
        ]
    );
    assert_eq!(*f.resolver.batches.lock().unwrap(), vec![vec![a, c]]);
    assert_eq!(f.deployer.deployed.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn batch_fails_when_any_entry_is_unresolved() {
    let missing = Address::repeat_byte(0x09);
    let resolver = CountingResolver {
        missing: [missing].into_iter().collect(),
        ..CountingResolver::default()
    };
    let f = fixture(resolver, RecordingDeployer::default());

    let err = f
        .service
        .create_subgraph_batch(&[
            (Network::Sepolia, Address::repeat_byte(0x08)),
            (Network::Sepolia, missing),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, ForgeError::ResolutionNotFound { .. }));
    assert!(f.deployer.deployed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn delete_subgraph_is_unimplemented() {
    let f = fixture(CountingResolver::default(), RecordingDeployer::default());
    let err = f
        .service
        .delete_subgraph(Network::Sepolia, Address::zero())
        .await
        .unwrap_err();
    assert!(matches!(err, ForgeError::Unimplemented(_)));
}
