use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256};
use graph_forge::classifier::Classifier;
use graph_forge::error::{ForgeError, Result};
use graph_forge::exceptions::ExceptionSet;
use graph_forge::producer::{Producer, ProducerStreams};
use graph_forge::registry::EntryState;
use graph_forge::resolver::Resolver;
use graph_forge::storage::{ContractStore, MemoryStore};
use graph_forge::supervisor::{Supervisor, SupervisorConfig};
use graph_forge::types::{ChainId, Contract, ContractKey, Deployment, Network, TokenType};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const NETWORK: Network = Network::Sepolia;
const CHAIN: ChainId = 11_155_111;

/// Producer that replays blocks pushed by the test, one credit at a time.
#[derive(Default)]
struct ScriptedProducer {
    blocks: Arc<Mutex<BTreeMap<u64, Vec<Contract>>>>,
    fail_at: Arc<Mutex<Option<u64>>>,
    panic_at: Arc<Mutex<Option<u64>>>,
    starts: Mutex<Vec<u64>>,
}

impl ScriptedProducer {
    fn push(&self, number: u64, addresses: &[Address]) {
        let contracts = addresses
            .iter()
            .map(|a| Contract::new(NETWORK, *a, TokenType::Unknown, number))
            .collect();
        self.blocks.lock().unwrap().insert(number, contracts);
    }

    fn fail_once_at(&self, number: u64) {
        *self.fail_at.lock().unwrap() = Some(number);
    }

    /// The walker task panics instead of reporting an error.
    fn panic_once_at(&self, number: u64) {
        *self.panic_at.lock().unwrap() = Some(number);
    }

    fn starts(&self) -> Vec<u64> {
        self.starts.lock().unwrap().clone()
    }
}

fn take_if_at(slot: &Mutex<Option<u64>>, number: u64) -> bool {
    let mut slot = slot.lock().unwrap();
    let hit = *slot == Some(number);
    if hit {
        *slot = None;
    }
    hit
}

#[async_trait]
impl Producer for ScriptedProducer {
    async fn head(&self) -> Result<u64> {
        Ok(self.blocks.lock().unwrap().keys().next().copied().unwrap_or(0))
    }

    fn produce(
        &self,
        from_block: u64,
        mut handled: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) -> ProducerStreams {
        self.starts.lock().unwrap().push(from_block);
        let (block_tx, blocks) = mpsc::channel(1);
        let (contract_tx, contracts) = mpsc::channel(64);
        let (error_tx, errors) = mpsc::channel(1);
        let script = self.blocks.clone();
        let fail_at = self.fail_at.clone();
        let panic_at = self.panic_at.clone();

        let handle = tokio::spawn(async move {
            let mut number = from_block;
            loop {
                let contracts = loop {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let fail = take_if_at(&fail_at, number);
                    if take_if_at(&panic_at, number) {
                        panic!("walker crashed at block {}", number);
                    }
                    if fail {
                        let _ = error_tx
                            .send(ForgeError::Transport("connection reset".into()))
                            .await;
                        return;
                    }
                    if let Some(c) = script.lock().unwrap().get(&number).cloned() {
                        break c;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                };
                for c in contracts {
                    if contract_tx.send(c).await.is_err() {
                        return;
                    }
                }
                if block_tx.send(number).await.is_err() {
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    credit = handled.recv() => if credit.is_none() { return },
                }
                number += 1;
            }
        });

        ProducerStreams {
            blocks,
            contracts,
            errors,
            handle,
        }
    }
}

#[derive(Default)]
struct StubClassifier {
    types: Mutex<HashMap<Address, TokenType>>,
    calls: Mutex<HashMap<Address, usize>>,
}

impl StubClassifier {
    fn with(types: &[(Address, TokenType)]) -> Self {
        Self {
            types: Mutex::new(types.iter().copied().collect()),
            calls: Mutex::default(),
        }
    }

    fn calls(&self, address: Address) -> usize {
        self.calls.lock().unwrap().get(&address).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Classifier for StubClassifier {
    async fn classify(&self, _chain_id: ChainId, address: Address) -> Result<TokenType> {
        *self.calls.lock().unwrap().entry(address).or_default() += 1;
        Ok(self
            .types
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or(TokenType::Unknown))
    }
}

#[derive(Default)]
struct StubResolver {
    missing: Mutex<HashSet<Address>>,
    hanging: Mutex<HashSet<Address>>,
    calls: AtomicUsize,
}

impl StubResolver {
    fn missing(&self, address: Address) {
        self.missing.lock().unwrap().insert(address);
    }

    fn found(&self, address: Address) {
        self.missing.lock().unwrap().remove(&address);
    }

    /// Lookups for `address` never complete.
    fn hang(&self, address: Address) {
        self.hanging.lock().unwrap().insert(address);
    }
}

#[async_trait]
impl Resolver for StubResolver {
    async fn resolve_one(&self, chain_id: ChainId, address: Address) -> Result<Deployment> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let hangs = self.hanging.lock().unwrap().contains(&address);
        if hangs {
            std::future::pending::<()>().await;
        }
        if self.missing.lock().unwrap().contains(&address) {
            return Err(ForgeError::ResolutionNotFound { chain_id, address });
        }
        Ok(Deployment {
            contract_address: address,
            creator: Address::repeat_byte(0x11),
            tx_hash: H256::repeat_byte(0x22),
            block_number: 999,
            timestamp: None,
            factory: None,
            creation_bytecode: Bytes::new(),
        })
    }

    async fn resolve_batch(&self, chain_id: ChainId, addresses: &[Address]) -> Result<Vec<Deployment>> {
        let mut out = Vec::new();
        for a in addresses {
            out.push(self.resolve_one(chain_id, *a).await?);
        }
        Ok(out)
    }
}

struct Harness {
    producer: Arc<ScriptedProducer>,
    classifier: Arc<StubClassifier>,
    resolver: Arc<StubResolver>,
    store: Arc<MemoryStore>,
}

impl Harness {
    fn new(classifier: StubClassifier) -> Self {
        Self {
            producer: Arc::new(ScriptedProducer::default()),
            classifier: Arc::new(classifier),
            resolver: Arc::new(StubResolver::default()),
            store: Arc::new(MemoryStore::new()),
        }
    }

    fn supervisor(&self, cancel: CancellationToken) -> Arc<Supervisor> {
        self.supervisor_with(cancel, |_| {})
    }

    fn supervisor_with<F: FnOnce(&mut SupervisorConfig)>(
        &self,
        cancel: CancellationToken,
        tweak: F,
    ) -> Arc<Supervisor> {
        let mut config = SupervisorConfig::new(NETWORK);
        config.start_block = Some(1000);
        config.restart_delay = Duration::from_millis(10);
        tweak(&mut config);
        Arc::new(Supervisor::new(
            config,
            self.producer.clone(),
            self.classifier.clone(),
            self.resolver.clone(),
            self.store.clone(),
            ExceptionSet::new(),
            cancel,
        ))
    }

    fn spawn(&self) -> (Arc<Supervisor>, CancellationToken, JoinHandle<Result<()>>) {
        let cancel = CancellationToken::new();
        let supervisor = self.supervisor(cancel.clone());
        let handle = tokio::spawn(supervisor.clone().run());
        (supervisor, cancel, handle)
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn stop(cancel: CancellationToken, handle: JoinHandle<Result<()>>) {
    cancel.cancel();
    let finished = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("supervisor did not stop");
    finished.unwrap().unwrap();
}

fn key(address: Address) -> ContractKey {
    ContractKey::new(CHAIN, address)
}

#[tokio::test]
async fn handled_block_survives_restart() {
    let a = Address::repeat_byte(0xa1);
    let b = Address::repeat_byte(0xb2);
    let h = Harness::new(StubClassifier::with(&[
        (a, TokenType::Erc721),
        (b, TokenType::Erc1155),
    ]));
    h.producer.push(1000, &[a, b]);

    let (supervisor, cancel, handle) = h.spawn();
    wait_until("block 1000 processed", || supervisor.next_block() == 1001).await;
    assert_eq!(h.store.is_handled(CHAIN, 1000), Some(true));
    stop(cancel, handle).await;

    assert_eq!(h.store.contract(&key(a)).unwrap().token_type, TokenType::Erc721);
    assert_eq!(h.store.contract(&key(b)).unwrap().token_type, TokenType::Erc1155);

    let restarted = h.supervisor(CancellationToken::new());
    assert_eq!(restarted.bootstrap().await.unwrap(), 1001);
    assert_eq!(restarted.registry().state(&key(a)), Some(EntryState::Used));
    assert_eq!(restarted.registry().state(&key(b)), Some(EntryState::Used));

    // The restarted walker fetches 1001 next and never revisits 1000.
    h.producer.push(1001, &[a]);
    let (supervisor, cancel, handle) = h.spawn();
    wait_until("block 1001 processed", || supervisor.next_block() == 1002).await;
    stop(cancel, handle).await;
    assert_eq!(h.producer.starts(), vec![1000, 1001]);
    assert_eq!(h.classifier.calls(a), 1);
    assert_eq!(h.store.is_handled(CHAIN, 1001), Some(true));
}

#[tokio::test]
async fn unresolved_contract_holds_its_block() {
    let a = Address::repeat_byte(0xa1);
    let h = Harness::new(StubClassifier::with(&[(a, TokenType::Erc20)]));
    h.resolver.missing(a);
    h.producer.push(1000, &[a]);
    h.producer.push(1001, &[]);

    let (supervisor, cancel, handle) = h.spawn();
    wait_until("block 1001 processed", || supervisor.next_block() == 1002).await;

    assert_eq!(supervisor.registry().state(&key(a)), Some(EntryState::Discovered));
    assert_eq!(h.store.is_handled(CHAIN, 1000), Some(false));
    assert_eq!(h.store.is_handled(CHAIN, 1001), Some(false));
    assert_eq!(h.store.contract_count(), 0);
    let cursor = h.store.last_block(CHAIN).await.unwrap().unwrap();
    assert_eq!(cursor.block_number, 1000);

    h.resolver.found(a);
    h.producer.push(1002, &[]);
    wait_until("block 1002 processed", || supervisor.next_block() == 1003).await;
    assert_eq!(h.store.is_handled(CHAIN, 1002), Some(true));
    assert_eq!(h.store.is_handled(CHAIN, 1000), Some(true));
    assert_eq!(h.store.is_handled(CHAIN, 1001), Some(true));
    assert_eq!(supervisor.registry().state(&key(a)), Some(EntryState::Used));
    assert!(supervisor.unhandled_blocks().is_empty());
    stop(cancel, handle).await;
}

#[tokio::test]
async fn duplicates_are_classified_once() {
    let a = Address::repeat_byte(0xa1);
    let h = Harness::new(StubClassifier::with(&[(a, TokenType::Erc721)]));
    h.producer.push(1000, &[a, a]);
    h.producer.push(1001, &[a]);

    let (supervisor, cancel, handle) = h.spawn();
    wait_until("block 1001 handled", || h.store.is_handled(CHAIN, 1001) == Some(true)).await;
    assert_eq!(h.classifier.calls(a), 1);
    assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.contract_count(), 1);
    assert_eq!(supervisor.registry().used_len(), 1);
    stop(cancel, handle).await;
}

#[tokio::test]
async fn non_token_contract_is_excluded() {
    let u = Address::repeat_byte(0x0c);
    let h = Harness::new(StubClassifier::default());
    h.producer.push(1000, &[u]);
    h.producer.push(1001, &[]);

    let (supervisor, cancel, handle) = h.spawn();
    wait_until("block 1001 handled", || h.store.is_handled(CHAIN, 1001) == Some(true)).await;
    assert!(supervisor.exceptions().contains(&u));
    assert_eq!(supervisor.registry().state(&key(u)), None);
    assert_eq!(h.store.contract_count(), 0);
    assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 0);
    stop(cancel, handle).await;
}

#[tokio::test]
async fn failed_save_is_retried_on_next_pass() {
    let a = Address::repeat_byte(0xa1);
    let h = Harness::new(StubClassifier::with(&[(a, TokenType::Erc20)]));
    h.store.fail_saves_for(a);
    h.producer.push(1000, &[a]);

    let (supervisor, cancel, handle) = h.spawn();
    wait_until("block 1000 processed", || supervisor.next_block() == 1001).await;
    assert_eq!(supervisor.registry().state(&key(a)), Some(EntryState::Discovered));
    assert_eq!(h.store.is_handled(CHAIN, 1000), Some(false));

    h.store.heal();
    h.producer.push(1001, &[]);
    wait_until("block 1000 handled", || h.store.is_handled(CHAIN, 1000) == Some(true)).await;
    assert_eq!(supervisor.registry().state(&key(a)), Some(EntryState::Used));
    assert!(h.store.initialized(&Contract::new(NETWORK, a, TokenType::Erc20, 1000)).await.unwrap());
    stop(cancel, handle).await;
}

#[tokio::test]
async fn bootstrap_resumes_from_earliest_unhandled_block() {
    let h = Harness::new(StubClassifier::default());
    let persisted = Contract::new(NETWORK, Address::repeat_byte(0x77), TokenType::Erc20, 990);
    let id = h.store.save_contract(&persisted).await.unwrap();
    h.store.save_contract_forge(None, id).await.unwrap();
    for n in [998, 999, 1000] {
        h.store.save_block(n, CHAIN).await.unwrap();
    }
    h.store.block_handled(998, CHAIN).await.unwrap();

    let supervisor = h.supervisor(CancellationToken::new());
    assert_eq!(supervisor.bootstrap().await.unwrap(), 999);
    assert_eq!(supervisor.next_block(), 999);
    assert_eq!(supervisor.registry().state(&persisted.key()), Some(EntryState::Used));
}

#[tokio::test]
async fn bootstrap_without_cursor_uses_start_block() {
    let h = Harness::new(StubClassifier::default());
    let supervisor = h.supervisor(CancellationToken::new());
    assert_eq!(supervisor.bootstrap().await.unwrap(), 1000);
}

#[tokio::test]
async fn scan_error_restarts_from_next_block() {
    let h = Harness::new(StubClassifier::default());
    h.producer.push(1000, &[]);
    h.producer.push(1001, &[]);
    h.producer.fail_once_at(1001);

    let (supervisor, cancel, handle) = h.spawn();
    wait_until("block 1001 processed", || supervisor.next_block() == 1002).await;
    assert_eq!(h.store.is_handled(CHAIN, 1001), Some(true));
    assert_eq!(h.producer.starts(), vec![1000, 1001]);
    stop(cancel, handle).await;
}

#[tokio::test]
async fn panicking_producer_restarts_session() {
    let h = Harness::new(StubClassifier::default());
    h.producer.push(1000, &[]);
    h.producer.push(1001, &[]);
    h.producer.panic_once_at(1001);

    let (supervisor, cancel, handle) = h.spawn();
    wait_until("block 1001 processed", || supervisor.next_block() == 1002).await;
    assert_eq!(h.producer.starts(), vec![1000, 1001]);
    assert_eq!(h.store.is_handled(CHAIN, 1001), Some(true));
    stop(cancel, handle).await;
}

#[tokio::test]
async fn cancel_interrupts_inflight_resolution() {
    let a = Address::repeat_byte(0xa1);
    let h = Harness::new(StubClassifier::with(&[(a, TokenType::Erc20)]));
    h.resolver.hang(a);
    h.producer.push(1000, &[a]);

    let (supervisor, cancel, handle) = h.spawn();
    wait_until("resolution started", || h.resolver.calls.load(Ordering::SeqCst) == 1).await;
    assert_eq!(supervisor.registry().state(&key(a)), Some(EntryState::Resolving));

    stop(cancel, handle).await;
    assert_eq!(supervisor.registry().state(&key(a)), Some(EntryState::Discovered));
    assert_eq!(h.store.is_handled(CHAIN, 1000), Some(false));
    assert_eq!(h.store.contract_count(), 0);
    assert_eq!(supervisor.next_block(), 1000);
}

#[tokio::test]
async fn stuck_contract_flags_lagging_backlog() {
    let a = Address::repeat_byte(0xa1);
    let h = Harness::new(StubClassifier::with(&[(a, TokenType::Erc20)]));
    h.resolver.missing(a);
    h.producer.push(1000, &[a]);
    h.producer.push(1001, &[]);
    h.producer.push(1002, &[]);

    let cancel = CancellationToken::new();
    let supervisor = h.supervisor_with(cancel.clone(), |c| c.unhandled_lag_warn = 2);
    let handle = tokio::spawn(supervisor.clone().run());

    wait_until("block 1002 processed", || supervisor.next_block() == 1003).await;
    assert!(supervisor.is_lagging());
    assert_eq!(supervisor.unhandled_blocks().len(), 3);

    h.resolver.found(a);
    h.producer.push(1003, &[]);
    wait_until("block 1003 processed", || supervisor.next_block() == 1004).await;
    assert!(!supervisor.is_lagging());
    assert!(supervisor.unhandled_blocks().is_empty());
    stop(cancel, handle).await;
}
