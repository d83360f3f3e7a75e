use std::{
    fs,
    sync::{Arc, Mutex},
    time::Duration,
};

use ethnum::U256;
use groupnode::{
    bootstrap::identity::NodeIdentity,
    config::Config,
    error::AppError,
    ledger::{
        GroupParams, GroupRuntime, LedgerFactory, PrecompiledTable, SubmitError, SubmitReceipt,
        TxPool, memory::MemoryLedgerFactory,
    },
    loadgen::template_transaction,
    network::NetworkService,
    node::NodeSequencer,
    transaction::Transaction,
    types::{GroupId, NodeId},
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const SECRET: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

/// Submission log: nonce, block limit, height at submit time, accepted.
type Log = Arc<Mutex<Vec<(U256, U256, u64, bool)>>>;

struct RecordingPool {
    inner: Arc<dyn TxPool>,
    chain: Arc<dyn groupnode::ledger::BlockChain>,
    log: Log,
}

impl TxPool for RecordingPool {
    fn submit(&self, tx: Transaction) -> Result<SubmitReceipt, SubmitError> {
        let (nonce, limit) = (tx.nonce, tx.block_limit);
        let height = self.chain.number();
        let result = self.inner.submit(tx);
        self.log.lock().unwrap().push((nonce, limit, height, result.is_ok()));
        result
    }

    fn pending_size(&self) -> usize {
        self.inner.pending_size()
    }
}

#[derive(Default)]
struct RecordingFactory {
    log: Log,
}

impl LedgerFactory for RecordingFactory {
    fn init_single_ledger(
        &self,
        precompiles: &PrecompiledTable,
        network: Arc<dyn NetworkService>,
        params: GroupParams,
        identity: &NodeIdentity,
    ) -> Result<GroupRuntime, AppError> {
        let runtime = MemoryLedgerFactory.init_single_ledger(precompiles, network, params, identity)?;
        let pool = Arc::new(RecordingPool {
            inner: runtime.tx_pool(),
            chain: runtime.blockchain(),
            log: self.log.clone(),
        });
        Ok(GroupRuntime::new(runtime.params().clone(), runtime.blockchain(), runtime.consensus(), pool))
    }
}

fn config(dir: &TempDir, tx_speed: f64) -> Config {
    let mut cfg = Config::test_default(dir.path(), 1);
    cfg.load.enabled = true;
    cfg.set_tx_speed(tx_speed).unwrap();
    fs::write(&cfg.identity_file, SECRET).unwrap();
    cfg
}

#[tokio::test(start_paused = true)]
async fn submissions_follow_rate_with_sequential_nonces() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir, 20.0);
    // Local node is not a miner: nothing gets sealed, everything stays pending.
    cfg.groups[0].miners = vec![NodeId::from_bytes([0x99; 64])];

    let factory = RecordingFactory::default();
    let log = factory.log.clone();
    let mut node = NodeSequencer::new(cfg, factory);
    let token = CancellationToken::new();

    node.load_identity().unwrap();
    node.bootstrap_groups().unwrap();
    node.start_all(&token).unwrap();
    let handle = node.launch_load_generator(&token).unwrap().unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    handle.cancel();
    let attempts = handle.join().await.unwrap();
    assert!((40..=41).contains(&attempts), "attempts = {attempts}");

    let start = template_transaction().unwrap().nonce;
    let log = log.lock().unwrap();
    assert_eq!(log.len() as u64, attempts);
    for (i, (nonce, limit, height, accepted)) in log.iter().enumerate() {
        assert_eq!(*nonce, start + U256::from(i as u64 + 1));
        assert!(*limit >= U256::from(*height));
        assert!(accepted);
    }

    let pool = node.registry().tx_pool(GroupId::new(1)).unwrap();
    assert_eq!(pool.pending_size() as u64, attempts);
    token.cancel();
}

#[tokio::test(start_paused = true)]
async fn sealer_consumes_generated_load() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir, 10.0);
    cfg.groups[0].block_interval_ms = 500;
    cfg.groups[0].max_block_txs = 100;

    let factory = RecordingFactory::default();
    let log = factory.log.clone();
    let mut node = NodeSequencer::new(cfg, factory);
    let token = CancellationToken::new();

    node.load_identity().unwrap();
    node.bootstrap_groups().unwrap();
    node.start_all(&token).unwrap();
    let handle = node.launch_load_generator(&token).unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(2250)).await;
    handle.cancel();
    handle.join().await.unwrap();

    let chain = node.registry().blockchain(GroupId::new(1)).unwrap();
    assert!(chain.number() >= 2, "height = {}", chain.number());

    // Limits move with the chain.
    let log = log.lock().unwrap();
    let last = log.last().unwrap();
    assert!(last.2 > 0);
    assert_eq!(last.1, U256::from(last.2 + 1000));
    assert!(log.iter().all(|entry| entry.3));

    let pool = node.registry().tx_pool(GroupId::new(1)).unwrap();
    assert!(pool.pending_size() < log.len());
    token.cancel();
}
