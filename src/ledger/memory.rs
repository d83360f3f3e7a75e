//! In-process ledger services.
//!
//! These back a group when no external ledger is wired in: a chain that keeps
//! block summaries in memory, a bounded FIFO pool with the basic admission
//! checks, and a sealer that periodically cuts the pending transactions into a
//! new block. There is no PBFT round here; a node seals when it is listed in
//! the group's miner list (or the list is empty, i.e. a single-node group).

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use ethnum::U256;
use serde_json::json;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
    BlockChain, Consensus, ConsensusParam, GroupParams, GroupRuntime, LedgerFactory,
    MAX_BLOCK_LIMIT_WINDOW, PrecompiledTable, SubmitError, SubmitReceipt, TxPool,
};
use crate::{
    bootstrap::identity::NodeIdentity,
    error::AppError,
    network::NetworkService,
    transaction::{Transaction, TxError},
    types::{Address, GroupId, H256, NodeId, keccak256},
};

// ── chain ────────────────────────────────────────────────────────────────────

/// Summary of a committed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
    pub sealer: Option<NodeId>,
    pub transactions: Vec<H256>,
}

impl Block {
    fn genesis(group: GroupId) -> Self {
        Self {
            number: 0,
            hash: keccak256(format!("genesis-{group}").as_bytes()),
            parent_hash: H256::zero(),
            sealer: None,
            transactions: Vec::new(),
        }
    }
}

pub struct MemoryBlockChain {
    height: AtomicU64,
    blocks: Mutex<Vec<Block>>,
}

impl MemoryBlockChain {
    pub fn new(group: GroupId) -> Self {
        Self {
            height: AtomicU64::new(0),
            blocks: Mutex::new(vec![Block::genesis(group)]),
        }
    }

    /// Append a block holding `transactions` and return its number.
    pub fn commit(&self, transactions: Vec<H256>, sealer: Option<NodeId>) -> u64 {
        let mut blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        let parent = blocks.last().map(|b| b.hash).unwrap_or_else(H256::zero);
        let number = blocks.len() as u64;

        let mut preimage = Vec::with_capacity(40 + transactions.len() * 32);
        preimage.extend_from_slice(parent.as_bytes());
        preimage.extend_from_slice(&number.to_be_bytes());
        for tx in &transactions {
            preimage.extend_from_slice(tx.as_bytes());
        }

        blocks.push(Block {
            number,
            hash: keccak256(&preimage),
            parent_hash: parent,
            sealer,
            transactions,
        });
        self.height.store(number, Ordering::SeqCst);
        number
    }

    pub fn block(&self, number: u64) -> Option<Block> {
        let blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        usize::try_from(number).ok().and_then(|n| blocks.get(n).cloned())
    }
}

impl BlockChain for MemoryBlockChain {
    fn number(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }
}

// ── pool ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct PoolInner {
    pending: VecDeque<(H256, Transaction)>,
    /// Hashes seen and not yet expired, with their block limit. A transaction
    /// past its limit can no longer be replayed, so its hash is forgotten.
    known: HashMap<H256, U256>,
}

pub struct MemoryTxPool {
    limit: usize,
    chain: Arc<MemoryBlockChain>,
    inner: Mutex<PoolInner>,
}

impl MemoryTxPool {
    pub fn new(limit: usize, chain: Arc<MemoryBlockChain>) -> Self {
        Self {
            limit,
            chain,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Take up to `max` pending transactions, oldest first, dropping any whose
    /// block limit has passed.
    pub fn drain(&self, max: usize) -> Vec<(H256, Transaction)> {
        let height = U256::from(self.chain.number());
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.known.retain(|_, limit| *limit > height);

        let mut out = Vec::with_capacity(max.min(inner.pending.len()));
        while out.len() < max {
            let Some((hash, tx)) = inner.pending.pop_front() else {
                break;
            };
            if tx.block_limit <= height {
                trace!(%hash, "dropping expired transaction");
                continue;
            }
            out.push((hash, tx));
        }
        out
    }
}

impl TxPool for MemoryTxPool {
    fn submit(&self, tx: Transaction) -> Result<SubmitReceipt, SubmitError> {
        let sender = tx.sender().map_err(|e| match e {
            TxError::Unsigned => SubmitError::Unsigned,
            other => SubmitError::InvalidSignature(other.to_string()),
        })?;

        let height = self.chain.number();
        let current = U256::from(height);
        if tx.block_limit <= current {
            return Err(SubmitError::BlockLimitExpired {
                block_limit: tx.block_limit.to_string(),
                height,
            });
        }
        if tx.block_limit > current + U256::from(MAX_BLOCK_LIMIT_WINDOW) {
            return Err(SubmitError::BlockLimitTooFar {
                block_limit: tx.block_limit.to_string(),
                height,
            });
        }

        let hash = tx.hash();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.known.contains_key(&hash) {
            return Err(SubmitError::Duplicate(hash));
        }
        if inner.pending.len() >= self.limit {
            return Err(SubmitError::PoolFull(inner.pending.len()));
        }

        let address = tx
            .receive_address
            .unwrap_or_else(|| contract_address(&sender, &tx.nonce));
        inner.known.insert(hash, tx.block_limit);
        inner.pending.push_back((hash, tx));
        Ok((hash, address))
    }

    fn pending_size(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).pending.len()
    }
}

/// Address of a contract created by `sender` at `nonce`.
pub fn contract_address(sender: &Address, nonce: &U256) -> Address {
    let mut preimage = Vec::with_capacity(52);
    preimage.extend_from_slice(sender.as_bytes());
    preimage.extend_from_slice(&nonce.to_be_bytes());
    let digest = keccak256(&preimage);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest.as_bytes()[12..]);
    Address::from_bytes(out)
}

// ── consensus ────────────────────────────────────────────────────────────────

/// Packet type of the message announcing a freshly sealed block.
pub const BLOCK_ANNOUNCE_PACKET: u16 = 0x12;

pub struct SealerConsensus {
    group: GroupId,
    local: NodeId,
    param: ConsensusParam,
    precompiled: usize,
    pool: Arc<MemoryTxPool>,
    chain: Arc<MemoryBlockChain>,
    network: Arc<dyn NetworkService>,
    running: Arc<AtomicBool>,
}

impl SealerConsensus {
    fn node_index(&self) -> Option<usize> {
        self.param.miner_list.iter().position(|m| *m == self.local)
    }

    fn is_sealer(&self) -> bool {
        self.param.miner_list.is_empty() || self.node_index().is_some()
    }
}

impl Consensus for SealerConsensus {
    fn start(&self, shutdown: &CancellationToken) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(group = %self.group, "consensus already running");
            return;
        }
        if !self.is_sealer() {
            info!(group = %self.group, "local node is an observer in this group");
        }

        let group = self.group;
        let local = self.local;
        let sealing = self.is_sealer();
        let period = self.param.block_interval;
        let max_txs = self.param.max_block_txs;
        let pool = Arc::clone(&self.pool);
        let chain = Arc::clone(&self.chain);
        let network = Arc::clone(&self.network);
        let running = Arc::clone(&self.running);
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !sealing {
                    continue;
                }
                let batch = pool.drain(max_txs);
                if batch.is_empty() {
                    continue;
                }
                let count = batch.len();
                let hashes = batch.into_iter().map(|(hash, _)| hash).collect();
                let number = chain.commit(hashes, Some(local));

                let mut announce = network.build_message();
                announce.group = Some(group);
                announce.packet_type = BLOCK_ANNOUNCE_PACKET;
                announce.payload = chain
                    .block(number)
                    .map(|b| b.hash.as_bytes().to_vec())
                    .unwrap_or_default();
                debug!(
                    %group,
                    number,
                    txs = count,
                    peers = network.route(group).len(),
                    announce_bytes = announce.payload.len(),
                    "sealed block"
                );
            }
            running.store(false, Ordering::SeqCst);
            debug!(%group, "consensus stopped");
        });
    }

    fn status(&self) -> serde_json::Value {
        json!({
            "group": self.group.get(),
            "nodeId": self.local.to_string(),
            "nodeIndex": self.node_index().map_or(-1, |i| i as i64),
            "minerCount": self.param.miner_list.len(),
            "isSealer": self.is_sealer(),
            "blockNumber": self.chain.number(),
            "pendingTxs": self.pool.pending_size(),
            "peers": self.network.route(self.group).len(),
            "precompiled": self.precompiled,
            "running": self.running.load(Ordering::SeqCst),
        })
    }
}

// ── factory ──────────────────────────────────────────────────────────────────

/// Builds the in-process chain, pool and sealer for a group.
#[derive(Debug, Default)]
pub struct MemoryLedgerFactory;

impl LedgerFactory for MemoryLedgerFactory {
    fn init_single_ledger(
        &self,
        precompiles: &PrecompiledTable,
        network: Arc<dyn NetworkService>,
        params: GroupParams,
        identity: &NodeIdentity,
    ) -> Result<GroupRuntime, AppError> {
        let group = params.group_id;
        if params.tx_pool.limit == 0 {
            return Err(AppError::bootstrap(group, "pool_limit must be greater than zero"));
        }
        if params.consensus.max_block_txs == 0 {
            return Err(AppError::bootstrap(group, "max_block_txs must be greater than zero"));
        }
        if params.consensus.block_interval.is_zero() {
            return Err(AppError::bootstrap(group, "block_interval_ms must be greater than zero"));
        }

        let chain = Arc::new(MemoryBlockChain::new(group));
        let pool = Arc::new(MemoryTxPool::new(params.tx_pool.limit, Arc::clone(&chain)));
        let consensus = Arc::new(SealerConsensus {
            group,
            local: *identity.node_id(),
            param: params.consensus.clone(),
            precompiled: precompiles.len(),
            pool: Arc::clone(&pool),
            chain: Arc::clone(&chain),
            network,
            running: Arc::new(AtomicBool::new(false)),
        });

        Ok(GroupRuntime::new(params, chain, consensus, pool))
    }
}
