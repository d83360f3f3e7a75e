//! Ledger layer — the per-group service stack and the contracts the node core
//! uses to drive it.
//!
//! A group's stack is a [`BlockChain`] view, a [`Consensus`] engine and a
//! [`TxPool`], built together by a [`LedgerFactory`] into one
//! [`GroupRuntime`]. Runtimes are owned by the [`GroupRegistry`].
//!
//! The traits are deliberately narrow: the sequencer and the load generator
//! only need the chain height, pool submission, consensus status and a start
//! hook. [`memory`] provides in-process implementations of all of them.

pub mod memory;
pub mod registry;

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    bootstrap::identity::NodeIdentity,
    config::GroupConfig,
    error::AppError,
    network::NetworkService,
    transaction::Transaction,
    types::{Address, GroupId, H256, NodeId},
};

pub use registry::GroupRegistry;

/// Widest block-limit window a pool accepts: a transaction must name a limit
/// within `height + MAX_BLOCK_LIMIT_WINDOW`.
pub const MAX_BLOCK_LIMIT_WINDOW: u64 = 1000;

// ── parameters ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConsensusParam {
    pub miner_list: Vec<NodeId>,
    pub block_interval: Duration,
    pub max_block_txs: usize,
}

#[derive(Debug, Clone)]
pub struct TxPoolParam {
    pub limit: usize,
}

/// Read-only parameters of one group.
#[derive(Debug, Clone)]
pub struct GroupParams {
    pub group_id: GroupId,
    pub consensus: ConsensusParam,
    pub tx_pool: TxPoolParam,
}

impl GroupParams {
    pub fn from_config(cfg: &GroupConfig) -> Self {
        Self {
            group_id: cfg.id,
            consensus: ConsensusParam {
                miner_list: cfg.miners.clone(),
                block_interval: cfg.block_interval(),
                max_block_txs: cfg.max_block_txs,
            },
            tx_pool: TxPoolParam { limit: cfg.pool_limit },
        }
    }
}

// ── precompiled contracts ────────────────────────────────────────────────────

/// A built-in contract served natively by the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecompiledContract {
    pub name: String,
}

pub type PrecompiledTable = HashMap<Address, PrecompiledContract>;

/// The built-in table every group is bootstrapped with: `ecrecover`,
/// `sha256`, `ripemd160` and `identity` at addresses `0x01..=0x04`.
pub fn default_precompiles() -> PrecompiledTable {
    ["ecrecover", "sha256", "ripemd160", "identity"]
        .into_iter()
        .zip(1u8..)
        .map(|(name, slot)| {
            let mut addr = [0u8; 20];
            addr[19] = slot;
            (Address::from_bytes(addr), PrecompiledContract { name: name.to_string() })
        })
        .collect()
}

// ── service contracts ────────────────────────────────────────────────────────

/// Read view over a group's chain.
pub trait BlockChain: Send + Sync {
    /// Current block height.
    fn number(&self) -> u64;
}

/// Why a pool refused a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("transaction is not signed")]
    Unsigned,

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("block limit {block_limit} already passed (height {height})")]
    BlockLimitExpired { block_limit: String, height: u64 },

    #[error("block limit {block_limit} too far ahead of height {height}")]
    BlockLimitTooFar { block_limit: String, height: u64 },

    #[error("transaction {0} already known")]
    Duplicate(H256),

    #[error("pool is full ({0} pending)")]
    PoolFull(usize),
}

/// Accepted submission: content hash and the recipient (or created contract)
/// address.
pub type SubmitReceipt = (H256, Address);

pub trait TxPool: Send + Sync {
    fn submit(&self, tx: Transaction) -> Result<SubmitReceipt, SubmitError>;

    fn pending_size(&self) -> usize;
}

pub trait Consensus: Send + Sync {
    /// Start the engine's background work. Calling it twice is a no-op.
    fn start(&self, shutdown: &CancellationToken);

    /// Snapshot of the engine state for diagnostics.
    fn status(&self) -> serde_json::Value;
}

/// Builds one group's full service stack in a single call.
pub trait LedgerFactory {
    fn init_single_ledger(
        &self,
        precompiles: &PrecompiledTable,
        network: Arc<dyn NetworkService>,
        params: GroupParams,
        identity: &NodeIdentity,
    ) -> Result<GroupRuntime, AppError>;
}

// ── runtime ──────────────────────────────────────────────────────────────────

/// Live services of one group. Every service is present from construction,
/// so a runtime can never be started half-built.
#[derive(Clone)]
pub struct GroupRuntime {
    params: GroupParams,
    blockchain: Arc<dyn BlockChain>,
    consensus: Arc<dyn Consensus>,
    tx_pool: Arc<dyn TxPool>,
}

impl GroupRuntime {
    pub fn new(
        params: GroupParams,
        blockchain: Arc<dyn BlockChain>,
        consensus: Arc<dyn Consensus>,
        tx_pool: Arc<dyn TxPool>,
    ) -> Self {
        Self { params, blockchain, consensus, tx_pool }
    }

    pub fn group_id(&self) -> GroupId {
        self.params.group_id
    }

    pub fn params(&self) -> &GroupParams {
        &self.params
    }

    pub fn blockchain(&self) -> Arc<dyn BlockChain> {
        Arc::clone(&self.blockchain)
    }

    pub fn consensus(&self) -> Arc<dyn Consensus> {
        Arc::clone(&self.consensus)
    }

    pub fn tx_pool(&self) -> Arc<dyn TxPool> {
        Arc::clone(&self.tx_pool)
    }

    fn start(&self, shutdown: &CancellationToken) {
        self.consensus.start(shutdown);
    }
}

impl fmt::Debug for GroupRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupRuntime")
            .field("group_id", &self.params.group_id)
            .field("miners", &self.params.consensus.miner_list.len())
            .finish_non_exhaustive()
    }
}
