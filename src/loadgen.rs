//! Synthetic load generator — signs and submits transactions into one group's
//! pool at a fixed rate.
//!
//! Every iteration bumps the nonce of a template transaction by one, moves its
//! block limit to `height + horizon` using the height read at that moment,
//! re-signs it with the node secret and submits it. Refused submissions are
//! logged at trace and never retried. Between iterations the task checks its
//! cancellation token and then sleeps for `1000 / rate` milliseconds.

use std::{sync::Arc, time::Duration};

use ethnum::U256;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::{
    bootstrap::identity::NodeIdentity,
    error::AppError,
    ledger::{BlockChain, SubmitError, SubmitReceipt, TxPool},
    transaction::Transaction,
    types::GroupId,
};

/// RLP of the template transaction: a token `transfer` call with nonce
/// `0x01be1a7d` and block limit 100. Its signature is replaced on the first
/// iteration.
pub const TEMPLATE_TX_HEX: &str = concat!(
    "f8aa8401be1a7d80830f4240941dc8def0867ea7e3626e03acee3eb40ee17251c880b84494e78a10",
    "0000000000000000000000003ca576d469d7aa0244071d27eb33c5629753593e",
    "0000000000000000000000000000000000000000000000000000000000001388",
    "1ba0f44a5ce4a1d1d6c2e4385a7985cdf804cb10a7fb892e9c08ff6d62657c4da01e",
    "a01d4c2af5ce505f574a320563ea9ea55003903ca5d22140155b3c2c968df0509464",
);

pub fn template_transaction() -> Result<Transaction, AppError> {
    let bytes = hex::decode(TEMPLATE_TX_HEX)
        .map_err(|e| AppError::Config(format!("template transaction hex: {e}")))?;
    Transaction::decode(&bytes)
        .map_err(|e| AppError::Config(format!("template transaction: {e}")))
}

// ── state ────────────────────────────────────────────────────────────────────

/// The mutable transaction template. Owned by exactly one generator task.
#[derive(Debug, Clone)]
pub struct LoadGeneratorState {
    tx: Transaction,
    horizon: u64,
}

impl LoadGeneratorState {
    pub fn new(template: Transaction, horizon: u64) -> Self {
        Self { tx: template, horizon }
    }

    pub fn nonce(&self) -> U256 {
        self.tx.nonce
    }

    /// Prepare the next transaction against chain height `height`.
    pub fn advance(&mut self, height: u64, identity: &NodeIdentity) -> &Transaction {
        self.tx.nonce += U256::ONE;
        self.tx.block_limit = U256::from(height) + U256::from(self.horizon);
        self.tx.sign(identity);
        &self.tx
    }
}

// ── generator ────────────────────────────────────────────────────────────────

pub struct LoadGenerator {
    group: GroupId,
    identity: NodeIdentity,
    blockchain: Arc<dyn BlockChain>,
    tx_pool: Arc<dyn TxPool>,
    interval: Duration,
    state: LoadGeneratorState,
}

impl LoadGenerator {
    pub fn new(
        group: GroupId,
        identity: NodeIdentity,
        blockchain: Arc<dyn BlockChain>,
        tx_pool: Arc<dyn TxPool>,
        interval: Duration,
        state: LoadGeneratorState,
    ) -> Self {
        Self { group, identity, blockchain, tx_pool, interval, state }
    }

    /// One build-sign-submit step.
    fn step(&mut self) -> Result<SubmitReceipt, SubmitError> {
        let height = self.blockchain.number();
        let tx = self.state.advance(height, &self.identity).clone();
        self.tx_pool.submit(tx)
    }

    /// Spawn the generator as a detached tokio task.
    pub fn spawn(self, shutdown: CancellationToken) -> LoadGeneratorHandle {
        let token = shutdown.clone();
        let inner = tokio::spawn(self.run(shutdown));
        LoadGeneratorHandle { inner, shutdown: token }
    }

    /// Run until `shutdown` is cancelled; returns the number of attempts.
    async fn run(mut self, shutdown: CancellationToken) -> u64 {
        info!(
            group = %self.group,
            interval_ms = self.interval.as_millis() as u64,
            start_nonce = %self.state.nonce(),
            "load generator running"
        );

        let mut attempts: u64 = 0;
        loop {
            match self.step() {
                Ok((hash, address)) => {
                    trace!(group = %self.group, %hash, %address, "transaction submitted");
                }
                Err(e) => {
                    trace!(group = %self.group, error = %e, "submission refused, ignored");
                }
            }
            attempts += 1;

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        debug!(group = %self.group, attempts, "load generator stopped");
        attempts
    }
}

// ── handle ───────────────────────────────────────────────────────────────────

/// Handle to the running generator task. Dropping it detaches the task.
pub struct LoadGeneratorHandle {
    inner: JoinHandle<u64>,
    shutdown: CancellationToken,
}

impl LoadGeneratorHandle {
    /// Ask the generator to stop after its current iteration.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Wait for the task to exit and return how many submissions it attempted.
    pub async fn join(self) -> Result<u64, AppError> {
        self.inner
            .await
            .map_err(|e| AppError::Sequencer(format!("load generator task failed: {e}")))
    }
}
