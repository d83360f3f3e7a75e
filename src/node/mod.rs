//! Node sequencer — drives startup from identity to the idle park loop.
//!
//! `Unstarted → IdentityLoaded → GroupsBootstrapped(k) → AllStarted →
//! LoadGenRunning → Idle`, with `Failed` as the terminal error state. Each
//! step is a method that refuses to run out of order.

pub mod group;

use std::{fmt, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    bootstrap::identity::{self, NodeIdentity},
    config::Config,
    error::AppError,
    ledger::{GroupRegistry, LedgerFactory, PrecompiledTable, default_precompiles},
    loadgen::{LoadGenerator, LoadGeneratorHandle, LoadGeneratorState, template_transaction},
    network::{GroupNodeList, NetworkService, P2pMessageFactory, P2pService},
    types::GroupId,
};

use group::GroupBootstrapper;

/// Wake period of the idle loop.
pub const PARK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unstarted,
    IdentityLoaded,
    /// Number of groups bootstrapped so far.
    GroupsBootstrapped(u16),
    AllStarted,
    LoadGenRunning,
    Idle,
    Failed,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Unstarted => f.write_str("unstarted"),
            NodeState::IdentityLoaded => f.write_str("identity-loaded"),
            NodeState::GroupsBootstrapped(k) => write!(f, "groups-bootstrapped({k})"),
            NodeState::AllStarted => f.write_str("all-started"),
            NodeState::LoadGenRunning => f.write_str("loadgen-running"),
            NodeState::Idle => f.write_str("idle"),
            NodeState::Failed => f.write_str("failed"),
        }
    }
}

pub struct NodeSequencer<F: LedgerFactory> {
    config: Config,
    factory: F,
    network: Option<Arc<dyn NetworkService>>,
    precompiles: PrecompiledTable,
    state: NodeState,
    identity: Option<NodeIdentity>,
    registry: GroupRegistry,
    group_nodes: GroupNodeList,
}

impl<F: LedgerFactory> NodeSequencer<F> {
    pub fn new(config: Config, factory: F) -> Self {
        Self {
            config,
            factory,
            network: None,
            precompiles: default_precompiles(),
            state: NodeState::Unstarted,
            identity: None,
            registry: GroupRegistry::new(),
            group_nodes: GroupNodeList::new(),
        }
    }

    /// Use `network` instead of an in-process [`P2pService`] created once the
    /// identity is known.
    pub fn with_network(mut self, network: Arc<dyn NetworkService>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identity(&self) -> Option<&NodeIdentity> {
        self.identity.as_ref()
    }

    pub fn registry(&self) -> &GroupRegistry {
        &self.registry
    }

    pub fn network(&self) -> Option<Arc<dyn NetworkService>> {
        self.network.clone()
    }

    pub fn group_node_list(&self) -> &GroupNodeList {
        &self.group_nodes
    }

    fn require(&self, expected: NodeState, op: &str) -> Result<(), AppError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.out_of_order(op))
        }
    }

    fn out_of_order(&self, op: &str) -> AppError {
        AppError::Sequencer(format!("{op} is not allowed in state {}", self.state))
    }

    fn fail(&mut self, e: AppError) -> AppError {
        error!(state = %self.state, error = %e, "node startup failed");
        self.state = NodeState::Failed;
        e
    }

    /// Load the node secret and set up the network layer for it.
    pub fn load_identity(&mut self) -> Result<&NodeIdentity, AppError> {
        self.require(NodeState::Unstarted, "load_identity")?;

        let identity = identity::load(&self.config.identity_file).map_err(|e| self.fail(e))?;
        info!(
            node_id = %identity.node_id(),
            address = %identity.address(),
            fingerprint = %identity.fingerprint,
            "identity loaded"
        );

        let listen = &self.config.network.listen;
        let network = self.network.get_or_insert_with(|| -> Arc<dyn NetworkService> {
            Arc::new(P2pService::new(*identity.node_id(), listen.clone()))
        });
        network.set_message_factory(Arc::new(P2pMessageFactory));
        info!(listen = %network.listen(), "network ready");

        self.state = NodeState::IdentityLoaded;
        Ok(self.identity.insert(identity))
    }

    /// Bootstrap every configured group in ascending id order. Returns the
    /// number of groups built.
    pub fn bootstrap_groups(&mut self) -> Result<u16, AppError> {
        self.require(NodeState::IdentityLoaded, "bootstrap_groups")?;

        let (Some(identity), Some(network)) = (self.identity.clone(), self.network.clone()) else {
            return Err(self.fail(AppError::Sequencer("identity loaded without network".into())));
        };

        self.state = NodeState::GroupsBootstrapped(0);
        let bootstrapper =
            GroupBootstrapper::new(&self.factory, network, &self.precompiles, &identity);

        // Ids are looked up rather than taken in stored order.
        let mut outcome = Ok(());
        for id in 1..=self.config.groups.len() as u16 {
            let group = GroupId::new(id);
            let Some(cfg) = self.config.group(group) else {
                outcome = Err(AppError::Sequencer(format!(
                    "group {group} is not configured; ids must be 1..={}",
                    self.config.groups.len()
                )));
                break;
            };
            match bootstrapper.bootstrap(cfg, &mut self.registry, &mut self.group_nodes) {
                Ok(()) => self.state = NodeState::GroupsBootstrapped(id),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        outcome.map_err(|e| self.fail(e))?;

        Ok(self.registry.len() as u16)
    }

    /// Start every bootstrapped group. Allowed once, after the last group.
    pub fn start_all(&mut self, shutdown: &CancellationToken) -> Result<usize, AppError> {
        let expected = self.config.groups.len();
        match self.state {
            NodeState::GroupsBootstrapped(k) if usize::from(k) == expected => {}
            _ => return Err(self.out_of_order("start_all")),
        }

        let started = self.registry.start_all(shutdown).map_err(|e| self.fail(e))?;
        info!(groups = started, "all groups started");
        self.state = NodeState::AllStarted;
        Ok(started)
    }

    /// Launch the load generator against the configured group, or go straight
    /// to idle when it is disabled.
    pub fn launch_load_generator(
        &mut self,
        shutdown: &CancellationToken,
    ) -> Result<Option<LoadGeneratorHandle>, AppError> {
        self.require(NodeState::AllStarted, "launch_load_generator")?;

        if !self.config.load.enabled {
            info!("load generator disabled");
            self.state = NodeState::Idle;
            return Ok(None);
        }

        let group = self.config.load.group;
        let horizon = self.config.load.block_limit_horizon;
        let interval = self.config.load.interval();

        let (Some(blockchain), Some(tx_pool)) =
            (self.registry.blockchain(group), self.registry.tx_pool(group))
        else {
            return Err(self.fail(AppError::Sequencer(format!(
                "load target group {group} is not registered"
            ))));
        };
        let Some(identity) = self.identity.clone() else {
            return Err(self.fail(AppError::Sequencer("no identity loaded".into())));
        };
        let template = template_transaction().map_err(|e| self.fail(e))?;

        let generator = LoadGenerator::new(
            group,
            identity,
            blockchain,
            tx_pool,
            interval,
            LoadGeneratorState::new(template, horizon),
        );
        let handle = generator.spawn(shutdown.child_token());

        info!(%group, tx_speed = self.config.load.tx_speed, "load generator launched");
        self.state = NodeState::LoadGenRunning;
        Ok(Some(handle))
    }

    /// Park until `shutdown` is cancelled, waking every [`PARK_INTERVAL`].
    pub async fn park(&mut self, shutdown: &CancellationToken) -> Result<(), AppError> {
        match self.state {
            NodeState::LoadGenRunning | NodeState::Idle => {}
            _ => return Err(self.out_of_order("park")),
        }
        self.state = NodeState::Idle;
        info!("node running");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(PARK_INTERVAL) => {}
            }
        }

        info!("shutdown requested");
        Ok(())
    }

    /// Full startup sequence, then park until shutdown.
    pub async fn run(&mut self, shutdown: &CancellationToken) -> Result<(), AppError> {
        self.load_identity()?;
        self.bootstrap_groups()?;
        self.start_all(shutdown)?;
        // Dropping the handle on return detaches the generator; it stops with
        // the shutdown token it was spawned with.
        let _load = self.launch_load_generator(shutdown)?;
        self.park(shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ledger::memory::MemoryLedgerFactory,
        types::NodeId,
    };
    use std::fs;
    use tempfile::TempDir;

    const SECRET: &str = "0000000000000000000000000000000000000000000000000000000000000001";

    fn config(dir: &TempDir, groups: u16) -> Config {
        let cfg = Config::test_default(dir.path(), groups);
        fs::write(&cfg.identity_file, SECRET).unwrap();
        cfg
    }

    #[tokio::test]
    async fn steps_advance_the_state() {
        let dir = TempDir::new().unwrap();
        let mut node = NodeSequencer::new(config(&dir, 2), MemoryLedgerFactory);
        assert_eq!(node.state(), NodeState::Unstarted);

        node.load_identity().unwrap();
        assert_eq!(node.state(), NodeState::IdentityLoaded);

        assert_eq!(node.bootstrap_groups().unwrap(), 2);
        assert_eq!(node.state(), NodeState::GroupsBootstrapped(2));

        let token = CancellationToken::new();
        assert_eq!(node.start_all(&token).unwrap(), 2);
        assert_eq!(node.state(), NodeState::AllStarted);

        assert!(node.launch_load_generator(&token).unwrap().is_none());
        assert_eq!(node.state(), NodeState::Idle);
        token.cancel();
    }

    #[test]
    fn out_of_order_steps_are_refused() {
        let dir = TempDir::new().unwrap();
        let mut node = NodeSequencer::new(config(&dir, 1), MemoryLedgerFactory);
        let token = CancellationToken::new();

        assert!(matches!(node.bootstrap_groups(), Err(AppError::Sequencer(_))));
        assert!(matches!(node.start_all(&token), Err(AppError::Sequencer(_))));
        assert!(matches!(node.launch_load_generator(&token), Err(AppError::Sequencer(_))));
        assert_eq!(node.state(), NodeState::Unstarted);

        node.load_identity().unwrap();
        assert!(node.load_identity().is_err());
        assert!(node.start_all(&token).is_err());
        assert_eq!(node.state(), NodeState::IdentityLoaded);
    }

    #[test]
    fn short_identity_fails_before_any_group() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::test_default(dir.path(), 2);
        fs::write(&cfg.identity_file, &SECRET[..63]).unwrap();
        let mut node = NodeSequencer::new(cfg, MemoryLedgerFactory);

        let err = node.load_identity().unwrap_err();
        assert!(matches!(err, AppError::Identity(_)));
        assert_eq!(node.state(), NodeState::Failed);
        assert!(node.registry().is_empty());
        assert!(node.network().is_none());
    }

    #[test]
    fn bootstrap_failure_names_the_group() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, 3);
        cfg.groups[1].max_block_txs = 0;
        let mut node = NodeSequencer::new(cfg, MemoryLedgerFactory);

        node.load_identity().unwrap();
        let err = node.bootstrap_groups().unwrap_err();
        assert!(matches!(err, AppError::Bootstrap { group, .. } if group == GroupId::new(2)));
        assert_eq!(err.exit_code(), crate::error::EXIT_BOOTSTRAP);
        assert_eq!(node.state(), NodeState::Failed);
        assert_eq!(node.registry().group_ids(), vec![GroupId::new(1)]);
    }

    /// Records the order in which groups are built.
    #[derive(Default)]
    struct OrderedFactory(std::sync::Mutex<Vec<GroupId>>);

    impl LedgerFactory for OrderedFactory {
        fn init_single_ledger(
            &self,
            precompiles: &PrecompiledTable,
            network: Arc<dyn NetworkService>,
            params: crate::ledger::GroupParams,
            identity: &NodeIdentity,
        ) -> Result<crate::ledger::GroupRuntime, AppError> {
            self.0.lock().unwrap().push(params.group_id);
            MemoryLedgerFactory.init_single_ledger(precompiles, network, params, identity)
        }
    }

    #[test]
    fn groups_bootstrap_by_ascending_id_whatever_the_stored_order() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, 3);
        cfg.groups.reverse();
        let mut node = NodeSequencer::new(cfg, OrderedFactory::default());

        node.load_identity().unwrap();
        assert_eq!(node.bootstrap_groups().unwrap(), 3);
        assert_eq!(
            *node.factory.0.lock().unwrap(),
            vec![GroupId::new(1), GroupId::new(2), GroupId::new(3)]
        );
        assert_eq!(node.state(), NodeState::GroupsBootstrapped(3));
    }

    #[test]
    fn gap_in_group_ids_stops_bootstrap() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, 2);
        cfg.groups[1].id = GroupId::new(3);
        let mut node = NodeSequencer::new(cfg, MemoryLedgerFactory);

        node.load_identity().unwrap();
        let err = node.bootstrap_groups().unwrap_err();
        assert!(matches!(err, AppError::Sequencer(_)));
        assert!(err.to_string().contains("group 2 is not configured"));
        assert_eq!(node.state(), NodeState::Failed);
        assert_eq!(node.registry().group_ids(), vec![GroupId::new(1)]);
    }

    #[test]
    fn network_mapping_follows_miner_lists() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, 2);
        let m1 = NodeId::from_bytes([1; 64]);
        let m2 = NodeId::from_bytes([2; 64]);
        cfg.groups[0].miners = vec![m1];
        cfg.groups[1].miners = vec![m1, m2];
        let mut node = NodeSequencer::new(cfg, MemoryLedgerFactory);

        node.load_identity().unwrap();
        node.bootstrap_groups().unwrap();

        let network = node.network().unwrap();
        assert_eq!(network.group_node_list(GroupId::new(1)), Some(vec![m1]));
        assert_eq!(network.group_node_list(GroupId::new(2)), Some(vec![m1, m2]));
        assert_eq!(node.group_node_list().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn load_generator_feeds_target_group() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, 2);
        cfg.load.enabled = true;
        cfg.load.group = GroupId::new(2);
        cfg.set_tx_speed(100.0).unwrap();
        // Keep everything pending.
        cfg.groups[1].block_interval_ms = 60_000;
        let mut node = NodeSequencer::new(cfg, MemoryLedgerFactory);
        let token = CancellationToken::new();

        node.load_identity().unwrap();
        node.bootstrap_groups().unwrap();
        node.start_all(&token).unwrap();
        let handle = node.launch_load_generator(&token).unwrap().unwrap();
        assert_eq!(node.state(), NodeState::LoadGenRunning);

        tokio::time::sleep(Duration::from_millis(95)).await;
        handle.cancel();
        let attempts = handle.join().await.unwrap();

        let target = node.registry().tx_pool(GroupId::new(2)).unwrap();
        let other = node.registry().tx_pool(GroupId::new(1)).unwrap();
        assert_eq!(target.pending_size() as u64, attempts);
        assert_eq!(other.pending_size(), 0);
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn run_parks_until_cancelled() {
        let dir = TempDir::new().unwrap();
        let mut node = NodeSequencer::new(config(&dir, 1), MemoryLedgerFactory);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceller.cancel();
        });

        node.run(&token).await.unwrap();
        assert_eq!(node.state(), NodeState::Idle);
        assert!(node.registry().is_started());
    }
}
