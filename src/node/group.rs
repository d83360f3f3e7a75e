//! Single-group bootstrap: build the ledger stack, register it, publish its
//! participants to the network layer.

use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    bootstrap::identity::NodeIdentity,
    config::GroupConfig,
    error::AppError,
    ledger::{GroupParams, GroupRegistry, LedgerFactory, PrecompiledTable},
    network::{GroupNodeList, NetworkService},
};

/// Shared inputs for bootstrapping every group of this node.
pub struct GroupBootstrapper<'a, F: LedgerFactory + ?Sized> {
    factory: &'a F,
    network: Arc<dyn NetworkService>,
    precompiles: &'a PrecompiledTable,
    identity: &'a NodeIdentity,
}

impl<'a, F: LedgerFactory + ?Sized> GroupBootstrapper<'a, F> {
    pub fn new(
        factory: &'a F,
        network: Arc<dyn NetworkService>,
        precompiles: &'a PrecompiledTable,
        identity: &'a NodeIdentity,
    ) -> Self {
        Self { factory, network, precompiles, identity }
    }

    /// Build and register one group.
    ///
    /// `group_nodes` accumulates the participants of every group bootstrapped
    /// so far; the whole table is pushed to the network layer each time, so
    /// earlier groups keep routing after later ones are added.
    pub fn bootstrap(
        &self,
        cfg: &GroupConfig,
        registry: &mut GroupRegistry,
        group_nodes: &mut GroupNodeList,
    ) -> Result<(), AppError> {
        let group = cfg.id;
        info!(%group, miners = cfg.miners.len(), "bootstrapping group");

        let runtime = self
            .factory
            .init_single_ledger(
                self.precompiles,
                Arc::clone(&self.network),
                GroupParams::from_config(cfg),
                self.identity,
            )
            .map_err(|e| match e {
                AppError::Bootstrap { .. } => e,
                other => AppError::bootstrap(group, other.to_string()),
            })?;

        if runtime.group_id() != group {
            return Err(AppError::bootstrap(
                group,
                format!("ledger factory returned group {}", runtime.group_id()),
            ));
        }

        registry.insert(runtime.clone())?;

        let miners = runtime.params().consensus.miner_list.clone();
        for (idx, miner) in miners.iter().enumerate() {
            debug!(%group, idx, %miner, "group participant");
        }
        group_nodes.insert(group, miners);
        self.network.set_group_node_list(group_nodes.clone());

        debug!(%group, status = %runtime.consensus().status(), "consensus status");
        info!(%group, "group bootstrapped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ledger::{GroupRuntime, default_precompiles, memory::MemoryLedgerFactory},
        network::P2pService,
        types::{GroupId, NodeId},
    };

    fn identity() -> NodeIdentity {
        NodeIdentity::from_secret_bytes(&[7u8; 32]).unwrap()
    }

    fn group(id: u16, miners: Vec<NodeId>) -> GroupConfig {
        GroupConfig { id: GroupId::new(id), miners, block_interval_ms: 500, max_block_txs: 10, pool_limit: 16 }
    }

    #[test]
    fn mapping_accumulates_across_groups() {
        let id = identity();
        let network = Arc::new(P2pService::new(*id.node_id(), "127.0.0.1:0"));
        let table = default_precompiles();
        let boot = GroupBootstrapper::new(&MemoryLedgerFactory, network.clone(), &table, &id);

        let mut registry = GroupRegistry::new();
        let mut nodes = GroupNodeList::new();
        let a = NodeId::from_bytes([0xaa; 64]);
        let b = NodeId::from_bytes([0xbb; 64]);

        boot.bootstrap(&group(1, vec![a]), &mut registry, &mut nodes).unwrap();
        boot.bootstrap(&group(2, vec![a, b]), &mut registry, &mut nodes).unwrap();

        assert_eq!(registry.group_ids(), vec![GroupId::new(1), GroupId::new(2)]);
        assert_eq!(network.group_node_list(GroupId::new(1)), Some(vec![a]));
        assert_eq!(network.group_node_list(GroupId::new(2)), Some(vec![a, b]));
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn factory_failure_is_a_bootstrap_error() {
        let id = identity();
        let network = Arc::new(P2pService::new(*id.node_id(), "127.0.0.1:0"));
        let table = PrecompiledTable::new();
        let boot = GroupBootstrapper::new(&MemoryLedgerFactory, network.clone(), &table, &id);

        let mut cfg = group(1, vec![]);
        cfg.pool_limit = 0;
        let mut registry = GroupRegistry::new();
        let mut nodes = GroupNodeList::new();
        let err = boot.bootstrap(&cfg, &mut registry, &mut nodes).unwrap_err();

        assert!(matches!(err, AppError::Bootstrap { group, .. } if group == GroupId::new(1)));
        assert!(registry.is_empty());
        assert!(network.group_node_list(GroupId::new(1)).is_none());
    }

    struct WrongGroup;

    impl LedgerFactory for WrongGroup {
        fn init_single_ledger(
            &self,
            precompiles: &PrecompiledTable,
            network: Arc<dyn NetworkService>,
            mut params: GroupParams,
            identity: &NodeIdentity,
        ) -> Result<GroupRuntime, AppError> {
            params.group_id = GroupId::new(params.group_id.get() + 1);
            MemoryLedgerFactory.init_single_ledger(precompiles, network, params, identity)
        }
    }

    #[test]
    fn mismatched_group_is_refused() {
        let id = identity();
        let network = Arc::new(P2pService::new(*id.node_id(), "127.0.0.1:0"));
        let table = PrecompiledTable::new();
        let boot = GroupBootstrapper::new(&WrongGroup, network, &table, &id);

        let mut registry = GroupRegistry::new();
        let err = boot
            .bootstrap(&group(1, vec![]), &mut registry, &mut GroupNodeList::new())
            .unwrap_err();
        assert!(err.to_string().contains("returned group 2"));
        assert!(registry.is_empty());
    }
}
