//! Group registry — owned map of bootstrapped group runtimes.
//!
//! Groups are inserted one by one during bootstrap. [`GroupRegistry::start_all`]
//! seals the registry: afterwards no group can be added and a second start is
//! refused.

use std::{collections::BTreeMap, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{BlockChain, Consensus, GroupParams, GroupRuntime, TxPool};
use crate::{error::AppError, types::GroupId};

#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: BTreeMap<GroupId, GroupRuntime>,
    started: bool,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, runtime: GroupRuntime) -> Result<(), AppError> {
        let id = runtime.group_id();
        if self.started {
            return Err(AppError::Registry(format!(
                "cannot add group {id}: groups are already started"
            )));
        }
        if self.groups.contains_key(&id) {
            return Err(AppError::Registry(format!("group {id} is already registered")));
        }
        self.groups.insert(id, runtime);
        Ok(())
    }

    /// Start every registered group, in ascending id order.
    pub fn start_all(&mut self, shutdown: &CancellationToken) -> Result<usize, AppError> {
        if self.started {
            return Err(AppError::Registry("groups are already started".into()));
        }
        self.started = true;
        for (id, runtime) in &self.groups {
            runtime.start(shutdown);
            info!(group = %id, "group started");
        }
        Ok(self.groups.len())
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group_ids(&self) -> Vec<GroupId> {
        self.groups.keys().copied().collect()
    }

    pub fn get(&self, group: GroupId) -> Option<&GroupRuntime> {
        self.groups.get(&group)
    }

    pub fn params(&self, group: GroupId) -> Option<&GroupParams> {
        self.groups.get(&group).map(GroupRuntime::params)
    }

    pub fn blockchain(&self, group: GroupId) -> Option<Arc<dyn BlockChain>> {
        self.groups.get(&group).map(GroupRuntime::blockchain)
    }

    pub fn tx_pool(&self, group: GroupId) -> Option<Arc<dyn TxPool>> {
        self.groups.get(&group).map(GroupRuntime::tx_pool)
    }

    pub fn consensus(&self, group: GroupId) -> Option<Arc<dyn Consensus>> {
        self.groups.get(&group).map(GroupRuntime::consensus)
    }
}
