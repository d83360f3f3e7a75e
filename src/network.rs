//! Network service contract and the in-process routing table.
//!
//! Transport is out of scope here: [`P2pService`] only keeps what the rest of
//! the node configures on it: the message factory and the group to
//! participant table used to route group traffic.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use tracing::{debug, warn};

use crate::types::{GroupId, NodeId};

/// Group id → node ids taking part in that group's consensus.
pub type GroupNodeList = BTreeMap<GroupId, Vec<NodeId>>;

/// A network packet. Inbound payloads are decoded into values built by the
/// configured [`MessageFactory`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub group: Option<GroupId>,
    pub packet_type: u16,
    pub payload: Vec<u8>,
}

/// Decides how inbound messages are constructed.
pub trait MessageFactory: Send + Sync {
    fn build_message(&self) -> Message;
}

/// Default factory: empty messages.
#[derive(Debug, Default)]
pub struct P2pMessageFactory;

impl MessageFactory for P2pMessageFactory {
    fn build_message(&self) -> Message {
        Message::default()
    }
}

/// The slice of the P2P service the node core talks to.
pub trait NetworkService: Send + Sync {
    /// Address this node listens on.
    fn listen(&self) -> &str;

    fn set_message_factory(&self, factory: Arc<dyn MessageFactory>);

    /// A fresh outbound message from the configured factory, or an empty one
    /// when none is set.
    fn build_message(&self) -> Message;

    /// Replace the routing table. Groups absent from `mapping` stop routing.
    fn set_group_node_list(&self, mapping: GroupNodeList);

    fn group_node_list(&self, group: GroupId) -> Option<Vec<NodeId>>;

    /// Peers that should receive a message for `group`: its participants
    /// other than the local node.
    fn route(&self, group: GroupId) -> Vec<NodeId>;
}

#[derive(Default)]
struct P2pState {
    factory: Option<Arc<dyn MessageFactory>>,
    groups: GroupNodeList,
}

/// In-process network service.
pub struct P2pService {
    local: NodeId,
    listen: String,
    state: RwLock<P2pState>,
}

impl P2pService {
    pub fn new(local: NodeId, listen: impl Into<String>) -> Self {
        Self {
            local,
            listen: listen.into(),
            state: RwLock::new(P2pState::default()),
        }
    }
}

impl NetworkService for P2pService {
    fn listen(&self) -> &str {
        &self.listen
    }

    fn build_message(&self) -> Message {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.factory.as_ref().map(|f| f.build_message()).unwrap_or_default()
    }

    fn set_message_factory(&self, factory: Arc<dyn MessageFactory>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.factory.is_some() {
            warn!("replacing previously configured message factory");
        }
        state.factory = Some(factory);
    }

    fn set_group_node_list(&self, mapping: GroupNodeList) {
        debug!(groups = ?mapping.keys().collect::<Vec<_>>(), "group routing table updated");
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.groups = mapping;
    }

    fn group_node_list(&self, group: GroupId) -> Option<Vec<NodeId>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.groups.get(&group).cloned()
    }

    fn route(&self, group: GroupId) -> Vec<NodeId> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .groups
            .get(&group)
            .map(|nodes| nodes.iter().filter(|n| **n != self.local).copied().collect())
            .unwrap_or_default()
    }
}
