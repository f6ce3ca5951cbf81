// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::error;

use netclient_types::{GatewayDetection, Host, Node, Server};

use crate::config::{ConfigError, ConfigStore};

/// All mutable agent state behind one coordinating lock, threaded through
/// the components explicitly.
///
/// The lock is never held across I/O: accessors copy out, mutators apply a
/// closure and release. Persistence reads a snapshot under the lock and
/// writes it to disk after release.
#[derive(Clone)]
pub struct AgentState {
    inner: Arc<RwLock<StateInner>>,
    store: ConfigStore,
}

struct StateInner {
    host: Host,
    servers: BTreeMap<String, Server>,
    nodes: BTreeMap<String, Node>,
    gateway: GatewayDetection,
    /// In-memory record of which peers each server contributed, so one
    /// server's update replaces only its own share of `host.host_peers`.
    server_peers: BTreeMap<String, Vec<netclient_types::PeerCfg>>,
}

impl AgentState {
    /// Load all three config files through `store`.
    pub async fn load(store: ConfigStore) -> Result<Self, ConfigError> {
        let host = store.read_host().await?;
        let servers = store.read_servers().await?;
        let nodes = store.read_nodes().await?;
        Ok(AgentState {
            inner: Arc::new(RwLock::new(StateInner {
                host,
                servers,
                nodes,
                gateway: GatewayDetection::default(),
                server_peers: BTreeMap::new(),
            })),
            store,
        })
    }

    /// State seeded directly from values, for tests and one-shot commands.
    pub fn from_parts(
        store: ConfigStore,
        host: Host,
        servers: BTreeMap<String, Server>,
        nodes: BTreeMap<String, Node>,
    ) -> Self {
        AgentState {
            inner: Arc::new(RwLock::new(StateInner {
                host,
                servers,
                nodes,
                gateway: GatewayDetection::default(),
                server_peers: BTreeMap::new(),
            })),
            store,
        }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StateInner> {
        self.inner.read().expect("state lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StateInner> {
        self.inner.write().expect("state lock poisoned")
    }

    pub fn host(&self) -> Host {
        self.read().host.clone()
    }

    /// Mutate the host record under the lock.
    pub fn update_host<R>(&self, f: impl FnOnce(&mut Host) -> R) -> R {
        f(&mut self.write().host)
    }

    pub fn server(&self, name: &str) -> Option<Server> {
        self.read().servers.get(name).cloned()
    }

    pub fn servers(&self) -> BTreeMap<String, Server> {
        self.read().servers.clone()
    }

    pub fn upsert_server(&self, server: Server) {
        self.write().servers.insert(server.name.clone(), server);
    }

    pub fn remove_server(&self, name: &str) -> Option<Server> {
        self.write().servers.remove(name)
    }

    pub fn node(&self, network: &str) -> Option<Node> {
        self.read().nodes.get(network).cloned()
    }

    pub fn nodes(&self) -> BTreeMap<String, Node> {
        self.read().nodes.clone()
    }

    pub fn upsert_node(&self, node: Node) {
        self.write().nodes.insert(node.network.clone(), node);
    }

    pub fn remove_node(&self, network: &str) -> Option<Node> {
        self.write().nodes.remove(network)
    }

    /// Networks owned by `server`.
    pub fn nodes_of_server(&self, server: &str) -> Vec<Node> {
        self.read()
            .nodes
            .values()
            .filter(|n| n.server == server)
            .cloned()
            .collect()
    }

    pub fn gateway(&self) -> GatewayDetection {
        self.read().gateway.clone()
    }

    pub fn set_gateway(&self, gateway: GatewayDetection) {
        self.write().gateway = gateway;
    }

    /// Replace `server`'s contribution to the host peer set and rebuild the
    /// merged list. Later contributions win on key collisions. Returns the
    /// merged set.
    pub fn set_server_peers(
        &self,
        server: &str,
        peers: Vec<netclient_types::PeerCfg>,
    ) -> Vec<netclient_types::PeerCfg> {
        let mut inner = self.write();
        inner.server_peers.insert(server.to_string(), peers);
        let mut merged: Vec<netclient_types::PeerCfg> = Vec::new();
        for contribution in inner.server_peers.values() {
            for peer in contribution {
                if let Some(existing) =
                    merged.iter_mut().find(|p| p.public_key == peer.public_key)
                {
                    *existing = peer.clone();
                } else {
                    merged.push(peer.clone());
                }
            }
        }
        inner.host.host_peers = merged.clone();
        merged
    }

    /// Drop `server`'s peer contribution entirely.
    pub fn clear_server_peers(&self, server: &str) -> Vec<netclient_types::PeerCfg> {
        let mut inner = self.write();
        inner.server_peers.remove(server);
        let merged: Vec<netclient_types::PeerCfg> = inner
            .server_peers
            .values()
            .flatten()
            .cloned()
            .collect();
        inner.host.host_peers = merged.clone();
        merged
    }

    /// Whether any joined node makes this host an internet gateway.
    pub fn host_is_inet_gateway(&self) -> bool {
        self.read()
            .nodes
            .values()
            .any(|n| n.egresses_default_route())
    }

    /// Write the host record to disk. Failure is logged, never fatal: the
    /// in-memory state has already advanced and the next successful write
    /// heals the file.
    pub async fn persist_host(&self) {
        let host = self.host();
        if let Err(e) = self.store.write_host(&host).await {
            error!(error = %e, "failed to persist host config");
        }
    }

    pub async fn persist_nodes(&self) {
        let nodes = self.nodes();
        if let Err(e) = self.store.write_nodes(&nodes).await {
            error!(error = %e, "failed to persist node config");
        }
    }

    pub async fn persist_servers(&self) {
        let servers = self.servers();
        if let Err(e) = self.store.write_servers(&servers).await {
            error!(error = %e, "failed to persist server config");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AgentState {
        let dir = tempfile::tempdir().unwrap();
        AgentState::from_parts(
            ConfigStore::new(dir.path()),
            Host::with_defaults(),
            BTreeMap::new(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn node_map_is_keyed_by_network() {
        let state = state();
        state.upsert_node(Node {
            network: "net1".into(),
            server: "srv1".into(),
            ..Node::default()
        });
        state.upsert_node(Node {
            network: "net2".into(),
            server: "srv2".into(),
            ..Node::default()
        });

        assert_eq!(state.nodes().len(), 2);
        assert_eq!(state.nodes_of_server("srv1").len(), 1);
        assert!(state.remove_node("net1").is_some());
        assert!(state.node("net1").is_none());
    }

    #[test]
    fn inet_gateway_follows_node_egress_ranges() {
        let state = state();
        assert!(!state.host_is_inet_gateway());
        state.upsert_node(Node {
            network: "net1".into(),
            server: "srv1".into(),
            is_egress_gateway: true,
            egress_gateway_ranges: vec!["0.0.0.0/0".into()],
            ..Node::default()
        });
        assert!(state.host_is_inet_gateway());
    }
}
