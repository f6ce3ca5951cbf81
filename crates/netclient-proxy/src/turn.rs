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

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::RwLock;
use tracing::debug;

/// TURN server settings a controller hands out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCfg {
    /// TURN server address, `host:port`.
    pub addr: String,
    /// Allocation username.
    pub username: String,
    /// Allocation password.
    pub password: String,
}

/// Per-server TURN configuration and per-(server, peer) relay addresses.
///
/// Peer entries are keyed by `(server, peer key)` throughout, including
/// deletion.
#[derive(Debug, Default)]
pub struct TurnRegistry {
    cfgs: RwLock<HashMap<String, TurnCfg>>,
    peer_addrs: RwLock<HashMap<(String, String), SocketAddr>>,
}

impl TurnRegistry {
    pub async fn set_cfg(&self, server: &str, cfg: TurnCfg) {
        self.cfgs.write().await.insert(server.to_string(), cfg);
    }

    pub async fn cfg(&self, server: &str) -> Option<TurnCfg> {
        self.cfgs.read().await.get(server).cloned()
    }

    pub async fn delete_cfg(&self, server: &str) {
        self.cfgs.write().await.remove(server);
        self.peer_addrs
            .write()
            .await
            .retain(|(srv, _), _| srv != server);
    }

    /// Record the relay address a peer is reachable at through `server`'s
    /// TURN deployment.
    pub async fn set_peer_addr(&self, server: &str, peer: &str, addr: SocketAddr) {
        debug!(server, peer, %addr, "recorded TURN peer address");
        self.peer_addrs
            .write()
            .await
            .insert((server.to_string(), peer.to_string()), addr);
    }

    pub async fn peer_addr(&self, server: &str, peer: &str) -> Option<SocketAddr> {
        self.peer_addrs
            .read()
            .await
            .get(&(server.to_string(), peer.to_string()))
            .copied()
    }

    pub async fn delete_peer_addr(&self, server: &str, peer: &str) {
        self.peer_addrs
            .write()
            .await
            .remove(&(server.to_string(), peer.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peer_addrs_keyed_by_server_and_peer() {
        let registry = TurnRegistry::default();
        let addr: SocketAddr = "203.0.113.9:3478".parse().unwrap();
        registry.set_peer_addr("srv1", "peerA", addr).await;
        registry.set_peer_addr("srv2", "peerA", addr).await;

        registry.delete_peer_addr("srv1", "peerA").await;
        assert_eq!(registry.peer_addr("srv1", "peerA").await, None);
        assert_eq!(registry.peer_addr("srv2", "peerA").await, Some(addr));
    }

    #[tokio::test]
    async fn delete_cfg_drops_that_servers_peers() {
        let registry = TurnRegistry::default();
        let addr: SocketAddr = "203.0.113.9:3478".parse().unwrap();
        registry
            .set_cfg(
                "srv1",
                TurnCfg {
                    addr: "turn.example.com:3478".into(),
                    username: "u".into(),
                    password: "p".into(),
                },
            )
            .await;
        registry.set_peer_addr("srv1", "peerA", addr).await;
        registry.set_peer_addr("srv2", "peerB", addr).await;

        registry.delete_cfg("srv1").await;
        assert_eq!(registry.cfg("srv1").await, None);
        assert_eq!(registry.peer_addr("srv1", "peerA").await, None);
        assert_eq!(registry.peer_addr("srv2", "peerB").await, Some(addr));
    }
}
