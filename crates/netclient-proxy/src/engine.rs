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
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use netclient_types::{peer_key_hash, PeerCfg, ProxyPeerMeta, PROXY_PORT};

use crate::conn::{PeerConn, ProxyOp};
use crate::turn::TurnRegistry;
use crate::ProxyError;

/// A peer's proxied endpoint, reported back so the device can be updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpointAssignment {
    /// Peer public key, base64.
    pub key: String,
    /// The loopback endpoint the WG device should use for this peer.
    pub endpoint: SocketAddr,
}

/// The proxy engine: one shared outer socket facing the internet, one
/// forwarder per proxied peer, and a demultiplexer routing inbound datagrams
/// by source address.
pub struct ProxyEngine {
    outer: Arc<UdpSocket>,
    wg_port: u16,
    peers: RwLock<HashMap<String, PeerConn>>,
    by_remote: RwLock<HashMap<SocketAddr, String>>,
    turn: TurnRegistry,
    degraded_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl ProxyEngine {
    /// Bind the shared outer socket. `private_port` 0 falls back to the
    /// well-known proxy port; `public_port` is only recorded for NAT'd
    /// setups where the two differ.
    pub async fn create_proxy_server(
        private_port: u16,
        _public_port: u16,
        private_ip: IpAddr,
        wg_port: u16,
        degraded_tx: mpsc::Sender<String>,
    ) -> Result<Self, ProxyError> {
        let port = if private_port == 0 {
            PROXY_PORT
        } else {
            private_port
        };
        let outer = UdpSocket::bind(SocketAddr::new(private_ip, port)).await?;
        info!(addr = %outer.local_addr()?, "proxy server listening");
        Ok(ProxyEngine {
            outer: Arc::new(outer),
            wg_port,
            peers: RwLock::new(HashMap::new()),
            by_remote: RwLock::new(HashMap::new()),
            turn: TurnRegistry::default(),
            degraded_tx,
            cancel: CancellationToken::new(),
        })
    }

    /// Address of the shared outer socket.
    pub fn outer_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.outer.local_addr()?)
    }

    /// TURN bookkeeping for this engine.
    pub fn turn(&self) -> &TurnRegistry {
        &self.turn
    }

    /// Token cancelling the ingress loop and all pumps.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Create a forwarder for `peer` and return the loopback endpoint to
    /// hand to the WG device. Adding an already-proxied peer records the
    /// additional server reference and returns the existing endpoint.
    pub async fn add_peer(
        &self,
        server: &str,
        peer: &PeerCfg,
        meta: &ProxyPeerMeta,
    ) -> Result<SocketAddr, ProxyError> {
        if let Some(existing) = self.peers.write().await.get_mut(&peer.public_key) {
            existing.servers.insert(server.to_string());
            debug!(peer = %peer.public_key, server, "peer already proxied, added reference");
            return Ok(existing.local_addr());
        }

        let remote = effective_remote(peer, meta)?;
        let conn = PeerConn::start(
            peer.public_key.clone(),
            peer_key_hash(&peer.public_key),
            server.to_string(),
            remote,
            meta.is_relayed,
            meta.relay_to,
            self.outer.clone(),
            self.wg_port,
        )
        .await;

        let conn = match conn {
            Ok(conn) => conn,
            Err(e @ ProxyError::BindExhausted { .. }) => {
                // Degraded: the reconciler falls back to the direct endpoint.
                let _ = self.degraded_tx.send(peer.public_key.clone()).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let local = conn.local_addr();
        self.by_remote
            .write()
            .await
            .insert(remote, peer.public_key.clone());
        self.peers
            .write()
            .await
            .insert(peer.public_key.clone(), conn);
        info!(peer = %peer.public_key, %remote, %local, "proxying peer");
        Ok(local)
    }

    /// Redirect an existing forwarder to a new remote endpoint.
    pub async fn update_peer(&self, key: &str, endpoint: SocketAddr) -> Result<(), ProxyError> {
        let peers = self.peers.read().await;
        let conn = peers
            .get(key)
            .ok_or_else(|| ProxyError::UnknownPeer(key.to_string()))?;
        let old = conn.remote().await;
        if old == endpoint {
            return Ok(());
        }
        conn.set_remote(endpoint).await;
        drop(peers);

        let mut by_remote = self.by_remote.write().await;
        by_remote.remove(&old);
        by_remote.insert(endpoint, key.to_string());
        debug!(peer = %key, %old, new = %endpoint, "redirected forwarder");
        Ok(())
    }

    /// Drop `server`'s reference on the peer; tear the forwarder down only
    /// when no server references it anymore.
    pub async fn remove_peer(&self, server: &str, key: &str) {
        let mut peers = self.peers.write().await;
        let last_reference = match peers.get_mut(key) {
            Some(conn) => {
                conn.servers.remove(server);
                conn.servers.is_empty()
            }
            None => return,
        };
        if !last_reference {
            debug!(peer = %key, server, "dropped server reference");
            return;
        }
        if let Some(mut conn) = peers.remove(key) {
            let remote = conn.remote().await;
            conn.close();
            drop(peers);
            self.by_remote.write().await.remove(&remote);
            self.turn.delete_peer_addr(server, key).await;
            info!(peer = %key, "stopped proxying peer");
        }
    }

    /// Dispatch a lifecycle operation on a forwarder by key.
    pub async fn dispatch(&self, key: &str, op: ProxyOp) -> Result<(), ProxyError> {
        match op {
            ProxyOp::Stop => {
                let mut peers = self.peers.write().await;
                if let Some(mut conn) = peers.remove(key) {
                    let remote = conn.remote().await;
                    conn.close();
                    drop(peers);
                    self.by_remote.write().await.remove(&remote);
                }
                Ok(())
            }
            ProxyOp::Reset => {
                let mut peers = self.peers.write().await;
                let conn = peers
                    .get_mut(key)
                    .ok_or_else(|| ProxyError::UnknownPeer(key.to_string()))?;
                conn.reset().await
            }
        }
    }

    /// Loopback endpoint currently assigned to a peer, if proxied.
    pub async fn peer_endpoint(&self, key: &str) -> Option<SocketAddr> {
        self.peers.read().await.get(key).map(|c| c.local_addr())
    }

    /// Keys of all proxied peers.
    pub async fn peer_keys(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }

    /// `(sent, received)` byte counters per peer.
    pub async fn metrics(&self) -> HashMap<String, (u64, u64)> {
        self.peers
            .read()
            .await
            .iter()
            .map(|(k, c)| (k.clone(), c.counters.snapshot()))
            .collect()
    }

    /// Tear down every forwarder.
    pub async fn remove_all(&self) {
        let mut peers = self.peers.write().await;
        for (_, conn) in peers.iter_mut() {
            conn.close();
        }
        peers.clear();
        self.by_remote.write().await.clear();
        info!("stopped all forwarders");
    }

    /// Ingress loop: demultiplex datagrams arriving on the shared outer
    /// socket by source address and forward them to the WG device through
    /// the owning peer's loopback socket. Runs until cancelled.
    pub async fn run(&self) {
        let mut buf = vec![0u8; 65535];
        loop {
            let (len, from) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = self.outer.recv_from(&mut buf) => match res {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "outer socket read failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            let key = self.by_remote.read().await.get(&from).cloned();
            let Some(key) = key else {
                debug!(%from, len, "datagram from unknown remote, dropping");
                continue;
            };

            let peers = self.peers.read().await;
            if let Some(conn) = peers.get(&key) {
                if let Err(e) = conn.forward_inbound(&buf[..len]).await {
                    warn!(peer = %key, error = %e, "inbound forward failed");
                }
            }
        }
        debug!("proxy ingress loop stopped");
    }
}

/// Resolve the address egress traffic is actually sent to: the relay for
/// relayed peers, otherwise the peer endpoint with its public proxy port
/// (attached ext clients keep their own port).
pub fn effective_remote(peer: &PeerCfg, meta: &ProxyPeerMeta) -> Result<SocketAddr, ProxyError> {
    let endpoint = peer
        .endpoint
        .ok_or_else(|| ProxyError::NoEndpoint(peer.public_key.clone()))?;

    if meta.is_relayed {
        return meta
            .relay_to
            .ok_or_else(|| ProxyError::MissingRelay(peer.public_key.clone()));
    }

    let port = if peer.is_ext_client && peer.is_attached_ext_client {
        endpoint.port()
    } else if peer.public_listen_port == 0 {
        PROXY_PORT
    } else {
        peer.public_listen_port
    };
    Ok(SocketAddr::new(endpoint.ip(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(key: &str, endpoint: &str) -> PeerCfg {
        PeerCfg {
            public_key: key.into(),
            endpoint: Some(endpoint.parse().unwrap()),
            allowed_ips: vec!["10.0.0.2/32".into()],
            ..PeerCfg::default()
        }
    }

    #[test]
    fn effective_remote_uses_proxy_port_by_default() {
        let p = peer("a", "1.2.3.4:51820");
        let addr = effective_remote(&p, &ProxyPeerMeta::default()).unwrap();
        assert_eq!(addr, format!("1.2.3.4:{PROXY_PORT}").parse().unwrap());
    }

    #[test]
    fn effective_remote_honors_public_listen_port() {
        let mut p = peer("a", "1.2.3.4:51820");
        p.public_listen_port = 40000;
        let addr = effective_remote(&p, &ProxyPeerMeta::default()).unwrap();
        assert_eq!(addr, "1.2.3.4:40000".parse().unwrap());
    }

    #[test]
    fn attached_ext_client_keeps_original_port() {
        let mut p = peer("a", "1.2.3.4:51820");
        p.is_ext_client = true;
        p.is_attached_ext_client = true;
        let addr = effective_remote(&p, &ProxyPeerMeta::default()).unwrap();
        assert_eq!(addr, "1.2.3.4:51820".parse().unwrap());
    }

    #[test]
    fn relayed_peer_targets_relay() {
        let p = peer("a", "1.2.3.4:51820");
        let meta = ProxyPeerMeta {
            is_relayed: true,
            relay_to: Some("9.8.7.6:51722".parse().unwrap()),
        };
        let addr = effective_remote(&p, &meta).unwrap();
        assert_eq!(addr, "9.8.7.6:51722".parse().unwrap());
    }

    #[test]
    fn relayed_peer_without_relay_is_an_error() {
        let p = peer("a", "1.2.3.4:51820");
        let meta = ProxyPeerMeta {
            is_relayed: true,
            relay_to: None,
        };
        assert!(matches!(
            effective_remote(&p, &meta),
            Err(ProxyError::MissingRelay(_))
        ));
    }

    #[tokio::test]
    async fn add_peer_twice_reuses_forwarder() {
        let (tx, _rx) = mpsc::channel(1);
        let engine = ProxyEngine::create_proxy_server(
            0,
            0,
            "127.0.0.1".parse().unwrap(),
            51821,
            tx,
        )
        .await;
        // The well-known port may be taken on the test host; skip if so.
        let Ok(engine) = engine else { return };

        let p = peer("cGVlcg==", "127.0.0.1:45000");
        let meta = ProxyPeerMeta::default();
        let first = engine.add_peer("srv1", &p, &meta).await.unwrap();
        let second = engine.add_peer("srv2", &p, &meta).await.unwrap();
        assert_eq!(first, second);

        // One server dropping its reference keeps the forwarder alive.
        engine.remove_peer("srv1", &p.public_key).await;
        assert_eq!(engine.peer_endpoint(&p.public_key).await, Some(first));
        engine.remove_peer("srv2", &p.public_key).await;
        assert_eq!(engine.peer_endpoint(&p.public_key).await, None);
    }
}
