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

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use netclient_types::KEY_HASH_LEN;

use crate::ProxyError;

const MAX_BIND_ATTEMPTS: u32 = 5;
const BIND_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Lifecycle of a per-peer forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Starting,
    Running,
    Resetting,
    Stopped,
}

/// Operation dispatched on a forwarder by key, replacing stored callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOp {
    Stop,
    Reset,
}

/// Per-direction byte counters for one forwarder.
#[derive(Debug, Default)]
pub struct ConnCounters {
    sent: AtomicU64,
    received: AtomicU64,
}

impl ConnCounters {
    pub fn add_sent(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    /// `(sent, received)` snapshot.
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.received.load(Ordering::Relaxed),
        )
    }
}

/// One proxied peer: a loopback socket the WG device talks to, the true
/// remote endpoint, and the egress pump shuttling between them.
pub struct PeerConn {
    /// Peer WireGuard public key, base64.
    pub key: String,
    /// SHA-1 tag of the key, used in prober messages.
    pub key_hash: [u8; KEY_HASH_LEN],
    /// Servers referencing this peer. Teardown only when empty.
    pub servers: HashSet<String>,
    /// Whether traffic goes through a relay.
    pub is_relayed: bool,
    /// The relay endpoint when relayed.
    pub relay_to: Option<SocketAddr>,
    /// Byte counters, preserved across resets.
    pub counters: Arc<ConnCounters>,

    /// None only transiently while resetting.
    local: Option<Arc<UdpSocket>>,
    local_addr: SocketAddr,
    remote: Arc<RwLock<SocketAddr>>,
    state: ConnState,
    wg_port: u16,
    outer: Arc<UdpSocket>,
    pump_cancel: CancellationToken,
    pump_handle: Option<tokio::task::JoinHandle<()>>,
}

impl PeerConn {
    /// Bind the loopback socket and start the egress pump. Enters `Running`
    /// on success. Bind failures are retried with exponential backoff; after
    /// [`MAX_BIND_ATTEMPTS`] the error is returned so the caller can mark
    /// the peer degraded.
    pub async fn start(
        key: String,
        key_hash: [u8; KEY_HASH_LEN],
        server: String,
        remote: SocketAddr,
        is_relayed: bool,
        relay_to: Option<SocketAddr>,
        outer: Arc<UdpSocket>,
        wg_port: u16,
    ) -> Result<Self, ProxyError> {
        let local = bind_with_backoff(&key, None).await?;
        let local_addr = local.local_addr()?;
        debug!(peer = %key, local = %local_addr, %remote, "forwarder running");

        let mut conn = PeerConn {
            key,
            key_hash,
            servers: HashSet::from([server]),
            is_relayed,
            relay_to,
            counters: Arc::new(ConnCounters::default()),
            local: Some(Arc::new(local)),
            local_addr,
            remote: Arc::new(RwLock::new(remote)),
            state: ConnState::Starting,
            wg_port,
            outer,
            pump_cancel: CancellationToken::new(),
            pump_handle: None,
        };
        conn.spawn_egress_pump();
        conn.state = ConnState::Running;
        Ok(conn)
    }

    /// The loopback address handed to the WG device as this peer's endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current effective remote endpoint.
    pub async fn remote(&self) -> SocketAddr {
        *self.remote.read().await
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Redirect the forwarder to a new remote endpoint.
    pub async fn set_remote(&self, remote: SocketAddr) {
        *self.remote.write().await = remote;
    }

    /// Forward an inbound datagram from the outer socket to the WG device's
    /// listen port, sourced from this peer's loopback address.
    pub async fn forward_inbound(&self, data: &[u8]) -> Result<(), ProxyError> {
        let Some(local) = &self.local else {
            return Ok(()); // mid-reset, datagram dropped
        };
        let wg = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.wg_port);
        local.send_to(data, wg).await?;
        self.counters.add_received(data.len() as u64);
        Ok(())
    }

    /// Close sockets, rebind the same loopback port, and resume the pump.
    /// Identity (key, local address, counters, servers) is preserved.
    pub async fn reset(&mut self) -> Result<(), ProxyError> {
        self.state = ConnState::Resetting;
        self.pump_cancel.cancel();
        if let Some(handle) = self.pump_handle.take() {
            let _ = handle.await;
        }
        // The port frees only once both our handle and the pump's are gone.
        self.local = None;
        let local = bind_with_backoff(&self.key, Some(self.local_addr)).await?;
        self.local_addr = local.local_addr()?;
        self.local = Some(Arc::new(local));
        self.pump_cancel = CancellationToken::new();
        self.spawn_egress_pump();
        self.state = ConnState::Running;
        debug!(peer = %self.key, local = %self.local_addr, "forwarder reset");
        Ok(())
    }

    /// Stop the pump and release the socket. Final.
    pub fn close(&mut self) {
        self.pump_cancel.cancel();
        self.local = None;
        self.state = ConnState::Stopped;
        debug!(peer = %self.key, "forwarder stopped");
    }

    /// Egress: read WG packets off the loopback socket, rewrite the
    /// destination to the effective remote, send through the outer socket.
    fn spawn_egress_pump(&mut self) {
        let Some(local) = self.local.clone() else {
            return;
        };
        let outer = self.outer.clone();
        let remote = self.remote.clone();
        let counters = self.counters.clone();
        let cancel = self.pump_cancel.clone();
        let key = self.key.clone();
        self.pump_handle = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                let (len, _from) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = local.recv_from(&mut buf) => match res {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(peer = %key, error = %e, "egress read failed");
                            break;
                        }
                    },
                };
                let dst = *remote.read().await;
                match outer.send_to(&buf[..len], dst).await {
                    Ok(n) => {
                        counters.add_sent(n as u64);
                        trace!(peer = %key, %dst, len, "egress forwarded");
                    }
                    Err(e) => warn!(peer = %key, %dst, error = %e, "egress send failed"),
                }
            }
        }));
    }
}

async fn bind_with_backoff(
    peer: &str,
    prev: Option<SocketAddr>,
) -> Result<UdpSocket, ProxyError> {
    // A previous address is reused so the WG endpoint stays valid across
    // resets; a fresh forwarder takes any free loopback port.
    let addr = prev.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0));
    let mut backoff = Duration::from_millis(500);
    for attempt in 1..=MAX_BIND_ATTEMPTS {
        match UdpSocket::bind(addr).await {
            Ok(sock) => return Ok(sock),
            Err(e) => {
                warn!(peer, %addr, attempt, error = %e, "forwarder bind failed");
                if attempt < MAX_BIND_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BIND_BACKOFF_CAP);
                }
            }
        }
    }
    Err(ProxyError::BindExhausted {
        peer: peer.to_string(),
        attempts: MAX_BIND_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use netclient_types::peer_key_hash;

    async fn outer_socket() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap())
    }

    #[tokio::test]
    async fn start_enters_running_and_binds_loopback() {
        let outer = outer_socket().await;
        let conn = PeerConn::start(
            "cGVlcg==".into(),
            peer_key_hash("cGVlcg=="),
            "srv1".into(),
            "127.0.0.1:9999".parse().unwrap(),
            false,
            None,
            outer,
            51821,
        )
        .await
        .unwrap();
        assert_eq!(conn.state(), ConnState::Running);
        assert!(conn.local_addr().ip().is_loopback());
        assert_ne!(conn.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn reset_preserves_identity_and_counters() {
        let outer = outer_socket().await;
        let mut conn = PeerConn::start(
            "cGVlcg==".into(),
            peer_key_hash("cGVlcg=="),
            "srv1".into(),
            "127.0.0.1:9999".parse().unwrap(),
            false,
            None,
            outer,
            51821,
        )
        .await
        .unwrap();
        conn.counters.add_sent(42);
        let addr_before = conn.local_addr();

        conn.reset().await.unwrap();

        assert_eq!(conn.state(), ConnState::Running);
        assert_eq!(conn.local_addr(), addr_before);
        assert_eq!(conn.counters.snapshot().0, 42);
    }

    #[tokio::test]
    async fn close_is_final() {
        let outer = outer_socket().await;
        let mut conn = PeerConn::start(
            "cGVlcg==".into(),
            peer_key_hash("cGVlcg=="),
            "srv1".into(),
            "127.0.0.1:9999".parse().unwrap(),
            false,
            None,
            outer,
            51821,
        )
        .await
        .unwrap();
        conn.close();
        assert_eq!(conn.state(), ConnState::Stopped);
    }
}
