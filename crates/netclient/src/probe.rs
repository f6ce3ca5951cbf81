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

//! Endpoint prober.
//!
//! Agents ping each other over TCP on the proxy listen port and elect the
//! lowest-latency candidate address per peer. One message per connection:
//! the sender's 20-byte key hash, a `||` delimiter, and the send time as
//! ASCII epoch milliseconds. The receiver answers `SUCCESS` when the
//! measured latency beats the cached best (and repoints the WG peer at the
//! discovered address), `WRONG` otherwise.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use netclient_types::{peer_key_hash, PeerCfg, KEY_HASH_LEN, PROXY_PORT};

use crate::state::AgentState;
use crate::wgdev::Device;

/// Fixed delimiter between hash and timestamp.
pub const DELIMITER: &[u8; 2] = b"||";

/// Reply for an accepted (better) endpoint.
pub const SUCCESS: &[u8] = b"SUCCESS";

/// Reply for a rejected probe.
pub const WRONG: &[u8] = b"WRONG";

/// Compensation for clock skew between agents.
pub const VARIANCE_BIAS: Duration = Duration::from_millis(5);

/// Interval between probe rounds; jittered per round.
const PROBE_INTERVAL: Duration = Duration::from_secs(60);
const PROBE_JITTER_SECS: u64 = 10;
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Best known endpoint for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BestEndpoint {
    pub endpoint: IpAddr,
    pub latency: Duration,
}

/// Non-persistent map from peer key hash to its best measured endpoint.
#[derive(Debug, Default)]
pub struct EndpointCache {
    entries: RwLock<HashMap<[u8; KEY_HASH_LEN], BestEndpoint>>,
}

impl EndpointCache {
    pub fn get_best(&self, hash: &[u8; KEY_HASH_LEN]) -> Option<BestEndpoint> {
        self.entries
            .read()
            .expect("endpoint cache poisoned")
            .get(hash)
            .copied()
    }

    /// Store `candidate` only when it strictly beats the current best.
    /// Returns whether it was stored.
    pub fn record_if_better(
        &self,
        hash: [u8; KEY_HASH_LEN],
        candidate: BestEndpoint,
    ) -> bool {
        let mut entries = self.entries.write().expect("endpoint cache poisoned");
        match entries.get(&hash) {
            Some(best) if best.latency <= candidate.latency => false,
            _ => {
                entries.insert(hash, candidate);
                true
            }
        }
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .expect("endpoint cache poisoned")
            .clear();
    }
}

/// Encode a ping for our key hash at `sent_ms`.
pub fn encode_ping(hash: &[u8; KEY_HASH_LEN], sent_ms: u64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(KEY_HASH_LEN + 2 + 13);
    msg.extend_from_slice(hash);
    msg.extend_from_slice(DELIMITER);
    msg.extend_from_slice(sent_ms.to_string().as_bytes());
    msg
}

/// Decode a ping into `(sender hash, sent_ms)`.
pub fn parse_ping(msg: &[u8]) -> Option<([u8; KEY_HASH_LEN], u64)> {
    if msg.len() < KEY_HASH_LEN + DELIMITER.len() + 1 {
        return None;
    }
    let (hash, rest) = msg.split_at(KEY_HASH_LEN);
    let (delim, stamp) = rest.split_at(DELIMITER.len());
    if delim != DELIMITER {
        return None;
    }
    let sent_ms: u64 = std::str::from_utf8(stamp).ok()?.trim().parse().ok()?;
    Some((hash.try_into().ok()?, sent_ms))
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Listen for pings on the proxy listen port; one task per connection.
pub async fn run_listener<D: Device + 'static>(
    state: AgentState,
    device: Arc<D>,
    cache: Arc<EndpointCache>,
    port: u16,
    cancel: CancellationToken,
) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(l) => l,
        Err(e) => {
            warn!(port, error = %e, "failed to start endpoint detection");
            return;
        }
    };
    info!(port, "endpoint detection listening");

    loop {
        let (stream, remote) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(a) => a,
                Err(e) => {
                    warn!(error = %e, "failed to accept probe connection");
                    continue;
                }
            },
        };
        let state = state.clone();
        let device = device.clone();
        let cache = cache.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_ping(state, device.as_ref(), &cache, stream, remote).await {
                debug!(%remote, error = %e, "probe connection failed");
            }
        });
    }
    debug!("endpoint detection stopped");
}

async fn handle_ping<D: Device>(
    state: AgentState,
    device: &D,
    cache: &EndpointCache,
    mut stream: TcpStream,
    remote: SocketAddr,
) -> std::io::Result<()> {
    let mut buf = [0u8; 1024];
    let len = stream.read(&mut buf).await?;
    let received_ms = now_ms();

    let Some((sender_hash, sent_ms)) = parse_ping(&buf[..len]) else {
        stream.write_all(WRONG).await?;
        return Ok(());
    };

    let own_hash = peer_key_hash(&state.host().public_key);
    if sender_hash == own_hash {
        stream.write_all(WRONG).await?;
        return Ok(());
    }

    let latency =
        Duration::from_millis(received_ms.saturating_sub(sent_ms)) + VARIANCE_BIAS;
    let candidate = BestEndpoint {
        endpoint: remote.ip(),
        latency,
    };

    if !cache.record_if_better(sender_hash, candidate) {
        stream.write_all(WRONG).await?;
        return Ok(());
    }

    // Answer first, then repoint the WG peer locally.
    stream.write_all(SUCCESS).await?;
    if let Err(e) = apply_best_endpoint(&state, device, sender_hash, candidate).await {
        warn!(%remote, error = %e, "failed to apply discovered endpoint");
    }
    Ok(())
}

/// Repoint the WG peer matching `hash` at the discovered address, keeping
/// the peer's original port.
async fn apply_best_endpoint<D: Device>(
    state: &AgentState,
    device: &D,
    hash: [u8; KEY_HASH_LEN],
    best: BestEndpoint,
) -> Result<(), crate::wgdev::DeviceError> {
    let peers = state.host().host_peers;
    for peer in peers {
        if peer_key_hash(&peer.public_key) != hash {
            continue;
        }
        let Some(endpoint) = peer.endpoint else {
            continue;
        };
        let new_endpoint = SocketAddr::new(best.endpoint, endpoint.port());
        let updated = PeerCfg {
            endpoint: Some(new_endpoint),
            ..peer
        };
        info!(
            peer = %updated.public_key,
            endpoint = %new_endpoint,
            latency_ms = best.latency.as_millis() as u64,
            "elected new peer endpoint"
        );
        return device.update_peer(&updated).await;
    }
    Ok(())
}

/// Probe every peer's candidate addresses periodically, immediately on
/// startup, and again whenever `peer_set_changed` fires.
pub async fn run_prober(
    state: AgentState,
    cache: Arc<EndpointCache>,
    peer_set_changed: Arc<tokio::sync::Notify>,
    cancel: CancellationToken,
) {
    loop {
        probe_round(&state, &cache).await;

        let jitter = rand::thread_rng().gen_range(0..=PROBE_JITTER_SECS * 2);
        let wait =
            PROBE_INTERVAL + Duration::from_secs(jitter) - Duration::from_secs(PROBE_JITTER_SECS);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
            _ = peer_set_changed.notified() => {
                debug!("peer set changed, probing now");
            }
        }
    }
    debug!("prober stopped");
}

/// One probe pass over all known peers.
pub async fn probe_round(state: &AgentState, cache: &EndpointCache) {
    let host = state.host();
    let own_hash = peer_key_hash(&host.public_key);

    for peer in &host.host_peers {
        if peer.remove {
            continue;
        }
        let hash = peer_key_hash(&peer.public_key);
        let mut candidates: Vec<IpAddr> = Vec::new();
        if let Some(endpoint) = peer.endpoint {
            candidates.push(endpoint.ip());
        }
        if let Some(best) = cache.get_best(&hash) {
            if !candidates.contains(&best.endpoint) {
                candidates.push(best.endpoint);
            }
        }
        let port = if peer.public_listen_port != 0 {
            peer.public_listen_port
        } else {
            PROXY_PORT
        };

        for ip in candidates {
            match ping(SocketAddr::new(ip, port), &own_hash).await {
                Ok(accepted) => {
                    debug!(peer = %peer.public_key, %ip, accepted, "probe answered");
                }
                Err(e) => {
                    debug!(peer = %peer.public_key, %ip, error = %e, "probe failed");
                }
            }
        }
    }
}

/// Send one ping; returns whether the receiver elected us as its better
/// endpoint.
pub async fn ping(addr: SocketAddr, own_hash: &[u8; KEY_HASH_LEN]) -> std::io::Result<bool> {
    let stream = tokio::time::timeout(PROBE_CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timeout"))??;
    let mut stream = stream;
    stream.write_all(&encode_ping(own_hash, now_ms())).await?;

    let mut buf = [0u8; 16];
    let len = tokio::time::timeout(PROBE_CONNECT_TIMEOUT, stream.read(&mut buf))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timeout"))??;
    Ok(&buf[..len] == SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn ping_round_trips() {
        let hash = peer_key_hash("cGVlcg==");
        let msg = encode_ping(&hash, 1_700_000_000_123);
        let (parsed_hash, ms) = parse_ping(&msg).unwrap();
        assert_eq!(parsed_hash, hash);
        assert_eq!(ms, 1_700_000_000_123);
    }

    #[test_case(b"short".as_slice(); "too short")]
    #[test_case(&[0u8; 22]; "missing delimiter")]
    #[test_case(b"01234567890123456789||not-a-number".as_slice(); "bad timestamp")]
    fn malformed_pings_rejected(msg: &[u8]) {
        assert!(parse_ping(msg).is_none());
    }

    #[test]
    fn cache_replaces_only_on_lower_latency() {
        let cache = EndpointCache::default();
        let hash = peer_key_hash("cGVlcg==");
        let slow = BestEndpoint {
            endpoint: "1.2.3.4".parse().unwrap(),
            latency: Duration::from_millis(120),
        };
        let fast = BestEndpoint {
            endpoint: "5.6.7.8".parse().unwrap(),
            latency: Duration::from_millis(45),
        };

        assert!(cache.record_if_better(hash, slow));
        assert_eq!(cache.get_best(&hash), Some(slow));

        // Faster candidate wins.
        assert!(cache.record_if_better(hash, fast));
        assert_eq!(cache.get_best(&hash), Some(fast));

        // Slower (and equal) candidates do not.
        assert!(!cache.record_if_better(hash, slow));
        assert!(!cache.record_if_better(hash, fast));
        assert_eq!(cache.get_best(&hash), Some(fast));
    }
}
