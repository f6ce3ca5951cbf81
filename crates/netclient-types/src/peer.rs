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

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Length of a peer key hash tag.
pub const KEY_HASH_LEN: usize = 20;

/// A peer as handed to the WireGuard device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerCfg {
    /// Remote WireGuard public key, base64.
    pub public_key: String,
    /// Remote endpoint. For proxied peers this is the local loopback socket
    /// owned by the proxy engine; otherwise the peer's true public address.
    pub endpoint: Option<SocketAddr>,
    /// Allowed IP ranges, CIDR notation.
    pub allowed_ips: Vec<String>,
    /// Persistent keepalive in seconds.
    pub persistent_keepalive: Option<u16>,
    /// Remove this peer from the device instead of adding it.
    #[serde(default)]
    pub remove: bool,
    /// Reach this peer through a relay instead of directly.
    #[serde(default)]
    pub is_relayed: bool,
    /// Relay endpoint, set when `is_relayed`.
    #[serde(default)]
    pub relay_to: Option<SocketAddr>,
    /// The peer is a leaf client not running the agent.
    #[serde(default)]
    pub is_ext_client: bool,
    /// The peer is an ext client attached to this host.
    #[serde(default)]
    pub is_attached_ext_client: bool,
    /// The port the peer's own proxy listens on publicly; 0 means the
    /// well-known proxy port.
    #[serde(default)]
    pub public_listen_port: u16,
}

/// SHA-1 of the base64 public key text, used as a compact opaque tag in
/// prober messages and relay lookup tables.
pub fn peer_key_hash(public_key: &str) -> [u8; KEY_HASH_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(public_key.as_bytes());
    hasher.finalize().into()
}

/// Result of scanning a peer list for internet gateway peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayDetection {
    /// Allowed-IP preceding the first IPv4 default route, when detected.
    pub gw4: Option<String>,
    /// Allowed-IP preceding the first IPv6 default route, when detected.
    pub gw6: Option<String>,
}

impl GatewayDetection {
    /// Whether any gateway peer was found.
    pub fn detected(&self) -> bool {
        self.gw4.is_some() || self.gw6.is_some()
    }
}

/// Scan `peers` for an internet gateway: a non-removed peer whose allowed-IPs
/// contain a default route. The gateway address is the allowed-IP entry
/// preceding the default route; a default route in first position carries no
/// gateway address and is ignored. Hosts that are themselves internet
/// gateways never detect one.
pub fn detect_gateways(peers: &[PeerCfg], host_is_inet_gateway: bool) -> GatewayDetection {
    let mut found = GatewayDetection::default();
    if host_is_inet_gateway {
        return found;
    }
    for peer in peers {
        if peer.remove {
            continue;
        }
        for (i, ip) in peer.allowed_ips.iter().enumerate() {
            if ip == "0.0.0.0/0" && found.gw4.is_none() && i > 0 {
                found.gw4 = Some(peer.allowed_ips[i - 1].clone());
            } else if ip == "::/0" && found.gw6.is_none() && i > 0 {
                found.gw6 = Some(peer.allowed_ips[i - 1].clone());
            }
        }
    }
    found
}
