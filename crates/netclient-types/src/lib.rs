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

//! netclient-types: Shared data model for the netclient mesh agent.
//!
//! This crate contains the host/server/node records persisted on disk, the
//! peer configuration handed to the WireGuard device, and the controller
//! message envelopes delivered over the message bus. Pure data, no I/O.

pub mod host;
pub mod message;
pub mod node;
pub mod peer;
pub mod server;

pub use host::{FirewallKind, Host};
pub use message::{
    HostAction, HostPeerUpdateMsg, HostUpdateMsg, NodeAction, NodeUpdateMsg, ProxyAction,
    ProxyPayload, ProxyPeerMeta,
};
pub use node::Node;
pub use peer::{detect_gateways, peer_key_hash, GatewayDetection, PeerCfg, KEY_HASH_LEN};
pub use server::Server;

/// Maximum length of a host or node name.
pub const MAX_NAME_LENGTH: usize = 62;

/// Default WireGuard listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 51821;

/// Well-known port for the userspace proxy and the endpoint prober.
pub const PROXY_PORT: u16 = 51722;

/// Default MTU for the mesh interface.
pub const DEFAULT_MTU: u16 = 1420;

/// Persistent keepalive applied to peers that carry none, seconds.
pub const DEFAULT_KEEPALIVE_SECS: u16 = 20;

/// Default mesh interface name.
pub const DEFAULT_INTERFACE: &str = "netmaker";

/// Normalize a name into the `[a-z0-9-]` charset, at most
/// [`MAX_NAME_LENGTH`] characters. Idempotent: formatting an already
/// formatted name returns it unchanged.
pub fn format_name(name: &str) -> String {
    name.chars()
        .take(MAX_NAME_LENGTH)
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("Host_01.Example", "host-01-example"; "mixed punctuation")]
    #[test_case("already-fine-9", "already-fine-9"; "no change needed")]
    #[test_case("UPPER", "upper"; "lowercased")]
    #[test_case("", ""; "empty stays empty")]
    fn format_name_examples(input: &str, expected: &str) {
        assert_eq!(format_name(input), expected);
    }

    #[test]
    fn format_name_idempotent_and_bounded() {
        let long: String = "X.".repeat(100);
        let once = format_name(&long);
        assert!(once.len() <= MAX_NAME_LENGTH);
        assert!(once.chars().all(|c| c.is_ascii_lowercase()
            || c.is_ascii_digit()
            || c == '-'));
        assert_eq!(format_name(&once), once);
    }
}
