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

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::peer::PeerCfg;
use crate::{DEFAULT_INTERFACE, DEFAULT_LISTEN_PORT, DEFAULT_MTU, PROXY_PORT};

/// Firewall implementation detected on the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallKind {
    /// No supported firewall found.
    #[default]
    None,
    /// iptables is present.
    Iptables,
    /// nftables is present.
    Nftables,
}

/// Process-wide host identity and interface settings, persisted as
/// `netclient.yml`.
///
/// Identity fields (`id`, `host_pass`, keys, `mac_address`) are generated
/// exactly once on first start and are never overwritten by controller
/// messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Host {
    /// Stable host UUID, also used as the MQ client id.
    pub id: Uuid,
    /// Normalized host name (`[a-z0-9-]`, at most 62 chars).
    pub name: String,
    /// MAC address of the primary physical interface.
    pub mac_address: String,
    /// Operating system tag (`linux`, `macos`, `windows`, ...).
    pub os: String,
    /// Agent version string.
    pub version: String,
    /// Long-lived random password created on first run.
    pub host_pass: String,
    /// WireGuard private key, base64.
    pub private_key: String,
    /// WireGuard public key derived from `private_key`, base64.
    pub public_key: String,
    /// Traffic key private half, used to decrypt controller payloads.
    #[serde(default)]
    pub traffic_key_private: Vec<u8>,
    /// Traffic key public half, shared with controllers.
    #[serde(default)]
    pub traffic_key_public: Vec<u8>,
    /// WireGuard listen port.
    pub listen_port: u16,
    /// Port the userspace proxy and endpoint prober listen on.
    pub proxy_listen_port: u16,
    /// Interface MTU.
    pub mtu: u16,
    /// Mesh interface name.
    pub interface: String,
    /// Firewall in use on this host.
    #[serde(default)]
    pub firewall_in_use: FirewallKind,
    /// Whether the userspace proxy may be used for this host's peers.
    #[serde(default)]
    pub proxy_enabled: bool,
    /// Whether the init-system daemon has been installed.
    #[serde(default)]
    pub daemon_installed: bool,
    /// Last known full peer set across all servers.
    #[serde(default)]
    pub host_peers: Vec<PeerCfg>,
    /// Name of the physical interface carrying the default route.
    #[serde(default)]
    pub default_interface: String,
    /// Public endpoint IP, when statically known.
    #[serde(default)]
    pub endpoint_ip: Option<IpAddr>,
    /// Disable the local GUI server.
    #[serde(default)]
    pub disable_gui_server: bool,
    /// Log verbosity level.
    #[serde(default)]
    pub verbosity: u32,
    /// Debug mode.
    #[serde(default)]
    pub debug: bool,
}

impl Host {
    /// A host record with port/MTU/interface defaults filled in and all
    /// identity fields still blank.
    pub fn with_defaults() -> Self {
        Host {
            listen_port: DEFAULT_LISTEN_PORT,
            proxy_listen_port: PROXY_PORT,
            mtu: DEFAULT_MTU,
            interface: DEFAULT_INTERFACE.to_string(),
            ..Host::default()
        }
    }

    /// Merge controller-provided fields into this host, preserving local
    /// identity: id, keys, password, MAC, OS, firewall, version, and the
    /// daemon-installed flag survive any controller update.
    ///
    /// Returns `(reset_interface, restart)`: whether the change requires an
    /// interface reconfigure (MTU) or a full daemon restart (ports).
    pub fn merge_update(&mut self, update: &Host) -> (bool, bool) {
        let restart = (update.listen_port != 0 && self.listen_port != update.listen_port)
            || (update.proxy_listen_port != 0
                && self.proxy_listen_port != update.proxy_listen_port);
        let reset_interface = update.mtu != 0 && self.mtu != update.mtu;

        let keep = self.clone();
        *self = update.clone();

        self.id = keep.id;
        self.os = keep.os;
        self.version = keep.version;
        self.mac_address = keep.mac_address;
        self.firewall_in_use = keep.firewall_in_use;
        self.daemon_installed = keep.daemon_installed;
        self.host_pass = keep.host_pass;
        self.public_key = keep.public_key;
        self.private_key = keep.private_key;
        self.traffic_key_private = keep.traffic_key_private;
        self.traffic_key_public = keep.traffic_key_public;
        self.host_peers = keep.host_peers;
        if self.listen_port == 0 {
            self.listen_port = keep.listen_port;
        }
        if self.proxy_listen_port == 0 {
            self.proxy_listen_port = keep.proxy_listen_port;
        }
        if self.mtu == 0 {
            self.mtu = keep.mtu;
        }

        (reset_interface, restart)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_host() -> Host {
        let mut host = Host::with_defaults();
        host.id = Uuid::new_v4();
        host.name = "alpha".into();
        host.host_pass = "secret".into();
        host.private_key = "priv".into();
        host.public_key = "pub".into();
        host.traffic_key_private = vec![1; 32];
        host.traffic_key_public = vec![2; 32];
        host.mac_address = "aa:bb:cc:dd:ee:ff".into();
        host.os = "linux".into();
        host
    }

    #[test]
    fn merge_preserves_identity() {
        let mut host = identity_host();
        let original = host.clone();

        let mut update = Host::with_defaults();
        update.id = Uuid::new_v4();
        update.name = "renamed".into();
        update.host_pass = "attacker".into();
        update.private_key = "evil".into();
        update.mtu = original.mtu;
        update.listen_port = original.listen_port;
        update.proxy_listen_port = original.proxy_listen_port;

        let (reset, restart) = host.merge_update(&update);
        assert!(!reset);
        assert!(!restart);
        assert_eq!(host.id, original.id);
        assert_eq!(host.host_pass, original.host_pass);
        assert_eq!(host.private_key, original.private_key);
        assert_eq!(host.public_key, original.public_key);
        assert_eq!(host.mac_address, original.mac_address);
        assert_eq!(host.name, "renamed", "non-identity fields do update");
    }

    #[test]
    fn merge_flags_restart_on_port_change() {
        let mut host = identity_host();
        let mut update = host.clone();
        update.listen_port = host.listen_port + 1;
        let (_, restart) = host.merge_update(&update);
        assert!(restart);
    }

    #[test]
    fn merge_flags_reset_on_mtu_change() {
        let mut host = identity_host();
        let mut update = host.clone();
        update.mtu = 1280;
        let (reset, restart) = host.merge_update(&update);
        assert!(reset);
        assert!(!restart);
    }
}
