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

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::NodeAction;

/// Membership of this host in one mesh network, persisted in `nodes.yml`.
///
/// A node is owned by exactly one server and its network name is immutable;
/// changing network means delete and re-join.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node UUID assigned by the controller.
    pub id: Uuid,
    /// Network name, normalized.
    pub network: String,
    /// Owning server name.
    pub server: String,
    /// Assigned IPv4 address, CIDR.
    #[serde(default)]
    pub address: Option<String>,
    /// Assigned IPv6 address, CIDR.
    #[serde(default)]
    pub address6: Option<String>,
    /// Whether controller-managed DNS entries apply on this node.
    #[serde(default)]
    pub dns_on: bool,
    /// Persistent keepalive for this network's peers, seconds.
    #[serde(default)]
    pub persistent_keepalive_secs: u16,
    /// Ranges this node egresses for, CIDR.
    #[serde(default)]
    pub egress_gateway_ranges: Vec<String>,
    /// Whether this node is an egress gateway.
    #[serde(default)]
    pub is_egress_gateway: bool,
    /// Internet gateway peer address (CIDR), when one is detected.
    #[serde(default)]
    pub internet_gateway: Option<String>,
    /// Whether the node participates in the mesh right now.
    #[serde(default = "default_connected")]
    pub connected: bool,
    /// Pending controller action; reset to noop after application.
    #[serde(default)]
    pub action: NodeAction,
}

fn default_connected() -> bool {
    true
}

impl Node {
    /// Whether `update` changes any interface-visible field: addresses
    /// force a reconfigure, keepalive and DNS do not.
    pub fn iface_delta(&self, update: &Node) -> bool {
        self.address != update.address || self.address6 != update.address6
    }

    /// True when this node makes the host an internet gateway (egresses a
    /// default route).
    pub fn egresses_default_route(&self) -> bool {
        self.is_egress_gateway
            && self
                .egress_gateway_ranges
                .iter()
                .any(|r| r == "0.0.0.0/0" || r == "::/0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iface_delta_tracks_addresses_only() {
        let a = Node {
            network: "net1".into(),
            address: Some("10.0.0.2/24".into()),
            ..Node::default()
        };
        let mut b = a.clone();
        b.dns_on = true;
        b.persistent_keepalive_secs = 25;
        assert!(!a.iface_delta(&b));
        b.address = Some("10.0.0.3/24".into());
        assert!(a.iface_delta(&b));
    }

    #[test]
    fn egress_default_route() {
        let mut node = Node::default();
        assert!(!node.egresses_default_route());
        node.is_egress_gateway = true;
        node.egress_gateway_ranges = vec!["192.168.0.0/16".into()];
        assert!(!node.egresses_default_route());
        node.egress_gateway_ranges.push("0.0.0.0/0".into());
        assert!(node.egresses_default_route());
    }
}
