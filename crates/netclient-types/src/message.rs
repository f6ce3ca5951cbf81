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

use serde::{Deserialize, Serialize};

use crate::host::Host;
use crate::node::Node;
use crate::peer::PeerCfg;

/// Action carried by a node update message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeAction {
    /// Apply field updates only.
    #[default]
    Noop,
    /// Apply field updates.
    Update,
    /// Leave the network and remove the node record.
    Delete,
    /// Rotate the WireGuard private key.
    UpdateKeys,
    /// Apply updates and force an interface reconfigure.
    ForceUpdate,
}

/// Action carried by a host update message, and by host-originated signals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostAction {
    /// No-op.
    #[default]
    Noop,
    /// Join the host to a network: the message carries the new node.
    Join,
    /// Detach the host from this server entirely.
    Delete,
    /// Merge controller-provided host fields.
    Update,
    /// Rotate the WireGuard keypair.
    UpdateKeys,
    /// Force a full re-apply.
    ForceUpdate,
    /// Host → server: connection acknowledgement.
    Ack,
    /// Host → server: request registration with the TURN server.
    RegisterWithTurn,
    /// Host → server: interface update finished, peers may be re-pushed.
    SignalDone,
    /// Host → server: periodic check-in.
    CheckIn,
}

/// Decrypted body of a `node/update/<network>/<node>` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeUpdateMsg {
    /// Action to take.
    #[serde(default)]
    pub action: NodeAction,
    /// New node state.
    pub node: Node,
}

/// Decrypted body of a `host/update/<host>/<server>` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostUpdateMsg {
    /// Action to take.
    #[serde(default)]
    pub action: HostAction,
    /// Host fields, present for `update`.
    #[serde(default)]
    pub host: Option<Host>,
    /// Node record, present for `join`.
    #[serde(default)]
    pub node: Option<Node>,
}

/// How the proxy engine should treat a forwarded peer list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyAction {
    /// Diff the list against running forwarders: add, update, remove.
    #[default]
    Update,
    /// Tear down every forwarder.
    DeleteAll,
    /// Proxying disabled: tear down forwarders, leave peers direct.
    NoProxy,
}

/// Per-peer metadata the proxy engine needs beyond the device config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyPeerMeta {
    /// The peer must be reached through a relay.
    #[serde(default)]
    pub is_relayed: bool,
    /// Relay endpoint when relayed.
    #[serde(default)]
    pub relay_to: Option<std::net::SocketAddr>,
}

/// Peer list forwarded from the reconciler to the proxy engine, tagged with
/// the contributing server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyPayload {
    /// What to do with the list.
    #[serde(default)]
    pub action: ProxyAction,
    /// Contributing server name.
    #[serde(default)]
    pub server: String,
    /// The peers, in device form.
    #[serde(default)]
    pub peers: Vec<PeerCfg>,
    /// Extra per-peer metadata keyed by public key.
    #[serde(default)]
    pub peer_meta: HashMap<String, ProxyPeerMeta>,
}

/// Decrypted body of a `peers/host/<host>/<server>` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostPeerUpdateMsg {
    /// Server software version.
    #[serde(default)]
    pub server_version: String,
    /// Replacement peer set contributed by this server.
    #[serde(default)]
    pub peers: Vec<PeerCfg>,
    /// Proxy instructions for the same peer set.
    #[serde(default)]
    pub proxy: ProxyPayload,
    /// DNS entries per network: network → (name → address).
    #[serde(default)]
    pub dns: HashMap<String, HashMap<String, String>>,
}
