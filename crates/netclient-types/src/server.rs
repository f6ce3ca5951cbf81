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

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A controller this host is attached to, persisted in `servers.yml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Server {
    /// Server name, unique per host.
    pub name: String,
    /// Message broker URL.
    pub broker: String,
    /// Broker username.
    pub mq_username: String,
    /// Broker password.
    pub mq_password: String,
    /// Broker client id; must match the host id.
    pub mq_id: Uuid,
    /// Server's traffic public key, used to seal payloads to this host.
    #[serde(default)]
    pub traffic_key_public: Vec<u8>,
    /// STUN servers offered by this controller, `host:port`.
    #[serde(default)]
    pub stun_list: Vec<String>,
    /// TURN servers offered by this controller, `host:port`.
    #[serde(default)]
    pub turn_list: Vec<String>,
    /// Whether peers of this server should register with TURN.
    #[serde(default)]
    pub use_turn: bool,
    /// Networks on this server the host has joined.
    #[serde(default)]
    pub nodes: BTreeMap<String, bool>,
    /// Server software version.
    #[serde(default)]
    pub version: String,
}
