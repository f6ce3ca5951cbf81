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

//! Userspace UDP proxy engine.
//!
//! Presents every remote peer to the local WireGuard device as a stable
//! loopback endpoint. Outbound WG packets arriving on a peer's loopback
//! socket are rewritten toward the peer's true endpoint (or its TURN relay)
//! through one shared outer socket; inbound datagrams on the outer socket are
//! demultiplexed by source address back to the device's listen port.

pub mod conn;
pub mod engine;
pub mod manager;
pub mod turn;

pub use conn::{ConnState, ProxyOp};
pub use engine::{PeerEndpointAssignment, ProxyEngine};
pub use manager::run_manager;
pub use turn::{TurnCfg, TurnRegistry};

use thiserror::Error;

/// Errors produced by the proxy engine.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer {0} is not proxied")]
    UnknownPeer(String),

    #[error("peer {0} has no endpoint to forward to")]
    NoEndpoint(String),

    #[error("relay endpoint missing for relayed peer {0}")]
    MissingRelay(String),

    #[error("failed to bind forwarder for {peer} after {attempts} attempts")]
    BindExhausted { peer: String, attempts: u32 },
}
