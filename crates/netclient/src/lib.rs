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

//! The netclient agent: keeps one WireGuard interface in sync with the peer
//! sets published by one or more controllers, proxying peers that cannot be
//! reached directly and probing for lower-latency endpoints.

pub mod bus;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod join;
pub mod lockfile;
pub mod nat;
pub mod probe;
pub mod reconcile;
pub mod routes;
pub mod state;
pub mod stun;
pub mod wgdev;
