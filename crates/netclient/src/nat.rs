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

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::stun;

/// Total budget for NAT introspection across all STUN servers.
const TOTAL_BUDGET: Duration = Duration::from_secs(10);

/// NAT behavior observed for the local host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NatType {
    /// Introspection failed; direct connectivity is best-effort only.
    #[default]
    Unknown,
    /// No translation: mapped address equals the local address.
    Open,
    /// Endpoint-independent mapping.
    FullCone,
    /// Address-restricted mapping.
    Restricted,
    /// Address-and-port-restricted mapping.
    PortRestricted,
    /// Mapping changes per destination; direct peering is unlikely.
    Symmetric,
}

/// Result of wrapping STUN BINDING against the server's STUN list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatInfo {
    pub public_ip: Option<IpAddr>,
    pub public_port: u16,
    pub priv_ip: IpAddr,
    pub priv_port: u16,
    pub nat_type: NatType,
}

impl NatInfo {
    fn unknown(priv_ip: IpAddr, priv_port: u16) -> Self {
        NatInfo {
            public_ip: None,
            public_port: 0,
            priv_ip,
            priv_port,
            nat_type: NatType::Unknown,
        }
    }
}

/// Classify from up to two mapped addresses observed from the same local
/// port: same mapping across servers means an endpoint-independent NAT;
/// differing mappings mean symmetric.
pub fn classify(
    local: SocketAddr,
    first: SocketAddr,
    second: Option<SocketAddr>,
) -> NatType {
    if first.ip() == local.ip() && first.port() == local.port() {
        return NatType::Open;
    }
    match second {
        Some(second) if second != first => NatType::Symmetric,
        Some(_) => NatType::FullCone,
        // One answer is enough for the mapping but not for classification.
        None => NatType::Restricted,
    }
}

/// Learn the public mapping and NAT type for `priv_port`, querying the
/// server-provided STUN list. Runs at startup and on reset. Never fails the
/// agent: with no usable answer within the 10 s budget the NAT type is
/// `Unknown`.
pub async fn introspect(stun_servers: &[String], priv_ip: IpAddr, priv_port: u16) -> NatInfo {
    match timeout(TOTAL_BUDGET, introspect_inner(stun_servers, priv_ip, priv_port)).await {
        Ok(info) => info,
        Err(_) => {
            warn!("NAT introspection exceeded its budget, treating NAT as unknown");
            NatInfo::unknown(priv_ip, priv_port)
        }
    }
}

async fn introspect_inner(stun_servers: &[String], priv_ip: IpAddr, priv_port: u16) -> NatInfo {
    let servers = stun::resolve_servers(stun_servers).await;
    if servers.is_empty() {
        warn!("no STUN servers resolved, treating NAT as unknown");
        return NatInfo::unknown(priv_ip, priv_port);
    }

    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), priv_port);
    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, port = priv_port, "failed to bind STUN probe socket");
            return NatInfo::unknown(priv_ip, priv_port);
        }
    };

    let mut mappings: Vec<SocketAddr> = Vec::new();
    for server in &servers {
        if mappings.len() >= 2 {
            break;
        }
        match stun::query(&socket, *server).await {
            Ok(mapped) => mappings.push(mapped),
            Err(e) => warn!(server = %server, error = %e, "STUN query failed"),
        }
    }

    let Some(first) = mappings.first().copied() else {
        warn!("no STUN server answered, treating NAT as unknown");
        return NatInfo::unknown(priv_ip, priv_port);
    };
    let local = SocketAddr::new(priv_ip, priv_port);
    let nat_type = classify(local, first, mappings.get(1).copied());

    info!(
        public = %first,
        nat = ?nat_type,
        "NAT introspection complete"
    );
    NatInfo {
        public_ip: Some(first.ip()),
        public_port: first.port(),
        priv_ip,
        priv_port,
        nat_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const LOCAL: &str = "192.168.1.10:51722";

    #[test_case(LOCAL, None, NatType::Open; "mapping equals local")]
    #[test_case("203.0.113.5:51722", Some("203.0.113.5:51722"), NatType::FullCone; "stable mapping")]
    #[test_case("203.0.113.5:40001", Some("203.0.113.5:40002"), NatType::Symmetric; "per destination mapping")]
    #[test_case("203.0.113.5:40001", None, NatType::Restricted; "single answer")]
    fn classification(first: &str, second: Option<&str>, expected: NatType) {
        let local: SocketAddr = LOCAL.parse().unwrap();
        let first: SocketAddr = first.parse().unwrap();
        let second = second.map(|s| s.parse().unwrap());
        assert_eq!(classify(local, first, second), expected);
    }

    #[tokio::test]
    async fn empty_stun_list_is_unknown() {
        let info = introspect(&[], "192.168.1.10".parse().unwrap(), 0).await;
        assert_eq!(info.nat_type, NatType::Unknown);
        assert_eq!(info.public_ip, None);
    }
}
