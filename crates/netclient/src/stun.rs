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

//! Minimal STUN BINDING client: enough of RFC 5389 to learn our mapped
//! address from a server's response.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;

use rand::RngCore;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};

const STUN_MAGIC_COOKIE: u32 = 0x2112A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const ADDR_FAMILY_IPV4: u8 = 0x01;
const ADDR_FAMILY_IPV6: u8 = 0x02;

const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum StunError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout waiting for STUN response")]
    Timeout,

    #[error("invalid STUN response")]
    InvalidResponse,

    #[error("no STUN servers answered")]
    NoServers,
}

/// Build a BINDING request with the given transaction id.
pub fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut request = Vec::with_capacity(20);
    request.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    request.extend_from_slice(&0u16.to_be_bytes());
    request.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    request.extend_from_slice(transaction_id);
    request
}

/// Parse a BINDING response, returning the mapped address. Prefers
/// XOR-MAPPED-ADDRESS, accepts plain MAPPED-ADDRESS.
pub fn parse_binding_response(
    data: &[u8],
    expected_transaction_id: &[u8; 12],
) -> Result<SocketAddr, StunError> {
    if data.len() < 20 {
        return Err(StunError::InvalidResponse);
    }

    let message_type = u16::from_be_bytes([data[0], data[1]]);
    if message_type != BINDING_RESPONSE {
        return Err(StunError::InvalidResponse);
    }

    let message_length = u16::from_be_bytes([data[2], data[3]]) as usize;
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if magic != STUN_MAGIC_COOKIE {
        return Err(StunError::InvalidResponse);
    }
    if &data[8..20] != expected_transaction_id {
        return Err(StunError::InvalidResponse);
    }
    if data.len() < 20 + message_length {
        return Err(StunError::InvalidResponse);
    }

    let mut offset = 20;
    let end = 20 + message_length;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_length = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;
        if offset + attr_length > end {
            return Err(StunError::InvalidResponse);
        }
        if attr_type == ATTR_XOR_MAPPED_ADDRESS || attr_type == ATTR_MAPPED_ADDRESS {
            let xor = attr_type == ATTR_XOR_MAPPED_ADDRESS;
            if let Some(addr) = parse_mapped_address(&data[offset..offset + attr_length], xor) {
                return Ok(addr);
            }
        }
        // Attributes are 4-byte aligned.
        offset += (attr_length + 3) & !3;
    }

    Err(StunError::InvalidResponse)
}

fn parse_mapped_address(data: &[u8], xor: bool) -> Option<SocketAddr> {
    if data.len() < 4 {
        return None;
    }
    let family = data[1];
    let port = u16::from_be_bytes([data[2], data[3]]);
    let port = if xor {
        port ^ ((STUN_MAGIC_COOKIE >> 16) as u16)
    } else {
        port
    };
    let magic = STUN_MAGIC_COOKIE.to_be_bytes();

    match family {
        ADDR_FAMILY_IPV4 if data.len() >= 8 => {
            let mut ip: [u8; 4] = data[4..8].try_into().ok()?;
            if xor {
                for (b, m) in ip.iter_mut().zip(magic) {
                    *b ^= m;
                }
            }
            Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port)))
        }
        ADDR_FAMILY_IPV6 if data.len() >= 20 => {
            let mut ip: [u8; 16] = data[4..20].try_into().ok()?;
            if xor {
                for (b, m) in ip.iter_mut().take(4).zip(magic) {
                    *b ^= m;
                }
            }
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(ip),
                port,
                0,
                0,
            )))
        }
        _ => None,
    }
}

/// Send one BINDING request from `socket` to `server` and wait for the
/// mapped address.
pub async fn query(socket: &UdpSocket, server: SocketAddr) -> Result<SocketAddr, StunError> {
    let mut transaction_id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut transaction_id);
    let request = build_binding_request(&transaction_id);

    socket.send_to(&request, server).await?;

    let mut buf = [0u8; 1024];
    loop {
        let (len, from) = match timeout(QUERY_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(StunError::Timeout),
        };
        if from != server {
            warn!(%from, expected = %server, "STUN response from unexpected source");
            continue;
        }
        let addr = parse_binding_response(&buf[..len], &transaction_id)?;
        debug!(%server, mapped = %addr, "STUN binding succeeded");
        return Ok(addr);
    }
}

/// Resolve `host:port` STUN server names to socket addresses, skipping any
/// that fail to resolve.
pub async fn resolve_servers(servers: &[String]) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();
    for server in servers {
        match tokio::net::lookup_host(server.as_str()).await {
            Ok(mut resolved) => {
                if let Some(addr) = resolved.next() {
                    addrs.push(addr);
                }
            }
            Err(e) => warn!(server = %server, error = %e, "failed to resolve STUN server"),
        }
    }
    addrs
}
