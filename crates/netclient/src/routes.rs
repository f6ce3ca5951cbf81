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

//! Route manager.
//!
//! Keeps the message broker and peer public endpoints reachable through the
//! physical default interface even when a peer advertises a default route
//! into the tunnel, and detects default-gateway changes between probes.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info, warn};

use netclient_types::{PeerCfg, Server};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("not supported on this platform")]
    Unsupported,

    #[error("routing table error: {0}")]
    Table(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Remembers the last observed default gateway.
#[derive(Debug, Default)]
pub struct GatewayTracker {
    last: Option<IpAddr>,
}

impl GatewayTracker {
    /// Record `current` and report whether it differs from the previous
    /// observation. The first observation is not a change.
    pub fn observe(&mut self, current: Option<IpAddr>) -> bool {
        let changed = match (self.last, current) {
            (Some(prev), Some(now)) => prev != now,
            (None, _) => false,
            (Some(_), None) => true,
        };
        self.last = current.or(self.last);
        changed
    }

    pub fn last(&self) -> Option<IpAddr> {
        self.last
    }
}

/// Extract the host portion of a broker URL such as
/// `wss://broker.example.com:443/mqtt` or `mqtt://10.0.0.1:1883`.
pub fn broker_host(url: &str) -> Option<&str> {
    let rest = match url.split_once("://") {
        Some((_, rest)) => rest,
        None => url,
    };
    let host = rest.split(['/', '?']).next()?;
    let host = host.rsplit_once(':').map_or(host, |(h, port)| {
        if port.chars().all(|c| c.is_ascii_digit()) {
            h
        } else {
            host
        }
    });
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Installs and removes host routes through the physical interface, and
/// watches the default gateway.
pub struct RouteManager {
    tracker: Mutex<GatewayTracker>,
    installed: Mutex<HashSet<IpAddr>>,
}

impl Default for RouteManager {
    fn default() -> Self {
        RouteManager {
            tracker: Mutex::new(GatewayTracker::default()),
            installed: Mutex::new(HashSet::new()),
        }
    }
}

impl RouteManager {
    /// Read the routing table and report whether the default gateway moved
    /// since the last probe.
    pub async fn has_gateway_changed(&self) -> bool {
        let current = match platform::default_gateway().await {
            Ok(gw) => gw.map(|(addr, _)| addr),
            Err(e) => {
                warn!(error = %e, "failed to read default gateway");
                return false;
            }
        };
        self.tracker
            .lock()
            .expect("gateway tracker poisoned")
            .observe(current)
    }

    /// Route the server's broker through the physical default interface.
    pub async fn set_server_routes(&self, server: &Server) -> Result<(), RouteError> {
        let Some(host) = broker_host(&server.broker) else {
            warn!(broker = %server.broker, "cannot parse broker host");
            return Ok(());
        };
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await
            .map(|resolved| resolved.map(|a| a.ip()).collect())
            .unwrap_or_else(|_| match host.parse() {
                Ok(ip) => vec![ip],
                Err(_) => Vec::new(),
            });
        for addr in addrs {
            self.install_host_route(addr).await?;
        }
        Ok(())
    }

    /// Route each peer's public endpoint outside the tunnel.
    pub async fn set_peer_routes(&self, peers: &[PeerCfg]) -> Result<(), RouteError> {
        for peer in peers {
            if peer.remove {
                continue;
            }
            if let Some(endpoint) = peer.endpoint {
                if endpoint.ip().is_loopback() {
                    continue; // proxied peers live on loopback
                }
                self.install_host_route(endpoint.ip()).await?;
            }
        }
        Ok(())
    }

    async fn install_host_route(&self, addr: IpAddr) -> Result<(), RouteError> {
        {
            let installed = self.installed.lock().expect("route set poisoned");
            if installed.contains(&addr) {
                return Ok(());
            }
        }
        match platform::add_host_route(addr).await {
            Ok(()) => {
                debug!(%addr, "installed host route");
                self.installed
                    .lock()
                    .expect("route set poisoned")
                    .insert(addr);
                Ok(())
            }
            Err(RouteError::Unsupported) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove everything we installed.
    pub async fn cleanup(&self) {
        let addrs: Vec<IpAddr> = {
            let mut installed = self.installed.lock().expect("route set poisoned");
            installed.drain().collect()
        };
        for addr in addrs {
            if let Err(e) = platform::del_host_route(addr).await {
                warn!(%addr, error = %e, "failed to remove host route");
            }
        }
        if self.tracker.lock().expect("gateway tracker poisoned").last().is_some() {
            info!("cleaned up installed routes");
        }
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use std::net::{IpAddr, Ipv4Addr};

    use futures::TryStreamExt;
    use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute};
    use rtnetlink::RouteMessageBuilder;

    use super::RouteError;

    /// The IPv4 default route's gateway and output interface index.
    pub async fn default_gateway() -> Result<Option<(IpAddr, u32)>, RouteError> {
        let (conn, handle, _) = rtnetlink::new_connection().map_err(RouteError::Io)?;
        tokio::spawn(conn);

        let route = RouteMessageBuilder::<Ipv4Addr>::new().build();
        let mut routes = handle.route().get(route).execute();
        while let Some(msg) = routes
            .try_next()
            .await
            .map_err(|e| RouteError::Table(e.to_string()))?
        {
            if msg.header.destination_prefix_length != 0 {
                continue;
            }
            let mut gateway = None;
            let mut oif = None;
            for attr in &msg.attributes {
                match attr {
                    RouteAttribute::Gateway(RouteAddress::Inet(addr)) => {
                        gateway = Some(IpAddr::V4(*addr));
                    }
                    RouteAttribute::Oif(index) => oif = Some(*index),
                    _ => {}
                }
            }
            if let (Some(gw), Some(index)) = (gateway, oif) {
                return Ok(Some((gw, index)));
            }
        }
        Ok(None)
    }

    pub async fn add_host_route(addr: IpAddr) -> Result<(), RouteError> {
        let Some((gateway, oif)) = default_gateway().await? else {
            return Err(RouteError::Table("no default gateway".into()));
        };
        let (IpAddr::V4(dst), IpAddr::V4(gw)) = (addr, gateway) else {
            return Ok(()); // v6 endpoints ride the v6 default route
        };

        let (conn, handle, _) = rtnetlink::new_connection().map_err(RouteError::Io)?;
        tokio::spawn(conn);

        let route = RouteMessageBuilder::<Ipv4Addr>::new()
            .destination_prefix(dst, 32)
            .gateway(gw)
            .output_interface(oif)
            .build();
        match handle.route().add(route).execute().await {
            Ok(()) => Ok(()),
            // EEXIST: already present counts as installed.
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -17 => Ok(()),
            Err(e) => Err(RouteError::Table(e.to_string())),
        }
    }

    pub async fn del_host_route(addr: IpAddr) -> Result<(), RouteError> {
        let IpAddr::V4(dst) = addr else {
            return Ok(());
        };
        let (conn, handle, _) = rtnetlink::new_connection().map_err(RouteError::Io)?;
        tokio::spawn(conn);

        let route = RouteMessageBuilder::<Ipv4Addr>::new()
            .destination_prefix(dst, 32)
            .build();
        handle
            .route()
            .del(route)
            .execute()
            .await
            .map_err(|e| RouteError::Table(e.to_string()))
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use std::net::IpAddr;

    use super::RouteError;

    pub async fn default_gateway() -> Result<Option<(IpAddr, u32)>, RouteError> {
        Err(RouteError::Unsupported)
    }

    pub async fn add_host_route(_addr: IpAddr) -> Result<(), RouteError> {
        Err(RouteError::Unsupported)
    }

    pub async fn del_host_route(_addr: IpAddr) -> Result<(), RouteError> {
        Err(RouteError::Unsupported)
    }
}
