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

//! WireGuard device adapter.
//!
//! One narrow capability over the mesh interface with two back-ends sharing
//! the contract: kernel WG driven over netlink (preferred) and a userspace
//! device configured through the WireGuard UAPI socket. Back-end selection
//! happens once per create. All device mutations are serialized.

use std::future::Future;
use std::net::IpAddr;

use thiserror::Error;

use netclient_types::{PeerCfg, DEFAULT_KEEPALIVE_SECS};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("not supported on this platform")]
    Unsupported,

    #[error("wireguard interface error: {0}")]
    Interface(String),

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("CIDR parse error: {0}")]
    CidrParse(String),

    #[error("IP address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Interface-level settings applied by `configure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub private_key: String,
    pub listen_port: u16,
    pub mtu: u16,
    /// Node addresses, CIDR.
    pub addresses: Vec<String>,
}

/// The capability the reconciler and prober drive.
pub trait Device: Send + Sync {
    /// Apply interface settings: key, listen port, MTU, addresses. Atomic
    /// from the caller's perspective.
    fn configure(
        &self,
        cfg: &InterfaceConfig,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Full peer replacement. Peers marked `remove` are deleted; the rest
    /// are added or updated. Idempotent.
    fn set_peers(&self, peers: &[PeerCfg]) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Single-peer mutation preserving all others.
    fn update_peer(&self, peer: &PeerCfg)
        -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Release the interface. A closed interface may be recreated.
    fn close(&self) -> impl Future<Output = Result<(), DeviceError>> + Send;
}

pub fn decode_key(b64: &str) -> Result<[u8; 32], DeviceError> {
    crate::crypto::decode_key(b64).map_err(|_| DeviceError::InvalidKeyLength(0))
}

pub fn parse_cidr(s: &str) -> Result<(IpAddr, u8), DeviceError> {
    let (addr_str, prefix_str) = s
        .split_once('/')
        .ok_or_else(|| DeviceError::CidrParse(s.to_string()))?;
    let addr: IpAddr = addr_str.parse()?;
    let prefix: u8 = prefix_str
        .parse()
        .map_err(|_| DeviceError::CidrParse(s.to_string()))?;
    Ok((addr, prefix))
}

/// Keepalive actually programmed for a peer: unset falls back to the
/// default.
pub fn effective_keepalive(peer: &PeerCfg) -> u16 {
    peer.persistent_keepalive.unwrap_or(DEFAULT_KEEPALIVE_SECS)
}

#[cfg(target_os = "linux")]
pub use linux::WgDevice;

#[cfg(not(target_os = "linux"))]
pub use stub::WgDevice;

#[cfg(not(target_os = "linux"))]
mod stub {
    use super::*;

    /// Placeholder for platforms without a WG backend yet.
    pub struct WgDevice;

    impl WgDevice {
        pub async fn create(_name: &str) -> Result<Self, DeviceError> {
            Err(DeviceError::Unsupported)
        }
    }

    impl Device for WgDevice {
        async fn configure(&self, _cfg: &InterfaceConfig) -> Result<(), DeviceError> {
            Err(DeviceError::Unsupported)
        }

        async fn set_peers(&self, _peers: &[PeerCfg]) -> Result<(), DeviceError> {
            Err(DeviceError::Unsupported)
        }

        async fn update_peer(&self, _peer: &PeerCfg) -> Result<(), DeviceError> {
            Err(DeviceError::Unsupported)
        }

        async fn close(&self) -> Result<(), DeviceError> {
            Err(DeviceError::Unsupported)
        }
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::net::SocketAddr;
    use std::sync::Mutex as StdMutex;

    use futures::TryStreamExt;
    use tokio::sync::Mutex;
    use tracing::{debug, info, warn};
    use wireguard_uapi::{set, RouteSocket, WgSocket};

    use super::*;

    enum Backend {
        Kernel,
        Userspace(StdMutex<Option<boringtun::device::DeviceHandle>>),
    }

    /// The live mesh interface. Holds which backend was selected at create
    /// time; one lock serializes every mutation.
    pub struct WgDevice {
        name: String,
        backend: Backend,
        ops: Mutex<()>,
    }

    impl WgDevice {
        /// Create the interface, destroying any existing one of the same
        /// name first. Kernel WG is preferred; when the kernel module is
        /// unavailable a userspace device is brought up instead.
        pub async fn create(name: &str) -> Result<Self, DeviceError> {
            match create_kernel(name) {
                Ok(()) => {
                    info!(interface = name, "created kernel wireguard interface");
                    Ok(WgDevice {
                        name: name.to_string(),
                        backend: Backend::Kernel,
                        ops: Mutex::new(()),
                    })
                }
                Err(e) => {
                    warn!(interface = name, error = %e, "kernel wireguard unavailable, falling back to userspace");
                    let handle = create_userspace(name)?;
                    info!(interface = name, "created userspace wireguard interface");
                    Ok(WgDevice {
                        name: name.to_string(),
                        backend: Backend::Userspace(StdMutex::new(Some(handle))),
                        ops: Mutex::new(()),
                    })
                }
            }
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        async fn apply_uapi(&self, request: &str) -> Result<(), DeviceError> {
            let path = format!("/var/run/wireguard/{}.sock", self.name);
            let mut stream = tokio::net::UnixStream::connect(&path).await?;
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            stream.write_all(request.as_bytes()).await?;
            let mut response = String::new();
            stream.read_to_string(&mut response).await?;
            for line in response.lines() {
                if let Some(code) = line.strip_prefix("errno=") {
                    if code != "0" {
                        return Err(DeviceError::Interface(format!(
                            "uapi set failed: errno={code}"
                        )));
                    }
                }
            }
            Ok(())
        }
    }

    impl Device for WgDevice {
        async fn configure(&self, cfg: &InterfaceConfig) -> Result<(), DeviceError> {
            let _guard = self.ops.lock().await;
            let private_key = decode_key(&cfg.private_key)?;

            match &self.backend {
                Backend::Kernel => {
                    let dev = set::Device::from_ifname(&self.name)
                        .private_key(&private_key)
                        .listen_port(cfg.listen_port);
                    let mut wg = WgSocket::connect()
                        .map_err(|e| DeviceError::Interface(e.to_string()))?;
                    wg.set_device(dev)
                        .map_err(|e| DeviceError::Interface(e.to_string()))?;
                }
                Backend::Userspace(_) => {
                    let request = format!(
                        "set=1\nprivate_key={}\nlisten_port={}\n\n",
                        hex(&private_key),
                        cfg.listen_port,
                    );
                    self.apply_uapi(&request).await?;
                }
            }

            assign_addresses(&self.name, &cfg.addresses).await?;
            set_link(&self.name, cfg.mtu).await?;
            info!(
                interface = %self.name,
                listen_port = cfg.listen_port,
                mtu = cfg.mtu,
                "applied interface configuration"
            );
            Ok(())
        }

        async fn set_peers(&self, peers: &[PeerCfg]) -> Result<(), DeviceError> {
            let _guard = self.ops.lock().await;
            let kept: Vec<&PeerCfg> = peers.iter().filter(|p| !p.remove).collect();

            match &self.backend {
                Backend::Kernel => {
                    let data = kept
                        .iter()
                        .map(|p| PeerData::try_from((*p).clone()))
                        .collect::<Result<Vec<_>, _>>()?;
                    let wg_peers: Vec<set::Peer<'_>> =
                        data.iter().map(PeerData::as_set_peer).collect();
                    let dev = set::Device::from_ifname(&self.name)
                        .flags(vec![set::WgDeviceF::ReplacePeers])
                        .peers(wg_peers);
                    let mut wg = WgSocket::connect()
                        .map_err(|e| DeviceError::Interface(e.to_string()))?;
                    wg.set_device(dev)
                        .map_err(|e| DeviceError::Interface(e.to_string()))?;
                }
                Backend::Userspace(_) => {
                    let mut request = String::from("set=1\nreplace_peers=true\n");
                    for peer in &kept {
                        push_uapi_peer(&mut request, peer, false)?;
                    }
                    request.push('\n');
                    self.apply_uapi(&request).await?;
                }
            }
            debug!(interface = %self.name, peer_count = kept.len(), "replaced peer set");
            Ok(())
        }

        async fn update_peer(&self, peer: &PeerCfg) -> Result<(), DeviceError> {
            let _guard = self.ops.lock().await;
            match &self.backend {
                Backend::Kernel => {
                    let data = PeerData::try_from(peer.clone())?;
                    let mut wg_peer = data.as_set_peer();
                    if peer.remove {
                        wg_peer = set::Peer::from_public_key(&data.public_key)
                            .flags(vec![set::WgPeerF::RemoveMe]);
                    }
                    let dev = set::Device::from_ifname(&self.name).peers(vec![wg_peer]);
                    let mut wg = WgSocket::connect()
                        .map_err(|e| DeviceError::Interface(e.to_string()))?;
                    wg.set_device(dev)
                        .map_err(|e| DeviceError::Interface(e.to_string()))?;
                }
                Backend::Userspace(_) => {
                    let mut request = String::from("set=1\n");
                    push_uapi_peer(&mut request, peer, peer.remove)?;
                    request.push('\n');
                    self.apply_uapi(&request).await?;
                }
            }
            debug!(interface = %self.name, peer = %peer.public_key, remove = peer.remove, "updated peer");
            Ok(())
        }

        async fn close(&self) -> Result<(), DeviceError> {
            let _guard = self.ops.lock().await;
            if let Backend::Userspace(handle) = &self.backend {
                // Dropping the handle stops the userspace worker threads.
                handle.lock().expect("device handle lock").take();
            }
            remove_interface(&self.name)?;
            info!(interface = %self.name, "closed interface");
            Ok(())
        }
    }

    fn create_kernel(name: &str) -> Result<(), DeviceError> {
        let mut route =
            RouteSocket::connect().map_err(|e| DeviceError::Interface(e.to_string()))?;
        let existing = route
            .list_device_names()
            .map_err(|e| DeviceError::Interface(e.to_string()))?;
        if existing.iter().any(|n| n == name) {
            debug!(interface = name, "interface exists, recreating");
            route
                .del_device(name)
                .map_err(|e| DeviceError::Interface(e.to_string()))?;
        }
        route
            .add_device(name)
            .map_err(|e| DeviceError::Interface(e.to_string()))?;
        Ok(())
    }

    fn create_userspace(
        name: &str,
    ) -> Result<boringtun::device::DeviceHandle, DeviceError> {
        let config = boringtun::device::DeviceConfig::default();
        boringtun::device::DeviceHandle::new(name, config)
            .map_err(|e| DeviceError::Interface(format!("{e:?}")))
    }

    fn remove_interface(name: &str) -> Result<(), DeviceError> {
        let mut route =
            RouteSocket::connect().map_err(|e| DeviceError::Interface(e.to_string()))?;
        let existing = route
            .list_device_names()
            .map_err(|e| DeviceError::Interface(e.to_string()))?;
        if existing.iter().any(|n| n == name) {
            route
                .del_device(name)
                .map_err(|e| DeviceError::Interface(e.to_string()))?;
        }
        Ok(())
    }

    struct PeerData {
        public_key: [u8; 32],
        endpoint: Option<SocketAddr>,
        allowed_ips: Vec<(IpAddr, u8)>,
        keepalive: u16,
    }

    impl TryFrom<PeerCfg> for PeerData {
        type Error = DeviceError;

        fn try_from(peer: PeerCfg) -> Result<Self, DeviceError> {
            Ok(PeerData {
                public_key: decode_key(&peer.public_key)?,
                endpoint: peer.endpoint,
                allowed_ips: peer
                    .allowed_ips
                    .iter()
                    .map(|ip| parse_cidr(ip))
                    .collect::<Result<_, _>>()?,
                keepalive: effective_keepalive(&peer),
            })
        }
    }

    impl PeerData {
        fn as_set_peer(&self) -> set::Peer<'_> {
            let mut peer = set::Peer::from_public_key(&self.public_key)
                .flags(vec![set::WgPeerF::ReplaceAllowedIps]);
            if let Some(ref endpoint) = self.endpoint {
                peer = peer.endpoint(endpoint);
            }
            let allowed: Vec<set::AllowedIp<'_>> = self
                .allowed_ips
                .iter()
                .map(|(addr, cidr)| {
                    let mut aip = set::AllowedIp::from_ipaddr(addr);
                    aip.cidr_mask = Some(*cidr);
                    aip
                })
                .collect();
            peer = peer.persistent_keepalive_interval(self.keepalive);
            peer.allowed_ips(allowed)
        }
    }

    fn push_uapi_peer(
        request: &mut String,
        peer: &PeerCfg,
        remove: bool,
    ) -> Result<(), DeviceError> {
        use std::fmt::Write;

        let key = decode_key(&peer.public_key)?;
        let _ = writeln!(request, "public_key={}", hex(&key));
        if remove {
            request.push_str("remove=true\n");
            return Ok(());
        }
        if let Some(endpoint) = peer.endpoint {
            let _ = writeln!(request, "endpoint={endpoint}");
        }
        request.push_str("replace_allowed_ips=true\n");
        for ip in &peer.allowed_ips {
            parse_cidr(ip)?;
            let _ = writeln!(request, "allowed_ip={ip}");
        }
        let _ = writeln!(
            request,
            "persistent_keepalive_interval={}",
            effective_keepalive(peer)
        );
        Ok(())
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Resolve interface name to its index via rtnetlink.
    async fn get_link_index(
        handle: &rtnetlink::Handle,
        name: &str,
    ) -> Result<u32, DeviceError> {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        let link = links
            .try_next()
            .await
            .map_err(|e| DeviceError::Interface(e.to_string()))?
            .ok_or_else(|| DeviceError::Interface(format!("interface {name} not found")))?;
        Ok(link.header.index)
    }

    async fn assign_addresses(name: &str, addresses: &[String]) -> Result<(), DeviceError> {
        let (conn, handle, _) = rtnetlink::new_connection().map_err(DeviceError::Io)?;
        tokio::spawn(conn);

        let index = get_link_index(&handle, name).await?;

        // Flush existing addresses before applying the new set.
        let existing: Vec<_> = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute()
            .try_collect()
            .await
            .map_err(|e| DeviceError::Interface(e.to_string()))?;
        for addr_msg in existing {
            handle
                .address()
                .del(addr_msg)
                .execute()
                .await
                .map_err(|e| DeviceError::Interface(e.to_string()))?;
        }

        for address in addresses {
            let (addr, prefix) = if address.contains('/') {
                parse_cidr(address)?
            } else {
                let addr: IpAddr = address.parse()?;
                let prefix = if addr.is_ipv4() { 32 } else { 128 };
                (addr, prefix)
            };
            handle
                .address()
                .add(index, addr, prefix)
                .execute()
                .await
                .map_err(|e| DeviceError::Interface(e.to_string()))?;
            debug!(interface = name, %addr, prefix, "assigned address");
        }
        Ok(())
    }

    async fn set_link(name: &str, mtu: u16) -> Result<(), DeviceError> {
        let (conn, handle, _) = rtnetlink::new_connection().map_err(DeviceError::Io)?;
        tokio::spawn(conn);

        let index = get_link_index(&handle, name).await?;
        let msg = rtnetlink::LinkUnspec::new_with_index(index)
            .mtu(mtu as u32)
            .up()
            .build();
        handle
            .link()
            .set(msg)
            .execute()
            .await
            .map_err(|e| DeviceError::Interface(e.to_string()))?;
        debug!(interface = name, mtu, "link up");
        Ok(())
    }
}
