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
use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use netclient_types::{format_name, FirewallKind, Host, Node, Server};

use crate::crypto;
use crate::lockfile::{self, LockError};

const HOST_FILE: &str = "netclient.yml";
const NODES_FILE: &str = "nodes.yml";
const SERVERS_FILE: &str = "servers.yml";
const LOCK_FILE: &str = "netclient.lck";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("server {0} is not configured")]
    UnknownServer(String),

    #[error("server {server} is misconfigured: MQ id does not match host id")]
    MqIdMismatch { server: String },
}

/// On-disk configuration store: `netclient.yml`, `nodes.yml`, `servers.yml`
/// and the sibling lockfile, all under one directory.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ConfigStore { dir: dir.into() }
    }

    /// The platform config directory.
    pub fn system() -> Self {
        #[cfg(target_os = "macos")]
        let dir = "/Applications/Netclient/";
        #[cfg(target_os = "windows")]
        let dir = "C:\\Program Files (x86)\\Netclient\\";
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        let dir = "/etc/netclient/";
        ConfigStore::new(dir)
    }

    /// Where the agent binary is installed on this platform.
    pub fn install_path(&self) -> PathBuf {
        #[cfg(target_os = "macos")]
        return PathBuf::from("/usr/local/bin/netclient");
        #[cfg(target_os = "windows")]
        return self.dir.join("netclient.exe");
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        PathBuf::from("/usr/bin/netclient")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    pub async fn read_host(&self) -> Result<Host, ConfigError> {
        self.read_file(HOST_FILE, Host::with_defaults).await
    }

    pub async fn write_host(&self, host: &Host) -> Result<(), ConfigError> {
        self.write_file(HOST_FILE, host).await
    }

    pub async fn read_nodes(&self) -> Result<BTreeMap<String, Node>, ConfigError> {
        self.read_file(NODES_FILE, BTreeMap::new).await
    }

    pub async fn write_nodes(&self, nodes: &BTreeMap<String, Node>) -> Result<(), ConfigError> {
        self.write_file(NODES_FILE, nodes).await
    }

    pub async fn read_servers(&self) -> Result<BTreeMap<String, Server>, ConfigError> {
        self.read_file(SERVERS_FILE, BTreeMap::new).await
    }

    pub async fn write_servers(
        &self,
        servers: &BTreeMap<String, Server>,
    ) -> Result<(), ConfigError> {
        self.write_file(SERVERS_FILE, servers).await
    }

    async fn read_file<T: DeserializeOwned>(
        &self,
        name: &str,
        empty: impl FnOnce() -> T,
    ) -> Result<T, ConfigError> {
        let path = self.dir.join(name);
        let _guard = lockfile::acquire(&self.lock_path()).await?;
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let value = serde_yaml::from_str(&contents)?;
                debug!(path = %path.display(), "loaded config");
                Ok(value)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "config file not found, starting empty");
                Ok(empty())
            }
            Err(e) => Err(ConfigError::Read(e)),
        }
    }

    async fn write_file<T: Serialize>(&self, name: &str, value: &T) -> Result<(), ConfigError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(name);
        let _guard = lockfile::acquire(&self.lock_path()).await?;
        let contents = serde_yaml::to_string(value)?;
        tokio::fs::write(&path, contents).await?;
        debug!(path = %path.display(), "saved config");
        Ok(())
    }
}

/// Fill in anything missing on a freshly loaded host: identity (UUID,
/// password, keypairs, MAC, name) is generated exactly once; ports, MTU and
/// interface name fall back to defaults. Returns whether anything changed
/// and therefore needs saving.
pub fn ensure_host_defaults(host: &mut Host, version: &str) -> bool {
    let mut changed = false;

    if host.id.is_nil() {
        host.id = Uuid::new_v4();
        host.host_pass = random_password(32);
        info!(id = %host.id, "generated host identity");
        changed = true;
    }
    if host.name.is_empty() {
        host.name = format_name(&read_hostname());
        info!(name = %host.name, "set host name");
        changed = true;
    }
    if host.private_key.is_empty() {
        let (private_key, public_key) = crypto::generate_wg_keypair();
        host.private_key = private_key;
        host.public_key = public_key;
        info!("generated wireguard keypair");
        changed = true;
    }
    if host.traffic_key_private.is_empty() {
        let (private_key, public_key) = crypto::generate_traffic_keypair();
        host.traffic_key_private = private_key;
        host.traffic_key_public = public_key;
        info!("generated traffic keypair");
        changed = true;
    }
    if host.mac_address.is_empty() {
        host.mac_address = read_mac_address();
        changed = true;
    }
    if host.listen_port == 0 {
        host.listen_port = netclient_types::DEFAULT_LISTEN_PORT;
        changed = true;
    }
    if host.proxy_listen_port == 0 {
        host.proxy_listen_port = netclient_types::PROXY_PORT;
        changed = true;
    }
    if host.mtu == 0 {
        host.mtu = netclient_types::DEFAULT_MTU;
        changed = true;
    }
    if host.interface.is_empty() {
        host.interface = netclient_types::DEFAULT_INTERFACE.to_string();
        changed = true;
    }
    if host.os != std::env::consts::OS {
        host.os = std::env::consts::OS.to_string();
        changed = true;
    }
    if host.version != version {
        host.version = version.to_string();
        changed = true;
    }
    let firewall = detect_firewall();
    if host.firewall_in_use != firewall {
        host.firewall_in_use = firewall;
        changed = true;
    }

    changed
}

/// Startup-time validation: every server a node references must exist and
/// its MQ id must match the host id.
pub fn check_config(
    host: &Host,
    servers: &BTreeMap<String, Server>,
    nodes: &BTreeMap<String, Node>,
) -> Result<(), ConfigError> {
    for node in nodes.values() {
        let server = servers
            .get(&node.server)
            .ok_or_else(|| ConfigError::UnknownServer(node.server.clone()))?;
        if server.mq_id != host.id {
            return Err(ConfigError::MqIdMismatch {
                server: server.name.clone(),
            });
        }
    }
    Ok(())
}

pub fn random_password(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn read_hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    match std::fs::read_to_string("/etc/hostname") {
        Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => "netclient".to_string(),
    }
}

fn read_mac_address() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(entries) = std::fs::read_dir("/sys/class/net") {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if name == "lo" {
                    continue;
                }
                if let Ok(mac) = std::fs::read_to_string(entry.path().join("address")) {
                    let mac = mac.trim();
                    if !mac.is_empty() && mac != "00:00:00:00:00:00" {
                        return mac.to_string();
                    }
                }
            }
        }
    }
    // No physical interface found; a random locally administered MAC keeps
    // the identity stable once persisted.
    let mut rng = rand::thread_rng();
    let bytes: [u8; 5] = rng.gen();
    warn!("no usable interface MAC found, generating one");
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]
    )
}

fn detect_firewall() -> FirewallKind {
    #[cfg(target_os = "linux")]
    {
        let in_path = |bin: &str| {
            std::env::var_os("PATH").is_some_and(|paths| {
                std::env::split_paths(&paths).any(|p| p.join(bin).exists())
            })
        };
        if in_path("iptables") {
            return FirewallKind::Iptables;
        }
        if in_path("nft") {
            return FirewallKind::Nftables;
        }
    }
    FirewallKind::None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn host_round_trips_through_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());

        let mut host = Host::with_defaults();
        ensure_host_defaults(&mut host, "0.9.0");
        store.write_host(&host).await.unwrap();

        let loaded = store.read_host().await.unwrap();
        assert_eq!(host, loaded);
    }

    #[tokio::test]
    async fn missing_files_load_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        assert!(store.read_nodes().await.unwrap().is_empty());
        assert!(store.read_servers().await.unwrap().is_empty());
    }

    #[test]
    fn fresh_start_generates_identity_once() {
        let mut host = Host::with_defaults();
        assert!(ensure_host_defaults(&mut host, "0.9.0"));

        assert!(!host.id.is_nil());
        assert_eq!(host.host_pass.len(), 32);
        assert!(!host.private_key.is_empty());
        assert!(!host.public_key.is_empty());
        assert_eq!(host.traffic_key_private.len(), 32);
        assert_eq!(host.traffic_key_public.len(), 32);
        assert_eq!(host.listen_port, netclient_types::DEFAULT_LISTEN_PORT);

        // Second pass changes nothing.
        let before = host.clone();
        assert!(!ensure_host_defaults(&mut host, "0.9.0"));
        assert_eq!(host, before);
    }

    #[test]
    fn check_config_flags_mq_mismatch() {
        let mut host = Host::with_defaults();
        ensure_host_defaults(&mut host, "0.9.0");

        let mut server = Server {
            name: "srv1".into(),
            mq_id: host.id,
            ..Server::default()
        };
        let node = Node {
            network: "net1".into(),
            server: "srv1".into(),
            ..Node::default()
        };

        let servers: BTreeMap<_, _> = [("srv1".to_string(), server.clone())].into();
        let nodes: BTreeMap<_, _> = [("net1".to_string(), node)].into();
        check_config(&host, &servers, &nodes).unwrap();

        server.mq_id = Uuid::new_v4();
        let servers: BTreeMap<_, _> = [("srv1".to_string(), server)].into();
        assert!(check_config(&host, &servers, &nodes).is_err());
    }

    #[test]
    fn random_password_is_alphanumeric() {
        let pass = random_password(32);
        assert_eq!(pass.len(), 32);
        assert!(pass.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(pass, random_password(32));
    }
}
