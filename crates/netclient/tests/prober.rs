use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use netclient::config::ConfigStore;
use netclient::crypto;
use netclient::probe::{self, EndpointCache};
use netclient::state::AgentState;
use netclient::wgdev::{Device, DeviceError, InterfaceConfig};
use netclient_types::{peer_key_hash, Host, PeerCfg};

#[derive(Default)]
struct MockDevice {
    update_peer_calls: Mutex<Vec<PeerCfg>>,
}

impl Device for MockDevice {
    async fn configure(&self, _cfg: &InterfaceConfig) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn set_peers(&self, _peers: &[PeerCfg]) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn update_peer(&self, peer: &PeerCfg) -> Result<(), DeviceError> {
        self.update_peer_calls.lock().unwrap().push(peer.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

const PEER_KEY: &str = "cHJvYmUtcGVlci1rZXk=";

fn state_with_peer() -> (AgentState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let (wg_private, wg_public) = crypto::generate_wg_keypair();

    let mut host = Host::with_defaults();
    host.id = Uuid::new_v4();
    host.private_key = wg_private;
    host.public_key = wg_public;
    host.host_peers = vec![PeerCfg {
        public_key: PEER_KEY.into(),
        endpoint: Some("203.0.113.9:51820".parse().unwrap()),
        allowed_ips: vec!["10.0.0.3/32".into()],
        ..PeerCfg::default()
    }];

    let state = AgentState::from_parts(
        ConfigStore::new(dir.path()),
        host,
        BTreeMap::new(),
        BTreeMap::new(),
    );
    (state, dir)
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn send_ping(port: u16, hash: [u8; 20], sent_ms: u64) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(&probe::encode_ping(&hash, sent_ms))
        .await
        .unwrap();
    let mut buf = vec![0u8; 16];
    let len = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("listener should answer")
        .unwrap();
    buf.truncate(len);
    buf
}

struct Listener {
    device: Arc<MockDevice>,
    cache: Arc<EndpointCache>,
    port: u16,
    cancel: CancellationToken,
    _dir: tempfile::TempDir,
}

async fn spawn_listener() -> Listener {
    let (state, dir) = state_with_peer();
    let device = Arc::new(MockDevice::default());
    let cache = Arc::new(EndpointCache::default());
    let port = free_port().await;
    let cancel = CancellationToken::new();

    tokio::spawn(probe::run_listener(
        state,
        device.clone(),
        cache.clone(),
        port,
        cancel.clone(),
    ));
    // Give the listener a beat to bind.
    tokio::time::sleep(Duration::from_millis(100)).await;

    Listener {
        device,
        cache,
        port,
        cancel,
        _dir: dir,
    }
}

#[tokio::test]
async fn faster_probe_is_elected_and_repoints_the_peer() {
    let l = spawn_listener().await;
    let hash = peer_key_hash(PEER_KEY);

    // Seed a slow best endpoint, as if learned earlier.
    l.cache.record_if_better(
        hash,
        probe::BestEndpoint {
            endpoint: "198.51.100.1".parse().unwrap(),
            latency: Duration::from_millis(120),
        },
    );

    // A ping stamped 40ms ago measures well under 120ms.
    let reply = send_ping(l.port, hash, probe::now_ms() - 40).await;
    assert_eq!(reply, probe::SUCCESS);

    let best = l.cache.get_best(&hash).unwrap();
    assert_eq!(best.endpoint, "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
    assert!(best.latency < Duration::from_millis(120));

    // The WG peer was repointed at the discovered address, original port.
    let calls = l.device.update_peer_calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].endpoint,
        Some("127.0.0.1:51820".parse().unwrap())
    );

    l.cancel.cancel();
}

#[tokio::test]
async fn slower_probe_is_rejected() {
    let l = spawn_listener().await;
    let hash = peer_key_hash(PEER_KEY);

    l.cache.record_if_better(
        hash,
        probe::BestEndpoint {
            endpoint: "198.51.100.1".parse().unwrap(),
            latency: Duration::from_millis(10),
        },
    );

    let reply = send_ping(l.port, hash, probe::now_ms() - 500).await;
    assert_eq!(reply, probe::WRONG);
    assert!(l.device.update_peer_calls.lock().unwrap().is_empty());
    assert_eq!(
        l.cache.get_best(&hash).unwrap().latency,
        Duration::from_millis(10),
        "cache unchanged"
    );

    l.cancel.cancel();
}

#[tokio::test]
async fn own_hash_is_answered_wrong() {
    // The listener's own key has to be known to the test, so wire the
    // listener up by hand instead of through spawn_listener.
    let (state, _dir) = state_with_peer();
    let own_hash = peer_key_hash(&state.host().public_key);
    let device = Arc::new(MockDevice::default());
    let cache = Arc::new(EndpointCache::default());
    let port = free_port().await;
    let cancel = CancellationToken::new();
    tokio::spawn(probe::run_listener(
        state,
        device.clone(),
        cache.clone(),
        port,
        cancel.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reply = send_ping(port, own_hash, probe::now_ms()).await;
    assert_eq!(reply, probe::WRONG);
    assert!(cache.get_best(&own_hash).is_none());
    assert!(device.update_peer_calls.lock().unwrap().is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn malformed_probe_is_answered_wrong() {
    let l = spawn_listener().await;

    let mut stream = TcpStream::connect(("127.0.0.1", l.port)).await.unwrap();
    stream.write_all(b"garbage").await.unwrap();
    let mut buf = vec![0u8; 16];
    let len = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("listener should answer")
        .unwrap();
    assert_eq!(&buf[..len], probe::WRONG);

    l.cancel.cancel();
}
