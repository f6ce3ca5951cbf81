use std::collections::BTreeMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use uuid::Uuid;

use netclient::bus::{Bus, BusError, BusEvent, MessageKind};
use netclient::config::ConfigStore;
use netclient::reconcile::{ControlSignal, Reconciler};
use netclient::state::AgentState;
use netclient::wgdev::{Device, DeviceError, InterfaceConfig};
use netclient::crypto;
use netclient_types::{
    Host, HostAction, Node, NodeAction, PeerCfg, ProxyAction, ProxyPayload, Server,
};

// -- Mocks recording calls --

#[derive(Default)]
struct MockDevice {
    configure_calls: Mutex<Vec<InterfaceConfig>>,
    set_peers_calls: Mutex<Vec<Vec<PeerCfg>>>,
    update_peer_calls: Mutex<Vec<PeerCfg>>,
    close_calls: Mutex<u32>,
}

impl Device for MockDevice {
    async fn configure(&self, cfg: &InterfaceConfig) -> Result<(), DeviceError> {
        self.configure_calls.lock().unwrap().push(cfg.clone());
        Ok(())
    }

    async fn set_peers(&self, peers: &[PeerCfg]) -> Result<(), DeviceError> {
        self.set_peers_calls.lock().unwrap().push(peers.to_vec());
        Ok(())
    }

    async fn update_peer(&self, peer: &PeerCfg) -> Result<(), DeviceError> {
        self.update_peer_calls.lock().unwrap().push(peer.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        *self.close_calls.lock().unwrap() += 1;
        Ok(())
    }
}

#[derive(Default)]
struct MockBus {
    published: Mutex<Vec<(String, bool)>>,
    unsubscribed: Mutex<Vec<String>>,
}

impl Bus for MockBus {
    async fn subscribe(&self, _topic: String) -> Result<(), BusError> {
        Ok(())
    }

    async fn unsubscribe(&self, topic: String) -> Result<(), BusError> {
        self.unsubscribed.lock().unwrap().push(topic);
        Ok(())
    }

    async fn publish(
        &self,
        topic: String,
        _payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), BusError> {
        self.published.lock().unwrap().push((topic, retain));
        Ok(())
    }
}

// -- Fixture --

struct Fixture {
    reconciler: Reconciler<MockDevice, MockBus>,
    proxy_rx: mpsc::Receiver<ProxyPayload>,
    control_rx: mpsc::Receiver<ControlSignal>,
    _dir: tempfile::TempDir,
}

fn fixture(proxy_enabled: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::new(dir.path());

    let (wg_private, wg_public) = crypto::generate_wg_keypair();
    let (traffic_private, traffic_public) = crypto::generate_traffic_keypair();
    let (_, server_traffic_public) = crypto::generate_traffic_keypair();

    let mut host = Host::with_defaults();
    host.id = Uuid::new_v4();
    host.name = "alpha".into();
    host.host_pass = "pppppppppppppppppppppppppppppppp".into();
    host.private_key = wg_private;
    host.public_key = wg_public;
    host.traffic_key_private = traffic_private;
    host.traffic_key_public = traffic_public;
    host.proxy_enabled = proxy_enabled;
    host.version = "0.9.0".into();

    let server = Server {
        name: "srv1".into(),
        broker: "mqtt://broker.test".into(),
        mq_id: host.id,
        traffic_key_public: server_traffic_public,
        version: "0.9.0".into(),
        ..Server::default()
    };
    let node = Node {
        id: Uuid::new_v4(),
        network: "net1".into(),
        server: "srv1".into(),
        address: Some("10.0.0.2/24".into()),
        connected: true,
        ..Node::default()
    };

    let servers: BTreeMap<_, _> = [("srv1".to_string(), server)].into();
    let nodes: BTreeMap<_, _> = [("net1".to_string(), node)].into();
    let state = AgentState::from_parts(store, host, servers, nodes);

    let (proxy_tx, proxy_rx) = mpsc::channel(16);
    let (control_tx, control_rx) = mpsc::channel(16);
    let reconciler = Reconciler::new(
        "srv1".into(),
        state,
        std::sync::Arc::new(MockDevice::default()),
        MockBus::default(),
        proxy_tx,
        control_tx,
    );

    Fixture {
        reconciler,
        proxy_rx,
        control_rx,
        _dir: dir,
    }
}

fn sample_peer(key: &str) -> PeerCfg {
    PeerCfg {
        public_key: key.into(),
        endpoint: Some("203.0.113.10:51820".parse().unwrap()),
        allowed_ips: vec!["10.0.0.3/32".into()],
        ..PeerCfg::default()
    }
}

fn peer_update_event(peers: Vec<PeerCfg>) -> BusEvent {
    let payload = serde_json::json!({
        "server_version": "0.9.0",
        "peers": peers,
        "proxy": { "action": "update", "server": "", "peers": [], "peer_meta": {} },
        "dns": {},
    });
    BusEvent {
        kind: MessageKind::HostPeerUpdate,
        topic: "peers/host/x/srv1".into(),
        network: None,
        payload: serde_json::to_vec(&payload).unwrap(),
    }
}

fn node_update_event(action: NodeAction, node: &Node) -> BusEvent {
    let payload = serde_json::json!({ "action": action, "node": node });
    BusEvent {
        kind: MessageKind::NodeUpdate,
        topic: format!("node/update/{}/{}", node.network, node.id),
        network: Some(node.network.clone()),
        payload: serde_json::to_vec(&payload).unwrap(),
    }
}

// -- Tests --

#[tokio::test]
async fn repeated_host_peer_update_is_a_cache_hit() {
    let mut f = fixture(false);
    let event = peer_update_event(vec![sample_peer("cGVlcjE=")]);

    f.reconciler.handle(event.clone()).await.unwrap();
    let calls_after_first = f.reconciler.device.set_peers_calls.lock().unwrap().len();
    assert_eq!(calls_after_first, 1);

    // Byte-identical repeat: the device must not be touched again.
    f.reconciler.handle(event).await.unwrap();
    let calls_after_second = f.reconciler.device.set_peers_calls.lock().unwrap().len();
    assert_eq!(calls_after_second, calls_after_first);
}

#[tokio::test]
async fn host_peer_update_reaches_proxy_with_server_tag() {
    let mut f = fixture(true);
    let event = peer_update_event(vec![sample_peer("cGVlcjE=")]);
    f.reconciler.handle(event).await.unwrap();

    let payload = f.proxy_rx.recv().await.unwrap();
    assert_eq!(payload.server, "srv1");
    assert_eq!(payload.action, ProxyAction::Update);
    assert_eq!(payload.peers.len(), 1);
}

#[tokio::test]
async fn proxy_disabled_downgrades_to_no_proxy() {
    let mut f = fixture(false);
    f.reconciler
        .handle(peer_update_event(vec![sample_peer("cGVlcjE=")]))
        .await
        .unwrap();

    let payload = f.proxy_rx.recv().await.unwrap();
    assert_eq!(payload.action, ProxyAction::NoProxy);
}

#[tokio::test]
async fn gateway_detection_sets_and_resets() {
    let mut f = fixture(false);

    let mut gw_peer = sample_peer("Z3dwZWVy");
    gw_peer.allowed_ips = vec!["10.0.0.5/32".into(), "0.0.0.0/0".into()];
    f.reconciler
        .handle(peer_update_event(vec![gw_peer.clone()]))
        .await
        .unwrap();
    let detection = f.reconciler.state.gateway();
    assert_eq!(detection.gw4.as_deref(), Some("10.0.0.5/32"));
    assert_eq!(
        f.reconciler.state.node("net1").unwrap().internet_gateway.as_deref(),
        Some("10.0.0.5/32")
    );

    // Same peer re-sent with Remove=true resets the detection.
    gw_peer.remove = true;
    f.reconciler
        .handle(peer_update_event(vec![gw_peer]))
        .await
        .unwrap();
    let detection = f.reconciler.state.gateway();
    assert_eq!(detection.gw4, None);
    assert!(!detection.detected());
}

#[tokio::test]
async fn node_delete_unsubscribes_and_removes_record() {
    let mut f = fixture(false);
    let node = f.reconciler.state.node("net1").unwrap();
    let expected_topic = format!("node/update/net1/{}", node.id);

    f.reconciler
        .handle(node_update_event(NodeAction::Delete, &node))
        .await
        .unwrap();

    assert!(f.reconciler.state.node("net1").is_none());
    let unsubscribed = f.reconciler.bus.unsubscribed.lock().unwrap().clone();
    assert_eq!(unsubscribed, vec![expected_topic]);
    // Delete publishes no signal back.
    assert!(f.reconciler.bus.published.lock().unwrap().is_empty());
}

#[tokio::test]
async fn force_update_publishes_done_signal() {
    let mut f = fixture(false);
    let node = f.reconciler.state.node("net1").unwrap();

    f.reconciler
        .handle(node_update_event(NodeAction::ForceUpdate, &node))
        .await
        .unwrap();

    let published = f.reconciler.bus.published.lock().unwrap().clone();
    assert_eq!(published.len(), 1);
    assert!(published[0].0.starts_with("signal/net1/"));
    // The interface was reapplied and the node action reset.
    assert!(!f.reconciler.device.configure_calls.lock().unwrap().is_empty());
    assert_eq!(
        f.reconciler.state.node("net1").unwrap().action,
        NodeAction::Noop
    );
}

#[tokio::test]
async fn plain_node_update_publishes_nothing() {
    let mut f = fixture(false);
    let node = f.reconciler.state.node("net1").unwrap();

    f.reconciler
        .handle(node_update_event(NodeAction::Noop, &node))
        .await
        .unwrap();

    assert!(f.reconciler.bus.published.lock().unwrap().is_empty());
}

#[tokio::test]
async fn host_update_preserves_identity_and_requests_restart() {
    let mut f = fixture(false);
    let before = f.reconciler.state.host();

    let mut update = before.clone();
    update.id = Uuid::new_v4();
    update.host_pass = "attacker".into();
    update.private_key = "forged".into();
    update.listen_port = before.listen_port + 1;

    let payload = serde_json::json!({ "action": HostAction::Update, "host": update });
    let event = BusEvent {
        kind: MessageKind::HostUpdate,
        topic: "host/update/x/srv1".into(),
        network: None,
        payload: serde_json::to_vec(&payload).unwrap(),
    };
    f.reconciler.handle(event).await.unwrap();

    let after = f.reconciler.state.host();
    assert_eq!(after.id, before.id, "controller cannot change the host id");
    assert_eq!(after.host_pass, before.host_pass);
    assert_eq!(after.private_key, before.private_key);
    assert_eq!(after.listen_port, before.listen_port + 1);

    assert_eq!(
        f.control_rx.recv().await.unwrap(),
        ControlSignal::RestartDaemon
    );
}

#[tokio::test]
async fn host_delete_detaches_server_completely() {
    let mut f = fixture(false);
    // Seed peers so the delete has something to clear.
    f.reconciler
        .handle(peer_update_event(vec![sample_peer("cGVlcjE=")]))
        .await
        .unwrap();

    let payload = serde_json::json!({ "action": HostAction::Delete });
    let event = BusEvent {
        kind: MessageKind::HostUpdate,
        topic: "host/update/x/srv1".into(),
        network: None,
        payload: serde_json::to_vec(&payload).unwrap(),
    };
    f.reconciler.handle(event).await.unwrap();

    assert!(f.reconciler.state.server("srv1").is_none());
    assert!(f.reconciler.state.node("net1").is_none());
    assert!(f.reconciler.state.host().host_peers.is_empty());

    // Retained message cleared on the incoming topic.
    let published = f.reconciler.bus.published.lock().unwrap().clone();
    assert!(published
        .iter()
        .any(|(topic, retain)| topic == "host/update/x/srv1" && *retain));

    // Proxy told to drop everything, daemon told to reset the interface.
    // (First payload is the seeded peer update.)
    let _seeded = f.proxy_rx.recv().await.unwrap();
    let teardown = f.proxy_rx.recv().await.unwrap();
    assert_eq!(teardown.action, ProxyAction::DeleteAll);
    assert_eq!(
        f.control_rx.recv().await.unwrap(),
        ControlSignal::ResetInterface
    );
}

#[tokio::test]
async fn join_inserts_node_and_restarts() {
    let mut f = fixture(false);
    let new_node = Node {
        id: Uuid::new_v4(),
        network: "net2".into(),
        server: "srv1".into(),
        address: Some("10.1.0.2/24".into()),
        connected: true,
        ..Node::default()
    };
    let payload = serde_json::json!({ "action": HostAction::Join, "node": new_node });
    let event = BusEvent {
        kind: MessageKind::HostUpdate,
        topic: "host/update/x/srv1".into(),
        network: None,
        payload: serde_json::to_vec(&payload).unwrap(),
    };
    f.reconciler.handle(event).await.unwrap();

    assert!(f.reconciler.state.node("net2").is_some());
    let server = f.reconciler.state.server("srv1").unwrap();
    assert!(server.nodes.contains_key("net2"));
    assert_eq!(
        f.control_rx.recv().await.unwrap(),
        ControlSignal::RestartDaemon
    );
}

#[tokio::test]
async fn malformed_payload_is_an_error_not_a_crash() {
    let mut f = fixture(false);
    let event = BusEvent {
        kind: MessageKind::HostPeerUpdate,
        topic: "peers/host/x/srv1".into(),
        network: None,
        payload: b"not json".to_vec(),
    };
    assert!(f.reconciler.handle(event).await.is_err());
    // The reconciler object remains usable.
    f.reconciler
        .handle(peer_update_event(vec![sample_peer("cGVlcjE=")]))
        .await
        .unwrap();
}
