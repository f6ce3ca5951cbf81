use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

use netclient_proxy::{run_manager, ProxyEngine, ProxyOp};
use netclient_types::{PeerCfg, ProxyAction, ProxyPayload, ProxyPeerMeta};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Reserve a loopback UDP port by binding and dropping a socket.
async fn free_port() -> u16 {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sock.local_addr().unwrap().port()
}

struct Harness {
    engine: Arc<ProxyEngine>,
    wg: UdpSocket,
    remote: UdpSocket,
    peer: PeerCfg,
    _degraded_rx: mpsc::Receiver<String>,
}

/// A fake WG device socket, a fake remote peer socket, and an engine wired
/// between them.
async fn harness() -> Harness {
    let wg = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (degraded_tx, degraded_rx) = mpsc::channel(8);

    let engine = ProxyEngine::create_proxy_server(
        free_port().await,
        0,
        "127.0.0.1".parse().unwrap(),
        wg.local_addr().unwrap().port(),
        degraded_tx,
    )
    .await
    .unwrap();
    let engine = Arc::new(engine);

    let runner = engine.clone();
    tokio::spawn(async move { runner.run().await });

    let remote_addr = remote.local_addr().unwrap();
    let peer = PeerCfg {
        public_key: "cHJveHktdGVzdC1wZWVy".into(),
        endpoint: Some(remote_addr),
        allowed_ips: vec!["10.0.0.2/32".into()],
        public_listen_port: remote_addr.port(),
        ..PeerCfg::default()
    };

    Harness {
        engine,
        wg,
        remote,
        peer,
        _degraded_rx: degraded_rx,
    }
}

#[tokio::test]
async fn datagram_round_trips_through_forwarder() {
    let h = harness().await;
    let local = h
        .engine
        .add_peer("srv1", &h.peer, &ProxyPeerMeta::default())
        .await
        .unwrap();

    // Egress: WG device -> peer loopback socket -> true remote, unmodified.
    let payload = b"wireguard-handshake-initiation";
    h.wg.send_to(payload, local).await.unwrap();

    let mut buf = [0u8; 256];
    let (len, from) = timeout(RECV_TIMEOUT, h.remote.recv_from(&mut buf))
        .await
        .expect("remote should receive the datagram")
        .unwrap();
    assert_eq!(&buf[..len], payload);
    assert_eq!(from, h.engine.outer_addr().unwrap(), "egress uses the shared outer socket");

    // Ingress: remote -> outer socket -> WG listen port, sourced from the
    // peer's loopback endpoint.
    let reply = b"wireguard-handshake-response";
    h.remote.send_to(reply, from).await.unwrap();

    let (len, from) = timeout(RECV_TIMEOUT, h.wg.recv_from(&mut buf))
        .await
        .expect("wg device should receive the reply")
        .unwrap();
    assert_eq!(&buf[..len], reply);
    assert_eq!(from, local, "reply appears to come from the peer's stable loopback endpoint");
}

#[tokio::test]
async fn datagrams_from_unknown_remotes_are_dropped() {
    let h = harness().await;
    h.engine
        .add_peer("srv1", &h.peer, &ProxyPeerMeta::default())
        .await
        .unwrap();

    let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    stranger
        .send_to(b"garbage", h.engine.outer_addr().unwrap())
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let res = timeout(Duration::from_millis(300), h.wg.recv_from(&mut buf)).await;
    assert!(res.is_err(), "unknown-source datagram must not reach the device");
}

#[tokio::test]
async fn forwarder_survives_reset_with_same_endpoint() {
    let h = harness().await;
    let local = h
        .engine
        .add_peer("srv1", &h.peer, &ProxyPeerMeta::default())
        .await
        .unwrap();

    h.engine
        .dispatch(&h.peer.public_key, ProxyOp::Reset)
        .await
        .unwrap();
    assert_eq!(
        h.engine.peer_endpoint(&h.peer.public_key).await,
        Some(local),
        "reset must preserve the loopback endpoint"
    );

    let payload = b"post-reset";
    h.wg.send_to(payload, local).await.unwrap();
    let mut buf = [0u8; 64];
    let (len, _) = timeout(RECV_TIMEOUT, h.remote.recv_from(&mut buf))
        .await
        .expect("forwarding should resume after reset")
        .unwrap();
    assert_eq!(&buf[..len], payload);
}

#[tokio::test]
async fn manager_applies_update_and_reports_assignment() {
    let h = harness().await;
    let (payload_tx, payload_rx) = mpsc::channel(8);
    let (assign_tx, mut assign_rx) = mpsc::channel(8);
    let cancel = tokio_util::sync::CancellationToken::new();

    tokio::spawn(run_manager(
        h.engine.clone(),
        payload_rx,
        assign_tx,
        cancel.clone(),
    ));

    payload_tx
        .send(ProxyPayload {
            action: ProxyAction::Update,
            server: "srv1".into(),
            peers: vec![h.peer.clone()],
            peer_meta: Default::default(),
        })
        .await
        .unwrap();

    let assignment = timeout(RECV_TIMEOUT, assign_rx.recv())
        .await
        .expect("manager should report the assignment")
        .unwrap();
    assert_eq!(assignment.key, h.peer.public_key);
    assert_eq!(
        h.engine.peer_endpoint(&h.peer.public_key).await,
        Some(assignment.endpoint)
    );

    // Same payload again: idempotent, no new forwarder, no new assignment.
    payload_tx
        .send(ProxyPayload {
            action: ProxyAction::Update,
            server: "srv1".into(),
            peers: vec![h.peer.clone()],
            peer_meta: Default::default(),
        })
        .await
        .unwrap();
    let res = timeout(Duration::from_millis(300), assign_rx.recv()).await;
    assert!(res.is_err(), "re-applying the same peer set must not reassign");

    // Remove flag tears the forwarder down.
    let mut removed = h.peer.clone();
    removed.remove = true;
    payload_tx
        .send(ProxyPayload {
            action: ProxyAction::Update,
            server: "srv1".into(),
            peers: vec![removed],
            peer_meta: Default::default(),
        })
        .await
        .unwrap();

    timeout(RECV_TIMEOUT, async {
        loop {
            if h.engine.peer_endpoint(&h.peer.public_key).await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("peer should be removed");

    cancel.cancel();
}

#[tokio::test]
async fn redirect_moves_traffic_to_new_remote() {
    let h = harness().await;
    let local = h
        .engine
        .add_peer("srv1", &h.peer, &ProxyPeerMeta::default())
        .await
        .unwrap();

    let new_remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    h.engine
        .update_peer(&h.peer.public_key, new_remote.local_addr().unwrap())
        .await
        .unwrap();

    h.wg.send_to(b"redirected", local).await.unwrap();
    let mut buf = [0u8; 64];
    let (len, _) = timeout(RECV_TIMEOUT, new_remote.recv_from(&mut buf))
        .await
        .expect("new remote should receive traffic")
        .unwrap();
    assert_eq!(&buf[..len], b"redirected");
}
