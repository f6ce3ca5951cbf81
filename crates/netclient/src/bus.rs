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

//! Message bus client.
//!
//! One connection per (host, server). Payloads arrive as encrypted
//! envelopes; this module decrypts them and hands typed events to the
//! reconciler's per-server channel. Subscriptions are tracked so a reconnect
//! can restore them before acknowledging to the controller.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use netclient_types::{HostAction, Server};

use crate::crypto::{self, CryptoError};

/// Reconnect retry interval.
const RETRY_INTERVAL: Duration = Duration::from_secs(4);
/// Broker keepalive.
const KEEP_ALIVE: Duration = Duration::from_secs(10);
/// Initial connection attempts before giving up on a server.
const INITIAL_ATTEMPTS: u32 = 3;
/// Per-attempt budget during initial connection.
const INITIAL_WAIT: Duration = Duration::from_secs(30);
/// Bound of the per-server event channel into the reconciler.
pub const EVENT_CHANNEL_CAPACITY: usize = 50;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("broker request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("message serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("could not connect to broker {0}")]
    ConnectFailed(String),
}

/// What kind of controller message a topic carries. Doubles as the
/// idempotency-cache key kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    NodeUpdate,
    HostUpdate,
    HostPeerUpdate,
    DnsUpdate,
    AllDnsUpdate,
}

/// A decrypted controller message.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub kind: MessageKind,
    /// Topic the message arrived on.
    pub topic: String,
    /// Network the message addresses, for node updates.
    pub network: Option<String>,
    /// Decrypted JSON payload.
    pub payload: Vec<u8>,
}

/// Everything the event loop reports upward.
#[derive(Debug)]
pub enum BusIncoming {
    Message(BusEvent),
    /// Broker (re)connected; subscriptions are already restored.
    Connected,
    /// Broker connection dropped; the route manager should check the
    /// default gateway.
    ConnectionLost,
}

// -- Topics --

pub fn host_peers_topic(host_id: Uuid, server: &str) -> String {
    format!("peers/host/{host_id}/{server}")
}

pub fn host_update_topic(host_id: Uuid, server: &str) -> String {
    format!("host/update/{host_id}/{server}")
}

pub fn dns_update_topic(host_id: Uuid, server: &str) -> String {
    format!("dns/update/{host_id}/{server}")
}

pub fn dns_all_topic(host_id: Uuid, server: &str) -> String {
    format!("dns/all/{host_id}/{server}")
}

pub fn node_update_topic(network: &str, node_id: Uuid) -> String {
    format!("node/update/{network}/{node_id}")
}

/// Outbound: host-originated signals (ack, check-in, register-with-turn).
pub fn host_signal_topic(host_id: Uuid, server: &str) -> String {
    format!("host/serverupdate/{host_id}/{server}")
}

/// Outbound: node interface-update-done signal.
pub fn node_signal_topic(network: &str, node_id: Uuid) -> String {
    format!("signal/{network}/{node_id}")
}

/// All host-level topics for one server.
pub fn host_topics(host_id: Uuid, server: &str) -> Vec<String> {
    vec![
        host_peers_topic(host_id, server),
        host_update_topic(host_id, server),
        dns_update_topic(host_id, server),
        dns_all_topic(host_id, server),
    ]
}

/// Classify an incoming topic; returns the kind and the network for node
/// updates.
pub fn parse_topic(topic: &str) -> Option<(MessageKind, Option<String>)> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        ["peers", "host", ..] => Some((MessageKind::HostPeerUpdate, None)),
        ["host", "update", ..] => Some((MessageKind::HostUpdate, None)),
        ["dns", "update", ..] => Some((MessageKind::DnsUpdate, None)),
        ["dns", "all", ..] => Some((MessageKind::AllDnsUpdate, None)),
        ["node", "update", network, _node] => {
            Some((MessageKind::NodeUpdate, Some(network.to_string())))
        }
        _ => None,
    }
}

/// Host and port a broker URL points at; scheme only picks the default
/// port.
pub fn parse_broker(url: &str) -> (String, u16) {
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("mqtt", url),
    };
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
            (host, port.parse().ok())
        }
        _ => (authority, None),
    };
    let default_port = match scheme {
        "mqtts" | "ssl" => 8883,
        "ws" => 80,
        "wss" => 443,
        _ => 1883,
    };
    (host.to_string(), port.unwrap_or(default_port))
}

// -- The capability the reconciler drives --

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: String) -> impl Future<Output = Result<(), BusError>> + Send;
    fn unsubscribe(&self, topic: String) -> impl Future<Output = Result<(), BusError>> + Send;
    fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    ) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Drop a retained message by publishing an empty retained payload.
    fn clear_retained(&self, topic: String) -> impl Future<Output = Result<(), BusError>> + Send
    where
        Self: Sized,
    {
        self.publish(topic, Vec::new(), true)
    }
}

/// Seal and publish a host signal (ack, check-in, register-with-turn,
/// update) to `server`.
pub async fn publish_host_signal<B: Bus>(
    bus: &B,
    host_id: Uuid,
    traffic_key_private: &[u8],
    server: &Server,
    action: HostAction,
) -> Result<(), BusError> {
    let body = serde_json::to_vec(&serde_json::json!({ "action": action }))?;
    let sealed = crypto::seal(&body, traffic_key_private, &server.traffic_key_public)?;
    bus.publish(host_signal_topic(host_id, &server.name), sealed, false)
        .await
}

// -- MQTT implementation --

/// The rumqttc-backed bus for one server.
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
    topics: Arc<StdMutex<HashSet<String>>>,
}

impl MqttBus {
    /// Build the client and spawn its event loop. Incoming publishes are
    /// decrypted with `traffic_key_private` / the server's traffic public
    /// key and forwarded on `incoming_tx`.
    pub fn connect(
        host_id: Uuid,
        traffic_key_private: Vec<u8>,
        server: &Server,
        incoming_tx: mpsc::Sender<BusIncoming>,
        cancel: CancellationToken,
    ) -> MqttBus {
        let (broker_host, broker_port) = parse_broker(&server.broker);
        let mut options = MqttOptions::new(host_id.to_string(), broker_host, broker_port);
        options.set_credentials(server.mq_username.clone(), server.mq_password.clone());
        options.set_keep_alive(KEEP_ALIVE);

        let (client, eventloop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);
        let bus = MqttBus {
            client,
            topics: Arc::new(StdMutex::new(HashSet::new())),
        };

        let loop_bus = bus.clone();
        let server_name = server.name.clone();
        let server_key = server.traffic_key_public.clone();
        tokio::spawn(async move {
            run_event_loop(
                loop_bus,
                eventloop,
                server_name,
                traffic_key_private,
                server_key,
                incoming_tx,
                cancel,
            )
            .await;
        });
        bus
    }
}

impl Bus for MqttBus {
    async fn subscribe(&self, topic: String) -> Result<(), BusError> {
        self.client.subscribe(topic.clone(), QoS::AtMostOnce).await?;
        self.topics.lock().expect("topic set poisoned").insert(topic);
        Ok(())
    }

    async fn unsubscribe(&self, topic: String) -> Result<(), BusError> {
        self.client.unsubscribe(topic.clone()).await?;
        self.topics.lock().expect("topic set poisoned").remove(&topic);
        Ok(())
    }

    async fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), BusError> {
        self.client
            .publish(topic, QoS::AtMostOnce, retain, payload)
            .await?;
        Ok(())
    }
}

async fn run_event_loop(
    bus: MqttBus,
    mut eventloop: rumqttc::EventLoop,
    server: String,
    traffic_key_private: Vec<u8>,
    server_traffic_key: Vec<u8>,
    incoming_tx: mpsc::Sender<BusIncoming>,
    cancel: CancellationToken,
) {
    let mut connected_once = false;
    let mut initial_failures: u32 = 0;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = tokio::time::timeout(INITIAL_WAIT, eventloop.poll()) => event,
        };

        match event {
            Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                info!(server = %server, "connected to broker");
                connected_once = true;
                resubscribe(&bus, &server).await;
                if incoming_tx.send(BusIncoming::Connected).await.is_err() {
                    break;
                }
            }
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                let payload = match crypto::open(
                    &publish.payload,
                    &traffic_key_private,
                    &server_traffic_key,
                ) {
                    Ok(p) => p,
                    Err(e) => {
                        // The controller resends; no retry here.
                        warn!(server = %server, topic = %publish.topic, error = %e, "dropping undecryptable message");
                        continue;
                    }
                };
                let Some((kind, network)) = parse_topic(&publish.topic) else {
                    debug!(server = %server, topic = %publish.topic, "message on unhandled topic");
                    continue;
                };
                let event = BusEvent {
                    kind,
                    topic: publish.topic.clone(),
                    network,
                    payload,
                };
                if incoming_tx.send(BusIncoming::Message(event)).await.is_err() {
                    break;
                }
            }
            Ok(Ok(_)) => {}
            failure => {
                let msg = match failure {
                    Ok(Err(e)) => e.to_string(),
                    _ => "connect timeout".to_string(),
                };
                if !connected_once {
                    initial_failures += 1;
                    warn!(server = %server, error = %msg, attempt = initial_failures, "unable to connect to broker, retrying");
                    if initial_failures >= INITIAL_ATTEMPTS {
                        error!(server = %server, "giving up initial broker connection");
                        let _ = incoming_tx.send(BusIncoming::ConnectionLost).await;
                        break;
                    }
                } else {
                    warn!(server = %server, error = %msg, "broker connection lost");
                    if incoming_tx.send(BusIncoming::ConnectionLost).await.is_err() {
                        break;
                    }
                }
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
    debug!(server = %server, "bus event loop stopped");
}

async fn resubscribe(bus: &MqttBus, server: &str) {
    let topics: Vec<String> = bus
        .topics
        .lock()
        .expect("topic set poisoned")
        .iter()
        .cloned()
        .collect();
    for topic in topics {
        if let Err(e) = bus.client.subscribe(topic.clone(), QoS::AtMostOnce).await {
            warn!(server, topic = %topic, error = %e, "failed to resubscribe");
        }
    }
}
