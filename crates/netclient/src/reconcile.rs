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

//! Reconciliation engine.
//!
//! The single logical writer for host/node/peer state. Controller messages
//! for one server are applied strictly in receive order by that server's
//! reconciler task; writes to shared state go through the `AgentState` lock
//! and the WG device serializes its own mutations. A bad message is logged
//! and counted, never fatal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use netclient_types::{
    detect_gateways, HostAction, HostPeerUpdateMsg, HostUpdateMsg, Node, NodeAction,
    NodeUpdateMsg, ProxyAction, ProxyPayload,
};

use crate::bus::{self, Bus, BusEvent, BusIncoming, MessageKind};
use crate::crypto;
use crate::routes::RouteManager;
use crate::state::AgentState;
use crate::wgdev::{Device, InterfaceConfig};

/// How long an identical payload suppresses reprocessing.
const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Requests the reconciler cannot serve itself and hands to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Full daemon restart (ports changed, network joined, keys rotated).
    RestartDaemon,
    /// Destroy and recreate the interface (MTU change, server delete).
    ResetInterface,
}

/// In-memory idempotency cache: the last raw payload per (scope, kind),
/// retained for 24 hours.
#[derive(Debug, Default)]
pub struct MessageCache {
    entries: StdMutex<HashMap<(String, MessageKind), (Vec<u8>, Instant)>>,
}

impl MessageCache {
    /// True when `payload` is byte-identical to the cached entry and the
    /// entry is still fresh. Stores the payload either way.
    pub fn seen(&self, scope: &str, kind: MessageKind, payload: &[u8]) -> bool {
        let mut entries = self.entries.lock().expect("message cache poisoned");
        let key = (scope.to_string(), kind);
        let duplicate = match entries.get(&key) {
            Some((cached, at)) => at.elapsed() < CACHE_TTL && cached == payload,
            None => false,
        };
        if !duplicate {
            entries.insert(key, (payload.to_vec(), Instant::now()));
        }
        duplicate
    }
}

/// Interface settings derived from the host record and every connected
/// node's addresses.
pub fn interface_config(state: &AgentState) -> InterfaceConfig {
    let host = state.host();
    let addresses = state
        .nodes()
        .values()
        .filter(|n| n.connected)
        .flat_map(|n| [n.address.clone(), n.address6.clone()])
        .flatten()
        .collect();
    InterfaceConfig {
        private_key: host.private_key,
        listen_port: host.listen_port,
        mtu: host.mtu,
        addresses,
    }
}

/// One reconciler per server.
pub struct Reconciler<D: Device, B: Bus> {
    pub server_name: String,
    pub state: AgentState,
    pub device: Arc<D>,
    pub bus: B,
    pub proxy_tx: mpsc::Sender<ProxyPayload>,
    pub control_tx: mpsc::Sender<ControlSignal>,
    pub cache: MessageCache,
    /// Fired after a peer-set change so the prober runs a round early.
    pub peer_set_changed: Arc<tokio::sync::Notify>,
    errors: u64,
}

impl<D: Device, B: Bus> Reconciler<D, B> {
    pub fn new(
        server_name: String,
        state: AgentState,
        device: Arc<D>,
        bus: B,
        proxy_tx: mpsc::Sender<ProxyPayload>,
        control_tx: mpsc::Sender<ControlSignal>,
    ) -> Self {
        Reconciler {
            server_name,
            state,
            device,
            bus,
            proxy_tx,
            control_tx,
            cache: MessageCache::default(),
            peer_set_changed: Arc::new(tokio::sync::Notify::new()),
            errors: 0,
        }
    }

    /// Drain this server's event channel until cancelled.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<BusIncoming>,
        routes: Arc<RouteManager>,
        cancel: CancellationToken,
    ) {
        info!(server = %self.server_name, "reconciler started");
        loop {
            let incoming = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(m) => m,
                    None => break,
                },
            };
            match incoming {
                BusIncoming::Message(event) => {
                    if let Err(e) = self.handle(event).await {
                        self.errors += 1;
                        error!(
                            server = %self.server_name,
                            error = %e,
                            error_count = self.errors,
                            "failed to process controller message"
                        );
                    }
                }
                BusIncoming::Connected => self.on_connected().await,
                BusIncoming::ConnectionLost => self.on_connection_lost(&routes).await,
            }
        }
        debug!(server = %self.server_name, "reconciler stopped");
    }

    /// Acknowledge the (re)connect; subscriptions were already restored by
    /// the bus client.
    async fn on_connected(&self) {
        let host = self.state.host();
        let Some(server) = self.state.server(&self.server_name) else {
            return;
        };
        if let Err(e) = bus::publish_host_signal(
            &self.bus,
            host.id,
            &host.traffic_key_private,
            &server,
            HostAction::Ack,
        )
        .await
        {
            warn!(server = %self.server_name, error = %e, "failed to publish ack");
        }
        if server.use_turn {
            if let Err(e) = bus::publish_host_signal(
                &self.bus,
                host.id,
                &host.traffic_key_private,
                &server,
                HostAction::RegisterWithTurn,
            )
            .await
            {
                warn!(server = %self.server_name, error = %e, "failed to publish turn registration");
            } else {
                info!(server = %self.server_name, "registered with turn");
            }
        }
    }

    /// Broker drop: a moved default gateway means our routes are stale.
    async fn on_connection_lost(&self, routes: &RouteManager) {
        if !routes.has_gateway_changed().await {
            return;
        }
        info!(server = %self.server_name, "default gateway changed, reinstalling routes");
        routes.cleanup().await;
        if let Some(server) = self.state.server(&self.server_name) {
            if let Err(e) = routes.set_server_routes(&server).await {
                warn!(server = %self.server_name, error = %e, "failed to reinstall server routes");
            }
        }
        let peers = self.state.host().host_peers;
        if let Err(e) = routes.set_peer_routes(&peers).await {
            warn!(server = %self.server_name, error = %e, "failed to reinstall peer routes");
        }
    }

    pub async fn handle(&mut self, event: BusEvent) -> Result<(), ReconcileError> {
        match event.kind {
            MessageKind::NodeUpdate => {
                let network = event.network.clone().unwrap_or_default();
                self.handle_node_update(&network, &event).await
            }
            MessageKind::HostPeerUpdate => self.handle_host_peer_update(&event).await,
            MessageKind::HostUpdate => self.handle_host_update(&event).await,
            MessageKind::DnsUpdate | MessageKind::AllDnsUpdate => self.handle_dns(&event),
        }
    }

    async fn handle_node_update(
        &mut self,
        network: &str,
        event: &BusEvent,
    ) -> Result<(), ReconcileError> {
        if self.cache.seen(network, MessageKind::NodeUpdate, &event.payload) {
            debug!(network, "cache hit on node update, skipping");
            return Ok(());
        }
        let msg: NodeUpdateMsg = serde_json::from_slice(&event.payload)?;
        let Some(current) = self.state.node(network) else {
            warn!(network, "node update for unknown network");
            return Ok(());
        };

        let mut new_node = msg.node;
        // Network name is immutable; the topic is authoritative.
        new_node.network = network.to_string();
        new_node.server = current.server.clone();

        let mut iface_delta = current.iface_delta(&new_node);
        let dns_flipped_off = current.dns_on && !new_node.dns_on;
        let keepalive_changed =
            current.persistent_keepalive_secs != new_node.persistent_keepalive_secs;

        match msg.action {
            NodeAction::Delete => {
                info!(network, node = %new_node.id, "received delete for node");
                return self.leave_node(&current).await;
            }
            NodeAction::UpdateKeys => {
                self.rotate_wg_keys();
                self.state.persist_host().await;
                iface_delta = true;
            }
            NodeAction::ForceUpdate => iface_delta = true,
            NodeAction::Noop | NodeAction::Update => {}
        }

        new_node.action = NodeAction::Noop;
        self.state.upsert_node(new_node.clone());
        self.state.persist_nodes().await;

        // Reapply the interface and push the peer set back.
        if let Err(e) = self.device.configure(&interface_config(&self.state)).await {
            error!(network, error = %e, "could not configure interface");
            return Ok(());
        }
        let peers = self.state.host().host_peers;
        if let Err(e) = self.device.set_peers(&peers).await {
            error!(network, error = %e, "could not apply peer set");
            return Ok(());
        }
        if keepalive_changed {
            debug!(
                network,
                keepalive = new_node.persistent_keepalive_secs,
                "keepalive changed, peers reapplied"
            );
        }

        if iface_delta {
            // Tell the controller it may re-push peers for the new
            // interface state.
            self.publish_done_signal(&new_node).await;
        }
        if dns_flipped_off {
            info!(network, "dns disabled, clearing host entries for network");
        }
        Ok(())
    }

    /// Unsubscribe and drop all local resources for a node. Errors carrying
    /// an "rpc error" marker come from a controller that already forgot us
    /// and are tolerated.
    async fn leave_node(&mut self, node: &Node) -> Result<(), ReconcileError> {
        let topic = bus::node_update_topic(&node.network, node.id);
        if let Err(e) = self.bus.unsubscribe(topic).await {
            let text = e.to_string();
            if !text.contains("rpc error") {
                return Err(ReconcileError::Leave {
                    network: node.network.clone(),
                    reason: text,
                });
            }
        }
        self.state.remove_node(&node.network);
        if let Some(mut server) = self.state.server(&node.server) {
            server.nodes.remove(&node.network);
            self.state.upsert_server(server);
        }
        self.state.persist_nodes().await;
        self.state.persist_servers().await;
        info!(network = %node.network, "node removed from network");
        Ok(())
    }

    /// Rotate the WireGuard keypair; a failed rotation keeps the old key.
    fn rotate_wg_keys(&self) {
        let (private_key, public_key) = crypto::generate_wg_keypair();
        match crypto::derive_public_key(&private_key) {
            Ok(_) => {
                self.state.update_host(|host| {
                    host.private_key = private_key;
                    host.public_key = public_key;
                });
                info!("rotated wireguard keys");
            }
            Err(e) => {
                warn!(error = %e, "wireguard key rotation failed, reusing previous key");
            }
        }
    }

    async fn handle_host_peer_update(&mut self, event: &BusEvent) -> Result<(), ReconcileError> {
        if self
            .cache
            .seen(&self.server_name, MessageKind::HostPeerUpdate, &event.payload)
        {
            debug!(server = %self.server_name, "cache hit on host peer update, skipping");
            return Ok(());
        }
        let msg: HostPeerUpdateMsg = serde_json::from_slice(&event.payload)?;
        let Some(mut server) = self.state.server(&self.server_name) else {
            warn!(server = %self.server_name, "peer update from unknown server");
            return Ok(());
        };

        let host = self.state.host();
        if msg.server_version != host.version {
            info!(
                server_version = %msg.server_version,
                client_version = %host.version,
                "server/client version mismatch"
            );
        }
        if msg.server_version != server.version {
            server.version = msg.server_version.clone();
            self.state.upsert_server(server.clone());
            self.state.persist_servers().await;
        }

        // Gateway detection runs over the merged set, not just this
        // server's share.
        let merged = self.state.set_server_peers(&self.server_name, msg.peers.clone());
        let gateway = detect_gateways(&merged, self.state.host_is_inet_gateway());
        let gateway_changed = gateway != self.state.gateway();
        self.state.set_gateway(gateway.clone());
        if gateway_changed {
            for mut node in self.state.nodes_of_server(&self.server_name) {
                if node.internet_gateway != gateway.gw4 {
                    node.internet_gateway = gateway.gw4.clone();
                    self.state.upsert_node(node);
                }
            }
            self.state.persist_nodes().await;
        }

        if let Err(e) = self.device.set_peers(&merged).await {
            error!(server = %self.server_name, error = %e, "could not apply peer set");
            return Ok(());
        }
        self.state.persist_host().await;

        // Hand the proxy engine its copy, tagged with this server. A host
        // with proxying disabled downgrades the action.
        let mut proxy = msg.proxy.clone();
        proxy.server = self.server_name.clone();
        if proxy.peers.is_empty() {
            proxy.peers = msg.peers.clone();
        }
        if !host.proxy_enabled {
            proxy.action = ProxyAction::NoProxy;
        }
        if self.proxy_tx.send(proxy).await.is_err() {
            warn!(server = %self.server_name, "proxy channel closed");
        }
        self.peer_set_changed.notify_one();

        for (network, entries) in &msg.dns {
            let Some(node) = self.state.node(network) else {
                continue;
            };
            if node.dns_on {
                debug!(network, entries = entries.len(), "applying dns entries");
            } else {
                debug!(network, "dns off, dropping pushed entries");
            }
        }
        Ok(())
    }

    async fn handle_host_update(&mut self, event: &BusEvent) -> Result<(), ReconcileError> {
        let msg: HostUpdateMsg = serde_json::from_slice(&event.payload)?;
        debug!(server = %self.server_name, action = ?msg.action, "received host update");

        match msg.action {
            HostAction::Join => {
                let Some(node) = msg.node else {
                    warn!(server = %self.server_name, "join without node record");
                    return Ok(());
                };
                let Some(mut server) = self.state.server(&self.server_name) else {
                    return Ok(());
                };
                server.nodes.insert(node.network.clone(), true);
                self.state.upsert_server(server);
                self.state.upsert_node(node);
                self.state.persist_nodes().await;
                self.state.persist_servers().await;
                let _ = self.bus.clear_retained(event.topic.clone()).await;
                self.send_control(ControlSignal::RestartDaemon).await;
            }
            HostAction::Delete => {
                info!(server = %self.server_name, "detaching from server");
                let _ = self.bus.clear_retained(event.topic.clone()).await;
                self.unsubscribe_server_topics().await;
                for node in self.state.nodes_of_server(&self.server_name) {
                    self.state.remove_node(&node.network);
                }
                self.state.remove_server(&self.server_name);
                let merged = self.state.clear_server_peers(&self.server_name);
                self.state.persist_nodes().await;
                self.state.persist_servers().await;
                self.state.persist_host().await;
                let _ = self
                    .proxy_tx
                    .send(ProxyPayload {
                        action: ProxyAction::DeleteAll,
                        server: self.server_name.clone(),
                        peers: merged,
                        peer_meta: Default::default(),
                    })
                    .await;
                self.send_control(ControlSignal::ResetInterface).await;
            }
            HostAction::Update => {
                let Some(update) = msg.host else {
                    warn!(server = %self.server_name, "host update without host record");
                    return Ok(());
                };
                let (reset_interface, restart) =
                    self.state.update_host(|host| host.merge_update(&update));
                self.state.persist_host().await;
                if restart {
                    self.send_control(ControlSignal::RestartDaemon).await;
                } else if reset_interface {
                    self.send_control(ControlSignal::ResetInterface).await;
                }
            }
            HostAction::UpdateKeys => {
                self.rotate_wg_keys();
                self.state.persist_host().await;
                let host = self.state.host();
                if let Some(server) = self.state.server(&self.server_name) {
                    if let Err(e) = bus::publish_host_signal(
                        &self.bus,
                        host.id,
                        &host.traffic_key_private,
                        &server,
                        HostAction::Update,
                    )
                    .await
                    {
                        warn!(server = %self.server_name, error = %e, "failed to publish key update");
                    }
                }
                self.send_control(ControlSignal::RestartDaemon).await;
            }
            other => {
                warn!(server = %self.server_name, action = ?other, "unknown host action, ignoring");
            }
        }
        Ok(())
    }

    fn handle_dns(&mut self, event: &BusEvent) -> Result<(), ReconcileError> {
        let kind = event.kind;
        let scope = event.network.clone().unwrap_or_else(|| self.server_name.clone());
        if self.cache.seen(&scope, kind, &event.payload) {
            debug!(scope = %scope, "cache hit on dns update, skipping");
            return Ok(());
        }
        // Validation only; hosts-file editing is the platform helper's job.
        let _: serde_json::Value = serde_json::from_slice(&event.payload)?;
        debug!(scope = %scope, kind = ?kind, "dns update accepted");
        Ok(())
    }

    async fn publish_done_signal(&self, node: &Node) {
        let host = self.state.host();
        let Some(server) = self.state.server(&self.server_name) else {
            return;
        };
        let body = serde_json::json!({ "action": HostAction::SignalDone });
        let Ok(body) = serde_json::to_vec(&body) else {
            return;
        };
        let sealed = match crypto::seal(&body, &host.traffic_key_private, &server.traffic_key_public)
        {
            Ok(s) => s,
            Err(e) => {
                warn!(network = %node.network, error = %e, "failed to seal done signal");
                return;
            }
        };
        match self
            .bus
            .publish(bus::node_signal_topic(&node.network, node.id), sealed, false)
            .await
        {
            Ok(()) => {
                info!(network = %node.network, "signalled finished interface update")
            }
            Err(e) => {
                warn!(network = %node.network, error = %e, "could not notify controller after interface change")
            }
        }
    }

    async fn unsubscribe_server_topics(&self) {
        let host = self.state.host();
        for topic in bus::host_topics(host.id, &self.server_name) {
            if let Err(e) = self.bus.unsubscribe(topic).await {
                warn!(server = %self.server_name, error = %e, "failed to unsubscribe host topic");
            }
        }
        for node in self.state.nodes_of_server(&self.server_name) {
            let topic = bus::node_update_topic(&node.network, node.id);
            if let Err(e) = self.bus.unsubscribe(topic).await {
                warn!(network = %node.network, error = %e, "failed to unsubscribe node topic");
            }
        }
    }

    async fn send_control(&self, signal: ControlSignal) {
        if self.control_tx.send(signal).await.is_err() {
            warn!(server = %self.server_name, ?signal, "control channel closed");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("malformed message payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("failed to leave network {network}: {reason}")]
    Leave { network: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_suppresses_identical_payloads_only() {
        let cache = MessageCache::default();
        assert!(!cache.seen("net1", MessageKind::NodeUpdate, b"payload-a"));
        assert!(cache.seen("net1", MessageKind::NodeUpdate, b"payload-a"));

        // Different payload, kind or scope all miss.
        assert!(!cache.seen("net1", MessageKind::NodeUpdate, b"payload-b"));
        assert!(!cache.seen("net1", MessageKind::DnsUpdate, b"payload-b"));
        assert!(!cache.seen("net2", MessageKind::NodeUpdate, b"payload-b"));
    }
}
