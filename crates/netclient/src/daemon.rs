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

//! Daemon runtime: owns the WG device, wires bus clients to reconcilers,
//! runs the proxy engine and the prober, and reacts to signals.
//!
//! SIGHUP tears the workers down and goes through startup again (re-reading
//! config and re-probing NAT); SIGTERM shuts down cleanly with a five
//! second join budget.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use netclient_proxy::{run_manager, ProxyEngine};
use netclient_types::{HostAction, PeerCfg, ProxyPayload};

use crate::bus::{self, Bus, MqttBus, EVENT_CHANNEL_CAPACITY};
use crate::config::{self, ConfigError, ConfigStore};
use crate::nat::{self, NatInfo};
use crate::probe::{self, EndpointCache};
use crate::reconcile::{self, ControlSignal, Reconciler};
use crate::routes::RouteManager;
use crate::state::AgentState;
use crate::wgdev::{Device, DeviceError, WgDevice};

/// Join budget on shutdown before sockets are force-closed.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

/// Check-in period.
const CHECKIN_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

enum Outcome {
    Shutdown,
    Restart,
}

/// Run the agent until SIGTERM. Each pass of the loop is one daemon
/// lifetime; SIGHUP and controller-driven restarts come back around.
pub async fn run(store: ConfigStore, version: &str) -> Result<(), DaemonError> {
    info!(version, "starting netclient daemon");
    write_pid_file(&store).await;

    loop {
        match run_once(&store, version).await? {
            Outcome::Shutdown => break,
            Outcome::Restart => {
                info!("resetting daemon");
                continue;
            }
        }
    }

    remove_pid_file(&store).await;
    info!("shutdown complete");
    Ok(())
}

async fn run_once(store: &ConfigStore, version: &str) -> Result<Outcome, DaemonError> {
    // Config is re-read every pass so a reset picks up edits.
    let state = AgentState::load(store.clone()).await?;
    let changed = state.update_host(|host| config::ensure_host_defaults(host, version));
    if changed {
        state.persist_host().await;
    }
    let host = state.host();
    config::check_config(&host, &state.servers(), &state.nodes())?;

    let nat_info = introspect_nat(&state).await;

    // Bring the interface up and apply the last known peer set before any
    // controller talks to us.
    let device = Arc::new(WgDevice::create(&host.interface).await?);
    if let Err(e) = device.configure(&reconcile::interface_config(&state)).await {
        error!(error = %e, "could not configure interface");
    }
    if let Err(e) = device.set_peers(&host.host_peers).await {
        error!(error = %e, "could not apply stored peer set");
    }

    let routes = Arc::new(RouteManager::default());
    for server in state.servers().values() {
        if let Err(e) = routes.set_server_routes(server).await {
            warn!(server = %server.name, error = %e, "failed to set server routes");
        }
    }
    if let Err(e) = routes.set_peer_routes(&host.host_peers).await {
        warn!(error = %e, "failed to set peer endpoint routes");
    }

    let cancel = CancellationToken::new();
    let mut tasks: JoinSet<()> = JoinSet::new();
    let (control_tx, mut control_rx) = mpsc::channel::<ControlSignal>(8);
    let (proxy_tx, proxy_rx) = mpsc::channel::<ProxyPayload>(EVENT_CHANNEL_CAPACITY);
    let (degraded_tx, mut degraded_rx) = mpsc::channel::<String>(16);

    // Proxy engine.
    if host.proxy_enabled {
        start_proxy(
            &state,
            &nat_info,
            device.clone(),
            proxy_rx,
            degraded_tx,
            &mut tasks,
            cancel.clone(),
        )
        .await;
    } else {
        // Nobody consumes the channel otherwise; drain it quietly.
        let mut proxy_rx = proxy_rx;
        let drain_cancel = cancel.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = drain_cancel.cancelled() => break,
                    msg = proxy_rx.recv() => if msg.is_none() { break },
                }
            }
        });
    }

    // Degraded proxied peers fall back to their direct endpoint.
    {
        let state = state.clone();
        let device = device.clone();
        let fallback_cancel = cancel.clone();
        tasks.spawn(async move {
            loop {
                let key = tokio::select! {
                    _ = fallback_cancel.cancelled() => break,
                    key = degraded_rx.recv() => match key {
                        Some(k) => k,
                        None => break,
                    },
                };
                warn!(peer = %key, "proxy degraded, falling back to direct endpoint");
                let peers = state.host().host_peers;
                if let Some(peer) = peers.into_iter().find(|p| p.public_key == key) {
                    if let Err(e) = device.update_peer(&peer).await {
                        warn!(peer = %peer.public_key, error = %e, "direct fallback failed");
                    }
                }
            }
        });
    }

    // One bus client and reconciler per server. A shared notifier lets any
    // reconciler kick the prober after a peer-set change.
    let peer_set_changed = Arc::new(tokio::sync::Notify::new());
    let mut server_buses: Vec<(String, MqttBus)> = Vec::new();
    for (name, server) in state.servers() {
        let (incoming_tx, incoming_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mqtt = MqttBus::connect(
            host.id,
            host.traffic_key_private.clone(),
            &server,
            incoming_tx,
            cancel.clone(),
        );
        subscribe_topics(&mqtt, &state, &name).await;
        server_buses.push((name.clone(), mqtt.clone()));

        let mut reconciler = Reconciler::new(
            name.clone(),
            state.clone(),
            device.clone(),
            mqtt,
            proxy_tx.clone(),
            control_tx.clone(),
        );
        reconciler.peer_set_changed = peer_set_changed.clone();
        let routes = routes.clone();
        let reconciler_cancel = cancel.clone();
        tasks.spawn(async move {
            reconciler.run(incoming_rx, routes, reconciler_cancel).await;
        });
    }

    // Endpoint prober: listener plus periodic client.
    let endpoint_cache = Arc::new(EndpointCache::default());
    {
        let state = state.clone();
        let device = device.clone();
        let cache = endpoint_cache.clone();
        let port = host.proxy_listen_port;
        let listener_cancel = cancel.clone();
        tasks.spawn(async move {
            probe::run_listener(state, device, cache, port, listener_cancel).await;
        });
    }
    {
        let state = state.clone();
        let cache = endpoint_cache.clone();
        let changed = peer_set_changed.clone();
        let prober_cancel = cancel.clone();
        tasks.spawn(async move {
            probe::run_prober(state, cache, changed, prober_cancel).await;
        });
    }

    // Periodic check-in to every server over the existing connections.
    {
        let state = state.clone();
        let buses = server_buses;
        let checkin_cancel = cancel.clone();
        tasks.spawn(async move {
            run_checkin(state, buses, checkin_cancel).await;
        });
    }

    // Wait for a reason to stop this lifetime.
    let outcome = wait_for_signal(&mut control_rx, &device, &state).await;

    cancel.cancel();
    shutdown_tasks(tasks).await;
    routes.cleanup().await;
    // A reset recreates the interface next pass, so close in both cases.
    if let Err(e) = device.close().await {
        warn!(error = %e, "failed to close interface");
    }
    Ok(outcome)
}

async fn introspect_nat(state: &AgentState) -> NatInfo {
    let host = state.host();
    let priv_ip = host
        .endpoint_ip
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    for server in state.servers().values() {
        if server.stun_list.is_empty() {
            continue;
        }
        let info = nat::introspect(&server.stun_list, priv_ip, host.proxy_listen_port).await;
        if info.public_ip.is_some() {
            return info;
        }
    }
    nat::introspect(&[], priv_ip, host.proxy_listen_port).await
}

async fn start_proxy(
    state: &AgentState,
    nat_info: &NatInfo,
    device: Arc<WgDevice>,
    proxy_rx: mpsc::Receiver<ProxyPayload>,
    degraded_tx: mpsc::Sender<String>,
    tasks: &mut JoinSet<()>,
    cancel: CancellationToken,
) {
    let host = state.host();
    let bind_ip = match nat_info.priv_ip {
        IpAddr::V4(ip) if !ip.is_unspecified() => IpAddr::V4(ip),
        _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    let engine = match ProxyEngine::create_proxy_server(
        host.proxy_listen_port,
        nat_info.public_port,
        bind_ip,
        host.listen_port,
        degraded_tx,
    )
    .await
    {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!(error = %e, "failed to create proxy server, peers stay direct");
            return;
        }
    };

    // Seed TURN settings for servers that relay through one.
    for server in state.servers().values() {
        if !server.use_turn {
            continue;
        }
        if let Some(addr) = server.turn_list.first() {
            engine
                .turn()
                .set_cfg(
                    &server.name,
                    netclient_proxy::TurnCfg {
                        addr: addr.clone(),
                        username: host.id.to_string(),
                        password: host.host_pass.clone(),
                    },
                )
                .await;
        }
    }

    {
        let engine = engine.clone();
        let engine_cancel = cancel.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = engine_cancel.cancelled() => engine.cancellation().cancel(),
                _ = engine.run() => {}
            }
        });
    }

    let (assign_tx, mut assign_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    {
        let engine = engine.clone();
        let manager_cancel = cancel.clone();
        tasks.spawn(async move {
            run_manager(engine, proxy_rx, assign_tx, manager_cancel).await;
        });
    }

    // Every loopback assignment repoints the WG peer at the forwarder.
    {
        let state = state.clone();
        let assign_cancel = cancel;
        tasks.spawn(async move {
            loop {
                let assignment = tokio::select! {
                    _ = assign_cancel.cancelled() => break,
                    a = assign_rx.recv() => match a {
                        Some(a) => a,
                        None => break,
                    },
                };
                let peers = state.host().host_peers;
                let Some(peer) = peers.into_iter().find(|p| p.public_key == assignment.key)
                else {
                    continue;
                };
                let proxied = PeerCfg {
                    endpoint: Some(assignment.endpoint),
                    ..peer
                };
                if let Err(e) = device.update_peer(&proxied).await {
                    warn!(peer = %proxied.public_key, error = %e, "failed to repoint peer at proxy");
                }
            }
        });
    }
}

async fn subscribe_topics(bus: &MqttBus, state: &AgentState, server: &str) {
    let host = state.host();
    for topic in bus::host_topics(host.id, server) {
        if let Err(e) = bus.subscribe(topic.clone()).await {
            warn!(server, topic = %topic, error = %e, "failed to subscribe");
        }
    }
    for node in state.nodes_of_server(server) {
        let topic = bus::node_update_topic(&node.network, node.id);
        if let Err(e) = bus.subscribe(topic.clone()).await {
            warn!(server, topic = %topic, error = %e, "failed to subscribe");
        }
    }
}

async fn run_checkin(
    state: AgentState,
    buses: Vec<(String, MqttBus)>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(CHECKIN_INTERVAL) => {}
        }
        let host = state.host();
        for (name, bus) in &buses {
            let Some(server) = state.server(name) else {
                continue;
            };
            if let Err(e) = bus::publish_host_signal(
                bus,
                host.id,
                &host.traffic_key_private,
                &server,
                HostAction::CheckIn,
            )
            .await
            {
                debug!(server = %name, error = %e, "check-in publish failed");
            }
        }
    }
}

async fn wait_for_signal(
    control_rx: &mut mpsc::Receiver<ControlSignal>,
    device: &Arc<WgDevice>,
    state: &AgentState,
) -> Outcome {
    let mut sigterm = std::pin::pin!(shutdown_signal());
    let mut sighup = std::pin::pin!(reset_signal());

    loop {
        tokio::select! {
            _ = &mut sigterm => {
                info!("received shutdown signal");
                return Outcome::Shutdown;
            }
            _ = &mut sighup => {
                info!("received reset signal");
                return Outcome::Restart;
            }
            signal = control_rx.recv() => match signal {
                Some(ControlSignal::RestartDaemon) => return Outcome::Restart,
                Some(ControlSignal::ResetInterface) => {
                    info!("resetting interface");
                    if let Err(e) = device.configure(&reconcile::interface_config(state)).await {
                        error!(error = %e, "interface reset failed");
                        continue;
                    }
                    let peers = state.host().host_peers;
                    if let Err(e) = device.set_peers(&peers).await {
                        error!(error = %e, "peer reapply failed after reset");
                    }
                }
                None => return Outcome::Shutdown,
            },
        }
    }
}

async fn shutdown_tasks(mut tasks: JoinSet<()>) {
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_BUDGET, drain).await.is_err() {
        warn!("workers did not stop in time, aborting them");
        tasks.abort_all();
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

async fn reset_signal() {
    #[cfg(unix)]
    {
        let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .expect("failed to register SIGHUP handler");
        sighup.recv().await;
    }

    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}

/// PID file so `netclient reset` can signal the running daemon.
pub fn pid_path(store: &ConfigStore) -> std::path::PathBuf {
    store.dir().join("netclient.pid")
}

async fn write_pid_file(store: &ConfigStore) {
    let path = pid_path(store);
    let pid = std::process::id();
    if let Err(e) = tokio::fs::create_dir_all(store.dir()).await {
        warn!(error = %e, "could not create config dir for pid file");
        return;
    }
    if let Err(e) = tokio::fs::write(&path, serde_json::to_vec(&pid).unwrap_or_default()).await {
        warn!(path = %path.display(), error = %e, "could not write pid file");
    }
}

async fn remove_pid_file(store: &ConfigStore) {
    let _ = tokio::fs::remove_file(pid_path(store)).await;
}
