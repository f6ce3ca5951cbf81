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

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use netclient_types::{ProxyAction, ProxyPayload, ProxyPeerMeta};

use crate::engine::{effective_remote, PeerEndpointAssignment, ProxyEngine};

/// Consume peer-list payloads from the reconciler and converge the engine's
/// forwarder set; every assignment of a loopback endpoint is reported on
/// `assignments_tx` so the caller can update the WG device.
///
/// Payloads for one server arrive in order on the channel; applying them
/// serially here is what guarantees Update/Remove never overtake an
/// outstanding Add for the same peer.
pub async fn run_manager(
    engine: Arc<ProxyEngine>,
    mut payloads: mpsc::Receiver<ProxyPayload>,
    assignments_tx: mpsc::Sender<PeerEndpointAssignment>,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = payloads.recv() => match msg {
                Some(p) => p,
                None => break,
            },
        };
        apply_payload(&engine, &payload, &assignments_tx).await;
    }
    debug!("proxy manager stopped");
}

async fn apply_payload(
    engine: &ProxyEngine,
    payload: &ProxyPayload,
    assignments_tx: &mpsc::Sender<PeerEndpointAssignment>,
) {
    match payload.action {
        ProxyAction::DeleteAll => {
            info!(server = %payload.server, "removing all proxied peers");
            engine.remove_all().await;
        }
        ProxyAction::NoProxy => {
            // Proxying disabled for this host: tear down forwarders and let
            // the device keep the peers' direct endpoints.
            info!(server = %payload.server, "proxy disabled, releasing forwarders");
            for peer in &payload.peers {
                engine.remove_peer(&payload.server, &peer.public_key).await;
            }
        }
        ProxyAction::Update => {
            apply_update(engine, payload, assignments_tx).await;
        }
    }
}

async fn apply_update(
    engine: &ProxyEngine,
    payload: &ProxyPayload,
    assignments_tx: &mpsc::Sender<PeerEndpointAssignment>,
) {
    for peer in &payload.peers {
        if peer.remove {
            engine.remove_peer(&payload.server, &peer.public_key).await;
            continue;
        }
        let meta = payload
            .peer_meta
            .get(&peer.public_key)
            .cloned()
            .unwrap_or_else(|| ProxyPeerMeta {
                is_relayed: peer.is_relayed,
                relay_to: peer.relay_to,
            });

        match engine.peer_endpoint(&peer.public_key).await {
            Some(_) => {
                // Already proxied: a changed true endpoint redirects the
                // running forwarder in place.
                match effective_remote(peer, &meta) {
                    Ok(remote) => {
                        if let Err(e) = engine.update_peer(&peer.public_key, remote).await {
                            warn!(peer = %peer.public_key, error = %e, "failed to redirect forwarder");
                        }
                    }
                    Err(e) => {
                        warn!(peer = %peer.public_key, error = %e, "cannot resolve peer remote");
                    }
                }
            }
            None => match engine.add_peer(&payload.server, peer, &meta).await {
                Ok(local) => {
                    let assignment = PeerEndpointAssignment {
                        key: peer.public_key.clone(),
                        endpoint: local,
                    };
                    if assignments_tx.send(assignment).await.is_err() {
                        warn!("assignment channel closed");
                        return;
                    }
                }
                Err(e) => {
                    warn!(peer = %peer.public_key, error = %e, "failed to start forwarder");
                }
            },
        }
    }
}
