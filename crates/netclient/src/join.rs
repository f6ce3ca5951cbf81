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

use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use netclient_types::{Host, Node, PeerCfg, Server};

use crate::state::AgentState;

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("invalid enrollment token")]
    InvalidToken,

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("unauthorized (401) — token may be expired")]
    Unauthorized,
}

/// Contents of an enrollment token: base64 JSON handed out by the
/// controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterToken {
    pub api_url: String,
    pub server: String,
    pub key: String,
}

/// What the controller answers with on a successful registration.
#[derive(Debug, Deserialize)]
pub struct JoinResponse {
    pub server: Server,
    pub node: Node,
    #[serde(default)]
    pub peers: Vec<PeerCfg>,
}

pub fn decode_token(token: &str) -> Result<RegisterToken, JoinError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(token.trim())
        .map_err(|_| JoinError::InvalidToken)?;
    serde_json::from_slice(&raw).map_err(|_| JoinError::InvalidToken)
}

/// Register this host with the controller named in `token`.
pub async fn register(
    client: &Client,
    token: &RegisterToken,
    host: &Host,
) -> Result<JoinResponse, JoinError> {
    let url = format!(
        "{}/api/v1/host/register",
        token.api_url.trim_end_matches('/')
    );
    debug!(url = %url, server = %token.server, "registering host");

    let resp = client
        .post(&url)
        .bearer_auth(&token.key)
        .json(host)
        .send()
        .await?;

    let status = resp.status().as_u16();
    match status {
        200 => {
            let join: JoinResponse = resp.json().await?;
            info!(
                server = %join.server.name,
                network = %join.node.network,
                peer_count = join.peers.len(),
                "registered with server"
            );
            Ok(join)
        }
        401 => {
            warn!("registration returned 401 — token may be expired");
            Err(JoinError::Unauthorized)
        }
        _ => {
            let body = resp.text().await.unwrap_or_default();
            warn!(status, body = %body, "registration returned unexpected status");
            Err(JoinError::ServerError { status, body })
        }
    }
}

/// Persist the server and node records a successful registration returned.
pub async fn apply_join(state: &AgentState, join: JoinResponse) {
    let server_name = join.server.name.clone();
    let mut server = join.server;
    server.mq_id = state.host().id;
    server.nodes.insert(join.node.network.clone(), true);
    let mut node = join.node;
    node.server = server_name.clone();
    state.upsert_server(server);
    state.upsert_node(node);
    if !join.peers.is_empty() {
        state.set_server_peers(&server_name, join.peers);
    }
    state.persist_servers().await;
    state.persist_nodes().await;
    state.persist_host().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_base64_json() {
        let token = RegisterToken {
            api_url: "https://api.example.com".into(),
            server: "srv1".into(),
            key: "enroll-key".into(),
        };
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(&token).unwrap());
        let decoded = decode_token(&encoded).unwrap();
        assert_eq!(decoded.api_url, token.api_url);
        assert_eq!(decoded.server, token.server);
        assert_eq!(decoded.key, token.key);
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        assert!(matches!(
            decode_token("not-base64!!"),
            Err(JoinError::InvalidToken)
        ));
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"{}");
        assert!(matches!(
            decode_token(&encoded),
            Err(JoinError::InvalidToken)
        ));
    }
}
