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

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use netclient::bus::{self, MqttBus};
use netclient::config::{self, ConfigStore};
use netclient::state::AgentState;
use netclient::{daemon, join};
use netclient_types::{format_name, HostAction};

const EXIT_OK: u8 = 0;
const EXIT_USER: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_NETWORK: u8 = 3;
const EXIT_DEVICE: u8 = 4;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "WireGuard overlay mesh agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install the agent binary and mark the daemon installed
    Install,
    /// Remove the installed binary and local configuration
    Uninstall,
    /// Run the agent daemon (init-system entrypoint)
    Daemon,
    /// Join a network using an enrollment token
    Join {
        /// Enrollment token from the controller
        token: String,
    },
    /// Leave a network
    Leave {
        /// Network name
        network: String,
    },
    /// Connect a joined network
    Connect {
        /// Network name
        network: String,
    },
    /// Disconnect a joined network without leaving it
    Disconnect {
        /// Network name
        network: String,
    },
    /// Register this host with a controller without joining a network
    Register {
        /// Enrollment token from the controller
        token: String,
    },
    /// Ask every server to re-push configuration
    Pull,
    /// List joined networks
    List,
    /// Signal the running daemon to reset
    Reset,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let store = ConfigStore::system();
    let version = env!("GIT_VERSION");

    let code = match cli.command {
        Command::Install => run_install(&store, version).await,
        Command::Uninstall => run_uninstall(&store).await,
        Command::Daemon => run_daemon(store, version).await,
        Command::Join { token } | Command::Register { token } => {
            run_join(&store, version, &token).await
        }
        Command::Leave { network } => run_leave(&store, &network).await,
        Command::Connect { network } => run_set_connected(&store, &network, true).await,
        Command::Disconnect { network } => run_set_connected(&store, &network, false).await,
        Command::Pull => run_pull(&store).await,
        Command::List => run_list(&store).await,
        Command::Reset => run_reset(&store).await,
    };
    ExitCode::from(code)
}

async fn run_daemon(store: ConfigStore, version: &str) -> u8 {
    match daemon::run(store, version).await {
        Ok(()) => EXIT_OK,
        Err(daemon::DaemonError::Config(e)) => {
            eprintln!("configuration invalid: {e}");
            EXIT_CONFIG
        }
        Err(daemon::DaemonError::Device(e)) => {
            eprintln!("wireguard device error: {e}");
            EXIT_DEVICE
        }
    }
}

/// Fresh-start bootstrap: generates the host identity, writes
/// `netclient.yml`, and copies the binary into place.
async fn run_install(store: &ConfigStore, version: &str) -> u8 {
    let state = match AgentState::load(store.clone()).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cannot read configuration: {e}");
            return EXIT_CONFIG;
        }
    };
    state.update_host(|host| {
        config::ensure_host_defaults(host, version);
        host.daemon_installed = true;
    });
    if let Err(e) = store.write_host(&state.host()).await {
        eprintln!("cannot write configuration: {e}");
        return EXIT_CONFIG;
    }

    let source = match std::env::current_exe() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("cannot locate running binary: {e}");
            return EXIT_USER;
        }
    };
    let destination = store.install_path();
    if source == destination {
        eprintln!("refusing to reinstall netclient on top of itself");
        return EXIT_USER;
    }
    if let Err(e) = tokio::fs::copy(&source, &destination).await {
        eprintln!("cannot install binary to {}: {e}", destination.display());
        return EXIT_USER;
    }
    info!(destination = %destination.display(), "installed netclient");
    EXIT_OK
}

async fn run_uninstall(store: &ConfigStore) -> u8 {
    let destination = store.install_path();
    let _ = tokio::fs::remove_file(&destination).await;
    if let Err(e) = tokio::fs::remove_dir_all(store.dir()).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            eprintln!("cannot remove configuration: {e}");
            return EXIT_CONFIG;
        }
    }
    info!("uninstalled netclient");
    EXIT_OK
}

async fn run_join(store: &ConfigStore, version: &str, token: &str) -> u8 {
    let token = match join::decode_token(token) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("{e}");
            return EXIT_USER;
        }
    };
    let state = match AgentState::load(store.clone()).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cannot read configuration: {e}");
            return EXIT_CONFIG;
        }
    };
    let changed = state.update_host(|host| config::ensure_host_defaults(host, version));
    if changed {
        state.persist_host().await;
    }

    let client = reqwest::Client::new();
    match join::register(&client, &token, &state.host()).await {
        Ok(response) => {
            let network = response.node.network.clone();
            join::apply_join(&state, response).await;
            println!("joined network {network} on server {}", token.server);
            println!("restart the daemon to apply");
            EXIT_OK
        }
        Err(e) => {
            eprintln!("registration failed: {e}");
            EXIT_NETWORK
        }
    }
}

async fn run_leave(store: &ConfigStore, network: &str) -> u8 {
    let network = format_name(network);
    let state = match AgentState::load(store.clone()).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cannot read configuration: {e}");
            return EXIT_CONFIG;
        }
    };
    let Some(node) = state.remove_node(&network) else {
        eprintln!("not joined to network {network}");
        return EXIT_USER;
    };
    if let Some(mut server) = state.server(&node.server) {
        server.nodes.remove(&network);
        state.upsert_server(server);
    }
    state.persist_nodes().await;
    state.persist_servers().await;
    println!("left network {network}");
    println!("restart the daemon to apply");
    EXIT_OK
}

async fn run_set_connected(store: &ConfigStore, network: &str, connected: bool) -> u8 {
    let network = format_name(network);
    let state = match AgentState::load(store.clone()).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cannot read configuration: {e}");
            return EXIT_CONFIG;
        }
    };
    let Some(mut node) = state.node(&network) else {
        eprintln!("not joined to network {network}");
        return EXIT_USER;
    };
    node.connected = connected;
    state.upsert_node(node);
    state.persist_nodes().await;
    println!(
        "{} network {network}; restart the daemon to apply",
        if connected { "connected" } else { "disconnected" }
    );
    EXIT_OK
}

/// Publish an update request to each server so it re-pushes peers and
/// config.
async fn run_pull(store: &ConfigStore) -> u8 {
    let state = match AgentState::load(store.clone()).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cannot read configuration: {e}");
            return EXIT_CONFIG;
        }
    };
    let host = state.host();
    let servers = state.servers();
    if servers.is_empty() {
        eprintln!("no servers configured");
        return EXIT_USER;
    }

    let cancel = CancellationToken::new();
    let mut failures = 0usize;
    for server in servers.values() {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let mqtt = MqttBus::connect(
            host.id,
            host.traffic_key_private.clone(),
            server,
            tx,
            cancel.clone(),
        );
        // Give the client a beat to reach the broker before publishing.
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        match bus::publish_host_signal(
            &mqtt,
            host.id,
            &host.traffic_key_private,
            server,
            HostAction::Update,
        )
        .await
        {
            Ok(()) => println!("requested config from {}", server.name),
            Err(e) => {
                eprintln!("could not reach {}: {e}", server.name);
                failures += 1;
            }
        }
    }
    cancel.cancel();
    if failures == servers.len() {
        EXIT_NETWORK
    } else {
        EXIT_OK
    }
}

async fn run_list(store: &ConfigStore) -> u8 {
    let state = match AgentState::load(store.clone()).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cannot read configuration: {e}");
            return EXIT_CONFIG;
        }
    };
    let nodes = state.nodes();
    if nodes.is_empty() {
        println!("no joined networks");
        return EXIT_OK;
    }
    for (network, node) in nodes {
        println!(
            "{network}: server={} address={} connected={}",
            node.server,
            node.address.as_deref().unwrap_or("-"),
            node.connected,
        );
    }
    EXIT_OK
}

/// Send SIGHUP to the running daemon via its pid file.
async fn run_reset(store: &ConfigStore) -> u8 {
    let path = daemon::pid_path(store);
    let pid: u32 = match tokio::fs::read(&path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(pid) => pid,
            Err(_) => {
                eprintln!("pid file {} is corrupt", path.display());
                return EXIT_CONFIG;
            }
        },
        Err(_) => {
            eprintln!("daemon does not appear to be running");
            return EXIT_USER;
        }
    };

    #[cfg(unix)]
    {
        match tokio::process::Command::new("kill")
            .args(["-HUP", &pid.to_string()])
            .status()
            .await
        {
            Ok(status) if status.success() => {
                println!("reset signal sent to daemon (pid {pid})");
                EXIT_OK
            }
            Ok(_) | Err(_) => {
                error!(pid, "failed to signal daemon");
                eprintln!("failed to signal daemon (pid {pid})");
                EXIT_USER
            }
        }
    }

    #[cfg(not(unix))]
    {
        eprintln!("reset is not supported on this platform (pid {pid})");
        EXIT_USER
    }
}
