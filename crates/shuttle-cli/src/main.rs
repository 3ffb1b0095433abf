// SPDX-License-Identifier: AGPL-3.0
// LAN Shuttle CLI - Main entry point
//
// Runs the engine as a process: send files under a fresh code, receive by
// code, or host a rendezvous relay. Session events are printed as log lines.

use clap::{Parser, Subcommand};
use shuttle_core::{
    EngineConfig, EngineOptions, RelayServer, SessionEvent, SessionId, SessionState,
    SettingsStore, Severity, ShuttleEngine, ShuttleError, ShuttleResult, TransferHistory,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "lan-shuttle")]
#[command(about = "Send files across the local network with a short transfer code")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Rendezvous relay used when discovery finds nothing
    #[arg(long, global = true)]
    relay: Option<SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Issue a code and serve the given files to whoever enters it
    Send {
        #[arg(required = true, help = "Files to send")]
        files: Vec<PathBuf>,

        /// TCP port for the incoming link
        #[arg(long)]
        port: Option<u16>,
    },
    /// Receive the transfer behind a code
    Receive {
        code: String,

        /// Where to save received files
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Run a rendezvous relay for peers on different networks
    Relay {
        #[arg(long, default_value = "0.0.0.0:50001")]
        listen: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("shuttle_core=info".parse().unwrap())
                .add_directive("shuttle_cli=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the command finished successfully
async fn run(cli: Cli) -> ShuttleResult<bool> {
    if let Command::Relay { listen } = cli.command {
        run_relay(listen).await?;
        return Ok(true);
    }

    let store = match &cli.settings {
        Some(path) => SettingsStore::with_path(path)?,
        None => SettingsStore::new()?,
    };
    let mut settings = store.get();
    if cli.relay.is_some() {
        settings.relay_addr = cli.relay;
    }

    let history = match TransferHistory::new() {
        Ok(h) => Some(Arc::new(h)),
        Err(e) => {
            tracing::warn!("Transfer history disabled: {}", e);
            None
        }
    };
    let options = EngineOptions {
        dialer: None,
        history,
    };

    match cli.command {
        Command::Send { files, port } => {
            if let Some(port) = port {
                settings.port = port;
            }
            let engine = ShuttleEngine::start_with(settings.to_engine_config(), options).await?;
            let issued = engine.issue_transfer(&files).await?;

            println!(
                "Sending {} file(s), {} bytes",
                issued.files.len(),
                issued.total_bytes
            );
            println!("Transfer code: {}", issued.code);

            let ok = follow(&engine, issued.session_id).await?;
            engine.shutdown().await;
            Ok(ok)
        }
        Command::Receive { code, dir } => {
            if let Some(dir) = dir {
                settings.download_dir = dir;
            }
            // The receiver never accepts links, so it must not hold the
            // sender's ports on a shared host.
            let config = EngineConfig {
                listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                discovery_bind: None,
                ..settings.to_engine_config()
            };
            let engine = ShuttleEngine::start_with(config, options).await?;
            let session_id = engine.join_transfer(&code).await?;
            println!("Saving into {}", settings.download_dir.display());

            let ok = follow(&engine, session_id).await?;
            engine.shutdown().await;
            Ok(ok)
        }
        Command::Relay { .. } => Ok(true),
    }
}

/// Print session events until the session ends. Ctrl-C stops the transfer.
async fn follow(engine: &ShuttleEngine, session_id: SessionId) -> ShuttleResult<bool> {
    let events = engine.events(session_id)?;
    let mut last_percent = -1i64;

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                engine.stop_transfer(session_id)?;
                continue;
            }
            event = events.recv() => match event {
                Ok(e) => e,
                Err(_) => break,
            },
        };

        match event {
            SessionEvent::Log { event } => {
                let tag = match event.severity {
                    Severity::Info => "info",
                    Severity::Success => "done",
                    Severity::Error => "error",
                };
                println!(
                    "{} [{}] {}",
                    event.timestamp.format("%H:%M:%S"),
                    tag,
                    event.message
                );
            }
            SessionEvent::Progress { snapshot } => {
                let percent = snapshot.percentage.floor() as i64;
                if percent != last_percent && snapshot.total_bytes > 0 {
                    last_percent = percent;
                    let eta = snapshot
                        .eta_seconds
                        .map(|s| format!("{:.0}s", s))
                        .unwrap_or_else(|| "--".to_string());
                    println!(
                        "  {:>3}%  {:.2} MB/s  ETA {}",
                        percent,
                        snapshot.speed_mbps(),
                        eta
                    );
                }
            }
            SessionEvent::StateChanged { to, .. } if to.is_terminal() => {
                // The matching log line is delivered right after the transition.
                if let Ok(SessionEvent::Log { event }) = events.recv().await {
                    println!("{} {}", event.timestamp.format("%H:%M:%S"), event.message);
                }
                return Ok(to == SessionState::Complete);
            }
            SessionEvent::StateChanged { .. } => {}
        }
    }

    let info = engine.session(session_id)?;
    Ok(info.state == SessionState::Complete)
}

async fn run_relay(listen: SocketAddr) -> ShuttleResult<()> {
    let relay = RelayServer::bind(listen).await?;
    println!("Relay listening on {}", relay.local_addr());

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ShuttleError::Network(format!("Failed to wait for Ctrl-C: {}", e)))?;
    relay.stop().await;
    Ok(())
}
