//! Terminal front-end for the CrowdIQ live camera session:
//!   connect     → persist a camera as the active session
//!   watch       → resume the persisted session and follow its live stream
//!   start/stop  → drive inference on the control plane
//!   disconnect  → clear the persisted session

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info};

use crowdiq_session::{
    ActiveCamera, ConnectionState, ControlPlane, HttpControlPlane, JsonFileStore, SessionStatus,
    SessionStore, SessionSupervisor, StopOutcome, WsTransport,
};

#[derive(Parser)]
#[command(
    name = "crowdiq-monitor",
    about = "Live camera session client for the CrowdIQ inference backend"
)]
struct Cli {
    /// Control-plane base URL of the inference backend
    #[arg(long, default_value = "http://localhost:8000")]
    api_url: String,

    /// Websocket base URL of the inference backend
    #[arg(long, default_value = "ws://localhost:8000")]
    ws_url: String,

    /// Path of the persisted session file
    #[arg(long, default_value = "crowdiq-session.json")]
    session_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Select a camera and persist it as the active session
    Connect {
        #[arg(long)]
        camera_id: String,
        /// Stream address the backend should pull from, or "local"
        #[arg(long)]
        source: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        location: Option<String>,
    },
    /// Resume the persisted session and supervise its live stream
    Watch,
    /// Start inference for the active camera
    Start {
        #[arg(long)]
        user_id: String,
    },
    /// Stop inference for the active camera
    Stop,
    /// Clear the persisted session
    Disconnect,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let store = JsonFileStore::new(&cli.session_file);

    match &cli.command {
        Command::Connect {
            camera_id,
            source,
            name,
            location,
        } => {
            let mut camera = ActiveCamera::new(camera_id.clone(), source.clone());
            camera.name = name.clone();
            camera.location = location.clone();
            store.save_active(&camera)?;
            println!("camera {} is now the active session", camera.camera_id);
        }
        Command::Watch => watch(&cli, store).await?,
        Command::Start { user_id } => {
            let camera = active(&store)?;
            let control = HttpControlPlane::new(&cli.api_url);
            let message = control
                .start_inference(user_id, &camera.camera_id, &camera.source_uri)
                .await?;
            store.set_inference_started(&camera.camera_id)?;
            println!("{message}");
        }
        Command::Stop => {
            let camera = active(&store)?;
            let control = HttpControlPlane::new(&cli.api_url);
            match control.stop_inference(&camera.camera_id).await? {
                StopOutcome::Stopped(message) => println!("{message}"),
                StopOutcome::NotRunning => {
                    println!("inference was not running; ready to start")
                }
            }
            store.clear_inference_started(&camera.camera_id)?;
        }
        Command::Disconnect => {
            if let Some(camera) = store.load_active() {
                store.clear_inference_started(&camera.camera_id)?;
            }
            store.clear_active()?;
            println!("active session cleared");
        }
    }
    Ok(())
}

fn active(store: &JsonFileStore) -> Result<ActiveCamera> {
    store
        .load_active()
        .context("no active camera; run `connect` first")
}

async fn watch(cli: &Cli, store: JsonFileStore) -> Result<()> {
    let Some(camera) = store.load_active() else {
        println!("no active camera; run `connect` first");
        return Ok(());
    };
    if store.inference_started(&camera.camera_id) {
        info!(
            "inference was running for {} before last shutdown; resuming supervision",
            camera.camera_id
        );
    }

    let handle = SessionSupervisor::spawn(
        Arc::new(WsTransport::new(&cli.ws_url)),
        Arc::new(HttpControlPlane::new(&cli.api_url)),
        Arc::new(store),
    );
    handle.start(camera)?;

    let mut status = handle.status();
    let mut frames = handle.frames();
    let mut frame_count: u64 = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                handle.shutdown();
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                println!("[session] {}", describe(&snapshot));
            }
            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
                let Some(frame) = frames.borrow_and_update().clone() else {
                    continue;
                };
                frame_count += 1;
                if frame_count % 30 == 0 {
                    info!(
                        "{frame_count} frames received (latest {} bytes)",
                        frame.payload.len()
                    );
                } else {
                    debug!("frame {frame_count} ({} bytes)", frame.payload.len());
                }
            }
        }
    }

    handle.join().await;
    Ok(())
}

fn describe(status: &SessionStatus) -> String {
    match (status.state, &status.error) {
        (ConnectionState::Disconnected, Some(reason)) => reason.clone(),
        (ConnectionState::Disconnected, None) => "disconnected".into(),
        (ConnectionState::Validating, _) => "validating stream...".into(),
        (ConnectionState::Connecting, _) => "connecting...".into(),
        (ConnectionState::Connected, _) => "connected".into(),
        (ConnectionState::Reconciling, _) => {
            "connected (no recent frames, checking inference status)".into()
        }
        (ConnectionState::Failed, Some(reason)) => format!("failed: {reason}"),
        (ConnectionState::Failed, None) => "failed".into(),
    }
}
