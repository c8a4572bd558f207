//! Peercall CLI Application

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use peercall_core::prelude::*;
use peercall_core::NegotiatorFactory;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "PEERCALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a call between two in-process clients sharing a memory store
    Demo {
        /// Call mode
        #[arg(long, default_value = "video")]
        mode: CallMode,

        /// Connection transport
        #[arg(long, value_enum, default_value = "loopback")]
        transport: TransportKind,

        /// Switch the caller's camera once connected
        #[arg(long)]
        switch_camera: bool,

        /// Side that hangs up
        #[arg(long, value_enum, default_value = "caller")]
        hangup_from: Side,

        /// How long to stay connected, in milliseconds
        #[arg(long, default_value = "500")]
        hold_ms: u64,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TransportKind {
    /// In-process simulated connection
    Loopback,
    /// Real WebRTC peer connections over localhost
    Webrtc,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Side {
    Caller,
    Callee,
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("peercall=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Demo {
            mode,
            transport,
            switch_camera,
            hangup_from,
            hold_ms,
        } => {
            run_demo(
                config,
                mode,
                transport,
                switch_camera,
                hangup_from,
                Duration::from_millis(hold_ms),
            )
            .await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<CallConfig> {
    let Some(path) = path else {
        return Ok(CallConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    CallConfig::from_json_str(&json).with_context(|| format!("parsing config {}", path.display()))
}

fn transport(kind: TransportKind) -> Result<Arc<dyn NegotiatorFactory>> {
    match kind {
        TransportKind::Loopback => Ok(Arc::new(LoopbackTransport::new())),
        #[cfg(feature = "webrtc-transport")]
        TransportKind::Webrtc => Ok(Arc::new(WebRtcTransport::new())),
        #[cfg(not(feature = "webrtc-transport"))]
        TransportKind::Webrtc => bail!("built without the webrtc-transport feature"),
    }
}

async fn start_client(
    config: &CallConfig,
    store: Arc<MemoryStore>,
    kind: TransportKind,
    identity: Identity,
) -> Result<CallService> {
    let label = identity.id.to_string();
    let service = CallService::builder()
        .with_config(config.clone())
        .with_identity(Arc::new(StaticIdentity(identity)))
        .with_store(store)
        .with_transport(transport(kind)?)
        .with_capture(Arc::new(SimulatedCamera::labeled(label)))
        .start()
        .await?;

    let name = service.local_identity().display_name.clone();
    let mut events = service.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&name, &event);
        }
    });
    Ok(service)
}

fn print_event(name: &str, event: &CallEvent) {
    match event {
        CallEvent::StateChanged { state } => println!("[{name}] state: {state}"),
        CallEvent::CallerInfo { identity, mode } => {
            println!("[{name}] {mode} call with {identity}");
        }
        CallEvent::RemoteStream { stream } => {
            println!("[{name}] remote {:?} stream {}", stream.kind, stream.id);
        }
        CallEvent::CallFailed { error } => println!("[{name}] call failed: {error}"),
        CallEvent::CallEnded { session_id, reason } => {
            let id = session_id.as_ref().map(ToString::to_string).unwrap_or_default();
            println!("[{name}] call {id} ended: {reason:?}");
        }
    }
}

async fn wait_for(mut state: watch::Receiver<CallState>, target: CallState) -> Result<()> {
    timeout(CONNECT_TIMEOUT, state.wait_for(|s| *s == target))
        .await
        .with_context(|| format!("timed out waiting for {target}"))?
        .context("call manager stopped")?;
    Ok(())
}

async fn run_demo(
    config: CallConfig,
    mode: CallMode,
    kind: TransportKind,
    switch_camera: bool,
    hangup_from: Side,
    hold: Duration,
) -> Result<()> {
    tracing::info!(transport = ?kind, %mode, "Starting demo call");
    let store = Arc::new(MemoryStore::new());
    let alice_id = Identity::new("alice", "Alice");
    let bob_id = Identity::new("bob", "Bob");

    let alice = start_client(&config, store.clone(), kind, alice_id.clone()).await?;
    let bob = start_client(&config, store.clone(), kind, bob_id.clone()).await?;
    let directory = StaticDirectory::new(alice_id.id.clone(), vec![alice_id, bob_id.clone()]);

    let session_id = alice.call_peer(&directory, &bob_id.id, mode).await?;
    println!("Placed {mode} call {session_id}");

    wait_for(bob.controller().watch_state(), CallState::Connected).await?;
    wait_for(alice.controller().watch_state(), CallState::Connected).await?;
    println!("Both sides connected");

    if switch_camera {
        match alice.controller().switch_camera().await? {
            CameraSwitch::Switched(facing) => println!("Caller switched to {facing:?} camera"),
            CameraSwitch::Skipped => println!("Caller has no active camera to switch"),
        }
    }

    tokio::time::sleep(hold).await;

    let (ending, other) = match hangup_from {
        Side::Caller => (&alice, &bob),
        Side::Callee => (&bob, &alice),
    };
    ending.controller().end_call().await?;
    wait_for(other.controller().watch_state(), CallState::Idle).await?;

    alice.shutdown().await?;
    bob.shutdown().await?;

    let leftover = store.total_documents();
    tracing::debug!(leftover, "Demo clients shut down");
    if leftover != 0 {
        bail!("{leftover} signaling documents left behind");
    }
    println!("Signaling store is clean");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_demo() {
        let cli = Cli::try_parse_from([
            "peercall",
            "demo",
            "--mode",
            "audio",
            "--switch-camera",
            "--hangup-from",
            "callee",
        ])
        .unwrap();
        match cli.command {
            Commands::Demo {
                mode,
                transport,
                switch_camera,
                hangup_from,
                hold_ms,
            } => {
                assert_eq!(mode, CallMode::Audio);
                assert!(matches!(transport, TransportKind::Loopback));
                assert!(switch_camera);
                assert!(matches!(hangup_from, Side::Callee));
                assert_eq!(hold_ms, 500);
            }
            Commands::Config => panic!("expected demo"),
        }
    }

    #[test]
    fn test_default_config_without_path() {
        let config = load_config(None).unwrap();
        assert_eq!(config.ice_servers, CallConfig::default().ice_servers);
    }

    #[tokio::test]
    async fn test_loopback_demo_runs_clean() {
        run_demo(
            CallConfig::default(),
            CallMode::Video,
            TransportKind::Loopback,
            true,
            Side::Callee,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
    }
}
