//! Voice loopback tool
//!
//! Runs a listen-server and a client in one process, connected by an
//! in-memory transport. The client captures the microphone and the server
//! plays what it receives, so you hear yourself through the whole pipeline:
//! VAD, Opus, batching, handshake, routing, jitter buffer and mixer.
//!
//! Usage: voice-loopback [config.toml]

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ingame_voice::{
    audio::{list_devices, CpalBackend, DeviceChoice},
    config::VoiceConfig,
    mixer::Position,
    network::{ConnectionId, MemoryTransport, Outbound, StaticRoster},
    session::{Role, SessionEvent, SessionManager},
};

const SERVER_PLAYER: u32 = 1;
const CLIENT_PLAYER: u32 = 2;

/// Connection the client uses to reach the server
const TO_SERVER: ConnectionId = ConnectionId(0);
/// Connection the server sees the client on
const TO_CLIENT: ConnectionId = ConnectionId(1);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting voice loopback");

    let config = match std::env::args().nth(1) {
        Some(path) => {
            VoiceConfig::load(Path::new(&path)).with_context(|| format!("loading {}", path))?
        }
        None => VoiceConfig::load_default()?,
    };

    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}", device.name, device_type, default_marker);
    }
    println!();

    let server_roster = Arc::new(roster(SERVER_PLAYER));
    server_roster.map_connection(TO_CLIENT, CLIENT_PLAYER);
    let client_roster = Arc::new(roster(CLIENT_PLAYER));

    let gate = Arc::new(AtomicBool::new(true));

    // Server only listens, client only talks
    let server_backend = Arc::new(CpalBackend::new(
        DeviceChoice::Disabled,
        config.capture.output_device.clone().into(),
    ));
    let client_backend = Arc::new(CpalBackend::new(
        config.capture.input_device.clone().into(),
        DeviceChoice::Disabled,
    ));

    let (server_transport, server_out) = MemoryTransport::new(None, true);
    let (client_transport, client_out) = MemoryTransport::new(Some(TO_SERVER), true);

    let server = SessionManager::new(
        config.clone(),
        server_backend,
        Arc::new(server_transport),
        server_roster,
        gate.clone(),
    );
    let client = SessionManager::new(
        config,
        client_backend,
        Arc::new(client_transport),
        client_roster,
        gate,
    );

    server.on_network_started(Role::ListenServer);
    client.on_network_started(Role::Client);
    server.set_enabled(true);
    client.set_enabled(true);
    server.on_connection_opened(TO_CLIENT);

    let events = [("server", server.events()), ("client", client.events())];

    tracing::info!("Speak into the microphone - press Ctrl+C to stop");

    let mut ticker = tokio::time::interval(Duration::from_millis(10));
    let mut last_tick = Instant::now();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {}
        }

        // Server messages all go to the one client and vice versa
        for Outbound { bytes, .. } in server_out.try_iter() {
            client.handle_packet(TO_SERVER, &bytes);
        }
        for Outbound { bytes, .. } in client_out.try_iter() {
            server.handle_packet(TO_CLIENT, &bytes);
        }

        for (side, rx) in &events {
            for event in rx.try_iter() {
                match event {
                    SessionEvent::Notice(notice) => tracing::warn!("[{}] {}", side, notice),
                    other => tracing::info!("[{}] {:?}", side, other),
                }
            }
        }

        let now = Instant::now();
        if now.duration_since(last_tick) >= Duration::from_millis(100) {
            last_tick = now;
            server.tick(now);
            client.tick(now);

            if let Some(stats) = server.mixer().and_then(|m| m.peer_stats(CLIENT_PLAYER)) {
                tracing::debug!(
                    "mic {:.0} | jitter level {} target {} underruns {} stale {}",
                    client.input_level(),
                    stats.level,
                    stats.target,
                    stats.underruns,
                    stats.stale
                );
            }
        }
    }

    tracing::info!("Shutting down");
    client.set_enabled(false);
    server.set_enabled(false);
    client.on_network_stopped();
    server.on_network_stopped();
    Ok(())
}

/// Both players on one team, the client a little to the listener's right so
/// panning is audible
fn roster(local: u32) -> StaticRoster {
    let roster = StaticRoster::new();
    roster.add_player(SERVER_PLAYER, 0);
    roster.add_player(CLIENT_PLAYER, 0);
    roster.set_position(SERVER_PLAYER, Some(Position::new(0.0, 0.0)));
    roster.set_position(CLIENT_PLAYER, Some(Position::new(200.0, 0.0)));
    roster.set_local(local);
    roster
}
