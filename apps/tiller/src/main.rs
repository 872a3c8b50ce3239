mod cli;
mod console;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tiller_core::{Config, SessionSupervisor, SupervisorStatus, TelemetrySnapshot, WebRtcEngine};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use transport_bus::redis_bus::RedisBus;

#[tokio::main]
async fn main() -> Result<()> {
    // Missing .env is fine; the environment may already carry everything.
    let _ = dotenvy::dotenv();
    init_tracing()?;

    let cli = cli::Cli::parse();
    let mut config = Config::from_env().context("invalid TILLER_* configuration")?;
    cli.apply(&mut config)?;

    info!(
        vehicle = %config.vehicle_id,
        policy = ?config.initiation,
        ice_servers = config.ice_servers.len(),
        "starting tiller"
    );
    let bus = RedisBus::connect(&cli.redis_url)
        .with_context(|| format!("connecting rendezvous bus at {}", cli.redis_url))?;
    let (handle, supervisor) =
        SessionSupervisor::spawn(&config, Arc::new(bus), Arc::new(WebRtcEngine::new()));

    tokio::spawn(log_status(handle.status()));
    tokio::spawn(log_telemetry(handle.telemetry()));

    tokio::select! {
        result = console::run(handle.clone()) => result?,
        result = tokio::signal::ctrl_c() => {
            result.context("listening for ctrl-c")?;
            info!("interrupted");
        }
    }

    handle.shutdown();
    supervisor.await.context("supervisor task panicked")?;
    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| anyhow!(err))
}

async fn log_status(mut status: watch::Receiver<SupervisorStatus>) {
    while status.changed().await.is_ok() {
        let current = *status.borrow_and_update();
        info!(
            link = ?current.link,
            remote_online = current.remote_online,
            session = %current.session,
            attempt = current.attempt,
            control_open = current.data_channel_open,
            "status"
        );
    }
}

async fn log_telemetry(mut telemetry: watch::Receiver<Arc<TelemetrySnapshot>>) {
    while telemetry.changed().await.is_ok() {
        let snapshot = telemetry.borrow_and_update().clone();
        info!(
            voltage = %snapshot.boat_voltage,
            tacho = %snapshot.boat_tacho,
            battery = %snapshot.phone_battery,
            gps = %snapshot.phone_gps,
            signal = %snapshot.phone_signal,
            network = %snapshot.phone_network_type,
            compass = %snapshot.phone_compass,
            "telemetry"
        );
    }
}
