mod config;
mod controller;
mod decision;
mod devices;
mod state;
mod store;
mod web;

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::MisterConfig;
use controller::Controller;
use devices::{SimSensor, SimValve};
use store::StateStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config = MisterConfig::from_env();
    config.validate()?;
    info!(
        temp_high_f = config.temp_high_f,
        temp_low_f = config.temp_low_f,
        humidity_low_pct = config.humidity_low_pct,
        humidity_high_pct = config.humidity_high_pct,
        mist_duration_sec = config.mist_duration_sec,
        check_interval_sec = config.check_interval_sec,
        cooldown_sec = config.cooldown_sec,
        "configuration loaded"
    );

    // ── Persisted state ─────────────────────────────────────────────
    let store = StateStore::new(config.state_file.clone());
    let mut persisted = store.load();
    store.mark_running(&mut persisted);

    // ── Devices ─────────────────────────────────────────────────────
    // Simulators for now; real sensor/valve clients plug in behind the
    // same traits.
    let sensor = Arc::new(SimSensor::from_env());
    let valve = Arc::new(SimValve::new());

    // ── Controller ──────────────────────────────────────────────────
    let controller = Arc::new(Controller::new(config, store, persisted, sensor, valve));
    if let Err(e) = controller.start_on_boot().await {
        error!(error = %e, "failed to start evaluation loop");
    }

    // ── Web control surface ─────────────────────────────────────────
    let web_controller = Arc::clone(&controller);
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_controller).await {
            error!(error = %e, "control surface failed");
        }
    });

    // ── Run until signalled ─────────────────────────────────────────
    wait_for_signal().await;
    controller.shutdown().await;
    info!("exited cleanly");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                _ = term.recv() => info!("terminate received"),
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM, handling interrupt only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for interrupt");
    }
}
