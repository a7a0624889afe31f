//! Field Datalogger - Main Entry Point
//!
//! Two modes:
//!   `datalogger discover` identifies the protocol, scans for responding
//!   PIDs and writes a discovery report.
//!   `datalogger capture` (the default) runs the full scenario plan against
//!   the discovered PID set.

mod gate;
mod settings;

use crate::gate::StdinGate;
use crate::settings::Settings;
use anyhow::Context;
use ecu_connection::ConnectionManager;
use obd_transport::{standard_registry, Elm327Transport};
use pid_discovery::PidDiscovery;
use scenario_capture::{ScenarioScheduler, ScenarioSpec};
use session_recorder::SessionRecorder;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    info!("=== Field Datalogger v{} ===", env!("CARGO_PKG_VERSION"));

    let mode = std::env::args().nth(1).unwrap_or_else(|| "capture".to_string());
    let settings = Settings::load(None).context("loading configuration")?;
    info!(
        %mode,
        port = %settings.port,
        data_dir = %settings.data_dir.display(),
        "configured"
    );

    let manager = Arc::new(ConnectionManager::new(
        Box::new(Elm327Transport::new()),
        settings.connection_config(),
    ));
    let connection = manager
        .connect()
        .await
        .context("initial ECU connection failed")?;
    info!(
        protocol = %connection.protocol.name,
        ecus = connection.protocol.ecu_count,
        "ECU connected"
    );

    let maintenance = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.maintain_connection().await })
    };

    let recorder = SessionRecorder::new(&settings.data_dir);
    let result = match mode.as_str() {
        "discover" => run_discovery(&manager, &settings, &recorder).await,
        "capture" => run_capture(&manager, &settings, recorder).await,
        other => Err(anyhow::anyhow!(
            "unknown mode {other:?}; expected \"discover\" or \"capture\""
        )),
    };

    manager.disconnect().await;
    maintenance.await.ok();
    result
}

fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

async fn run_discovery(
    manager: &ConnectionManager,
    settings: &Settings,
    recorder: &SessionRecorder,
) -> anyhow::Result<()> {
    let discovery = PidDiscovery::new(settings.discovery_options());
    let report = discovery.discover(manager).await;
    if report.partial {
        warn!("connection lost during the scan; report is partial");
    }

    let (json_path, summary_path) = recorder
        .write_discovery(&report)
        .context("writing discovery report")?;
    info!(
        responding = report.responding_standard.len(),
        manufacturer = report.manufacturer_candidates.len(),
        report = %json_path.display(),
        summary = %summary_path.display(),
        "discovery complete"
    );
    Ok(())
}

async fn run_capture(
    manager: &ConnectionManager,
    settings: &Settings,
    mut recorder: SessionRecorder,
) -> anyhow::Result<()> {
    // Scan first so the session monitors exactly what this ECU answers
    let discovery = PidDiscovery::new(settings.discovery_options());
    let report = discovery.discover(manager).await;
    recorder
        .write_discovery(&report)
        .context("writing discovery report")?;

    let pid_set = report.monitored_set(&standard_registry());
    if pid_set.is_empty() {
        anyhow::bail!("no responding parameters found; nothing to capture");
    }
    info!(pids = pid_set.len(), "monitored set selected");

    // Ctrl+C finalizes the current scenario and flushes everything captured
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current tick");
            let _ = stop_tx.send(true);
        }
    });

    let scheduler = ScenarioScheduler::new(settings.capture_options());
    let mut gate = StdinGate;
    let metadata = scheduler
        .run_session(
            manager,
            &pid_set,
            &ScenarioSpec::standard_plan(),
            &mut gate,
            &mut recorder,
            stop_rx,
        )
        .await;

    info!(
        session = %metadata.session_id,
        scenarios = metadata.scenarios.len(),
        samples = metadata.stats.total_samples,
        failed = metadata.stats.failed_samples,
        reconnections = metadata.stats.reconnections,
        output = %recorder.session_dir().display(),
        "session complete"
    );
    Ok(())
}
