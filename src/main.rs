use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use vroom_server::{JwtAuthGate, ServerConfig, ServerDeps};
use vroom_store::{Database, RoomRepo, StoreStateProvider};
use vroom_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(name = "vroom", about = "Virtual-room session broadcast server")]
struct Cli {
    /// Settings file (defaults to ~/.vroom/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen port, overriding settings and VROOM_PORT.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = cli.config.unwrap_or_else(vroom_server::settings_path);
    let mut settings = vroom_server::load_settings_from_path(&path)
        .with_context(|| format!("loading settings from {}", path.display()))?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    settings.validate()?;

    let (log_level, module_levels) = settings.logging.levels()?;
    let telemetry = init_telemetry(TelemetryConfig {
        log_level,
        module_levels,
        format: settings.logging.format,
    });

    tracing::info!(settings = %path.display(), "starting vroom server");

    let db = Database::open(&settings.database.path)
        .with_context(|| format!("opening database {}", settings.database.path.display()))?;

    let deps = ServerDeps {
        auth: Arc::new(JwtAuthGate::new(
            &settings.auth.jwt_secret,
            settings.auth.issuer.as_deref(),
            settings.auth.leeway_secs,
        )),
        sessions: Arc::new(RoomRepo::new(db.clone())),
        provider: Arc::new(StoreStateProvider::new(db)),
        metrics: telemetry.metrics(),
    };

    let handle = vroom_server::start(ServerConfig::from_settings(&settings), deps)
        .await
        .context("starting server")?;
    tracing::info!(port = handle.port, "vroom server ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;

    handle.shutdown().await;
    Ok(())
}
