use anyhow::Result;
use std::sync::Arc;

use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = statelog::config::Cli::parse();
    let cmd = cli
        .command
        .clone()
        .unwrap_or(statelog::config::Command::Run);

    match cmd {
        statelog::config::Command::Run => run_server(cli.config).await,
        statelog::config::Command::Init => init_audit_log(&cli.config),
    }
}

fn init_audit_log(config: &statelog::config::Config) -> Result<()> {
    let audit_log = statelog::audit_log::AuditLog::open(&config.db_path)?;
    let records = audit_log.count()?;
    info!(
        db_path = %audit_log.path().display(),
        records,
        "audit log ready"
    );
    Ok(())
}

async fn run_server(config: statelog::config::Config) -> Result<()> {
    let audit_log = Arc::new(statelog::audit_log::AuditLog::open(&config.db_path)?);
    let (controller, writer) = statelog::controller::spawn_state_controller(audit_log.clone());

    let app = statelog::http::build_router(&config, controller, audit_log)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    info!(
        bind = %config.bind,
        db_path = %config.db_path.display(),
        auth = config.api_key().is_some(),
        "starting statelog"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    statelog::http::serve(listener, app, writer, shutdown_signal()).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
