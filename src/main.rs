use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

mod app;
mod auth;
mod config;
mod error;
mod mailer;
mod state;
mod sweeper;
mod validator;

#[cfg(test)]
mod testing;

use crate::config::AppConfig;
use crate::state::AppState;
use crate::sweeper::Sweeper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "gatekeeper=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = Arc::new(AppConfig::from_env().context("load config")?);

    let db = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("connect to postgres")?;

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .context("run migrations")?;

    let (state, mail_workers) = AppState::init(Arc::clone(&config), db)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let sweeper = tokio::spawn(Sweeper::from_state(&state).run(shutdown_rx.clone()));

    let signal_tx = Arc::clone(&shutdown_tx);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
        tracing::info!("shutdown requested");
        let _ = signal_tx.send(true);
    });

    let served = app::serve(app::build_app(state.clone()), shutdown_rx).await;
    // Also stops the sweeper when the server failed on its own.
    let _ = shutdown_tx.send(true);

    if let Err(e) = sweeper.await {
        tracing::error!(error = %e, "sweeper task panicked");
    }
    tracing::info!(dropped = state.mail.dropped(), "closing mail queue");
    // Workers exit once every queue sender is gone.
    drop(state);
    mail_workers.join().await;
    tracing::info!("shutdown complete");

    served
}
