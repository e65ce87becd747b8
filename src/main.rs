mod api;
mod config;
mod control;
mod db;
mod error;
mod events;
mod plan_cache;
mod prices;
mod relay;
mod schedule;
mod serial;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{
    api::AppState,
    config::Config,
    control::ControlService,
    events::EventBus,
    plan_cache::PlanCache,
    prices::PgPriceSource,
    relay::RelayController,
    serial::{
        transport::{Connector, SerialConnector},
        SerialLink,
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env (ignore error if file absent; env vars may be set externally)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;

    let pool = db::create_pool(&config.database_url).await?;
    info!("Database ready");

    // One worker per board; each keeps reconnecting on its own.
    let connector: Arc<dyn Connector> = Arc::new(SerialConnector::new(
        config.serial_baud_rate,
        Duration::from_millis(config.serial_timeout_ms),
    ));
    let links: Vec<SerialLink> = config
        .serial_boards
        .iter()
        .map(|(board_id, path)| {
            SerialLink::spawn(
                board_id.as_str(),
                path.as_str(),
                Arc::clone(&connector),
                Duration::from_secs(config.reconnect_interval_secs),
                Duration::from_secs(config.keepalive_interval_secs),
            )
        })
        .collect();
    for link in &links {
        info!(board_id = %link.board_id(), path = %link.path(), "Serial link started");
    }

    let relays = RelayController::new(links, config.relay_endpoints.clone(), EventBus::default())?;
    tokio::spawn(db::record_events(pool.clone(), relays.events().subscribe()));
    let plan = PlanCache::new();

    let control = {
        let prices = PgPriceSource::new(pool, config.vat_percentage);
        let service = ControlService::new(
            prices,
            relays.clone(),
            plan.clone(),
            config.activation_policies.clone(),
            config.pricing_timezone,
            config.control_interval_secs,
        );
        tokio::spawn(service.run())
    };

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "HTTP server listening");

    let state = AppState {
        plan,
        relays: relays.clone(),
    };
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The control loop must be gone before the clean-up starts.
    control.abort();
    let _ = control.await;
    info!("Switching all circuits off");
    relays.all_off().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
