//! Postgres access. The schema is owned by the price fetcher's migrations;
//! this service expects:
//!
//! ```sql
//! electricity_prices (timestamp TIMESTAMPTZ, price_amount_mwh_eur DOUBLE PRECISION)
//! relay_events (id UUID PRIMARY KEY, circuit_id TEXT, board_id TEXT, channel SMALLINT,
//!               desired_on BOOLEAN, acked_on BOOLEAN NULL, success BOOLEAN,
//!               error TEXT NULL, recorded_at TIMESTAMPTZ)
//! ```

pub mod models;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use crate::events::RelayEvent;

pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("Failed to connect to Postgres")?;
    Ok(pool)
}

/// Persists relay events until the bus closes. Insert failures are logged
/// and skipped.
pub async fn record_events(pool: PgPool, mut events: broadcast::Receiver<RelayEvent>) {
    info!("Relay event recorder started");
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Err(e) = insert_event(&pool, &event).await {
                    error!(circuit_id = %event.circuit_id, error = %e, "Failed to persist relay event");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Relay event recorder fell behind; events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
    info!("Relay event recorder stopped");
}

async fn insert_event(pool: &PgPool, event: &RelayEvent) -> Result<()> {
    sqlx::query(
        "INSERT INTO relay_events \
            (id, circuit_id, board_id, channel, desired_on, acked_on, success, error, recorded_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(event.id)
    .bind(&event.circuit_id)
    .bind(&event.board_id)
    .bind(i16::from(event.channel))
    .bind(event.desired_on)
    .bind(event.acked_on)
    .bind(event.success)
    .bind(event.error.as_deref())
    .bind(event.recorded_at)
    .execute(pool)
    .await?;

    debug!(event_id = %event.id, "Relay event persisted");
    Ok(())
}
