use std::future::Future;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::{db::models::ElectricityPrice, schedule::PriceSlot};

/// Resolution assumed when a day has a single price point.
const DEFAULT_SLOT_MINUTES: i64 = 60;

/// Supplies the day-ahead curve for one local calendar day.
///
/// An empty or partial curve means the prices are not published yet.
pub trait PriceSource: Send + Sync {
    fn slots_for_day(
        &self,
        day: NaiveDate,
        tz: Tz,
    ) -> impl Future<Output = Result<Vec<PriceSlot>>> + Send;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

/// Reads prices stored by the fetcher in `electricity_prices`.
#[derive(Debug, Clone)]
pub struct PgPriceSource {
    pool: PgPool,
    vat_percentage: Decimal,
}

impl PgPriceSource {
    pub fn new(pool: PgPool, vat_percentage: Decimal) -> Self {
        Self {
            pool,
            vat_percentage,
        }
    }
}

impl PriceSource for PgPriceSource {
    async fn slots_for_day(&self, day: NaiveDate, tz: Tz) -> Result<Vec<PriceSlot>> {
        let (from, to) = day_bounds(day, tz)
            .with_context(|| format!("{day} has no local midnight in {tz}"))?;

        let rows = sqlx::query_as::<_, ElectricityPrice>(
            "SELECT timestamp, price_amount_mwh_eur \
             FROM electricity_prices \
             WHERE timestamp >= $1 AND timestamp < $2 \
             ORDER BY timestamp",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query electricity prices")?;

        debug!(day = %day, rows = rows.len(), "Loaded electricity prices");
        Ok(to_slots(&rows, self.vat_percentage))
    }
}

fn day_bounds(day: NaiveDate, tz: Tz) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let midnight = |d: NaiveDate| {
        tz.from_local_datetime(&d.and_time(NaiveTime::MIN))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    };
    Some((midnight(day)?, midnight(day.succ_opt()?)?))
}

// ---------------------------------------------------------------------------
// Row → slot conversion
// ---------------------------------------------------------------------------

/// Converts stored rows (ascending by timestamp) into price slots.
///
/// The slot length is the smallest step between consecutive rows. A missing
/// interval between two known points repeats the last known price; nothing
/// is invented before the first point or after the last one, so a partial
/// day stays partial. Duplicate and unparseable rows are skipped.
pub fn to_slots(rows: &[ElectricityPrice], vat_percentage: Decimal) -> Vec<PriceSlot> {
    let step = resolution(rows);
    let duration_minutes = step.num_minutes() as u32;
    let mut slots: Vec<PriceSlot> = Vec::with_capacity(rows.len());

    for row in rows {
        let Some(price) = cents_per_kwh(row.price_amount_mwh_eur, vat_percentage) else {
            warn!(timestamp = %row.timestamp, "Unusable price value; skipping row");
            continue;
        };

        if let Some(last) = slots.last() {
            if row.timestamp < last.start + step {
                warn!(timestamp = %row.timestamp, "Duplicate or off-grid price row; skipping");
                continue;
            }
        }

        while let Some(last) = slots.last() {
            let expected = last.start + step;
            if expected >= row.timestamp {
                break;
            }
            info!(
                missing = %expected,
                price = %last.price,
                "Filling missing price slot with last known price"
            );
            let filler = PriceSlot {
                start: expected,
                duration_minutes,
                price: last.price,
            };
            slots.push(filler);
        }

        slots.push(PriceSlot {
            start: row.timestamp,
            duration_minutes,
            price,
        });
    }
    slots
}

fn resolution(rows: &[ElectricityPrice]) -> Duration {
    rows.windows(2)
        .map(|pair| pair[1].timestamp - pair[0].timestamp)
        .filter(|step| *step > Duration::zero())
        .min()
        .unwrap_or_else(|| Duration::minutes(DEFAULT_SLOT_MINUTES))
}

/// EUR/MWh without VAT → cents/kWh with VAT.
fn cents_per_kwh(eur_per_mwh: f64, vat_percentage: Decimal) -> Option<Decimal> {
    let eur_per_mwh = Decimal::try_from(eur_per_mwh).ok()?;
    let vat_factor = Decimal::ONE + vat_percentage / Decimal::ONE_HUNDRED;
    Some((eur_per_mwh / Decimal::TEN * vat_factor).round_dp(4))
}
