use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// One row of the `electricity_prices` table, as written by the price fetcher.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct ElectricityPrice {
    /// Start of the pricing interval.
    pub timestamp: DateTime<Utc>,
    /// Day-ahead price in EUR/MWh, without VAT.
    pub price_amount_mwh_eur: f64,
}
