use std::collections::{BTreeMap, HashSet};

use anyhow::{bail, Context, Result};
use chrono_tz::Tz;
use rust_decimal::Decimal;

use crate::{relay::RelayEndpoint, schedule::ActivationPolicy};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub server_host: String,
    pub server_port: u16,
    /// Timezone of the bidding zone; day boundaries and policy windows use it.
    pub pricing_timezone: Tz,
    pub vat_percentage: Decimal,
    /// Maps board_id → serial device path.
    /// Format: `"id1=path1,id2=path2"` (e.g. `"1=/dev/ttyACM0,2=/dev/ttyACM1"`).
    pub serial_boards: BTreeMap<String, String>,
    /// Format: `"circuit:board_id:channel,..."` (e.g. `"car_charger:1:1"`).
    pub relay_endpoints: Vec<RelayEndpoint>,
    /// JSON array of `ActivationPolicy` objects.
    pub activation_policies: Vec<ActivationPolicy>,
    pub serial_baud_rate: u32,
    /// Read and write timeout of every serial exchange, in milliseconds.
    pub serial_timeout_ms: u64,
    /// Delay between reconnect attempts of a dropped serial link, in seconds.
    pub reconnect_interval_secs: u64,
    /// Idle time after which a link re-sends its last frames to check the board, in seconds.
    pub keepalive_interval_secs: u64,
    /// Control loop interval in seconds.
    pub control_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let serial_boards = parse_serial_boards(&optional("SERIAL_BOARDS", ""))?;
        let relay_endpoints = parse_relay_endpoints(&optional("RELAY_ENDPOINTS", ""))?;
        let activation_policies = parse_policies(&optional("ACTIVATION_POLICIES", "[]"))?;
        validate(&serial_boards, &relay_endpoints, &activation_policies)?;

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            server_host: optional("SERVER_HOST", "0.0.0.0"),
            server_port: optional("SERVER_PORT", "8080")
                .parse()
                .context("SERVER_PORT must be a valid port number")?,
            pricing_timezone: optional("PRICING_TIMEZONE", "Europe/Helsinki")
                .parse::<Tz>()
                .map_err(|e| anyhow::anyhow!("PRICING_TIMEZONE: {e}"))?,
            vat_percentage: optional("VAT_PERCENTAGE", "25.5")
                .parse()
                .context("VAT_PERCENTAGE must be a decimal number")?,
            serial_boards,
            relay_endpoints,
            activation_policies,
            serial_baud_rate: optional("SERIAL_BAUD_RATE", "115200")
                .parse()
                .context("SERIAL_BAUD_RATE must be a positive integer")?,
            serial_timeout_ms: optional("SERIAL_TIMEOUT_MS", "1000")
                .parse()
                .context("SERIAL_TIMEOUT_MS must be a positive integer")?,
            reconnect_interval_secs: optional("RECONNECT_INTERVAL_SECS", "5")
                .parse()
                .context("RECONNECT_INTERVAL_SECS must be a positive integer")?,
            keepalive_interval_secs: optional("KEEPALIVE_INTERVAL_SECS", "30")
                .parse()
                .context("KEEPALIVE_INTERVAL_SECS must be a positive integer")?,
            control_interval_secs: optional("CONTROL_INTERVAL_SECS", "60")
                .parse()
                .context("CONTROL_INTERVAL_SECS must be a positive integer")?,
        })
    }
}

/// Parse `"id1=path1,id2=path2"` into a `BTreeMap<board_id, path>`.
fn parse_serial_boards(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut boards = BTreeMap::new();
    for entry in raw.split(',').filter(|s| !s.trim().is_empty()) {
        let (id, path) = entry.split_once('=').with_context(|| {
            format!("SERIAL_BOARDS entry must be 'board_id=path', got: {entry:?}")
        })?;
        let (id, path) = (id.trim(), path.trim());
        if id.is_empty() || path.is_empty() {
            bail!("SERIAL_BOARDS entry has an empty board id or path: {entry:?}");
        }
        if boards.insert(id.to_owned(), path.to_owned()).is_some() {
            bail!("duplicate board id in SERIAL_BOARDS: {id:?}");
        }
    }
    Ok(boards)
}

/// Parse `"circuit:board_id:channel,..."` into relay endpoints.
fn parse_relay_endpoints(raw: &str) -> Result<Vec<RelayEndpoint>> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
            let [circuit_id, board_id, channel] = parts.as_slice() else {
                bail!("RELAY_ENDPOINTS entry must be 'circuit:board_id:channel', got: {entry:?}");
            };
            let channel = channel
                .parse::<u8>()
                .with_context(|| format!("channel must be 0-255 in RELAY_ENDPOINTS entry {entry:?}"))?;
            Ok(RelayEndpoint {
                circuit_id: (*circuit_id).to_owned(),
                board_id: (*board_id).to_owned(),
                channel,
            })
        })
        .collect()
}

fn parse_policies(raw: &str) -> Result<Vec<ActivationPolicy>> {
    serde_json::from_str(raw).context("ACTIVATION_POLICIES must be a JSON array of policies")
}

/// Cross-checks boards, endpoints and policies so that a bad mapping fails
/// at start-up instead of at the first tick.
fn validate(
    boards: &BTreeMap<String, String>,
    endpoints: &[RelayEndpoint],
    policies: &[ActivationPolicy],
) -> Result<()> {
    let mut circuits = HashSet::new();
    let mut wiring = HashSet::new();
    for e in endpoints {
        if !boards.contains_key(&e.board_id) {
            bail!("circuit {:?} references unknown board {:?}", e.circuit_id, e.board_id);
        }
        if !circuits.insert(e.circuit_id.as_str()) {
            bail!("circuit {:?} is listed twice in RELAY_ENDPOINTS", e.circuit_id);
        }
        if !wiring.insert((e.board_id.as_str(), e.channel)) {
            bail!("board {:?} channel {} is used by more than one circuit", e.board_id, e.channel);
        }
    }

    let mut scheduled = HashSet::new();
    for p in policies {
        if !circuits.contains(p.circuit_id.as_str()) {
            bail!("policy for circuit {:?} has no relay endpoint", p.circuit_id);
        }
        if !scheduled.insert(p.circuit_id.as_str()) {
            bail!("circuit {:?} has more than one policy", p.circuit_id);
        }
        if p.hours_per_day == 0 {
            bail!("policy for circuit {:?} must run at least one hour", p.circuit_id);
        }
    }
    Ok(())
}

fn required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required env var: {key}"))
}

fn optional(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}
