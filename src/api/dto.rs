use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    relay::RelayRuntimeState,
    schedule::{ActivationInterval, ActivationPlan},
    serial::LinkState,
};

/// Half-open `[start, end)` window during which a circuit is on.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct IntervalDto {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl From<&ActivationInterval> for IntervalDto {
    fn from(i: &ActivationInterval) -> Self {
        Self {
            start: i.start,
            end: i.end,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PlanDto {
    /// Local calendar day of the pricing zone
    pub day: NaiveDate,
    pub computed_at: DateTime<Utc>,
    /// Circuit id → on-intervals in start order
    pub circuits: BTreeMap<String, Vec<IntervalDto>>,
    /// Circuit id → why its policy could not be met; these circuits are held
    pub rejected: BTreeMap<String, String>,
}

impl From<&ActivationPlan> for PlanDto {
    fn from(p: &ActivationPlan) -> Self {
        Self {
            day: p.day,
            computed_at: p.computed_at,
            circuits: p
                .circuits
                .iter()
                .map(|(id, intervals)| (id.clone(), intervals.iter().map(Into::into).collect()))
                .collect(),
            rejected: p.rejected.clone(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RelayStatusDto {
    pub circuit_id: String,
    pub board_id: String,
    pub channel: u8,
    pub link_state: LinkState,
    /// State last sent to the board
    pub last_commanded_on: bool,
    /// State last confirmed by the board, if any since the link came up
    pub last_ack_on: Option<bool>,
    pub last_ack_time: Option<DateTime<Utc>>,
    pub connected: bool,
    /// The board has not confirmed the last commanded state
    pub drift: bool,
    /// Error of the last attempt to switch the relay, if it failed
    pub last_error: Option<String>,
}

impl RelayStatusDto {
    pub fn new(state: RelayRuntimeState, link_state: LinkState) -> Self {
        let drift = state.drift();
        Self {
            circuit_id: state.endpoint.circuit_id,
            board_id: state.endpoint.board_id,
            channel: state.endpoint.channel,
            link_state,
            last_commanded_on: state.last_commanded_on,
            last_ack_on: state.last_ack_on,
            last_ack_time: state.last_ack_time,
            connected: state.connected,
            drift,
            last_error: state.last_error,
        }
    }
}
