use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Price curve
// ---------------------------------------------------------------------------

/// One pricing interval of the day-ahead curve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSlot {
    pub start: DateTime<Utc>,
    pub duration_minutes: u32,
    /// Cents per kWh including VAT. Zero and negative prices are valid.
    pub price: Decimal,
}

impl PriceSlot {
    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::minutes(i64::from(self.duration_minutes))
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// How many hours a circuit should run per day, and where in the day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationPolicy {
    pub circuit_id: String,
    pub hours_per_day: u32,
    /// `true` → one unbroken run; `false` → the cheapest slots wherever they are.
    #[serde(default)]
    pub contiguous: bool,
    /// Local wall-clock time in the pricing zone. `None` → start of day.
    #[serde(default)]
    pub earliest_start: Option<NaiveTime>,
    /// Local wall-clock time in the pricing zone. `None` → end of day.
    #[serde(default)]
    pub latest_end: Option<NaiveTime>,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Half-open `[start, end)` range during which a circuit is switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ActivationInterval {
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}

/// The on/off plan for every configured circuit for one local calendar day.
///
/// Never patched after construction; a new day gets a new plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationPlan {
    pub day: NaiveDate,
    pub computed_at: DateTime<Utc>,
    pub circuits: BTreeMap<String, Vec<ActivationInterval>>,
    /// Circuits whose policy could not be met on this day, with the reason.
    #[serde(default)]
    pub rejected: BTreeMap<String, String>,
}

impl ActivationPlan {
    pub fn intervals(&self, circuit_id: &str) -> &[ActivationInterval] {
        self.circuits
            .get(circuit_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The circuit's policy could not be met, so the plan says nothing about it.
    pub fn is_rejected(&self, circuit_id: &str) -> bool {
        self.rejected.contains_key(circuit_id)
    }

    /// Whether `circuit_id` should be on at `instant`.
    pub fn is_active(&self, circuit_id: &str, instant: DateTime<Utc>) -> bool {
        self.intervals(circuit_id)
            .iter()
            .any(|interval| interval.contains(instant))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 14, hour, 0, 0).unwrap()
    }

    #[test]
    fn slot_end_adds_duration() {
        let slot = PriceSlot {
            start: at(3),
            duration_minutes: 15,
            price: Decimal::ONE,
        };
        assert_eq!(slot.end(), at(3) + Duration::minutes(15));
    }

    #[test]
    fn interval_is_half_open() {
        let interval = ActivationInterval { start: at(2), end: at(6) };
        assert!(interval.contains(at(2)));
        assert!(interval.contains(at(5)));
        assert!(!interval.contains(at(6)));
        assert!(!interval.contains(at(1)));
    }

    #[test]
    fn is_active_false_for_unknown_circuit() {
        let mut circuits = BTreeMap::new();
        circuits.insert(
            "boiler".to_owned(),
            vec![ActivationInterval { start: at(2), end: at(6) }],
        );
        let plan = ActivationPlan {
            day: at(0).date_naive(),
            computed_at: at(0),
            circuits,
            rejected: BTreeMap::from([("sauna".to_owned(), "window too short".to_owned())]),
        };
        assert!(plan.is_active("boiler", at(3)));
        assert!(!plan.is_active("boiler", at(7)));
        assert!(!plan.is_active("car_charger", at(3)));
        assert!(plan.intervals("car_charger").is_empty());
        assert!(plan.is_rejected("sauna"));
        assert!(!plan.is_rejected("boiler"));
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let p: ActivationPolicy =
            serde_json::from_str(r#"{"circuit_id":"boiler","hours_per_day":3}"#).unwrap();
        assert_eq!(p.hours_per_day, 3);
        assert!(!p.contiguous);
        assert!(p.earliest_start.is_none());
        assert!(p.latest_end.is_none());

        let p: ActivationPolicy = serde_json::from_str(
            r#"{"circuit_id":"car","hours_per_day":4,"contiguous":true,
                "earliest_start":"22:00:00","latest_end":"23:45:00"}"#,
        )
        .unwrap();
        assert!(p.contiguous);
        assert_eq!(p.earliest_start, NaiveTime::from_hms_opt(22, 0, 0));
        assert_eq!(p.latest_end, NaiveTime::from_hms_opt(23, 45, 0));
    }
}
