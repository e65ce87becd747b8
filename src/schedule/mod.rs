pub mod models;

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;

use crate::error::ScheduleError;

pub use self::models::{ActivationInterval, ActivationPlan, ActivationPolicy, PriceSlot};

/// Turns one day of prices into an activation plan.
///
/// `slots` must cover exactly one calendar day in `tz`, from local midnight to
/// the next local midnight, with no gaps or overlaps and a single slot
/// duration. Each policy is solved independently:
///
/// - `contiguous`: the run of consecutive slots with the lowest total price,
///   earliest run on ties.
/// - otherwise: the cheapest slots by price, earliest slot on ties, with
///   neighbouring picks merged into one interval.
pub fn compute_plan(
    slots: &[PriceSlot],
    policies: &[ActivationPolicy],
    tz: Tz,
) -> Result<ActivationPlan, ScheduleError> {
    let day = validate_day(slots, tz)?;
    let circuits = policies
        .iter()
        .map(|policy| {
            plan_circuit(slots, policy, day, tz).map(|intervals| (policy.circuit_id.clone(), intervals))
        })
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    Ok(ActivationPlan {
        day,
        computed_at: Utc::now(),
        circuits,
        rejected: BTreeMap::new(),
    })
}

/// Same as [`compute_plan`], except that a policy which cannot be met only
/// affects its own circuit: it is listed in [`ActivationPlan::rejected`] and
/// every other circuit is still planned. Only problems with the curve itself
/// fail the call.
pub fn compute_partial_plan(
    slots: &[PriceSlot],
    policies: &[ActivationPolicy],
    tz: Tz,
) -> Result<ActivationPlan, ScheduleError> {
    let day = validate_day(slots, tz)?;

    let mut circuits = BTreeMap::new();
    let mut rejected = BTreeMap::new();
    for policy in policies {
        match plan_circuit(slots, policy, day, tz) {
            Ok(intervals) => {
                circuits.insert(policy.circuit_id.clone(), intervals);
            }
            Err(ScheduleError::InvalidPolicy { circuit_id, reason }) => {
                rejected.insert(circuit_id, reason);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(ActivationPlan {
        day,
        computed_at: Utc::now(),
        circuits,
        rejected,
    })
}

/// Solves one policy against an already validated day.
fn plan_circuit(
    slots: &[PriceSlot],
    policy: &ActivationPolicy,
    day: NaiveDate,
    tz: Tz,
) -> Result<Vec<ActivationInterval>, ScheduleError> {
    let window = policy_window(slots, policy, day, tz)?;
    let needed = slots_needed(policy, slots[0].duration_minutes)?;

    if needed > window.len() {
        return Err(invalid(
            policy,
            format!(
                "{} h needs {needed} slots but the allowed window only has {}",
                policy.hours_per_day,
                window.len()
            ),
        ));
    }

    Ok(if policy.contiguous {
        cheapest_run(window, needed)
    } else {
        cheapest_slots(window, needed)
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Returns the local calendar day covered by `slots`.
fn validate_day(slots: &[PriceSlot], tz: Tz) -> Result<NaiveDate, ScheduleError> {
    let (first, last) = match (slots.first(), slots.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(insufficient("no price slots")),
    };
    if first.duration_minutes == 0 {
        return Err(insufficient("slot duration must be positive"));
    }

    let day = first.start.with_timezone(&tz).date_naive();
    let day_start = local_midnight(day, tz)?;
    let next_day = day
        .succ_opt()
        .ok_or_else(|| insufficient("day is out of range"))?;
    let day_end = local_midnight(next_day, tz)?;

    if first.start != day_start {
        return Err(insufficient(format!(
            "curve starts at {}, expected local midnight {day_start}",
            first.start
        )));
    }

    for pair in slots.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.duration_minutes != first.duration_minutes {
            return Err(insufficient(format!(
                "mixed slot durations: {} and {} minutes",
                first.duration_minutes, next.duration_minutes
            )));
        }
        if next.start > prev.end() {
            return Err(insufficient(format!(
                "gap between {} and {}",
                prev.end(),
                next.start
            )));
        }
        if next.start < prev.end() {
            return Err(insufficient(format!(
                "slot at {} overlaps slot at {}",
                next.start, prev.start
            )));
        }
    }

    if last.end() != day_end {
        return Err(insufficient(format!(
            "curve ends at {}, expected local midnight {day_end}",
            last.end()
        )));
    }

    Ok(day)
}

fn local_midnight(day: NaiveDate, tz: Tz) -> Result<DateTime<Utc>, ScheduleError> {
    local_instant(day, NaiveTime::MIN, tz)
        .ok_or_else(|| insufficient(format!("{day} has no local midnight")))
}

/// Resolves a local wall-clock time; on an ambiguous (repeated) hour the
/// earlier instant wins.
fn local_instant(day: NaiveDate, time: NaiveTime, tz: Tz) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&day.and_time(time))
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Policy helpers
// ---------------------------------------------------------------------------

/// The sub-slice of slots lying entirely inside the policy's allowed window.
fn policy_window<'a>(
    slots: &'a [PriceSlot],
    policy: &ActivationPolicy,
    day: NaiveDate,
    tz: Tz,
) -> Result<&'a [PriceSlot], ScheduleError> {
    let lower = match policy.earliest_start {
        Some(t) => local_instant(day, t, tz)
            .ok_or_else(|| invalid(policy, format!("earliest_start {t} does not exist on {day}")))?,
        None => slots[0].start,
    };
    let upper = match policy.latest_end {
        // An end at midnight is the end of the day.
        Some(t) if t == NaiveTime::MIN => slots[slots.len() - 1].end(),
        Some(t) => local_instant(day, t, tz)
            .ok_or_else(|| invalid(policy, format!("latest_end {t} does not exist on {day}")))?,
        None => slots[slots.len() - 1].end(),
    };
    if lower >= upper {
        return Err(invalid(policy, "allowed window is empty"));
    }

    let from = slots.partition_point(|s| s.start < lower);
    let to = slots.partition_point(|s| s.end() <= upper);
    Ok(if from < to { &slots[from..to] } else { &[] })
}

fn slots_needed(policy: &ActivationPolicy, slot_minutes: u32) -> Result<usize, ScheduleError> {
    if policy.hours_per_day == 0 {
        return Err(invalid(policy, "hours_per_day must be positive"));
    }
    let minutes = policy.hours_per_day.saturating_mul(60);
    Ok(minutes.div_ceil(slot_minutes) as usize)
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Sliding window over `window` keeping the earliest run with the lowest sum.
fn cheapest_run(window: &[PriceSlot], len: usize) -> Vec<ActivationInterval> {
    let mut sum: Decimal = window[..len].iter().map(|s| s.price).sum();
    let mut best_sum = sum;
    let mut best = 0;

    for start in 1..=window.len() - len {
        sum += window[start + len - 1].price - window[start - 1].price;
        if sum < best_sum {
            best_sum = sum;
            best = start;
        }
    }

    vec![ActivationInterval {
        start: window[best].start,
        end: window[best + len - 1].end(),
    }]
}

fn cheapest_slots(window: &[PriceSlot], count: usize) -> Vec<ActivationInterval> {
    let mut ranked: Vec<&PriceSlot> = window.iter().collect();
    ranked.sort_by(|a, b| a.price.cmp(&b.price).then(a.start.cmp(&b.start)));
    ranked.truncate(count);
    ranked.sort_by_key(|s| s.start);

    let mut intervals: Vec<ActivationInterval> = Vec::new();
    for slot in ranked {
        match intervals.last_mut() {
            Some(last) if last.end == slot.start => last.end = slot.end(),
            _ => intervals.push(ActivationInterval {
                start: slot.start,
                end: slot.end(),
            }),
        }
    }
    intervals
}

fn insufficient(reason: impl Into<String>) -> ScheduleError {
    ScheduleError::InsufficientData(reason.into())
}

fn invalid(policy: &ActivationPolicy, reason: impl Into<String>) -> ScheduleError {
    ScheduleError::InvalidPolicy {
        circuit_id: policy.circuit_id.clone(),
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
