use std::{sync::Arc, time::Duration};

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::{
    error::{RelayError, ScheduleError},
    plan_cache::PlanCache,
    prices::PriceSource,
    relay::RelayController,
    schedule::{self, ActivationPlan, ActivationPolicy},
};

/// Keeps the relays in line with today's activation plan.
pub struct ControlService<P> {
    prices: P,
    relays: RelayController,
    plan: PlanCache,
    policies: Vec<ActivationPolicy>,
    tz: Tz,
    interval: Duration,
}

impl<P: PriceSource> ControlService<P> {
    pub fn new(
        prices: P,
        relays: RelayController,
        plan: PlanCache,
        policies: Vec<ActivationPolicy>,
        tz: Tz,
        interval_secs: u64,
    ) -> Self {
        Self {
            prices,
            relays,
            plan,
            policies,
            tz,
            interval: Duration::from_secs(interval_secs),
        }
    }

    /// Runs the control loop indefinitely.
    /// Spawn this via `tokio::spawn`.
    pub async fn run(self) {
        info!(interval_secs = self.interval.as_secs(), tz = %self.tz, "Control loop started");
        let mut ticker = time::interval(self.interval);
        // A slow tick delays the next one instead of piling up behind it.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.run_once(Utc::now()).await;
        }
    }

    /// One reconciliation pass as of `now`.
    ///
    /// Without a plan for the current local day, relays are held in their
    /// last commanded state; only unconfirmed ones are re-sent. The same holds
    /// for a circuit whose policy the day's plan could not meet.
    pub async fn run_once(&self, now: DateTime<Utc>) {
        let today = now.with_timezone(&self.tz).date_naive();
        let plan = self.ensure_plan(today).await;

        self.relays.sync_link_states().await;
        self.reconcile(plan.as_deref(), now).await;
    }

    async fn ensure_plan(&self, today: NaiveDate) -> Option<Arc<ActivationPlan>> {
        if let Some(plan) = self.plan.for_day(today).await {
            return Some(plan);
        }
        if let Some(stale) = self.plan.clear().await {
            info!(day = %stale.day, "Day is over; discarding activation plan");
        }

        let slots = match self.prices.slots_for_day(today, self.tz).await {
            Ok(slots) => slots,
            Err(e) => {
                error!(day = %today, error = %e, "Failed to load prices");
                return None;
            }
        };

        match schedule::compute_partial_plan(&slots, &self.policies, self.tz) {
            Ok(plan) => {
                for (circuit_id, reason) in &plan.rejected {
                    error!(day = %today, circuit_id = %circuit_id, reason = %reason, "Policy cannot be met today; holding circuit");
                }
                for (circuit_id, intervals) in &plan.circuits {
                    for interval in intervals {
                        info!(
                            circuit_id = %circuit_id,
                            start = %interval.start.with_timezone(&self.tz),
                            end = %interval.end.with_timezone(&self.tz),
                            "Scheduled activation"
                        );
                    }
                }
                Some(self.plan.replace(plan).await)
            }
            Err(ScheduleError::InsufficientData(reason)) => {
                info!(day = %today, reason = %reason, "Prices for today not available yet; holding relays");
                None
            }
            Err(e) => {
                error!(day = %today, error = %e, "Failed to compute activation plan");
                None
            }
        }
    }

    async fn reconcile(&self, plan: Option<&ActivationPlan>, now: DateTime<Utc>) {
        for circuit_id in self.relays.circuit_ids() {
            let Some(state) = self.relays.get_known_state(circuit_id).await else {
                continue;
            };
            let desired = match plan {
                Some(plan) if !plan.is_rejected(circuit_id) => plan.is_active(circuit_id, now),
                _ => state.last_commanded_on,
            };
            if state.last_ack_on == Some(desired) {
                continue;
            }

            match self.relays.set_relay(circuit_id, desired).await {
                Ok(()) => {}
                Err(RelayError::Unreachable(_)) => {
                    warn!(circuit_id = %circuit_id, on = desired, "Relay unreachable; retrying next tick");
                }
                Err(e) => {
                    warn!(circuit_id = %circuit_id, on = desired, error = %e, "Relay command failed; retrying next tick");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
