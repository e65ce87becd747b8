use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::RwLock;

use crate::schedule::ActivationPlan;

/// Holds the activation plan currently in force.
///
/// Wrapped in `Arc` so it can be cheaply cloned and shared across tasks.
/// A plan is replaced as a whole, never edited; readers get an `Arc` to a
/// plan that stays consistent for as long as they hold it.
#[derive(Clone, Default)]
pub struct PlanCache {
    inner: Arc<RwLock<Option<Arc<ActivationPlan>>>>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a freshly computed plan.
    pub async fn replace(&self, plan: ActivationPlan) -> Arc<ActivationPlan> {
        let plan = Arc::new(plan);
        *self.inner.write().await = Some(Arc::clone(&plan));
        plan
    }

    /// Drop the current plan, e.g. when its day is over.
    pub async fn clear(&self) -> Option<Arc<ActivationPlan>> {
        self.inner.write().await.take()
    }

    pub async fn current(&self) -> Option<Arc<ActivationPlan>> {
        self.inner.read().await.clone()
    }

    /// The plan, only if it was computed for `day`.
    pub async fn for_day(&self, day: NaiveDate) -> Option<Arc<ActivationPlan>> {
        self.current().await.filter(|plan| plan.day == day)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;

    fn plan(day: NaiveDate) -> ActivationPlan {
        ActivationPlan {
            day,
            computed_at: Utc::now(),
            circuits: BTreeMap::new(),
            rejected: BTreeMap::new(),
        }
    }

    fn nov(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, d).unwrap()
    }

    #[tokio::test]
    async fn empty_cache_returns_nothing() {
        let cache = PlanCache::new();
        assert!(cache.current().await.is_none());
        assert!(cache.for_day(nov(14)).await.is_none());
    }

    #[tokio::test]
    async fn replace_swaps_whole_plan() {
        let cache = PlanCache::new();
        cache.replace(plan(nov(14))).await;
        let held = cache.current().await.unwrap();

        cache.replace(plan(nov(15))).await;

        // Earlier readers keep the plan they were given.
        assert_eq!(held.day, nov(14));
        assert_eq!(cache.current().await.unwrap().day, nov(15));
    }

    #[tokio::test]
    async fn for_day_filters_stale_plan() {
        let cache = PlanCache::new();
        cache.replace(plan(nov(14))).await;
        assert!(cache.for_day(nov(14)).await.is_some());
        assert!(cache.for_day(nov(15)).await.is_none());
    }

    #[tokio::test]
    async fn clear_returns_previous_plan() {
        let cache = PlanCache::new();
        let clone = cache.clone();
        cache.replace(plan(nov(14))).await;

        assert_eq!(clone.clear().await.unwrap().day, nov(14));
        assert!(cache.current().await.is_none());
    }
}
