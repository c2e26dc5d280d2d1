//! Usage quota engine.
//!
//! Records metered usage per station, resource and calendar month, and
//! compares it against the limit the station's plan assigns. Recording and
//! checking are separate operations: recording never consults the limit, so
//! an over-limit action the caller decides to go ahead with is still counted.

use chrono::{FixedOffset, Offset, Utc};
use fuel_plans::{LimitValue, PlanId, PlanRegistry, ResourceKey};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::error::QuotaError;
use crate::keys::{MonthBucket, StationId};
use crate::retry::{with_retry, RetryConfig};
use crate::store::{UsageKey, UsageStore};

/// What a gating call site grants when the usage store cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    /// Deny the feature. The right choice for anything that costs money or
    /// consumes a metered resource.
    FailClosed,
    /// Grant the feature. Only for non-critical affordances.
    FailOpen,
}

/// Outcome of a limit check for one station, resource and month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitCheck {
    pub station: StationId,
    pub resource: ResourceKey,
    pub plan: PlanId,
    pub month: MonthBucket,
    pub used: u64,
    pub limit: LimitValue,
    pub within_limit: bool,
    /// Units left this month; absent when the limit is unbounded.
    pub remaining: Option<u64>,
}

/// Usage metering and gating over an injected plan registry and counter
/// store. Cheap to clone; clones share the same registry and store.
#[derive(Debug, Clone)]
pub struct QuotaEngine {
    registry: Arc<PlanRegistry>,
    store: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
    utc_offset: FixedOffset,
    retry: RetryConfig,
}

impl QuotaEngine {
    /// Engine bucketing by UTC month on the system clock, with the default
    /// retry policy and operation timeout.
    pub fn new(registry: Arc<PlanRegistry>, store: Arc<dyn UsageStore>) -> Self {
        Self {
            registry,
            store,
            clock: Arc::new(SystemClock),
            utc_offset: Utc.fix(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Month buckets are calendar months at this fixed offset from UTC.
    pub fn with_utc_offset(mut self, utc_offset: FixedOffset) -> Self {
        self.utc_offset = utc_offset;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &PlanRegistry {
        &self.registry
    }

    /// The month bucket an event happening right now belongs to.
    ///
    /// Fails with [`QuotaError::InvalidKey`] when the clock is outside the
    /// years a bucket can name.
    pub fn current_month(&self) -> Result<MonthBucket, QuotaError> {
        MonthBucket::containing(&self.clock.now().with_timezone(&self.utc_offset))
    }

    /// Count one unit of `resource` against `station` for the current month
    /// and return the new monthly total.
    ///
    /// The limit is not consulted.
    pub async fn record_usage(&self, station: StationId, resource: &ResourceKey) -> Result<u64, QuotaError> {
        self.record_usage_stamped(station, resource)
            .await
            .map(|(_, count)| count)
    }

    /// Like [`QuotaEngine::record_usage`], also returning the month bucket
    /// the unit was counted in. The month is stamped once, before the
    /// increment, and retries reuse it.
    pub async fn record_usage_stamped(
        &self,
        station: StationId,
        resource: &ResourceKey,
    ) -> Result<(MonthBucket, u64), QuotaError> {
        let key = UsageKey::new(station, resource.clone(), self.current_month()?);

        match with_retry(|| self.store.increment(&key), &self.retry).await {
            Ok(count) => {
                log::debug!("Recorded {} usage for station {} in {}: {}", resource, station, key.month, count);
                Ok((key.month, count))
            }
            Err(e) => {
                log::error!("Failed to record {} usage for station {} in {}: {}", resource, station, key.month, e);
                Err(e.into())
            }
        }
    }

    /// Compare the station's usage of `resource` in `month` (the current
    /// month when `None`) with the limit `plan` assigns.
    ///
    /// Fails with [`QuotaError::UnknownPlan`] before touching storage when
    /// the plan is not registered.
    pub async fn check_limit(
        &self,
        station: StationId,
        resource: &ResourceKey,
        plan: &PlanId,
        month: Option<MonthBucket>,
    ) -> Result<LimitCheck, QuotaError> {
        let limit = self.resolve_limit(plan, resource)?;
        let month = match month {
            Some(month) => month,
            None => self.current_month()?,
        };
        let key = UsageKey::new(station, resource.clone(), month);

        let used = with_retry(|| self.store.count(&key), &self.retry)
            .await
            .map_err(|e| {
                log::error!("Failed to read {} usage for station {} in {}: {}", resource, station, month, e);
                QuotaError::from(e)
            })?;

        let within_limit = limit.permits(used);
        log::debug!(
            "Station {} {} usage in {}: {}/{} (within limit: {})",
            station, resource, month, used, limit, within_limit
        );

        Ok(LimitCheck {
            station,
            resource: resource.clone(),
            plan: plan.clone(),
            month,
            used,
            limit,
            within_limit,
            remaining: limit.remaining(used),
        })
    }

    /// Whether `plan` leaves `resource` uncapped, which is what unlocks the
    /// premium form of a feature.
    pub fn is_feature_unlocked(&self, station: StationId, plan: &PlanId, resource: &ResourceKey) -> Result<bool, QuotaError> {
        let unlocked = self.resolve_limit(plan, resource)?.is_unbounded();
        log::debug!("Station {} on plan {}: {} unlocked = {}", station, plan, resource, unlocked);
        Ok(unlocked)
    }

    /// Gate an action on the current month's allowance.
    ///
    /// When storage cannot be read the answer comes from `policy`; every
    /// other failure is returned to the caller.
    pub async fn gate(
        &self,
        station: StationId,
        resource: &ResourceKey,
        plan: &PlanId,
        policy: GatePolicy,
    ) -> Result<bool, QuotaError> {
        match self.check_limit(station, resource, plan, None).await {
            Ok(check) => Ok(check.within_limit),
            Err(QuotaError::StorageUnavailable(reason)) => {
                let granted = policy == GatePolicy::FailOpen;
                log::warn!(
                    "Usage unavailable for station {} {} ({}), {} by {:?}",
                    station,
                    resource,
                    reason,
                    if granted { "granting" } else { "denying" },
                    policy
                );
                Ok(granted)
            }
            Err(e) => Err(e),
        }
    }

    /// Limit checks for every resource `plan` lists, in the plan's order.
    pub async fn usage_snapshot(
        &self,
        station: StationId,
        plan: &PlanId,
        month: Option<MonthBucket>,
    ) -> Result<Vec<LimitCheck>, QuotaError> {
        let resources = self
            .registry
            .get(plan)
            .map(|p| p.limits.keys().cloned().collect::<Vec<_>>())
            .ok_or_else(|| {
                log::error!("Station {} references unknown plan {}", station, plan);
                QuotaError::UnknownPlan(plan.clone())
            })?;

        let month = match month {
            Some(month) => month,
            None => self.current_month()?,
        };
        let mut checks = Vec::with_capacity(resources.len());
        for resource in &resources {
            checks.push(self.check_limit(station, resource, plan, Some(month)).await?);
        }
        Ok(checks)
    }

    /// Monthly totals recorded for the station and resource, oldest first.
    pub async fn usage_history(
        &self,
        station: StationId,
        resource: &ResourceKey,
    ) -> Result<Vec<(MonthBucket, u64)>, QuotaError> {
        Ok(with_retry(|| self.store.history(station, resource), &self.retry).await?)
    }

    /// Remove records for months strictly before `month`. Operator action
    /// for retention; never called by the metering path.
    pub async fn prune_before(&self, month: MonthBucket) -> Result<u64, QuotaError> {
        let removed = with_retry(|| self.store.prune_before(month), &self.retry).await?;
        log::info!("Pruned {} usage records older than {}", removed, month);
        Ok(removed)
    }

    fn resolve_limit(&self, plan: &PlanId, resource: &ResourceKey) -> Result<LimitValue, QuotaError> {
        self.registry.resolve_limit(plan, resource).map_err(|e| {
            log::error!("Limit resolution for {} failed: {}", resource, e);
            QuotaError::from(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::StoreError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn station(id: u64) -> StationId {
        StationId::new(id).unwrap()
    }

    fn resource(key: &str) -> ResourceKey {
        key.parse().unwrap()
    }

    fn plan(id: &str) -> PlanId {
        id.parse().unwrap()
    }

    fn month(m: &str) -> MonthBucket {
        m.parse().unwrap()
    }

    fn june_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()))
    }

    fn test_registry() -> Arc<PlanRegistry> {
        Arc::new(
            PlanRegistry::from_toml_str(
                r#"
                [free]
                ocr = 100

                [premium]
                ocr = "unbounded"

                [locked]
                ocr = 0
                "#,
            )
            .unwrap(),
        )
    }

    fn engine_with(clock: Arc<ManualClock>) -> QuotaEngine {
        QuotaEngine::new(test_registry(), Arc::new(MemoryStore::new())).with_clock(clock)
    }

    #[tokio::test]
    async fn test_free_plan_scenario() {
        let engine = engine_with(june_clock());
        let (s, ocr, free) = (station(42), resource("ocr"), plan("free"));

        for expected in 1..=100 {
            assert_eq!(engine.record_usage(s, &ocr).await.unwrap(), expected);
        }
        let check = engine.check_limit(s, &ocr, &free, None).await.unwrap();
        assert_eq!(check.used, 100);
        assert_eq!(check.limit, LimitValue::Bounded(100));
        assert!(!check.within_limit);
        assert_eq!(check.remaining, Some(0));

        // Recording is not blocked by the limit.
        assert_eq!(engine.record_usage(s, &ocr).await.unwrap(), 101);
        let check = engine.check_limit(s, &ocr, &free, None).await.unwrap();
        assert_eq!(check.used, 101);
        assert!(!check.within_limit);
    }

    #[tokio::test]
    async fn test_within_limit_until_cap() {
        let engine = engine_with(june_clock());
        let (s, ocr, free) = (station(1), resource("ocr"), plan("free"));

        for _ in 0..99 {
            engine.record_usage(s, &ocr).await.unwrap();
        }
        let check = engine.check_limit(s, &ocr, &free, None).await.unwrap();
        assert_eq!(check.used, 99);
        assert!(check.within_limit);
        assert_eq!(check.remaining, Some(1));
    }

    #[tokio::test]
    async fn test_zero_limit_boundary() {
        let engine = engine_with(june_clock());
        let (s, ocr, locked) = (station(5), resource("ocr"), plan("locked"));

        let before = engine.check_limit(s, &ocr, &locked, None).await.unwrap();
        assert_eq!(before.used, 0);
        assert!(before.within_limit);

        engine.record_usage(s, &ocr).await.unwrap();
        let after = engine.check_limit(s, &ocr, &locked, None).await.unwrap();
        assert_eq!(after.used, 1);
        assert!(!after.within_limit);
    }

    #[tokio::test]
    async fn test_unbounded_plan_unlocks_feature_regardless_of_usage() {
        let engine = engine_with(june_clock());
        let (s, ocr, premium) = (station(42), resource("ocr"), plan("premium"));

        assert!(engine.is_feature_unlocked(s, &premium, &ocr).unwrap());
        for _ in 0..250 {
            engine.record_usage(s, &ocr).await.unwrap();
        }
        assert!(engine.is_feature_unlocked(s, &premium, &ocr).unwrap());

        let check = engine.check_limit(s, &ocr, &premium, None).await.unwrap();
        assert_eq!(check.limit, LimitValue::Unbounded);
        assert!(check.within_limit);
        assert_eq!(check.remaining, None);

        assert!(!engine.is_feature_unlocked(s, &plan("free"), &ocr).unwrap());
        // Resources a plan does not cap are unlocked.
        assert!(engine.is_feature_unlocked(s, &plan("free"), &resource("insights")).unwrap());
    }

    #[tokio::test]
    async fn test_month_isolation() {
        let clock = june_clock();
        let engine = engine_with(clock.clone());
        let (s, ocr, free) = (station(42), resource("ocr"), plan("free"));

        engine.record_usage(s, &ocr).await.unwrap();

        let june = engine.check_limit(s, &ocr, &free, Some(month("2024-06"))).await.unwrap();
        let july = engine.check_limit(s, &ocr, &free, Some(month("2024-07"))).await.unwrap();
        assert_eq!(june.used, 1);
        assert_eq!(july.used, 0);

        // A new month starts a fresh counter without any reset.
        clock.set(Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap());
        assert_eq!(engine.record_usage(s, &ocr).await.unwrap(), 1);
        assert_eq!(engine.check_limit(s, &ocr, &free, None).await.unwrap().month, month("2024-07"));
        assert_eq!(engine.check_limit(s, &ocr, &free, Some(month("2024-06"))).await.unwrap().used, 1);
    }

    #[tokio::test]
    async fn test_month_follows_configured_offset() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 30, 23, 0, 0).unwrap()));
        let engine = engine_with(clock).with_utc_offset(FixedOffset::east_opt(3 * 3600).unwrap());
        assert_eq!(engine.current_month().unwrap(), month("2024-07"));

        engine.record_usage(station(3), &resource("ocr")).await.unwrap();
        let history = engine.usage_history(station(3), &resource("ocr")).await.unwrap();
        assert_eq!(history, vec![(month("2024-07"), 1)]);
    }

    #[tokio::test]
    async fn test_clock_past_year_9999_is_rejected_before_storage() {
        let store = Arc::new(FailingStore::busy(0));
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(9999, 12, 31, 23, 0, 0).unwrap()));
        let engine = QuotaEngine::new(test_registry(), store.clone())
            .with_clock(clock)
            .with_utc_offset(FixedOffset::east_opt(2 * 3600).unwrap());

        assert!(matches!(
            engine.record_usage(station(1), &resource("ocr")).await,
            Err(QuotaError::InvalidKey(_))
        ));
        assert!(matches!(
            engine.check_limit(station(1), &resource("ocr"), &plan("free"), None).await,
            Err(QuotaError::InvalidKey(_))
        ));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_check_limit_is_idempotent_and_monotonic() {
        let engine = engine_with(june_clock());
        let (s, ocr, free) = (station(8), resource("ocr"), plan("free"));

        let mut last = 0;
        for _ in 0..5 {
            engine.record_usage(s, &ocr).await.unwrap();
            let first = engine.check_limit(s, &ocr, &free, None).await.unwrap();
            let second = engine.check_limit(s, &ocr, &free, None).await.unwrap();
            assert_eq!(first, second);
            assert!(first.used > last);
            last = first.used;
        }
    }

    #[tokio::test]
    async fn test_unknown_plan_never_defaults() {
        let engine = engine_with(june_clock());
        let (s, ocr, missing) = (station(1), resource("ocr"), plan("nonexistent_plan"));

        assert!(matches!(
            engine.check_limit(s, &ocr, &missing, None).await,
            Err(QuotaError::UnknownPlan(p)) if p == missing
        ));
        assert!(matches!(
            engine.is_feature_unlocked(s, &missing, &ocr),
            Err(QuotaError::UnknownPlan(_))
        ));
        assert!(matches!(
            engine.gate(s, &ocr, &missing, GatePolicy::FailOpen).await,
            Err(QuotaError::UnknownPlan(_))
        ));
        assert!(matches!(
            engine.usage_snapshot(s, &missing, None).await,
            Err(QuotaError::UnknownPlan(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_recording_counts_every_call() {
        let engine = engine_with(june_clock());
        let (s, ocr) = (station(42), resource("ocr"));

        let handles = (0..250)
            .map(|_| {
                let engine = engine.clone();
                let ocr = ocr.clone();
                tokio::spawn(async move { engine.record_usage(s, &ocr).await })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let check = engine.check_limit(s, &ocr, &plan("premium"), None).await.unwrap();
        assert_eq!(check.used, 250);
    }

    #[tokio::test]
    async fn test_usage_snapshot_lists_plan_resources() {
        let registry = Arc::new(
            PlanRegistry::from_toml_str("[fleet]\nocr = 10\nreports = \"unbounded\"\n").unwrap(),
        );
        let engine = QuotaEngine::new(registry, Arc::new(MemoryStore::new())).with_clock(june_clock());
        engine.record_usage(station(2), &resource("reports")).await.unwrap();

        let snapshot = engine.usage_snapshot(station(2), &plan("fleet"), None).await.unwrap();
        let summary = snapshot
            .iter()
            .map(|c| (c.resource.to_string(), c.used, c.within_limit))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![("ocr".to_string(), 0, true), ("reports".to_string(), 1, true)]
        );
    }

    #[tokio::test]
    async fn test_prune_keeps_current_month() {
        let clock = june_clock();
        let engine = engine_with(clock.clone());
        let (s, ocr) = (station(4), resource("ocr"));

        clock.set(Utc.with_ymd_and_hms(2024, 4, 2, 0, 0, 0).unwrap());
        engine.record_usage(s, &ocr).await.unwrap();
        clock.set(Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap());
        engine.record_usage(s, &ocr).await.unwrap();

        assert_eq!(engine.prune_before(month("2024-05")).await.unwrap(), 1);
        assert_eq!(engine.usage_history(s, &ocr).await.unwrap(), vec![(month("2024-06"), 1)]);
    }

    /// Store that fails a configurable way, counting calls.
    #[derive(Debug)]
    struct FailingStore {
        busy_failures: u32,
        unavailable: bool,
        calls: AtomicU32,
        inner: MemoryStore,
    }

    impl FailingStore {
        fn busy(times: u32) -> Self {
            Self { busy_failures: times, unavailable: false, calls: AtomicU32::new(0), inner: MemoryStore::new() }
        }

        fn down() -> Self {
            Self { busy_failures: 0, unavailable: true, calls: AtomicU32::new(0), inner: MemoryStore::new() }
        }

        fn fail(&self) -> Option<StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.unavailable {
                Some(StoreError::Unavailable("unable to open database file".to_string()))
            } else if call < self.busy_failures {
                Some(StoreError::Busy("database is locked".to_string()))
            } else {
                None
            }
        }
    }

    #[async_trait]
    impl UsageStore for FailingStore {
        async fn increment(&self, key: &UsageKey) -> Result<u64, StoreError> {
            match self.fail() {
                Some(e) => Err(e),
                None => self.inner.increment(key).await,
            }
        }

        async fn count(&self, key: &UsageKey) -> Result<u64, StoreError> {
            match self.fail() {
                Some(e) => Err(e),
                None => self.inner.count(key).await,
            }
        }

        async fn history(&self, station: StationId, resource: &ResourceKey) -> Result<Vec<(MonthBucket, u64)>, StoreError> {
            self.inner.history(station, resource).await
        }

        async fn prune_before(&self, month: MonthBucket) -> Result<u64, StoreError> {
            self.inner.prune_before(month).await
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig { max_retries: 3, initial_backoff_ms: 1, max_backoff_ms: 2, ..RetryConfig::default() }
    }

    #[tokio::test]
    async fn test_transient_contention_is_retried() {
        let store = Arc::new(FailingStore::busy(2));
        let engine = QuotaEngine::new(test_registry(), store.clone())
            .with_clock(june_clock())
            .with_retry(fast_retry());

        assert_eq!(engine.record_usage(station(1), &resource("ocr")).await.unwrap(), 1);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_storage_unavailable() {
        let store = Arc::new(FailingStore::busy(u32::MAX));
        let engine = QuotaEngine::new(test_registry(), store.clone())
            .with_clock(june_clock())
            .with_retry(fast_retry());

        assert!(matches!(
            engine.record_usage(station(1), &resource("ocr")).await,
            Err(QuotaError::StorageUnavailable(_))
        ));
        assert_eq!(store.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_without_retry() {
        let store = Arc::new(FailingStore::down());
        let engine = QuotaEngine::new(test_registry(), store.clone())
            .with_clock(june_clock())
            .with_retry(fast_retry());

        assert!(matches!(
            engine.check_limit(station(1), &resource("ocr"), &plan("free"), None).await,
            Err(QuotaError::StorageUnavailable(_))
        ));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gate_policies_on_storage_failure() {
        let engine = QuotaEngine::new(test_registry(), Arc::new(FailingStore::down()))
            .with_clock(june_clock())
            .with_retry(fast_retry());
        let (s, ocr, free) = (station(1), resource("ocr"), plan("free"));

        assert!(!engine.gate(s, &ocr, &free, GatePolicy::FailClosed).await.unwrap());
        assert!(engine.gate(s, &ocr, &free, GatePolicy::FailOpen).await.unwrap());
    }

    #[tokio::test]
    async fn test_gate_follows_limit_when_storage_is_healthy() {
        let engine = engine_with(june_clock());
        let (s, ocr, locked) = (station(9), resource("ocr"), plan("locked"));

        assert!(engine.gate(s, &ocr, &locked, GatePolicy::FailClosed).await.unwrap());
        engine.record_usage(s, &ocr).await.unwrap();
        assert!(!engine.gate(s, &ocr, &locked, GatePolicy::FailOpen).await.unwrap());
    }
}
