//! Daily message quota enforcement.
//!
//! Counters are keyed by user and UTC calendar day and expire at the next UTC
//! midnight, so no reset job exists. The real controller is selected at
//! startup when a counter store is configured; otherwise [`NoopAdmission`]
//! admits everything.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use shared::config::server::FailurePolicy;
use tracing::{debug, warn};

use super::{
    clock::{Clock, next_utc_midnight, system_clock},
    counter_store::{CounterStore, CounterStoreError},
};

/// Result of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub used: i64,
    pub limit: i64,
}

/// Sentinel returned by [`AdmissionController::remaining_messages`] for
/// unlimited tenants.
pub const UNLIMITED: i64 = -1;

/// Daily per-user message quota.
#[async_trait]
pub trait AdmissionController: Send + Sync {
    /// Reads today's count for `user_id`. A `daily_limit` of zero or less
    /// means unlimited.
    async fn check_daily_limit(
        &self,
        user_id: &str,
        tenant_id: Option<&str>,
        daily_limit: i64,
    ) -> AdmissionDecision;

    /// Adds one to today's count and pins its expiry to the next UTC midnight.
    async fn increment_daily_count(&self, user_id: &str) -> Result<i64, CounterStoreError>;

    /// Messages left today, or [`UNLIMITED`].
    async fn remaining_messages(
        &self,
        user_id: &str,
        tenant_id: Option<&str>,
        daily_limit: i64,
    ) -> i64 {
        if daily_limit <= 0 {
            return UNLIMITED;
        }
        let decision = self
            .check_daily_limit(user_id, tenant_id, daily_limit)
            .await;
        (decision.limit - decision.used).max(0)
    }

    /// When today's counters expire.
    fn reset_at(&self) -> DateTime<Utc>;
}

/// Counter-store backed controller.
pub struct QuotaAdmission {
    store: Arc<dyn CounterStore>,
    policy: FailurePolicy,
    clock: Clock,
}

impl std::fmt::Debug for QuotaAdmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaAdmission")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl QuotaAdmission {
    /// Controller over `store` using the system clock.
    pub fn new(store: Arc<dyn CounterStore>, policy: FailurePolicy) -> Self {
        Self::with_clock(store, policy, system_clock())
    }

    pub fn with_clock(store: Arc<dyn CounterStore>, policy: FailurePolicy, clock: Clock) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    fn key_for(&self, user_id: &str) -> String {
        quota_key(user_id, (self.clock)())
    }
}

/// Counter key for `user_id` on the UTC day containing `now`.
pub fn quota_key(user_id: &str, now: DateTime<Utc>) -> String {
    format!("quota:{user_id}:{}", now.format("%Y-%m-%d"))
}

#[async_trait]
impl AdmissionController for QuotaAdmission {
    async fn check_daily_limit(
        &self,
        user_id: &str,
        tenant_id: Option<&str>,
        daily_limit: i64,
    ) -> AdmissionDecision {
        if daily_limit <= 0 {
            counter!("chatgate_admission_decisions_total", "outcome" => "unlimited").increment(1);
            return AdmissionDecision {
                allowed: true,
                used: 0,
                limit: daily_limit,
            };
        }

        let used = match self.store.get(&self.key_for(user_id)).await {
            Ok(value) => value.unwrap_or(0),
            Err(err) => {
                counter!("chatgate_admission_store_errors_total").increment(1);
                return match self.policy {
                    FailurePolicy::Open => {
                        warn!(
                            user_id,
                            tenant_id = tenant_id.unwrap_or("-"),
                            error = %err,
                            "counter store unreachable; admitting request"
                        );
                        counter!("chatgate_admission_decisions_total", "outcome" => "fail_open")
                            .increment(1);
                        AdmissionDecision {
                            allowed: true,
                            used: 0,
                            limit: daily_limit,
                        }
                    }
                    FailurePolicy::Closed => {
                        warn!(
                            user_id,
                            tenant_id = tenant_id.unwrap_or("-"),
                            error = %err,
                            "counter store unreachable; rejecting request"
                        );
                        counter!("chatgate_admission_decisions_total", "outcome" => "fail_closed")
                            .increment(1);
                        AdmissionDecision {
                            allowed: false,
                            used: daily_limit,
                            limit: daily_limit,
                        }
                    }
                };
            }
        };

        let allowed = used < daily_limit;
        let outcome = if allowed { "allowed" } else { "rejected" };
        counter!("chatgate_admission_decisions_total", "outcome" => outcome).increment(1);
        debug!(user_id, used, limit = daily_limit, allowed, "quota checked");

        AdmissionDecision {
            allowed,
            used,
            limit: daily_limit,
        }
    }

    async fn increment_daily_count(&self, user_id: &str) -> Result<i64, CounterStoreError> {
        let now = (self.clock)();
        let key = quota_key(user_id, now);
        self.store
            .increment_and_expire(&key, next_utc_midnight(now))
            .await
            .inspect_err(|_| {
                counter!("chatgate_admission_store_errors_total").increment(1);
            })
    }

    fn reset_at(&self) -> DateTime<Utc> {
        next_utc_midnight((self.clock)())
    }
}

/// Admits every request and counts nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAdmission;

#[async_trait]
impl AdmissionController for NoopAdmission {
    async fn check_daily_limit(
        &self,
        _user_id: &str,
        _tenant_id: Option<&str>,
        daily_limit: i64,
    ) -> AdmissionDecision {
        AdmissionDecision {
            allowed: true,
            used: 0,
            limit: daily_limit,
        }
    }

    async fn increment_daily_count(&self, _user_id: &str) -> Result<i64, CounterStoreError> {
        Ok(0)
    }

    async fn remaining_messages(
        &self,
        _user_id: &str,
        _tenant_id: Option<&str>,
        _daily_limit: i64,
    ) -> i64 {
        UNLIMITED
    }

    fn reset_at(&self) -> DateTime<Utc> {
        next_utc_midnight(Utc::now())
    }
}

/// Picks the controller variant once at startup.
pub fn build_admission(
    enabled: bool,
    store: Option<Arc<dyn CounterStore>>,
    policy: FailurePolicy,
) -> Arc<dyn AdmissionController> {
    match store {
        Some(store) if enabled => Arc::new(QuotaAdmission::new(store, policy)),
        _ => Arc::new(NoopAdmission),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::counter_store::InMemoryCounterStore;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicI64, Ordering};

    fn manual_clock(start: DateTime<Utc>) -> (Clock, Arc<AtomicI64>) {
        let now = Arc::new(AtomicI64::new(start.timestamp()));
        let reader = now.clone();
        let clock: Clock = Arc::new(move || {
            Utc.timestamp_opt(reader.load(Ordering::SeqCst), 0)
                .single()
                .expect("valid timestamp")
        });
        (clock, now)
    }

    fn controller(start: DateTime<Utc>) -> (QuotaAdmission, Arc<InMemoryCounterStore>, Arc<AtomicI64>) {
        let (clock, now) = manual_clock(start);
        let store = Arc::new(InMemoryCounterStore::with_clock(clock.clone()));
        let admission = QuotaAdmission::with_clock(store.clone(), FailurePolicy::Open, clock);
        (admission, store, now)
    }

    #[tokio::test]
    async fn first_check_of_the_day_is_allowed_with_zero_used() {
        let (admission, _, _) = controller(Utc::now());
        let decision = admission.check_daily_limit("u1", Some("t1"), 3).await;
        assert_eq!(
            decision,
            AdmissionDecision {
                allowed: true,
                used: 0,
                limit: 3
            }
        );
    }

    #[tokio::test]
    async fn quota_is_monotonic_until_the_day_rolls_over() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 22, 0, 0).unwrap();
        let (admission, _, now) = controller(start);

        for expected in 1..=3 {
            assert_eq!(admission.increment_daily_count("u1").await.unwrap(), expected);
            let decision = admission.check_daily_limit("u1", None, 3).await;
            assert_eq!(decision.used, expected);
        }

        let decision = admission.check_daily_limit("u1", None, 3).await;
        assert!(!decision.allowed);
        assert_eq!(admission.remaining_messages("u1", None, 3).await, 0);

        now.store(
            (start + Duration::hours(2)).timestamp(),
            Ordering::SeqCst,
        );
        let decision = admission.check_daily_limit("u1", None, 3).await;
        assert!(decision.allowed);
        assert_eq!(decision.used, 0);
    }

    #[tokio::test]
    async fn non_positive_limit_is_unlimited() {
        let (admission, _, _) = controller(Utc::now());
        for _ in 0..5 {
            admission.increment_daily_count("u1").await.unwrap();
        }
        for limit in [0, -4] {
            let decision = admission.check_daily_limit("u1", None, limit).await;
            assert!(decision.allowed);
            assert_eq!(decision.used, 0);
            assert_eq!(admission.remaining_messages("u1", None, limit).await, UNLIMITED);
        }
    }

    #[tokio::test]
    async fn remaining_never_goes_negative() {
        let (admission, _, _) = controller(Utc::now());
        for _ in 0..4 {
            admission.increment_daily_count("u1").await.unwrap();
        }
        assert_eq!(admission.remaining_messages("u1", None, 2).await, 0);
        assert_eq!(admission.remaining_messages("u1", None, 10).await, 6);
    }

    #[tokio::test]
    async fn store_outage_fails_open_by_default() {
        let (admission, store, _) = controller(Utc::now());
        store.set_unavailable(true);

        let decision = admission.check_daily_limit("u1", Some("t1"), 1).await;
        assert!(decision.allowed);
        assert!(admission.increment_daily_count("u1").await.is_err());
    }

    #[tokio::test]
    async fn store_outage_rejects_when_closed() {
        let store = Arc::new(InMemoryCounterStore::new());
        store.set_unavailable(true);
        let admission = QuotaAdmission::new(store, FailurePolicy::Closed);

        let decision = admission.check_daily_limit("u1", None, 5).await;
        assert!(!decision.allowed);
        assert_eq!(decision.used, 5);
    }

    #[tokio::test]
    async fn counters_are_per_user() {
        let (admission, _, _) = controller(Utc::now());
        admission.increment_daily_count("u1").await.unwrap();
        admission.increment_daily_count("u1").await.unwrap();

        assert_eq!(admission.check_daily_limit("u2", None, 2).await.used, 0);
        assert!(!admission.check_daily_limit("u1", None, 2).await.allowed);
    }

    #[tokio::test]
    async fn reset_is_next_utc_midnight() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        let (admission, _, _) = controller(start);
        assert_eq!(
            admission.reset_at(),
            Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn noop_admits_everything() {
        let admission = build_admission(false, None, FailurePolicy::Open);
        for _ in 0..10 {
            assert!(admission.check_daily_limit("u1", None, 1).await.allowed);
            admission.increment_daily_count("u1").await.unwrap();
        }
        assert_eq!(admission.remaining_messages("u1", None, 1).await, UNLIMITED);
    }

    #[test]
    fn key_is_day_bucketed() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        assert_eq!(quota_key("u1", now), "quota:u1:2024-05-01");
    }
}
