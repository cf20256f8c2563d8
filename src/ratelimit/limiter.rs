//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::fingerprint::{Fingerprint, Identity};
use super::policy::{Decision, Policy};
use super::rules::PolicyRules;
use super::store::WindowStore;
use super::sweeper::{SweepReport, Sweeper};
use super::window::Window;
use crate::error::Result;

/// The rate limiter that decides on attempts and records accepted ones.
///
/// Every decision reads the fingerprint's record from the store, evaluates the
/// policy and, when the attempt is accepted, writes the updated record back.
/// Storage failures never surface from a decision: unreadable history counts
/// as no history and a failed write still lets the attempt through.
///
/// Checks for the same fingerprint are serialized within this process by
/// default. Separate processes sharing a store can still race on the same
/// fingerprint, in which case a burst may briefly exceed the quota.
pub struct RateLimiter {
    /// Persistent per-fingerprint windows
    store: Arc<dyn WindowStore>,
    /// Policy lookup by action
    rules: PolicyRules,
    /// Maintenance run after each accepted attempt
    sweeper: Option<Sweeper>,
    /// In-flight checks by fingerprint, when serialization is enabled
    locks: Option<DashMap<Fingerprint, Arc<Mutex<()>>>>,
}

impl RateLimiter {
    /// Create a rate limiter with default rules and retention.
    pub fn new(store: Arc<dyn WindowStore>) -> Self {
        Self {
            store,
            rules: PolicyRules::default(),
            sweeper: Some(Sweeper::default()),
            locks: Some(DashMap::new()),
        }
    }

    /// Use the given policy rules.
    pub fn with_rules(mut self, rules: PolicyRules) -> Self {
        self.rules = rules;
        self
    }

    /// Use the given sweeper, or disable opportunistic sweeping with `None`.
    pub fn with_sweeper(mut self, sweeper: Option<Sweeper>) -> Self {
        self.sweeper = sweeper;
        self
    }

    /// Enable or disable per-fingerprint serialization of checks.
    pub fn serialize_per_fingerprint(mut self, enabled: bool) -> Self {
        self.locks = enabled.then(DashMap::new);
        self
    }

    pub fn rules(&self) -> &PolicyRules {
        &self.rules
    }

    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }

    /// Check an attempt at `action` by `identity`, using the action's policy.
    pub async fn check(&self, action: &str, identity: &Identity, now: i64) -> Decision {
        let fingerprint = Fingerprint::new(action, identity);
        let policy = *self.rules.policy_for(action);

        trace!(action = %action, fingerprint = %fingerprint, "Checking rate limit");
        self.check_and_record(&fingerprint, now, &policy).await
    }

    /// Decide on an attempt at `now` and record it if allowed.
    pub async fn check_and_record(
        &self,
        fingerprint: &Fingerprint,
        now: i64,
        policy: &Policy,
    ) -> Decision {
        let slot = self.slot(fingerprint);
        let guard = match &slot {
            Some(slot) => Some(slot.mutex.lock().await),
            None => None,
        };
        let decision = self.decide(fingerprint, now, policy).await;
        drop(guard);
        drop(slot);

        if decision.is_allowed() {
            if let Some(sweeper) = &self.sweeper {
                sweeper.sweep(self.store.as_ref(), system_time(now)).await;
            }
        }

        decision
    }

    /// The attempts currently counted against a fingerprint. Never writes.
    pub async fn window(&self, fingerprint: &Fingerprint, now: i64, policy: &Policy) -> Window {
        self.load_window(fingerprint, now, policy).await
    }

    /// Forget all history for a fingerprint.
    pub async fn reset(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let removed = self.store.delete(fingerprint).await?;
        debug!(fingerprint = %fingerprint, removed, "Reset rate limit history");
        Ok(removed)
    }

    /// Run maintenance now, with the configured sweeper or the default one.
    pub async fn sweep(&self, now: i64) -> SweepReport {
        let sweeper = self.sweeper.unwrap_or_default();
        sweeper.sweep(self.store.as_ref(), system_time(now)).await
    }

    async fn decide(&self, fingerprint: &Fingerprint, now: i64, policy: &Policy) -> Decision {
        let mut window = self.load_window(fingerprint, now, policy).await;
        let decision = policy.evaluate(&window, now);

        if decision.is_allowed() {
            window.record(now);
            if let Err(e) = self.store.save(fingerprint, window.as_slice()).await {
                warn!(
                    fingerprint = %fingerprint,
                    error = %e,
                    "Failed to persist window, allowing attempt without recording it"
                );
            }
        } else {
            debug!(
                fingerprint = %fingerprint,
                decision = %decision,
                attempts = window.len(),
                max_attempts = policy.max_attempts,
                "Rate limit exceeded"
            );
        }

        decision
    }

    async fn load_window(&self, fingerprint: &Fingerprint, now: i64, policy: &Policy) -> Window {
        let stored = match self.store.load(fingerprint).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(
                    fingerprint = %fingerprint,
                    error = %e,
                    "Failed to load window, treating as empty"
                );
                Vec::new()
            }
        };

        Window::at(stored, now, policy.window_secs)
    }

    /// Register interest in the fingerprint's mutex. The registration is
    /// dropped with the slot, including when the check is cancelled.
    fn slot(&self, fingerprint: &Fingerprint) -> Option<LockSlot<'_>> {
        let locks = self.locks.as_ref()?;
        let mutex = locks.entry(fingerprint.clone()).or_default().clone();
        Some(LockSlot {
            locks,
            fingerprint: fingerprint.clone(),
            mutex,
        })
    }

    /// Number of fingerprints with a check in flight.
    pub fn in_flight(&self) -> usize {
        self.locks.as_ref().map_or(0, DashMap::len)
    }
}

/// One task's claim on a fingerprint's mutex.
struct LockSlot<'a> {
    locks: &'a DashMap<Fingerprint, Arc<Mutex<()>>>,
    fingerprint: Fingerprint,
    mutex: Arc<Mutex<()>>,
}

impl Drop for LockSlot<'_> {
    fn drop(&mut self) {
        // Only the map and this slot hold the mutex: nobody else is waiting.
        self.locks
            .remove_if(&self.fingerprint, |_, mutex| Arc::strong_count(mutex) == 2);
    }
}

fn system_time(now: i64) -> SystemTime {
    let offset = Duration::from_secs(now.unsigned_abs());
    if now >= 0 {
        SystemTime::UNIX_EPOCH + offset
    } else {
        SystemTime::UNIX_EPOCH - offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FloodgateError;
    use crate::ratelimit::{MemoryStore, StoredEntry};
    use async_trait::async_trait;

    const T: i64 = 1_700_000_000;

    fn test_policy() -> Policy {
        Policy::new(30, 5, 86_400)
    }

    fn test_fingerprint() -> Fingerprint {
        Fingerprint::new("submit-contact-form", &Identity::new("203.0.113.7", "Mozilla/5.0"))
    }

    fn memory_limiter() -> (Arc<MemoryStore>, RateLimiter) {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone());
        (store, limiter)
    }

    #[tokio::test]
    async fn test_scenario_quota_exhaustion() {
        let (_, limiter) = memory_limiter();
        let fp = test_fingerprint();

        for offset in [0, 31, 62, 93, 124] {
            let decision = limiter.check_and_record(&fp, T + offset, &test_policy()).await;
            assert!(decision.is_allowed(), "attempt at T+{} should be allowed", offset);
        }

        let decision = limiter.check_and_record(&fp, T + 155, &test_policy()).await;
        assert!(matches!(decision, Decision::DeniedQuota { .. }));
    }

    #[tokio::test]
    async fn test_scenario_spacing() {
        let (_, limiter) = memory_limiter();
        let fp = test_fingerprint();

        let first = limiter.check_and_record(&fp, T, &test_policy()).await;
        assert_eq!(first, Decision::Allowed { remaining: 4 });

        let second = limiter.check_and_record(&fp, T + 5, &test_policy()).await;
        assert_eq!(second, Decision::DeniedSpacing { retry_after_secs: 25 });
    }

    #[tokio::test]
    async fn test_scenario_stale_entry_ignored() {
        let (store, limiter) = memory_limiter();
        let fp = test_fingerprint();
        store.save(&fp, &[T - 90_000]).await.unwrap();

        let decision = limiter.check_and_record(&fp, T, &test_policy()).await;

        assert_eq!(decision, Decision::Allowed { remaining: 4 });
        // The expired timestamp is dropped when the window is rewritten.
        assert_eq!(store.load(&fp).await.unwrap(), vec![T]);
    }

    #[tokio::test]
    async fn test_allowed_appends_latest_timestamp() {
        let (store, limiter) = memory_limiter();
        let fp = test_fingerprint();

        limiter.check_and_record(&fp, T, &test_policy()).await;
        limiter.check_and_record(&fp, T + 40, &test_policy()).await;

        let stored = store.load(&fp).await.unwrap();
        assert_eq!(stored, vec![T, T + 40]);
        assert_eq!(stored.last(), Some(&(T + 40)));
    }

    #[tokio::test]
    async fn test_denied_attempts_are_not_recorded() {
        let (store, limiter) = memory_limiter();
        let fp = test_fingerprint();

        limiter.check_and_record(&fp, T, &test_policy()).await;
        limiter.check_and_record(&fp, T + 1, &test_policy()).await;

        assert_eq!(store.load(&fp).await.unwrap(), vec![T]);
    }

    #[tokio::test]
    async fn test_quota_precedence_with_full_window() {
        let (store, limiter) = memory_limiter();
        let fp = test_fingerprint();
        store
            .save(&fp, &[T - 5000, T - 4000, T - 3000, T - 2000, T - 1000])
            .await
            .unwrap();

        // Well spaced from the last attempt, but the quota is used up.
        let decision = limiter.check_and_record(&fp, T, &test_policy()).await;
        assert!(matches!(decision, Decision::DeniedQuota { .. }));
    }

    #[tokio::test]
    async fn test_window_reads_do_not_write() {
        let (store, limiter) = memory_limiter();
        let fp = test_fingerprint();
        store.save(&fp, &[T - 90_000, T - 100]).await.unwrap();

        let first = limiter.window(&fp, T, &test_policy()).await;
        let second = limiter.window(&fp, T, &test_policy()).await;

        assert_eq!(first, second);
        assert_eq!(first.as_slice(), &[T - 100]);
        assert_eq!(store.load(&fp).await.unwrap(), vec![T - 90_000, T - 100]);
    }

    #[tokio::test]
    async fn test_check_uses_action_policy_and_ignores_token() {
        let store = Arc::new(MemoryStore::new());
        let rules = PolicyRules::default().with_action("login", Policy::new(0, 1, 60));
        let limiter = RateLimiter::new(store.clone()).with_rules(rules);

        let identity = Identity::new("10.0.0.1", "agent").token("cookie-1");
        assert!(limiter.check("login", &identity, T).await.is_allowed());

        // Discarding the cookie does not reset the history.
        let without_cookie = Identity::new("10.0.0.1", "agent");
        let decision = limiter.check("login", &without_cookie, T + 1).await;
        assert!(matches!(decision, Decision::DeniedQuota { .. }));

        // Other actions fall back to the default policy.
        assert!(limiter.check("signup", &without_cookie, T + 1).await.is_allowed());
    }

    #[tokio::test]
    async fn test_reset_forgets_history() {
        let (_, limiter) = memory_limiter();
        let fp = test_fingerprint();

        limiter.check_and_record(&fp, T, &test_policy()).await;
        assert!(limiter.reset(&fp).await.unwrap());
        assert!(!limiter.reset(&fp).await.unwrap());

        let decision = limiter.check_and_record(&fp, T + 1, &test_policy()).await;
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_allowed_decision_triggers_sweep() {
        let (store, limiter) = memory_limiter();
        let stale = Fingerprint::new("old", &Identity::default());
        store.insert_with_modified(stale.clone(), vec![1], SystemTime::UNIX_EPOCH);

        limiter.check_and_record(&test_fingerprint(), T, &test_policy()).await;

        assert!(!store.contains(&stale));
        assert!(store.contains(&test_fingerprint()));
    }

    #[tokio::test]
    async fn test_denied_decision_does_not_sweep() {
        let (store, limiter) = memory_limiter();
        let fp = test_fingerprint();
        store.save(&fp, &[T - 1]).await.unwrap();
        let stale = Fingerprint::new("old", &Identity::default());
        store.insert_with_modified(stale.clone(), vec![1], SystemTime::UNIX_EPOCH);

        let decision = limiter.check_and_record(&fp, T, &test_policy()).await;

        assert!(!decision.is_allowed());
        assert!(store.contains(&stale));
    }

    #[tokio::test]
    async fn test_sweeping_can_be_disabled() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone()).with_sweeper(None);
        let stale = Fingerprint::new("old", &Identity::default());
        store.insert_with_modified(stale.clone(), vec![1], SystemTime::UNIX_EPOCH);

        limiter.check_and_record(&test_fingerprint(), T, &test_policy()).await;
        assert!(store.contains(&stale));

        // An explicit sweep still falls back to the default retention.
        let report = limiter.sweep(T).await;
        assert_eq!(report.expired, 1);
        assert!(!store.contains(&stale));
    }

    #[tokio::test]
    async fn test_locks_are_released() {
        let (_, limiter) = memory_limiter();

        limiter.check_and_record(&test_fingerprint(), T, &test_policy()).await;
        assert_eq!(limiter.in_flight(), 0);
    }

    /// A store whose reads take far longer than any caller waits.
    struct StalledStore;

    #[async_trait]
    impl WindowStore for StalledStore {
        async fn load(&self, _: &Fingerprint) -> Result<Vec<i64>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }

        async fn save(&self, _: &Fingerprint, _: &[i64]) -> Result<()> {
            Ok(())
        }

        async fn enumerate(&self) -> Result<Vec<StoredEntry>> {
            Ok(Vec::new())
        }

        async fn delete(&self, _: &Fingerprint) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_cancelled_checks_release_locks() {
        let limiter = RateLimiter::new(Arc::new(StalledStore));

        for i in 0..100 {
            let fp = Fingerprint::new("slow", &Identity::new(format!("10.1.0.{}", i), "agent"));
            let result = tokio::time::timeout(
                Duration::from_millis(1),
                limiter.check_and_record(&fp, T, &test_policy()),
            )
            .await;
            assert!(result.is_err());
        }

        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiters_on_one_fingerprint_release_locks() {
        let limiter = RateLimiter::new(Arc::new(StalledStore));
        let fp = test_fingerprint();
        let policy = test_policy();

        // The first check holds the mutex; the rest are cancelled while waiting.
        let checks = (0..8).map(|_| {
            tokio::time::timeout(
                Duration::from_millis(5),
                limiter.check_and_record(&fp, T, &policy),
            )
        });
        let results = futures::future::join_all(checks).await;

        assert!(results.iter().all(|r| r.is_err()));
        assert_eq!(limiter.in_flight(), 0);
    }

    /// A store where every operation fails.
    struct FailingStore;

    #[async_trait]
    impl WindowStore for FailingStore {
        async fn load(&self, _: &Fingerprint) -> Result<Vec<i64>> {
            Err(FloodgateError::Storage("load failed".to_string()))
        }

        async fn save(&self, _: &Fingerprint, _: &[i64]) -> Result<()> {
            Err(FloodgateError::Storage("save failed".to_string()))
        }

        async fn enumerate(&self) -> Result<Vec<StoredEntry>> {
            Err(FloodgateError::Storage("enumerate failed".to_string()))
        }

        async fn delete(&self, _: &Fingerprint) -> Result<bool> {
            Err(FloodgateError::Storage("delete failed".to_string()))
        }
    }

    #[tokio::test]
    async fn test_storage_failures_fail_open() {
        let limiter = RateLimiter::new(Arc::new(FailingStore));
        let fp = test_fingerprint();

        // Nothing is ever recorded, so every well-formed attempt is allowed.
        for offset in 0..10 {
            let decision = limiter.check_and_record(&fp, T + offset, &test_policy()).await;
            assert_eq!(decision, Decision::Allowed { remaining: 4 });
        }

        assert!(limiter.reset(&fp).await.is_err());
        assert_eq!(limiter.sweep(T).await.failures, 1);
    }

    #[test]
    fn test_system_time_conversion() {
        assert_eq!(
            system_time(T),
            SystemTime::UNIX_EPOCH + Duration::from_secs(T as u64)
        );
        assert_eq!(
            system_time(-10),
            SystemTime::UNIX_EPOCH - Duration::from_secs(10)
        );
    }
}
