//! Tests for the resource pool

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cistern_core::{CisternError, Result};
use parking_lot::Mutex;

use super::*;
use crate::tasks::TaskRunner;

/// Manager handing out numbered resources
#[derive(Default)]
struct TestManager {
    next: AtomicU64,
    fail_acquire: AtomicBool,
    checkout_failures: Mutex<HashMap<u64, CisternError>>,
    fail_checkin: AtomicBool,
    fail_idle: AtomicBool,
    idle_tests: AtomicUsize,
    destroyed: Mutex<Vec<(u64, bool)>>,
}

impl TestManager {
    fn acquired(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    fn destroyed(&self) -> Vec<u64> {
        self.destroyed.lock().iter().map(|(id, _)| *id).collect()
    }

    fn fail_checkout_of(&self, id: u64, error: CisternError) {
        self.checkout_failures.lock().insert(id, error);
    }
}

#[async_trait]
impl ResourceManager for TestManager {
    type Resource = u64;

    fn resource_key(&self, resource: &u64) -> u64 {
        *resource
    }

    async fn acquire_resource(&self) -> Result<u64> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(CisternError::Connection("connection refused".into()));
        }
        Ok(self.next.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn refurbish_resource_on_checkout(&self, resource: &u64) -> Result<()> {
        match self.checkout_failures.lock().remove(resource) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn refurbish_resource_on_checkin(&self, _resource: &u64) -> Result<()> {
        if self.fail_checkin.load(Ordering::SeqCst) {
            return Err(CisternError::Customizer {
                hook: "on_check_in",
                message: "rejected".into(),
            });
        }
        Ok(())
    }

    async fn refurbish_idle_resource(&self, _resource: &u64) -> Result<()> {
        self.idle_tests.fetch_add(1, Ordering::SeqCst);
        if self.fail_idle.load(Ordering::SeqCst) {
            return Err(CisternError::ConnectionInvalid("idle test failed".into()));
        }
        Ok(())
    }

    async fn destroy_resource(&self, resource: &u64, checked_out: bool) -> Result<()> {
        self.destroyed.lock().push((*resource, checked_out));
        Ok(())
    }
}

fn config(min: usize, max: usize) -> ResourcePoolConfig {
    ResourcePoolConfig::new(min, max)
        .with_acquire_attempts(2)
        .with_acquire_delay(Duration::from_millis(10))
}

async fn pool_with(
    manager: TestManager,
    config: ResourcePoolConfig,
) -> (ResourcePool<TestManager>, Arc<TaskRunner>) {
    let runner = Arc::new(TaskRunner::new("resource-test", 3));
    let pool = ResourcePool::new("test", manager, config, runner.clone()).await;
    (pool, runner)
}

async fn pool(config: ResourcePoolConfig) -> (ResourcePool<TestManager>, Arc<TaskRunner>) {
    pool_with(TestManager::default(), config).await
}

mod config_tests {
    use super::*;

    #[test]
    fn test_initial_size_is_clamped() {
        let config = ResourcePoolConfig::new(2, 5).with_initial_size(9);
        assert_eq!(config.initial_size(), 5);
        let config = ResourcePoolConfig::new(2, 5).with_initial_size(0);
        assert_eq!(config.initial_size(), 2);
    }

    #[test]
    fn test_expiration_interval_derived_from_limits() {
        let config = ResourcePoolConfig::new(0, 5);
        assert_eq!(config.expiration_check_interval(), None);
        assert!(!config.has_expiration());

        let config = config
            .with_max_idle_time(Some(Duration::from_secs(60)))
            .with_max_age(Some(Duration::from_secs(600)));
        assert_eq!(
            config.expiration_check_interval(),
            Some(Duration::from_secs(10))
        );

        let config = config.with_max_idle_time(Some(Duration::from_secs(2)));
        assert_eq!(
            config.expiration_check_interval(),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    #[should_panic(expected = "cannot exceed")]
    fn test_min_above_max_panics() {
        let _ = ResourcePoolConfig::new(6, 5);
    }
}

mod backoff_tests {
    use super::*;

    #[test]
    fn test_fixed_delay() {
        let backoff = BackoffStrategy::fixed(Duration::from_millis(250));
        assert_eq!(backoff.calculate_delay(0), Duration::from_millis(250));
        assert_eq!(backoff.calculate_delay(10), Duration::from_millis(250));
    }

    #[test]
    fn test_growing_delay_is_capped() {
        let backoff = BackoffStrategy::new(100, 1000);
        assert_eq!(backoff.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(backoff.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(backoff.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(backoff.calculate_delay(8), Duration::from_millis(1000));
    }

    #[test]
    fn test_multiplier_below_one_is_clamped() {
        let backoff = BackoffStrategy::new(100, 1000).with_multiplier(0.5);
        assert_eq!(backoff.calculate_delay(3), Duration::from_millis(100));
    }
}

mod checkout_tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_fill() {
        let (pool, _runner) = pool(config(2, 5).with_initial_size(3)).await;

        assert_eq!(pool.size(), 3);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.manager().acquired(), 3);
    }

    #[tokio::test]
    async fn test_checkin_makes_resource_available_again() {
        let (pool, _runner) = pool(config(1, 2)).await;

        let r = pool.checkout().await.unwrap();
        assert_eq!(pool.awaiting_checkin(), 1);
        assert_eq!(pool.available(), 0);

        pool.checkin(&r).await.unwrap();
        assert_eq!(pool.awaiting_checkin(), 0);
        assert_eq!(pool.available(), 1);

        let again = pool.checkout().await.unwrap();
        assert_eq!(again, r);
        assert_eq!(pool.manager().acquired(), 1);
    }

    #[tokio::test]
    async fn test_double_checkin_is_ignored() {
        let (pool, _runner) = pool(config(1, 2)).await;

        let r = pool.checkout().await.unwrap();
        pool.checkin(&r).await.unwrap();
        pool.checkin(&r).await.unwrap();

        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_pool_grows_on_demand_up_to_max() {
        let (pool, _runner) = pool(config(0, 3)).await;
        assert_eq!(pool.size(), 0);

        let a = pool.checkout().await.unwrap();
        let b = pool.checkout().await.unwrap();
        let c = pool.checkout().await.unwrap();
        assert_eq!(pool.size(), 3);

        let err = pool
            .checkout_with_timeout(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_checkout_timeout());
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.stats().failed_checkouts, 1);

        for r in [a, b, c] {
            pool.checkin(&r).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_blocked_checkout_proceeds_after_checkin() {
        let (pool, _runner) = pool(config(1, 1)).await;
        let pool = Arc::new(pool);

        let held = pool.checkout().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.checkout_with_timeout(Some(Duration::from_secs(5)))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(pool.stats().waiting, 1);

        pool.checkin(&held).await.unwrap();
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, held);
        assert_eq!(pool.stats().waiting, 0);
    }

    #[tokio::test]
    async fn test_invalid_resource_is_replaced_during_checkout() {
        let (pool, _runner) = pool(config(2, 3)).await;
        pool.manager()
            .fail_checkout_of(1, CisternError::ConnectionInvalid("stale".into()));

        let r = pool.checkout().await.unwrap();

        assert_eq!(r, 2);
        assert_eq!(pool.manager().destroyed(), vec![1]);
    }

    #[tokio::test]
    async fn test_other_checkout_error_is_surfaced() {
        let (pool, _runner) = pool(config(1, 1)).await;
        pool.manager().fail_checkout_of(
            1,
            CisternError::Customizer {
                hook: "on_check_out",
                message: "no".into(),
            },
        );

        let err = pool.checkout().await.unwrap_err();

        assert!(matches!(err, CisternError::Customizer { hook: "on_check_out", .. }));
        assert_eq!(pool.manager().destroyed(), vec![1]);
        assert_eq!(pool.awaiting_checkin(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_checkouts_never_exceed_max() {
        let (pool, _runner) = pool(config(1, 4)).await;
        let pool = Arc::new(pool);
        let out = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let pool = pool.clone();
                let out = out.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    for _ in 0..5 {
                        let r = pool.checkout().await.unwrap();
                        let now = out.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        assert!(pool.size() <= 4);
                        tokio::task::yield_now().await;
                        out.fetch_sub(1, Ordering::SeqCst);
                        pool.checkin(&r).await.unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert!(pool.manager().acquired() <= 4);
    }
}

mod failure_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_failed_acquisition_is_cannot_acquire() {
        let manager = TestManager::default();
        manager.fail_acquire.store(true, Ordering::SeqCst);
        let (pool, _runner) = pool_with(manager, config(0, 2)).await;

        let err = pool.checkout().await.unwrap_err();

        assert!(matches!(err, CisternError::CannotAcquire(_)));
        assert!(!err.is_checkout_timeout());
        let failure = pool.last_acquisition_failure().unwrap();
        assert!(failure.message.contains("connection refused"));
        assert!(!pool.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_break_after_acquire_failure_closes_pool() {
        let manager = TestManager::default();
        manager.fail_acquire.store(true, Ordering::SeqCst);
        let (pool, _runner) = pool_with(
            manager,
            config(1, 2).with_break_after_acquire_failure(true),
        )
        .await;

        assert!(pool.is_closed());
        assert!(pool.is_broken());
        let err = pool.checkout().await.unwrap_err();
        assert!(matches!(err, CisternError::CannotAcquire(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquisition_recovers_on_retry() {
        let (pool, runner) = pool(config(0, 2).with_acquire_attempts(0)).await;
        pool.manager().fail_acquire.store(true, Ordering::SeqCst);

        let checkout = pool.checkout_with_timeout(Some(Duration::from_secs(60)));
        tokio::pin!(checkout);
        tokio::select! {
            _ = &mut checkout => panic!("checkout should still be waiting"),
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
        pool.manager().fail_acquire.store(false, Ordering::SeqCst);

        let r = checkout.await.unwrap();
        assert_eq!(r, 1);
        pool.checkin(&r).await.unwrap();
        runner.wait_idle().await;
    }

    #[tokio::test]
    async fn test_checkin_failure_destroys_and_returns_error() {
        let (pool, _runner) = pool(config(0, 1)).await;
        let r = pool.checkout().await.unwrap();
        pool.manager().fail_checkin.store(true, Ordering::SeqCst);

        let err = pool.checkin(&r).await.unwrap_err();

        assert!(matches!(err, CisternError::Customizer { .. }));
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.stats().failed_checkins, 1);
        assert!(pool.stats().last_checkin_failure.is_some());
    }
}

mod broken_tests {
    use super::*;

    #[tokio::test]
    async fn test_broken_checked_out_resource_destroyed_at_checkin() {
        let (pool, runner) = pool(config(1, 2)).await;
        let r = pool.checkout().await.unwrap();

        pool.mark_broken(&r).await;
        assert!(pool.manager().destroyed().is_empty());

        pool.checkin(&r).await.unwrap();
        runner.wait_idle().await;

        assert_eq!(pool.manager().destroyed.lock().clone(), vec![(r, false)]);
        assert_eq!(pool.size(), 1, "pool refills to its minimum");
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_broken_idle_resource_destroyed_immediately() {
        let (pool, runner) = pool(config(2, 2)).await;
        let r = pool.checkout().await.unwrap();
        pool.checkin(&r).await.unwrap();

        pool.mark_broken(&r).await;
        runner.wait_idle().await;

        assert_eq!(pool.manager().destroyed(), vec![r]);
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn test_marking_one_broken_leaves_others_alone() {
        let (pool, _runner) = pool(config(2, 2)).await;
        let a = pool.checkout().await.unwrap();
        let b = pool.checkout().await.unwrap();

        pool.mark_broken(&a).await;
        pool.checkin(&b).await.unwrap();

        assert_eq!(pool.available(), 1);
        assert!(!pool.manager().destroyed().contains(&b));
        pool.checkin(&a).await.unwrap();
        assert!(pool.manager().destroyed().contains(&a));
    }

    #[tokio::test]
    async fn test_reset_pool_excludes_checked_out_resources() {
        let (pool, runner) = pool(config(2, 3).with_initial_size(3)).await;
        let out = pool.checkout().await.unwrap();

        pool.reset_pool().await;
        runner.wait_idle().await;

        assert_eq!(pool.excluded(), 1);
        assert_eq!(pool.manager().destroyed().len(), 2);
        assert!(!pool.manager().destroyed().contains(&out));

        pool.checkin(&out).await.unwrap();
        runner.wait_idle().await;
        assert_eq!(pool.excluded(), 0);
        assert!(pool.manager().destroyed().contains(&out));
        assert!(pool.size() >= 2);
    }

    #[tokio::test]
    async fn test_close_destroys_everything() {
        let (pool, _runner) = pool(config(2, 3)).await;
        let out = pool.checkout().await.unwrap();

        pool.close().await;

        assert!(pool.is_closed());
        assert_eq!(pool.size(), 0);
        let destroyed = pool.manager().destroyed.lock().clone();
        assert_eq!(destroyed.len(), 2);
        assert!(destroyed.contains(&(out, true)));
        assert!(matches!(
            pool.checkout().await.unwrap_err(),
            CisternError::Closed(_)
        ));
        // a late checkin is harmless
        pool.checkin(&out).await.unwrap();
    }

    #[tokio::test]
    async fn test_graceful_close_waits_for_checked_out() {
        let (pool, _runner) = pool(config(2, 3)).await;
        let out = pool.checkout().await.unwrap();

        pool.close_gracefully().await;

        assert!(pool.is_closed());
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.awaiting_checkin(), 1);
        assert_eq!(pool.manager().destroyed.lock().len(), 1);
        assert!(pool.checkout().await.is_err());

        pool.checkin(&out).await.unwrap();
        assert_eq!(pool.size(), 0);
        assert!(pool.manager().destroyed().contains(&out));
    }
}

mod maintenance_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_idle_resources_expire() {
        let (pool, _runner) = pool(
            config(0, 3)
                .with_initial_size(0)
                .with_max_idle_time(Some(Duration::from_secs(2))),
        )
        .await;
        let r = pool.checkout().await.unwrap();
        pool.checkin(&r).await.unwrap();
        assert_eq!(pool.size(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(pool.size(), 0);
        assert_eq!(pool.manager().destroyed(), vec![r]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_excess_idle_expiry_keeps_minimum() {
        let (pool, _runner) = pool(
            config(1, 3)
                .with_initial_size(3)
                .with_max_idle_time_excess(Some(Duration::from_secs(2))),
        )
        .await;
        assert_eq!(pool.size(), 3);

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(pool.size(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreturned_resource_is_destroyed() {
        let (pool, _runner) = pool(
            config(0, 1)
                .with_unreturned_timeout(Some(Duration::from_secs(3)))
                .with_debug_backtraces(true),
        )
        .await;
        let r = pool.checkout().await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(pool.manager().destroyed.lock().clone(), vec![(r, true)]);
        assert_eq!(pool.awaiting_checkin(), 0);
        pool.checkin(&r).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_idle_test_destroys_resource() {
        let (pool, runner) = pool(
            config(1, 1).with_idle_test_period(Some(Duration::from_secs(1))),
        )
        .await;
        pool.manager().fail_idle.store(true, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        runner.wait_idle().await;

        assert!(pool.manager().idle_tests.load(Ordering::SeqCst) >= 1);
        assert!(pool.manager().destroyed().contains(&1));
        assert!(pool.stats().failed_idle_tests >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_passing_idle_test_keeps_resource() {
        let (pool, runner) = pool(
            config(1, 1).with_idle_test_period(Some(Duration::from_secs(1))),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(3500)).await;
        runner.wait_idle().await;

        assert!(pool.manager().idle_tests.load(Ordering::SeqCst) >= 3);
        assert!(pool.manager().destroyed().is_empty());
        assert_eq!(pool.available(), 1);
    }
}
