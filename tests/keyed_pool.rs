use keyed_objectpool::{
    FactoryError, KeyedObjectPool, KeyedObjectPoolFactory, KeyedPoolConfig, KeyedResourceFactory,
    PoolError, WhenExhaustedAction,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

/// Hands out sequential ids and records every hook call
#[derive(Default)]
struct TrackingFactory {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    activated: AtomicUsize,
    passivated: AtomicUsize,
    validated: Mutex<Vec<usize>>,
    invalid: AtomicBool,
    fail_activate: AtomicBool,
    fail_create: AtomicBool,
    fail_passivate: AtomicBool,
}

impl KeyedResourceFactory<String, usize> for TrackingFactory {
    fn create(&self, _key: &String) -> Result<usize, FactoryError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err("backend down".into());
        }
        Ok(self.created.fetch_add(1, Ordering::SeqCst))
    }

    fn destroy(&self, _key: &String, _resource: usize) -> Result<(), FactoryError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Err("destroy errors are only logged".into())
    }

    fn validate(&self, _key: &String, resource: &usize) -> bool {
        self.validated.lock().push(*resource);
        !self.invalid.load(Ordering::SeqCst)
    }

    fn activate(&self, _key: &String, _resource: &mut usize) -> Result<(), FactoryError> {
        if self.fail_activate.load(Ordering::SeqCst) {
            return Err("handshake failed".into());
        }
        self.activated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn passivate(&self, _key: &String, _resource: &mut usize) -> Result<(), FactoryError> {
        if self.fail_passivate.load(Ordering::SeqCst) {
            return Err("reset failed".into());
        }
        self.passivated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type TrackedPool = Arc<KeyedObjectPool<String, usize>>;

fn pool_with(config: KeyedPoolConfig) -> (Arc<TrackingFactory>, TrackedPool) {
    let factory = Arc::new(TrackingFactory::default());
    let pool = KeyedObjectPool::with_factory(factory.clone(), config);
    (factory, Arc::new(pool))
}

fn key(name: &str) -> String {
    name.to_string()
}

fn wait_for(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn factory_config_is_exposed_by_created_pool() {
    let config = KeyedPoolConfig::new()
        .with_max_active(1)
        .with_max_idle(2)
        .with_max_wait(Duration::from_millis(3))
        .with_min_idle(4)
        .with_min_evictable_idle_time(Duration::from_millis(5))
        .with_num_tests_per_eviction_run(6)
        .with_test_on_borrow(true)
        .with_test_on_return(false)
        .with_test_while_idle(true)
        .with_time_between_eviction_runs(Duration::from_millis(8))
        .with_when_exhausted_action(WhenExhaustedAction::Grow)
        .with_lifo(false);
    let factory: KeyedObjectPoolFactory<String, usize> =
        KeyedObjectPoolFactory::with_config(TrackingFactory::default(), config);
    assert_eq!(factory.config(), &config);

    let pool = factory.create_pool();
    assert_eq!(pool.max_active(), Some(1));
    assert_eq!(pool.max_idle(), Some(2));
    assert_eq!(pool.max_wait(), Some(Duration::from_millis(3)));
    assert_eq!(pool.min_idle(), 4);
    assert_eq!(pool.min_evictable_idle_time(), Some(Duration::from_millis(5)));
    assert_eq!(pool.num_tests_per_eviction_run(), 6);
    assert!(pool.test_on_borrow());
    assert!(!pool.test_on_return());
    assert!(pool.test_while_idle());
    assert!(!pool.lifo());
    assert_eq!(pool.time_between_eviction_runs(), Some(Duration::from_millis(8)));
    assert_eq!(pool.when_exhausted_action(), WhenExhaustedAction::Grow);
    pool.close();

    let factory: KeyedObjectPoolFactory<String, usize> =
        KeyedObjectPoolFactory::new(TrackingFactory::default());
    let pool = factory.create_pool();
    assert_eq!(pool.max_total(), None);
    assert_eq!(pool.when_exhausted_action(), WhenExhaustedAction::Block);
}

#[test]
fn grow_borrows_past_max_active_without_waiting() {
    let config = KeyedPoolConfig::new()
        .with_max_active(1)
        .with_max_wait(Duration::from_millis(3))
        .with_when_exhausted_action(WhenExhaustedAction::Grow);
    let (factory, pool) = pool_with(config);

    let first = pool.borrow(&key("a")).unwrap();
    let started = Instant::now();
    let second = pool.borrow(&key("a")).unwrap();

    assert!(started.elapsed() < Duration::from_millis(3));
    assert_ne!(*first, *second);
    assert_eq!(pool.num_active(&key("a")), 2);
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
}

#[test]
fn fail_returns_capacity_exhausted_immediately() {
    let config = KeyedPoolConfig::new()
        .with_max_active(1)
        .with_when_exhausted_action(WhenExhaustedAction::Fail);
    let (_factory, pool) = pool_with(config);

    let _held = pool.borrow(&key("a")).unwrap();
    assert!(matches!(pool.borrow(&key("a")), Err(PoolError::CapacityExhausted)));
    assert!(pool.borrow(&key("b")).is_ok());
    assert_eq!(pool.get_metrics().exhausted_events, 1);
}

#[test]
fn blocking_borrow_times_out_after_max_wait() {
    let config = KeyedPoolConfig::new()
        .with_max_active(1)
        .with_max_wait(Duration::from_millis(50))
        .with_when_exhausted_action(WhenExhaustedAction::Block);
    let (_factory, pool) = pool_with(config);

    let held = pool.borrow(&key("a")).unwrap();
    let started = Instant::now();
    let result = pool.borrow(&key("a"));
    let waited = started.elapsed();

    assert!(matches!(result, Err(PoolError::BorrowTimeout(_))));
    assert!(waited >= Duration::from_millis(50));
    assert!(waited < Duration::from_secs(2));
    assert_eq!(pool.num_waiters(&key("a")), 0);

    // The timed-out borrower left the queue, so the next return stays idle.
    drop(held);
    assert_eq!(pool.num_idle(&key("a")), 1);
}

#[test]
fn blocked_borrowers_are_served_in_arrival_order() {
    let config = KeyedPoolConfig::new()
        .with_max_active(1)
        .with_when_exhausted_action(WhenExhaustedAction::Block);
    let (_factory, pool) = pool_with(config);
    let held = pool.borrow(&key("a")).unwrap();
    let (served, order) = mpsc::channel();

    let mut handles = Vec::new();
    for name in ["first", "second"] {
        let worker_pool = Arc::clone(&pool);
        let served = served.clone();
        let queued = pool.num_waiters(&key("a"));
        handles.push(thread::spawn(move || {
            let obj = worker_pool.borrow(&key("a")).unwrap();
            served.send(name).unwrap();
            thread::sleep(Duration::from_millis(10));
            drop(obj);
        }));
        wait_for(|| pool.num_waiters(&key("a")) == queued + 1);
    }

    drop(held);
    for handle in handles {
        handle.join().unwrap();
    }
    let order: Vec<_> = order.try_iter().collect();
    assert_eq!(order, vec!["first", "second"]);
}

#[test]
fn lifo_hands_out_most_recent_return_first() {
    let (_factory, pool) = pool_with(KeyedPoolConfig::new().with_lifo(true));
    let first = pool.borrow(&key("a")).unwrap();
    let second = pool.borrow(&key("a")).unwrap();
    let (first_id, second_id) = (*first, *second);

    pool.return_object(first).unwrap();
    pool.return_object(second).unwrap();

    assert_eq!(*pool.borrow(&key("a")).unwrap(), second_id);
    assert_ne!(first_id, second_id);
}

#[test]
fn fifo_hands_out_oldest_return_first() {
    let (_factory, pool) = pool_with(KeyedPoolConfig::new().with_lifo(false));
    let first = pool.borrow(&key("a")).unwrap();
    let second = pool.borrow(&key("a")).unwrap();
    let first_id = *first;

    pool.return_object(first).unwrap();
    pool.return_object(second).unwrap();

    assert_eq!(*pool.borrow(&key("a")).unwrap(), first_id);
}

#[test]
fn returns_beyond_max_idle_are_destroyed() {
    let (factory, pool) = pool_with(KeyedPoolConfig::new().with_max_idle(1));
    let objects: Vec<_> = (0..3).map(|_| pool.borrow(&key("a")).unwrap()).collect();

    for obj in objects {
        pool.return_object(obj).unwrap();
        assert!(pool.num_idle(&key("a")) <= 1);
    }

    assert_eq!(pool.num_idle(&key("a")), 1);
    assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
}

#[test]
fn failed_return_validation_destroys_object() {
    let (factory, pool) = pool_with(KeyedPoolConfig::new().with_test_on_return(true));
    let obj = pool.borrow(&key("a")).unwrap();
    factory.invalid.store(true, Ordering::SeqCst);

    pool.return_object(obj).unwrap();

    assert_eq!(pool.num_idle(&key("a")), 0);
    assert_eq!(pool.num_active(&key("a")), 0);
    assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(factory.passivated.load(Ordering::SeqCst), 0);
}

#[test]
fn failed_borrow_validation_retries_with_a_new_object() {
    let (factory, pool) = pool_with(KeyedPoolConfig::new().with_test_on_borrow(true));
    pool.add_object(&key("a")).unwrap();
    pool.add_object(&key("a")).unwrap();
    factory.invalid.store(true, Ordering::SeqCst);

    let obj = pool.borrow(&key("a")).unwrap();

    assert_eq!(*obj, 2);
    assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
    assert_eq!(pool.get_metrics().destroyed_on_borrow_validation, 2);
}

#[test]
fn activation_failure_is_a_borrow_error() {
    let (factory, pool) = pool_with(KeyedPoolConfig::default());
    factory.fail_activate.store(true, Ordering::SeqCst);

    let result = pool.borrow(&key("a"));

    assert!(matches!(result, Err(PoolError::Factory { .. })));
    assert_eq!(pool.num_active(&key("a")), 0);
    assert_eq!(pool.num_active_total(), 0);
    assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn create_failure_releases_reserved_capacity() {
    let config = KeyedPoolConfig::new()
        .with_max_active(1)
        .with_when_exhausted_action(WhenExhaustedAction::Fail);
    let (factory, pool) = pool_with(config);
    factory.fail_create.store(true, Ordering::SeqCst);
    assert!(matches!(pool.borrow(&key("a")), Err(PoolError::Factory { .. })));

    factory.fail_create.store(false, Ordering::SeqCst);
    assert!(pool.borrow(&key("a")).is_ok());
}

#[test]
fn invalidate_discards_instead_of_returning() {
    let (factory, pool) = pool_with(KeyedPoolConfig::default());
    let obj = pool.borrow(&key("a")).unwrap();

    pool.invalidate(obj).unwrap();

    assert_eq!(pool.num_idle(&key("a")), 0);
    assert_eq!(pool.num_active(&key("a")), 0);
    assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn max_total_bounds_all_keys_and_reclaims_idle() {
    let config = KeyedPoolConfig::new()
        .with_max_total(2)
        .with_when_exhausted_action(WhenExhaustedAction::Fail);
    let (factory, pool) = pool_with(config);

    let a = pool.borrow(&key("a")).unwrap();
    let b = pool.borrow(&key("b")).unwrap();
    assert!(matches!(pool.borrow(&key("c")), Err(PoolError::CapacityExhausted)));

    // An idle object under another key is destroyed to make room.
    drop(b);
    assert_eq!(pool.num_idle(&key("b")), 1);
    let c = pool.borrow(&key("c")).unwrap();
    assert_eq!(pool.num_idle(&key("b")), 0);
    assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    assert!(pool.num_active_total() + pool.num_idle_total() <= 2);
    drop((a, c));
}

#[test]
fn capacity_freed_on_one_key_wakes_waiter_on_another() {
    let config = KeyedPoolConfig::new()
        .with_max_total(1)
        .with_max_idle(0)
        .with_max_wait(Duration::from_secs(5));
    let (_factory, pool) = pool_with(config);
    let held = pool.borrow(&key("a")).unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.borrow(&key("b")).map(|obj| *obj))
    };
    wait_for(|| pool.num_waiters(&key("b")) == 1);

    drop(held);
    assert!(waiter.join().unwrap().is_ok());
}

#[test]
fn close_wakes_blocked_borrowers_with_closed_error() {
    let config = KeyedPoolConfig::new().with_max_active(1);
    let (factory, pool) = pool_with(config);
    let held = pool.borrow(&key("a")).unwrap();
    pool.add_object(&key("b")).unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.borrow(&key("a")).map(|obj| *obj))
    };
    wait_for(|| pool.num_waiters(&key("a")) == 1);

    pool.close();
    assert!(matches!(waiter.join().unwrap(), Err(PoolError::PoolClosed)));
    assert_eq!(pool.num_idle(&key("b")), 0);

    // Objects coming back after close are destroyed, not re-pooled.
    drop(held);
    assert_eq!(pool.num_idle(&key("a")), 0);
    assert_eq!(pool.num_active(&key("a")), 0);
    assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
}

#[test]
fn clear_destroys_idle_objects_only() {
    let (factory, pool) = pool_with(KeyedPoolConfig::default());
    pool.add_object(&key("a")).unwrap();
    pool.add_object(&key("b")).unwrap();
    let held = pool.borrow(&key("c")).unwrap();

    pool.clear_key(&key("a"));
    assert_eq!(pool.num_idle(&key("a")), 0);
    assert_eq!(pool.num_idle(&key("b")), 1);

    pool.clear();
    assert_eq!(pool.num_idle_total(), 0);
    assert_eq!(pool.num_active(&key("c")), 1);
    assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
    assert!(!pool.is_closed());
    drop(held);
}

#[test]
fn eviction_destroys_stale_objects_but_respects_min_idle() {
    let config = KeyedPoolConfig::new()
        .with_min_idle(1)
        .with_min_evictable_idle_time(Duration::from_millis(10))
        .with_num_tests_per_eviction_run(10);
    let (factory, pool) = pool_with(config);
    pool.add_object(&key("a")).unwrap();
    pool.add_object(&key("a")).unwrap();
    pool.add_object(&key("b")).unwrap();
    thread::sleep(Duration::from_millis(20));

    pool.evict();

    assert_eq!(pool.num_idle(&key("a")), 1);
    assert_eq!(pool.num_idle(&key("b")), 1);
    assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.get_metrics().destroyed_by_evictor, 1);
}

#[test]
fn eviction_tops_up_min_idle() {
    let config = KeyedPoolConfig::new().with_min_idle(2).with_max_active(3);
    let (_factory, pool) = pool_with(config);
    let held = pool.borrow(&key("a")).unwrap();
    pool.prepare_pool(&key("b")).unwrap();
    assert_eq!(pool.num_idle(&key("b")), 2);

    pool.evict();
    assert_eq!(pool.num_idle(&key("a")), 2);

    // Only as far as capacity allows.
    pool.set_max_active(Some(2));
    pool.clear_key(&key("a"));
    pool.evict();
    assert_eq!(pool.num_idle(&key("a")), 1);
    drop(held);
}

#[test]
fn broken_idle_objects_are_destroyed_despite_min_idle() {
    let config = KeyedPoolConfig::new()
        .with_min_idle(1)
        .with_test_while_idle(true)
        .with_num_tests_per_eviction_run(-1);
    let (factory, pool) = pool_with(config);
    pool.add_object(&key("a")).unwrap();
    factory.invalid.store(true, Ordering::SeqCst);

    pool.evict();

    // Destroyed by the sweep, then replaced by the min_idle top-up.
    assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.num_idle(&key("a")), 1);
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
}

#[test]
fn background_evictor_removes_stale_objects() {
    let config = KeyedPoolConfig::new()
        .with_time_between_eviction_runs(Duration::from_millis(10))
        .with_min_evictable_idle_time(Duration::from_millis(10));
    let (_factory, pool) = pool_with(config);
    pool.add_object(&key("a")).unwrap();

    wait_for(|| pool.num_idle(&key("a")) == 0);

    pool.set_time_between_eviction_runs(None);
    assert_eq!(pool.time_between_eviction_runs(), None);
}

#[test]
fn concurrent_traffic_keeps_counts_within_limits() {
    let config = KeyedPoolConfig::new()
        .with_max_active(3)
        .with_max_total(5)
        .with_max_idle(2)
        .with_max_wait(Duration::from_secs(5))
        .with_time_between_eviction_runs(Duration::from_millis(1))
        .with_min_evictable_idle_time(Duration::from_millis(1));
    let (factory, pool) = pool_with(config);

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let name = key(if worker % 2 == 0 { "even" } else { "odd" });
                for _ in 0..200 {
                    let obj = pool.borrow(&name).unwrap();
                    let metrics = pool.get_metrics();
                    assert!(metrics.active_objects + metrics.idle_objects <= 5);
                    assert!(pool.num_active(&name) <= 3);
                    drop(obj);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(pool.num_active_total(), 0);
    pool.close();
    let created = factory.created.load(Ordering::SeqCst);
    assert_eq!(factory.destroyed.load(Ordering::SeqCst), created);
}

#[test]
fn every_returned_object_is_reused_or_destroyed_once() {
    let config = KeyedPoolConfig::new().with_max_idle(4).with_unbounded_active();
    let (factory, pool) = pool_with(config);
    let objects: Vec<_> = (0..6).map(|_| pool.borrow(&key("a")).unwrap()).collect();
    let ids: Vec<usize> = objects.iter().map(|obj| **obj).collect();

    for obj in objects {
        pool.return_object(obj).unwrap();
    }
    let reborrowed: Vec<_> = (0..4).map(|_| pool.borrow(&key("a")).unwrap()).collect();
    let mut reused: Vec<usize> = reborrowed.iter().map(|obj| **obj).collect();
    reused.sort_unstable();
    reused.dedup();

    assert_eq!(reused.len(), 4);
    assert!(reused.iter().all(|id| ids.contains(id)));
    assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
    assert_eq!(factory.created.load(Ordering::SeqCst), 6);
    assert_eq!(factory.activated.load(Ordering::SeqCst), 10);
}

#[test]
fn passivate_failure_on_return_destroys_object() {
    let (factory, pool) = pool_with(KeyedPoolConfig::new());
    let obj = pool.borrow(&key("a")).unwrap();

    factory.fail_passivate.store(true, Ordering::SeqCst);
    drop(obj);

    assert_eq!(pool.num_idle(&key("a")), 0);
    assert_eq!(pool.num_active(&key("a")), 0);
    assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);

    factory.fail_passivate.store(false, Ordering::SeqCst);
    assert_eq!(*pool.borrow(&key("a")).unwrap(), 1);
}

#[test]
fn eviction_sweeps_resume_where_the_last_one_stopped() {
    let config = KeyedPoolConfig::new()
        .with_test_while_idle(true)
        .with_num_tests_per_eviction_run(1);
    let (factory, pool) = pool_with(config);

    let a = pool.borrow(&key("a")).unwrap();
    let b = pool.borrow(&key("b")).unwrap();
    drop(a);
    drop(b);

    pool.evict();
    pool.evict();
    pool.evict();

    assert_eq!(*factory.validated.lock(), vec![0, 1, 0]);
    assert_eq!(pool.num_idle_total(), 2);
}

#[test]
fn min_idle_above_max_idle_tops_up_to_max_idle() {
    let config = KeyedPoolConfig::new().with_max_idle(2).with_min_idle(4);
    let (factory, pool) = pool_with(config);

    let (done, finished) = mpsc::channel();
    {
        let pool = pool.clone();
        thread::spawn(move || {
            let _ = done.send(pool.prepare_pool(&key("a")));
        });
    }
    let prepared = finished
        .recv_timeout(Duration::from_secs(5))
        .expect("prepare_pool did not return");
    assert!(prepared.is_ok());
    assert_eq!(pool.num_idle(&key("a")), 2);
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);

    pool.set_time_between_eviction_runs(Some(Duration::from_millis(1)));
    thread::sleep(Duration::from_millis(20));
    pool.close();

    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
}

#[test]
fn grow_counts_objects_created_past_max_total() {
    let config = KeyedPoolConfig::new()
        .with_max_active(1)
        .with_max_total(1)
        .with_when_exhausted_action(WhenExhaustedAction::Grow);
    let (factory, pool) = pool_with(config);

    let first = pool.borrow(&key("a")).unwrap();
    let second = pool.borrow(&key("a")).unwrap();
    let other = pool.borrow(&key("b")).unwrap();

    assert_eq!(pool.num_active_total(), 3);
    assert_eq!(pool.num_active(&key("a")), 2);
    assert_eq!(pool.num_active(&key("b")), 1);
    assert_eq!(factory.created.load(Ordering::SeqCst), 3);

    drop(first);
    drop(second);
    drop(other);
    assert_eq!(pool.num_active_total(), 0);
    assert_eq!(pool.num_idle_total(), 3);
}

#[test]
fn zero_durations_set_directly_mean_unbounded_or_disabled() {
    let mut config = KeyedPoolConfig::new().with_max_active(1);
    config.max_wait = Some(Duration::ZERO);
    config.time_between_eviction_runs = Some(Duration::ZERO);
    let (_factory, pool) = pool_with(config);
    assert_eq!(pool.max_wait(), None);
    assert_eq!(pool.time_between_eviction_runs(), None);

    let held = pool.borrow(&key("a")).unwrap();
    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || pool.borrow(&key("a")).map(|obj| *obj))
    };
    wait_for(|| pool.num_waiters(&key("a")) == 1);
    thread::sleep(Duration::from_millis(20));

    let id = *held;
    drop(held);
    assert_eq!(waiter.join().unwrap().unwrap(), id);

    pool.set_config(config);
    assert_eq!(pool.max_wait(), None);
    assert_eq!(pool.time_between_eviction_runs(), None);
}
