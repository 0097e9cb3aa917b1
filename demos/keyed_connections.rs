//! Keyed pool of fake database connections

use keyed_objectpool::{
    FactoryError, KeyedObjectPool, KeyedPoolConfig, KeyedResourceFactory, PoolError,
    WhenExhaustedAction,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[derive(Debug)]
struct Connection {
    id: usize,
    host: String,
    queries: usize,
}

#[derive(Default)]
struct ConnectionFactory {
    next_id: AtomicUsize,
}

impl KeyedResourceFactory<String, Connection> for ConnectionFactory {
    fn create(&self, host: &String) -> Result<Connection, FactoryError> {
        Ok(Connection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            host: host.clone(),
            queries: 0,
        })
    }

    fn validate(&self, _host: &String, conn: &Connection) -> bool {
        conn.queries < 100
    }

    fn passivate(&self, _host: &String, conn: &mut Connection) -> Result<(), FactoryError> {
        conn.queries += 1;
        Ok(())
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== Keyed object pool ===\n");

    per_key_pools();
    exhaustion_policies();
    eviction();
}

fn per_key_pools() {
    println!("1. Per-key pools:");
    let config = KeyedPoolConfig::new().with_max_active(4);
    let pool: KeyedObjectPool<String, Connection> =
        KeyedObjectPool::new(ConnectionFactory::default(), config);

    for host in ["db-1", "db-2"] {
        let conn = pool.borrow(&host.to_string()).unwrap();
        println!("   Got connection {} to {}", conn.id, conn.host);
    }

    println!(
        "   Idle per key: db-1={} db-2={}",
        pool.num_idle(&"db-1".into()),
        pool.num_idle(&"db-2".into())
    );
    println!("   Metrics: {:?}\n", pool.export_metrics());
}

fn exhaustion_policies() {
    println!("2. Exhaustion policies:");
    let host = "db-1".to_string();

    let failing: KeyedObjectPool<String, Connection> = KeyedObjectPool::new(
        ConnectionFactory::default(),
        KeyedPoolConfig::new()
            .with_max_active(1)
            .with_when_exhausted_action(WhenExhaustedAction::Fail),
    );
    let _held = failing.borrow(&host).unwrap();
    match failing.borrow(&host) {
        Err(PoolError::CapacityExhausted) => println!("   FAIL: capacity exhausted"),
        other => println!("   FAIL: unexpected {:?}", other.map(|conn| conn.id)),
    }

    let blocking: Arc<KeyedObjectPool<String, Connection>> = Arc::new(KeyedObjectPool::new(
        ConnectionFactory::default(),
        KeyedPoolConfig::new()
            .with_max_active(1)
            .with_max_wait(Duration::from_secs(1)),
    ));
    let held = blocking.borrow(&host).unwrap();
    let waiter = {
        let pool = Arc::clone(&blocking);
        let host = host.clone();
        thread::spawn(move || pool.borrow(&host).map(|conn| conn.id))
    };
    thread::sleep(Duration::from_millis(50));
    drop(held);
    println!("   BLOCK: waiter got connection {:?}", waiter.join().unwrap());

    let growing: KeyedObjectPool<String, Connection> = KeyedObjectPool::new(
        ConnectionFactory::default(),
        KeyedPoolConfig::new()
            .with_max_active(1)
            .with_when_exhausted_action(WhenExhaustedAction::Grow),
    );
    let first = growing.borrow(&host).unwrap();
    let second = growing.borrow(&host).unwrap();
    println!("   GROW: {} and {} borrowed past max_active=1\n", first.id, second.id);
}

fn eviction() {
    println!("3. Eviction:");
    let pool: KeyedObjectPool<String, Connection> = KeyedObjectPool::new(
        ConnectionFactory::default(),
        KeyedPoolConfig::new()
            .with_min_idle(1)
            .with_time_between_eviction_runs(Duration::from_millis(20))
            .with_min_evictable_idle_time(Duration::from_millis(20)),
    );
    let host = "db-1".to_string();
    for _ in 0..3 {
        pool.add_object(&host).unwrap();
    }
    println!("   Idle before eviction: {}", pool.num_idle(&host));

    thread::sleep(Duration::from_millis(200));
    println!("   Idle after eviction: {} (min_idle keeps one)", pool.num_idle(&host));
    println!("   Evicted: {}", pool.get_metrics().destroyed_by_evictor);

    #[cfg(feature = "metrics")]
    println!("\n{}", pool.export_metrics_prometheus("connections", None).unwrap());
}
