//! Unit tests for the connection pool.
//!
//! A scripted factory stands in for the backend so checkout, hand-off,
//! expiry, and shutdown behaviour can be driven in paused time.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use rstest::{fixture, rstest};
use tokio::time::{Instant, sleep};

use super::*;

#[derive(Debug)]
struct TestConn {
    id: usize,
    closed: bool,
    last_used: Instant,
    closes: Arc<AtomicUsize>,
}

impl Poolable for TestConn {
    fn is_closed(&self) -> bool { self.closed }

    fn last_used(&self) -> Instant { self.last_used }

    fn refresh_use_time(&mut self) { self.last_used = Instant::now(); }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
struct TestFactory {
    created: AtomicUsize,
    closes: Arc<AtomicUsize>,
    fail: AtomicBool,
    dial_delay: Option<Duration>,
}

impl TestFactory {
    fn created(&self) -> usize { self.created.load(Ordering::SeqCst) }

    fn closes(&self) -> usize { self.closes.load(Ordering::SeqCst) }
}

#[async_trait]
impl ConnectionFactory for TestFactory {
    type Connection = TestConn;

    async fn connect(&self) -> io::Result<TestConn> {
        if let Some(delay) = self.dial_delay {
            sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        let id = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TestConn {
            id,
            closed: false,
            last_used: Instant::now(),
            closes: Arc::clone(&self.closes),
        })
    }
}

#[fixture]
fn factory() -> TestFactory { TestFactory::default() }

fn options(max_size: usize) -> PoolOptions {
    PoolOptions::default()
        .with_max_size(max_size)
        .with_max_lifetime(Duration::from_secs(60))
        .with_wait_timeout(Duration::from_millis(100))
}

async fn until_waiting<F: ConnectionFactory>(pool: &Pool<F>, n: usize) {
    while pool.waiting() < n {
        tokio::task::yield_now().await;
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn released_connection_is_reused(factory: TestFactory) {
    let pool = Pool::new(factory, options(1));

    let first = pool.get().await.expect("first checkout");
    let first_id = first.id;
    pool.put(first).expect("release");
    assert_eq!(pool.idle_size(), 1);

    let second = pool.get().await.expect("second checkout");
    assert_eq!(second.id, first_id);
    assert_eq!(pool.open_size(), 1);
    assert_eq!(pool.factory.created(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn saturated_pool_times_out(factory: TestFactory) {
    let pool = Pool::new(factory, options(2));
    let _a = pool.get().await.expect("checkout a");
    let _b = pool.get().await.expect("checkout b");

    let start = Instant::now();
    let err = pool.get().await.expect_err("pool is saturated");
    assert!(matches!(err, PoolError::WaitTimeout));
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(pool.open_size(), 2);
    assert_eq!(pool.waiting(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn release_hands_connection_to_waiter(factory: TestFactory) {
    let pool = Arc::new(Pool::new(
        factory,
        options(1).with_wait_timeout(Duration::from_millis(200)),
    ));
    let held = pool.get().await.expect("checkout");
    let held_id = held.id;

    let releaser = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            pool.put(held).expect("release");
        })
    };

    let start = Instant::now();
    let conn = pool.get().await.expect("hand-off");
    let waited = start.elapsed();
    assert_eq!(conn.id, held_id);
    assert!(waited >= Duration::from_millis(50));
    assert!(waited < Duration::from_millis(200));
    assert_eq!(pool.idle_size(), 0);
    assert_eq!(pool.open_size(), 1);
    releaser.await.expect("releaser task");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn waiters_are_served_in_arrival_order(factory: TestFactory) {
    let pool = Arc::new(Pool::new(
        factory,
        options(1).with_wait_timeout(Duration::from_secs(5)),
    ));
    let held = pool.get().await.expect("checkout");

    let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut tasks = Vec::new();
    for n in 0..3 {
        let task_pool = Arc::clone(&pool);
        let order_tx = order_tx.clone();
        tasks.push(tokio::spawn(async move {
            let conn = task_pool.get().await.expect("hand-off");
            order_tx.send(n).expect("record order");
            sleep(Duration::from_millis(10)).await;
            task_pool.put(conn).expect("release");
        }));
        until_waiting(&pool, n + 1).await;
    }

    pool.put(held).expect("release");
    for task in tasks {
        task.await.expect("waiter task");
    }
    drop(order_tx);
    let mut order = Vec::new();
    while let Some(n) = order_rx.recv().await {
        order.push(n);
    }
    assert_eq!(order, vec![0, 1, 2]);
    assert_eq!(pool.factory.created(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn expired_idle_connection_is_replaced(factory: TestFactory) {
    let pool = Pool::new(factory, options(2));
    let conn = pool.get().await.expect("checkout");
    pool.put(conn).expect("release");

    tokio::time::advance(Duration::from_secs(61)).await;
    let fresh = pool.get().await.expect("checkout after expiry");
    assert_eq!(fresh.id, 2);
    assert_eq!(pool.factory.closes(), 1);
    assert_eq!(pool.open_size(), 1);
    assert_eq!(pool.idle_size(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn releasing_expired_connection_discards_it(factory: TestFactory) {
    let pool = Pool::new(factory, options(2));
    let conn = pool.get().await.expect("checkout");

    tokio::time::advance(Duration::from_secs(60)).await;
    let err = pool.put(conn).expect_err("expired on release");
    assert!(matches!(err, PoolError::ConnExpired));
    assert_eq!(pool.open_size(), 0);
    assert_eq!(pool.idle_size(), 0);
    assert_eq!(pool.factory.closes(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn releasing_closed_connection_frees_slot(factory: TestFactory) {
    let pool = Pool::new(factory, options(1));
    let mut conn = pool.get().await.expect("checkout");
    conn.close();

    assert!(matches!(pool.put(conn), Err(PoolError::ConnExpired)));
    assert_eq!(pool.open_size(), 0);
    let replacement = pool.get().await.expect("slot is free again");
    assert_eq!(replacement.id, 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn discarded_connection_lets_waiter_dial(factory: TestFactory) {
    let pool = Arc::new(Pool::new(
        factory,
        options(1).with_wait_timeout(Duration::from_millis(200)),
    ));
    let mut held = pool.get().await.expect("checkout");

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.get().await })
    };
    until_waiting(&pool, 1).await;

    let start = Instant::now();
    held.close();
    assert!(matches!(pool.put(held), Err(PoolError::ConnExpired)));
    let replacement = waiter.await.expect("waiter task").expect("dialed into freed slot");
    assert_eq!(replacement.id, 2);
    assert!(start.elapsed() < Duration::from_millis(200));
    assert_eq!(pool.open_size(), 1);
    assert_eq!(pool.waiting(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn forfeited_connection_frees_slot_for_waiter(factory: TestFactory) {
    let pool = Arc::new(Pool::new(
        factory,
        options(1).with_wait_timeout(Duration::from_secs(5)),
    ));
    let held = pool.get().await.expect("checkout");

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.get().await })
    };
    until_waiting(&pool, 1).await;

    drop(held);
    pool.forfeit();
    let replacement = waiter.await.expect("waiter task").expect("dialed into freed slot");
    assert_eq!(replacement.id, 2);
    assert_eq!(pool.open_size(), 1);

    pool.put(replacement).expect("release");
    drop(pool.get().await.expect("checkout"));
    pool.forfeit();
    assert_eq!(pool.open_size(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_dial_passes_slot_to_waiter() {
    let factory = TestFactory {
        dial_delay: Some(Duration::from_millis(50)),
        ..TestFactory::default()
    };
    factory.fail.store(true, Ordering::SeqCst);
    let pool = Arc::new(Pool::new(
        factory,
        options(1).with_wait_timeout(Duration::from_secs(5)),
    ));

    let first = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.get().await })
    };
    while pool.open_size() == 0 {
        tokio::task::yield_now().await;
    }
    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.get().await })
    };
    until_waiting(&pool, 1).await;

    let start = Instant::now();
    let first = first.await.expect("first task");
    assert!(matches!(first, Err(PoolError::Connect(_))));
    let second = waiter.await.expect("waiter task");
    assert!(matches!(second, Err(PoolError::Connect(_))), "waiter dials instead of timing out");
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(pool.open_size(), 0);
    assert_eq!(pool.waiting(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn close_wakes_waiters_and_rejects_checkouts(factory: TestFactory) {
    let pool = Arc::new(Pool::new(
        factory,
        options(1).with_wait_timeout(Duration::from_secs(10)),
    ));
    let held = pool.get().await.expect("checkout");

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.get().await })
    };
    until_waiting(&pool, 1).await;

    let start = Instant::now();
    pool.close();
    let result = waiter.await.expect("waiter task");
    assert!(matches!(result, Err(PoolError::PoolClosed)));
    assert!(start.elapsed() < Duration::from_secs(10));

    assert!(matches!(pool.get().await, Err(PoolError::PoolClosed)));
    assert!(matches!(pool.put(held), Err(PoolError::PoolClosed)));
    assert_eq!(pool.open_size(), 0);
    assert_eq!(pool.factory.closes(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn close_closes_idle_connections(factory: TestFactory) {
    let pool = Pool::new(factory, options(2));
    let a = pool.get().await.expect("checkout a");
    let b = pool.get().await.expect("checkout b");
    pool.put(a).expect("release a");
    pool.put(b).expect("release b");

    pool.close();
    assert!(pool.is_closed());
    assert_eq!(pool.idle_size(), 0);
    assert_eq!(pool.open_size(), 0);
    assert_eq!(pool.factory.closes(), 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_dial_does_not_consume_a_slot(factory: TestFactory) {
    factory.fail.store(true, Ordering::SeqCst);
    let pool = Pool::new(factory, options(1));

    let err = pool.get().await.expect_err("dial fails");
    assert!(matches!(err, PoolError::Connect(ref e) if e.kind() == io::ErrorKind::ConnectionRefused));
    assert_eq!(pool.open_size(), 0);

    pool.factory.fail.store(false, Ordering::SeqCst);
    pool.get().await.expect("dial succeeds once the backend is back");
    assert_eq!(pool.open_size(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_dial_releases_its_slot() {
    let factory = TestFactory {
        dial_delay: Some(Duration::from_secs(1)),
        ..TestFactory::default()
    };
    let pool = Pool::new(factory, options(1));

    let cancelled = tokio::time::timeout(Duration::from_millis(10), pool.get()).await;
    assert!(cancelled.is_err());
    assert_eq!(pool.open_size(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn cancelled_waiter_leaves_the_queue(factory: TestFactory) {
    let pool = Pool::new(factory, options(1).with_wait_timeout(Duration::from_secs(5)));
    let held = pool.get().await.expect("checkout");

    let cancelled = tokio::time::timeout(Duration::from_millis(10), pool.get()).await;
    assert!(cancelled.is_err());
    assert_eq!(pool.waiting(), 0);

    pool.put(held).expect("release");
    assert_eq!(pool.idle_size(), 1);
    assert_eq!(pool.open_size(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn timed_out_waiter_does_not_swallow_later_release(factory: TestFactory) {
    let pool = Pool::new(factory, options(1));
    let held = pool.get().await.expect("checkout");

    assert!(matches!(pool.get().await, Err(PoolError::WaitTimeout)));
    pool.put(held).expect("release");
    assert_eq!(pool.idle_size(), 1);
    pool.get().await.expect("idle connection is reusable");
}

#[rstest]
#[case::single(1)]
#[case::few(3)]
#[tokio::test(start_paused = true)]
async fn open_connections_never_exceed_max_size(#[case] max_size: usize) {
    let pool = Arc::new(Pool::new(
        TestFactory::default(),
        options(max_size).with_wait_timeout(Duration::from_secs(30)),
    ));

    let mut tasks = Vec::new();
    for n in 0..20_u64 {
        let pool = Arc::clone(&pool);
        tasks.push(tokio::spawn(async move {
            let conn = pool.get().await.expect("checkout");
            assert!(pool.open_size() <= pool.options().max_size);
            sleep(Duration::from_millis(5 + n % 7)).await;
            pool.put(conn).expect("release");
        }));
    }
    for task in tasks {
        task.await.expect("worker task");
    }

    assert!(pool.factory.created() <= max_size);
    assert!(pool.open_size() <= max_size);
    assert_eq!(pool.idle_size(), pool.open_size());
}

#[test]
fn zero_max_size_is_clamped() {
    let pool = Pool::new(TestFactory::default(), options(0));
    assert_eq!(pool.options().max_size, 1);
}
