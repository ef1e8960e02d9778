//! Bounded pool of reusable backend connections.
//!
//! The pool owns every backend connection that is idle or waiting to be
//! handed off, and counts every connection it has allocated, including those
//! currently checked out. When all `max_size` slots are in use, checkouts
//! queue in FIFO order and a released connection is delivered directly to the
//! oldest waiter instead of passing through the idle list.
//!
//! All bookkeeping happens under one mutex that is never held across network
//! I/O: new connections are dialed after a slot has been reserved and the lock
//! released.

use std::{
    collections::VecDeque,
    io,
    num::NonZeroUsize,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use derive_more::Display;
use tokio::{
    sync::oneshot,
    time::{Instant, timeout},
};
use tracing::{debug, warn};

use crate::metrics::{self, CheckoutOutcome};

pub mod error;

pub use error::PoolError;

/// Connection bookkeeping required by the pool.
pub trait Poolable: Send + 'static {
    /// Whether the connection has been closed.
    fn is_closed(&self) -> bool;

    /// Time of the last checkout or release.
    fn last_used(&self) -> Instant;

    /// Record a checkout or release.
    fn refresh_use_time(&mut self);

    /// Close the connection. Must be idempotent.
    fn close(&mut self);

    /// Whether at least `max_lifetime` has passed since the last use.
    fn is_expired(&self, max_lifetime: Duration) -> bool {
        self.last_used().elapsed() >= max_lifetime
    }
}

/// Creates new backend connections on demand.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Connection type produced by this factory.
    type Connection: Poolable;

    /// Open a new connection.
    async fn connect(&self) -> io::Result<Self::Connection>;
}

/// Immutable pool configuration.
///
/// # Default Values
/// - `max_size`: number of available CPUs
/// - `max_lifetime`: 1 hour
/// - `wait_timeout`: 3 seconds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolOptions {
    /// Maximum number of allocated connections.
    pub max_size: usize,
    /// Connections unused for this long are discarded instead of reused.
    pub max_lifetime: Duration,
    /// How long a checkout waits for a release once the pool is saturated.
    pub wait_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            max_lifetime: Duration::from_secs(3600),
            wait_timeout: Duration::from_secs(3),
        }
    }
}

impl PoolOptions {
    /// Set the maximum pool size.
    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the maximum connection lifetime.
    #[must_use]
    pub fn with_max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.max_lifetime = max_lifetime;
        self
    }

    /// Set the checkout wait timeout.
    #[must_use]
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    /// Clamp `max_size` to at least one connection.
    ///
    /// # Examples
    ///
    /// ```
    /// use umyproxy::pool::PoolOptions;
    ///
    /// let options = PoolOptions::default().with_max_size(0).normalized();
    /// assert_eq!(options.max_size, 1);
    /// ```
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.max_size = self.max_size.max(1);
        self
    }
}

/// Identifier of one pending checkout.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
#[display("{_0}")]
pub struct WaitTicket(u64);

/// What a release hands to a waiting checkout.
enum Delivery<C> {
    /// A live connection, bypassing the idle list.
    Conn(C),
    /// A freed slot, already counted in `open`; the waiter dials into it.
    Slot,
}

struct Waiter<C> {
    ticket: WaitTicket,
    tx: oneshot::Sender<Delivery<C>>,
}

struct PoolState<C> {
    open: usize,
    idle: VecDeque<C>,
    waiters: VecDeque<Waiter<C>>,
    next_ticket: u64,
    closed: bool,
}

impl<C: Poolable> PoolState<C> {
    /// Free one slot, passing it to the oldest waiter while the pool is open.
    fn release_slot(&mut self) {
        if !self.closed
            && let Ok(ticket) = self.deliver(Delivery::Slot)
        {
            debug!(%ticket, "freed slot passed to waiting checkout");
            return;
        }
        debug_assert!(self.open > 0, "open connection count underflow");
        self.open = self.open.saturating_sub(1);
        metrics::set_pool_open(self.open);
    }

    fn discard(&mut self, mut conn: C) {
        conn.close();
        self.release_slot();
    }

    /// Pop the first reusable idle connection, discarding stale ones in front of it.
    ///
    /// When no reusable connection is found the idle list ends up empty.
    fn take_idle(&mut self, max_lifetime: Duration) -> Option<C> {
        while let Some(mut conn) = self.idle.pop_front() {
            if conn.is_closed() || conn.is_expired(max_lifetime) {
                self.discard(conn);
                continue;
            }
            conn.refresh_use_time();
            return Some(conn);
        }
        None
    }

    fn register_waiter(&mut self) -> (WaitTicket, oneshot::Receiver<Delivery<C>>) {
        self.next_ticket += 1;
        let ticket = WaitTicket(self.next_ticket);
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(Waiter { ticket, tx });
        (ticket, rx)
    }

    fn remove_waiter(&mut self, ticket: WaitTicket) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.ticket != ticket);
        self.waiters.len() != before
    }

    /// Hand `delivery` to the oldest live waiter, or return it if nobody is waiting.
    fn deliver(&mut self, mut delivery: Delivery<C>) -> Result<WaitTicket, Delivery<C>> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(delivery) {
                Ok(()) => return Ok(waiter.ticket),
                // The waiting checkout was dropped; try the next one.
                Err(returned) => delivery = returned,
            }
        }
        Err(delivery)
    }
}

enum Checkout<C> {
    Ready(C),
    Create,
    Wait(WaitTicket, oneshot::Receiver<Delivery<C>>),
}

/// Bounded pool of backend connections.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use umyproxy::{
///     backend::TcpConnector,
///     pool::{Pool, PoolOptions},
/// };
///
/// # async fn demo() -> Result<(), umyproxy::pool::PoolError> {
/// let pool = Arc::new(Pool::new(
///     TcpConnector::new("127.0.0.1", 3306),
///     PoolOptions::default().with_max_size(4),
/// ));
/// let conn = pool.get().await?;
/// // ... relay a session ...
/// let _ = pool.put(conn);
/// # Ok(())
/// # }
/// ```
pub struct Pool<F: ConnectionFactory> {
    factory: F,
    options: PoolOptions,
    state: Mutex<PoolState<F::Connection>>,
}

impl<F: ConnectionFactory> std::fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Pool")
            .field("options", &self.options)
            .field("open", &state.open)
            .field("idle", &state.idle.len())
            .field("waiters", &state.waiters.len())
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create an empty pool that opens connections through `factory`.
    pub fn new(factory: F, options: PoolOptions) -> Self {
        Self {
            factory,
            options: options.normalized(),
            state: Mutex::new(PoolState {
                open: 0,
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                next_ticket: 0,
                closed: false,
            }),
        }
    }

    /// Configuration in effect.
    #[must_use]
    pub fn options(&self) -> &PoolOptions { &self.options }

    /// Factory used to open new connections.
    #[must_use]
    pub fn factory(&self) -> &F { &self.factory }

    /// Bookkeeping never spans a panic point, so a poisoned lock is still consistent.
    fn lock(&self) -> MutexGuard<'_, PoolState<F::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check out a connection.
    ///
    /// Reuses the first live idle connection, otherwise opens a new one while
    /// below `max_size`, otherwise waits up to `wait_timeout` for another
    /// checkout to be released. A waiter whose turn comes because a slot was
    /// freed (a discarded or forfeited connection, or a failed dial) dials a
    /// replacement into that slot.
    ///
    /// # Errors
    ///
    /// - [`PoolError::PoolClosed`] if the pool is, or becomes, closed.
    /// - [`PoolError::Connect`] if dialing a new connection fails.
    /// - [`PoolError::WaitTimeout`] if no connection was released in time.
    pub async fn get(&self) -> Result<F::Connection, PoolError> {
        let checkout = {
            let mut state = self.lock();
            if state.closed {
                return Err(PoolError::PoolClosed);
            }
            if let Some(conn) = state.take_idle(self.options.max_lifetime) {
                Checkout::Ready(conn)
            } else if state.open < self.options.max_size {
                state.open += 1;
                metrics::set_pool_open(state.open);
                Checkout::Create
            } else {
                let (ticket, rx) = state.register_waiter();
                debug!(%ticket, waiters = state.waiters.len(), "pool saturated, waiting");
                Checkout::Wait(ticket, rx)
            }
        };

        match checkout {
            Checkout::Ready(conn) => {
                metrics::inc_checkouts(CheckoutOutcome::Reused);
                Ok(conn)
            }
            Checkout::Create => self.create().await,
            Checkout::Wait(ticket, rx) => self.wait(ticket, rx).await,
        }
    }

    async fn create(&self) -> Result<F::Connection, PoolError> {
        let reservation = Reservation { pool: self };
        let conn = self.factory.connect().await.map_err(PoolError::Connect)?;
        std::mem::forget(reservation);
        metrics::inc_checkouts(CheckoutOutcome::Created);
        Ok(conn)
    }

    async fn wait(
        &self,
        ticket: WaitTicket,
        rx: oneshot::Receiver<Delivery<F::Connection>>,
    ) -> Result<F::Connection, PoolError> {
        let mut pending = PendingCheckout {
            pool: self,
            ticket,
            rx,
        };
        match timeout(self.options.wait_timeout, &mut pending.rx).await {
            Ok(Ok(Delivery::Conn(conn))) => {
                metrics::inc_checkouts(CheckoutOutcome::HandOff);
                Ok(conn)
            }
            Ok(Ok(Delivery::Slot)) => {
                drop(pending);
                self.create().await
            }
            // The sender is only dropped without a delivery when the pool closes.
            Ok(Err(_)) => Err(PoolError::PoolClosed),
            Err(_) => {
                drop(pending);
                metrics::inc_wait_timeouts();
                warn!(%ticket, timeout = ?self.options.wait_timeout, "backend connection wait timed out");
                Err(PoolError::WaitTimeout)
            }
        }
    }

    /// Withdraw a waiting checkout, returning anything already sent to it.
    fn abandon(&self, ticket: WaitTicket, rx: &mut oneshot::Receiver<Delivery<F::Connection>>) {
        let still_queued = self.lock().remove_waiter(ticket);
        if still_queued {
            return;
        }
        // Deliveries happen under the lock, so once the ticket is gone any
        // delivery sent to it is already in the channel.
        match rx.try_recv() {
            Ok(Delivery::Conn(conn)) => {
                if let Err(e) = self.put(conn) {
                    debug!(%ticket, error = %e, "late hand-off discarded");
                }
            }
            Ok(Delivery::Slot) => self.lock().release_slot(),
            Err(_) => {}
        }
    }

    /// Return a checked-out connection.
    ///
    /// Live connections go to the oldest waiting checkout if there is one,
    /// otherwise to the back of the idle list.
    ///
    /// # Errors
    ///
    /// - [`PoolError::PoolClosed`] if the pool is closed; the connection is closed.
    /// - [`PoolError::ConnExpired`] if the connection is closed or expired; it is discarded.
    pub fn put(&self, mut conn: F::Connection) -> Result<(), PoolError> {
        let mut state = self.lock();
        if state.closed {
            state.discard(conn);
            return Err(PoolError::PoolClosed);
        }
        if conn.is_closed() || conn.is_expired(self.options.max_lifetime) {
            state.discard(conn);
            return Err(PoolError::ConnExpired);
        }
        conn.refresh_use_time();

        let conn = match state.deliver(Delivery::Conn(conn)) {
            Ok(ticket) => {
                debug!(%ticket, "connection handed to waiting checkout");
                return Ok(());
            }
            Err(Delivery::Conn(conn)) => conn,
            // `deliver` hands back exactly what it was given.
            Err(Delivery::Slot) => return Ok(()),
        };

        if state.idle.len() >= self.options.max_size
            && let Some(evicted) = state.idle.pop_front()
        {
            state.discard(evicted);
        }
        state.idle.push_back(conn);
        Ok(())
    }

    /// Account for a checked-out connection that was dropped instead of returned.
    ///
    /// Its slot is freed as if the connection had been closed and released,
    /// so a waiting checkout may dial a replacement.
    pub fn forfeit(&self) {
        let mut state = self.lock();
        state.release_slot();
        debug!(open = state.open, "checked-out connection forfeited");
    }

    /// Close the pool.
    ///
    /// Idle connections are closed immediately and every waiting checkout
    /// fails with [`PoolError::PoolClosed`]. Checked-out connections are
    /// closed when they are returned.
    pub fn close(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.closed = true;
        while let Some(conn) = state.idle.pop_front() {
            state.discard(conn);
        }
        // Dropping the senders wakes every waiter.
        state.waiters.clear();
        debug!(open = state.open, "pool closed");
    }

    /// Whether [`Pool::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.lock().closed }

    /// Number of allocated connections: idle, checked out, or in hand-off.
    #[must_use]
    pub fn open_size(&self) -> usize { self.lock().open }

    /// Number of idle connections.
    #[must_use]
    pub fn idle_size(&self) -> usize { self.lock().idle.len() }

    /// Number of checkouts currently waiting.
    #[must_use]
    pub fn waiting(&self) -> usize { self.lock().waiters.len() }
}

/// Slot reserved for a connection being dialed; released unless forgotten.
struct Reservation<'a, F: ConnectionFactory> {
    pool: &'a Pool<F>,
}

impl<F: ConnectionFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) { self.pool.lock().release_slot(); }
}

/// Queued checkout; withdrawn from the queue when dropped.
struct PendingCheckout<'a, F: ConnectionFactory> {
    pool: &'a Pool<F>,
    ticket: WaitTicket,
    rx: oneshot::Receiver<Delivery<F::Connection>>,
}

impl<F: ConnectionFactory> Drop for PendingCheckout<'_, F> {
    fn drop(&mut self) { self.pool.abandon(self.ticket, &mut self.rx); }
}

#[cfg(test)]
mod tests;
