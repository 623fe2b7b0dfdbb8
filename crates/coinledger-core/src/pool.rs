use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::LedgerError;

/// Opens and validates raw connections for one backend.
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send;

    fn connect(&self) -> Result<Self::Connection, LedgerError>;

    /// Health check run against connections that sat idle past the
    /// validation window. A false return evicts the connection.
    fn is_valid(&self, conn: &mut Self::Connection) -> bool;
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Upper bound on concurrently open connections.
    pub max_size: usize,
    /// How long `acquire` blocks before failing with `PoolExhausted`.
    pub acquire_timeout: Duration,
    /// Idle age beyond which a connection is health-checked on checkout.
    pub validate_after: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            validate_after: Duration::from_secs(30),
        }
    }
}

struct Idle<C> {
    conn: C,
    since: Instant,
}

struct PoolState<C> {
    idle: VecDeque<Idle<C>>,
    total: usize,
}

struct PoolInner<M: ConnectionManager> {
    manager: M,
    settings: PoolSettings,
    state: Mutex<PoolState<M::Connection>>,
    available: Condvar,
}

/// Bounded pool of reusable backend connections. Checkout blocks up to the
/// configured timeout when every connection is in use; idle connections past
/// the validation window are health-checked and replaced when broken.
pub struct Pool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ConnectionManager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<M: ConnectionManager> Pool<M> {
    /// Opens one connection eagerly so bad connectivity or credentials fail
    /// at startup instead of on the first operation.
    pub fn new(manager: M, settings: PoolSettings) -> Result<Self, LedgerError> {
        let settings = PoolSettings {
            max_size: settings.max_size.max(1),
            ..settings
        };
        let pool = Self {
            inner: Arc::new(PoolInner {
                manager,
                settings,
                state: Mutex::new(PoolState { idle: VecDeque::new(), total: 0 }),
                available: Condvar::new(),
            }),
        };
        let conn = pool.inner.manager.connect()?;
        {
            let mut state = pool.inner.state.lock().unwrap();
            state.idle.push_back(Idle { conn, since: Instant::now() });
            state.total = 1;
        }
        Ok(pool)
    }

    pub fn acquire(&self) -> Result<PooledConn<M>, LedgerError> {
        let deadline = Instant::now() + self.inner.settings.acquire_timeout;
        let mut state = self.inner.state.lock().unwrap();
        loop {
            while let Some(mut idle) = state.idle.pop_front() {
                if idle.since.elapsed() < self.inner.settings.validate_after {
                    return Ok(self.guard(idle.conn));
                }
                // Validate outside the lock; a slow ping must not stall
                // other checkouts.
                drop(state);
                if self.inner.manager.is_valid(&mut idle.conn) {
                    return Ok(self.guard(idle.conn));
                }
                tracing::debug!("evicting idle connection that failed validation");
                state = self.inner.state.lock().unwrap();
                state.total -= 1;
                self.inner.available.notify_one();
            }

            if state.total < self.inner.settings.max_size {
                state.total += 1;
                drop(state);
                match self.inner.manager.connect() {
                    Ok(conn) => return Ok(self.guard(conn)),
                    Err(e) => {
                        let mut state = self.inner.state.lock().unwrap();
                        state.total -= 1;
                        self.inner.available.notify_one();
                        return Err(e);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LedgerError::PoolExhausted {
                    waited_ms: self.inner.settings.acquire_timeout.as_millis() as u64,
                });
            }
            let (guard, _) = self
                .inner
                .available
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
    }

    fn guard(&self, conn: M::Connection) -> PooledConn<M> {
        PooledConn { pool: self.clone(), conn: Some(conn), broken: false }
    }

    fn release(&self, conn: Option<M::Connection>) {
        let mut state = self.inner.state.lock().unwrap();
        match conn {
            Some(conn) => state.idle.push_back(Idle { conn, since: Instant::now() }),
            None => state.total -= 1,
        }
        self.inner.available.notify_one();
    }

    pub fn total_connections(&self) -> usize {
        self.inner.state.lock().unwrap().total
    }

    pub fn idle_connections(&self) -> usize {
        self.inner.state.lock().unwrap().idle.len()
    }
}

/// Scoped checkout. Returns the connection to the pool on drop; call
/// `mark_broken` first to discard it instead (e.g. after an I/O error).
pub struct PooledConn<M: ConnectionManager> {
    pool: Pool<M>,
    conn: Option<M::Connection>,
    broken: bool,
}

impl<M: ConnectionManager> PooledConn<M> {
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<M: ConnectionManager> std::fmt::Debug for PooledConn<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("broken", &self.broken)
            .field("has_conn", &self.conn.is_some())
            .finish()
    }
}

impl<M: ConnectionManager> Deref for PooledConn<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().unwrap()
    }
}

impl<M: ConnectionManager> DerefMut for PooledConn<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap()
    }
}

impl<M: ConnectionManager> Drop for PooledConn<M> {
    fn drop(&mut self) {
        let conn = if self.broken { None } else { self.conn.take() };
        self.pool.release(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct TestManager {
        opened: AtomicUsize,
        healthy: AtomicBool,
    }

    impl TestManager {
        fn new() -> Self {
            Self { opened: AtomicUsize::new(0), healthy: AtomicBool::new(true) }
        }
    }

    impl ConnectionManager for Arc<TestManager> {
        type Connection = usize;

        fn connect(&self) -> Result<usize, LedgerError> {
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }

        fn is_valid(&self, _conn: &mut usize) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn settings(max_size: usize, timeout_ms: u64) -> PoolSettings {
        PoolSettings {
            max_size,
            acquire_timeout: Duration::from_millis(timeout_ms),
            validate_after: Duration::from_secs(60),
        }
    }

    #[test]
    fn reuses_released_connections() {
        let mgr = Arc::new(TestManager::new());
        let pool = Pool::new(mgr.clone(), settings(4, 100)).unwrap();
        for _ in 0..5 {
            let conn = pool.acquire().unwrap();
            drop(conn);
        }
        assert_eq!(mgr.opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.total_connections(), 1);
    }

    #[test]
    fn exhaustion_times_out() {
        let mgr = Arc::new(TestManager::new());
        let pool = Pool::new(mgr, settings(1, 20)).unwrap();
        let held = pool.acquire().unwrap();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, LedgerError::PoolExhausted { .. }));
        drop(held);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn blocked_acquire_wakes_on_release() {
        let mgr = Arc::new(TestManager::new());
        let pool = Pool::new(mgr, settings(1, 5_000)).unwrap();
        let held = pool.acquire().unwrap();
        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| pool.acquire().map(|_| ()));
            std::thread::sleep(Duration::from_millis(20));
            drop(held);
            waiter.join().unwrap().unwrap();
        });
    }

    #[test]
    fn broken_connections_are_discarded() {
        let mgr = Arc::new(TestManager::new());
        let pool = Pool::new(mgr.clone(), settings(2, 100)).unwrap();
        let mut conn = pool.acquire().unwrap();
        conn.mark_broken();
        drop(conn);
        assert_eq!(pool.total_connections(), 0);
        let _conn = pool.acquire().unwrap();
        assert_eq!(mgr.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stale_idle_connections_are_validated_and_evicted() {
        let mgr = Arc::new(TestManager::new());
        let pool = Pool::new(
            mgr.clone(),
            PoolSettings {
                max_size: 2,
                acquire_timeout: Duration::from_millis(100),
                validate_after: Duration::ZERO,
            },
        )
        .unwrap();
        mgr.healthy.store(false, Ordering::SeqCst);
        let _conn = pool.acquire().unwrap();
        // initial connection failed validation and was replaced
        assert_eq!(mgr.opened.load(Ordering::SeqCst), 2);
        assert_eq!(pool.total_connections(), 1);
    }
}
