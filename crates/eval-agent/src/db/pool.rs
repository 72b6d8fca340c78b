//! Bounded connection pool per database.
//!
//! Permits come from a semaphore sized to the pool, so at most `size`
//! connections exist at once and no connection is shared between leases.
//! A pair of connections is acquired with a single `acquire_many`, which
//! keeps two tasks from each holding one connection while waiting for a
//! second.
//!
//! A lease dropped while a statement is still running (the owning future
//! was cancelled) does not return its connections: each one gets a cancel
//! request and is closed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use super::{Connector, DbError, SqlConnection};

struct PoolInner {
    database: String,
    connector: Arc<dyn Connector>,
    idle: Mutex<Vec<Box<dyn SqlConnection>>>,
    permits: Arc<Semaphore>,
    size: usize,
    /// Connections currently open, idle or leased.
    live: AtomicUsize,
    returned: Notify,
}

/// Cheap to clone; all clones share one set of connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(database: &str, connector: Arc<dyn Connector>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                database: database.to_string(),
                connector,
                idle: Mutex::new(Vec::new()),
                permits: Arc::new(Semaphore::new(size)),
                size,
                live: AtomicUsize::new(0),
                returned: Notify::new(),
            }),
        }
    }

    pub fn database(&self) -> &str {
        &self.inner.database
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock_idle().len()
    }

    pub fn live_count(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Check out `count` connections at once, opening new ones as needed.
    ///
    /// `count` is clamped to the pool size.
    pub async fn checkout(&self, count: usize) -> Result<Lease, DbError> {
        let mut lease = self.reserve(count).await?;
        while lease.conns.len() < lease.wanted {
            let conn = self.open().await?;
            lease.conns.push(conn);
        }
        Ok(lease)
    }

    /// Check out up to `count` connections, settling for fewer when the
    /// engine refuses new ones.
    ///
    /// With none available the call waits for a leased connection to come
    /// back. It fails only when an open is refused and no connection is
    /// live anywhere in the pool.
    pub async fn checkout_available(&self, count: usize) -> Result<Lease, DbError> {
        loop {
            // Registered before the check so a return in between is not missed.
            let returned = self.inner.returned.notified();
            let mut lease = self.reserve(count).await?;
            let mut refused = None;
            while lease.conns.len() < lease.wanted {
                match self.open().await {
                    Ok(conn) => lease.conns.push(conn),
                    Err(e) => {
                        refused = Some(e);
                        break;
                    }
                }
            }
            let Some(e) = refused else {
                return Ok(lease);
            };
            if !lease.conns.is_empty() {
                tracing::debug!(
                    database = %self.inner.database,
                    got = lease.conns.len(),
                    wanted = lease.wanted,
                    error = %e,
                    "Continuing with fewer connections"
                );
                return Ok(lease);
            }
            drop(lease);
            if self.live_count() == 0 {
                return Err(e);
            }
            tracing::debug!(database = %self.inner.database, error = %e, "Waiting for a connection to return");
            returned.await;
        }
    }

    /// Close the pool: pending and future checkouts fail.
    pub fn close(&self) {
        self.inner.permits.close();
        let dropped = {
            let mut idle = self.inner.lock_idle();
            let n = idle.len();
            idle.clear();
            n
        };
        self.inner.live.fetch_sub(dropped, Ordering::SeqCst);
        self.inner.returned.notify_waiters();
    }

    /// Permits plus whatever idle connections are on hand.
    async fn reserve(&self, count: usize) -> Result<Lease, DbError> {
        let count = count.clamp(1, self.inner.size);
        let permit = Arc::clone(&self.inner.permits)
            .acquire_many_owned(count as u32)
            .await
            .map_err(|_| DbError::ConnectionLost(format!("pool '{}' closed", self.inner.database)))?;

        let mut conns: Vec<Box<dyn SqlConnection>> = Vec::with_capacity(count);
        {
            let mut idle = self.inner.lock_idle();
            while conns.len() < count {
                match idle.pop() {
                    Some(conn) => conns.push(conn),
                    None => break,
                }
            }
        }
        Ok(Lease {
            conns,
            wanted: count,
            in_flight: AtomicBool::new(false),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    async fn open(&self) -> Result<Box<dyn SqlConnection>, DbError> {
        let conn = self.inner.connector.connect().await?;
        self.inner.live.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(database = %self.inner.database, "Opened connection");
        Ok(conn)
    }
}

impl PoolInner {
    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<Box<dyn SqlConnection>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Connections checked out together. Healthy ones return to the pool on
/// drop; broken ones are discarded.
pub struct Lease {
    conns: Vec<Box<dyn SqlConnection>>,
    wanted: usize,
    in_flight: AtomicBool,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&dyn SqlConnection> {
        self.conns.get(index).map(|c| c.as_ref())
    }

    /// The first connection and, when the lease holds two, the second.
    pub fn pair(&self) -> Option<(&dyn SqlConnection, Option<&dyn SqlConnection>)> {
        let first = self.get(0)?;
        Some((first, self.get(1)))
    }

    /// Bracket statement execution. A lease dropped between
    /// `set_in_flight(true)` and `set_in_flight(false)` cancels and closes
    /// its connections instead of returning them.
    pub fn set_in_flight(&self, running: bool) {
        self.in_flight.store(running, Ordering::SeqCst);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let abandoned = self.in_flight.load(Ordering::SeqCst);
        let mut discarded = 0;
        {
            let mut idle = self.pool.lock_idle();
            for conn in self.conns.drain(..) {
                if abandoned {
                    discarded += 1;
                    cancel_abandoned(&self.pool.database, conn);
                } else if conn.is_broken() || self.pool.permits.is_closed() {
                    tracing::debug!(database = %self.pool.database, "Discarding broken connection");
                    discarded += 1;
                } else {
                    idle.push(conn);
                }
            }
        }
        self.pool.live.fetch_sub(discarded, Ordering::SeqCst);
        self.pool.returned.notify_waiters();
    }
}

/// Ask the engine to stop the statement, then close the connection.
fn cancel_abandoned(database: &str, conn: Box<dyn SqlConnection>) {
    tracing::debug!(database = %database, "Cancelling statement on abandoned connection");
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                conn.cancel_in_flight().await;
            });
        }
        Err(_) => drop(conn),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Dialect, MockSqlConnection, QueryLimits, QueryOutput};
    use async_trait::async_trait;
    use scoring::SchemaDescription;
    use std::time::Duration;

    /// Connector producing mocks. Opens beyond `max_opens` are refused;
    /// `broken` flips every connection it made.
    struct CountingConnector {
        opened: Arc<AtomicUsize>,
        cancels: Arc<AtomicUsize>,
        broken: Arc<AtomicBool>,
        max_opens: usize,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self) -> Result<Box<dyn SqlConnection>, DbError> {
            if self.opened.load(Ordering::SeqCst) >= self.max_opens {
                return Err(DbError::Open {
                    target: "mock".into(),
                    message: "refused".into(),
                });
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            let broken = Arc::clone(&self.broken);
            let cancels = Arc::clone(&self.cancels);
            let mut conn = MockSqlConnection::new();
            conn.expect_dialect().return_const(Dialect::Sqlite);
            conn.expect_is_broken()
                .returning(move || broken.load(Ordering::SeqCst));
            conn.expect_query()
                .returning(|_, _| Ok(QueryOutput::default()));
            conn.expect_cancel_in_flight().returning(move || {
                cancels.fetch_add(1, Ordering::SeqCst);
            });
            conn.expect_introspect()
                .returning(|db| Ok(SchemaDescription::new(db, vec![])));
            Ok(Box::new(conn))
        }

        fn describe(&self) -> String {
            "mock".into()
        }
    }

    struct Fixture {
        pool: ConnectionPool,
        opened: Arc<AtomicUsize>,
        cancels: Arc<AtomicUsize>,
        broken: Arc<AtomicBool>,
    }

    fn fixture(size: usize, max_opens: usize) -> Fixture {
        let opened = Arc::new(AtomicUsize::new(0));
        let cancels = Arc::new(AtomicUsize::new(0));
        let broken = Arc::new(AtomicBool::new(false));
        let connector = CountingConnector {
            opened: Arc::clone(&opened),
            cancels: Arc::clone(&cancels),
            broken: Arc::clone(&broken),
            max_opens,
        };
        Fixture {
            pool: ConnectionPool::new("db", Arc::new(connector), size),
            opened,
            cancels,
            broken,
        }
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let f = fixture(2, usize::MAX);
        {
            let lease = f.pool.checkout(2).await.unwrap();
            assert_eq!(lease.len(), 2);
            let limits = QueryLimits {
                row_limit: 1,
                time_limit: Duration::from_secs(1),
            };
            let (a, b) = lease.pair().unwrap();
            a.query("SELECT 1", limits).await.unwrap();
            b.unwrap().query("SELECT 1", limits).await.unwrap();
        }
        assert_eq!(f.pool.idle_count(), 2);
        let _again = f.pool.checkout(1).await.unwrap();
        assert_eq!(f.opened.load(Ordering::SeqCst), 2);
        assert_eq!(f.pool.idle_count(), 1);
        assert_eq!(f.pool.live_count(), 2);
    }

    #[tokio::test]
    async fn test_broken_connections_are_discarded() {
        let f = fixture(1, usize::MAX);
        {
            let _lease = f.pool.checkout(1).await.unwrap();
            f.broken.store(true, Ordering::SeqCst);
        }
        assert_eq!(f.pool.idle_count(), 0);
        assert_eq!(f.pool.live_count(), 0);
        f.broken.store(false, Ordering::SeqCst);
        let _lease = f.pool.checkout(1).await.unwrap();
        assert_eq!(f.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_checkout_is_bounded_by_pool_size() {
        let f = fixture(2, usize::MAX);
        let held = f.pool.checkout(2).await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(50), f.pool.checkout(1)).await;
        assert!(waiting.is_err(), "checkout should wait while the pool is exhausted");
        drop(held);
        assert!(f.pool.checkout(2).await.is_ok());
    }

    #[tokio::test]
    async fn test_pair_request_is_clamped_to_size() {
        let f = fixture(1, usize::MAX);
        let lease = f.pool.checkout(2).await.unwrap();
        assert_eq!(lease.len(), 1);
        assert!(lease.pair().unwrap().1.is_none());
    }

    #[tokio::test]
    async fn test_open_failure_releases_permits() {
        let f = fixture(1, 0);
        assert!(matches!(f.pool.checkout(1).await, Err(DbError::Open { .. })));
        // The permit came back, so a second attempt fails fast instead of hanging.
        let second = tokio::time::timeout(Duration::from_millis(50), f.pool.checkout(1)).await;
        assert!(matches!(second, Ok(Err(DbError::Open { .. }))));
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_checkout() {
        let f = fixture(1, usize::MAX);
        f.pool.close();
        assert!(matches!(f.pool.checkout(1).await, Err(DbError::ConnectionLost(_))));
    }

    #[tokio::test]
    async fn test_checkout_available_settles_for_one_connection() {
        let f = fixture(4, 1);
        drop(f.pool.checkout(1).await.unwrap());

        assert!(matches!(f.pool.checkout(2).await, Err(DbError::Open { .. })));
        let lease = f.pool.checkout_available(2).await.unwrap();
        assert_eq!(lease.len(), 1);
        assert!(lease.pair().unwrap().1.is_none());
    }

    #[tokio::test]
    async fn test_checkout_available_waits_for_a_returned_connection() {
        let f = fixture(4, 1);
        let held = f.pool.checkout(1).await.unwrap();

        let pool = f.pool.clone();
        let waiter = tokio::spawn(async move { pool.checkout_available(2).await.map(|l| l.len()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "should wait while the only connection is leased");

        drop(held);
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_checkout_available_fails_with_no_live_connection() {
        let f = fixture(2, 0);
        let result = tokio::time::timeout(Duration::from_secs(1), f.pool.checkout_available(2)).await;
        assert!(matches!(result, Ok(Err(DbError::Open { .. }))));
    }

    #[tokio::test]
    async fn test_abandoned_lease_cancels_and_closes_connections() {
        let f = fixture(2, usize::MAX);
        {
            let lease = f.pool.checkout(2).await.unwrap();
            lease.set_in_flight(true);
        }
        assert_eq!(f.pool.idle_count(), 0);
        assert_eq!(f.pool.live_count(), 0);
        for _ in 0..10 {
            if f.cancels.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(f.cancels.load(Ordering::SeqCst), 2);

        {
            let lease = f.pool.checkout(1).await.unwrap();
            lease.set_in_flight(true);
            lease.set_in_flight(false);
        }
        assert_eq!(f.pool.idle_count(), 1);
    }
}
