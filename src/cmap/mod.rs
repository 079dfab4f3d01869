pub(crate) mod conn;
pub(crate) mod establish;
pub(crate) mod options;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
        Mutex,
    },
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use self::{establish::ConnectionEstablisher, options::ConnectionPoolOptions};
use crate::{
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
};
pub(crate) use self::conn::{Command, CommandResponse, Connection, StreamDescription};

/// A pool of connections implementing the CMAP spec. All state is kept internally in an `Arc`,
/// so the pool itself can be cloned cheaply and shared.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionPool {
    inner: Arc<ConnectionPoolInner>,
}

#[derive(Debug)]
struct ConnectionPoolInner {
    address: ServerAddress,

    options: ConnectionPoolOptions,

    establisher: ConnectionEstablisher,

    /// Enforces the pool bound. Checking out a connection first acquires a permit; tokio's
    /// semaphore queues waiters fairly, which gives check-out its FIFO behavior.
    permits: Arc<Semaphore>,

    /// Connections ready for use, most recently used last. Checkout pops from the back so idle
    /// connections age out at the front.
    available: Mutex<VecDeque<Connection>>,

    /// The current generation of the pool. The generation is incremented whenever the pool is
    /// cleared. Connections belonging to a previous generation are considered stale and will be
    /// closed when checked back in or when popped off of the set of available connections.
    generation: AtomicU32,

    /// Until its server has been confirmed reachable by its monitor, a pool is paused and new
    /// connections are not established.
    ready: AtomicBool,

    next_connection_id: AtomicU32,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        options: ConnectionPoolOptions,
    ) -> Self {
        let max_pool_size = options.max_pool_size;
        Self {
            inner: Arc::new(ConnectionPoolInner {
                address,
                options,
                establisher,
                permits: Arc::new(Semaphore::new(max_pool_size as usize)),
                available: Mutex::new(VecDeque::new()),
                generation: AtomicU32::new(0),
                ready: AtomicBool::new(false),
                next_connection_id: AtomicU32::new(1),
            }),
        }
    }

    pub(crate) fn generation(&self) -> u32 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Checks out a connection from the pool, blocking until the pool is below its bound. An
    /// idle connection is reused if a healthy one is present; otherwise a new connection is
    /// established.
    pub(crate) async fn check_out(&self) -> Result<PooledConnection> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::internal("connection pool semaphore closed"))?;

        let generation = self.generation();

        loop {
            let conn = self.inner.available.lock().unwrap().pop_back();
            match conn {
                Some(conn) if conn.is_stale(generation) => continue,
                Some(conn) if conn.is_idle(self.inner.options.max_idle_time) => continue,
                Some(mut conn) => {
                    conn.mark_checked_out();
                    return Ok(PooledConnection {
                        conn: Some(conn),
                        pool: self.clone(),
                        _permit: permit,
                    });
                }
                None => break,
            }
        }

        if !self.inner.ready.load(Ordering::SeqCst) {
            return Err(Error::from(ErrorKind::ConnectionPoolCleared {
                message: format!(
                    "connection pool for {} is paused while the server is unknown",
                    self.inner.address
                ),
            })
            .with_address(self.inner.address.clone()));
        }

        let id = self.inner.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let conn = self
            .inner
            .establisher
            .establish_connection(id, self.inner.address.clone(), generation)
            .await
            .map_err(|e| e.with_address(self.inner.address.clone()))?;

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.clone(),
            _permit: permit,
        })
    }

    /// Returns a connection to the pool. Dead, stale, and idle connections are discarded instead
    /// of re-entering the idle set.
    fn check_in(&self, mut conn: Connection) {
        if conn.is_dead()
            || conn.is_stale(self.generation())
            || conn.is_idle(self.inner.options.max_idle_time)
        {
            return;
        }

        conn.mark_checked_in();
        self.inner.available.lock().unwrap().push_back(conn);
    }

    /// Invalidates all idle connections by bumping the pool's generation and pauses the pool
    /// until its server is confirmed healthy again. Outstanding connections are discarded when
    /// they are checked back in.
    pub(crate) fn clear(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.ready.store(false, Ordering::SeqCst);
        self.inner.available.lock().unwrap().clear();
    }

    /// Marks the pool as ready to establish new connections, called when the server's monitor
    /// confirms it is reachable.
    pub(crate) fn mark_as_ready(&self) {
        self.inner.ready.store(true, Ordering::SeqCst);
    }
}

/// A connection checked out of a pool. The holder has exclusive use of the connection; it
/// returns to the pool (or is discarded, if no longer healthy) on drop.
#[derive(Debug)]
pub(crate) struct PooledConnection {
    conn: Option<Connection>,
    pool: ConnectionPool,
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection taken before drop")
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection taken before drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn);
        }
    }
}
