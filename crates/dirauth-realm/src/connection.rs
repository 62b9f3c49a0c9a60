//! Connection lifecycle management.
//!
//! Owns either one shared connection handle guarded by a mutex (pool size 1)
//! or a bounded pool of idle handles. Handles are opened lazily, fail over
//! to the alternate endpoint at most once per open, and are discarded rather
//! than reused after any directory error.
//!
//! A handle is built from one immutable configuration snapshot and carries
//! the generation counter current at creation time. Reconfiguration swaps
//! the active snapshot and bumps the generation; stale handles are closed on
//! their next checkout instead of being mutated in place.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use dirauth_core::{RealmError, RealmResult};

use crate::client::{DirectoryConnection, DirectoryConnector};
use crate::config::{CompiledConfig, ConnectionEnvironment, Endpoint};

/// A connection handle: the (lazily opened) live connection plus the
/// configuration snapshot whose compiled templates it operates under.
pub struct DirectoryHandle {
    pub snapshot: Arc<CompiledConfig>,
    generation: u64,
    conn: Option<Box<dyn DirectoryConnection>>,
}

impl DirectoryHandle {
    fn new(snapshot: Arc<CompiledConfig>, generation: u64) -> Self {
        Self {
            snapshot,
            generation,
            conn: None,
        }
    }

    /// The live connection. The manager opens handles before handing them
    /// out, so an absent connection here is a logic error upstream.
    pub fn connection(&mut self) -> RealmResult<&mut (dyn DirectoryConnection + 'static)> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| RealmError::directory("connection handle is not open"))
    }

    async fn close_connection(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            debug!("Closing directory connection");
            if let Err(e) = conn.close().await {
                warn!(error = %e, "error while closing directory connection");
            }
        }
    }
}

/// A handle checked out to exactly one caller. In singleton mode the checkout
/// holds the mutex; dropping it is the unlock, so release and discard cannot
/// double-unlock.
pub struct ActiveConnection {
    checkout: Checkout,
}

enum Checkout {
    Single(OwnedMutexGuard<DirectoryHandle>),
    Pooled(DirectoryHandle),
}

impl Deref for ActiveConnection {
    type Target = DirectoryHandle;

    fn deref(&self) -> &Self::Target {
        match &self.checkout {
            Checkout::Single(guard) => guard,
            Checkout::Pooled(handle) => handle,
        }
    }
}

impl DerefMut for ActiveConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.checkout {
            Checkout::Single(guard) => guard,
            Checkout::Pooled(handle) => handle,
        }
    }
}

enum Slots {
    Single(Arc<Mutex<DirectoryHandle>>),
    Pooled {
        idle: Mutex<Vec<DirectoryHandle>>,
        capacity: usize,
    },
}

/// Manager for the realm's directory connections.
pub struct ConnectionManager {
    connector: Arc<dyn DirectoryConnector>,
    active: RwLock<Arc<CompiledConfig>>,
    generation: AtomicU64,
    slots: Slots,
}

impl ConnectionManager {
    /// Create a manager for the given snapshot. The pooling mode is fixed at
    /// creation; changing the pool size requires a new manager.
    pub fn new(connector: Arc<dyn DirectoryConnector>, snapshot: Arc<CompiledConfig>) -> Self {
        let capacity = snapshot.config.connection_pool_size;
        let slots = if capacity == 1 {
            Slots::Single(Arc::new(Mutex::new(DirectoryHandle::new(
                snapshot.clone(),
                1,
            ))))
        } else {
            Slots::Pooled {
                idle: Mutex::new(Vec::new()),
                capacity,
            }
        };

        Self {
            connector,
            active: RwLock::new(snapshot),
            generation: AtomicU64::new(1),
            slots,
        }
    }

    /// The configuration snapshot new handles are currently built from.
    pub async fn current_snapshot(&self) -> Arc<CompiledConfig> {
        self.active.read().await.clone()
    }

    /// Check out an open connection handle, blocking in singleton mode until
    /// the shared handle is available.
    pub async fn acquire(&self) -> RealmResult<ActiveConnection> {
        let snapshot = self.current_snapshot().await;
        let generation = self.generation.load(Ordering::Acquire);

        match &self.slots {
            Slots::Single(slot) => {
                let mut guard = slot.clone().lock_owned().await;
                if guard.generation != generation {
                    debug!("Retiring stale singleton connection handle");
                    guard.close_connection().await;
                    *guard = DirectoryHandle::new(snapshot, generation);
                }
                if guard.conn.is_none() {
                    // An open failure drops the guard, which releases the lock
                    self.open(&mut guard).await?;
                }
                Ok(ActiveConnection {
                    checkout: Checkout::Single(guard),
                })
            }
            Slots::Pooled { idle, .. } => {
                let mut handle = loop {
                    let popped = idle.lock().await.pop();
                    match popped {
                        Some(handle) if handle.generation == generation => break handle,
                        Some(mut stale) => {
                            debug!("Retiring stale pooled connection handle");
                            stale.close_connection().await;
                        }
                        None => break DirectoryHandle::new(snapshot.clone(), generation),
                    }
                };
                if handle.conn.is_none() {
                    self.open(&mut handle).await?;
                }
                Ok(ActiveConnection {
                    checkout: Checkout::Pooled(handle),
                })
            }
        }
    }

    /// Open the handle's live connection, trying the alternate endpoint at
    /// most once when the primary cannot be reached.
    async fn open(&self, handle: &mut DirectoryHandle) -> RealmResult<()> {
        let env = ConnectionEnvironment::for_endpoint(&handle.snapshot, Endpoint::Primary)?;
        match self.connector.connect(&env).await {
            Ok(conn) => {
                handle.conn = Some(conn);
                Ok(())
            }
            Err(primary_err) => {
                if handle.snapshot.config.alternate_url.is_none() {
                    return Err(primary_err);
                }
                info!(error = %primary_err, "primary endpoint failed, trying alternate");
                let env =
                    ConnectionEnvironment::for_endpoint(&handle.snapshot, Endpoint::Alternate)?;
                let conn = self.connector.connect(&env).await?;
                handle.conn = Some(conn);
                Ok(())
            }
        }
    }

    /// Return a handle so it can be recycled. A pooled handle beyond the pool
    /// capacity, or built against a retired snapshot, is closed instead.
    pub async fn release(&self, connection: ActiveConnection) {
        match connection.checkout {
            Checkout::Single(guard) => drop(guard),
            Checkout::Pooled(mut handle) => {
                let generation = self.generation.load(Ordering::Acquire);
                if handle.generation == generation && handle.conn.is_some() {
                    if let Slots::Pooled { idle, capacity } = &self.slots {
                        let mut idle = idle.lock().await;
                        if idle.len() < *capacity {
                            idle.push(handle);
                            return;
                        }
                    }
                }
                handle.close_connection().await;
            }
        }
    }

    /// Close a handle's live connection and take it out of circulation.
    /// Close-time errors are logged, not raised.
    pub async fn discard(&self, mut connection: ActiveConnection) {
        connection.close_connection().await;
        match connection.checkout {
            Checkout::Single(guard) => drop(guard),
            Checkout::Pooled(handle) => drop(handle),
        }
    }

    /// Close every idle pooled handle. Used at shutdown and after any
    /// directory error, since idle siblings may share the same fault.
    pub async fn drain(&self) {
        if let Slots::Pooled { idle, .. } = &self.slots {
            let mut drained = std::mem::take(&mut *idle.lock().await);
            for handle in &mut drained {
                handle.close_connection().await;
            }
        }
    }

    /// Close everything, including the singleton handle.
    pub async fn shutdown(&self) {
        match &self.slots {
            Slots::Single(slot) => {
                let mut guard = slot.lock().await;
                guard.close_connection().await;
            }
            Slots::Pooled { .. } => self.drain().await,
        }
    }

    /// Atomically swap the active configuration snapshot. Outstanding and
    /// idle handles built from earlier snapshots are retired, not mutated.
    pub async fn reconfigure(&self, snapshot: Arc<CompiledConfig>) {
        {
            let mut active = self.active.write().await;
            *active = snapshot;
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.drain().await;
    }
}
