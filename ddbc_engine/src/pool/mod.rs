pub mod manager;

pub use manager::PoolManager;

use crate::config::PoolSettings;
use crate::engine::connection::{Connection, ConnectionOptions};
use crate::engine::environment::DriverContext;
use crate::error::{DdbcError, Result};
use log::Level;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use zeroize::Zeroizing;

/// Snapshot of a pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    /// Idle plus checked-out connections.
    pub size: usize,
    pub idle: usize,
    pub max_size: usize,
}

#[derive(Default)]
struct Slots {
    idle: VecDeque<Connection>,
    checked_out: HashSet<u64>,
    outstanding: usize,
    closed: bool,
}

impl Slots {
    fn forget(&mut self, id: u64) -> bool {
        if self.checked_out.remove(&id) {
            self.outstanding = self.outstanding.saturating_sub(1);
            true
        } else {
            false
        }
    }
}

/// Bounded pool of connections for one connection string.
///
/// Pool state is only touched under the pool's own lock and that lock is
/// never held across a driver call: liveness checks, resets, connects and
/// disconnects all run after the decision has been made and the lock
/// released. `size` never exceeds `max_size`.
pub struct ConnectionPool {
    ctx: Arc<DriverContext>,
    connection_string: Zeroizing<String>,
    options: ConnectionOptions,
    settings: PoolSettings,
    slots: Mutex<Slots>,
}

impl ConnectionPool {
    pub fn new(
        ctx: Arc<DriverContext>,
        connection_string: &str,
        settings: PoolSettings,
        options: ConnectionOptions,
    ) -> Result<Self> {
        settings.validate()?;
        crate::ddbc_log!(
            ctx.logger(),
            Level::Debug,
            "Created pool: max_size={}, idle_timeout={}s",
            settings.max_size,
            settings.idle_timeout.as_secs()
        );
        Ok(Self {
            ctx,
            connection_string: Zeroizing::new(connection_string.to_string()),
            options,
            settings,
            slots: Mutex::new(Slots::default()),
        })
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Checks out a connection: a reusable idle one when there is one,
    /// otherwise a freshly connected one while capacity remains.
    ///
    /// Idle connections idle for `idle_timeout` or longer are evicted first,
    /// so with a zero timeout every acquire opens a new connection. Idle
    /// connections that are dead or refuse a reset are discarded. Discarded
    /// connections are disconnected after the pool lock is released and a
    /// failing disconnect is only logged.
    pub fn acquire(&self) -> Result<Connection> {
        let mut discarded = Vec::new();
        let result = self.acquire_inner(&mut discarded);
        for conn in discarded {
            self.discard(conn);
        }
        result
    }

    fn acquire_inner(&self, discarded: &mut Vec<Connection>) -> Result<Connection> {
        loop {
            let candidate = {
                let mut slots = self.slots();
                if slots.closed {
                    return Err(DdbcError::State("Connection pool is closed".to_string()));
                }
                let timeout = self.settings.idle_timeout;
                while let Some(pos) = slots.idle.iter().position(|c| c.idle_for() >= timeout) {
                    if let Some(stale) = slots.idle.remove(pos) {
                        slots.outstanding = slots.outstanding.saturating_sub(1);
                        discarded.push(stale);
                    }
                }
                let candidate = slots.idle.pop_front();
                if let Some(conn) = &candidate {
                    slots.checked_out.insert(conn.id());
                }
                candidate
            };

            let Some(mut conn) = candidate else {
                return self.open_new();
            };
            if self.prepare_for_reuse(&mut conn) {
                crate::ddbc_log!(
                    self.ctx.logger(),
                    Level::Debug,
                    "Reusing pooled connection {}",
                    conn.id()
                );
                return Ok(conn);
            }
            self.slots().forget(conn.id());
            discarded.push(conn);
        }
    }

    fn prepare_for_reuse(&self, conn: &mut Connection) -> bool {
        if !conn.is_alive() {
            crate::ddbc_log!(
                self.ctx.logger(),
                Level::Info,
                "Discarding dead pooled connection {}",
                conn.id()
            );
            return false;
        }
        if !conn.reset() {
            return false;
        }
        if conn.autocommit() != self.options.autocommit {
            if let Err(e) = conn.set_autocommit(self.options.autocommit) {
                self.ctx.logger().log_error("restore autocommit", &e);
                return false;
            }
        }
        true
    }

    fn open_new(&self) -> Result<Connection> {
        {
            let mut slots = self.slots();
            if slots.outstanding >= self.settings.max_size {
                crate::ddbc_log!(
                    self.ctx.logger(),
                    Level::Warn,
                    "Pool at capacity ({} connections)",
                    slots.outstanding
                );
                return Err(DdbcError::PoolExhausted(format!(
                    "all {} connections are in use",
                    self.settings.max_size
                )));
            }
            slots.outstanding += 1;
        }

        let mut conn = Connection::new(self.ctx.clone(), &self.connection_string, self.options);
        conn.set_pooled(true);
        match conn.connect() {
            Ok(()) => {
                self.slots().checked_out.insert(conn.id());
                crate::ddbc_log!(
                    self.ctx.logger(),
                    Level::Debug,
                    "Opened pooled connection {}",
                    conn.id()
                );
                Ok(conn)
            }
            Err(e) => {
                let mut slots = self.slots();
                slots.outstanding = slots.outstanding.saturating_sub(1);
                Err(e)
            }
        }
    }

    /// Returns a connection to the idle set, or disconnects it when the idle
    /// set is already full or the pool has no room for it.
    pub fn release(&self, mut conn: Connection) {
        let rejected = {
            let mut slots = self.slots();
            let owned = slots.checked_out.contains(&conn.id());
            let has_room = slots.idle.len() < self.settings.max_size
                && (owned || slots.outstanding < self.settings.max_size);
            if !slots.closed && conn.is_connected() && has_room {
                if owned {
                    slots.checked_out.remove(&conn.id());
                } else {
                    slots.outstanding += 1;
                    conn.set_pooled(true);
                }
                conn.touch();
                slots.idle.push_back(conn);
                None
            } else {
                slots.forget(conn.id());
                Some(conn)
            }
        };
        if let Some(conn) = rejected {
            crate::ddbc_log!(
                self.ctx.logger(),
                Level::Debug,
                "Pool full, disconnecting returned connection {}",
                conn.id()
            );
            self.discard(conn);
        }
    }

    /// Disconnects every idle connection and resets the counters. Connections
    /// still checked out are disconnected when they come back.
    pub fn close(&self) {
        let drained: Vec<Connection> = {
            let mut slots = self.slots();
            slots.closed = true;
            slots.outstanding = 0;
            slots.checked_out.clear();
            slots.idle.drain(..).collect()
        };
        let count = drained.len();
        for conn in drained {
            self.discard(conn);
        }
        crate::ddbc_log!(
            self.ctx.logger(),
            Level::Info,
            "Closed pool ({} idle connections disconnected)",
            count
        );
    }

    fn discard(&self, mut conn: Connection) {
        if let Err(e) = conn.disconnect() {
            self.ctx.logger().log_error("pool disconnect", &e);
        }
    }

    pub fn state(&self) -> PoolState {
        let slots = self.slots();
        PoolState {
            size: slots.outstanding,
            idle: slots.idle.len(),
            max_size: self.settings.max_size,
        }
    }

    pub fn settings(&self) -> PoolSettings {
        self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.slots().closed
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("settings", &self.settings)
            .field("state", &self.state())
            .finish()
    }
}
