//! Session bookkeeping for the dispatcher.
//!
//! A session is an opaque id. The registry hands out one async mutex per
//! session; the dispatcher holds it for the whole pipeline, so commands of
//! one session run strictly one after another while different sessions
//! proceed concurrently.

mod command_log;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::error::DispatchError;

pub use command_log::{CommandLog, CommandRecord, DEFAULT_LOG_CAPACITY};

/// Default idle time after which a session is forgotten.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// State owned by a single session.
#[derive(Debug)]
pub struct SessionState {
    pub id: String,
    pub log: CommandLog,
    pub commands_handled: u64,
}

impl SessionState {
    fn new(id: &str, log_capacity: usize) -> Self {
        Self {
            id: id.to_string(),
            log: CommandLog::new(log_capacity),
            commands_handled: 0,
        }
    }

    pub fn record(&mut self, record: CommandRecord) {
        self.commands_handled += 1;
        self.log.push(record);
    }
}

pub type SessionHandle = Arc<AsyncMutex<SessionState>>;

#[derive(Debug)]
struct Slot {
    state: SessionHandle,
    last_seen: Instant,
}

#[derive(Debug)]
struct Slots {
    by_id: HashMap<String, Slot>,
    last_purge: Instant,
}

#[derive(Debug)]
pub struct SessionRegistry {
    slots: Mutex<Slots>,
    idle_timeout: Duration,
    log_capacity: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT, DEFAULT_LOG_CAPACITY)
    }
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration, log_capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                by_id: HashMap::new(),
                last_purge: Instant::now(),
            }),
            idle_timeout,
            log_capacity,
        }
    }

    /// Handle for `session_id`, created on first use.
    pub fn acquire(&self, session_id: &str) -> Result<SessionHandle, DispatchError> {
        self.acquire_at(session_id, Instant::now())
    }

    pub fn acquire_at(&self, session_id: &str, now: Instant) -> Result<SessionHandle, DispatchError> {
        let mut slots = self.lock_slots()?;

        if now.saturating_duration_since(slots.last_purge) >= self.idle_timeout {
            Self::purge_idle(&mut slots, now, self.idle_timeout);
            slots.last_purge = now;
        }

        let log_capacity = self.log_capacity;
        let slot = slots
            .by_id
            .entry(session_id.to_string())
            .or_insert_with(|| Slot {
                state: Arc::new(AsyncMutex::new(SessionState::new(session_id, log_capacity))),
                last_seen: now,
            });
        slot.last_seen = now;
        Ok(Arc::clone(&slot.state))
    }

    /// The last `n` records of a session. Unknown sessions have none.
    pub async fn history(&self, session_id: &str, n: usize) -> Result<Vec<CommandRecord>, DispatchError> {
        let handle = {
            let slots = self.lock_slots()?;
            match slots.by_id.get(session_id) {
                Some(slot) => Arc::clone(&slot.state),
                None => return Ok(Vec::new()),
            }
        };
        let state = handle.lock().await;
        Ok(state.log.recent(n))
    }

    pub fn session_count(&self) -> usize {
        self.slots.lock().map(|s| s.by_id.len()).unwrap_or(0)
    }

    /// Drop sessions idle for longer than the timeout. Returns how many.
    pub fn purge_idle_at(&self, now: Instant) -> Result<usize, DispatchError> {
        let mut slots = self.lock_slots()?;
        let purged = Self::purge_idle(&mut slots, now, self.idle_timeout);
        slots.last_purge = now;
        Ok(purged)
    }

    fn purge_idle(slots: &mut Slots, now: Instant, idle_timeout: Duration) -> usize {
        let before = slots.by_id.len();
        // A session still referenced elsewhere is mid-command; keep it.
        slots.by_id.retain(|_, slot| {
            now.saturating_duration_since(slot.last_seen) < idle_timeout
                || Arc::strong_count(&slot.state) > 1
        });
        let purged = before - slots.by_id.len();
        if purged > 0 {
            debug!(purged, "Purged idle sessions");
        }
        purged
    }

    fn lock_slots(&self) -> Result<std::sync::MutexGuard<'_, Slots>, DispatchError> {
        self.slots
            .lock()
            .map_err(|e| DispatchError::Internal(format!("session registry lock poisoned: {e}")))
    }
}
