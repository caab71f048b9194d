//! Per-session fixed-window rate limiting.
//!
//! Each session gets `limit` commands per `window`. The read-and-increment
//! of a session's counter happens under one lock, so concurrent callers can
//! neither lose an update nor count one command twice.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::error::DispatchError;

#[derive(Debug, Clone, Copy)]
struct WindowState {
    started: Instant,
    count: u32,
}

#[derive(Debug)]
struct Windows {
    by_session: HashMap<String, WindowState>,
    last_purge: Instant,
}

/// Result of counting one command against a session's quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Commands still available in the current window.
    pub remaining: u32,
    /// Time until the current window resets.
    pub retry_after: Duration,
}

#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(Windows {
                by_session: HashMap::new(),
                last_purge: Instant::now(),
            }),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count one command for `session_id`.
    pub fn check(&self, session_id: &str) -> Result<RateDecision, DispatchError> {
        self.check_at(session_id, Instant::now())
    }

    pub fn check_at(&self, session_id: &str, now: Instant) -> Result<RateDecision, DispatchError> {
        let mut windows = self
            .windows
            .lock()
            .map_err(|e| DispatchError::Internal(format!("rate limiter lock poisoned: {e}")))?;

        if now.saturating_duration_since(windows.last_purge) >= self.window {
            let window = self.window;
            let before = windows.by_session.len();
            windows
                .by_session
                .retain(|_, state| now.saturating_duration_since(state.started) < window);
            windows.last_purge = now;
            let purged = before - windows.by_session.len();
            if purged > 0 {
                debug!(purged, "Purged expired rate-limit windows");
            }
        }

        let state = windows
            .by_session
            .entry(session_id.to_string())
            .or_insert(WindowState {
                started: now,
                count: 0,
            });

        let elapsed = now.saturating_duration_since(state.started);
        if elapsed >= self.window {
            state.started = now;
            state.count = 0;
        }
        let retry_after = self
            .window
            .saturating_sub(now.saturating_duration_since(state.started));

        if state.count >= self.limit {
            return Ok(RateDecision {
                allowed: false,
                remaining: 0,
                retry_after,
            });
        }

        state.count += 1;
        Ok(RateDecision {
            allowed: true,
            remaining: self.limit - state.count,
            retry_after,
        })
    }

    /// Count one command and report whether it may proceed. A poisoned
    /// limiter refuses everything.
    pub fn is_allowed(&self, session_id: &str) -> bool {
        match self.check(session_id) {
            Ok(decision) => decision.allowed,
            Err(e) => {
                error!(session_id, "Rate limiter unavailable: {}", e);
                false
            }
        }
    }

    /// Commands left for `session_id` in its current window, without
    /// counting anything.
    pub fn remaining(&self, session_id: &str) -> u32 {
        self.remaining_at(session_id, Instant::now())
    }

    pub fn remaining_at(&self, session_id: &str, now: Instant) -> u32 {
        let Ok(windows) = self.windows.lock() else {
            return 0;
        };
        match windows.by_session.get(session_id) {
            Some(state) if now.saturating_duration_since(state.started) < self.window => {
                self.limit.saturating_sub(state.count)
            }
            _ => self.limit,
        }
    }

    /// Number of sessions with a tracked window.
    pub fn tracked_sessions(&self) -> usize {
        self.windows
            .lock()
            .map(|w| w.by_session.len())
            .unwrap_or(0)
    }
}
