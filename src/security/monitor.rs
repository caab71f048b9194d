//! Security event log with threshold alerting.
//!
//! Events go into a fixed-capacity ring buffer (oldest evicted first). Next
//! to the buffer the monitor keeps a sliding counter per (session, event
//! type) and per-session timestamps of high/critical events, so threshold
//! and suspicion checks never rescan the whole log.
//!
//! Logging is fire-and-forget: callers never observe a failure, and alerting
//! does not block anything by itself.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Event type names emitted by the pipeline.
pub mod event_types {
    pub const INVALID_INPUT: &str = "invalid_input";
    pub const RATE_LIMIT_VIOLATIONS: &str = "rate_limit_violations";
    pub const SUSPICIOUS_COMMANDS: &str = "suspicious_commands";
    pub const COMMAND_REJECTED: &str = "COMMAND_REJECTED";
    pub const BLOCKED_SESSION: &str = "blocked_session";
    pub const COMMAND_EXECUTED: &str = "command_executed";
    pub const EXECUTION_FAILED: &str = "execution_failed";
    pub const EXECUTION_TIMEOUT: &str = "execution_timeout";
    pub const EXECUTION_CANCELLED: &str = "execution_cancelled";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

const MINUTE_MS: i64 = 60_000;
/// Alerts kept for the dashboard.
const MAX_ALERTS: usize = 100;
/// Sweep idle counters every this many appends.
const COUNTER_SWEEP_INTERVAL: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// One audit record. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub severity: Severity,
    pub session_id: String,
    pub timestamp_ms: i64,
    pub details: BTreeMap<String, String>,
}

/// Raised when a session's count for one event type reaches its threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityAlert {
    pub event_type: String,
    pub session_id: String,
    pub count: usize,
    pub threshold: u32,
    pub window_minutes: u64,
    pub timestamp_ms: i64,
}

/// Receiver for alerts. A full deployment would forward them to an
/// external notification service.
pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: &SecurityAlert);
}

/// Writes alerts to the log.
#[derive(Debug, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn notify(&self, alert: &SecurityAlert) {
        warn!(
            event_type = %alert.event_type,
            session_id = %alert.session_id,
            count = alert.count,
            threshold = alert.threshold,
            "Security alert: threshold reached within {} minutes",
            alert.window_minutes
        );
    }
}

fn default_thresholds() -> HashMap<String, u32> {
    use event_types::*;
    [
        (INVALID_INPUT, 10),
        (RATE_LIMIT_VIOLATIONS, 5),
        (SUSPICIOUS_COMMANDS, 5),
        (COMMAND_REJECTED, 10),
        (BLOCKED_SESSION, 5),
        (EXECUTION_TIMEOUT, 3),
        (INTERNAL_ERROR, 1),
    ]
    .into_iter()
    .map(|(t, n)| (t.to_string(), n))
    .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Ring buffer capacity.
    pub capacity: usize,
    /// Rolling window for thresholds and the dashboard.
    pub alert_window_minutes: u64,
    pub suspicious_window_minutes: u64,
    /// High/critical events within the suspicious window that flag a session.
    pub suspicious_threshold: usize,
    /// Event type -> count per window that triggers an alert.
    pub thresholds: HashMap<String, u32>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            alert_window_minutes: 60,
            suspicious_window_minutes: 30,
            suspicious_threshold: 3,
            thresholds: default_thresholds(),
        }
    }
}

/// Aggregate view over the current window, recomputed on every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardSummary {
    /// Events currently held in the buffer.
    pub total_events: usize,
    /// Events ever logged, including evicted ones.
    pub total_logged: u64,
    pub recent_events: usize,
    pub critical_events: usize,
    pub high_events: usize,
    pub top_event_types: Vec<(String, usize)>,
    pub suspicious_sessions: Vec<String>,
    pub alerts_triggered: usize,
    pub recent_alerts: Vec<SecurityAlert>,
    pub window_minutes: u64,
}

#[derive(Debug, Default)]
struct MonitorState {
    events: VecDeque<SecurityEvent>,
    /// (session, type) -> timestamps inside the alert window.
    counters: HashMap<(String, String), VecDeque<i64>>,
    /// session -> timestamps of high/critical events inside the suspicious window.
    severe: HashMap<String, VecDeque<i64>>,
    alerts: VecDeque<SecurityAlert>,
    alerts_total: usize,
    total_logged: u64,
}

pub struct SecurityMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    sink: Arc<dyn AlertSink>,
}

impl std::fmt::Debug for SecurityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityMonitor")
            .field("config", &self.config)
            .finish()
    }
}

impl Default for SecurityMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl SecurityMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_sink(config, Arc::new(TracingAlertSink))
    }

    pub fn with_sink(mut config: MonitorConfig, sink: Arc<dyn AlertSink>) -> Self {
        config.capacity = config.capacity.max(1);
        Self {
            state: Mutex::new(MonitorState {
                events: VecDeque::with_capacity(config.capacity),
                ..MonitorState::default()
            }),
            config,
            sink,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Record an event now.
    pub fn log_event(
        &self,
        event_type: &str,
        severity: Severity,
        session_id: &str,
        details: BTreeMap<String, String>,
    ) {
        self.log_event_at(
            event_type,
            severity,
            session_id,
            details,
            chrono::Utc::now().timestamp_millis(),
        );
    }

    pub fn log_event_at(
        &self,
        event_type: &str,
        severity: Severity,
        session_id: &str,
        details: BTreeMap<String, String>,
        timestamp_ms: i64,
    ) {
        trace_event(event_type, severity, session_id, &details);

        let event = SecurityEvent {
            event_type: event_type.to_string(),
            severity,
            session_id: session_id.to_string(),
            timestamp_ms,
            details,
        };

        let alert = {
            let mut state = self.lock_state();
            self.append(&mut state, event)
        };

        if let Some(alert) = alert {
            self.sink.notify(&alert);
        }
    }

    fn append(&self, state: &mut MonitorState, event: SecurityEvent) -> Option<SecurityAlert> {
        let now = event.timestamp_ms;
        let alert_cutoff = now.saturating_sub(self.alert_window_ms());
        let severe_cutoff = now.saturating_sub(self.suspicious_window_ms());

        if state.events.len() >= self.config.capacity {
            state.events.pop_front();
        }
        state.total_logged += 1;

        if event.severity >= Severity::High {
            let stamps = state.severe.entry(event.session_id.clone()).or_default();
            stamps.push_back(now);
            prune_before(stamps, severe_cutoff);
        }

        let key = (event.session_id.clone(), event.event_type.clone());
        let stamps = state.counters.entry(key).or_default();
        stamps.push_back(now);
        prune_before(stamps, alert_cutoff);
        let count = stamps.len();

        let alert = self
            .config
            .thresholds
            .get(&event.event_type)
            .filter(|threshold| count == **threshold as usize)
            .map(|threshold| SecurityAlert {
                event_type: event.event_type.clone(),
                session_id: event.session_id.clone(),
                count,
                threshold: *threshold,
                window_minutes: self.config.alert_window_minutes,
                timestamp_ms: now,
            });

        if let Some(alert) = &alert {
            if state.alerts.len() >= MAX_ALERTS {
                state.alerts.pop_front();
            }
            state.alerts.push_back(alert.clone());
            state.alerts_total += 1;
        }

        state.events.push_back(event);

        if state.total_logged % COUNTER_SWEEP_INTERVAL == 0 {
            state
                .counters
                .retain(|_, stamps| stamps.back().is_some_and(|t| *t >= alert_cutoff));
            state
                .severe
                .retain(|_, stamps| stamps.back().is_some_and(|t| *t >= severe_cutoff));
        }

        alert
    }

    /// Events logged within the last `window_minutes`, oldest first.
    pub fn get_recent_events(&self, window_minutes: u64) -> Vec<SecurityEvent> {
        self.get_recent_events_at(window_minutes, chrono::Utc::now().timestamp_millis())
    }

    pub fn get_recent_events_at(&self, window_minutes: u64, now_ms: i64) -> Vec<SecurityEvent> {
        let cutoff = now_ms.saturating_sub(minutes_to_ms(window_minutes));
        self.lock_state()
            .events
            .iter()
            .filter(|e| e.timestamp_ms >= cutoff)
            .cloned()
            .collect()
    }

    /// Events in the buffer for one session, oldest first.
    pub fn events_for_session(&self, session_id: &str) -> Vec<SecurityEvent> {
        self.lock_state()
            .events
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }

    /// True once the session has accumulated enough high/critical events
    /// inside the suspicious window.
    pub fn is_suspicious_session(&self, session_id: &str) -> bool {
        self.is_suspicious_session_at(session_id, chrono::Utc::now().timestamp_millis())
    }

    pub fn is_suspicious_session_at(&self, session_id: &str, now_ms: i64) -> bool {
        let cutoff = now_ms.saturating_sub(self.suspicious_window_ms());
        let state = self.lock_state();
        state
            .severe
            .get(session_id)
            .map(|stamps| stamps.iter().filter(|t| **t >= cutoff).count())
            .is_some_and(|n| n >= self.config.suspicious_threshold)
    }

    pub fn dashboard(&self) -> DashboardSummary {
        self.dashboard_at(chrono::Utc::now().timestamp_millis())
    }

    pub fn dashboard_at(&self, now_ms: i64) -> DashboardSummary {
        let alert_cutoff = now_ms.saturating_sub(self.alert_window_ms());
        let severe_cutoff = now_ms.saturating_sub(self.suspicious_window_ms());
        let state = self.lock_state();

        let mut recent_events = 0;
        let mut critical_events = 0;
        let mut high_events = 0;
        let mut by_type: HashMap<&str, usize> = HashMap::new();
        for event in state.events.iter().filter(|e| e.timestamp_ms >= alert_cutoff) {
            recent_events += 1;
            match event.severity {
                Severity::Critical => critical_events += 1,
                Severity::High => high_events += 1,
                _ => {}
            }
            *by_type.entry(event.event_type.as_str()).or_default() += 1;
        }

        let mut top_event_types: Vec<(String, usize)> = by_type
            .into_iter()
            .map(|(t, n)| (t.to_string(), n))
            .collect();
        top_event_types.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_event_types.truncate(5);

        let mut suspicious_sessions: Vec<String> = state
            .severe
            .iter()
            .filter(|(_, stamps)| {
                stamps.iter().filter(|t| **t >= severe_cutoff).count()
                    >= self.config.suspicious_threshold
            })
            .map(|(session, _)| session.clone())
            .collect();
        suspicious_sessions.sort();

        DashboardSummary {
            total_events: state.events.len(),
            total_logged: state.total_logged,
            recent_events,
            critical_events,
            high_events,
            top_event_types,
            suspicious_sessions,
            alerts_triggered: state.alerts_total,
            recent_alerts: state.alerts.iter().rev().take(10).cloned().collect(),
            window_minutes: self.config.alert_window_minutes,
        }
    }

    fn alert_window_ms(&self) -> i64 {
        minutes_to_ms(self.config.alert_window_minutes)
    }

    fn suspicious_window_ms(&self) -> i64 {
        minutes_to_ms(self.config.suspicious_window_minutes)
    }

    /// The log is append-only, so a panic mid-append cannot leave it in a
    /// state worse than missing one event. Recover and keep logging.
    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            error!("Security monitor state was poisoned; recovering");
            poisoned.into_inner()
        })
    }
}

/// Minutes as milliseconds, clamped instead of overflowing.
fn minutes_to_ms(minutes: u64) -> i64 {
    i64::try_from(minutes)
        .unwrap_or(i64::MAX)
        .saturating_mul(MINUTE_MS)
}

fn prune_before(stamps: &mut VecDeque<i64>, cutoff: i64) {
    while stamps.front().is_some_and(|t| *t < cutoff) {
        stamps.pop_front();
    }
}

fn trace_event(
    event_type: &str,
    severity: Severity,
    session_id: &str,
    details: &BTreeMap<String, String>,
) {
    match severity {
        Severity::Low => debug!(event_type, session_id, ?details, "Security event"),
        Severity::Medium => info!(event_type, session_id, ?details, "Security event"),
        Severity::High => warn!(event_type, session_id, ?details, "Security event"),
        Severity::Critical => error!(event_type, session_id, ?details, "Security event"),
    }
}

/// Build a details map from string pairs.
pub fn details<const N: usize>(pairs: [(&str, String); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
