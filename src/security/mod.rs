//! Security module for command screening, throttling and auditing.
//!
//! This module provides the leaf components of the command pipeline:
//! input sanitization, the command allowlist, per-session rate limiting,
//! and the security event monitor.

pub mod allowlist;
pub mod monitor;
pub mod rate_limit;
pub mod sanitizer;

pub use allowlist::{Allowlist, AllowlistEntry, ExecMode};
pub use monitor::{
    AlertSink, DashboardSummary, MonitorConfig, SecurityAlert, SecurityEvent, SecurityMonitor,
    Severity, TracingAlertSink, event_types,
};
pub use rate_limit::{RateDecision, RateLimiter};
pub use sanitizer::{ValidationOutcome, sanitize, validate_command};
