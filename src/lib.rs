//! terminal-forge - secure command execution for terminal-style front ends
//!
//! This library provides the command pipeline behind the terminal:
//! - Input sanitization and validation
//! - Command/argument allowlisting with per-command execution modes
//! - Per-session rate limiting and sequential handling
//! - Simulated and real (sandboxed subprocess) execution
//! - Security event monitoring with threshold alerts
//!
//! # Example
//!
//! ```no_run
//! use terminal_forge::config::AppConfig;
//! use terminal_forge::dispatcher::SecureDispatcher;
//!
//! #[tokio::main]
//! async fn main() {
//!     let dispatcher = SecureDispatcher::from_config(&AppConfig::default());
//!
//!     let response = dispatcher.handle("cargo build --release", "session-1").await;
//!     assert_eq!(response.exit_code, 0);
//!
//!     let response = dispatcher.handle("rm -rf /", "session-1").await;
//!     assert_eq!(response.exit_code, 400);
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod repl;
pub mod security;
pub mod session;
pub mod shell;
pub mod utils;

// Re-export commonly used types
pub use config::AppConfig;
pub use dispatcher::{CommandResponse, DispatchContext, SecureDispatcher};
pub use error::{DispatchError, Outcome};
pub use security::{Allowlist, AllowlistEntry, SecurityMonitor};
