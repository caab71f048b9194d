//! Command allowlist management.
//!
//! This module owns the static table of permitted commands and the argument
//! rules attached to each one. A command that is not in the table is never
//! executed, no matter how harmless its text looks.
//!
//! Argument checking combines an exact per-command set (a hash lookup) with a
//! handful of generic "safe shapes" (flags, identifiers, quoted strings) so
//! that new flags on well-known tools work without being enumerated, while
//! redirection, piping and substitution syntax can never match.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::sanitizer::ValidationOutcome;
use crate::error::DispatchError;

/// Maximum edit distance for "did you mean" suggestions.
const SUGGESTION_MAX_DISTANCE: usize = 2;

#[allow(clippy::expect_used)] // literal patterns
static SAFE_SHAPES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // long flag
        r"^--[a-zA-Z0-9-]+$",
        // short flag
        r"^-[a-zA-Z0-9]$",
        // bare identifier
        r"^[a-zA-Z0-9._-]+$",
        // single- or double-quoted string without shell syntax inside
        r#"^'[^'"`$;&|<>\\]*'$"#,
        r#"^"[^'"`$;&|<>\\]*"$"#,
        // space-separated plain text
        r"^[a-zA-Z0-9._-]+(?: [a-zA-Z0-9._-]+)*$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid safe-shape pattern"))
    .collect()
});

#[allow(clippy::expect_used)] // literal pattern
static RELATIVE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._-]+(?:/[a-zA-Z0-9._-]+)*/?$").expect("valid path pattern")
});

/// How an allowed command is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// Deterministic canned output, nothing is spawned.
    #[default]
    Simulated,
    /// Real subprocess, only if real execution is also enabled globally.
    Real,
}

fn default_max_args() -> usize {
    10
}

/// Argument rules for one permitted command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowlistEntry {
    pub command: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub allowed_args: HashSet<String>,
    /// Arguments refused even when a safe shape would match them.
    #[serde(default)]
    pub denied_args: HashSet<String>,
    #[serde(default)]
    pub requires_args: bool,
    #[serde(default = "default_max_args")]
    pub max_args: usize,
    /// Only exact `allowed_args` members are accepted; safe shapes are off.
    #[serde(default)]
    pub strict_args: bool,
    /// Relative paths such as `src/main.rs` are accepted.
    #[serde(default)]
    pub path_args: bool,
    #[serde(default)]
    pub mode: ExecMode,
}

impl AllowlistEntry {
    pub fn new(command: &str, description: &str) -> Self {
        Self {
            command: command.to_string(),
            description: description.to_string(),
            allowed_args: HashSet::new(),
            denied_args: HashSet::new(),
            requires_args: false,
            max_args: default_max_args(),
            strict_args: false,
            path_args: false,
            mode: ExecMode::Simulated,
        }
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.allowed_args.extend(args.iter().map(|a| a.to_string()));
        self
    }

    pub fn deny(mut self, args: &[&str]) -> Self {
        self.denied_args.extend(args.iter().map(|a| a.to_string()));
        self
    }

    pub fn max_args(mut self, max: usize) -> Self {
        self.max_args = max;
        self
    }

    pub fn requires_args(mut self) -> Self {
        self.requires_args = true;
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict_args = true;
        self
    }

    pub fn paths(mut self) -> Self {
        self.path_args = true;
        self
    }

    pub fn mode(mut self, mode: ExecMode) -> Self {
        self.mode = mode;
        self
    }

    /// Check a single argument against this entry's rules.
    pub fn permits_arg(&self, arg: &str) -> bool {
        if self.denied_args.contains(arg) {
            return false;
        }
        if self.allowed_args.contains(arg) {
            return true;
        }
        if self.strict_args || arg.contains("..") {
            return false;
        }
        if SAFE_SHAPES.iter().any(|re| re.is_match(arg)) {
            return true;
        }
        self.path_args && RELATIVE_PATH.is_match(arg)
    }

    /// Validate an argument list, failing on the first offending argument.
    pub fn validate_args(&self, args: &[String]) -> ValidationOutcome {
        if args.len() > self.max_args {
            return ValidationOutcome::reject(format!(
                "too many arguments for '{}' (max {})",
                self.command, self.max_args
            ));
        }
        if self.requires_args && args.is_empty() {
            return ValidationOutcome::reject(format!(
                "'{}' requires at least one argument",
                self.command
            ));
        }
        match args.iter().find(|a| !self.permits_arg(a)) {
            Some(bad) => ValidationOutcome::reject(format!(
                "invalid argument '{}' for '{}'",
                bad, self.command
            )),
            None => ValidationOutcome::accept(),
        }
    }
}

/// Immutable table of permitted commands.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    entries: HashMap<String, AllowlistEntry>,
}

impl Allowlist {
    pub fn from_entries(entries: impl IntoIterator<Item = AllowlistEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|e| (e.command.clone(), e))
                .collect(),
        }
    }

    /// The command set offered by the terminal out of the box.
    pub fn builtin() -> Self {
        Self::from_entries(builtin_entries())
    }

    /// Add or replace entries. Used while assembling the table at startup.
    pub fn with_entries(mut self, extra: impl IntoIterator<Item = AllowlistEntry>) -> Self {
        for entry in extra {
            self.entries.insert(entry.command.clone(), entry);
        }
        self
    }

    /// Promote the named commands to real execution. Unknown names are
    /// returned so the caller can report them.
    pub fn with_real_execution(mut self, names: &[String]) -> (Self, Vec<String>) {
        let mut unknown = Vec::new();
        for name in names {
            match self.entries.get_mut(name) {
                Some(entry) => entry.mode = ExecMode::Real,
                None => unknown.push(name.clone()),
            }
        }
        (self, unknown)
    }

    pub fn is_known_command(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&AllowlistEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sorted by command name.
    pub fn entries(&self) -> Vec<&AllowlistEntry> {
        let mut all: Vec<&AllowlistEntry> = self.entries.values().collect();
        all.sort_by(|a, b| a.command.cmp(&b.command));
        all
    }

    pub fn validate(&self, name: &str, args: &[String]) -> ValidationOutcome {
        match self.entries.get(name) {
            Some(entry) => entry.validate_args(args),
            None => ValidationOutcome::reject(format!("command '{name}' is not in allowlist")),
        }
    }

    /// Like [`validate`](Self::validate) but returns the matching entry, and
    /// a "did you mean" suggestion for unknown commands.
    pub fn check(&self, name: &str, args: &[String]) -> Result<&AllowlistEntry, DispatchError> {
        let Some(entry) = self.entries.get(name) else {
            return Err(DispatchError::PolicyRejected {
                reason: format!("command '{name}' is not in allowlist"),
                suggestion: self.suggest(name),
            });
        };

        let outcome = entry.validate_args(args);
        if outcome.accepted {
            Ok(entry)
        } else {
            Err(DispatchError::PolicyRejected {
                reason: outcome
                    .reason
                    .unwrap_or_else(|| format!("invalid arguments for '{name}'")),
                suggestion: None,
            })
        }
    }

    /// Closest known command within edit distance 2, ties broken
    /// alphabetically.
    pub fn suggest(&self, name: &str) -> Option<String> {
        self.entries
            .keys()
            .filter(|known| known.as_str() != name)
            .map(|known| (levenshtein_distance(name, known), known))
            .filter(|(distance, _)| *distance <= SUGGESTION_MAX_DISTANCE)
            .min()
            .map(|(_, known)| known.clone())
    }
}

fn builtin_entries() -> Vec<AllowlistEntry> {
    vec![
        AllowlistEntry::new("help", "Show available commands").max_args(1),
        AllowlistEntry::new("clear", "Clear the terminal screen").max_args(0),
        AllowlistEntry::new("pwd", "Print working directory").max_args(0),
        AllowlistEntry::new("ls", "List directory contents")
            .args(&["-l", "-a", "-h", "-R", "-t", "-1", "--all", "--human-readable"])
            .max_args(6)
            .paths(),
        AllowlistEntry::new("cd", "Change directory")
            .args(&["~", "/", "-"])
            .max_args(1)
            .paths(),
        AllowlistEntry::new("cat", "Print file contents")
            .args(&["-n"])
            .requires_args()
            .max_args(5)
            .paths(),
        AllowlistEntry::new("find", "Search for files")
            .args(&["-name", "-type", "-maxdepth", "f", "d"])
            .deny(&["-exec", "-execdir", "-delete", "-ok", "-okdir", "-fprint"])
            .max_args(6)
            .paths(),
        AllowlistEntry::new("echo", "Print text").max_args(20),
        AllowlistEntry::new("whoami", "Print current user").max_args(0),
        AllowlistEntry::new("date", "Print date and time")
            .args(&["-u", "--utc"])
            .max_args(1),
        AllowlistEntry::new("uname", "Print system information")
            .args(&["-a", "-s", "-r", "-m", "-n"])
            .strict()
            .max_args(2),
        AllowlistEntry::new("which", "Locate a development tool")
            .args(&["cargo", "rustc", "rustup", "git", "node", "npm", "python3", "ls", "cat", "echo"])
            .strict()
            .requires_args()
            .max_args(3),
        AllowlistEntry::new("history", "Show command history").max_args(1),
        AllowlistEntry::new("cargo", "Rust package manager")
            .args(&[
                "build", "test", "run", "check", "clippy", "fmt", "doc", "clean", "tree",
                "--release", "--verbose", "--quiet", "--workspace", "--all-targets", "--version",
                "-v", "-q", "-V",
            ])
            .deny(&["--config", "-Z", "install", "publish", "login", "owner", "yank"])
            .requires_args()
            .max_args(8),
        AllowlistEntry::new("rustc", "Rust compiler")
            .args(&["--version", "-V", "--explain"])
            .max_args(3),
        AllowlistEntry::new("git", "Version control (read-only)")
            .args(&["status", "log", "diff", "show", "branch", "--oneline", "--stat", "--short", "-n"])
            .deny(&[
                "-c", "--exec-path", "push", "reset", "clean", "rebase", "checkout", "merge",
                "pull", "config",
            ])
            .requires_args()
            .max_args(6)
            .paths(),
        AllowlistEntry::new("node", "Node.js runtime version")
            .args(&["--version", "-v"])
            .strict()
            .requires_args()
            .max_args(1),
        AllowlistEntry::new("npm", "Node package manager")
            .args(&["--version", "-v", "test", "run", "build", "start", "list", "ls", "ci"])
            .strict()
            .requires_args()
            .max_args(4),
    ]
}

/// Levenshtein edit distance between two strings.
fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}
