//! Input sanitization and validation.
//!
//! Raw command text is screened in two pure steps:
//! - [`validate_command`] rejects malformed or dangerous input, reporting the
//!   first failing check only.
//! - [`sanitize`] normalizes what is left (NFKC, denylisted characters,
//!   `..` sequences, length).
//!
//! Neither function has side effects. Reporting rejections to the security
//! monitor is the caller's job.

use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::error::DispatchError;

/// Sanitized output never exceeds this many characters.
pub const MAX_SANITIZED_LEN: usize = 1000;
/// Longest command accepted by validation.
pub const MAX_COMMAND_LEN: usize = 500;

/// Characters removed outright by [`sanitize`].
const DENYLIST: &[char] = &['<', '>', '\'', '"', '&'];

/// Sequences that chain or substitute commands.
const CHAIN_TOKENS: &[&str] = &["&&", "||", ";", "`", "$("];

#[allow(clippy::expect_used)] // literal pattern
static RM_RF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\brm\s+-[a-z]*(?:r[a-z]*f|f[a-z]*r)").expect("valid rm -rf pattern")
});

#[allow(clippy::expect_used)] // literal pattern
static SUDO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bsudo\b").expect("valid sudo pattern"));

/// Result of a validation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub accepted: bool,
    pub reason: Option<String>,
}

impl ValidationOutcome {
    pub fn accept() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// Apply canonical compatibility normalization (NFKC).
///
/// Fullwidth and other compatibility forms collapse to their ASCII
/// equivalents, so `ｓｕｄｏ` is seen as `sudo` by every later check.
pub fn normalize(raw: &str) -> String {
    raw.nfkc().collect()
}

/// Normalize raw input and strip characters that could change its meaning.
pub fn sanitize(raw: &str) -> String {
    let normalized = normalize(raw);

    let mut cleaned: String = normalized
        .chars()
        .filter_map(|ch| match ch {
            '\t' | '\n' | '\r' => Some(' '),
            c if c.is_ascii_control() => None,
            c if DENYLIST.contains(&c) => None,
            c => Some(c),
        })
        .collect();

    // Removing one `..` can join two dots into a new one ("...." -> "").
    while cleaned.contains("..") {
        cleaned = cleaned.replace("..", "");
    }

    cleaned.trim().chars().take(MAX_SANITIZED_LEN).collect()
}

/// Validate a command string. Checks run in a fixed order and the first
/// failure is the one reported.
pub fn validate_command(input: &str) -> ValidationOutcome {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return ValidationOutcome::reject("empty command");
    }

    if trimmed.chars().count() > MAX_COMMAND_LEN {
        return ValidationOutcome::reject(format!(
            "command too long (max {MAX_COMMAND_LEN} characters)"
        ));
    }

    if let Some(bad) = trimmed.chars().find(|c| !is_permitted_char(*c)) {
        return ValidationOutcome::reject(format!(
            "invalid character {:?} in command",
            bad
        ));
    }

    if RM_RF.is_match(trimmed) {
        return ValidationOutcome::reject("dangerous pattern detected: rm -rf");
    }

    if SUDO.is_match(trimmed) {
        return ValidationOutcome::reject("dangerous pattern detected: sudo");
    }

    if trimmed.contains("..") {
        return ValidationOutcome::reject("path traversal sequence '..' is not allowed");
    }

    if let Some(token) = CHAIN_TOKENS.iter().find(|t| trimmed.contains(**t)) {
        return ValidationOutcome::reject(format!(
            "shell chaining operator '{token}' is not allowed"
        ));
    }

    ValidationOutcome::accept()
}

/// Screen raw input for the dispatcher.
///
/// Validation runs on the NFKC-normalized text *before* characters are
/// stripped, so `ls && rm x` cannot be laundered into `ls  rm x`, and
/// again on the sanitized text, so stripped quotes cannot hide a pattern
/// (`s'u'do` becomes `sudo`).
pub fn screen(raw: &str) -> Result<String, DispatchError> {
    check(validate_command(&normalize(raw)))?;

    let sanitized = sanitize(raw);
    check(validate_command(&sanitized))?;
    Ok(sanitized)
}

fn check(outcome: ValidationOutcome) -> Result<(), DispatchError> {
    if outcome.accepted {
        return Ok(());
    }
    let reason = outcome.reason.unwrap_or_else(|| "invalid input".to_string());
    Err(DispatchError::InputRejected(reason))
}

/// `[a-zA-Z0-9\s\-_.~:"'=@/]`
fn is_permitted_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || c.is_whitespace()
        || matches!(c, '-' | '_' | '.' | '~' | ':' | '"' | '\'' | '=' | '@' | '/')
}
