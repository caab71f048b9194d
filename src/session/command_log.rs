//! Per-session command transcript.
//!
//! Records what a session ran and what came back, so the `history` builtin
//! and the REPL's `:history` can replay it.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of records kept per session.
pub const DEFAULT_LOG_CAPACITY: usize = 200;

/// A single command with its result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    #[serde(rename = "command")]
    pub command_line: String,
    pub output: String,
    pub exit_code: i32,
    pub timestamp: DateTime<Utc>,
}

impl CommandRecord {
    pub fn new(command_line: impl Into<String>, output: &str, exit_code: i32) -> Self {
        Self {
            command_line: clean_command_line(&command_line.into()),
            // Stored output is plain text; `clear` and real tools emit escapes.
            output: strip_ansi_codes(output),
            exit_code,
            timestamp: Utc::now(),
        }
    }
}

/// Bounded log of recent commands, oldest evicted first.
#[derive(Debug)]
pub struct CommandLog {
    entries: VecDeque<CommandRecord>,
    max_len: usize,
}

impl CommandLog {
    pub fn new(max_len: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_len.min(DEFAULT_LOG_CAPACITY)),
            max_len,
        }
    }

    /// Add a record, dropping the oldest one when full.
    pub fn push(&mut self, record: CommandRecord) {
        if self.max_len == 0 {
            return;
        }
        if self.entries.len() >= self.max_len {
            self.entries.pop_front();
        }
        self.entries.push_back(record);
    }

    pub fn entries(&self) -> impl Iterator<Item = &CommandRecord> {
        self.entries.iter()
    }

    /// The most recent `n` records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<CommandRecord> {
        let start = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(start).cloned().collect()
    }

    /// Numbered command lines, the way a shell prints `history`.
    pub fn render(&self, n: usize) -> String {
        let start = self.entries.len().saturating_sub(n);
        let mut out = String::new();
        for (idx, record) in self.entries.iter().enumerate().skip(start) {
            out.push_str(&format!("{:>5}  {}\n", idx + 1, record.command_line));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CommandLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

/// Single-line, printable form of a submitted command.
fn clean_command_line(text: &str) -> String {
    strip_ansi_codes(text)
        .chars()
        .filter_map(|c| match c {
            '\t' | '\n' | '\r' => Some(' '),
            c if c.is_control() => None,
            c => Some(c),
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Strip ANSI escape codes from text.
/// Removes color codes, cursor movements, and OSC sequences.
fn strip_ansi_codes(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '\x1b' {
            result.push(ch);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                // CSI ends at the first letter
                for next_ch in chars.by_ref() {
                    if next_ch.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                // OSC ends at BEL or ST (ESC \)
                while let Some(next_ch) = chars.next() {
                    if next_ch == '\x07' {
                        break;
                    }
                    if next_ch == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    result
}
