//! Line-oriented front end.
//!
//! Reads commands from stdin and sends each one through the dispatcher.
//! A few words are handled by the REPL itself and never reach the
//! pipeline.

use std::io::Write as _;
use std::sync::Arc;

use anyhow::Context as _;
use crossterm::style::Stylize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatcher::{CommandResponse, SecureDispatcher};

/// How a line typed at the prompt is handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplInput {
    Exit,
    Dashboard,
    History,
    Empty,
    Command(String),
}

pub fn classify(line: &str) -> ReplInput {
    match line.trim() {
        "" => ReplInput::Empty,
        "exit" | "quit" => ReplInput::Exit,
        ":dashboard" => ReplInput::Dashboard,
        ":history" => ReplInput::History,
        other => ReplInput::Command(other.to_string()),
    }
}

/// Response as printed, without colour.
pub fn render_response(response: &CommandResponse, json: bool) -> anyhow::Result<String> {
    if json {
        return serde_json::to_string(response).context("Failed to serialize response");
    }
    let mut text = response.display_text();
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    Ok(text)
}

pub fn render_dashboard(dispatcher: &SecureDispatcher) -> anyhow::Result<String> {
    serde_json::to_string_pretty(&dispatcher.monitor().dashboard())
        .context("Failed to serialize dashboard")
}

/// Run one command, cancelling it if Ctrl-C arrives first.
pub async fn run_command(dispatcher: &SecureDispatcher, line: &str, session_id: &str) -> CommandResponse {
    let cancel = CancellationToken::new();
    let handle = dispatcher.handle_with_cancel(line, session_id, &cancel);
    tokio::pin!(handle);

    tokio::select! {
        response = &mut handle => response,
        _ = tokio::signal::ctrl_c() => {
            warn!(session_id, "Interrupted, cancelling command");
            cancel.cancel();
            handle.await
        }
    }
}

pub fn print_response(response: &CommandResponse, json: bool) -> anyhow::Result<()> {
    let text = render_response(response, json)?;
    let mut stdout = std::io::stdout();
    if json || response.is_success() {
        write!(stdout, "{text}")?;
    } else {
        write!(stdout, "{}", text.red())?;
    }
    stdout.flush()?;
    Ok(())
}

pub async fn run(dispatcher: Arc<SecureDispatcher>, session_id: &str, json: bool) -> anyhow::Result<()> {
    info!(session_id, "REPL started");
    if !json {
        println!(
            "{} session {} ({} for commands, {} to leave)",
            "terminal-forge".bold(),
            session_id.cyan(),
            "help".green(),
            "exit".green()
        );
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        if !json {
            print!("{} ", "forge>".green().bold());
            std::io::stdout().flush()?;
        }

        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        match classify(&line) {
            ReplInput::Empty => continue,
            ReplInput::Exit => break,
            ReplInput::Dashboard => println!("{}", render_dashboard(&dispatcher)?),
            ReplInput::History => {
                for record in dispatcher.sessions().history(session_id, usize::MAX).await? {
                    let status = if record.exit_code == 0 {
                        record.exit_code.to_string().green()
                    } else {
                        record.exit_code.to_string().red()
                    };
                    println!("[{}] {}", status, record.command_line);
                }
            }
            ReplInput::Command(command) => {
                let response = run_command(&dispatcher, &command, session_id).await;
                print_response(&response, json)?;
            }
        }
    }

    info!(session_id, "REPL finished");
    Ok(())
}
