//! Main entry point for terminal-forge.
//!
//! Resolves configuration, initializes logging, builds the dispatcher and
//! then either runs a single command or the interactive REPL.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use crossterm::style::Stylize;
use uuid::Uuid;

use terminal_forge::config::{self, AppConfig};
use terminal_forge::dispatcher::SecureDispatcher;
use terminal_forge::{repl, utils};

#[derive(Parser, Debug)]
#[command(name = "terminal-forge")]
#[command(about = "Allowlisted, rate-limited, audited command execution")]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.terminal-forge/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Session id (default: a fresh UUID)
    #[arg(long)]
    session: Option<String>,

    /// Enable real execution for commands listed in `execution.real_commands`
    #[arg(long)]
    allow_real: bool,

    /// Print responses as JSON
    #[arg(long)]
    json: bool,

    /// Run a single command and exit with its exit code
    #[arg(long, value_name = "TEXT")]
    command: Option<String>,

    /// Print the security dashboard before exiting
    #[arg(long)]
    dashboard: bool,

    /// Write the default configuration to the config path and exit
    #[arg(long)]
    init_config: bool,

    /// Directory for log files (default: logs/ next to the executable)
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if cli.init_config {
        let path = cli.config.clone().unwrap_or_else(config::default_config_path);
        config::save(&path, &AppConfig::default())?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }

    // Held until the end of main so buffered log lines are flushed.
    let _log_guard = match utils::logger::init_logging(
        &cli.log_dir.clone().unwrap_or_else(utils::logger::default_log_dir),
    ) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("{} logging disabled: {:#}", "warning:".yellow(), e);
            None
        }
    };

    let mut app_config = AppConfig::resolve(cli.config.as_deref())?;
    if cli.allow_real {
        app_config.execution.allow_real_execution = true;
    }

    let dispatcher = Arc::new(SecureDispatcher::from_config(&app_config));
    let session_id = cli.session.unwrap_or_else(|| Uuid::new_v4().to_string());

    let exit_code = match cli.command {
        Some(command) => {
            let response = repl::run_command(&dispatcher, &command, &session_id).await;
            repl::print_response(&response, cli.json)?;
            ExitCode::from(u8::try_from(response.exit_code.clamp(0, 255)).unwrap_or(u8::MAX))
        }
        None => {
            repl::run(Arc::clone(&dispatcher), &session_id, cli.json).await?;
            ExitCode::SUCCESS
        }
    };

    if cli.dashboard {
        println!("{}", repl::render_dashboard(&dispatcher)?);
    }

    Ok(exit_code)
}
