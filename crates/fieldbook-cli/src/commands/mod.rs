//! CLI command definitions and handlers.

use std::io::Write;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use fieldbook_core::config::Config;
use fieldbook_core::connectivity::ConnectivityMonitor;
use fieldbook_core::session::{SessionManager, StaleSessionChoice, StaleSessionPrompt};
use fieldbook_core::storage::SecureStore;

pub mod login;
pub mod logout;
pub mod probe;
pub mod register;
pub mod reset_password;
pub mod status;
pub mod whoami;

/// Load configuration with graceful fallback to defaults.
pub fn load_config() -> Config {
    Config::load().unwrap_or_default()
}

/// Fieldbook - Offline-first field record keeping
#[derive(Parser)]
#[command(name = "fieldbook")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Log in to the Fieldbook server
    Login(LoginArgs),

    /// Log out and clear the local session
    Logout,

    /// Request a new account
    Register(RegisterArgs),

    /// Request a password reset email
    ResetPassword(ResetPasswordArgs),

    /// Show the logged-in user
    Whoami(JsonArgs),

    /// Show connectivity, session and sync state
    Status(JsonArgs),

    /// Probe the server health endpoint once
    Probe,
}

/// Arguments for the login command
#[derive(Parser)]
pub struct LoginArgs {
    /// Username to log in as
    pub username: String,

    /// Password (prompted when omitted)
    #[arg(short, long)]
    pub password: Option<String>,

    /// Keep the session across restarts
    #[arg(short, long)]
    pub remember: bool,
}

/// Arguments for the register command
#[derive(Parser)]
pub struct RegisterArgs {
    /// Desired username
    pub username: String,

    /// Contact email
    pub email: String,

    /// Password (prompted when omitted)
    #[arg(short, long)]
    pub password: Option<String>,
}

/// Arguments for the reset-password command
#[derive(Parser)]
pub struct ResetPasswordArgs {
    /// Email of the account to reset
    pub email: String,
}

/// Shared flag for commands with JSON output
#[derive(Parser)]
pub struct JsonArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// The assembled client services, ready for a command to drive.
pub struct Services {
    /// Loaded configuration
    pub config: Config,
    /// Connectivity monitor, already probed once
    pub connectivity: ConnectivityMonitor,
    /// Session manager over the secure store
    pub sessions: SessionManager,
}

/// Construct the service stack and settle connectivity with one probe.
pub async fn connect_services() -> Services {
    let config = load_config();
    tracing::debug!("Using server {}", config.server.base_url);

    let connectivity = ConnectivityMonitor::new(config.connectivity.clone(), &config.server);
    let store = Arc::new(SecureStore::open(&config.storage));
    let sessions = SessionManager::new(
        &config,
        connectivity.clone(),
        store,
        Arc::new(StdinPrompt),
    );

    connectivity.check().await;

    Services {
        config,
        connectivity,
        sessions,
    }
}

/// Prompt for a line of input on the terminal.
pub fn prompt_line(message: &str) -> anyhow::Result<String> {
    eprint!("{message}");
    std::io::stderr().flush()?;

    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end().to_string())
}

/// Stale-session decision on stdin: online with a valid session but no way
/// to refresh, ask whether to re-login or keep the cached data.
struct StdinPrompt;

impl StaleSessionPrompt for StdinPrompt {
    fn choose(&self) -> StaleSessionChoice {
        eprintln!("You are online, but no valid credentials remain to sync the database.");
        eprintln!("You can keep working with the local copy, or log in again.");

        match prompt_line("Log in again? [y/N] ") {
            Ok(answer) if answer.eq_ignore_ascii_case("y") => StaleSessionChoice::Relogin,
            _ => StaleSessionChoice::ContinueOffline,
        }
    }
}
