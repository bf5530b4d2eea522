//! Fieldbook CLI - Offline-first field record keeping
//!
//! The operational surface of the Fieldbook client: session management
//! and connectivity checks against a Fieldbook server, from a terminal.
//!
//! ## Quick Start
//!
//! ```bash
//! # Log in and keep the session across restarts
//! fieldbook login linnaea --remember
//!
//! # See what the client believes about the world
//! fieldbook status
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use clap::Parser;

mod commands;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Login(args) => commands::login::run(args).await,
        Command::Logout => commands::logout::run().await,
        Command::Register(args) => commands::register::run(args).await,
        Command::ResetPassword(args) => commands::reset_password::run(args).await,
        Command::Whoami(args) => commands::whoami::run(args).await,
        Command::Status(args) => commands::status::run(args).await,
        Command::Probe => commands::probe::run().await,
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,fieldbook=info,fieldbook_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
