//! Login command implementation.

use anyhow::{bail, Result};

use super::LoginArgs;

/// Run the login command.
pub async fn run(args: LoginArgs) -> Result<()> {
    let services = super::connect_services().await;

    if !services.connectivity.online() {
        bail!("Cannot log in while offline. Check the server address in your config.");
    }

    let password = match args.password {
        Some(password) => password,
        None => super::prompt_line(&format!("Password for {}: ", args.username))?,
    };

    match services
        .sessions
        .login(&args.username, &password, args.remember)
        .await
    {
        Ok(user) => {
            println!("Logged in as {} ({})", user.username, user.role);
            if args.remember {
                println!("Session will be remembered on this device.");
            } else {
                println!("Session lasts until this device restarts.");
            }
            Ok(())
        }
        Err(e) => bail!("Login failed: {e}"),
    }
}
