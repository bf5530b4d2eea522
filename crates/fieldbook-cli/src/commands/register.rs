//! Register command implementation.

use anyhow::{bail, Result};

use super::RegisterArgs;

/// Run the register command.
pub async fn run(args: RegisterArgs) -> Result<()> {
    let services = super::connect_services().await;

    if !services.connectivity.online() {
        bail!("Cannot register while offline.");
    }

    let password = match args.password {
        Some(password) => password,
        None => super::prompt_line(&format!("Password for {}: ", args.username))?,
    };

    match services
        .sessions
        .register(&args.username, &args.email, &password)
        .await
    {
        Ok(message) => {
            if message.is_empty() {
                println!("Registration accepted.");
            } else {
                println!("{message}");
            }
            Ok(())
        }
        Err(e) => bail!("Registration failed: {e}"),
    }
}
