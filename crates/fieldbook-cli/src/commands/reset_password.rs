//! Reset-password command implementation.

use anyhow::{bail, Result};

use super::ResetPasswordArgs;

/// Run the reset-password command.
pub async fn run(args: ResetPasswordArgs) -> Result<()> {
    let services = super::connect_services().await;

    match services.sessions.request_password_reset(&args.email).await {
        Ok(()) => {
            println!("Password reset requested. Check your inbox.");
            Ok(())
        }
        Err(e) => bail!("Could not request a password reset: {e}"),
    }
}
