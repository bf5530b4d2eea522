//! Logout command implementation.

use anyhow::Result;

/// Run the logout command.
///
/// The local logout always completes; a failed server call is reported in
/// the logs only.
pub async fn run() -> Result<()> {
    let services = super::connect_services().await;
    services.sessions.bootstrap().await?;

    if !services.sessions.is_authenticated() {
        println!("Not logged in.");
        return Ok(());
    }

    services.sessions.logout().await;
    println!("Logged out.");
    Ok(())
}
