//! Status command implementation.

use anyhow::Result;

use super::JsonArgs;

/// Run the status command.
pub async fn run(args: JsonArgs) -> Result<()> {
    let services = super::connect_services().await;
    services.sessions.bootstrap().await?;

    let online = services.connectivity.online();
    let authenticated = services.sessions.is_authenticated();
    let sync_online = services.sessions.is_sync_online();
    let session = services.sessions.session_info();

    if args.json {
        println!(
            "{}",
            serde_json::json!({
                "server": services.config.server.base_url,
                "online": online,
                "authenticated": authenticated,
                "sync_online": sync_online,
                "username": session.as_ref().map(|s| s.username.clone()),
                "remote_store": session.as_ref().map(|s| s.remote_store_id.clone()),
                "session_expires_at": session.as_ref().map(|s| s.expires_at.to_rfc3339()),
            })
        );
        return Ok(());
    }

    println!("Server:        {}", services.config.server.base_url);
    println!(
        "Connectivity:  {}",
        if online { "online" } else { "offline" }
    );
    match &session {
        Some(session) => {
            println!("User:          {} ({})", session.username, session.role);
            println!("Session until: {}", session.expires_at.to_rfc3339());
            println!("Remote store:  {}", session.remote_store_id);
        }
        None => println!("User:          not logged in"),
    }
    println!(
        "Mode:          {}",
        match (authenticated, sync_online) {
            (true, true) => "authenticated, syncing",
            (true, false) => "authenticated, working offline",
            (false, _) => "unauthenticated",
        }
    );
    Ok(())
}
