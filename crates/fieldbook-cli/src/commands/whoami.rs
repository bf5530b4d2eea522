//! Whoami command implementation.

use anyhow::Result;

use super::JsonArgs;

/// Run the whoami command.
///
/// Prefers the server's answer when online; falls back to the stored
/// session record, which is the whole point of working offline.
pub async fn run(args: JsonArgs) -> Result<()> {
    let services = super::connect_services().await;
    services.sessions.bootstrap().await?;

    if !services.sessions.is_authenticated() {
        if args.json {
            println!("{}", serde_json::json!({ "authenticated": false }));
        } else {
            println!("Not logged in.");
        }
        return Ok(());
    }

    let user = match services.sessions.current_user().await {
        Some(user) => Some(user),
        None => services.sessions.session_info().map(|s| s.user()),
    };

    match user {
        Some(user) => {
            if args.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "authenticated": true,
                        "username": user.username,
                        "email": user.email,
                        "role": user.role,
                    })
                );
            } else {
                println!("{} <{}> ({})", user.username, user.email, user.role);
            }
        }
        None => println!("Logged in, but no user details are available."),
    }
    Ok(())
}
