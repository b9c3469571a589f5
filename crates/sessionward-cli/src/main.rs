//! sessionward - command-line front end for the session layer.
//!
//! Logs in against the configured backend, keeps the credential across runs
//! and issues authenticated requests through the interceptor pipeline.

use std::io;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use sessionward_core::{ChannelNavigator, Config, NavigationEvent, Session};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "\
Usage: sessionward <command>

Commands:
  login <user>   Log in (password from SESSIONWARD_PASSWORD or prompt)
  logout         Log out on the server and locally
  status         Show the current authentication status
  passwd         Change the password (new one from SESSIONWARD_NEW_PASSWORD or prompt)
  renew          Exchange the current token for a fresh one
  get <path>     Issue an authenticated GET and print the payload
  watch          Wait until the session ends, then print the redirect";

/// Initialize the tracing subscriber for logging.
///
/// RUST_LOG controls the level (default `warn`). When SESSIONWARD_LOG_DIR is
/// set, a daily-rotated log file is written there as well.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var("SESSIONWARD_LOG_DIR") {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "sessionward.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        return Ok(());
    };
    if matches!(command.as_str(), "help" | "--help" | "-h") {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load()?;
    let (navigator, mut events) = ChannelNavigator::new(config.entry_path.clone());
    let session = Session::init(config, Arc::new(navigator))?;
    info!(command = %command, "sessionward starting");

    let result = match command.as_str() {
        "login" => {
            let user = args.get(1).context("login requires a user id")?;
            login(&session, user).await
        }
        "logout" => {
            match session.logout().await {
                Ok(_) => println!("Logged out"),
                Err(e) => println!("Logged out locally (server said: {})", e),
            }
            Ok(())
        }
        "status" => {
            print_status(&session).await;
            Ok(())
        }
        "passwd" => {
            if !session.store().has_credential() {
                bail!("Not logged in");
            }
            let password = match std::env::var("SESSIONWARD_NEW_PASSWORD") {
                Ok(password) if !password.is_empty() => password,
                _ => rpassword::prompt_password("New password: ").context("Failed to read password")?,
            };
            let envelope = session.change_password(&password).await?;
            println!("{}", envelope.message);
            Ok(())
        }
        "renew" => {
            let envelope = session.renew_token().await?;
            println!("{}", envelope.message);
            print_status(&session).await;
            Ok(())
        }
        "get" => {
            let path = args.get(1).context("get requires a path")?;
            let payload: serde_json::Value = session.client().get(path).await?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        "watch" => {
            if !session.store().has_credential() {
                bail!("Not logged in");
            }
            print_status(&session).await;
            if let Some(NavigationEvent::Unauthenticated { path }) = events.recv().await {
                println!("Session ended, redirecting to {}", path);
            }
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            Ok(())
        }
    };

    // A redirect raised while handling the command (401, expiry) is worth
    // surfacing even outside `watch`
    while let Ok(NavigationEvent::Unauthenticated { path }) = events.try_recv() {
        if command != "logout" {
            eprintln!("Session ended, please log in again ({})", path);
        }
    }

    session.dispose();
    result
}

async fn login(session: &Session, user: &str) -> Result<()> {
    let password = match std::env::var("SESSIONWARD_PASSWORD") {
        Ok(password) if !password.is_empty() => password,
        _ => rpassword::prompt_password("Password: ").context("Failed to read password")?,
    };

    let envelope = session.login(user, &password).await?;
    if session.store().has_credential() {
        print_status(session).await;
    } else {
        println!("{} {}", envelope.code, envelope.message);
    }
    Ok(())
}

async fn print_status(session: &Session) {
    let status = session.status().await;
    match session.store().read() {
        Some(credential) if status.is_authenticated() => {
            println!("{} as {}", status.label(), credential.subject_id)
        }
        _ => println!("{}", status.label()),
    }
}
