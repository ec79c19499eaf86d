//! teller - a terminal client for the banking backend.
//!
//! A thin consumer of `teller-core`: every command either drives the
//! session lifecycle (login, logout, status) or runs one guarded data call
//! and prints the backend's JSON.

use std::io;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use teller_core::{
    ApiError, BankClient, Config, GuardDecision, SessionEvent, UserProfile,
};
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "\
Usage: teller <command> [args]

Commands:
  login <username>            Log in (password from TELLER_PASSWORD or prompt)
  logout                      End the current session
  status                      Show who is logged in and when the session expires
  me                          Show your user record
  users                       List users
  user <id>                   Show one user
  accounts <user-id>          List a user's accounts
  open-account <user-id> <json>
                              Open an account with the given JSON body
  overview                    Every user with their account count";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        println!("{}", USAGE);
        return Ok(());
    };
    if matches!(command, "-h" | "--help" | "help") {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load().context("Failed to load config")?;
    debug!(base_url = %config.base_url, namespace = %config.storage_namespace, "Config loaded");

    let client = BankClient::from_config(&config)?;
    let restored = client.session().restore();
    debug!(restored, "Session loaded");

    tokio::spawn(watch_session(client.session().subscribe()));

    match (command, &args[1..]) {
        ("login", [username]) => login(&client, username).await,
        ("logout", []) => {
            client.logout();
            println!("Logged out.");
            Ok(())
        }
        ("status", []) => status(&client),
        ("me", []) => guarded(&client, client.me()).await,
        ("users", []) => guarded(&client, client.list_users()).await,
        ("user", [id]) => guarded(&client, client.get_user(id)).await,
        ("accounts", [user_id]) => guarded(&client, client.list_accounts(user_id)).await,
        ("open-account", [user_id, body]) => {
            let body: Value = serde_json::from_str(body).context("Account body must be JSON")?;
            guarded(&client, client.create_account(user_id, &body)).await
        }
        ("overview", []) => overview(&client).await,
        _ => {
            eprintln!("{}", USAGE);
            bail!("Unknown command or wrong arguments: {}", args.join(" "))
        }
    }
}

/// Tell the user when their session ends underneath a running command
async fn watch_session(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::ExpiryNotice) => {
                eprintln!("Your session has expired. Please log in again.");
            }
            Ok(event) => debug!(?event, "Session event"),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn login(client: &BankClient, username: &str) -> Result<()> {
    let password = match std::env::var("TELLER_PASSWORD") {
        Ok(password) if !password.is_empty() => password,
        _ => rpassword::prompt_password("Password: ")?,
    };

    println!("Authenticating...");
    match client.login(username, &password).await {
        Ok(profile) => {
            let name = profile
                .as_ref()
                .map(|p| p.display_name.as_str())
                .unwrap_or(username);
            println!("Logged in as {}.", name);
            Ok(())
        }
        Err(ApiError::Http { status: 401, .. }) => bail!("Invalid username or password"),
        Err(e) => Err(report(e)),
    }
}

fn status(client: &BankClient) -> Result<()> {
    let Some(session) = client.session().current_session() else {
        println!("Not logged in.");
        return Ok(());
    };

    let who = session
        .profile
        .as_ref()
        .map(|p| format!("{} (id {})", p.display_name, p.id))
        .unwrap_or_else(|| "unknown user".to_string());
    println!("Logged in as {} using {} auth.", who, session.credential.scheme());
    println!(
        "Session expires in {} minutes.",
        session.minutes_until_expiry(Utc::now())
    );
    Ok(())
}

/// Run a data call behind the session guard and print its JSON
async fn guarded<F>(client: &BankClient, call: F) -> Result<()>
where
    F: std::future::Future<Output = Result<Value, ApiError>>,
{
    require_session(client)?;
    let value = call.await.map_err(report)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn overview(client: &BankClient) -> Result<()> {
    require_session(client)?;

    let users = client.list_users().await.map_err(report)?;
    let profiles: Vec<UserProfile> = users
        .as_array()
        .map(|list| list.iter().filter_map(UserProfile::from_json).collect())
        .unwrap_or_default();
    info!(count = profiles.len(), "Fetching accounts for users");

    let results = join_all(profiles.iter().map(|p| client.list_accounts(&p.id))).await;

    for (profile, result) in profiles.iter().zip(results) {
        match result {
            Ok(accounts) => {
                let count = accounts.as_array().map(Vec::len).unwrap_or(0);
                println!("{:<30} {:>3} account(s)", profile.display_name, count);
            }
            Err(e) if e.requires_login() => return Err(report(e)),
            Err(e) => println!("{:<30} {}", profile.display_name, e.user_message()),
        }
    }
    Ok(())
}

fn require_session(client: &BankClient) -> Result<()> {
    if client.session().guard() == GuardDecision::Redirect {
        bail!("Not logged in. Run `teller login <username>` first.");
    }
    Ok(())
}

fn report(e: ApiError) -> anyhow::Error {
    if let ApiError::Contract(ref inner) = e {
        error!(error = %inner, "Unexpected response");
    }
    anyhow::anyhow!(e.user_message())
}
