//! fitfeed - command-line client for the fitfeed fitness-social API.
//!
//! Signs in, keeps the session fresh in the background, and shows what the
//! session manager is doing.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fitfeed_core::api::{ApiClient, AuthApi};
use fitfeed_core::auth::{
    FileSessionStore, KeyringSessionStore, SessionEvent, SessionManager, SessionStore,
};
use fitfeed_core::cache::CacheManager;
use fitfeed_core::config::{Config, SessionBackend};
use fitfeed_core::models::{LoginInput, SignupInput, User};

// ============================================================================
// Constants
// ============================================================================

/// Log file name inside the cache directory
const LOG_FILE: &str = "fitfeed.log";

/// Subdirectory of the cache directory holding cached API responses
const RESPONSE_CACHE_DIR: &str = "responses";

/// How long `watch` waits on exit for an in-flight refresh
const EXIT_REFRESH_WAIT_SECS: u64 = 35;

/// Lightweight authenticated query used by `watch --poll`
const PING_QUERY: &str = "query Ping { me { id } }";

#[derive(Parser)]
#[command(name = "fitfeed")]
#[command(about = "Sign in to fitfeed and keep the session alive", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// GraphQL endpoint (overrides config)
    #[arg(long, global = true, env = "FITFEED_GRAPHQL_URL")]
    endpoint: Option<String>,

    /// Also write logs to the cache directory
    #[arg(long, global = true)]
    log_file: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in with username and password
    Login {
        #[arg(short, long)]
        username: Option<String>,
    },
    /// Create an account and sign in
    Signup {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        email: String,
        #[arg(long)]
        display_name: Option<String>,
    },
    /// Sign out and forget the session
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Exchange the refresh token for a new pair now
    Refresh,
    /// Show token expiry and refresh schedule
    Status,
    /// Keep the session alive and print session events until Ctrl-C
    Watch {
        /// Seconds between authenticated pings; 0 disables
        #[arg(long, default_value_t = 0)]
        poll: u64,
    },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<PathBuf>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

/// Everything a command needs, wired from config.
struct App {
    config: Config,
    api: ApiClient,
    manager: SessionManager,
}

impl App {
    fn new(config: Config, endpoint: Option<String>) -> Result<Self> {
        let cache_dir = config.cache_dir()?;
        let endpoint = endpoint.unwrap_or_else(|| config.graphql_url());
        let api = ApiClient::new(endpoint.clone())
            .with_context(|| format!("Failed to create API client for {}", endpoint))?;

        let store: Arc<dyn SessionStore> = match config.session_backend {
            SessionBackend::File => Arc::new(FileSessionStore::new(cache_dir.clone())),
            SessionBackend::Keyring => Arc::new(KeyringSessionStore::new()),
        };
        let cache = CacheManager::new(cache_dir.join(RESPONSE_CACHE_DIR))?;

        let manager = SessionManager::builder(Arc::new(api.clone()), store)
            .settings(config.session_settings())
            .identity_cache(cache)
            .build();

        Ok(Self { config, api, manager })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = Config::load()?;

    let log_dir = if cli.log_file { Some(config.cache_dir()?) } else { None };
    let _log_guard = init_tracing(log_dir);
    info!("fitfeed starting");

    let mut app = App::new(config, cli.endpoint)?;
    app.manager.initialize().await;

    match cli.command {
        Command::Login { username } => login(&mut app, username).await,
        Command::Signup {
            username,
            email,
            display_name,
        } => signup(&mut app, username, email, display_name).await,
        Command::Logout => {
            app.manager.logout().await;
            println!("Signed out.");
            Ok(())
        }
        Command::Whoami => whoami(&app).await,
        Command::Refresh => {
            if !app.manager.has_tokens() {
                bail!("Not signed in. Run `fitfeed login` first.");
            }
            if app.manager.refresh_access_token().await {
                println!("Access token refreshed.");
                print_status(&app.manager);
                Ok(())
            } else {
                bail!("Session expired. Please log in again.")
            }
        }
        Command::Status => {
            print_status(&app.manager);
            Ok(())
        }
        Command::Watch { poll } => watch(&app, poll).await,
    }
}

fn prompt(label: &str, default: Option<&str>) -> Result<String> {
    match default {
        Some(default) => print!("{} [{}]: ", label, default),
        None => print!("{}: ", label),
    }
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let line = line.trim();
    match (line.is_empty(), default) {
        (true, Some(default)) => Ok(default.to_string()),
        (true, None) => bail!("{} is required", label),
        (false, _) => Ok(line.to_string()),
    }
}

async fn login(app: &mut App, username: Option<String>) -> Result<()> {
    let username = match username {
        Some(username) => username,
        None => prompt("Username", app.config.last_username.as_deref())?,
    };
    let password = rpassword::prompt_password("Password: ")?;

    let payload = app
        .api
        .login(&LoginInput {
            username,
            password,
        })
        .await
        .context("Login failed")?;

    app.manager
        .login(payload.tokens(), &payload.user_id, &payload.username)
        .await;
    remember_username(&mut app.config, &payload.username);
    print_welcome(app.manager.current_user(), &payload.username);
    Ok(())
}

async fn signup(
    app: &mut App,
    username: String,
    email: String,
    display_name: Option<String>,
) -> Result<()> {
    let password = rpassword::prompt_password("Password: ")?;
    let confirm = rpassword::prompt_password("Confirm password: ")?;
    if password != confirm {
        bail!("Passwords do not match");
    }

    let payload = app
        .api
        .signup(&SignupInput {
            username,
            email,
            password,
            display_name,
        })
        .await
        .context("Signup failed")?;

    app.manager
        .login(payload.tokens(), &payload.user_id, &payload.username)
        .await;
    remember_username(&mut app.config, &payload.username);
    print_welcome(app.manager.current_user(), &payload.username);
    Ok(())
}

fn remember_username(config: &mut Config, username: &str) {
    config.last_username = Some(username.to_string());
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
}

fn print_welcome(user: Option<User>, username: &str) {
    match user {
        Some(user) => println!("Signed in as {} ({})", user.display_label(), user.handle()),
        None => println!("Signed in as @{} (profile unavailable)", username),
    }
}

async fn whoami(app: &App) -> Result<()> {
    if app.manager.has_tokens() {
        if let Some(user) = app.manager.refresh_identity().await {
            print_user(&user);
            return Ok(());
        }
    }

    match app.manager.cached_identity() {
        Some(cached) if app.manager.has_tokens() => {
            if cached.is_stale() {
                println!("(offline, cached {}, may be out of date)", cached.age_display());
            } else {
                println!("(offline, cached {})", cached.age_display());
            }
            print_user(&cached.data);
            Ok(())
        }
        _ => bail!("Not signed in. Run `fitfeed login` first."),
    }
}

fn print_user(user: &User) {
    println!("{} ({})", user.display_label(), user.handle());
    println!("  id:     {}", user.id);
    println!("  email:  {}", user.email);
    if let Some(status) = user.status {
        println!("  status: {:?}", status);
    }
}

fn print_status(manager: &SessionManager) {
    let Some(data) = manager.session_data() else {
        println!("Not signed in.");
        return;
    };

    let expires = chrono::DateTime::from_timestamp_millis(data.expires_at)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| data.expires_at.to_string());

    if let Some(ref username) = data.username {
        println!("User:          @{}", username);
    }
    println!(
        "Token expires: {} (in {} min)",
        expires,
        manager.minutes_until_expiry().unwrap_or(0)
    );
    match manager.next_refresh_in() {
        Some(wait) => println!("Next refresh:  in {} min {} s", wait.as_secs() / 60, wait.as_secs() % 60),
        None => println!("Next refresh:  not scheduled"),
    }
}

async fn watch(app: &App, poll_secs: u64) -> Result<()> {
    if !app.manager.has_tokens() {
        bail!("Not signed in. Run `fitfeed login` first.");
    }

    let mut events = app.manager.subscribe();
    // Requests made through this client report rejections to the session
    let app_api = app.api.with_auth_signal(app.manager.auth_signal());

    app.manager.refresh_identity().await;
    print_status(&app.manager);
    println!("Watching session, Ctrl-C to stop.");

    let mut ticker = tokio::time::interval(Duration::from_secs(poll_secs.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event);
                    if let SessionEvent::Navigate(route) = event {
                        if route.path() == "/login" {
                            break;
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "Session event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = ticker.tick(), if poll_secs > 0 => {
                let token = app.manager.access_token();
                if let Err(e) = app_api
                    .execute::<serde_json::Value>(PING_QUERY, json!({}), token.as_deref())
                    .await
                {
                    warn!(error = %e, "Ping failed");
                }
            }
        }
    }

    // Let a timer-driven refresh store its rotated tokens before the runtime goes
    let settle = async {
        while app.manager.is_refreshing() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(EXIT_REFRESH_WAIT_SECS), settle).await.is_err() {
        warn!("Token refresh still running at exit");
    }

    Ok(())
}

fn print_event(event: &SessionEvent) {
    let now = chrono::Local::now().format("%H:%M:%S");
    match event {
        SessionEvent::Navigate(route) => println!("[{}] navigate {}", now, route.path()),
        SessionEvent::Notice(notice) => println!("[{}] {}: {}", now, notice.title, notice.description),
        SessionEvent::UserChanged(Some(user)) => println!("[{}] signed in as {}", now, user.handle()),
        SessionEvent::UserChanged(None) => println!("[{}] signed out", now),
    }
}
