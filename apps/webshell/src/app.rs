use crate::auth::{LocalStore, LoginWatcher, LoginWatcherConfig, TokenLookup, TokenSource};
use crate::cli::{AuthArgs, Cli, Command, ConnectArgs, SessionArgs, TokenCommand};
use crate::config::Config;
use crate::error::CliError;
use crate::lifecycle::{Controller, ControllerConfig, Notice, NoticeLevel, Wiring};
use crate::session::{Negotiator, SessionNegotiator};
use crate::telemetry::logging;
use crate::terminal::line_mode::LineSurface;
use crate::terminal::plain::PlainSurface;
use crate::terminal::tty::TtySurface;
use crate::terminal::{InitializationError, TerminalAdapter, TerminalSurface};
use crate::transport::websocket::{WebSocketChannelFactory, WebSocketConfig};
use std::io::{self, Write};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let log_config = cli.logging.to_config();
    logging::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(
        target: "webshell::app",
        log_level = ?log_config.level,
        log_file = ?log_config.file,
        build_profile = env!("WEBSHELL_BUILD_PROFILE"),
        "logging configured"
    );

    let config = match cli.origin.as_deref() {
        Some(raw) => Config::with_origin(raw)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Command::Connect(args) => connect(&config, &cli.auth, args).await,
        Command::Session(args) => session(&config, &cli.auth, args).await,
        Command::Token(command) => token(&cli.auth, command),
    }
}

fn token_source(auth: &AuthArgs) -> Arc<dyn TokenSource> {
    let store = match LocalStore::open_default() {
        Ok(store) => Some(store),
        Err(err) => {
            warn!(target: "webshell::auth", error = %err, "local store unavailable");
            None
        }
    };
    Arc::new(
        TokenLookup::new(auth.cookie_name.clone())
            .with_explicit(auth.token.clone())
            .with_cookie_header(auth.cookie.clone())
            .with_storage_keys(auth.storage_keys.clone())
            .with_store(store),
    )
}

fn negotiator(
    config: &Config,
    auth: &AuthArgs,
    tokens: Arc<dyn TokenSource>,
) -> Result<SessionNegotiator, CliError> {
    Ok(SessionNegotiator::new(
        config.origin().clone(),
        auth.cookie_name.clone(),
        auth.token_policy,
        tokens,
    )?)
}

async fn session(
    config: &Config,
    auth: &AuthArgs,
    args: SessionArgs,
) -> Result<(), CliError> {
    let negotiator = negotiator(config, auth, token_source(auth))?;
    let session = negotiator.create_session(args.server_id).await?;
    info!(target: "webshell::session", %session, "session created");
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", serde_json::to_string_pretty(&session)?)?;
    Ok(())
}

async fn connect(
    config: &Config,
    auth: &AuthArgs,
    args: ConnectArgs,
) -> Result<(), CliError> {
    let tokens = token_source(auth);
    let negotiator = negotiator(config, auth, tokens.clone())?;
    let channels = WebSocketChannelFactory::new(
        WebSocketConfig::new(config.origin().clone(), auth.cookie_name.clone()),
        tokens.clone(),
    );

    let (login, watcher) = if auth.assume_login {
        (LoginWatcher::assume_logged_in(), None)
    } else {
        let watcher = LoginWatcher::new(
            LoginWatcherConfig::new(config.origin().clone(), auth.cookie_name.clone()),
            tokens,
        )
        .map_err(|err| CliError::Http(err.to_string()))?;
        let (login, task) = watcher.spawn().await;
        (login, Some(task))
    };

    let title = match &args.name {
        Some(name) => format!("webshell {name}"),
        None => format!("webshell #{}", args.server_id),
    };
    let line_mode = args.line_mode;
    let terminal = TerminalAdapter::new(
        move || -> Result<Box<dyn TerminalSurface>, InitializationError> {
            if line_mode {
                Ok(Box::new(LineSurface::create()?))
            } else {
                Ok(Box::new(TtySurface::create(title.clone())?))
            }
        },
    )
    .with_fallback(|| -> Result<Box<dyn TerminalSurface>, InitializationError> {
        PlainSurface::create()
            .map(|surface| Box::new(surface) as Box<dyn TerminalSurface>)
            .map_err(|err| InitializationError::Failed(err.to_string()))
    });

    let (mut handle, notices) = Controller::spawn(
        ControllerConfig::new(args.server_id).with_label(args.name),
        Wiring {
            negotiator: Arc::new(negotiator),
            channels: Arc::new(channels),
            terminal,
            login,
        },
    );
    let printer = tokio::spawn(print_notices(notices));

    if !args.no_auto_connect {
        if let Err(err) = handle.connect().await {
            debug!(target: "webshell::lifecycle", error = %err, "initial connect failed");
        }
    }
    handle.closed().await;

    if let Some(task) = watcher {
        task.abort();
    }
    let _ = printer.await;
    Ok(())
}

fn token(auth: &AuthArgs, command: TokenCommand) -> Result<(), CliError> {
    let store = LocalStore::open_default()?;
    let mut stdout = io::stdout().lock();
    match command {
        TokenCommand::Set(args) => {
            store.set(&args.key, &args.value)?;
            writeln!(stdout, "saved '{}' in {}", args.key, store.path().display())?;
        }
        TokenCommand::Clear(args) => {
            if store.remove(&args.key)? {
                writeln!(stdout, "removed '{}'", args.key)?;
            } else {
                writeln!(stdout, "'{}' was not set", args.key)?;
            }
        }
        TokenCommand::Show => {
            let explicit = auth.token.as_deref().is_some_and(|t| !t.trim().is_empty());
            match token_source(auth).token() {
                Some(token) => writeln!(
                    stdout,
                    "token present ({}, {} chars)",
                    if explicit { "explicit" } else { "cookie or local store" },
                    token.chars().count()
                )?,
                None => writeln!(stdout, "no token found")?,
            }
        }
    }
    Ok(())
}

async fn print_notices(mut notices: mpsc::UnboundedReceiver<Notice>) {
    while let Some(notice) = notices.recv().await {
        let mut stderr = io::stderr().lock();
        let _ = stderr.write_all(render_notice(&notice).as_bytes());
        let _ = stderr.flush();
    }
}

/// Starts with `\r` and ends with `\r\n` so it stays aligned while the tty is
/// in raw mode.
fn render_notice(notice: &Notice) -> String {
    let (color, tag) = match notice.level {
        NoticeLevel::Info => ("36", "info"),
        NoticeLevel::Success => ("32", "ok"),
        NoticeLevel::Warn => ("33", "warn"),
        NoticeLevel::Error => ("31", "error"),
    };
    format!("\r\x1b[{color}m[{tag}]\x1b[0m {}\r\n", notice.message)
}
