use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::auth::DEFAULT_COOKIE_NAME;
use crate::session::TokenPolicy;
use crate::telemetry::logging::{Component, LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "webshell",
    about = "Open a remote shell on a monitored host through the dashboard",
    author,
    version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("WEBSHELL_BUILD_TIMESTAMP"))
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "URL",
        help = "Dashboard origin (defaults to $WEBSHELL_ORIGIN, then 127.0.0.1:8008)"
    )]
    pub origin: Option<String>,

    #[command(flatten)]
    pub auth: AuthArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct AuthArgs {
    #[arg(
        long,
        global = true,
        env = "WEBSHELL_TOKEN",
        hide_env_values = true,
        value_name = "TOKEN",
        help = "Auth token; skips the cookie and local store lookup"
    )]
    pub token: Option<String>,

    #[arg(
        long,
        global = true,
        env = "WEBSHELL_COOKIE",
        hide_env_values = true,
        value_name = "HEADER",
        help = "Cookie header string to take the auth cookie from"
    )]
    pub cookie: Option<String>,

    #[arg(
        long = "cookie-name",
        global = true,
        default_value = DEFAULT_COOKIE_NAME,
        value_name = "NAME",
        help = "Name of the auth cookie"
    )]
    pub cookie_name: String,

    #[arg(
        long = "storage-key",
        global = true,
        value_name = "KEY",
        help = "Local store key holding the token; repeat for a fallback (at most two are used)"
    )]
    pub storage_keys: Vec<String>,

    #[arg(
        long = "token-policy",
        global = true,
        value_enum,
        default_value_t = TokenPolicy::Required,
        help = "Whether a missing token aborts session creation"
    )]
    pub token_policy: TokenPolicy,

    #[arg(
        long = "assume-login",
        global = true,
        action = clap::ArgAction::SetTrue,
        help = "Treat the user as logged in instead of polling the profile endpoint"
    )]
    pub assume_login: bool,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "WEBSHELL_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "WEBSHELL_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,

    #[arg(
        long = "log-component",
        global = true,
        value_enum,
        value_delimiter = ',',
        help = "Apply --log-level only to these components (auth, session, transport, terminal, lifecycle)"
    )]
    pub components: Vec<Component>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
            components: self.components.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Attach this terminal to a host's shell
    Connect(ConnectArgs),
    /// Create a terminal session and print it as JSON without connecting
    Session(SessionArgs),
    /// Manage the token kept in the local store
    #[command(subcommand)]
    Token(TokenCommand),
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    #[arg(value_name = "SERVER_ID", help = "Numeric id of the monitored host")]
    pub server_id: u64,

    #[arg(long, value_name = "NAME", help = "Host name shown until the session reports one")]
    pub name: Option<String>,

    #[arg(
        long = "line-mode",
        action = clap::ArgAction::SetTrue,
        help = "Edit lines locally and send them on Enter"
    )]
    pub line_mode: bool,

    #[arg(
        long = "no-auto-connect",
        action = clap::ArgAction::SetTrue,
        help = "Wait for Ctrl+] c instead of connecting on start"
    )]
    pub no_auto_connect: bool,
}

#[derive(Args, Debug)]
pub struct SessionArgs {
    #[arg(value_name = "SERVER_ID", help = "Numeric id of the monitored host")]
    pub server_id: u64,
}

#[derive(Subcommand, Debug)]
pub enum TokenCommand {
    /// Save a token under a local store key
    Set(TokenSetArgs),
    /// Remove a token from the local store
    Clear(TokenKeyArgs),
    /// Report which token source would be used
    Show,
}

#[derive(Args, Debug)]
pub struct TokenSetArgs {
    #[arg(value_name = "TOKEN")]
    pub value: String,

    #[arg(long, default_value = "token", value_name = "KEY")]
    pub key: String,
}

#[derive(Args, Debug)]
pub struct TokenKeyArgs {
    #[arg(long, default_value = "token", value_name = "KEY")]
    pub key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_parses_globals_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "webshell",
            "connect",
            "42",
            "--line-mode",
            "--origin",
            "status.example.com",
            "--storage-key",
            "jwt",
            "--storage-key",
            "token",
            "--assume-login",
        ])
        .unwrap();
        assert_eq!(cli.origin.as_deref(), Some("status.example.com"));
        assert_eq!(cli.auth.storage_keys, vec!["jwt", "token"]);
        assert!(cli.auth.assume_login);
        assert_eq!(cli.auth.cookie_name, "nz-jwt");
        match cli.command {
            Command::Connect(args) => {
                assert_eq!(args.server_id, 42);
                assert!(args.line_mode);
                assert!(!args.no_auto_connect);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn token_policy_and_token_subcommands() {
        let cli = Cli::try_parse_from([
            "webshell",
            "--token-policy",
            "optional",
            "token",
            "set",
            "abc",
            "--key",
            "auth_token",
        ])
        .unwrap();
        assert_eq!(cli.auth.token_policy, TokenPolicy::Optional);
        match cli.command {
            Command::Token(TokenCommand::Set(args)) => {
                assert_eq!(args.value, "abc");
                assert_eq!(args.key, "auth_token");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn log_components_split_on_commas() {
        let cli = Cli::try_parse_from([
            "webshell",
            "session",
            "3",
            "--log-level",
            "trace",
            "--log-component",
            "transport,lifecycle",
        ])
        .unwrap();
        let config = cli.logging.to_config();
        assert_eq!(config.level, LogLevel::Trace);
        assert_eq!(
            config.components,
            vec![Component::Transport, Component::Lifecycle]
        );
    }

    #[test]
    fn server_id_must_be_numeric() {
        assert!(Cli::try_parse_from(["webshell", "session", "web-1"]).is_err());
    }
}
