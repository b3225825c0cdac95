pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    /// Replaces the computed filter entirely when set.
    pub const FILTER_ENV: &str = "WEBSHELL_LOG_FILTER";

    /// Everything outside the client's own targets stays at this level.
    const FOREIGN_LEVEL: &str = "warn";

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl From<LogLevel> for LevelFilter {
        fn from(level: LogLevel) -> Self {
            match level {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    /// The client's tracing targets, selectable with `--log-component`.
    #[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
    pub enum Component {
        Auth,
        Session,
        Transport,
        Terminal,
        Lifecycle,
    }

    impl Component {
        pub fn target(self) -> &'static str {
            match self {
                Component::Auth => "webshell::auth",
                Component::Session => "webshell::session",
                Component::Transport => "webshell::transport",
                Component::Terminal => "webshell::terminal",
                Component::Lifecycle => "webshell::lifecycle",
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
        /// Restricts `level` to these components; empty means all of them.
        pub components: Vec<Component>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        OpenFile {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("invalid log filter {filter:?}: {reason}")]
        Filter { filter: String, reason: String },
        #[error("a global logger is already installed: {0}")]
        AlreadyInstalled(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber once; later calls are no-ops.
    ///
    /// Without `--log-file` events go to stderr in a compact, timestamp-free
    /// form because the raw-mode surface and the notice printer share it.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let directives = match std::env::var(FILTER_ENV) {
            Ok(raw) if !raw.trim().is_empty() => raw,
            _ => client_directives(config.level, &config.components),
        };
        let filter = EnvFilter::try_new(&directives).map_err(|err| InitError::Filter {
            filter: directives.clone(),
            reason: err.to_string(),
        })?;

        let guard = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::OpenFile {
                        path: path.clone(),
                        source,
                    })?;
                let (writer, guard) = tracing_appender::non_blocking(file);
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .with_writer(writer)
                    .try_init()
                    .map_err(|err| InitError::AlreadyInstalled(err.to_string()))?;
                guard
            }
            None => {
                let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
                tracing_subscriber::fmt()
                    .compact()
                    .without_time()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .try_init()
                    .map_err(|err| InitError::AlreadyInstalled(err.to_string()))?;
                guard
            }
        };
        let _ = GUARD.set(guard);
        tracing::debug!(target: "webshell::telemetry", %directives, "log filter installed");
        Ok(())
    }

    /// `warn` for dependencies, `level` for the client's own targets.
    pub fn client_directives(level: LogLevel, components: &[Component]) -> String {
        let level = LevelFilter::from(level).to_string().to_lowercase();
        let mut directives = FOREIGN_LEVEL.to_string();
        if components.is_empty() {
            directives.push_str(&format!(",webshell={level}"));
        } else {
            for component in components {
                directives.push_str(&format!(",{}={level}", component.target()));
            }
        }
        directives
    }

    /// Escaped, length-capped rendering of a frame for trace events.
    pub fn frame_preview(bytes: &[u8], limit: usize) -> String {
        let shown = &bytes[..bytes.len().min(limit)];
        let mut preview: String = String::from_utf8_lossy(shown)
            .chars()
            .flat_map(char::escape_debug)
            .collect();
        if bytes.len() > limit {
            preview.push_str(&format!("…(+{} bytes)", bytes.len() - limit));
        }
        preview
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn client_targets_follow_the_requested_level() {
            assert_eq!(client_directives(LogLevel::Debug, &[]), "warn,webshell=debug");
            assert_eq!(client_directives(LogLevel::Warn, &[]), "warn,webshell=warn");
        }

        #[test]
        fn components_narrow_the_verbose_targets() {
            let directives =
                client_directives(LogLevel::Trace, &[Component::Transport, Component::Lifecycle]);
            assert_eq!(
                directives,
                "warn,webshell::transport=trace,webshell::lifecycle=trace"
            );
            assert!(EnvFilter::try_new(&directives).is_ok());
        }

        #[test]
        fn previews_are_escaped_and_bounded() {
            assert_eq!(frame_preview(b"ls -la\r", 64), "ls -la\\r");
            assert_eq!(frame_preview(b"\x1b[0m", 64), "\\u{1b}[0m");
            assert_eq!(frame_preview(b"abcdefgh", 3), "abc…(+5 bytes)");
        }
    }
}
