pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
    use tracing_subscriber::EnvFilter;

    /// Targets owned by this workspace. Everything else is a dependency.
    const MESH_TARGETS: &[&str] = &["mesh", "mesh_peer", "mesh_peer_core", "mesh_protocol"];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
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

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
        /// Raw `EnvFilter` directives that replace the computed ones.
        pub filter: Option<String>,
        /// Let webrtc and websocket internals log below `info`.
        pub dependency_traces: bool,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("invalid log filter {filter:?}: {reason}")]
        Filter { filter: String, reason: String },
        #[error("failed to install subscriber: {0}")]
        Install(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Install the global subscriber. Only the first successful call has an
    /// effect.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }
        let filter = build_filter(config)?;
        let (writer, guard) = open_writer(config)?;

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level == LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Install(err.to_string()))?;
        let _ = GUARD.set(guard);

        tracing::debug!(
            target = "mesh",
            level = ?config.level,
            file = ?config.file,
            "logging initialised"
        );
        Ok(())
    }

    fn open_writer(config: &LogConfig) -> Result<(NonBlocking, WorkerGuard), InitError> {
        let Some(path) = &config.file else {
            return Ok(tracing_appender::non_blocking(std::io::stderr()));
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| InitError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(tracing_appender::non_blocking(file))
    }

    fn build_filter(config: &LogConfig) -> Result<EnvFilter, InitError> {
        let directives = match &config.filter {
            Some(raw) => raw.clone(),
            None => default_directives(config).join(","),
        };
        EnvFilter::builder()
            .parse(&directives)
            .map_err(|err| InitError::Filter {
                filter: directives.clone(),
                reason: err.to_string(),
            })
    }

    /// Dependencies are capped at `info` unless their traces were asked for.
    fn default_directives(config: &LogConfig) -> Vec<String> {
        let level = LevelFilter::from(config.level);
        let dependencies = if config.dependency_traces {
            level
        } else {
            level.min(LevelFilter::INFO)
        };
        let mut directives = vec![dependencies.to_string().to_lowercase()];
        if level > dependencies {
            let ours = level.to_string().to_lowercase();
            directives.extend(MESH_TARGETS.iter().map(|target| format!("{target}={ours}")));
        }
        directives
    }

}
