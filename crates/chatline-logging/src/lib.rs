//! JSONL logging with per-session context for Chatline clients
//!
//! # Features
//!
//! - **JSONL Output**: Structured JSON lines for log aggregation (default)
//! - **Session Context**: Tag spans with the signed-in user and a session id
//! - **File Rotation**: Daily/hourly log rotation via tracing-appender
//!
//! # Quick Start
//!
//! ```ignore
//! use chatline_logging::{ChatlineSubscriberBuilder, LogConfig};
//!
//! // JSONL to console
//! ChatlineSubscriberBuilder::new().init();
//!
//! // Pretty human-readable output while developing
//! ChatlineSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .init();
//! ```
//!
//! # Session Context
//!
//! ```ignore
//! use chatline_logging::SessionContextGuard;
//!
//! let _guard = SessionContextGuard::new("alice");
//! let span = SessionContextGuard::span();
//! let _entered = span.enter();
//! tracing::info!("channel opened"); // carries user_id and session_id
//! ```

pub mod config;
pub mod context;
pub mod layers;

pub use config::{ConsoleConfig, FileConfig, FilterConfig, JsonlConfig, LogConfig, RotationStrategy};
pub use context::{SessionContextData, SessionContextGuard};
pub use layers::{SessionContextExtension, SessionContextLayer, jsonl_file_layer};

use std::fs::{self, File};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Errors from setting up logging
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("failed to open log file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("global subscriber already set: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Builder for configuring and initializing the Chatline logging subscriber
///
/// Console output is JSONL unless `console.pretty` is set; file output is
/// always JSONL.
pub struct ChatlineSubscriberBuilder {
    config: LogConfig,
}

impl ChatlineSubscriberBuilder {
    /// Create a builder with the default configuration (JSONL to console)
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default log level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Enable or disable console output
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    /// Configure file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    /// Initialize the subscriber globally.
    ///
    /// Keep the returned guard alive for the duration of the program when
    /// file output is enabled. Setup failures are reported on stderr and
    /// leave logging disabled.
    pub fn init(self) -> Option<WorkerGuard> {
        match self.try_init() {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Warning: logging not initialized: {e}");
                None
            }
        }
    }

    /// Initialize the subscriber globally, failing if one is already set
    pub fn try_init(self) -> Result<Option<WorkerGuard>, LogError> {
        let (layers, guard) = self.build_layers()?;
        Registry::default().with(layers).try_init()?;
        Ok(guard)
    }

    fn build_layers(&self) -> Result<(Vec<BoxedLayer>, Option<WorkerGuard>), LogError> {
        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(self.config.filter_directives())?,
        };

        let jsonl = &self.config.jsonl;
        let mut layers: Vec<BoxedLayer> = vec![env_filter.boxed(), SessionContextLayer::new().boxed()];

        if self.config.console.enabled {
            let console = if self.config.console.pretty {
                tracing_subscriber::fmt::layer()
                    .with_ansi(self.config.console.ansi)
                    .with_target(true)
                    .boxed()
            } else {
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(jsonl.include_spans)
                    .flatten_event(jsonl.flatten_events)
                    .with_file(jsonl.include_location)
                    .with_line_number(jsonl.include_location)
                    .boxed()
            };
            layers.push(console);
        }

        let mut guard = None;
        if let Some(file_config) = &self.config.file {
            let (writer, file_guard) = file_writer(file_config)?;
            guard = Some(file_guard);
            layers.push(
                jsonl_file_layer(writer, jsonl.include_location, jsonl.include_thread_info).boxed(),
            );
        }

        Ok((layers, guard))
    }
}

impl Default for ChatlineSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-blocking writer for the configured file; `Never` truncates a single file
fn file_writer(config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LogError> {
    fs::create_dir_all(&config.directory)?;
    let rotation = match config.rotation {
        RotationStrategy::Never => {
            let path = config.directory.join(format!("{}.log", config.prefix));
            return Ok(tracing_appender::non_blocking(File::create(path)?));
        }
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
    };
    let appender = RollingFileAppender::new(rotation, &config.directory, &config.prefix);
    Ok(tracing_appender::non_blocking(appender))
}

/// Initialize logging with default settings (JSONL to console)
pub fn init_default() {
    ChatlineSubscriberBuilder::new().init();
}

/// Initialize logging for development (verbose, pretty console output)
pub fn init_development() {
    ChatlineSubscriberBuilder::new()
        .with_config(LogConfig::development())
        .init();
}

/// Initialize logging for tests; repeated calls are ignored
pub fn init_testing() {
    let _ = ChatlineSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .try_init();
}
