//! Tracing subscriber initialization.
//!
//! | Variable     | Default | Meaning                                  |
//! |--------------|---------|------------------------------------------|
//! | `RUST_LOG`   | `info`  | `EnvFilter` directives                   |
//! | `LOG_FORMAT` | `json`  | `json`, or `pretty` for local terminals  |

use tracing_subscriber::EnvFilter;

/// Output format of the fmt layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    /// Parse a `LOG_FORMAT` value. Unknown values fall back to JSON.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "pretty" || v == "text" => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }

    pub fn from_env() -> Self {
        Self::parse(std::env::var("LOG_FORMAT").ok().as_deref())
    }
}

/// Initialize tracing/logging for the process.
pub fn init() {
    init_with(LogFormat::from_env());
}

/// Initialize with an explicit format. Returns `false` when a global
/// subscriber was already installed.
pub fn init_with(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .with_current_span(true)
            .try_init()
            .is_ok(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .pretty()
            .with_target(true)
            .try_init()
            .is_ok(),
    }
}
