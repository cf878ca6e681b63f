use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "chat-stream.logs.jsonl";

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

/// Logging settings resolved from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservabilitySettings {
    pub enabled: bool,
    /// Filter directive from `CHAT_STREAM_LOG_LEVEL`; `RUST_LOG` applies otherwise.
    pub level: Option<String>,
    /// JSONL log file; console output when unset.
    pub json_log_path: Option<PathBuf>,
}

impl ObservabilitySettings {
    /// Reads the settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = ["CHAT_STREAM_OBSERVABILITY_ENABLED", "CHAT_STREAM_OBSERVABILITY"]
            .into_iter()
            .find_map(|key| lookup(key))
            .map(|value| parse_bool_env(&value).unwrap_or(true))
            .unwrap_or(true);
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            enabled,
            level: non_empty("CHAT_STREAM_LOG_LEVEL"),
            json_log_path: non_empty("CHAT_STREAM_JSON_LOG_PATH").map(PathBuf::from),
        }
    }

    fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        if let Some(level) = &self.level
            && let Ok(filter) = tracing_subscriber::EnvFilter::try_new(level)
        {
            return filter;
        }
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    }
}

fn split_log_path(path: &Path) -> (&Path, &str) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE);
    (dir, file_name)
}

/// Initialize logging once per process.
///
/// Environment variables:
/// - `CHAT_STREAM_OBSERVABILITY_ENABLED` / `CHAT_STREAM_OBSERVABILITY`: optional enable/disable flag (default enabled).
/// - `CHAT_STREAM_LOG_LEVEL`: optional level/filter override (`info`, `chat_stream=debug`, etc.).
/// - `CHAT_STREAM_JSON_LOG_PATH`: optional log file path. If set, logs are JSONL in that file.
///   If unset, logs are emitted to stdout in a human-readable console format.
/// - `RUST_LOG`: optional filter override.
pub fn init_observability() {
    INIT.get_or_init(|| {
        let settings = ObservabilitySettings::from_env();
        if !settings.enabled {
            return;
        }

        let env_filter = settings.env_filter();
        if let Some(path) = &settings.json_log_path {
            let (dir, file_name) = split_log_path(path);
            let _ = std::fs::create_dir_all(dir);
            let writer = tracing_appender::rolling::never(dir, file_name);
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(false)
                .with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(json_layer)
                .try_init();
        } else {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stdout);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
        }
    });
}
