use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod reader;
pub mod template;

pub use reader::{Reader, ReaderError};
pub use template::render_text_template;

/// Environment prefix for config overrides: `HUMUS__OTEL__SERVICE_NAME=x`
/// maps to `otel.service_name`.
pub const ENV_PREFIX: &str = "HUMUS__";

/// Application configuration: the framework sections plus the user's own
/// typed section, flattened into the same YAML document.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig<T> {
    /// Telemetry providers (disabled unless configured).
    #[serde(default)]
    pub otel: OtelConfig,
    /// Logging configuration (optional, uses defaults if None).
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    #[serde(flatten)]
    pub app: T,
}

impl<T: DeserializeOwned> AppConfig<T> {
    /// Load configuration: template-render the file, then layer YAML and
    /// `HUMUS__` environment overrides.
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Yaml},
            Figment,
        };

        let rendered = render_text_template(raw)?;
        let figment = Figment::new()
            .merge(Yaml::string(&rendered))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment
            .extract()
            .with_context(|| "Failed to extract config from figment".to_string())
    }
}

/// Shorthand for [`AppConfig::load`].
pub fn load_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<AppConfig<T>> {
    AppConfig::load(path)
}

impl<T: Serialize> AppConfig<T> {
    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }
}

impl<T> AppConfig<T> {
    /// Apply overrides from command line arguments.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        let logging = self.logging.get_or_insert_with(default_logging_config);
        if let Some(default_section) = logging.get_mut("default") {
            default_section.console_level = match args.verbose {
                0 => default_section.console_level.clone(), // keep
                1 => "debug".to_string(),
                _ => "trace".to_string(),
            };
        }
    }
}

/// Logging configuration - maps target prefixes to their logging settings.
/// Key "default" is the catch-all for logs that don't match explicit targets.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Section {
    pub console_level: String, // "info", "debug", "error", "off"
    #[serde(default)]
    pub console_format: ConsoleFormat,
    #[serde(default)]
    pub file: String, // "logs/app.log"; only honored on the "default" section
    #[serde(default)]
    pub file_level: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleFormat {
    #[default]
    Text,
    Json,
}

/// Create a default logging configuration.
pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            console_format: ConsoleFormat::Text,
            file: String::new(),
            file_level: String::new(),
        },
    );
    logging
}

/// OpenTelemetry providers configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct OtelConfig {
    pub service_name: Option<String>,
    pub service_version: Option<String>,
    #[serde(default)]
    pub resource: BTreeMap<String, String>,
    #[serde(default)]
    pub traces: SignalConfig,
    #[serde(default)]
    pub metrics: SignalConfig,
    #[serde(default)]
    pub logs: LogsConfig,
}

impl OtelConfig {
    pub fn any_enabled(&self) -> bool {
        self.traces.enabled || self.metrics.enabled || self.logs.signal.enabled
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SignalConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub processor: ProcessorKind,
    /// Batch export interval (metrics: collection interval).
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,
    pub batch_size: Option<usize>,
    /// Trace sampling ratio in `[0, 1]`; parent-based always-on when unset.
    pub sampling_ratio: Option<f64>,
    #[serde(default)]
    pub exporter: ExporterConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LogsConfig {
    #[serde(flatten)]
    pub signal: SignalConfig,
    /// Minimum level per target prefix for records bridged to the log
    /// exporter, e.g. `{"humus_kafka": "warn", "my_app::db": "debug"}`.
    #[serde(default)]
    pub levels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    #[default]
    Batch,
    Simple,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ExporterConfig {
    #[serde(default)]
    pub kind: ExporterKind,
    /// OTLP endpoint, e.g. `http://127.0.0.1:4317`.
    pub target: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExporterKind {
    #[default]
    OtlpGrpc,
    OtlpHttp,
    Stdout,
}

/// Command line arguments shared by all application flavors.
#[derive(Debug, Clone, clap::Parser)]
#[command(version, about)]
pub struct CliArgs {
    /// Path to the YAML config file
    #[arg(short, long, env = "HUMUS_CONFIG", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Log verbosity level (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[cfg(test)]
mod tests;
