use crate::config::{ConsoleFormat, LoggingConfig, Section};
use crate::telemetry::Telemetry;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

// Keep guards for non-blocking writers to avoid losing buffered lines.
static CONSOLE_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();
static FILE_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

// ================= level helpers =================

/// Parses a level name; `off`/`none` disable output, unknown names map to `info`.
pub(crate) fn parse_level_filter(s: &str) -> LevelFilter {
    match s.trim().to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" | "none" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Returns true if target == prefix or target starts with "prefix::"
pub(crate) fn matches_crate_prefix(target: &str, prefix: &str) -> bool {
    target == prefix
        || (target.starts_with(prefix) && target[prefix.len()..].starts_with("::"))
}

// ================= targets =================

enum Sink {
    Console,
    File,
}

fn build_targets(cfg: &LoggingConfig, sink: Sink) -> Targets {
    let level_of = |s: &Section| match sink {
        Sink::Console => parse_level_filter(&s.console_level),
        Sink::File if s.file_level.trim().is_empty() => parse_level_filter(&s.console_level),
        Sink::File => parse_level_filter(&s.file_level),
    };

    let default_level = cfg.get("default").map(level_of).unwrap_or(LevelFilter::INFO);
    let mut targets = Targets::new().with_default(default_level);

    for (prefix, section) in cfg.iter().filter(|(k, _)| k.as_str() != "default") {
        targets = targets.with_target(prefix.clone(), level_of(section));
    }
    targets
}

// ================= file sink =================

fn resolve_log_path(file: &str, base_dir: &Path) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

/// Daily-rolled JSON file for the "default" section's `file`, if any.
fn file_writer(cfg: &LoggingConfig, base_dir: &Path) -> Option<tracing_appender::non_blocking::NonBlocking> {
    let section = cfg.get("default")?;
    if section.file.trim().is_empty() {
        return None;
    }

    let path = resolve_log_path(&section.file, base_dir);
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| base_dir.to_path_buf());
    let name = path.file_name()?.to_string_lossy().to_string();

    if let Err(e) = std::fs::create_dir_all(&dir) {
        eprintln!("Failed to create log directory '{}': {e}", dir.display());
        return None;
    }

    let appender = tracing_appender::rolling::daily(dir, name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_GUARD.set(guard);
    Some(writer)
}

// ================= public init =================

/// Installs the global subscriber:
/// 1) telemetry layers (span export, log bridge), bound to `Registry`;
/// 2) `RUST_LOG` as an upper bound when set;
/// 3) console fmt layer (text or JSON) filtered per target;
/// 4) optional JSON file layer.
///
/// Safe to call repeatedly; only the first call installs anything.
pub fn init_logging(cfg: &LoggingConfig, base_dir: &Path, telemetry: &Telemetry) {
    // Bridge `log` → `tracing` *before* installing the subscriber
    if let Err(e) = tracing_log::LogTracer::init() {
        tracing::debug!("LogTracer init skipped: {e}");
    }

    let console_targets = build_targets(cfg, Sink::Console);
    let file_targets = build_targets(cfg, Sink::File);
    let format = cfg
        .get("default")
        .map(|s| s.console_format)
        .unwrap_or_default();

    let env: Option<EnvFilter> = EnvFilter::try_from_default_env().ok();

    let (nb_stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(guard);

    let console_layer = match format {
        ConsoleFormat::Text => fmt::layer()
            .with_writer(nb_stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .with_target(true)
            .with_level(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_filter(console_targets)
            .boxed(),
        ConsoleFormat::Json => fmt::layer()
            .json()
            .with_writer(nb_stderr)
            .with_ansi(false)
            .with_target(true)
            .with_level(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_filter(console_targets)
            .boxed(),
    };

    let file_layer = file_writer(cfg, base_dir).map(|writer| {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_level(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(writer)
            .with_filter(file_targets)
    });

    let _ = Registry::default()
        .with(telemetry.layers())
        .with(env)
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_logging_config;

    fn section(level: &str, file_level: &str) -> Section {
        Section {
            console_level: level.to_string(),
            console_format: ConsoleFormat::Text,
            file: String::new(),
            file_level: file_level.to_string(),
        }
    }

    #[test]
    fn level_names() {
        assert_eq!(parse_level_filter("WARN"), LevelFilter::WARN);
        assert_eq!(parse_level_filter("none"), LevelFilter::OFF);
        assert_eq!(parse_level_filter("loud"), LevelFilter::INFO);
    }

    #[test]
    fn crate_prefix_matching() {
        assert!(matches_crate_prefix("humus", "humus"));
        assert!(matches_crate_prefix("humus::app", "humus"));
        assert!(!matches_crate_prefix("humus_rest::api", "humus"));
    }

    #[test]
    fn targets_follow_sections() {
        let mut cfg = default_logging_config();
        cfg.insert("humus_kafka".into(), section("debug", "warn"));

        let console = build_targets(&cfg, Sink::Console);
        assert!(console.would_enable("humus_kafka::worker", &tracing::Level::DEBUG));
        assert!(!console.would_enable("other", &tracing::Level::DEBUG));

        let file = build_targets(&cfg, Sink::File);
        assert!(!file.would_enable("humus_kafka::worker", &tracing::Level::INFO));
        assert!(file.would_enable("humus_kafka::worker", &tracing::Level::WARN));
    }

    #[test]
    fn init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = default_logging_config();
        if let Some(s) = cfg.get_mut("default") {
            s.file = "logs/app.log".into();
        }
        init_logging(&cfg, dir.path(), &Telemetry::disabled());
        init_logging(&cfg, dir.path(), &Telemetry::disabled());
        assert!(dir.path().join("logs").is_dir());
    }
}
