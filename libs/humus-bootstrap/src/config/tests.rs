use super::*;
use std::fs;
use tempfile::tempdir;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
struct DemoSection {
    http_addr: String,
    #[serde(default)]
    workers: u32,
}

#[test]
fn test_default_logging_config() {
    let logging = default_logging_config();
    let default = logging.get("default").expect("default section");
    assert_eq!(default.console_level, "info");
    assert_eq!(default.console_format, ConsoleFormat::Text);
    assert!(default.file.is_empty());
}

#[test]
fn test_load_yaml_with_app_section() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("config.yaml");

    let yaml_content = r#"
http_addr: "0.0.0.0:8080"
workers: 4

otel:
  service_name: demo
  service_version: "1.2.3"
  traces:
    enabled: true
    processor: simple
    sampling_ratio: 0.5
    exporter:
      kind: otlp_http
      target: "http://collector:4318"
      timeout: 3s
  logs:
    enabled: true
    interval: 2s
    levels:
      humus_kafka: warn

logging:
  default:
    console_level: debug
    console_format: json
"#;
    fs::write(&config_path, yaml_content).expect("Failed to write config file");

    let config = AppConfig::<DemoSection>::load(&config_path).expect("Failed to load config");

    assert_eq!(
        config.app,
        DemoSection {
            http_addr: "0.0.0.0:8080".into(),
            workers: 4
        }
    );
    assert_eq!(config.otel.service_name.as_deref(), Some("demo"));
    assert!(config.otel.traces.enabled);
    assert_eq!(config.otel.traces.processor, ProcessorKind::Simple);
    assert_eq!(config.otel.traces.sampling_ratio, Some(0.5));
    assert_eq!(config.otel.traces.exporter.kind, ExporterKind::OtlpHttp);
    assert_eq!(
        config.otel.traces.exporter.timeout,
        Some(Duration::from_secs(3))
    );
    assert!(!config.otel.metrics.enabled);
    assert!(config.otel.logs.signal.enabled);
    assert_eq!(config.otel.logs.signal.interval, Some(Duration::from_secs(2)));
    assert_eq!(config.otel.logs.levels.get("humus_kafka").unwrap(), "warn");

    let logging = config.logging.expect("logging section");
    assert_eq!(logging["default"].console_format, ConsoleFormat::Json);
}

#[test]
fn test_template_is_rendered_before_parsing() {
    std::env::set_var("HUMUS_CFG_TEST_HTTP_ADDR", "127.0.0.1:7000");
    let yaml = r#"
http_addr: {{ default("0.0.0.0:80", env("HUMUS_CFG_TEST_HTTP_ADDR")) }}
otel:
  service_name: {{ default("fallback-svc", env("HUMUS_CFG_TEST_UNSET_NAME")) }}
"#;

    let config = AppConfig::<DemoSection>::from_yaml_str(yaml).expect("config");
    assert_eq!(config.app.http_addr, "127.0.0.1:7000");
    assert_eq!(config.app.workers, 0);
    assert_eq!(config.otel.service_name.as_deref(), Some("fallback-svc"));
}

#[test]
fn test_missing_file_reports_path() {
    let err = AppConfig::<DemoSection>::load("/definitely/not/here.yaml").unwrap_err();
    assert!(err.to_string().contains("/definitely/not/here.yaml"));
}

#[test]
fn test_missing_app_field_fails() {
    let err = AppConfig::<DemoSection>::from_yaml_str("workers: 2\n");
    assert!(err.is_err());
}

#[test]
fn test_cli_verbose_overrides_console_level() {
    let mut config = AppConfig::<DemoSection>::from_yaml_str("http_addr: x\n").unwrap();
    assert!(config.logging.is_none());

    let args = CliArgs {
        config: PathBuf::from("config.yaml"),
        verbose: 2,
    };
    config.apply_cli_overrides(&args);
    assert_eq!(config.logging.unwrap()["default"].console_level, "trace");
}

#[test]
fn test_yaml_serialization() {
    let config = AppConfig::<DemoSection>::from_yaml_str("http_addr: x\n").unwrap();
    let yaml = config.to_yaml().expect("Failed to serialize to YAML");
    assert!(yaml.contains("http_addr:"));
    assert!(yaml.contains("otel:"));
}
