use anyhow::{Context, Result};
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{Protocol, WithExportConfig, WithHttpConfig, WithTonicConfig};
use opentelemetry_sdk::{
    logs::{self, BatchLogProcessor, LogExporter, SdkLoggerProvider},
    metrics::{exporter::PushMetricExporter, PeriodicReader, SdkMeterProvider},
    propagation::TraceContextPropagator,
    trace::{self, BatchSpanProcessor, Sampler, SdkTracerProvider, SpanExporter},
    Resource,
};
use std::collections::{BTreeMap, HashMap};
use tonic::metadata::{MetadataKey, MetadataMap, MetadataValue};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{Layer, Registry};

use super::{ChannelCache, LevelTable};
use crate::config::{ExporterConfig, ExporterKind, OtelConfig, ProcessorKind, SignalConfig};

const DEFAULT_SERVICE_NAME: &str = "humus";
const DEFAULT_GRPC_TARGET: &str = "http://127.0.0.1:4317";

/// Targets of the export pipeline itself. Bridging their records to the
/// log exporter would feed exports back into the exporter.
const EXPORT_PIPELINE_TARGETS: &[&str] = &[
    "opentelemetry",
    "opentelemetry_sdk",
    "opentelemetry_otlp",
    "tonic",
    "h2",
    "hyper",
    "hyper_util",
    "tower",
    "reqwest",
];

pub type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Handles to the providers created by [`init_telemetry`].
///
/// Dropping the handle does not flush; call [`Telemetry::shutdown`] (the
/// application flavors register it as a post-run hook).
#[derive(Default)]
pub struct Telemetry {
    service_name: String,
    tracer: Option<SdkTracerProvider>,
    meter: Option<SdkMeterProvider>,
    logger: Option<SdkLoggerProvider>,
    log_levels: LevelTable,
}

impl Telemetry {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.tracer.is_some() || self.meter.is_some() || self.logger.is_some()
    }

    pub fn meter_provider(&self) -> Option<&SdkMeterProvider> {
        self.meter.as_ref()
    }

    /// Layers to attach to the root `Registry`: span export and the
    /// level-filtered log bridge, each present only when enabled.
    pub fn layers(&self) -> Vec<BoxedLayer> {
        let mut layers: Vec<BoxedLayer> = Vec::new();

        if let Some(provider) = &self.tracer {
            let tracer = provider.tracer(self.service_name.clone());
            layers.push(tracing_opentelemetry::layer().with_tracer(tracer).boxed());
        }

        if let Some(provider) = &self.logger {
            layers.push(
                OpenTelemetryTracingBridge::new(provider)
                    .with_filter(self.log_levels.clone().into_filter())
                    .boxed(),
            );
        }

        layers
    }

    /// Flushes and shuts down every provider. All providers are attempted;
    /// failures are reported together.
    pub fn shutdown(&self) -> Result<()> {
        let mut failures = Vec::new();

        if let Some(p) = &self.tracer {
            if let Err(e) = p.shutdown() {
                failures.push(format!("traces: {e}"));
            }
        }
        if let Some(p) = &self.meter {
            if let Err(e) = p.shutdown() {
                failures.push(format!("metrics: {e}"));
            }
        }
        if let Some(p) = &self.logger {
            if let Err(e) = p.shutdown() {
                failures.push(format!("logs: {e}"));
            }
        }

        if failures.is_empty() {
            tracing::info!("Telemetry providers shut down");
            Ok(())
        } else {
            anyhow::bail!("telemetry shutdown failed: {}", failures.join("; "))
        }
    }
}

/// Initialize the configured providers and register them globally.
///
/// OTLP/gRPC exporters pointed at the same target share one channel from
/// `channels`. Must be called within a Tokio runtime when any gRPC exporter
/// is enabled.
pub fn init_telemetry(cfg: &OtelConfig, channels: &ChannelCache) -> Result<Telemetry> {
    let service_name = cfg
        .service_name
        .clone()
        .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());

    let mut telemetry = Telemetry {
        service_name: service_name.clone(),
        log_levels: log_levels(&cfg.logs.levels),
        ..Default::default()
    };

    if !cfg.any_enabled() {
        return Ok(telemetry);
    }

    global::set_text_map_propagator(TraceContextPropagator::new());

    // ----- Resource -----
    let mut attrs = vec![KeyValue::new("service.name", service_name.clone())];
    if let Some(version) = &cfg.service_version {
        attrs.push(KeyValue::new("service.version", version.clone()));
    }
    for (k, v) in &cfg.resource {
        attrs.push(KeyValue::new(k.clone(), v.clone()));
    }
    let resource = Resource::builder_empty().with_attributes(attrs).build();

    if cfg.traces.enabled {
        let provider = build_tracer_provider(&cfg.traces, resource.clone(), channels)
            .context("Failed to build trace provider")?;
        global::set_tracer_provider(provider.clone());
        telemetry.tracer = Some(provider);
    }

    if cfg.metrics.enabled {
        let provider = build_meter_provider(&cfg.metrics, resource.clone(), channels)
            .context("Failed to build meter provider")?;
        global::set_meter_provider(provider.clone());
        telemetry.meter = Some(provider);
    }

    if cfg.logs.signal.enabled {
        let provider = build_logger_provider(&cfg.logs.signal, resource, channels)
            .context("Failed to build logger provider")?;
        telemetry.logger = Some(provider);
    }

    tracing::info!(
        service = %service_name,
        traces = cfg.traces.enabled,
        metrics = cfg.metrics.enabled,
        logs = cfg.logs.signal.enabled,
        "OpenTelemetry providers initialized"
    );
    Ok(telemetry)
}

fn log_levels(levels: &BTreeMap<String, String>) -> LevelTable {
    let mut table = LevelTable::from_config(levels);
    for target in EXPORT_PIPELINE_TARGETS {
        if !levels.contains_key(*target) {
            table = table.with_prefix(*target, LevelFilter::OFF);
        }
    }
    table
}

// ================= traces =================

fn build_tracer_provider(
    signal: &SignalConfig,
    resource: Resource,
    channels: &ChannelCache,
) -> Result<SdkTracerProvider> {
    let exp = &signal.exporter;
    tracing::info!(kind = ?exp.kind, target = ?exp.target, "OTLP trace exporter config");

    // choose transport *inside* the branch to satisfy the type-state builder
    Ok(match exp.kind {
        ExporterKind::Stdout => {
            tracer_provider(opentelemetry_stdout::SpanExporter::default(), signal, resource)
        }
        ExporterKind::OtlpHttp => {
            let mut b = opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .with_protocol(Protocol::HttpBinary);
            if let Some(target) = &exp.target {
                b = b.with_endpoint(target.clone());
            }
            if let Some(t) = exp.timeout {
                b = b.with_timeout(t);
            }
            if let Some(h) = headers_from_cfg_and_env(exp) {
                b = b.with_headers(h);
            }
            let exporter = b.build().context("build OTLP HTTP span exporter")?;
            tracer_provider(exporter, signal, resource)
        }
        ExporterKind::OtlpGrpc => {
            let channel = channels.get(grpc_target(exp))?;
            let mut b = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_channel(channel);
            if let Some(t) = exp.timeout {
                b = b.with_timeout(t);
            }
            if let Some(md) = metadata_from_cfg_and_env(exp) {
                b = b.with_metadata(md);
            }
            let exporter = b.build().context("build OTLP gRPC span exporter")?;
            tracer_provider(exporter, signal, resource)
        }
    })
}

fn tracer_provider<E>(exporter: E, signal: &SignalConfig, resource: Resource) -> SdkTracerProvider
where
    E: SpanExporter + 'static,
{
    let sampler = match signal.sampling_ratio {
        Some(ratio) => Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(ratio))),
        None => Sampler::ParentBased(Box::new(Sampler::AlwaysOn)),
    };
    let builder = SdkTracerProvider::builder()
        .with_sampler(sampler)
        .with_resource(resource);

    match signal.processor {
        ProcessorKind::Simple => builder.with_simple_exporter(exporter).build(),
        ProcessorKind::Batch => {
            let mut batch = trace::BatchConfigBuilder::default();
            if let Some(d) = signal.interval {
                batch = batch.with_scheduled_delay(d);
            }
            if let Some(n) = signal.batch_size {
                batch = batch.with_max_export_batch_size(n);
            }
            let processor = BatchSpanProcessor::builder(exporter)
                .with_batch_config(batch.build())
                .build();
            builder.with_span_processor(processor).build()
        }
    }
}

// ================= metrics =================

fn build_meter_provider(
    signal: &SignalConfig,
    resource: Resource,
    channels: &ChannelCache,
) -> Result<SdkMeterProvider> {
    let exp = &signal.exporter;
    tracing::info!(kind = ?exp.kind, target = ?exp.target, "OTLP metric exporter config");

    Ok(match exp.kind {
        ExporterKind::Stdout => {
            meter_provider(opentelemetry_stdout::MetricExporter::default(), signal, resource)
        }
        ExporterKind::OtlpHttp => {
            let mut b = opentelemetry_otlp::MetricExporter::builder()
                .with_http()
                .with_protocol(Protocol::HttpBinary);
            if let Some(target) = &exp.target {
                b = b.with_endpoint(target.clone());
            }
            if let Some(t) = exp.timeout {
                b = b.with_timeout(t);
            }
            if let Some(h) = headers_from_cfg_and_env(exp) {
                b = b.with_headers(h);
            }
            let exporter = b.build().context("build OTLP HTTP metric exporter")?;
            meter_provider(exporter, signal, resource)
        }
        ExporterKind::OtlpGrpc => {
            let channel = channels.get(grpc_target(exp))?;
            let mut b = opentelemetry_otlp::MetricExporter::builder()
                .with_tonic()
                .with_channel(channel);
            if let Some(t) = exp.timeout {
                b = b.with_timeout(t);
            }
            if let Some(md) = metadata_from_cfg_and_env(exp) {
                b = b.with_metadata(md);
            }
            let exporter = b.build().context("build OTLP gRPC metric exporter")?;
            meter_provider(exporter, signal, resource)
        }
    })
}

// Metrics are always pushed by a periodic reader; `processor` does not apply.
fn meter_provider<E>(exporter: E, signal: &SignalConfig, resource: Resource) -> SdkMeterProvider
where
    E: PushMetricExporter,
{
    let mut reader = PeriodicReader::builder(exporter);
    if let Some(d) = signal.interval {
        reader = reader.with_interval(d);
    }
    SdkMeterProvider::builder()
        .with_reader(reader.build())
        .with_resource(resource)
        .build()
}

// ================= logs =================

fn build_logger_provider(
    signal: &SignalConfig,
    resource: Resource,
    channels: &ChannelCache,
) -> Result<SdkLoggerProvider> {
    let exp = &signal.exporter;
    tracing::info!(kind = ?exp.kind, target = ?exp.target, "OTLP log exporter config");

    Ok(match exp.kind {
        ExporterKind::Stdout => {
            logger_provider(opentelemetry_stdout::LogExporter::default(), signal, resource)
        }
        ExporterKind::OtlpHttp => {
            let mut b = opentelemetry_otlp::LogExporter::builder()
                .with_http()
                .with_protocol(Protocol::HttpBinary);
            if let Some(target) = &exp.target {
                b = b.with_endpoint(target.clone());
            }
            if let Some(t) = exp.timeout {
                b = b.with_timeout(t);
            }
            if let Some(h) = headers_from_cfg_and_env(exp) {
                b = b.with_headers(h);
            }
            let exporter = b.build().context("build OTLP HTTP log exporter")?;
            logger_provider(exporter, signal, resource)
        }
        ExporterKind::OtlpGrpc => {
            let channel = channels.get(grpc_target(exp))?;
            let mut b = opentelemetry_otlp::LogExporter::builder()
                .with_tonic()
                .with_channel(channel);
            if let Some(t) = exp.timeout {
                b = b.with_timeout(t);
            }
            if let Some(md) = metadata_from_cfg_and_env(exp) {
                b = b.with_metadata(md);
            }
            let exporter = b.build().context("build OTLP gRPC log exporter")?;
            logger_provider(exporter, signal, resource)
        }
    })
}

fn logger_provider<E>(exporter: E, signal: &SignalConfig, resource: Resource) -> SdkLoggerProvider
where
    E: LogExporter + 'static,
{
    let builder = SdkLoggerProvider::builder().with_resource(resource);

    match signal.processor {
        ProcessorKind::Simple => builder.with_simple_exporter(exporter).build(),
        ProcessorKind::Batch => {
            let mut batch = logs::BatchConfigBuilder::default();
            if let Some(d) = signal.interval {
                batch = batch.with_scheduled_delay(d);
            }
            if let Some(n) = signal.batch_size {
                batch = batch.with_max_export_batch_size(n);
            }
            let processor = BatchLogProcessor::builder(exporter)
                .with_batch_config(batch.build())
                .build();
            builder.with_log_processor(processor).build()
        }
    }
}

// ================= exporter helpers =================

fn grpc_target(exp: &ExporterConfig) -> &str {
    exp.target.as_deref().unwrap_or(DEFAULT_GRPC_TARGET)
}

/// Config headers, then `OTEL_EXPORTER_OTLP_HEADERS` (`k=v,k2=v2`) on top.
fn collect_headers(exp: &ExporterConfig) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = exp
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if let Ok(env_hdrs) = std::env::var("OTEL_EXPORTER_OTLP_HEADERS") {
        for part in env_hdrs.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if let Some((k, v)) = part.split_once('=') {
                out.push((k.trim().to_string(), v.trim().to_string()));
            }
        }
    }
    out
}

fn headers_from_cfg_and_env(exp: &ExporterConfig) -> Option<HashMap<String, String>> {
    let out: HashMap<String, String> = collect_headers(exp).into_iter().collect();
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn metadata_from_cfg_and_env(exp: &ExporterConfig) -> Option<MetadataMap> {
    let mut md = MetadataMap::new();
    for (k, v) in collect_headers(exp) {
        match (
            MetadataKey::from_bytes(k.as_bytes()),
            MetadataValue::try_from(v.as_str()),
        ) {
            (Ok(key), Ok(val)) => {
                md.insert(key, val);
            }
            _ => tracing::warn!(header = %k, "Skipping invalid gRPC metadata header"),
        }
    }
    if md.is_empty() {
        None
    } else {
        Some(md)
    }
}
