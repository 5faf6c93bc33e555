use humus::server::{PemSource, TlsVersion};
use rdkafka::ClientConfig;
use serde::Deserialize;
use std::time::Duration;

use crate::runtime::KafkaRuntimeError;

pub const DEFAULT_CLIENT_ID: &str = "humus";
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(45);
pub const DEFAULT_REBALANCE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_FETCH_MAX_BYTES: usize = 50 << 20;
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 256;
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AutoOffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl AutoOffsetReset {
    fn as_str(self) -> &'static str {
        match self {
            AutoOffsetReset::Earliest => "earliest",
            AutoOffsetReset::Latest => "latest",
        }
    }
}

/// Consumer group settings. Everything except `brokers` and `group_id` has
/// a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub group_id: String,
    pub client_id: String,
    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,
    /// Also bounds how long a revoked partition may take to drain.
    #[serde(with = "humantime_serde")]
    pub rebalance_timeout: Duration,
    pub fetch_max_bytes: usize,
    /// Records fetched but not yet processed, across all partitions.
    pub max_concurrent_fetches: usize,
    /// Buffered records per partition worker.
    pub queue_depth: usize,
    pub auto_offset_reset: AutoOffsetReset,
    pub tls: Option<KafkaTlsConfig>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            group_id: String::new(),
            client_id: DEFAULT_CLIENT_ID.to_owned(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            rebalance_timeout: DEFAULT_REBALANCE_TIMEOUT,
            fetch_max_bytes: DEFAULT_FETCH_MAX_BYTES,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            auto_offset_reset: AutoOffsetReset::default(),
            tls: None,
        }
    }
}

/// TLS towards the brokers. Supplying `cert` and `key` enables mutual TLS.
/// The server name (SNI and endpoint check) is always the broker host name.
///
/// librdkafka has no protocol floor setting; its OpenSSL refuses anything
/// below TLS 1.2, and a TLS 1.3 floor cannot be enforced, so it is rejected.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaTlsConfig {
    #[serde(default)]
    pub ca: Option<PemSource>,
    #[serde(default)]
    pub cert: Option<PemSource>,
    #[serde(default)]
    pub key: Option<PemSource>,
    /// Check that the broker certificate matches the broker host name.
    #[serde(default = "enabled")]
    pub verify_endpoint: bool,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default)]
    pub min_version: TlsVersion,
}

fn enabled() -> bool {
    true
}

impl Default for KafkaTlsConfig {
    fn default() -> Self {
        Self {
            ca: None,
            cert: None,
            key: None,
            verify_endpoint: true,
            insecure_skip_verify: false,
            min_version: TlsVersion::default(),
        }
    }
}

impl KafkaTlsConfig {
    fn apply(&self, cfg: &mut ClientConfig) -> Result<(), KafkaRuntimeError> {
        if self.cert.is_some() != self.key.is_some() {
            return Err(KafkaRuntimeError::Config(
                "tls.cert and tls.key must be set together".into(),
            ));
        }
        if self.min_version == TlsVersion::Tls13 {
            return Err(KafkaRuntimeError::Config(
                "tls.min_version 1.3 cannot be enforced by the Kafka client".into(),
            ));
        }
        cfg.set("security.protocol", "ssl");
        set_pem(cfg, "ssl.ca", self.ca.as_ref());
        set_pem(cfg, "ssl.certificate", self.cert.as_ref());
        set_pem(cfg, "ssl.key", self.key.as_ref());
        let verify_endpoint = self.verify_endpoint && !self.insecure_skip_verify;
        cfg.set(
            "ssl.endpoint.identification.algorithm",
            if verify_endpoint { "https" } else { "none" },
        );
        cfg.set(
            "enable.ssl.certificate.verification",
            (!self.insecure_skip_verify).to_string(),
        );
        Ok(())
    }
}

/// Sets `<prefix>.location` for files and `<prefix>.pem` for inline PEM.
fn set_pem(cfg: &mut ClientConfig, prefix: &str, source: Option<&PemSource>) {
    match source {
        Some(PemSource::File(path)) => {
            cfg.set(format!("{prefix}.location"), path.display().to_string());
        }
        Some(PemSource::Pem(text)) => {
            cfg.set(format!("{prefix}.pem"), text.clone());
        }
        None => {}
    }
}

impl KafkaConfig {
    pub fn new(brokers: impl IntoIterator<Item = impl Into<String>>, group_id: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into_iter().map(Into::into).collect(),
            group_id: group_id.into(),
            ..Self::default()
        }
    }

    /// librdkafka settings for a group consumer.
    ///
    /// Offsets are stored explicitly after processing and committed in the
    /// background by the client, so `enable.auto.offset.store` is off.
    pub fn client_config(&self) -> Result<ClientConfig, KafkaRuntimeError> {
        if self.brokers.is_empty() {
            return Err(KafkaRuntimeError::Config("no brokers configured".into()));
        }
        if self.group_id.is_empty() {
            return Err(KafkaRuntimeError::Config("group_id is required".into()));
        }
        if self.max_concurrent_fetches == 0 || self.queue_depth == 0 {
            return Err(KafkaRuntimeError::Config(
                "max_concurrent_fetches and queue_depth must be positive".into(),
            ));
        }

        let mut cfg = ClientConfig::new();
        cfg.set("bootstrap.servers", self.brokers.join(","))
            .set("group.id", &self.group_id)
            .set("client.id", &self.client_id)
            .set("session.timeout.ms", millis(self.session_timeout))
            .set("max.poll.interval.ms", millis(self.rebalance_timeout))
            .set("fetch.max.bytes", self.fetch_max_bytes.to_string())
            .set("auto.offset.reset", self.auto_offset_reset.as_str())
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false");
        if let Some(tls) = &self.tls {
            tls.apply(&mut cfg)?;
        }
        Ok(cfg)
    }
}

fn millis(d: Duration) -> String {
    d.as_millis().to_string()
}
