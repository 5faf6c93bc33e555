use serde::Deserialize;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{self, RootCertStore, ServerConfig, SupportedProtocolVersion};

/// Where a PEM blob comes from.
///
/// Written in config as a map with exactly one of `file` or `pem`:
/// `cert: { file: /etc/tls/cert.pem }`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(try_from = "PemFields")]
pub enum PemSource {
    File(PathBuf),
    Pem(String),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PemFields {
    file: Option<PathBuf>,
    pem: Option<String>,
}

impl TryFrom<PemFields> for PemSource {
    type Error = &'static str;

    fn try_from(fields: PemFields) -> Result<Self, Self::Error> {
        match (fields.file, fields.pem) {
            (Some(path), None) => Ok(PemSource::File(path)),
            (None, Some(text)) => Ok(PemSource::Pem(text)),
            (Some(_), Some(_)) => Err("PEM source takes only one of `file` or `pem`"),
            (None, None) => Err("PEM source needs `file` or `pem`"),
        }
    }
}

impl PemSource {
    fn load(&self) -> Result<Vec<u8>, TlsError> {
        match self {
            PemSource::File(path) => std::fs::read(path).map_err(|source| TlsError::Read {
                path: path.clone(),
                source,
            }),
            PemSource::Pem(text) => Ok(text.as_bytes().to_vec()),
        }
    }

    fn certificates(&self) -> Result<Vec<CertificateDer<'static>>, TlsError> {
        let pem = self.load()?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_slice()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(TlsError::Pem)?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificates(self.describe()));
        }
        Ok(certs)
    }

    fn private_key(&self) -> Result<PrivateKeyDer<'static>, TlsError> {
        let pem = self.load()?;
        rustls_pemfile::private_key(&mut BufReader::new(pem.as_slice()))
            .map_err(TlsError::Pem)?
            .ok_or_else(|| TlsError::NoPrivateKey(self.describe()))
    }

    fn describe(&self) -> String {
        match self {
            PemSource::File(path) => path.display().to_string(),
            PemSource::Pem(_) => "inline PEM".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
pub enum TlsVersion {
    #[default]
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

impl TlsVersion {
    fn protocol_versions(self) -> &'static [&'static SupportedProtocolVersion] {
        static FROM_12: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13, &rustls::version::TLS12];
        static FROM_13: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];
        match self {
            TlsVersion::Tls12 => FROM_12,
            TlsVersion::Tls13 => FROM_13,
        }
    }
}

/// Server-side TLS settings for a [`super::Listener`].
///
/// Setting `client_ca` turns on mutual TLS: every client must present a
/// certificate chaining to one of the CA certificates.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert: PemSource,
    pub key: PemSource,
    #[serde(default)]
    pub client_ca: Option<PemSource>,
    #[serde(default)]
    pub min_version: TlsVersion,
    /// ALPN protocols in preference order, e.g. `["h2", "http/1.1"]`.
    #[serde(default)]
    pub alpn: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed PEM")]
    Pem(#[source] std::io::Error),
    #[error("no certificates found in {0}")]
    NoCertificates(String),
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("invalid client CA: {0}")]
    ClientCa(String),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

impl TlsConfig {
    pub fn new(cert: PemSource, key: PemSource) -> Self {
        Self {
            cert,
            key,
            client_ca: None,
            min_version: TlsVersion::default(),
            alpn: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_client_ca(mut self, ca: PemSource) -> Self {
        self.client_ca = Some(ca);
        self
    }

    #[must_use]
    pub fn with_min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = version;
        self
    }

    #[must_use]
    pub fn with_alpn<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alpn = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Builds the rustls server configuration.
    pub fn server_config(&self) -> Result<ServerConfig, TlsError> {
        let certs = self.cert.certificates()?;
        let key = self.key.private_key()?;

        let builder = ServerConfig::builder_with_protocol_versions(self.min_version.protocol_versions());
        let builder = match &self.client_ca {
            Some(ca) => {
                let mut roots = RootCertStore::empty();
                for cert in ca.certificates()? {
                    roots.add(cert)?;
                }
                let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|e| TlsError::ClientCa(e.to_string()))?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let mut config = builder.with_single_cert(certs, key)?;
        config.alpn_protocols = self.alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        Ok(config)
    }
}
