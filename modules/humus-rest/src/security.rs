//! Security schemes attached to parameters.
//!
//! A scheme names where the credential lives (the parameter it is attached
//! to), how to parse it, and who verifies it. The same value feeds the
//! runtime check and `components.securitySchemes`.

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use utoipa::openapi::security::{
    ApiKey, ApiKeyValue, AuthorizationCode, ClientCredentials, Flow, HttpAuthScheme, HttpBuilder,
    Implicit, OAuth2, Password, Scopes, SecurityScheme as OpenApiScheme,
};

use crate::param::ParamLocation;
use crate::problem::{FrameworkError, ProblemError};

/// A parsed credential as handed to a [`Verifier`].
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { username: String, password: String },
    ApiKey(String),
    Bearer(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Credential::ApiKey(_) => f.write_str("ApiKey(..)"),
            Credential::Bearer(_) => f.write_str("Bearer(..)"),
        }
    }
}

/// Decides whether a credential is acceptable.
///
/// Verifiers may insert claims into `extensions`; handlers read them back
/// through [`crate::Request::extensions`].
#[async_trait]
pub trait Verifier: Send + Sync + 'static {
    async fn verify(&self, credential: &Credential, extensions: &mut http::Extensions) -> Result<()>;
}

pub struct VerifierFn<F>(F);

/// Lifts a synchronous check into a [`Verifier`].
pub fn verifier_fn<F>(f: F) -> VerifierFn<F>
where
    F: Fn(&Credential, &mut http::Extensions) -> Result<()> + Send + Sync + 'static,
{
    VerifierFn(f)
}

#[async_trait]
impl<F> Verifier for VerifierFn<F>
where
    F: Fn(&Credential, &mut http::Extensions) -> Result<()> + Send + Sync + 'static,
{
    async fn verify(&self, credential: &Credential, extensions: &mut http::Extensions) -> Result<()> {
        (self.0)(credential, extensions)
    }
}

/// OAuth2 flow metadata for the OpenAPI document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OAuth2Flow {
    AuthorizationCode {
        authorization_url: String,
        token_url: String,
        scopes: BTreeMap<String, String>,
    },
    ClientCredentials {
        token_url: String,
        scopes: BTreeMap<String, String>,
    },
    Implicit {
        authorization_url: String,
        scopes: BTreeMap<String, String>,
    },
    Password {
        token_url: String,
        scopes: BTreeMap<String, String>,
    },
}

impl OAuth2Flow {
    fn to_openapi(&self) -> Flow {
        match self {
            OAuth2Flow::AuthorizationCode {
                authorization_url,
                token_url,
                scopes,
            } => Flow::AuthorizationCode(AuthorizationCode::new(
                authorization_url,
                token_url,
                scopes_of(scopes),
            )),
            OAuth2Flow::ClientCredentials { token_url, scopes } => {
                Flow::ClientCredentials(ClientCredentials::new(token_url, scopes_of(scopes)))
            }
            OAuth2Flow::Implicit {
                authorization_url,
                scopes,
            } => Flow::Implicit(Implicit::new(authorization_url, scopes_of(scopes))),
            OAuth2Flow::Password { token_url, scopes } => {
                Flow::Password(Password::new(token_url, scopes_of(scopes)))
            }
        }
    }
}

fn scopes_of(scopes: &BTreeMap<String, String>) -> Scopes {
    Scopes::from_iter(scopes.iter().map(|(k, v)| (k.clone(), v.clone())))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemeKind {
    Basic,
    ApiKey,
    Jwt,
    OAuth2(Vec<OAuth2Flow>),
}

/// A named security scheme with its verifier.
#[derive(Clone)]
pub struct SecurityScheme {
    name: String,
    kind: SchemeKind,
    verifier: Arc<dyn Verifier>,
}

impl fmt::Debug for SecurityScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityScheme")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl SecurityScheme {
    fn new(name: impl Into<String>, kind: SchemeKind, verifier: impl Verifier) -> Self {
        Self {
            name: name.into(),
            kind,
            verifier: Arc::new(verifier),
        }
    }

    /// HTTP Basic. The parameter value is `Basic <base64(user:pass)>`.
    pub fn basic(name: impl Into<String>, verifier: impl Verifier) -> Self {
        Self::new(name, SchemeKind::Basic, verifier)
    }

    /// The raw parameter value is the key.
    pub fn api_key(name: impl Into<String>, verifier: impl Verifier) -> Self {
        Self::new(name, SchemeKind::ApiKey, verifier)
    }

    /// Bearer token documented with format `JWT`. The verifier owns the
    /// signature and claims checks.
    pub fn jwt(name: impl Into<String>, verifier: impl Verifier) -> Self {
        Self::new(name, SchemeKind::Jwt, verifier)
    }

    pub fn oauth2(
        name: impl Into<String>,
        flows: impl IntoIterator<Item = OAuth2Flow>,
        verifier: impl Verifier,
    ) -> Self {
        Self::new(
            name,
            SchemeKind::OAuth2(flows.into_iter().collect()),
            verifier,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &SchemeKind {
        &self.kind
    }

    /// Parses `raw` and runs the verifier. Any failure is an
    /// [`FrameworkError::Unauthorized`] unless the verifier returned a
    /// [`ProblemError`], which is kept as is.
    pub async fn authenticate(&self, raw: Option<&str>, extensions: &mut http::Extensions) -> Result<()> {
        let raw = raw.ok_or_else(|| self.unauthorized("missing credential"))?;
        let credential = self.parse(raw)?;
        match self.verifier.verify(&credential, extensions).await {
            Ok(()) => Ok(()),
            Err(e) if e.chain().any(|c| c.is::<ProblemError>()) => Err(e),
            Err(e) => Err(self.unauthorized(&format!("{e:#}"))),
        }
    }

    fn parse(&self, raw: &str) -> Result<Credential> {
        match &self.kind {
            SchemeKind::ApiKey => {
                if raw.is_empty() {
                    return Err(self.unauthorized("empty API key"));
                }
                Ok(Credential::ApiKey(raw.to_owned()))
            }
            SchemeKind::Jwt | SchemeKind::OAuth2(_) => {
                let token = strip_prefix_ci(raw, "Bearer ").unwrap_or(raw).trim();
                if token.is_empty() {
                    return Err(self.unauthorized("empty bearer token"));
                }
                Ok(Credential::Bearer(token.to_owned()))
            }
            SchemeKind::Basic => {
                let encoded = strip_prefix_ci(raw, "Basic ")
                    .ok_or_else(|| self.unauthorized("not a Basic credential"))?;
                let decoded = STANDARD
                    .decode(encoded.trim())
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
                    .ok_or_else(|| self.unauthorized("malformed Basic credential"))?;
                let (username, password) = decoded
                    .split_once(':')
                    .ok_or_else(|| self.unauthorized("malformed Basic credential"))?;
                Ok(Credential::Basic {
                    username: username.to_owned(),
                    password: password.to_owned(),
                })
            }
        }
    }

    fn unauthorized(&self, reason: &str) -> anyhow::Error {
        FrameworkError::Unauthorized(format!("{}: {reason}", self.name)).into()
    }

    /// The `components.securitySchemes` entry for a credential read from
    /// `param` at `location`.
    pub(crate) fn to_openapi(&self, param: &str, location: ParamLocation) -> OpenApiScheme {
        match &self.kind {
            SchemeKind::Basic => {
                OpenApiScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Basic).build())
            }
            SchemeKind::Jwt => OpenApiScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
            SchemeKind::ApiKey => {
                let value = ApiKeyValue::new(param);
                OpenApiScheme::ApiKey(match location {
                    ParamLocation::Query => ApiKey::Query(value),
                    ParamLocation::Cookie => ApiKey::Cookie(value),
                    ParamLocation::Header | ParamLocation::Path => ApiKey::Header(value),
                })
            }
            SchemeKind::OAuth2(flows) => {
                OpenApiScheme::OAuth2(OAuth2::new(flows.iter().map(OAuth2Flow::to_openapi)))
            }
        }
    }
}

fn strip_prefix_ci<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &value[prefix.len()..])
}
