//! Composable configuration readers.
//!
//! A [`Reader`] yields `Ok(Some(v))` when a value is present, `Ok(None)` when
//! it is absent and `Err` when a present value could not be parsed. Readers
//! are plain closures, so they compose without allocation:
//!
//! ```ignore
//! let port = must_or(8080, int64_from_string(env("PORT")));
//! let timeout = must_or(
//!     Duration::from_secs(5),
//!     duration_from_string(or(env("HTTP_TIMEOUT"), reader_of("5s".to_string()))),
//! );
//! ```

use serde::de::DeserializeOwned;
use std::num::ParseIntError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("invalid integer {value:?}: {source}")]
    Int {
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("invalid duration {value:?}: {source}")]
    Duration {
        value: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error("invalid boolean {value:?}")]
    Bool { value: String },
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type ReadResult<T> = Result<Option<T>, ReaderError>;

/// A source of an optional, typed configuration value.
pub trait Reader<T>: Send + Sync {
    fn read(&self) -> ReadResult<T>;
}

impl<T, F> Reader<T> for F
where
    F: Fn() -> ReadResult<T> + Send + Sync,
{
    fn read(&self) -> ReadResult<T> {
        self()
    }
}

/// Reads an environment variable. Unset (or non-unicode) variables are absent.
pub fn env(name: impl Into<String>) -> impl Reader<String> {
    let name = name.into();
    move || -> ReadResult<String> { Ok(std::env::var(&name).ok()) }
}

/// Always yields `value`.
pub fn reader_of<T>(value: T) -> impl Reader<T>
where
    T: Clone + Send + Sync,
{
    move || -> ReadResult<T> { Ok(Some(value.clone())) }
}

/// Yields the primary value when present, otherwise consults `fallback`.
pub fn or<T>(primary: impl Reader<T>, fallback: impl Reader<T>) -> impl Reader<T> {
    move || -> ReadResult<T> {
        match primary.read()? {
            Some(v) => Ok(Some(v)),
            None => fallback.read(),
        }
    }
}

/// Yields `value` when `reader` has nothing to offer.
pub fn default<T>(value: T, reader: impl Reader<T>) -> impl Reader<T>
where
    T: Clone + Send + Sync,
{
    move || -> ReadResult<T> { Ok(Some(reader.read()?.unwrap_or_else(|| value.clone()))) }
}

pub fn int64_from_string(reader: impl Reader<String>) -> impl Reader<i64> {
    move || -> ReadResult<i64> {
        reader
            .read()?
            .map(|raw| {
                raw.trim()
                    .parse::<i64>()
                    .map_err(|source| ReaderError::Int { value: raw, source })
            })
            .transpose()
    }
}

/// Parses human readable durations such as `150ms`, `5s` or `1h 30m`.
pub fn duration_from_string(reader: impl Reader<String>) -> impl Reader<Duration> {
    move || -> ReadResult<Duration> {
        reader
            .read()?
            .map(|raw| {
                humantime::parse_duration(raw.trim())
                    .map_err(|source| ReaderError::Duration { value: raw, source })
            })
            .transpose()
    }
}

pub fn bool_from_string(reader: impl Reader<String>) -> impl Reader<bool> {
    move || -> ReadResult<bool> {
        reader
            .read()?
            .map(|raw| match raw.trim() {
                "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
                "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
                _ => Err(ReaderError::Bool { value: raw }),
            })
            .transpose()
    }
}

pub fn unmarshal_json<T>(reader: impl Reader<String>) -> impl Reader<T>
where
    T: DeserializeOwned,
{
    move || -> ReadResult<T> {
        reader
            .read()?
            .map(|raw| serde_json::from_str(&raw).map_err(ReaderError::from))
            .transpose()
    }
}

pub fn unmarshal_yaml<T>(reader: impl Reader<String>) -> impl Reader<T>
where
    T: DeserializeOwned,
{
    move || -> ReadResult<T> {
        reader
            .read()?
            .map(|raw| serde_yaml::from_str(&raw).map_err(ReaderError::from))
            .transpose()
    }
}

/// Reads the value and panics if the reader fails.
pub fn must<T>(reader: impl Reader<T>) -> Option<T> {
    match reader.read() {
        Ok(v) => v,
        Err(e) => panic!("config reader failed: {e}"),
    }
}

/// Like [`must`], falling back to `value` when nothing is present.
pub fn must_or<T>(value: T, reader: impl Reader<T>) -> T {
    must(reader).unwrap_or(value)
}
