use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tonic::transport::{Channel, Endpoint};

/// Memoizes one gRPC channel per OTLP target so that traces, metrics and
/// logs pointed at the same collector share a single connection.
///
/// `get_or` dials at most once per key; the lock is held across the dial,
/// which is cheap because channels connect lazily.
#[derive(Clone, Default)]
pub struct ChannelCache {
    channels: Arc<Mutex<HashMap<String, Channel>>>,
}

impl ChannelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached channel for `target`, dialing with `dial` on a miss.
    pub fn get_or<F>(&self, target: &str, dial: F) -> Result<Channel>
    where
        F: FnOnce(&str) -> Result<Channel>,
    {
        let mut channels = self.channels.lock();
        if let Some(ch) = channels.get(target) {
            return Ok(ch.clone());
        }
        let ch = dial(target)?;
        channels.insert(target.to_string(), ch.clone());
        tracing::debug!(%target, "OTLP channel created");
        Ok(ch)
    }

    /// Returns the cached channel for `target`, creating a lazily connected one.
    ///
    /// Must be called within a Tokio runtime.
    pub fn get(&self, target: &str) -> Result<Channel> {
        self.get_or(target, dial_lazy)
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn dial_lazy(target: &str) -> Result<Channel> {
    let endpoint = Endpoint::from_shared(target.to_string())
        .with_context(|| format!("invalid OTLP target {target:?}"))?;
    Ok(endpoint.connect_lazy())
}
