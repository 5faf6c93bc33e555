use std::collections::BTreeMap;
use tracing::level_filters::LevelFilter;
use tracing::Metadata;
use tracing_subscriber::filter::{filter_fn, FilterFn};

use crate::logging::{matches_crate_prefix, parse_level_filter};

/// `{target prefix -> minimum level}` table resolved by longest prefix.
///
/// Prefixes match whole path segments: `humus` covers `humus::app` but not
/// `humus_kafka`. Targets without a matching prefix use the default level.
#[derive(Debug, Clone)]
pub struct LevelTable {
    // sorted by prefix length, longest first
    rules: Vec<(String, LevelFilter)>,
    default: LevelFilter,
}

impl Default for LevelTable {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default: LevelFilter::TRACE,
        }
    }
}

impl LevelTable {
    pub fn new(default: LevelFilter) -> Self {
        Self {
            rules: Vec::new(),
            default,
        }
    }

    /// Builds a table from config strings. The `default` key sets the
    /// fallback level; unknown level names count as `info`.
    pub fn from_config(levels: &BTreeMap<String, String>) -> Self {
        let mut table = Self::default();
        for (prefix, level) in levels {
            let level = parse_level_filter(level);
            if prefix == "default" {
                table.default = level;
            } else {
                table = table.with_prefix(prefix.clone(), level);
            }
        }
        table
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>, min: LevelFilter) -> Self {
        let prefix = prefix.into();
        self.rules.retain(|(p, _)| *p != prefix);
        self.rules.push((prefix, min));
        self.rules.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    pub fn min_level(&self, target: &str) -> LevelFilter {
        self.rules
            .iter()
            .find(|(prefix, _)| matches_crate_prefix(target, prefix))
            .map(|(_, level)| *level)
            .unwrap_or(self.default)
    }

    pub fn enabled(&self, meta: &Metadata<'_>) -> bool {
        *meta.level() <= self.min_level(meta.target())
    }

    /// Per-layer filter dropping records below their matched minimum.
    pub fn into_filter(self) -> FilterFn<impl Fn(&Metadata<'_>) -> bool> {
        filter_fn(move |meta| self.enabled(meta))
    }
}
