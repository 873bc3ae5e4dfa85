//! Source-system filtering for resolution jobs.
//! Restricts the record population to an allow-list of source systems.

use log::{debug, info};
use std::env;

use crate::models::core::Record;

#[derive(Debug, Clone, Default)]
pub struct SourceFilterConfig {
    pub enabled: bool,
    pub allowed_sources: Vec<String>,
}

impl SourceFilterConfig {
    /// Create configuration from `SOURCE_FILTER_ENABLED` / `ALLOWED_SOURCES`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = lookup("SOURCE_FILTER_ENABLED")
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(false);

        let allowed_sources = if enabled {
            lookup("ALLOWED_SOURCES")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        } else {
            Vec::new()
        };

        debug!("Source filter config: enabled={}, sources={:?}", enabled, allowed_sources);
        Self { enabled, allowed_sources }
    }

    /// Check if filtering is effectively enabled (both flag and sources present)
    pub fn is_active(&self) -> bool {
        self.enabled && !self.allowed_sources.is_empty()
    }

    /// SQL clause on the `source` column whose placeholders start after
    /// `param_offset` existing parameters.
    pub fn build_sql_filter_with_offset(&self, param_offset: usize) -> Option<(String, Vec<String>)> {
        if !self.is_active() {
            return None;
        }

        let placeholders: Vec<String> = (1..=self.allowed_sources.len())
            .map(|i| format!("${}", i + param_offset))
            .collect();

        let where_clause = format!("source = ANY(ARRAY[{}]::text[])", placeholders.join(", "));

        Some((where_clause, self.allowed_sources.clone()))
    }

    /// Applies the filter to an in-memory population.
    pub fn retain(&self, records: &mut Vec<Record>) {
        if self.is_active() {
            records.retain(|r| self.allowed_sources.iter().any(|s| s == &r.source));
        }
    }

    pub fn log_config(&self) {
        if self.is_active() {
            info!("🔍 Source filtering ENABLED");
            info!("   Allowed sources: {:?}", self.allowed_sources);
        } else {
            info!("🔍 Source filtering DISABLED - resolving records from all sources");
        }
    }
}
