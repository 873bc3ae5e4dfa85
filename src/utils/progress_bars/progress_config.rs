// src/utils/progress_bars/progress_config.rs

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::env;
use std::time::Duration;

/// Configuration for progress tracking during resolution jobs
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    /// Whether to show progress bars at all
    pub enabled: bool,
    /// Whether to show one bar per rule during scoring
    pub detailed: bool,
    /// Refresh rate for progress bars in milliseconds
    pub refresh_rate_ms: u64,
    /// Whether to show memory usage in progress messages
    pub show_memory: bool,
    /// Whether to show external score cache statistics
    pub show_cache_stats: bool,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            detailed: true,
            refresh_rate_ms: 100,
            show_memory: true,
            show_cache_stats: true,
        }
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl ProgressConfig {
    /// Create progress configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            enabled: flag(&lookup, "PROGRESS_ENABLED", true),
            detailed: flag(&lookup, "PROGRESS_DETAILED", true),
            refresh_rate_ms: lookup("PROGRESS_REFRESH_RATE_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            show_memory: flag(&lookup, "PROGRESS_SHOW_MEMORY", true),
            show_cache_stats: flag(&lookup, "PROGRESS_SHOW_CACHE_STATS", true),
        }
    }

    /// Configuration with every bar switched off, for tests and embedding.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Create a MultiProgress instance if progress is enabled, None otherwise
    pub fn create_multi_progress(&self) -> Option<MultiProgress> {
        if self.enabled {
            let multi = MultiProgress::new();
            multi.set_draw_target(ProgressDrawTarget::stderr_with_hz(self.refresh_hz()));
            Some(multi)
        } else {
            None
        }
    }

    /// Bucket-level bar for one rule's scoring pass.
    pub fn bucket_bar(&self, multi: Option<&MultiProgress>, rule_name: &str, buckets: usize) -> Option<ProgressBar> {
        if !self.should_show_detailed() {
            return None;
        }
        let multi = multi?;
        let bar = multi.add(ProgressBar::new(buckets as u64));
        bar.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.blue} [{elapsed_precise}] {bar:30.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar.set_message(format!("Scoring buckets for rule '{}'", rule_name));
        bar.enable_steady_tick(Duration::from_millis(self.refresh_rate_ms.max(10)));
        Some(bar)
    }

    pub fn should_show_detailed(&self) -> bool {
        self.enabled && self.detailed
    }

    pub fn should_show_memory(&self) -> bool {
        self.enabled && self.show_memory
    }

    pub fn should_show_cache_stats(&self) -> bool {
        self.enabled && self.show_cache_stats
    }

    fn refresh_hz(&self) -> u8 {
        (1000 / self.refresh_rate_ms.max(10)).min(u8::MAX as u64) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProgressConfig::default();
        assert!(config.enabled);
        assert!(config.detailed);
        assert_eq!(config.refresh_rate_ms, 100);
        assert!(config.show_memory);
        assert!(config.show_cache_stats);
    }

    #[test]
    fn test_lookup_config() {
        let config = ProgressConfig::from_lookup(|key| match key {
            "PROGRESS_ENABLED" => Some("false".to_string()),
            "PROGRESS_REFRESH_RATE_MS" => Some("50".to_string()),
            "PROGRESS_SHOW_MEMORY" => Some("nonsense".to_string()),
            _ => None,
        });
        assert!(!config.enabled);
        assert!(config.detailed);
        assert_eq!(config.refresh_rate_ms, 50);
        assert!(config.show_memory);
    }

    #[test]
    fn test_multi_progress_creation() {
        let mut config = ProgressConfig::default();
        assert!(config.create_multi_progress().is_some());
        config.enabled = false;
        assert!(config.create_multi_progress().is_none());
        assert!(config.bucket_bar(None, "rule", 3).is_none());
    }

    #[test]
    fn test_should_show_methods() {
        let mut config = ProgressConfig::default();
        assert!(config.should_show_detailed());
        assert!(config.should_show_memory());
        assert!(config.should_show_cache_stats());

        config.enabled = false;
        assert!(!config.should_show_detailed());
        assert!(!config.should_show_memory());
        assert!(!config.should_show_cache_stats());
    }
}
