//! File-based configuration.
//!
//! Every section and field is optional; missing values take the same
//! defaults as the corresponding `Default` impls.
//!
//! ```toml
//! [retry]
//! max_retries = 3
//! base_delay_ms = 1000
//!
//! [classifier]
//! transient_patterns = ["(?i)bucket busy"]
//!
//! [store]
//! url = "sqlite://docflow.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{DocflowError, Result};
use crate::events::EventSink;
use crate::metrics::{MetricsCollector, MetricsConfig};
use crate::observability::LoggingConfig;
use crate::pipeline::{ClassifierConfig, ErrorClassifier, RetryOrchestrator, RetryPolicy, StageStateStore};
use crate::store::{DurableStore, InMemoryStore};

fn default_stale_after_ms() -> u64 {
    10 * 60 * 1000
}

/// Where stage state is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite URL. `None` keeps everything in memory.
    #[serde(default)]
    pub url: Option<String>,
    /// Age after which a `running` row is considered abandoned.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            stale_after_ms: default_stale_after_ms(),
        }
    }
}

impl StoreConfig {
    /// Threshold for [`StageStateStore::reclaim_stale_stages`].
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    /// Opens the configured store.
    pub async fn open(&self) -> Result<Arc<dyn DurableStore>> {
        match self.url.as_deref() {
            None => Ok(Arc::new(InMemoryStore::new())),
            #[cfg(feature = "sqlite")]
            Some(url) => Ok(Arc::new(crate::store::SqliteStore::connect(url).await?)),
            #[cfg(not(feature = "sqlite"))]
            Some(url) => Err(DocflowError::Config(format!(
                "store url '{url}' requires the 'sqlite' feature"
            ))),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocflowConfig {
    /// Retry and backoff policy.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Extra classification rules.
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// Latency window and push settings.
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Log format and filter.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Persistence.
    #[serde(default)]
    pub store: StoreConfig,
}

impl DocflowConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| DocflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| DocflowError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Checks values that deserialize fine but make no sense.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(DocflowError::Config(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(DocflowError::Config(format!(
                "retry.jitter_ratio must be within [0, 1], got {}",
                self.retry.jitter_ratio
            )));
        }
        if self.retry.lock_ttl_ms == 0 {
            return Err(DocflowError::Config("retry.lock_ttl_ms must be positive".to_string()));
        }
        if self.metrics.window_capacity == 0 {
            return Err(DocflowError::Config(
                "metrics.window_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Wires an orchestrator from this configuration.
    pub fn orchestrator(
        &self,
        state: StageStateStore,
        metrics: Arc<MetricsCollector>,
        events: Arc<dyn EventSink>,
    ) -> Result<RetryOrchestrator> {
        Ok(RetryOrchestrator::new(state, self.retry.clone())
            .with_classifier(ErrorClassifier::new(&self.classifier)?)
            .with_metrics(metrics)
            .with_event_sink(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoOpEventSink;
    use crate::observability::LogFormat;
    use std::io::Write;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = DocflowConfig::from_toml_str("").unwrap();
        assert_eq!(config, DocflowConfig::default());
        assert_eq!(config.store.stale_after(), Duration::from_secs(600));
    }

    #[test]
    fn test_partial_sections() {
        let config = DocflowConfig::from_toml_str(
            r#"
            [retry]
            max_retries = 5
            base_delay_ms = 10

            [classifier]
            unknown_max_retries = 0
            permanent_patterns = ["(?i)corrupt pdf"]

            [metrics]
            window_capacity = 50

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 10);
        assert_eq!(config.retry.lock_ttl_ms, RetryPolicy::default().lock_ttl_ms);
        assert_eq!(config.classifier.unknown_max_retries, 0);
        assert_eq!(config.metrics.window_capacity, 50);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.store.url.is_none());
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = DocflowConfig::from_toml_str("[retry]\nbase_delay_ms = 500\nmax_delay_ms = 100\n")
            .unwrap_err();
        assert!(matches!(err, DocflowError::Config(_)));

        assert!(DocflowConfig::from_toml_str("[retry]\njitter_ratio = 1.5\n").is_err());
        assert!(DocflowConfig::from_toml_str("[metrics]\nwindow_capacity = 0\n").is_err());
        assert!(DocflowConfig::from_toml_str("[retry]\nmax_retries = \"three\"\n").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[store]\nstale_after_ms = 1000").unwrap();

        let config = DocflowConfig::from_file(file.path()).unwrap();
        assert_eq!(config.store.stale_after(), Duration::from_secs(1));

        assert!(DocflowConfig::from_file("/nonexistent/docflow.toml").is_err());
    }

    #[test]
    fn test_invalid_classifier_pattern_fails_wiring() {
        let config = DocflowConfig::from_toml_str("[classifier]\ntransient_patterns = [\"(\"]\n").unwrap();
        let state = StageStateStore::new(Arc::new(InMemoryStore::new()));
        let result = config.orchestrator(
            state,
            Arc::new(MetricsCollector::default()),
            Arc::new(NoOpEventSink),
        );
        assert!(matches!(result, Err(DocflowError::Config(_))));
    }

    #[tokio::test]
    async fn test_open_in_memory_store() {
        let store = StoreConfig::default().open().await.unwrap();
        assert!(store.get_document("missing").await.unwrap().is_none());
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_open_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("docflow.db").display());
        let config = StoreConfig {
            url: Some(url),
            ..StoreConfig::default()
        };
        let store = config.open().await.unwrap();
        assert!(store.list_errors("doc-1").await.unwrap().is_empty());
    }
}
