//! Extraction strategy routing.
//!
//! Each scraping job runs in one of three modes: `legacy` (schema-free
//! default prompt), `manual` (operator-picked domain) or `auto_detect`
//! (classifier-picked domain). The router materializes the concrete
//! strategy and, for auto-detection, persists the classification outcome
//! back onto the job so re-runs are reproducible.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use kmapper_core::{DomainError, TenantId};

use crate::classifier::ContentClassifier;
use crate::domains::{
    ConfidenceThresholds, DomainPromptGenerator, DomainSchema, DomainSchemaRegistry,
};

/// Strategy setting on a scraping job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    Legacy,
    Manual,
    AutoDetect,
}

impl ExtractionMode {
    /// Parse a job setting; unknown values fall back to `Legacy` with a
    /// warning.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "legacy" => ExtractionMode::Legacy,
            "manual" => ExtractionMode::Manual,
            "auto_detect" => ExtractionMode::AutoDetect,
            other => {
                warn!(value = other, "unknown extraction strategy, falling back to legacy");
                ExtractionMode::Legacy
            }
        }
    }
}

/// Reproducibility snapshot stored on the job after domain resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub domain_id: String,
    pub version: u32,
    pub entity_type_ids: Vec<String>,
    pub relationship_type_ids: Vec<String>,
    pub confidence_thresholds: ConfidenceThresholds,
}

impl SchemaSnapshot {
    pub fn of(schema: &DomainSchema) -> Self {
        Self {
            domain_id: schema.domain_id.clone(),
            version: schema.version,
            entity_type_ids: schema.entity_types.iter().map(|t| t.id.clone()).collect(),
            relationship_type_ids: schema
                .relationship_types
                .iter()
                .map(|t| t.id.clone())
                .collect(),
            confidence_thresholds: schema.confidence_thresholds,
        }
    }
}

/// The materialized strategy handed to the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionStrategy {
    pub mode: ExtractionMode,
    /// `None` for the legacy sentinel (extractor uses its default prompt).
    pub domain_id: Option<String>,
    pub system_prompt: Option<String>,
    pub output_schema: Option<JsonValue>,
    pub thresholds: Option<ConfidenceThresholds>,
}

impl ExtractionStrategy {
    /// Sentinel telling the extractor to use its schema-free default.
    pub fn legacy() -> Self {
        Self {
            mode: ExtractionMode::Legacy,
            domain_id: None,
            system_prompt: None,
            output_schema: None,
            thresholds: None,
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.mode == ExtractionMode::Legacy
    }
}

/// The adaptive-extraction slice of a scraping job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapingJobView {
    pub job_id: Uuid,
    pub tenant_id: TenantId,
    pub mode: ExtractionMode,
    pub content_domain: Option<String>,
    pub classification_confidence: Option<f64>,
    pub schema_snapshot: Option<SchemaSnapshot>,
}

/// Classification outcome written back onto the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationUpdate {
    pub content_domain: String,
    pub classification_confidence: f64,
    pub schema_snapshot: SchemaSnapshot,
}

/// Persists classification results onto the owning job.
#[async_trait]
pub trait JobUpdater: Send + Sync {
    async fn update(&self, job_id: Uuid, update: ClassificationUpdate) -> Result<(), DomainError>;
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("manual strategy requires a content_domain on the job")]
    MissingDomain,

    #[error("unknown content domain '{0}'")]
    UnknownDomain(String),
}

/// Picks and materializes the extraction strategy for a job.
pub struct ExtractionStrategyRouter {
    registry: Arc<DomainSchemaRegistry>,
    classifier: Arc<ContentClassifier>,
    generator: DomainPromptGenerator,
    updater: Option<Arc<dyn JobUpdater>>,
}

impl ExtractionStrategyRouter {
    pub fn new(registry: Arc<DomainSchemaRegistry>, classifier: Arc<ContentClassifier>) -> Self {
        Self {
            registry,
            classifier,
            generator: DomainPromptGenerator::new(),
            updater: None,
        }
    }

    /// Install the callback used to persist auto-detect results.
    pub fn with_job_updater(mut self, updater: Arc<dyn JobUpdater>) -> Self {
        self.updater = Some(updater);
        self
    }

    /// Route a job to its extraction strategy.
    ///
    /// `content_sample` is only consulted for unresolved auto-detect jobs.
    pub async fn route(
        &self,
        job: &ScrapingJobView,
        content_sample: &str,
    ) -> Result<ExtractionStrategy, StrategyError> {
        match job.mode {
            ExtractionMode::Legacy => Ok(ExtractionStrategy::legacy()),
            ExtractionMode::Manual => {
                let domain = job
                    .content_domain
                    .as_deref()
                    .ok_or(StrategyError::MissingDomain)?;
                self.build_from_domain(ExtractionMode::Manual, domain)
            }
            ExtractionMode::AutoDetect => {
                if let Some(domain) = job.content_domain.as_deref() {
                    // Domain already resolved on a previous run.
                    return self.build_from_domain(ExtractionMode::AutoDetect, domain);
                }
                self.auto_detect(job, content_sample).await
            }
        }
    }

    async fn auto_detect(
        &self,
        job: &ScrapingJobView,
        content_sample: &str,
    ) -> Result<ExtractionStrategy, StrategyError> {
        let result = self
            .classifier
            .classify(content_sample, Some(job.tenant_id))
            .await;

        info!(
            job_id = %job.job_id,
            domain = %result.domain,
            confidence = result.confidence,
            "auto-detect classification"
        );

        let strategy = self.build_from_domain(ExtractionMode::AutoDetect, &result.domain)?;

        if let (Some(updater), Ok(schema)) =
            (&self.updater, self.registry.get_schema(&result.domain))
        {
            let update = ClassificationUpdate {
                content_domain: result.domain.clone(),
                classification_confidence: result.confidence,
                schema_snapshot: SchemaSnapshot::of(&schema),
            };
            if let Err(err) = updater.update(job.job_id, update).await {
                // The strategy is still usable this run; the next run will
                // classify again.
                warn!(job_id = %job.job_id, error = %err, "failed to persist classification onto job");
            }
        }

        Ok(strategy)
    }

    fn build_from_domain(
        &self,
        mode: ExtractionMode,
        domain_id: &str,
    ) -> Result<ExtractionStrategy, StrategyError> {
        let schema = self
            .registry
            .get_schema(domain_id)
            .map_err(|_| StrategyError::UnknownDomain(domain_id.to_string()))?;

        Ok(ExtractionStrategy {
            mode,
            domain_id: Some(schema.domain_id.clone()),
            system_prompt: Some(self.generator.system_prompt(&schema)),
            output_schema: Some(self.generator.output_schema(&schema)),
            thresholds: Some(schema.confidence_thresholds),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmapper_inference::{InferenceProvider, InferenceRequest, InferenceResponse, ProviderError};
    use std::sync::Mutex;

    use crate::domains::schema::{ConfidenceThresholds, DomainSchema};

    struct CannedProvider(String);

    #[async_trait]
    impl InferenceProvider for CannedProvider {
        async fn infer(
            &self,
            _request: InferenceRequest,
        ) -> Result<InferenceResponse, ProviderError> {
            Ok(InferenceResponse {
                content: self.0.clone(),
                model: "test".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingUpdater {
        updates: Mutex<Vec<(Uuid, ClassificationUpdate)>>,
    }

    #[async_trait]
    impl JobUpdater for RecordingUpdater {
        async fn update(
            &self,
            job_id: Uuid,
            update: ClassificationUpdate,
        ) -> Result<(), DomainError> {
            self.updates.lock().unwrap().push((job_id, update));
            Ok(())
        }
    }

    fn registry() -> Arc<DomainSchemaRegistry> {
        let mk = |id: &str| DomainSchema {
            domain_id: id.to_string(),
            display_name: id.to_string(),
            version: 3,
            description: format!("{id} docs"),
            entity_types: vec![],
            relationship_types: vec![],
            confidence_thresholds: ConfidenceThresholds::default(),
        };
        Arc::new(DomainSchemaRegistry::from_schemas(vec![
            mk("encyclopedia_wiki"),
            mk("software_docs"),
        ]))
    }

    fn router_with(
        response: &str,
        updater: Option<Arc<dyn JobUpdater>>,
    ) -> ExtractionStrategyRouter {
        let registry = registry();
        let classifier = Arc::new(ContentClassifier::new(
            Arc::new(CannedProvider(response.to_string())),
            registry.clone(),
        ));
        let mut router = ExtractionStrategyRouter::new(registry, classifier);
        if let Some(updater) = updater {
            router = router.with_job_updater(updater);
        }
        router
    }

    fn job(mode: ExtractionMode, content_domain: Option<&str>) -> ScrapingJobView {
        ScrapingJobView {
            job_id: Uuid::now_v7(),
            tenant_id: TenantId::new(),
            mode,
            content_domain: content_domain.map(str::to_string),
            classification_confidence: None,
            schema_snapshot: None,
        }
    }

    fn sample() -> String {
        "Rust is a systems programming language focused on safety and speed. ".repeat(5)
    }

    #[tokio::test]
    async fn legacy_returns_sentinel() {
        let router = router_with("{}", None);
        let strategy = router
            .route(&job(ExtractionMode::Legacy, None), &sample())
            .await
            .unwrap();

        assert!(strategy.is_legacy());
        assert!(strategy.system_prompt.is_none());
    }

    #[tokio::test]
    async fn manual_requires_domain() {
        let router = router_with("{}", None);
        let err = router
            .route(&job(ExtractionMode::Manual, None), &sample())
            .await
            .unwrap_err();
        assert!(matches!(err, StrategyError::MissingDomain));
    }

    #[tokio::test]
    async fn manual_builds_prompt_and_schema() {
        let router = router_with("{}", None);
        let strategy = router
            .route(&job(ExtractionMode::Manual, Some("software_docs")), &sample())
            .await
            .unwrap();

        assert_eq!(strategy.domain_id.as_deref(), Some("software_docs"));
        assert!(strategy.system_prompt.is_some());
        assert!(strategy.output_schema.is_some());
    }

    #[tokio::test]
    async fn manual_with_unknown_domain_errors() {
        let router = router_with("{}", None);
        let err = router
            .route(&job(ExtractionMode::Manual, Some("cooking")), &sample())
            .await
            .unwrap_err();
        assert!(matches!(err, StrategyError::UnknownDomain(_)));
    }

    #[tokio::test]
    async fn auto_detect_classifies_and_persists_snapshot() {
        let updater = Arc::new(RecordingUpdater::default());
        let router = router_with(
            r#"{"domain": "software_docs", "confidence": 0.9, "reasoning": "code"}"#,
            Some(updater.clone()),
        );

        let strategy = router
            .route(&job(ExtractionMode::AutoDetect, None), &sample())
            .await
            .unwrap();

        assert_eq!(strategy.domain_id.as_deref(), Some("software_docs"));

        let updates = updater.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.content_domain, "software_docs");
        assert_eq!(updates[0].1.schema_snapshot.version, 3);
    }

    #[tokio::test]
    async fn auto_detect_low_confidence_still_returns_fallback_strategy() {
        let router = router_with(
            r#"{"domain": "software_docs", "confidence": 0.2}"#,
            None,
        );

        let strategy = router
            .route(&job(ExtractionMode::AutoDetect, None), &sample())
            .await
            .unwrap();

        assert_eq!(strategy.domain_id.as_deref(), Some("encyclopedia_wiki"));
    }

    #[tokio::test]
    async fn auto_detect_with_resolved_domain_skips_classification() {
        // Classifier would pick software_docs; the resolved domain wins.
        let router = router_with(
            r#"{"domain": "software_docs", "confidence": 0.95}"#,
            None,
        );

        let strategy = router
            .route(
                &job(ExtractionMode::AutoDetect, Some("encyclopedia_wiki")),
                &sample(),
            )
            .await
            .unwrap();

        assert_eq!(strategy.domain_id.as_deref(), Some("encyclopedia_wiki"));
    }

    #[test]
    fn unknown_mode_parses_to_legacy() {
        assert_eq!(ExtractionMode::parse_lenient("fancy"), ExtractionMode::Legacy);
        assert_eq!(
            ExtractionMode::parse_lenient("auto_detect"),
            ExtractionMode::AutoDetect
        );
    }
}
