//! Documents and the standard ingestion stage catalogue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The fixed document-processing stages, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StandardStage {
    /// Upload validation.
    Upload,
    /// Text extraction (including OCR).
    TextExtraction,
    /// Image and vision analysis.
    ImageProcessing,
    /// Document classification.
    Classification,
    /// Metadata and entity extraction.
    MetadataExtraction,
    /// Artifact storage.
    Storage,
    /// Embedding generation.
    Embedding,
    /// Search indexing.
    SearchIndexing,
}

impl StandardStage {
    /// All standard stages in declared order.
    pub const ALL: [Self; 8] = [
        Self::Upload,
        Self::TextExtraction,
        Self::ImageProcessing,
        Self::Classification,
        Self::MetadataExtraction,
        Self::Storage,
        Self::Embedding,
        Self::SearchIndexing,
    ];

    /// Returns the stage name used as a key in the store.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::TextExtraction => "text_extraction",
            Self::ImageProcessing => "image_processing",
            Self::Classification => "classification",
            Self::MetadataExtraction => "metadata_extraction",
            Self::Storage => "storage",
            Self::Embedding => "embedding",
            Self::SearchIndexing => "search_indexing",
        }
    }

    /// Returns the stage names of the default ingestion pipeline.
    #[must_use]
    pub fn default_pipeline() -> Vec<String> {
        Self::ALL.iter().map(|s| s.as_str().to_string()).collect()
    }
}

impl fmt::Display for StandardStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tags used to slice metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentTags {
    /// Equipment manufacturer, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    /// Document type (service manual, parts catalogue, ...), if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
}

impl DocumentTags {
    /// Returns the manufacturer tag or `"unknown"`.
    #[must_use]
    pub fn manufacturer_label(&self) -> &str {
        self.manufacturer.as_deref().unwrap_or("unknown")
    }

    /// Returns the document type tag or `"unknown"`.
    #[must_use]
    pub fn document_type_label(&self) -> &str {
        self.document_type.as_deref().unwrap_or("unknown")
    }
}

/// A document tracked by the pipeline.
///
/// The overall status is not stored here; it is derived from the stage rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Document identifier.
    pub id: String,
    /// Required stage names, in execution order.
    pub stages: Vec<String>,
    /// Metric tags.
    #[serde(default)]
    pub tags: DocumentTags,
    /// When the document was registered.
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Creates a document with an explicit stage list.
    #[must_use]
    pub fn new(id: impl Into<String>, stages: Vec<String>) -> Self {
        Self {
            id: id.into(),
            stages,
            tags: DocumentTags::default(),
            created_at: Utc::now(),
        }
    }

    /// Creates a document that runs the full standard pipeline.
    #[must_use]
    pub fn standard(id: impl Into<String>) -> Self {
        Self::new(id, StandardStage::default_pipeline())
    }

    /// Sets the manufacturer tag.
    #[must_use]
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.tags.manufacturer = Some(manufacturer.into());
        self
    }

    /// Sets the document type tag.
    #[must_use]
    pub fn with_document_type(mut self, document_type: impl Into<String>) -> Self {
        self.tags.document_type = Some(document_type.into());
        self
    }

    /// Returns the position of a stage in the pipeline.
    #[must_use]
    pub fn stage_index(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }
}
