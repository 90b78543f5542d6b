//! Ordered, validated list of stage processors.

use std::collections::HashSet;
use std::sync::Arc;

use crate::core::Document;
use crate::errors::PipelineValidationError;
use crate::stages::StageProcessor;

/// The fixed stage sequence documents run through.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    name: String,
    stages: Vec<Arc<dyn StageProcessor>>,
}

impl PipelineDefinition {
    /// Starts a builder.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage names in execution order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    /// Looks up the processor of a stage.
    #[must_use]
    pub fn processor(&self, stage: &str) -> Option<&Arc<dyn StageProcessor>> {
        self.stages.iter().find(|s| s.name() == stage)
    }

    /// Processors in execution order.
    pub fn processors(&self) -> impl Iterator<Item = &Arc<dyn StageProcessor>> {
        self.stages.iter()
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false; empty pipelines are rejected by the builder.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Creates a document that requires every stage of this pipeline.
    #[must_use]
    pub fn document(&self, id: impl Into<String>) -> Document {
        Document::new(id, self.stage_names())
    }
}

/// Builder for [`PipelineDefinition`].
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    stages: Vec<Arc<dyn StageProcessor>>,
    names: HashSet<String>,
}

impl PipelineBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Appends a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or already used.
    pub fn stage(mut self, processor: Arc<dyn StageProcessor>) -> Result<Self, PipelineValidationError> {
        let name = processor.name().to_string();
        if name.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage name cannot be empty"));
        }
        if !self.names.insert(name.clone()) {
            return Err(
                PipelineValidationError::new(format!("Duplicate stage '{name}' in pipeline '{}'", self.name))
                    .with_stages(vec![name]),
            );
        }
        self.stages.push(processor);
        Ok(self)
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if no stages were added.
    pub fn build(self) -> Result<PipelineDefinition, PipelineValidationError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new(format!(
                "Pipeline '{}' has no stages",
                self.name
            )));
        }
        Ok(PipelineDefinition {
            name: self.name,
            stages: self.stages,
        })
    }
}
