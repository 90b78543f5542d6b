//! Stage processor output.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The output of one successful stage processor call.
///
/// Outputs are handed to later stages of the same run; anything that must
/// survive a restart is persisted by the processor itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// Output data keyed by name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,
}

impl StageOutput {
    /// Creates an empty output.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates an output with data.
    #[must_use]
    pub fn new(data: HashMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    /// Creates an output with a single value.
    #[must_use]
    pub fn with_value(key: impl Into<String>, value: serde_json::Value) -> Self {
        let mut data = HashMap::new();
        data.insert(key.into(), value);
        Self { data }
    }

    /// Gets a value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }
}
