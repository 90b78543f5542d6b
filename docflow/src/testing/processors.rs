use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

use crate::core::StageOutput;
use crate::errors::StageError;
use crate::stages::{ProgressReporter, StageInput, StageProcessor};

/// A processor that plays back a script of results.
///
/// Once the script is used up every further call returns the fallback.
#[derive(Debug)]
pub struct ScriptedProcessor {
    name: String,
    script: Mutex<VecDeque<Result<StageOutput, StageError>>>,
    fallback: Result<StageOutput, StageError>,
    delay: Duration,
    attempts: Mutex<Vec<u32>>,
}

impl ScriptedProcessor {
    /// Creates a processor with an empty script that succeeds.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(StageOutput::empty()),
            delay: Duration::ZERO,
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// A processor that always succeeds.
    #[must_use]
    pub fn always_ok(name: impl Into<String>) -> Self {
        Self::new(name)
    }

    /// A processor that always fails with `error`.
    #[must_use]
    pub fn always_fail(name: impl Into<String>, error: StageError) -> Self {
        Self {
            fallback: Err(error),
            ..Self::new(name)
        }
    }

    /// Appends a failure to the script.
    #[must_use]
    pub fn then_fail(self, error: StageError) -> Self {
        self.script.lock().push_back(Err(error));
        self
    }

    /// Appends a success to the script.
    #[must_use]
    pub fn then_ok(self) -> Self {
        self.then_output(StageOutput::empty())
    }

    /// Appends a success with the given output to the script.
    #[must_use]
    pub fn then_output(self, output: StageOutput) -> Self {
        self.script.lock().push_back(Ok(output));
        self
    }

    /// Sleeps this long before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.attempts.lock().len()
    }

    /// Attempt numbers seen, in call order.
    #[must_use]
    pub fn attempts(&self) -> Vec<u32> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl StageProcessor for ScriptedProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        input: &StageInput,
        progress: &ProgressReporter,
    ) -> Result<StageOutput, StageError> {
        self.attempts.lock().push(input.attempt);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        progress.report(50).await;
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// A processor that succeeds and records the inputs it was given.
#[derive(Debug)]
pub struct RecordingProcessor {
    name: String,
    seen: Mutex<Vec<StageInput>>,
}

impl RecordingProcessor {
    /// Creates a new recording processor.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Inputs seen so far.
    #[must_use]
    pub fn inputs(&self) -> Vec<StageInput> {
        self.seen.lock().clone()
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl StageProcessor for RecordingProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        input: &StageInput,
        progress: &ProgressReporter,
    ) -> Result<StageOutput, StageError> {
        self.seen.lock().push(input.clone());
        progress.report(100).await;
        Ok(StageOutput::with_value(
            "processed_by",
            serde_json::json!(self.name),
        ))
    }
}
