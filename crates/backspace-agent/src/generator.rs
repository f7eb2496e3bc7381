//! The patch generator capability and a scripted implementation for tests

use async_trait::async_trait;
use backspace_core::{BackspaceError, EditSet, JobId, Result};
use backspace_sandbox::FileSnapshot;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Everything a generator sees for one attempt
#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub job_id: JobId,
    /// 1-based attempt number
    pub attempt: u32,
    pub change_description: &'a str,
    pub snapshot: &'a FileSnapshot,
    /// Feedback from the previous attempt (validation output or apply conflict)
    pub prior_diagnostics: Option<&'a str>,
}

/// Produces an edit set for a change description
///
/// Implementations need not bound their own running time; the agent loop
/// wraps every call in a timeout and drops it on cancellation.
#[async_trait]
pub trait PatchGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<EditSet>;
}

/// What the scripted generator does on one call
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Respond(EditSet),
    Fail(String),
}

/// A generation call as the scripted generator observed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub attempt: u32,
    pub change_description: String,
    pub prior_diagnostics: Option<String>,
}

/// Replays a fixed sequence of responses, one per call
///
/// Once the script runs out, the last step repeats.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    steps: Mutex<VecDeque<ScriptStep>>,
    last: Mutex<Option<ScriptStep>>,
    delay: Option<Duration>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, edits: EditSet) -> Self {
        self.push(ScriptStep::Respond(edits))
    }

    pub fn with_failure(self, message: impl Into<String>) -> Self {
        self.push(ScriptStep::Fail(message.into()))
    }

    /// Sleep this long inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn push(self, step: ScriptStep) -> Self {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(step);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn next_step(&self) -> Option<ScriptStep> {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(step) = self
            .steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            *last = Some(step);
        }
        last.clone()
    }
}

#[async_trait]
impl PatchGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<EditSet> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedRequest {
                attempt: request.attempt,
                change_description: request.change_description.to_string(),
                prior_diagnostics: request.prior_diagnostics.map(str::to_string),
            });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_step() {
            Some(ScriptStep::Respond(edits)) => Ok(edits),
            Some(ScriptStep::Fail(message)) => Err(BackspaceError::Generation(message)),
            None => Err(BackspaceError::Generation("no scripted response".to_string())),
        }
    }
}
