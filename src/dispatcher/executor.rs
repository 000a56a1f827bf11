// ABOUTME: Defines the Executor trait - the seam to the scarce shared execution tool.
// ABOUTME: ExecutionResult carries output or error text for the rate-limit classifier.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Outcome of one executor invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    /// Short error summary for callers.
    pub error: Option<String>,
    /// Unparsed error text from the tool, used for classification.
    pub raw_error_message: Option<String>,
}

impl ExecutionResult {
    /// A successful run with its output.
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Self::default()
        }
    }

    /// A failed run; the message doubles as the raw error text.
    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            raw_error_message: Some(error.clone()),
            error: Some(error),
            ..Self::default()
        }
    }

    /// Attach the tool's raw error text.
    pub fn with_raw_error(mut self, raw: impl Into<String>) -> Self {
        self.raw_error_message = Some(raw.into());
        self
    }

    /// Text to classify: the raw message if present, else the summary.
    pub fn error_text(&self) -> &str {
        self.raw_error_message
            .as_deref()
            .or(self.error.as_deref())
            .unwrap_or("")
    }
}

/// Runs one request payload on the shared tool.
///
/// An `Err` counts as a failed run whose error text is the error's message.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn dispatch(&self, payload: &serde_json::Value) -> Result<ExecutionResult, anyhow::Error>;
}
