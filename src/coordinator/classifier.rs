// ABOUTME: Classifies free-text executor errors into ErrorKind values.
// ABOUTME: The upstream tool has no quota API, so error text is the only signal.

use regex::{RegexSet, RegexSetBuilder};

use crate::config::DEFAULT_RATE_LIMIT_PATTERNS;
use crate::error::{ConfigError, ErrorKind};

/// Maps an executor's raw error message to a failure kind.
pub trait ErrorClassifier: Send + Sync {
    /// Classify a raw error message. Anything that is not a rate limit is an
    /// `ExecutorFailure`.
    fn classify(&self, message: &str) -> ErrorKind;

    /// Convenience check for the rate-limit kind.
    fn is_rate_limit(&self, message: &str) -> bool {
        self.classify(message) == ErrorKind::TransientUpstreamRateLimit
    }
}

/// Case-insensitive regex matching against a set of rate-limit patterns.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    patterns: RegexSet,
}

impl PatternClassifier {
    /// Build a classifier from regex patterns.
    pub fn new<I, S>(patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = RegexSetBuilder::new(patterns)
            .case_insensitive(true)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("rate limit pattern: {}", e)))?;
        Ok(Self { patterns })
    }

    /// Number of patterns in the set.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT_PATTERNS).expect("default rate limit patterns compile")
    }
}

impl ErrorClassifier for PatternClassifier {
    fn classify(&self, message: &str) -> ErrorKind {
        if self.patterns.is_match(message) {
            ErrorKind::TransientUpstreamRateLimit
        } else {
            ErrorKind::ExecutorFailure
        }
    }
}
