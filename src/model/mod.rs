//! Language-model boundary
//!
//! Everything the continuity core asks of a model goes through
//! [`LanguageModel::complete`]. [`ModelCaller`] wraps a model with the
//! caller-supplied timeout and usage accounting every call must carry.

mod client;
mod mock;
mod parse;

pub use client::{ChatClient, ParsedResponse};
pub use mock::{ScriptedModel, ScriptedReply};
pub use parse::{extract_json_object, parse_json, strip_code_fences, Parsed};

use crate::{LedgerError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// What a request is for; used for usage accounting and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Purpose {
    Extraction,
    Compression,
    Review,
    Revision,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Compression => "compression",
            Self::Review => "review",
            Self::Revision => "revision",
        }
    }
}

/// One text-completion request
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    /// Ask the provider for a JSON object response when it supports it
    pub json: bool,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            json: false,
            max_tokens: None,
        }
    }

    pub fn json(prompt: impl Into<String>) -> Self {
        Self {
            json: true,
            ..Self::text(prompt)
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Token counts as reported by the provider (or estimated when absent)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

/// A synchronous (request/response) text-completion capability.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

/// Running totals per purpose, reported outward as an observation only.
#[derive(Debug, Default)]
pub struct UsageTally {
    totals: Mutex<BTreeMap<Purpose, (u64, TokenUsage)>>,
}

impl UsageTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, purpose: Purpose, usage: TokenUsage) {
        if let Ok(mut totals) = self.totals.lock() {
            let slot = totals.entry(purpose).or_default();
            slot.0 += 1;
            slot.1.input_tokens += usage.input_tokens;
            slot.1.output_tokens += usage.output_tokens;
        }
    }

    /// Number of calls recorded for `purpose`
    pub fn calls(&self, purpose: Purpose) -> u64 {
        self.totals
            .lock()
            .ok()
            .and_then(|t| t.get(&purpose).map(|(calls, _)| *calls))
            .unwrap_or(0)
    }

    /// `(purpose, calls, usage)` rows, ordered by purpose
    pub fn snapshot(&self) -> Vec<(Purpose, u64, TokenUsage)> {
        self.totals
            .lock()
            .map(|t| t.iter().map(|(p, (c, u))| (*p, *c, *u)).collect())
            .unwrap_or_default()
    }
}

/// A model plus the timeout and accounting every call must carry.
#[derive(Clone)]
pub struct ModelCaller {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
    usage: Arc<UsageTally>,
}

impl ModelCaller {
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self {
            model,
            timeout,
            usage: Arc::new(UsageTally::new()),
        }
    }

    pub fn with_usage(mut self, usage: Arc<UsageTally>) -> Self {
        self.usage = usage;
        self
    }

    pub fn usage(&self) -> Arc<UsageTally> {
        self.usage.clone()
    }

    /// Call the model, bounded by the configured timeout.
    pub async fn call(&self, purpose: Purpose, request: CompletionRequest) -> Result<String> {
        debug!(
            "Calling model '{}' for {} (prompt length: {})",
            self.model.name(),
            purpose.as_str(),
            request.prompt.len()
        );

        let completion = match tokio::time::timeout(self.timeout, self.model.complete(&request)).await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "Model call for {} timed out after {:?}",
                    purpose.as_str(),
                    self.timeout
                );
                return Err(LedgerError::Timeout(self.timeout));
            }
        };

        self.usage.record(purpose, completion.usage);
        debug!(
            purpose = purpose.as_str(),
            input_tokens = completion.usage.input_tokens,
            output_tokens = completion.usage.output_tokens,
            "model usage"
        );
        Ok(completion.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_caller_records_usage() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedReply::text("hello")]));
        let caller = ModelCaller::new(model, Duration::from_secs(5));

        let text = caller
            .call(Purpose::Compression, CompletionRequest::text("hi"))
            .await
            .unwrap();
        assert_eq!(text, "hello");
        assert_eq!(caller.usage().calls(Purpose::Compression), 1);
        assert_eq!(caller.usage().calls(Purpose::Review), 0);
    }

    #[tokio::test]
    async fn test_caller_times_out() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedReply::delayed(
            Duration::from_millis(200),
            ScriptedReply::text("late"),
        )]));
        let caller = ModelCaller::new(model, Duration::from_millis(20));

        let result = caller
            .call(Purpose::Extraction, CompletionRequest::json("x"))
            .await;
        assert!(matches!(result, Err(LedgerError::Timeout(_))));
        assert_eq!(caller.usage().calls(Purpose::Extraction), 0);
    }
}
