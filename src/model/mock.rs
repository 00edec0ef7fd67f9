//! Scripted model for deterministic runs without an API.

use super::{Completion, CompletionRequest, LanguageModel, TokenUsage};
use crate::ledger::estimate_tokens;
use crate::{LedgerError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Pre-programmed reply
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Return this text
    Text(String),
    /// Fail the call with a model error
    Error(String),
    /// Wait, then yield the inner reply
    Delay(Duration, Box<ScriptedReply>),
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::Text(value.to_string())
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error(msg.into())
    }

    pub fn delayed(delay: Duration, inner: ScriptedReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Returns scripted replies in order. Once the script runs out, the last
/// reply repeats (or a model error if the script was empty).
pub struct ScriptedModel {
    replies: Vec<ScriptedReply>,
    call_count: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies,
            call_count: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Prompts received so far, oldest first
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn reply_for(&self, index: usize) -> Option<ScriptedReply> {
        self.replies
            .get(index)
            .or_else(|| self.replies.last())
            .cloned()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let index = self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.clone());
        }

        let mut reply = self
            .reply_for(index)
            .ok_or_else(|| LedgerError::Model("script is empty".to_string()))?;

        loop {
            match reply {
                ScriptedReply::Text(text) => {
                    let usage = TokenUsage {
                        input_tokens: estimate_tokens(&request.prompt) as u64,
                        output_tokens: estimate_tokens(&text) as u64,
                    };
                    return Ok(Completion { text, usage });
                }
                ScriptedReply::Error(msg) => return Err(LedgerError::Model(msg)),
                ScriptedReply::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
            }
        }
    }
}
