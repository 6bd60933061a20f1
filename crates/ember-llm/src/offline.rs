//! Completion services that never touch the network

use crate::provider::{CompletionError, CompletionResult, CompletionService};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Always unavailable. The slow loop degrades to a no-op decision every cycle.
#[derive(Debug, Default)]
pub struct OfflineCompletion;

#[async_trait]
impl CompletionService for OfflineCompletion {
    fn name(&self) -> &str {
        "offline"
    }

    async fn complete(&self, _prompt: &str, _timeout: Duration) -> CompletionResult<String> {
        Err(CompletionError::Unavailable("offline provider".into()))
    }
}

/// One scripted response.
#[derive(Clone, Debug)]
pub enum ScriptedReply {
    Text(String),
    Fail(String),
    /// Answer after a delay. Times out if the delay exceeds the caller's budget.
    Delayed(Duration, String),
    /// Never answers; always runs into the caller's timeout.
    Hang,
}

impl ScriptedReply {
    pub fn text(s: impl Into<String>) -> Self {
        ScriptedReply::Text(s.into())
    }
}

/// Replays a queue of replies in order, then repeats the last one.
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<ScriptedReply>>,
    last: Mutex<Option<ScriptedReply>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedCompletion {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            last: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received so far, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn next_reply(&self) -> Option<ScriptedReply> {
        let mut queue = self.replies.lock().unwrap_or_else(|e| e.into_inner());
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(reply) = queue.pop_front() {
            *last = Some(reply.clone());
            return Some(reply);
        }
        last.clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &str, timeout: Duration) -> CompletionResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());

        match self.next_reply() {
            None => Err(CompletionError::Unavailable("script is empty".into())),
            Some(ScriptedReply::Text(text)) => Ok(text),
            Some(ScriptedReply::Fail(reason)) => Err(CompletionError::RequestFailed(reason)),
            Some(ScriptedReply::Delayed(delay, text)) => {
                tokio::time::timeout(timeout, tokio::time::sleep(delay))
                    .await
                    .map_err(|_| CompletionError::Timeout(timeout))?;
                Ok(text)
            }
            Some(ScriptedReply::Hang) => {
                tokio::time::sleep(timeout).await;
                Err(CompletionError::Timeout(timeout))
            }
        }
    }
}
