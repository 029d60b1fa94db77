//! [`ScriptedReasoner`] – a [`ReasoningService`] that replays canned replies.
//!
//! Used by tests and offline runs.  Replies are consumed in FIFO order; an
//! empty queue answers with [`LlmError::BadResponse`].  An optional per-call
//! delay emulates a slow service so timeout handling can be exercised.
//!
//! # Example
//!
//! ```rust
//! use subnav_runtime::llm_driver::{ReasoningRequest, ReasoningService};
//! use subnav_runtime::scripted::ScriptedReasoner;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let reasoner = ScriptedReasoner::new().reply("{\"ok\": true}");
//! let text = reasoner.complete(&ReasoningRequest::new("", "hi")).await.unwrap();
//! assert_eq!(text, "{\"ok\": true}");
//! assert_eq!(reasoner.calls().await, 1);
//! # }
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::llm_driver::{LlmError, ReasoningRequest, ReasoningService};

enum Scripted {
    Reply(String),
    Failure(String),
}

/// Canned-reply reasoning service.
#[derive(Default)]
pub struct ScriptedReasoner {
    queue: Mutex<VecDeque<Scripted>>,
    prompts: Mutex<Vec<String>>,
    image_counts: Mutex<Vec<usize>>,
    delay: Option<Duration>,
}

impl ScriptedReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply text.
    pub fn reply(mut self, text: impl Into<String>) -> Self {
        self.queue.get_mut().push_back(Scripted::Reply(text.into()));
        self
    }

    /// Queue a transport failure.
    pub fn failure(mut self, message: impl Into<String>) -> Self {
        self.queue
            .get_mut()
            .push_back(Scripted::Failure(message.into()));
        self
    }

    /// Sleep this long before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a reply on a shared reasoner.
    pub async fn push_reply(&self, text: impl Into<String>) {
        self.queue.lock().await.push_back(Scripted::Reply(text.into()));
    }

    /// Number of calls received so far.
    pub async fn calls(&self) -> usize {
        self.prompts.lock().await.len()
    }

    /// User prompts received so far, in call order.
    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }

    /// Images attached to each call, in call order.
    pub async fn image_counts(&self) -> Vec<usize> {
        self.image_counts.lock().await.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.queue.lock().await.len()
    }
}

#[async_trait]
impl ReasoningService for ScriptedReasoner {
    async fn complete(&self, request: &ReasoningRequest) -> Result<String, LlmError> {
        self.prompts.lock().await.push(request.prompt.clone());
        self.image_counts.lock().await.push(request.images.len());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.queue.lock().await.pop_front() {
            Some(Scripted::Reply(text)) => Ok(text),
            Some(Scripted::Failure(msg)) => Err(LlmError::BadResponse(msg)),
            None => Err(LlmError::BadResponse("no scripted reply left".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replies_in_fifo_order() {
        let r = ScriptedReasoner::new().reply("a").failure("down").reply("b");
        let req = ReasoningRequest::new("", "p");
        assert_eq!(r.complete(&req).await.unwrap(), "a");
        assert!(r.complete(&req).await.is_err());
        assert_eq!(r.complete(&req).await.unwrap(), "b");
        assert!(r.complete(&req).await.is_err());
        assert_eq!(r.calls().await, 4);
    }

    #[tokio::test]
    async fn records_prompts() {
        let r = ScriptedReasoner::new().reply("x");
        r.complete(&ReasoningRequest::new("sys", "first")).await.unwrap();
        assert_eq!(r.prompts().await, vec!["first".to_string()]);
        assert_eq!(r.image_counts().await, vec![0]);
        assert_eq!(r.remaining().await, 0);
    }

    #[tokio::test]
    async fn push_reply_on_shared_handle() {
        let r = std::sync::Arc::new(ScriptedReasoner::new());
        r.push_reply("late").await;
        assert_eq!(
            r.complete(&ReasoningRequest::new("", "p")).await.unwrap(),
            "late"
        );
    }
}
