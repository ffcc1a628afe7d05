//! Intervention chain (spec §4.6).
//!
//! Each registered handler sees every send, publish, and response before
//! delivery, in registration order, and may rewrite or veto it. A `Drop`
//! outcome stops the chain; later handlers do not see a dropped message.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::error::Result;
use crate::ids::AgentId;

/// Handler outcome. There is no "return nothing" case — unlike the
/// dynamically typed original, a Rust handler either returns a value or
/// explicitly drops. [`InterventionOutcome::Keep`] of [`Value::Null`] is
/// still accepted and, if it changed a non-null message, is treated as "no
/// change" with a warning logged, preserving that edge case from the
/// original contract.
pub enum InterventionOutcome {
    Keep(Value),
    Drop,
}

#[async_trait]
pub trait InterventionHandler: Send + Sync {
    async fn on_send(
        &self,
        message: Value,
        recipient: &AgentId,
    ) -> Result<InterventionOutcome>;

    async fn on_publish(&self, message: Value) -> Result<InterventionOutcome>;

    async fn on_response(
        &self,
        message: Value,
        sender: &AgentId,
        recipient: Option<&AgentId>,
    ) -> Result<InterventionOutcome>;
}

/// Passes every message through unchanged. Intended as a base to override
/// selectively, the way the original's `DefaultInterventionHandler` is
/// meant to be subclassed.
#[derive(Default)]
pub struct DefaultInterventionHandler;

#[async_trait]
impl InterventionHandler for DefaultInterventionHandler {
    async fn on_send(&self, message: Value, _recipient: &AgentId) -> Result<InterventionOutcome> {
        Ok(InterventionOutcome::Keep(message))
    }

    async fn on_publish(&self, message: Value) -> Result<InterventionOutcome> {
        Ok(InterventionOutcome::Keep(message))
    }

    async fn on_response(
        &self,
        message: Value,
        _sender: &AgentId,
        _recipient: Option<&AgentId>,
    ) -> Result<InterventionOutcome> {
        Ok(InterventionOutcome::Keep(message))
    }
}

/// Ordered list of handlers, applied left to right. A handler that errors
/// is logged and treated as a drop, rather than killing the runtime.
///
/// Handlers are stored as `Arc` behind a `RwLock` rather than requiring
/// `&mut self`, so a running [`crate::runtime::AgentRuntime`] can register
/// one at any point — the same way [`crate::subscription::SubscriptionRegistry`]
/// allows adding subscriptions after the runtime has started. Dispatch
/// snapshots the handler list under the lock and releases it before
/// running any handler, so a concurrent `push` never blocks in-flight
/// dispatch nor is itself blocked by it.
#[derive(Default)]
pub struct InterventionChain {
    handlers: RwLock<Vec<Arc<dyn InterventionHandler>>>,
}

impl InterventionChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, handler: Arc<dyn InterventionHandler>) {
        self.handlers.write().unwrap().push(handler);
    }

    fn snapshot(&self) -> Vec<Arc<dyn InterventionHandler>> {
        self.handlers.read().unwrap().clone()
    }

    /// Runs the send hook across every handler. Returns `None` if any
    /// handler dropped the message.
    pub async fn on_send(&self, mut message: Value, recipient: &AgentId) -> Option<Value> {
        for handler in self.snapshot() {
            let original = message.clone();
            match handler.on_send(message, recipient).await {
                Ok(InterventionOutcome::Keep(next)) => {
                    message = Self::resolve_null(next, original);
                }
                Ok(InterventionOutcome::Drop) => return None,
                Err(err) => {
                    warn!(error = %err, "intervention handler on_send failed, dropping message");
                    return None;
                }
            }
        }
        Some(message)
    }

    pub async fn on_publish(&self, mut message: Value) -> Option<Value> {
        for handler in self.snapshot() {
            let original = message.clone();
            match handler.on_publish(message).await {
                Ok(InterventionOutcome::Keep(next)) => {
                    message = Self::resolve_null(next, original);
                }
                Ok(InterventionOutcome::Drop) => return None,
                Err(err) => {
                    warn!(error = %err, "intervention handler on_publish failed, dropping message");
                    return None;
                }
            }
        }
        Some(message)
    }

    pub async fn on_response(
        &self,
        mut message: Value,
        sender: &AgentId,
        recipient: Option<&AgentId>,
    ) -> Option<Value> {
        for handler in self.snapshot() {
            let original = message.clone();
            match handler.on_response(message, sender, recipient).await {
                Ok(InterventionOutcome::Keep(next)) => {
                    message = Self::resolve_null(next, original);
                }
                Ok(InterventionOutcome::Drop) => return None,
                Err(err) => {
                    warn!(error = %err, "intervention handler on_response failed, dropping message");
                    return None;
                }
            }
        }
        Some(message)
    }

    fn resolve_null(next: Value, original: Value) -> Value {
        if next.is_null() && !original.is_null() {
            warn!("intervention handler returned null; treating as no change");
            original
        } else {
            next
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Uppercase;

    #[async_trait]
    impl InterventionHandler for Uppercase {
        async fn on_send(&self, message: Value, _recipient: &AgentId) -> Result<InterventionOutcome> {
            let text = message.as_str().unwrap_or_default().to_uppercase();
            Ok(InterventionOutcome::Keep(json!(text)))
        }

        async fn on_publish(&self, message: Value) -> Result<InterventionOutcome> {
            Ok(InterventionOutcome::Keep(message))
        }

        async fn on_response(
            &self,
            message: Value,
            _sender: &AgentId,
            _recipient: Option<&AgentId>,
        ) -> Result<InterventionOutcome> {
            Ok(InterventionOutcome::Keep(message))
        }
    }

    struct DropEverything;

    #[async_trait]
    impl InterventionHandler for DropEverything {
        async fn on_send(&self, _message: Value, _recipient: &AgentId) -> Result<InterventionOutcome> {
            Ok(InterventionOutcome::Drop)
        }

        async fn on_publish(&self, _message: Value) -> Result<InterventionOutcome> {
            Ok(InterventionOutcome::Drop)
        }

        async fn on_response(
            &self,
            _message: Value,
            _sender: &AgentId,
            _recipient: Option<&AgentId>,
        ) -> Result<InterventionOutcome> {
            Ok(InterventionOutcome::Drop)
        }
    }

    fn agent(key: &str) -> AgentId {
        AgentId::new("echo", key).unwrap()
    }

    #[tokio::test]
    async fn chain_applies_handlers_in_order() {
        let chain = InterventionChain::new();
        chain.push(Arc::new(Uppercase));
        let result = chain.on_send(json!("hi"), &agent("1")).await;
        assert_eq!(result, Some(json!("HI")));
    }

    #[tokio::test]
    async fn drop_short_circuits_the_chain() {
        let chain = InterventionChain::new();
        chain.push(Arc::new(DropEverything));
        chain.push(Arc::new(Uppercase));
        assert_eq!(chain.on_send(json!("hi"), &agent("1")).await, None);
    }

    #[tokio::test]
    async fn default_handler_passes_message_through() {
        let chain = InterventionChain::new();
        chain.push(Arc::new(DefaultInterventionHandler));
        assert_eq!(chain.on_publish(json!({"a": 1})).await, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn null_return_is_treated_as_no_change() {
        struct ReturnsNull;
        #[async_trait]
        impl InterventionHandler for ReturnsNull {
            async fn on_send(&self, _message: Value, _recipient: &AgentId) -> Result<InterventionOutcome> {
                Ok(InterventionOutcome::Keep(Value::Null))
            }
            async fn on_publish(&self, _message: Value) -> Result<InterventionOutcome> {
                Ok(InterventionOutcome::Keep(Value::Null))
            }
            async fn on_response(
                &self,
                _message: Value,
                _sender: &AgentId,
                _recipient: Option<&AgentId>,
            ) -> Result<InterventionOutcome> {
                Ok(InterventionOutcome::Keep(Value::Null))
            }
        }

        let chain = InterventionChain::new();
        chain.push(Arc::new(ReturnsNull));
        let result = chain.on_send(json!("hi"), &agent("1")).await;
        assert_eq!(result, Some(json!("hi")));
    }
}
