//! Agent trait and message context (spec §3, §6).

use std::any::Any;

use async_trait::async_trait;
use serde_json::Value;

use crate::cancellation::CancellationToken;
use crate::error::Result;
use crate::ids::{AgentId, TopicId};

/// Descriptive, serializable-friendly agent metadata: `type` and `key`
/// mirror the owning [`AgentId`], `description` is free text supplied at
/// registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMetadata {
    pub r#type: String,
    pub key: String,
    pub description: String,
}

/// Per-message context handed to `on_message`: who sent it (`None` for a
/// runtime-originated call), which topic it arrived on for a publish
/// (`None` for a direct send), whether the sender is blocked on a response,
/// a cancellation token scoped to this single delivery, and a unique
/// message id for tracing/dedup.
#[derive(Clone)]
pub struct MessageContext {
    pub sender: Option<AgentId>,
    pub topic_id: Option<TopicId>,
    pub is_rpc: bool,
    pub cancellation_token: CancellationToken,
    pub message_id: String,
}

/// The unit of execution the runtime schedules. Implementors are produced
/// by an [`crate::factory::AgentFactory`] and own no direct reference to
/// other agents — all cross-agent communication goes back through the
/// runtime handle bound at construction time.
#[async_trait]
pub trait Agent: Send + Sync {
    fn metadata(&self) -> AgentMetadata;
    fn id(&self) -> AgentId;

    /// Handles one message. `message` is one of the types this agent's
    /// subscriptions declared interest in. Returning `Err` surfaces to the
    /// sender for an RPC `send`, and is logged and dropped for a `publish`.
    async fn on_message(&mut self, message: Value, ctx: MessageContext) -> Result<Value>;

    /// Serializes agent state to a JSON value suitable for persistence via
    /// [`crate::runtime::AgentRuntime::save_state`]. Default: no state.
    async fn save_state(&mut self) -> Result<Value> {
        Ok(Value::Object(Default::default()))
    }

    /// Restores state previously produced by `save_state`. Default: no-op.
    async fn load_state(&mut self, _state: Value) -> Result<()> {
        Ok(())
    }

    /// Called once when the runtime that owns this agent is closing.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Type-erased handle used internally by the runtime to call into an agent
/// without knowing its concrete type, while still allowing a caller holding
/// the original factory output to downcast back via [`Any`].
pub trait AnyAgent: Agent {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Agent + 'static> AnyAgent for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
