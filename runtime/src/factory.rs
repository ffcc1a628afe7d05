//! Agent factory table and instantiation context (spec §4.5).
//!
//! Factories are registered under a `type` key and invoked with no
//! arguments; while a factory runs, a task-local exposes the `AgentId` that
//! motivated the instantiation so the constructor can capture it without
//! the runtime threading it through every call site. This mirrors the
//! original implementation's context-var-based `AgentInstantiationContext`,
//! translated to Rust's task-scoped equivalent.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::agent::AnyAgent;
use crate::error::{Result, RuntimeError};
use crate::ids::AgentId;
use crate::subscription::TypePrefixSubscription;

tokio::task_local! {
    static CURRENT_AGENT_ID: AgentId;
}

/// Scoped accessor for the agent id being constructed. Only meaningful
/// inside a factory invocation; returns an error outside of one, matching
/// the original's `RuntimeError` on out-of-context access.
pub struct InstantiationContext;

impl InstantiationContext {
    pub fn current_agent_id() -> Result<AgentId> {
        CURRENT_AGENT_ID
            .try_with(|id| id.clone())
            .map_err(|_| RuntimeError::Validation("not running inside an agent instantiation context".into()))
    }

    pub fn is_in_factory_call() -> bool {
        CURRENT_AGENT_ID.try_with(|_| ()).is_ok()
    }

    async fn scoped<F, T>(agent_id: AgentId, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        CURRENT_AGENT_ID.scope(agent_id, fut).await
    }
}

type BoxedAgent = Box<dyn AnyAgent>;

/// Object-safe factory: given an `AgentId` (made available via the
/// instantiation context during the call), produce a boxed agent.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn create(&self, agent_id: AgentId) -> Result<BoxedAgent>;
}

/// Adapts any `Fn() -> Future<Output = Result<A>>` closure into an
/// [`AgentFactory`], running it inside the instantiation-context scope so
/// the closure body can call [`InstantiationContext::current_agent_id`].
pub struct ClosureFactory<F> {
    f: F,
}

impl<F, Fut, A> ClosureFactory<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<A>> + Send + 'static,
    A: AnyAgent + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut, A> AgentFactory for ClosureFactory<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<A>> + Send + 'static,
    A: AnyAgent + 'static,
{
    async fn create(&self, agent_id: AgentId) -> Result<BoxedAgent> {
        let fut = (self.f)();
        InstantiationContext::scoped(agent_id, async move {
            let agent = fut.await?;
            Ok(Box::new(agent) as BoxedAgent)
        })
        .await
    }
}

/// Table of registered factories, keyed by agent type. Registration is
/// append-only: a duplicate type name is rejected.
#[derive(Default)]
pub struct AgentFactoryTable {
    factories: RwLock<HashMap<String, Arc<dyn AgentFactory>>>,
}

impl AgentFactoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent_type: impl Into<String>, factory: Arc<dyn AgentFactory>) -> Result<()> {
        let agent_type = agent_type.into();
        let mut factories = self.factories.write().unwrap();
        if factories.contains_key(&agent_type) {
            return Err(RuntimeError::Validation(format!(
                "factory already registered for type: {agent_type}"
            )));
        }
        factories.insert(agent_type, factory);
        Ok(())
    }

    pub fn is_registered(&self, agent_type: &str) -> bool {
        self.factories.read().unwrap().contains_key(agent_type)
    }

    /// Instantiates the agent for `agent_id` via its type's factory. Callers
    /// are responsible for installing the direct-message subscription
    /// returned by [`direct_message_subscription`] once, at registration
    /// time, not on every instantiation.
    pub async fn instantiate(&self, agent_id: AgentId) -> Result<BoxedAgent> {
        let factory = {
            let factories = self.factories.read().unwrap();
            factories
                .get(agent_id.r#type())
                .cloned()
                .ok_or_else(|| RuntimeError::Lookup(format!("no factory registered for type: {}", agent_id.r#type())))?
        };
        factory.create(agent_id).await
    }
}

/// Per §4.5 step 3: every factory registration auto-installs a direct
/// message subscription so well-known per-recipient topics route to the
/// freshly registered type. The prefix MUST include `:` to avoid
/// collisions between agent types that share a common string prefix.
pub fn direct_message_subscription(agent_type: &str) -> TypePrefixSubscription {
    TypePrefixSubscription::new(format!("{agent_type}:"), agent_type)
}
