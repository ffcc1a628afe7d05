//! The cooperative single-threaded runtime core (spec §4.7, §4.8).
//!
//! Dispatch order is FIFO: envelopes begin processing in enqueue order.
//! Handler *completion* order is unspecified, because each handler task may
//! suspend at its own pace; this is why publish delivery uses
//! `futures::future::join_all` rather than sequential awaits. Each agent
//! instance is wrapped in its own `tokio::sync::Mutex` so that concurrent
//! deliveries to different agents proceed in parallel while deliveries to
//! the *same* agent serialize — the Rust equivalent of the original's
//! single OS thread running one coroutine at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::{AnyAgent, MessageContext};
use crate::cancellation::CancellationToken;
use crate::envelope::{EnvelopeKind, EnvelopeMetadata, MessageEnvelope};
use crate::error::{Result, RuntimeError};
use crate::factory::{direct_message_subscription, AgentFactory, AgentFactoryTable};
use crate::ids::{AgentId, TopicId};
use crate::intervention::{InterventionChain, InterventionHandler};
use crate::serialization::SerializationRegistry;
use crate::subscription::{Subscription, SubscriptionRegistry};

type BoxedAgent = Box<dyn AnyAgent>;
type SharedAgent = Arc<AsyncMutex<BoxedAgent>>;

/// Run state driving the loop's end condition, mirroring `RunContext` in
/// the original implementation. `Until` carries a boxed predicate for
/// `stop_when`.
enum EndCondition {
    Running,
    Cancelled,
    UntilIdle,
    Until(Box<dyn Fn() -> bool + Send + Sync>),
}

struct Inner {
    factories: AgentFactoryTable,
    subscriptions: SubscriptionRegistry,
    serialization: SerializationRegistry,
    intervention: InterventionChain,
    instances: RwLock<HashMap<AgentId, SharedAgent>>,
    /// Per-`AgentId` lock guarding the instantiate-then-insert critical
    /// section in `ensure_instantiated`, so two concurrent resolves of the
    /// same not-yet-created id don't both run the factory. Keyed so
    /// instantiation of distinct ids still proceeds concurrently.
    instantiation_locks: AsyncMutex<HashMap<AgentId, Arc<AsyncMutex<()>>>>,
    queue_tx: mpsc::UnboundedSender<MessageEnvelope>,
    queue_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<MessageEnvelope>>>,
    queue_len: AtomicUsize,
    outstanding: AtomicUsize,
    idle_notify: Notify,
    end_condition: AsyncMutex<EndCondition>,
    driver: AsyncMutex<Option<JoinHandle<()>>>,
}

/// Cheaply cloneable handle to a runtime instance. All clones share the
/// same queue, instance table, and factory table.
#[derive(Clone)]
pub struct AgentRuntime {
    inner: Arc<Inner>,
}

impl AgentRuntime {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                factories: AgentFactoryTable::new(),
                subscriptions: SubscriptionRegistry::new(),
                serialization: SerializationRegistry::new(),
                intervention: InterventionChain::new(),
                instances: RwLock::new(HashMap::new()),
                instantiation_locks: AsyncMutex::new(HashMap::new()),
                queue_tx,
                queue_rx: AsyncMutex::new(Some(queue_rx)),
                queue_len: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
                idle_notify: Notify::new(),
                end_condition: AsyncMutex::new(EndCondition::Running),
                driver: AsyncMutex::new(None),
            }),
        }
    }

    pub fn serialization(&self) -> &SerializationRegistry {
        &self.inner.serialization
    }

    /// Registers a factory under `agent_type` and auto-installs the
    /// direct-message prefix subscription for it (spec §4.5 step 3).
    pub fn register_factory(&self, agent_type: impl Into<String>, factory: Arc<dyn AgentFactory>) -> Result<()> {
        let agent_type = agent_type.into();
        self.inner.factories.register(agent_type.clone(), factory)?;
        let sub = direct_message_subscription(&agent_type);
        self.inner.subscriptions.add_subscription(Box::new(sub))?;
        Ok(())
    }

    pub fn add_subscription(&self, subscription: Box<dyn Subscription>) -> Result<()> {
        self.inner.subscriptions.add_subscription(subscription)
    }

    /// Registers an intervention handler, appended after any already
    /// registered. Safe to call before or after `start`.
    pub fn add_intervention_handler(&self, handler: Arc<dyn InterventionHandler>) {
        self.inner.intervention.push(handler);
    }

    pub fn remove_subscription(&self, id: &str) -> Result<()> {
        self.inner.subscriptions.remove_subscription(id)
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue_len.load(Ordering::SeqCst)
    }

    pub fn outstanding_tasks(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.queue_len() == 0 && self.outstanding_tasks() == 0
    }

    /// Enqueues a `send` envelope and awaits the recipient's handler
    /// return. `MessageContext.is_rpc` is true for the recipient.
    pub async fn send_message(
        &self,
        message: Value,
        recipient: AgentId,
        sender: Option<AgentId>,
        cancellation_token: Option<CancellationToken>,
        message_id: Option<String>,
    ) -> Result<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = MessageEnvelope {
            message,
            cancellation_token: cancellation_token.unwrap_or_default(),
            sender,
            metadata: EnvelopeMetadata::default(),
            message_id: message_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            kind: EnvelopeKind::Send {
                recipient,
                reply: reply_tx,
            },
        };
        self.enqueue(envelope);
        reply_rx
            .await
            .map_err(|_| RuntimeError::Undeliverable("runtime dropped the reply channel".into()))?
    }

    /// Enqueues a `publish` envelope. Returns once enqueued, not once
    /// delivered. `MessageContext.is_rpc` is false for every recipient.
    pub async fn publish_message(
        &self,
        message: Value,
        topic_id: TopicId,
        sender: Option<AgentId>,
        cancellation_token: Option<CancellationToken>,
        message_id: Option<String>,
    ) -> Result<()> {
        let envelope = MessageEnvelope {
            message,
            cancellation_token: cancellation_token.unwrap_or_default(),
            sender,
            metadata: EnvelopeMetadata::default(),
            message_id: message_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            kind: EnvelopeKind::Publish { topic_id },
        };
        self.enqueue(envelope);
        Ok(())
    }

    fn enqueue(&self, envelope: MessageEnvelope) {
        self.inner.queue_len.fetch_add(1, Ordering::SeqCst);
        // The receiver only drops when the driver task is torn down, and we
        // never tear it down while the handle is reachable, so send cannot
        // fail in practice; if it ever does, the envelope is simply lost,
        // the same as publishing into a runtime nobody will ever `start()`.
        let _ = self.inner.queue_tx.send(envelope);
        self.inner.idle_notify.notify_waiters();
    }

    /// Starts the driver loop as a background task. Calling this twice
    /// without an intervening `stop*` is an error.
    pub async fn start(&self) -> Result<()> {
        let mut driver = self.inner.driver.lock().await;
        if driver.is_some() {
            return Err(RuntimeError::Validation("runtime is already started".into()));
        }
        *self.inner.end_condition.lock().await = EndCondition::Running;
        let rx = self
            .inner
            .queue_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| RuntimeError::Validation("runtime queue receiver already taken".into()))?;
        let inner = self.inner.clone();
        *driver = Some(tokio::spawn(Self::run_loop(inner, rx)));
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        *self.inner.end_condition.lock().await = EndCondition::Cancelled;
        self.inner.idle_notify.notify_waiters();
        self.join_driver().await
    }

    pub async fn stop_when_idle(&self) -> Result<()> {
        *self.inner.end_condition.lock().await = EndCondition::UntilIdle;
        self.inner.idle_notify.notify_waiters();
        self.join_driver().await
    }

    pub async fn stop_when<F>(&self, predicate: F) -> Result<()>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        *self.inner.end_condition.lock().await = EndCondition::Until(Box::new(predicate));
        self.inner.idle_notify.notify_waiters();
        self.join_driver().await
    }

    async fn join_driver(&self) -> Result<()> {
        let handle = self
            .inner
            .driver
            .lock()
            .await
            .take()
            .ok_or_else(|| RuntimeError::Validation("runtime is not started".into()))?;
        handle
            .await
            .map_err(|e| RuntimeError::Handler(Box::new(e)))
    }

    async fn run_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<MessageEnvelope>) {
        loop {
            if Self::should_stop(&inner).await {
                return;
            }
            tokio::select! {
                biased;
                maybe_envelope = rx.recv() => {
                    match maybe_envelope {
                        Some(envelope) => {
                            inner.queue_len.fetch_sub(1, Ordering::SeqCst);
                            Self::dispatch(inner.clone(), envelope).await;
                        }
                        None => return,
                    }
                }
                _ = inner.idle_notify.notified() => {}
            }
        }
    }

    async fn should_stop(inner: &Arc<Inner>) -> bool {
        let end_condition = inner.end_condition.lock().await;
        match &*end_condition {
            EndCondition::Running => false,
            EndCondition::Cancelled => true,
            EndCondition::UntilIdle => {
                inner.queue_len.load(Ordering::SeqCst) == 0 && inner.outstanding.load(Ordering::SeqCst) == 0
            }
            EndCondition::Until(predicate) => predicate(),
        }
    }

    async fn dispatch(inner: Arc<Inner>, mut envelope: MessageEnvelope) {
        let message = match &envelope.kind {
            EnvelopeKind::Publish { .. } => inner.intervention.on_publish(envelope.message.clone()).await,
            EnvelopeKind::Send { recipient, .. } => {
                inner.intervention.on_send(envelope.message.clone(), recipient).await
            }
            EnvelopeKind::Response { .. } => {
                let sender = envelope.sender.clone().unwrap_or_else(|| {
                    AgentId::new("unknown", "unknown").expect("static agent id is always valid")
                });
                inner.intervention.on_response(envelope.message.clone(), &sender, None).await
            }
        };
        let message = match message {
            Some(message) => message,
            None => {
                info!(message_id = %envelope.message_id, "envelope dropped by intervention chain");
                return;
            }
        };
        envelope.message = message;

        inner.outstanding.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            Self::handle(inner.clone(), envelope).await;
            inner.outstanding.fetch_sub(1, Ordering::SeqCst);
            inner.idle_notify.notify_waiters();
        });
    }

    async fn handle(inner: Arc<Inner>, envelope: MessageEnvelope) {
        match envelope.kind {
            EnvelopeKind::Send { recipient, reply } => {
                let result = Self::deliver_one(&inner, &recipient, &envelope.message, &envelope, true, None).await;
                let _ = reply.send(result);
            }
            EnvelopeKind::Response { reply, .. } => {
                // Local deliveries never enqueue a Response kind today; this
                // arm exists for symmetry with the wire protocol consumed by
                // the distributed host (spec §4.9/§4.10), which resolves
                // its own pending-request map directly rather than routing
                // back through this queue.
                let _ = reply.send(Err(RuntimeError::Undeliverable(
                    "Response envelopes are not dispatched by the local queue".into(),
                )));
            }
            EnvelopeKind::Publish { topic_id } => {
                let recipients = inner.subscriptions.subscribed_recipients(&topic_id);
                let futures = recipients
                    .into_iter()
                    .filter(|agent_id| Some(agent_id) != envelope.sender.as_ref())
                    .map(|agent_id| {
                        let inner = inner.clone();
                        let envelope_message = envelope.message.clone();
                        let envelope_sender = envelope.sender.clone();
                        let topic_id = topic_id.clone();
                        let cancellation_token = envelope.cancellation_token.clone();
                        let message_id = envelope.message_id.clone();
                        async move {
                            let ctx = MessageContext {
                                sender: envelope_sender,
                                topic_id: Some(topic_id),
                                is_rpc: false,
                                cancellation_token,
                                message_id,
                            };
                            let result = Self::deliver(&inner, &agent_id, envelope_message, ctx).await;
                            if let Err(err) = result {
                                warn!(agent = %agent_id, error = %err, "publish handler failed");
                            }
                        }
                    });
                futures::future::join_all(futures).await;
            }
        }
    }

    async fn deliver_one(
        inner: &Arc<Inner>,
        recipient: &AgentId,
        message: &Value,
        envelope: &MessageEnvelope,
        is_rpc: bool,
        topic_id: Option<TopicId>,
    ) -> Result<Value> {
        let ctx = MessageContext {
            sender: envelope.sender.clone(),
            topic_id,
            is_rpc,
            cancellation_token: envelope.cancellation_token.clone(),
            message_id: envelope.message_id.clone(),
        };
        Self::deliver(inner, recipient, message.clone(), ctx).await
    }

    async fn deliver(inner: &Arc<Inner>, recipient: &AgentId, message: Value, ctx: MessageContext) -> Result<Value> {
        let agent = Self::ensure_instantiated(inner, recipient).await?;
        let mut guard = agent.lock().await;
        info!(agent = %recipient, message_id = %ctx.message_id, "dispatching to agent");
        match guard.on_message(message, ctx).await {
            Ok(value) => Ok(value),
            Err(err) => {
                error!(agent = %recipient, error = %err, "agent handler failed");
                Err(err)
            }
        }
    }

    async fn ensure_instantiated(inner: &Arc<Inner>, agent_id: &AgentId) -> Result<SharedAgent> {
        if let Some(existing) = inner.instances.read().unwrap().get(agent_id) {
            return Ok(existing.clone());
        }

        // Serialize on a per-id lock so two concurrent resolves of the same
        // not-yet-created id can't both run the factory: the loser of the
        // race below blocks here, then finds the table already populated.
        let per_id_lock = {
            let mut locks = inner.instantiation_locks.lock().await;
            locks.entry(agent_id.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };
        let _guard = per_id_lock.lock().await;

        if let Some(existing) = inner.instances.read().unwrap().get(agent_id) {
            return Ok(existing.clone());
        }
        let agent = inner.factories.instantiate(agent_id.clone()).await?;
        let shared = Arc::new(AsyncMutex::new(agent));
        inner.instances.write().unwrap().insert(agent_id.clone(), shared.clone());
        Ok(shared)
    }

    /// Looks up an already-instantiated (or newly instantiated) agent and
    /// confirms it downcasts to `T`. Returns a lookup error if the type has
    /// no factory, or a type-mismatch error if a different concrete type is
    /// installed under this id.
    pub async fn try_get_underlying_agent_instance<T: 'static>(&self, agent_id: &AgentId) -> Result<()> {
        if !self.inner.factories.is_registered(agent_id.r#type()) {
            return Err(RuntimeError::Lookup(format!("agent with name {} not found", agent_id.r#type())));
        }
        let agent = Self::ensure_instantiated(&self.inner, agent_id).await?;
        let guard = agent.lock().await;
        if guard.as_any().downcast_ref::<T>().is_none() {
            return Err(RuntimeError::TypeMismatch {
                expected: std::any::type_name::<T>().to_string(),
                actual: agent_id.r#type().to_string(),
            });
        }
        Ok(())
    }

    /// Serializes every instantiated agent's state into one JSON object
    /// keyed by canonical agent id string.
    pub async fn save_state(&self) -> Result<Value> {
        let ids: Vec<AgentId> = self.inner.instances.read().unwrap().keys().cloned().collect();
        let mut state = serde_json::Map::new();
        for id in ids {
            let agent = self.inner.instances.read().unwrap().get(&id).cloned();
            if let Some(agent) = agent {
                let mut guard = agent.lock().await;
                state.insert(id.to_string(), guard.save_state().await?);
            }
        }
        Ok(Value::Object(state))
    }

    /// Restores per-agent state saved by `save_state`, skipping entries
    /// whose type has no registered factory rather than failing the whole
    /// load.
    pub async fn load_state(&self, state: Value) -> Result<()> {
        let object = match state {
            Value::Object(map) => map,
            _ => return Err(RuntimeError::Validation("load_state expects a JSON object".into())),
        };
        for (id_str, agent_state) in object {
            let id = AgentId::from_str_id(&id_str)?;
            if !self.inner.factories.is_registered(id.r#type()) {
                continue;
            }
            let agent = Self::ensure_instantiated(&self.inner, &id).await?;
            let mut guard = agent.lock().await;
            guard.load_state(agent_state).await?;
        }
        Ok(())
    }
}

impl Default for AgentRuntime {
    fn default() -> Self {
        Self::new()
    }
}
