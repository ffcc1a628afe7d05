//! Topic subscriptions and the subscription registry (spec §4.4).
//!
//! A [`Subscription`] is a predicate over [`TopicId`] plus a mapping from a
//! matching topic to the [`AgentId`] that should handle it. The registry
//! caches, per seen topic, the ordered list of recipients a publish should
//! fan out to; the cache is invalidated and rebuilt whenever the
//! subscription set changes. Recipients are **not** deduplicated — two
//! subscriptions that both match a topic and map to the same agent produce
//! two deliveries, matching upstream behavior.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use uuid::Uuid;

use crate::error::{Result, RuntimeError};
use crate::ids::{AgentId, AgentType, TopicId};

/// Defines which topics an agent is interested in, and how a matching topic
/// maps to a concrete agent instance.
pub trait Subscription: Send + Sync {
    fn id(&self) -> &str;
    fn is_match(&self, topic: &TopicId) -> bool;
    /// Only valid to call when `is_match(topic)` is true.
    fn map_to_agent(&self, topic: &TopicId) -> Result<AgentId>;

    /// A `(selector, agent_type)` pair two subscriptions must differ on to
    /// avoid being treated as duplicates of each other, independent of
    /// `id()` — mirrors upstream's subscription equality, which compares
    /// by id or by the type-specific fields (`_type_subscription.py`,
    /// `_prefix_subscription.py`). `None` opts a subscription out of this
    /// comparison, leaving only `id()` to guard against duplicates.
    fn dedupe_key(&self) -> Option<(String, String)> {
        None
    }
}

/// Matches topics by exact type equality; the agent key is the topic's
/// source, so each source gets its own agent instance.
pub struct TypeSubscription {
    id: String,
    topic_type: String,
    agent_type: String,
}

impl TypeSubscription {
    pub fn new(topic_type: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic_type: topic_type.into(),
            agent_type: agent_type.into(),
        }
    }

    pub fn from_agent_type(topic_type: impl Into<String>, agent_type: &AgentType) -> Self {
        Self::new(topic_type, agent_type.as_str().to_string())
    }

    pub fn topic_type(&self) -> &str {
        &self.topic_type
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }
}

impl Subscription for TypeSubscription {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_match(&self, topic: &TopicId) -> bool {
        topic.r#type() == self.topic_type
    }

    fn map_to_agent(&self, topic: &TopicId) -> Result<AgentId> {
        if !self.is_match(topic) {
            return Err(RuntimeError::CantHandle {
                recipient: self.agent_type.clone(),
                message_type: topic.r#type().to_string(),
            });
        }
        AgentId::new(self.agent_type.clone(), topic.source())
    }

    fn dedupe_key(&self) -> Option<(String, String)> {
        Some((format!("type:{}", self.topic_type), self.agent_type.clone()))
    }
}

/// Matches topics whose type carries a given prefix; the agent key is the
/// topic's source, same as [`TypeSubscription`].
pub struct TypePrefixSubscription {
    id: String,
    topic_type_prefix: String,
    agent_type: String,
}

impl TypePrefixSubscription {
    pub fn new(topic_type_prefix: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic_type_prefix: topic_type_prefix.into(),
            agent_type: agent_type.into(),
        }
    }

    pub fn topic_type_prefix(&self) -> &str {
        &self.topic_type_prefix
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }
}

impl Subscription for TypePrefixSubscription {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_match(&self, topic: &TopicId) -> bool {
        topic.r#type().starts_with(&self.topic_type_prefix)
    }

    fn map_to_agent(&self, topic: &TopicId) -> Result<AgentId> {
        if !self.is_match(topic) {
            return Err(RuntimeError::CantHandle {
                recipient: self.agent_type.clone(),
                message_type: topic.r#type().to_string(),
            });
        }
        AgentId::new(self.agent_type.clone(), topic.source())
    }

    fn dedupe_key(&self) -> Option<(String, String)> {
        Some((format!("prefix:{}", self.topic_type_prefix), self.agent_type.clone()))
    }
}

/// A [`TypeSubscription`] against the well-known `"default"` topic type,
/// for applications that only need one global scope per agent type.
pub struct DefaultSubscription(TypeSubscription);

impl DefaultSubscription {
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self(TypeSubscription::new("default", agent_type))
    }
}

impl Subscription for DefaultSubscription {
    fn id(&self) -> &str {
        self.0.id()
    }

    fn is_match(&self, topic: &TopicId) -> bool {
        self.0.is_match(topic)
    }

    fn map_to_agent(&self, topic: &TopicId) -> Result<AgentId> {
        self.0.map_to_agent(topic)
    }

    fn dedupe_key(&self) -> Option<(String, String)> {
        self.0.dedupe_key()
    }
}

/// Holds the live subscription set and a per-topic recipient cache.
///
/// The cache is rebuilt from scratch on every add/remove rather than
/// incrementally patched — the subscription set is expected to change
/// rarely (agent registration time) relative to how often topics are
/// published to, so a full rebuild against the small set of previously
/// seen topics is cheap and simple.
#[derive(Default)]
pub struct SubscriptionRegistry {
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    subscriptions: Vec<Box<dyn Subscription>>,
    seen_topics: HashSet<TopicId>,
    recipients: HashMap<TopicId, Vec<AgentId>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_subscription(&self, subscription: Box<dyn Subscription>) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let new_key = subscription.dedupe_key();
        let duplicate = state.subscriptions.iter().any(|s| {
            s.id() == subscription.id() || (new_key.is_some() && s.dedupe_key() == new_key)
        });
        if duplicate {
            return Err(RuntimeError::Validation(format!(
                "subscription already exists: {}",
                subscription.id()
            )));
        }
        state.subscriptions.push(subscription);
        Self::rebuild(&mut state)?;
        Ok(())
    }

    pub fn remove_subscription(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if !state.subscriptions.iter().any(|s| s.id() == id) {
            return Err(RuntimeError::Lookup(format!("subscription does not exist: {id}")));
        }
        state.subscriptions.retain(|s| s.id() != id);
        Self::rebuild(&mut state)?;
        Ok(())
    }

    pub fn subscription_ids(&self) -> Vec<String> {
        self.state
            .read()
            .unwrap()
            .subscriptions
            .iter()
            .map(|s| s.id().to_string())
            .collect()
    }

    /// Recipients for `topic`, in subscription-registration order, with
    /// duplicates preserved. Builds and caches the entry for topics never
    /// seen before.
    pub fn subscribed_recipients(&self, topic: &TopicId) -> Vec<AgentId> {
        {
            let state = self.state.read().unwrap();
            if let Some(cached) = state.recipients.get(topic) {
                return cached.clone();
            }
        }
        let mut state = self.state.write().unwrap();
        if let Some(cached) = state.recipients.get(topic) {
            return cached.clone();
        }
        let recipients = Self::build_for_topic(&state.subscriptions, topic);
        state.seen_topics.insert(topic.clone());
        state.recipients.insert(topic.clone(), recipients.clone());
        recipients
    }

    fn rebuild(state: &mut State) -> Result<()> {
        state.recipients.clear();
        let topics: Vec<TopicId> = state.seen_topics.iter().cloned().collect();
        for topic in topics {
            let recipients = Self::build_for_topic(&state.subscriptions, &topic);
            state.recipients.insert(topic, recipients);
        }
        Ok(())
    }

    fn build_for_topic(subscriptions: &[Box<dyn Subscription>], topic: &TopicId) -> Vec<AgentId> {
        let mut out = Vec::new();
        for subscription in subscriptions {
            if subscription.is_match(topic) {
                if let Ok(agent_id) = subscription.map_to_agent(topic) {
                    out.push(agent_id);
                }
            }
        }
        out
    }
}
