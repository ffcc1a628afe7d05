//! Cooperative single-threaded multi-agent messaging and scheduling
//! runtime: identifiers and topics, a subscription registry, an agent
//! factory table, intervention hooks, the driver loop itself, RPC-over-
//! publish for distributed use, and an optional host/worker layer for
//! running several runtime instances together.
//!
//! [`runtime::AgentRuntime`] is the entry point. A typical embedding
//! registers one or more agent factories, adds subscriptions (or lets
//! [`factory::direct_message_subscription`] wire up direct addressing),
//! calls `AgentRuntime::start`, and then drives work through
//! `AgentRuntime::send_message` / `AgentRuntime::publish_message`.

pub mod agent;
pub mod cancellation;
pub mod config;
pub mod distributed;
pub mod envelope;
pub mod error;
pub mod factory;
pub mod ids;
pub mod intervention;
pub mod rpc;
pub mod runtime;
pub mod serialization;
pub mod subscription;
pub mod telemetry;

pub use agent::{Agent, AgentMetadata, AnyAgent, MessageContext};
pub use cancellation::{Cancelled, CancellationToken};
pub use envelope::{EnvelopeKind, EnvelopeMetadata, MessageEnvelope};
pub use error::{Result, RuntimeError};
pub use factory::{direct_message_subscription, AgentFactory, AgentFactoryTable, ClosureFactory, InstantiationContext};
pub use ids::{AgentId, AgentType, TopicId};
pub use intervention::{DefaultInterventionHandler, InterventionChain, InterventionHandler, InterventionOutcome};
pub use runtime::AgentRuntime;
pub use serialization::{MessageCodec, SerializationRegistry};
pub use subscription::{DefaultSubscription, Subscription, SubscriptionRegistry, TypePrefixSubscription, TypeSubscription};
