//! Distributed host/worker mode (spec §4.10): lets several runtime
//! instances, each in its own process, share agent types, subscriptions,
//! RPC calls and published events over a central host and a duplex byte
//! stream per worker.
//!
//! This is an optional layer on top of the core — nothing in [`crate::runtime`]
//! depends on it. A process either runs purely locally (direct `AgentRuntime`
//! use) or additionally runs a [`host::Host`] or [`worker::Worker`] to join
//! a distributed deployment.

pub mod host;
pub mod wire;
pub mod worker;

pub use host::Host;
pub use wire::{Frame, FrameCodec, WireAgentId, WireSubscription};
pub use worker::{connect_with_retry, Worker};
