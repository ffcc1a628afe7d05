//! The internal envelope that the runtime's queue actually carries (spec §3,
//! §4.8). Public callers never construct one directly — they go through
//! [`crate::runtime::AgentRuntime::send_message`] and
//! `publish_message`, which build the envelope and enqueue it.

use serde_json::Value;
use tokio::sync::oneshot;

use crate::cancellation::CancellationToken;
use crate::error::Result;
use crate::ids::{AgentId, TopicId};

#[derive(Debug, Clone, Default)]
pub struct EnvelopeMetadata {
    pub trace_id: Option<String>,
}

/// Where an envelope is headed, and what the driver loop does with the
/// handler's outcome once it has one.
pub enum EnvelopeKind {
    /// Exactly one recipient; the handler's return (or error) resolves
    /// `reply`.
    Send {
        recipient: AgentId,
        reply: oneshot::Sender<Result<Value>>,
    },
    /// Zero or more recipients resolved from the subscription registry at
    /// dispatch time; results are logged, not returned.
    Publish { topic_id: TopicId },
    /// Reserved for the distributed host/worker path (spec §4.9, §4.10),
    /// where a response arrives as its own enqueued unit rather than
    /// through a local oneshot.
    Response {
        request_id: String,
        reply: oneshot::Sender<Result<Value>>,
    },
}

impl std::fmt::Debug for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeKind::Send { recipient, .. } => {
                f.debug_struct("Send").field("recipient", recipient).finish()
            }
            EnvelopeKind::Publish { topic_id } => {
                f.debug_struct("Publish").field("topic_id", topic_id).finish()
            }
            EnvelopeKind::Response { request_id, .. } => {
                f.debug_struct("Response").field("request_id", request_id).finish()
            }
        }
    }
}

/// A single unit of the driver loop's FIFO queue.
#[derive(Debug)]
pub struct MessageEnvelope {
    pub message: Value,
    pub cancellation_token: CancellationToken,
    pub sender: Option<AgentId>,
    pub metadata: EnvelopeMetadata,
    pub message_id: String,
    pub kind: EnvelopeKind,
}

impl MessageEnvelope {
    pub fn is_rpc(&self) -> bool {
        matches!(self.kind, EnvelopeKind::Send { .. } | EnvelopeKind::Response { .. })
    }

    pub fn topic_id(&self) -> Option<&TopicId> {
        match &self.kind {
            EnvelopeKind::Publish { topic_id } => Some(topic_id),
            _ => None,
        }
    }
}
