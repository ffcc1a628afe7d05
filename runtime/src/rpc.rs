//! RPC-over-publish (spec §4.9): direct-call ergonomics for distributed
//! runtimes that have no native point-to-point channel, built entirely out
//! of publish/subscribe using well-known topic type formats.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::agent::{Agent, AgentMetadata, MessageContext};
use crate::cancellation::CancellationToken;
use crate::error::{Result, RuntimeError};
use crate::factory::ClosureFactory;
use crate::ids::{AgentId, TopicId};
use crate::runtime::AgentRuntime;
use crate::subscription::TypeSubscription;

pub fn format_rpc_request_topic(recipient_agent_type: &str, sender_agent_type: &str) -> String {
    format!("{recipient_agent_type}:rpc_request={sender_agent_type}")
}

pub fn format_rpc_cancel_topic(recipient_agent_type: &str, request_id: &str) -> String {
    format!("{recipient_agent_type}:rpc_cancel={request_id}")
}

pub fn format_rpc_response_topic(sender_agent_type: &str, request_id: &str) -> String {
    format!("{sender_agent_type}:rpc_response={request_id}")
}

pub fn format_error_topic(recipient_agent_type: &str, request_id: &str) -> String {
    format!("{recipient_agent_type}:error={request_id}")
}

fn segment_suffix<'a>(topic_type: &'a str, prefix: &str) -> Option<&'a str> {
    topic_type.split(':').find_map(|segment| segment.strip_prefix(prefix))
}

pub fn is_rpc_response(topic_type: &str) -> Option<&str> {
    segment_suffix(topic_type, "rpc_response=")
}

pub fn is_rpc_cancel(topic_type: &str) -> Option<&str> {
    segment_suffix(topic_type, "rpc_cancel=")
}

pub fn is_rpc_request(topic_type: &str) -> Option<&str> {
    segment_suffix(topic_type, "rpc_request=")
}

pub fn is_error_message(topic_type: &str) -> Option<&str> {
    segment_suffix(topic_type, "error=")
}

/// Well-known response payload published on the error topic when the
/// recipient has no handler for the request's message type.
pub const CANT_HANDLE_MARKER: &str = "__rpc_cant_handle__";
/// Well-known response payload published on the error topic when an
/// intervention handler dropped the request before it reached the agent.
pub const MESSAGE_DROPPED_MARKER: &str = "__rpc_message_dropped__";

/// A short-lived agent that exists only to catch the response/error topics
/// for one outstanding RPC-over-publish call, then resolves the caller's
/// oneshot. The runtime never re-delivers to it after that point; callers
/// are responsible for eventually removing its subscriptions via
/// [`RpcCall::forget`] if they care about tidying up the subscription
/// table (the core does not do this automatically, matching the
/// original's noted `TODO: remove agent after response is received`).
struct ClosureAgent {
    id: AgentId,
    expected_response_topic_type: String,
    expected_error_topic_type: String,
    reply: Option<oneshot::Sender<Result<Value>>>,
}

#[async_trait]
impl Agent for ClosureAgent {
    fn metadata(&self) -> AgentMetadata {
        AgentMetadata {
            r#type: self.id.r#type().to_string(),
            key: self.id.key().to_string(),
            description: "rpc-over-publish response closure".to_string(),
        }
    }

    fn id(&self) -> AgentId {
        self.id.clone()
    }

    async fn on_message(&mut self, message: Value, ctx: MessageContext) -> Result<Value> {
        let topic_type = ctx
            .topic_id
            .as_ref()
            .ok_or_else(|| RuntimeError::Validation("closure agent invoked outside of a publish".into()))?
            .r#type();

        let outcome = if topic_type == self.expected_response_topic_type {
            Ok(message)
        } else if topic_type == self.expected_error_topic_type {
            match message.as_str() {
                Some(CANT_HANDLE_MARKER) => Err(RuntimeError::CantHandle {
                    recipient: self.id.r#type().to_string(),
                    message_type: "unknown".to_string(),
                }),
                Some(MESSAGE_DROPPED_MARKER) => Err(RuntimeError::MessageDropped(ctx.message_id.clone())),
                _ => Err(RuntimeError::Undeliverable(format!(
                    "unexpected error payload on topic {topic_type}"
                ))),
            }
        } else {
            return Err(RuntimeError::Undeliverable(format!(
                "closure agent received unexpected topic type {topic_type}"
            )));
        };

        if let Some(reply) = self.reply.take() {
            let _ = reply.send(outcome);
        }
        Ok(Value::Null)
    }
}

/// Issues one RPC-over-publish call and awaits its response.
///
/// Registers a disposable closure-agent type subscribed to the response and
/// error topics for this request, publishes the request on the well-known
/// request topic, and resolves once a response or error arrives (or the
/// timeout elapses, or the cancellation token fires — which additionally
/// publishes to the cancel topic so the remote side can stop working).
pub async fn rpc_send_message(
    runtime: &AgentRuntime,
    message: Value,
    recipient: AgentId,
    cancellation_token: Option<CancellationToken>,
    timeout: Option<Duration>,
) -> Result<Value> {
    let cancellation_token = cancellation_token.unwrap_or_default();
    let request_id = Uuid::new_v4().to_string();
    let closure_agent_type = format!("rpc_receiver_{}_{}", recipient.r#type(), request_id);

    let expected_response_topic_type = format_rpc_response_topic(&closure_agent_type, &request_id);
    let expected_error_topic_type = format_error_topic(&closure_agent_type, &request_id);

    let (reply_tx, reply_rx) = oneshot::channel();
    let reply_tx = std::sync::Mutex::new(Some(reply_tx));
    let closure_agent_id = AgentId::new(closure_agent_type.clone(), recipient.key().to_string())?;

    {
        let closure_agent_type = closure_agent_type.clone();
        let expected_response_topic_type = expected_response_topic_type.clone();
        let expected_error_topic_type = expected_error_topic_type.clone();
        runtime.register_factory(
            closure_agent_type.clone(),
            Arc::new(ClosureFactory::new(move || {
                let closure_agent_type = closure_agent_type.clone();
                let expected_response_topic_type = expected_response_topic_type.clone();
                let expected_error_topic_type = expected_error_topic_type.clone();
                let reply = reply_tx.lock().unwrap().take();
                async move {
                    let id = crate::factory::InstantiationContext::current_agent_id()
                        .unwrap_or_else(|_| AgentId::new(closure_agent_type, "default").unwrap());
                    Ok(ClosureAgent {
                        id,
                        expected_response_topic_type,
                        expected_error_topic_type,
                        reply,
                    })
                }
            })),
        )?;
    }
    runtime.add_subscription(Box::new(TypeSubscription::new(
        expected_response_topic_type,
        closure_agent_type.clone(),
    )))?;
    runtime.add_subscription(Box::new(TypeSubscription::new(
        expected_error_topic_type,
        closure_agent_type.clone(),
    )))?;

    let request_topic = format_rpc_request_topic(recipient.r#type(), &closure_agent_type);
    runtime
        .publish_message(
            message,
            TopicId::new(request_topic, recipient.key().to_string())?,
            Some(closure_agent_id),
            Some(cancellation_token.clone()),
            Some(request_id.clone()),
        )
        .await?;

    {
        let runtime = runtime.clone();
        let recipient_type = recipient.r#type().to_string();
        let recipient_key = recipient.key().to_string();
        let request_id = request_id.clone();
        cancellation_token.add_callback(move || {
            let runtime = runtime.clone();
            let recipient_type = recipient_type.clone();
            let recipient_key = recipient_key.clone();
            let request_id = request_id.clone();
            tokio::spawn(async move {
                let cancel_topic = format_rpc_cancel_topic(&recipient_type, &request_id);
                if let Ok(topic_id) = TopicId::new(cancel_topic, recipient_key) {
                    let _ = runtime.publish_message(Value::Null, topic_id, None, None, None).await;
                }
            });
        });
    }

    let outcome = match timeout {
        Some(duration) => tokio::time::timeout(duration, reply_rx)
            .await
            .map_err(|_| RuntimeError::Cancelled)?
            .map_err(|_| RuntimeError::Undeliverable("rpc closure agent dropped without a response".into()))?,
        None => reply_rx
            .await
            .map_err(|_| RuntimeError::Undeliverable("rpc closure agent dropped without a response".into()))?,
    };
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_and_parses_request_topic() {
        let topic = format_rpc_request_topic("worker", "coordinator");
        assert_eq!(topic, "worker:rpc_request=coordinator");
        assert_eq!(is_rpc_request(&topic), Some("coordinator"));
    }

    #[test]
    fn formats_and_parses_response_topic() {
        let topic = format_rpc_response_topic("coordinator", "req-1");
        assert_eq!(topic, "coordinator:rpc_response=req-1");
        assert_eq!(is_rpc_response(&topic), Some("req-1"));
    }

    #[test]
    fn formats_and_parses_cancel_and_error_topics() {
        let cancel = format_rpc_cancel_topic("worker", "req-1");
        assert_eq!(is_rpc_cancel(&cancel), Some("req-1"));
        let error = format_error_topic("worker", "req-1");
        assert_eq!(is_error_message(&error), Some("req-1"));
    }

    #[test]
    fn non_matching_topic_parses_to_none() {
        assert_eq!(is_rpc_response("plain:default"), None);
    }

    #[tokio::test]
    async fn rpc_send_message_round_trips_to_an_echo_recipient() {
        use crate::factory::InstantiationContext;
        use crate::subscription::TypePrefixSubscription;
        use serde_json::json;

        struct EchoResponder {
            id: AgentId,
            runtime: AgentRuntime,
        }

        #[async_trait]
        impl Agent for EchoResponder {
            fn metadata(&self) -> AgentMetadata {
                AgentMetadata {
                    r#type: self.id.r#type().to_string(),
                    key: self.id.key().to_string(),
                    description: String::new(),
                }
            }
            fn id(&self) -> AgentId {
                self.id.clone()
            }
            async fn on_message(&mut self, message: Value, ctx: MessageContext) -> Result<Value> {
                if let Some(sender_type) = ctx
                    .topic_id
                    .as_ref()
                    .and_then(|t| is_rpc_request(t.r#type()))
                {
                    let response_topic = format_rpc_response_topic(sender_type, &ctx.message_id);
                    let topic_id = TopicId::new(response_topic, self.id.key().to_string())?;
                    self.runtime
                        .publish_message(message, topic_id, Some(self.id.clone()), None, None)
                        .await?;
                }
                Ok(Value::Null)
            }
        }

        let runtime = AgentRuntime::new();
        let runtime_for_factory = runtime.clone();
        runtime
            .register_factory(
                "responder",
                Arc::new(ClosureFactory::new(move || {
                    let runtime_for_factory = runtime_for_factory.clone();
                    async move {
                        let id = InstantiationContext::current_agent_id()?;
                        Ok(EchoResponder {
                            id,
                            runtime: runtime_for_factory,
                        })
                    }
                })),
            )
            .unwrap();
        runtime
            .add_subscription(Box::new(TypePrefixSubscription::new("responder:rpc_request=", "responder")))
            .unwrap();

        runtime.start().await.unwrap();
        let reply = rpc_send_message(
            &runtime,
            json!("ping"),
            AgentId::new("responder", "1").unwrap(),
            None,
            Some(Duration::from_secs(2)),
        )
        .await
        .unwrap();
        assert_eq!(reply, json!("ping"));
        runtime.stop_when_idle().await.unwrap();
    }
}
