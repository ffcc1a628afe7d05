//! Distributed worker-side connection (spec §4.10): announces locally
//! registered agent types and subscriptions to the host, forwards inbound
//! RPC requests and events into the local [`AgentRuntime`], and turns
//! outgoing RPC calls and publishes into frames for the host to route.
//!
//! The reader/writer loop lives in [`Worker::run`]; the send queue and any
//! RPCs already awaiting a response survive a call to `run` returning, so
//! a caller can reconnect the underlying stream (see
//! [`connect_with_retry`]) without losing queued outbound work — matching
//! the "reader failures cause reconnection... but preserve the send
//! queue" invariant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::codec::Framed;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::DistributedSection;
use crate::error::{Result, RuntimeError};
use crate::ids::{AgentId, TopicId};
use crate::runtime::AgentRuntime;
use crate::subscription::{TypePrefixSubscription, TypeSubscription};

use super::wire::{Frame, FrameCodec, WireAgentId, WireSubscription};

const SEND_QUEUE_CAPACITY: usize = 256;

/// One logical connection to a distributed host, backed by a local
/// [`AgentRuntime`] that actually executes inbound requests and events.
pub struct Worker {
    runtime: AgentRuntime,
    send_tx: mpsc::Sender<Frame>,
    send_rx: AsyncMutex<Option<mpsc::Receiver<Frame>>>,
    pending_rpc: StdMutex<HashMap<String, oneshot::Sender<Frame>>>,
}

impl Worker {
    pub fn new(runtime: AgentRuntime) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        Arc::new(Self {
            runtime,
            send_tx,
            send_rx: AsyncMutex::new(Some(send_rx)),
            pending_rpc: StdMutex::new(HashMap::new()),
        })
    }

    /// Tells the host this worker owns `type_name`; the host rejects a
    /// second claim for the same type from another client.
    pub async fn register_agent_type(&self, type_name: impl Into<String>) -> Result<()> {
        self.send_frame(Frame::RegisterAgentType { r#type: type_name.into() }).await
    }

    /// Adds the subscription to the local runtime and announces it to the
    /// host in the same call, so the two never drift apart.
    pub async fn announce_type_subscription(
        &self,
        topic_type: impl Into<String>,
        agent_type: impl Into<String>,
    ) -> Result<()> {
        let topic_type = topic_type.into();
        let agent_type = agent_type.into();
        self.runtime
            .add_subscription(Box::new(TypeSubscription::new(topic_type.clone(), agent_type.clone())))?;
        self.send_frame(Frame::AddSubscription {
            subscription: WireSubscription::TypeSubscription { topic_type, agent_type },
        })
        .await
    }

    pub async fn announce_type_prefix_subscription(
        &self,
        topic_type_prefix: impl Into<String>,
        agent_type: impl Into<String>,
    ) -> Result<()> {
        let topic_type_prefix = topic_type_prefix.into();
        let agent_type = agent_type.into();
        self.runtime.add_subscription(Box::new(TypePrefixSubscription::new(
            topic_type_prefix.clone(),
            agent_type.clone(),
        )))?;
        self.send_frame(Frame::AddSubscription {
            subscription: WireSubscription::TypePrefixSubscription { topic_type_prefix, agent_type },
        })
        .await
    }

    /// Publishes an event onto the host for it to fan out to whichever
    /// clients own a matching recipient type.
    pub async fn publish_event(&self, topic_id: &TopicId, data: &Value, data_type: impl Into<String>) -> Result<()> {
        let data_bytes = serde_json::to_vec(data)?;
        self.send_frame(Frame::Event {
            topic_type: topic_id.r#type().to_string(),
            topic_source: topic_id.source().to_string(),
            data_type: data_type.into(),
            data_bytes,
        })
        .await
    }

    /// Issues a point-to-point RPC call routed through the host to
    /// whichever client owns `target.type`.
    pub async fn rpc_request(
        &self,
        source: &AgentId,
        target: &AgentId,
        data: Value,
        data_type: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let request_id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending_rpc.lock().unwrap().insert(request_id.clone(), reply_tx);

        let data_bytes = serde_json::to_vec(&data)?;
        let frame = Frame::RpcRequest {
            request_id: request_id.clone(),
            source: WireAgentId { r#type: source.r#type().to_string(), key: source.key().to_string() },
            target: WireAgentId { r#type: target.r#type().to_string(), key: target.key().to_string() },
            data_type: data_type.into(),
            data_bytes,
        };
        if let Err(err) = self.send_frame(frame).await {
            self.pending_rpc.lock().unwrap().remove(&request_id);
            return Err(err);
        }

        let response = match timeout {
            Some(duration) => {
                let outcome = tokio::time::timeout(duration, reply_rx).await;
                match outcome {
                    Ok(inner) => inner,
                    Err(_) => {
                        self.pending_rpc.lock().unwrap().remove(&request_id);
                        return Err(RuntimeError::Cancelled);
                    }
                }
            }
            None => reply_rx.await,
        };
        let frame = response.map_err(|_| RuntimeError::Undeliverable("worker dropped before responding".into()))?;

        match frame {
            Frame::RpcResponse { error: Some(message), .. } => Err(RuntimeError::Undeliverable(message)),
            Frame::RpcResponse { result_bytes: Some(bytes), error: None, .. } => {
                Ok(serde_json::from_slice(&bytes)?)
            }
            Frame::RpcResponse { result_bytes: None, error: None, .. } => Ok(Value::Null),
            other => Err(RuntimeError::Undeliverable(format!("unexpected frame resolving rpc request: {other:?}"))),
        }
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.send_tx
            .send(frame)
            .await
            .map_err(|_| RuntimeError::Undeliverable("worker send queue closed".into()))
    }

    /// Drives one connection to completion. Returns once the stream closes
    /// or errors; the outbound queue and any RPCs already awaiting a
    /// response remain intact across the call, so a caller may reconnect
    /// and call `run` again.
    pub async fn run<S>(self: &Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut send_rx = self
            .send_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| RuntimeError::Validation("worker is already running".into()))?;

        let mut framed = Framed::new(stream, FrameCodec);
        let outcome = loop {
            tokio::select! {
                biased;
                inbound = framed.next() => {
                    match inbound {
                        Some(Ok(frame)) => {
                            if let Err(err) = self.dispatch(frame).await {
                                error!(%err, "failed to dispatch inbound frame");
                            }
                        }
                        Some(Err(err)) => break Err(err),
                        None => break Ok(()),
                    }
                }
                outbound = send_rx.recv() => {
                    match outbound {
                        Some(frame) => {
                            if let Err(err) = framed.send(frame).await {
                                break Err(err);
                            }
                        }
                        None => break Ok(()),
                    }
                }
            }
        };

        *self.send_rx.lock().await = Some(send_rx);
        outcome
    }

    async fn dispatch(&self, frame: Frame) -> Result<()> {
        match frame {
            Frame::RpcRequest { request_id, target, data_type, data_bytes, .. } => {
                self.handle_incoming_request(request_id, target, data_type, data_bytes).await
            }
            Frame::RpcResponse { .. } => {
                self.resolve_pending(frame);
                Ok(())
            }
            Frame::Event { topic_type, topic_source, data_bytes, .. } => {
                self.handle_incoming_event(topic_type, topic_source, data_bytes).await
            }
            Frame::RegisterAgentType { .. } | Frame::AddSubscription { .. } => {
                Err(RuntimeError::Validation("worker received a host-only frame".into()))
            }
        }
    }

    fn resolve_pending(&self, frame: Frame) {
        if let Frame::RpcResponse { ref request_id, .. } = frame {
            if let Some(reply_tx) = self.pending_rpc.lock().unwrap().remove(request_id) {
                let _ = reply_tx.send(frame);
            }
        }
    }

    async fn handle_incoming_request(
        &self,
        request_id: String,
        target: WireAgentId,
        data_type: String,
        data_bytes: Vec<u8>,
    ) -> Result<()> {
        let value: Value = serde_json::from_slice(&data_bytes)?;
        let recipient = AgentId::new(target.r#type, target.key)?;
        let outcome = self
            .runtime
            .send_message(value, recipient, None, None, Some(request_id.clone()))
            .await;
        let reply = match outcome {
            Ok(result) => Frame::RpcResponse {
                request_id,
                result_type: Some(data_type),
                result_bytes: Some(serde_json::to_vec(&result)?),
                error: None,
            },
            Err(err) => Frame::RpcResponse { request_id, result_type: None, result_bytes: None, error: Some(err.to_string()) },
        };
        self.send_frame(reply).await
    }

    async fn handle_incoming_event(&self, topic_type: String, topic_source: String, data_bytes: Vec<u8>) -> Result<()> {
        let value: Value = serde_json::from_slice(&data_bytes)?;
        let topic_id = TopicId::new(topic_type, topic_source)?;
        if let Err(err) = self.runtime.publish_message(value, topic_id, None, None, None).await {
            warn!(%err, "failed to publish distributed event locally");
        }
        Ok(())
    }
}

/// Retries `connect` per the distributed retry policy (spec §4.10's
/// default: 3 attempts, 10ms initial backoff, 5s max, multiplier 2),
/// returning the first successful stream or the last error once attempts
/// are exhausted.
pub async fn connect_with_retry<F, Fut, S, E>(cfg: &DistributedSection, mut connect: F) -> std::result::Result<S, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<S, E>>,
{
    let mut backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(cfg.retry_initial_backoff_ms))
        .with_max_interval(Duration::from_millis(cfg.retry_max_backoff_ms))
        .with_multiplier(cfg.retry_multiplier)
        .with_max_elapsed_time(None)
        .build();

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match connect().await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if attempt >= cfg.retry_max_attempts {
                    return Err(err);
                }
                let delay = backoff
                    .next_backoff()
                    .unwrap_or_else(|| Duration::from_millis(cfg.retry_initial_backoff_ms));
                tokio::time::sleep(delay).await;
            }
        }
    }
}
