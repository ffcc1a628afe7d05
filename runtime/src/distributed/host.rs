//! Central distributed host (spec §4.10): routes type registration,
//! subscriptions, RPC requests/responses and published events across
//! connected workers, each over its own duplex byte stream.
//!
//! Grounded on `_worker_runtime_host_servicer.py`'s per-client send queue
//! plus dispatch-by-discriminator loop, reinterpreted for a generic framed
//! stream (this core has no gRPC dependency) instead of a gRPC
//! bidirectional stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_util::codec::Framed;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::ids::TopicId;
use crate::subscription::{Subscription, SubscriptionRegistry, TypePrefixSubscription, TypeSubscription};

use super::wire::{Frame, FrameCodec, WireSubscription};

const SEND_QUEUE_CAPACITY: usize = 256;

type ClientId = u64;

struct ClientHandle {
    send_tx: mpsc::Sender<Frame>,
}

#[derive(Default)]
struct HostState {
    clients: HashMap<ClientId, ClientHandle>,
    agent_type_to_client: HashMap<String, ClientId>,
    /// `(target_client_id, request_id) -> origin_client_id`
    pending_requests: HashMap<(ClientId, String), ClientId>,
}

/// Owns routing state shared across every connected worker. Cheap to
/// clone (an `Arc` internally); `serve_connection` is meant to be spawned
/// once per accepted connection.
pub struct Host {
    next_client_id: AtomicU64,
    state: RwLock<HostState>,
    subscriptions: SubscriptionRegistry,
}

impl Host {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_client_id: AtomicU64::new(1),
            state: RwLock::new(HostState::default()),
            subscriptions: SubscriptionRegistry::new(),
        })
    }

    /// Serves one worker connection until it disconnects or errors. On
    /// return, every `type_name` this client claimed has been released and
    /// every request still routed through it has been failed with a
    /// "client disconnected" error.
    pub async fn serve_connection<S>(self: &Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let client_id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        let (send_tx, mut send_rx) = mpsc::channel::<Frame>(SEND_QUEUE_CAPACITY);
        {
            let mut state = self.state.write().await;
            state.clients.insert(client_id, ClientHandle { send_tx });
        }
        info!(client_id, "worker connected");

        let mut framed = Framed::new(stream, FrameCodec);

        let outcome = loop {
            tokio::select! {
                biased;
                inbound = framed.next() => {
                    match inbound {
                        Some(Ok(frame)) => {
                            if let Err(err) = self.dispatch(client_id, frame).await {
                                error!(client_id, %err, "failed to dispatch inbound frame");
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

        self.disconnect(client_id).await;
        info!(client_id, "worker disconnected");
        outcome
    }

    /// Binds `bind_address`, accepts worker connections and spawns
    /// `serve_connection` for each one, until a SIGINT/ctrl-c arrives. Each
    /// accepted connection's `serve_connection` task is detached; this
    /// method returns once the signal fires, without waiting for already
    /// running connections to drain. A convenience for a binary entrypoint,
    /// not something the library calls on its own.
    pub async fn run_until_signal(self: &Arc<Self>, bind_address: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_address)
            .await
            .map_err(crate::error::RuntimeError::Io)?;
        info!(%bind_address, "distributed host listening");

        loop {
            tokio::select! {
                biased;
                _ = tokio::signal::ctrl_c() => {
                    info!("received shutdown signal, no longer accepting worker connections");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            info!(%peer_addr, "accepted worker connection");
                            let host = self.clone();
                            tokio::spawn(async move {
                                if let Err(err) = host.serve_connection(stream).await {
                                    error!(%peer_addr, %err, "worker connection ended with an error");
                                }
                            });
                        }
                        Err(err) => error!(%err, "failed to accept worker connection"),
                    }
                }
            }
        }
    }

    async fn dispatch(&self, client_id: ClientId, frame: Frame) -> Result<()> {
        match frame {
            Frame::RegisterAgentType { r#type } => {
                self.process_register_agent_type(client_id, r#type).await;
                Ok(())
            }
            Frame::AddSubscription { subscription } => self.process_add_subscription(subscription).await,
            Frame::RpcRequest { .. } => self.process_rpc_request(client_id, frame).await,
            Frame::RpcResponse { request_id, result_type, result_bytes, error } => {
                self.process_rpc_response(client_id, request_id, result_type, result_bytes, error)
                    .await
            }
            Frame::Event { .. } => self.process_event(frame).await,
        }
    }

    async fn process_register_agent_type(&self, client_id: ClientId, type_name: String) {
        let mut state = self.state.write().await;
        match state.agent_type_to_client.get(&type_name).copied() {
            Some(existing) if existing != client_id => {
                warn!(
                    %type_name,
                    existing_client = existing,
                    requesting_client = client_id,
                    "agent type already claimed by another client"
                );
            }
            _ => {
                state.agent_type_to_client.insert(type_name, client_id);
            }
        }
    }

    async fn process_add_subscription(&self, subscription: WireSubscription) -> Result<()> {
        let boxed: Box<dyn Subscription> = match subscription {
            WireSubscription::TypeSubscription { topic_type, agent_type } => {
                Box::new(TypeSubscription::new(topic_type, agent_type))
            }
            WireSubscription::TypePrefixSubscription { topic_type_prefix, agent_type } => {
                Box::new(TypePrefixSubscription::new(topic_type_prefix, agent_type))
            }
        };
        self.subscriptions.add_subscription(boxed)
    }

    async fn process_rpc_request(&self, origin_client_id: ClientId, frame: Frame) -> Result<()> {
        let (request_id, target_type) = match &frame {
            Frame::RpcRequest { request_id, target, .. } => (request_id.clone(), target.r#type.clone()),
            _ => unreachable!("caller guarantees frame is an RpcRequest"),
        };
        let target_client_id = {
            let state = self.state.read().await;
            state.agent_type_to_client.get(&target_type).copied()
        };
        let Some(target_client_id) = target_client_id else {
            warn!(%target_type, "rpc request target has no registered client");
            return self
                .reply_error(origin_client_id, request_id, format!("agent type not found: {target_type}"))
                .await;
        };

        {
            let mut state = self.state.write().await;
            state
                .pending_requests
                .insert((target_client_id, request_id.clone()), origin_client_id);
        }

        if self.forward(target_client_id, frame).await.is_err() {
            let mut state = self.state.write().await;
            state.pending_requests.remove(&(target_client_id, request_id.clone()));
            drop(state);
            return self.reply_error(origin_client_id, request_id, "target client disconnected".into()).await;
        }
        Ok(())
    }

    async fn process_rpc_response(
        &self,
        responding_client_id: ClientId,
        request_id: String,
        result_type: Option<String>,
        result_bytes: Option<Vec<u8>>,
        error: Option<String>,
    ) -> Result<()> {
        let origin_client_id = {
            let mut state = self.state.write().await;
            state.pending_requests.remove(&(responding_client_id, request_id.clone()))
        };
        let Some(origin_client_id) = origin_client_id else {
            warn!(%request_id, "response to an unknown or already-resolved request");
            return Ok(());
        };
        let _ = self
            .forward(
                origin_client_id,
                Frame::RpcResponse { request_id, result_type, result_bytes, error },
            )
            .await;
        Ok(())
    }

    async fn process_event(&self, frame: Frame) -> Result<()> {
        let Frame::Event { ref topic_type, ref topic_source, .. } = frame else {
            unreachable!("caller guarantees frame is an Event")
        };
        let topic_id = TopicId::new(topic_type.clone(), topic_source.clone())?;
        let recipients = self.subscriptions.subscribed_recipients(&topic_id);

        let mut client_ids = std::collections::HashSet::new();
        {
            let state = self.state.read().await;
            for recipient in &recipients {
                match state.agent_type_to_client.get(recipient.r#type()) {
                    Some(client_id) => {
                        client_ids.insert(*client_id);
                    }
                    None => warn!(
                        agent_type = recipient.r#type(),
                        %topic_id,
                        "no client registered for event recipient type"
                    ),
                }
            }
        }
        for client_id in client_ids {
            let _ = self.forward(client_id, frame.clone()).await;
        }
        Ok(())
    }

    async fn reply_error(&self, client_id: ClientId, request_id: String, error: String) -> Result<()> {
        self.forward(
            client_id,
            Frame::RpcResponse { request_id, result_type: None, result_bytes: None, error: Some(error) },
        )
        .await
    }

    async fn forward(&self, client_id: ClientId, frame: Frame) -> Result<()> {
        let send_tx = {
            let state = self.state.read().await;
            state.clients.get(&client_id).map(|handle| handle.send_tx.clone())
        };
        match send_tx {
            Some(send_tx) => send_tx
                .send(frame)
                .await
                .map_err(|_| crate::error::RuntimeError::Undeliverable(format!("client {client_id} send queue closed"))),
            None => Err(crate::error::RuntimeError::Lookup(format!("unknown client {client_id}"))),
        }
    }

    async fn disconnect(&self, client_id: ClientId) {
        let mut state = self.state.write().await;
        state.clients.remove(&client_id);
        state.agent_type_to_client.retain(|_, owner| *owner != client_id);

        let stale: Vec<(ClientId, String)> = state
            .pending_requests
            .keys()
            .filter(|(target, _)| *target == client_id)
            .cloned()
            .collect();
        let mut failures = Vec::new();
        for key in stale {
            if let Some(origin_client_id) = state.pending_requests.remove(&key) {
                failures.push((origin_client_id, key.1));
            }
        }
        drop(state);

        for (origin_client_id, request_id) in failures {
            let _ = self.reply_error(origin_client_id, request_id, "client disconnected".into()).await;
        }
    }
}
