//! End-to-end scenarios exercising the runtime, subscription registry,
//! intervention chain, and distributed host/worker layer together through
//! the public API, one test per concrete scenario.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use noa_agent_runtime::distributed::{Host, Worker};
use noa_agent_runtime::{
    Agent, AgentId, AgentMetadata, AgentRuntime, ClosureFactory, DefaultInterventionHandler,
    InstantiationContext, InterventionHandler, InterventionOutcome, MessageContext, Result,
    RuntimeError, TopicId, TypeSubscription,
};
use serde_json::{json, Value};
use tokio::io::duplex;

struct Echo {
    id: AgentId,
}

#[async_trait]
impl Agent for Echo {
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
    async fn on_message(&mut self, message: Value, _ctx: MessageContext) -> Result<Value> {
        Ok(message)
    }
}

// Scenario 1: echo direct-send resolves unchanged and only one instance is
// ever constructed for repeated sends to the same AgentId.
#[tokio::test]
async fn echo_direct_send_returns_message_unchanged_and_reuses_one_instance() {
    let runtime = AgentRuntime::new();
    let instantiations = Arc::new(AtomicUsize::new(0));
    let counter = instantiations.clone();
    runtime
        .register_factory(
            "echo",
            Arc::new(ClosureFactory::new(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let id = InstantiationContext::current_agent_id()?;
                    Ok(Echo { id })
                }
            })),
        )
        .unwrap();
    runtime.start().await.unwrap();

    let recipient = AgentId::new("echo", "1").unwrap();
    for _ in 0..3 {
        let reply = runtime
            .send_message(json!("hello"), recipient.clone(), None, None, None)
            .await
            .unwrap();
        assert_eq!(reply, json!("hello"));
    }
    runtime.stop_when_idle().await.unwrap();

    assert_eq!(instantiations.load(Ordering::SeqCst), 1);
}

struct RecordingListener {
    id: AgentId,
    log: Arc<std::sync::Mutex<Vec<(Value, Option<String>)>>>,
}

#[async_trait]
impl Agent for RecordingListener {
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
        let source = ctx.topic_id.as_ref().map(|t| t.source().to_string());
        self.log.lock().unwrap().push((message, source));
        assert!(ctx.sender.is_none());
        Ok(Value::Null)
    }
}

// Scenario 2: publishing the same topic type from three distinct sources
// fans out to three distinct "listener" instances, each seeing exactly one
// message with the matching topic source and no sender.
#[tokio::test]
async fn topic_fan_out_delivers_one_message_to_each_of_three_sources() {
    let runtime = AgentRuntime::new();
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));
    let log_for_factory = log.clone();
    runtime
        .register_factory(
            "listener",
            Arc::new(ClosureFactory::new(move || {
                let log = log_for_factory.clone();
                async move {
                    let id = InstantiationContext::current_agent_id()?;
                    Ok(RecordingListener { id, log })
                }
            })),
        )
        .unwrap();
    runtime
        .add_subscription(Box::new(TypeSubscription::new("announce", "listener")))
        .unwrap();
    runtime.start().await.unwrap();

    for source in ["s1", "s2", "s3"] {
        runtime
            .publish_message(json!({"msg": "hi"}), TopicId::new("announce", source).unwrap(), None, None, None)
            .await
            .unwrap();
    }
    runtime.stop_when_idle().await.unwrap();

    let mut seen = log.lock().unwrap().clone();
    seen.sort_by(|a, b| a.1.cmp(&b.1));
    assert_eq!(
        seen,
        vec![
            (json!({"msg": "hi"}), Some("s1".to_string())),
            (json!({"msg": "hi"}), Some("s2".to_string())),
            (json!({"msg": "hi"}), Some("s3".to_string())),
        ]
    );
}

// Scenario 3 (timeout half): an RPC-over-publish call with no responder
// fails with a cancellation/timeout error rather than hanging forever.
#[tokio::test]
async fn rpc_over_publish_times_out_without_a_responder() {
    use noa_agent_runtime::rpc::rpc_send_message;

    let runtime = AgentRuntime::new();
    runtime.start().await.unwrap();

    let result = rpc_send_message(
        &runtime,
        json!("ping"),
        AgentId::new("nobody_listens", "1").unwrap(),
        None,
        Some(Duration::from_millis(50)),
    )
    .await;

    assert!(matches!(result, Err(RuntimeError::Cancelled)));
    runtime.stop_when_idle().await.unwrap();
}

struct Counting {
    id: AgentId,
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl Agent for Counting {
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
    async fn on_message(&mut self, message: Value, _ctx: MessageContext) -> Result<Value> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(message)
    }
}

struct DropsForbidden;

#[async_trait]
impl InterventionHandler for DropsForbidden {
    async fn on_send(&self, message: Value, _recipient: &AgentId) -> Result<InterventionOutcome> {
        self.check(message)
    }
    async fn on_publish(&self, message: Value) -> Result<InterventionOutcome> {
        self.check(message)
    }
    async fn on_response(
        &self,
        message: Value,
        _sender: &AgentId,
        _recipient: Option<&AgentId>,
    ) -> Result<InterventionOutcome> {
        self.check(message)
    }
}

impl DropsForbidden {
    fn check(&self, message: Value) -> Result<InterventionOutcome> {
        let contains_forbidden = message
            .get("content")
            .and_then(Value::as_str)
            .map(|s| s.contains("FORBIDDEN"))
            .unwrap_or(false);
        if contains_forbidden {
            Ok(InterventionOutcome::Drop)
        } else {
            Ok(InterventionOutcome::Keep(message))
        }
    }
}

// Scenario 4: a publish carrying a forbidden payload never reaches any
// handler, while a clean publish still does.
#[tokio::test]
async fn intervention_drop_prevents_handler_invocation() {
    let runtime = AgentRuntime::new();
    let count = Arc::new(AtomicUsize::new(0));
    let count_for_factory = count.clone();
    runtime
        .register_factory(
            "listener",
            Arc::new(ClosureFactory::new(move || {
                let count = count_for_factory.clone();
                async move {
                    let id = InstantiationContext::current_agent_id()?;
                    Ok(Counting { id, count })
                }
            })),
        )
        .unwrap();
    runtime
        .add_subscription(Box::new(TypeSubscription::new("topic", "listener")))
        .unwrap();
    runtime.add_intervention_handler(Arc::new(DropsForbidden));
    runtime.add_intervention_handler(Arc::new(DefaultInterventionHandler));
    runtime.start().await.unwrap();

    runtime
        .publish_message(json!({"content": "FORBIDDEN now"}), TopicId::new("topic", "s1").unwrap(), None, None, None)
        .await
        .unwrap();
    runtime
        .publish_message(json!({"content": "all good"}), TopicId::new("topic", "s2").unwrap(), None, None, None)
        .await
        .unwrap();
    runtime.stop_when_idle().await.unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

// Scenario 5: a subscription added after a topic has already been published
// once is not required to affect that earlier publish, but a later publish
// on the exact same topic must include the newly added recipient.
#[tokio::test]
async fn subscription_added_after_first_publish_applies_to_next_publish_on_same_topic() {
    let runtime = AgentRuntime::new();
    let count = Arc::new(AtomicUsize::new(0));
    let count_for_factory = count.clone();
    runtime
        .register_factory(
            "late_listener",
            Arc::new(ClosureFactory::new(move || {
                let count = count_for_factory.clone();
                async move {
                    let id = InstantiationContext::current_agent_id()?;
                    Ok(Counting { id, count })
                }
            })),
        )
        .unwrap();
    runtime.start().await.unwrap();

    let topic = TopicId::new("announce", "s1").unwrap();
    runtime.publish_message(json!("before"), topic.clone(), None, None, None).await.unwrap();
    runtime.stop_when_idle().await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 0);

    runtime
        .add_subscription(Box::new(TypeSubscription::new("announce", "late_listener")))
        .unwrap();

    runtime.start().await.unwrap();
    runtime.publish_message(json!("after"), topic, None, None, None).await.unwrap();
    runtime.stop_when_idle().await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

// Scenario 6: a worker's stream closing with a pending RPC in flight fails
// that RPC with a disconnect error, releases the type it owned, and lets a
// different worker claim that type afterward.
#[tokio::test]
async fn distributed_worker_disconnect_fails_pending_rpc_and_frees_type_for_another_worker() {
    let host = Host::new();

    let worker1_runtime = AgentRuntime::new();
    worker1_runtime
        .register_factory(
            "a",
            Arc::new(ClosureFactory::new(|| async {
                let id = InstantiationContext::current_agent_id()?;
                Ok(Echo { id })
            })),
        )
        .unwrap();
    worker1_runtime.start().await.unwrap();
    let worker1 = Worker::new(worker1_runtime.clone());

    let (w1_client, w1_host) = duplex(4096);
    let host_for_w1 = host.clone();
    let _host_task1 = tokio::spawn(async move { host_for_w1.serve_connection(w1_host).await });
    let worker1_for_run = worker1.clone();
    let worker1_run = tokio::spawn(async move { worker1_for_run.run(w1_client).await });

    worker1.register_agent_type("a").await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let caller_runtime = AgentRuntime::new();
    caller_runtime.start().await.unwrap();
    let caller = Worker::new(caller_runtime.clone());
    let (c_client, c_host) = duplex(4096);
    let host_for_caller = host.clone();
    let _host_task2 = tokio::spawn(async move { host_for_caller.serve_connection(c_host).await });
    let caller_for_run = caller.clone();
    let _caller_run = tokio::spawn(async move { caller_for_run.run(c_client).await });

    let source = AgentId::new("caller", "1").unwrap();
    let target = AgentId::new("a", "1").unwrap();
    let pending = tokio::spawn({
        let caller = caller.clone();
        let source = source.clone();
        let target = target.clone();
        async move {
            caller
                .rpc_request(&source, &target, json!("ping"), "json", Some(Duration::from_secs(5)))
                .await
        }
    });

    // give the host time to route the request to worker1 before cutting it off
    tokio::time::sleep(Duration::from_millis(50)).await;
    worker1_run.abort();

    let result = pending.await.unwrap();
    assert!(result.is_err());

    // worker1's claim on "a" must be released before another worker can take it
    tokio::time::sleep(Duration::from_millis(30)).await;

    let worker3_runtime = AgentRuntime::new();
    worker3_runtime
        .register_factory(
            "a",
            Arc::new(ClosureFactory::new(|| async {
                let id = InstantiationContext::current_agent_id()?;
                Ok(Echo { id })
            })),
        )
        .unwrap();
    worker3_runtime.start().await.unwrap();
    let worker3 = Worker::new(worker3_runtime.clone());
    let (w3_client, w3_host) = duplex(4096);
    let host_for_w3 = host.clone();
    let _host_task3 = tokio::spawn(async move { host_for_w3.serve_connection(w3_host).await });
    let worker3_for_run = worker3.clone();
    let _worker3_run = tokio::spawn(async move { worker3_for_run.run(w3_client).await });

    worker3.register_agent_type("a").await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let reply = caller
        .rpc_request(&source, &target, json!("pong"), "json", Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(reply, json!("pong"));
}
