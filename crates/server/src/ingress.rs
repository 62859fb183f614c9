use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use negocia_agent::{AgentRuntime, InboundReply};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport failed to connect: {0}")]
    Connect(String),
    #[error("transport read failed: {0}")]
    Receive(String),
    #[error("transport ack failed: {0}")]
    Acknowledge(String),
    #[error("transport send failed: {0}")]
    Send(String),
    #[error("transport disconnect failed: {0}")]
    Disconnect(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub message_id: String,
    pub user_id: String,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_retries: 5, base_delay_ms: 250, max_delay_ms: 5_000 }
    }
}

impl ReconnectPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// A chat channel that delivers user messages and carries replies back.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    async fn next_message(&self) -> Result<Option<InboundMessage>, TransportError>;
    async fn acknowledge(&self, message_id: &str) -> Result<(), TransportError>;
    async fn send_reply(&self, user_id: &str, text: &str) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[derive(Default)]
pub struct NoopChatTransport;

#[async_trait]
impl ChatTransport for NoopChatTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn next_message(&self) -> Result<Option<InboundMessage>, TransportError> {
        Ok(None)
    }

    async fn acknowledge(&self, _message_id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send_reply(&self, _user_id: &str, _text: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, user_id: &str, text: &str) -> InboundReply;
}

#[async_trait]
impl MessageHandler for AgentRuntime {
    async fn handle(&self, user_id: &str, text: &str) -> InboundReply {
        self.handle_inbound_message(user_id, text).await
    }
}

struct WorkerSlot {
    id: u64,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

type WorkerMap = Arc<Mutex<HashMap<String, WorkerSlot>>>;

/// Pumps messages from a [`ChatTransport`] into one sequential worker per user.
///
/// Each user's messages are handled strictly in arrival order while different
/// users run concurrently. A worker exits after `worker_idle` without traffic
/// and is re-created on the next message.
pub struct IngressRunner {
    transport: Arc<dyn ChatTransport>,
    handler: Arc<dyn MessageHandler>,
    reconnect_policy: ReconnectPolicy,
    worker_idle: Duration,
    workers: WorkerMap,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_worker_id: AtomicU64,
}

impl IngressRunner {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        handler: Arc<dyn MessageHandler>,
        reconnect_policy: ReconnectPolicy,
    ) -> Self {
        Self {
            transport,
            handler,
            reconnect_policy,
            worker_idle: Duration::from_secs(300),
            workers: Arc::default(),
            tasks: Mutex::default(),
            next_worker_id: AtomicU64::new(0),
        }
    }

    pub fn with_worker_idle(mut self, worker_idle: Duration) -> Self {
        self.worker_idle = worker_idle;
        self
    }

    pub fn active_workers(&self) -> usize {
        lock(&self.workers).len()
    }

    pub async fn start(&self) -> Result<()> {
        for attempt in 0..=self.reconnect_policy.max_retries {
            match self.connect_and_pump(attempt).await {
                Ok(()) => return Ok(()),
                Err(transport_error) => {
                    warn!(
                        event_name = "ingress.transport_failed",
                        attempt,
                        max_retries = self.reconnect_policy.max_retries,
                        error = %transport_error,
                        "chat transport failed"
                    );

                    if attempt >= self.reconnect_policy.max_retries {
                        warn!(
                            event_name = "ingress.retries_exhausted",
                            max_retries = self.reconnect_policy.max_retries,
                            "chat transport retries exhausted; continuing process without crash"
                        );
                        return Ok(());
                    }

                    let delay = self.reconnect_policy.backoff(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Ok(())
    }

    /// Closes every worker queue and waits for queued messages to finish.
    pub async fn shutdown(&self) {
        lock(&self.workers).clear();
        let handles = std::mem::take(&mut *lock(&self.tasks));
        for handle in handles {
            if let Err(error) = handle.await {
                warn!(event_name = "ingress.worker_panicked", error = %error, "worker task failed");
            }
        }
    }

    async fn connect_and_pump(&self, attempt: u32) -> Result<(), TransportError> {
        info!(event_name = "ingress.connecting", attempt, "opening chat transport connection");
        self.transport.connect().await?;
        info!(event_name = "ingress.connected", attempt, "chat transport connected");

        loop {
            let Some(message) = self.transport.next_message().await? else {
                info!(event_name = "ingress.stream_closed", attempt, "chat transport stream closed");
                self.transport.disconnect().await?;
                return Ok(());
            };

            debug!(
                event_name = "ingress.message_received",
                message_id = %message.message_id,
                user_id = %message.user_id,
                "received chat message"
            );

            if let Err(error) = self.transport.acknowledge(&message.message_id).await {
                warn!(
                    event_name = "ingress.ack_failed",
                    message_id = %message.message_id,
                    user_id = %message.user_id,
                    error = %error,
                    "failed to acknowledge chat message"
                );
            }

            self.dispatch(message);
        }
    }

    fn dispatch(&self, message: InboundMessage) {
        let mut workers = lock(&self.workers);

        let message = match workers.get(&message.user_id) {
            Some(slot) => match slot.sender.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let user_id = message.user_id.clone();
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        if sender.send(message).is_err() {
            return;
        }
        workers.insert(user_id.clone(), WorkerSlot { id, sender });
        drop(workers);

        debug!(event_name = "ingress.worker_started", user_id = %user_id, "user worker started");
        let handle = tokio::spawn(run_worker(Worker {
            user_id,
            id,
            receiver,
            handler: self.handler.clone(),
            transport: self.transport.clone(),
            workers: self.workers.clone(),
            idle: self.worker_idle,
        }));

        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }
}

struct Worker {
    user_id: String,
    id: u64,
    receiver: mpsc::UnboundedReceiver<InboundMessage>,
    handler: Arc<dyn MessageHandler>,
    transport: Arc<dyn ChatTransport>,
    workers: WorkerMap,
    idle: Duration,
}

async fn run_worker(mut worker: Worker) {
    loop {
        let message = match tokio::time::timeout(worker.idle, worker.receiver.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(_) => match retire_or_take(&mut worker) {
                Some(message) => message,
                None => break,
            },
        };

        let reply = worker.handler.handle(&message.user_id, &message.text).await;
        if let Err(error) = worker.transport.send_reply(&message.user_id, &reply.reply_text).await {
            warn!(
                event_name = "ingress.reply_failed",
                message_id = %message.message_id,
                user_id = %message.user_id,
                flow_state = reply.current_state.as_str(),
                error = %error,
                "failed to deliver reply"
            );
        }
    }

    debug!(event_name = "ingress.worker_stopped", user_id = %worker.user_id, "user worker stopped");
}

// Under the map lock no new message can reach this queue, so an empty queue
// here is safe to retire.
fn retire_or_take(worker: &mut Worker) -> Option<InboundMessage> {
    let mut workers = lock(&worker.workers);
    if let Ok(message) = worker.receiver.try_recv() {
        return Some(message);
    }
    if workers.get(&worker.user_id).is_some_and(|slot| slot.id == worker.id) {
        workers.remove(&worker.user_id);
    }
    None
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use negocia_agent::InboundReply;
    use negocia_core::FlowState;
    use tokio::sync::Mutex;

    use super::{
        ChatTransport, InboundMessage, IngressRunner, MessageHandler, ReconnectPolicy,
        TransportError,
    };

    #[derive(Default)]
    struct ScriptedTransport {
        state: Mutex<ScriptedState>,
    }

    #[derive(Default)]
    struct ScriptedState {
        connect_results: VecDeque<Result<(), TransportError>>,
        messages: VecDeque<Result<Option<InboundMessage>, TransportError>>,
        connect_attempts: usize,
        acknowledgements: Vec<String>,
        replies: Vec<(String, String)>,
        failing_acks: usize,
        failing_replies: usize,
    }

    impl ScriptedTransport {
        fn with_script(
            connect_results: Vec<Result<(), TransportError>>,
            messages: Vec<Result<Option<InboundMessage>, TransportError>>,
        ) -> Self {
            Self {
                state: Mutex::new(ScriptedState {
                    connect_results: connect_results.into(),
                    messages: messages.into(),
                    ..ScriptedState::default()
                }),
            }
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn connect(&self) -> Result<(), TransportError> {
            let mut state = self.state.lock().await;
            state.connect_attempts += 1;
            state.connect_results.pop_front().unwrap_or(Ok(()))
        }

        async fn next_message(&self) -> Result<Option<InboundMessage>, TransportError> {
            self.state.lock().await.messages.pop_front().unwrap_or(Ok(None))
        }

        async fn acknowledge(&self, message_id: &str) -> Result<(), TransportError> {
            let mut state = self.state.lock().await;
            if state.failing_acks > 0 {
                state.failing_acks -= 1;
                return Err(TransportError::Acknowledge(format!("{message_id} rejected")));
            }
            state.acknowledgements.push(message_id.to_owned());
            Ok(())
        }

        async fn send_reply(&self, user_id: &str, text: &str) -> Result<(), TransportError> {
            let mut state = self.state.lock().await;
            if state.failing_replies > 0 {
                state.failing_replies -= 1;
                return Err(TransportError::Send("channel closed".to_owned()));
            }
            state.replies.push((user_id.to_owned(), text.to_owned()));
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Slower on earlier messages so out-of-order handling would show up.
    #[derive(Default)]
    struct RecordingHandler {
        handled: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, user_id: &str, text: &str) -> InboundReply {
            let delay = match text {
                "first" => 30,
                "second" => 10,
                _ => 0,
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.handled.lock().await.push((user_id.to_owned(), text.to_owned()));
            InboundReply { reply_text: format!("echo {text}"), current_state: FlowState::Initial }
        }
    }

    fn message(id: &str, user: &str, text: &str) -> Result<Option<InboundMessage>, TransportError> {
        Ok(Some(InboundMessage {
            message_id: id.to_owned(),
            user_id: user.to_owned(),
            text: text.to_owned(),
        }))
    }

    fn no_delay(max_retries: u32) -> ReconnectPolicy {
        ReconnectPolicy { max_retries, base_delay_ms: 0, max_delay_ms: 0 }
    }

    #[tokio::test(start_paused = true)]
    async fn messages_from_one_user_are_handled_in_arrival_order() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![],
            vec![
                message("m1", "u1", "first"),
                message("m2", "u2", "other"),
                message("m3", "u1", "second"),
                message("m4", "u1", "third"),
                Ok(None),
            ],
        ));
        let handler = Arc::new(RecordingHandler::default());
        let runner = IngressRunner::new(transport.clone(), handler.clone(), no_delay(0));

        runner.start().await.expect("runner completes");
        runner.shutdown().await;

        let handled = handler.handled.lock().await.clone();
        let for_u1 = handled
            .iter()
            .filter(|(user, _)| user == "u1")
            .map(|(_, text)| text.as_str())
            .collect::<Vec<_>>();
        assert_eq!(for_u1, vec!["first", "second", "third"]);
        assert_eq!(handled.len(), 4);

        let state = transport.state.lock().await;
        assert_eq!(state.acknowledgements, vec!["m1", "m2", "m3", "m4"]);
        assert!(state.replies.contains(&("u1".to_owned(), "echo third".to_owned())));
        assert_eq!(runner.active_workers(), 0);
    }

    #[tokio::test]
    async fn reconnects_after_a_dropped_stream() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![Err(TransportError::Connect("network down".to_owned())), Ok(()), Ok(())],
            vec![
                message("m1", "u1", "oi"),
                Err(TransportError::Receive("socket reset".to_owned())),
                message("m2", "u1", "ainda aqui"),
                Ok(None),
            ],
        ));
        let handler = Arc::new(RecordingHandler::default());
        let runner = IngressRunner::new(transport.clone(), handler.clone(), no_delay(3));

        runner.start().await.expect("runner should not fail");
        runner.shutdown().await;

        assert_eq!(transport.state.lock().await.connect_attempts, 3);
        let texts = handler
            .handled
            .lock()
            .await
            .iter()
            .map(|(_, text)| text.clone())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["oi".to_owned(), "ainda aqui".to_owned()]);
    }

    #[tokio::test]
    async fn exhausts_retries_without_crashing() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![
                Err(TransportError::Connect("fail-1".to_owned())),
                Err(TransportError::Connect("fail-2".to_owned())),
                Err(TransportError::Connect("fail-3".to_owned())),
            ],
            vec![],
        ));
        let runner =
            IngressRunner::new(transport.clone(), Arc::new(RecordingHandler::default()), no_delay(2));

        runner.start().await.expect("runner should degrade gracefully");
        assert_eq!(transport.state.lock().await.connect_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_workers_retire_and_restart_on_demand() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![],
            vec![message("m1", "u1", "oi"), Ok(None)],
        ));
        let handler = Arc::new(RecordingHandler::default());
        let runner = IngressRunner::new(transport.clone(), handler.clone(), no_delay(0))
            .with_worker_idle(Duration::from_secs(5));

        runner.start().await.expect("first session");
        assert_eq!(runner.active_workers(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(runner.active_workers(), 0);

        transport.state.lock().await.messages.extend([message("m2", "u1", "voltei"), Ok(None)]);
        runner.start().await.expect("second session");
        runner.shutdown().await;

        assert_eq!(handler.handled.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn delivery_failures_do_not_stop_the_worker() {
        let transport = Arc::new(ScriptedTransport::with_script(
            vec![],
            vec![message("m1", "u1", "oi"), message("m2", "u1", "tudo bem?"), Ok(None)],
        ));
        {
            let mut state = transport.state.lock().await;
            state.failing_acks = 1;
            state.failing_replies = 1;
        }
        let handler = Arc::new(RecordingHandler::default());
        let runner = IngressRunner::new(transport.clone(), handler.clone(), no_delay(0));

        runner.start().await.expect("runner completes");
        runner.shutdown().await;

        assert_eq!(handler.handled.lock().await.len(), 2);
        let state = transport.state.lock().await;
        assert_eq!(state.acknowledgements, vec!["m2"]);
        assert_eq!(state.replies, vec![("u1".to_owned(), "echo tudo bem?".to_owned())]);
        assert_eq!(state.connect_attempts, 1);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(250));
        assert_eq!(policy.backoff(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(10), Duration::from_millis(5_000));
    }
}
