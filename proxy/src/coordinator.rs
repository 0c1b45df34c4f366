//! Per-uid run coordinator.
//!
//! One `tokio::spawn`ed actor task per uid owns a mailbox and is the single
//! writer of that uid's Run state; the [`Coordinator`] never touches a
//! Run's fields directly; it only sends [`ActorMsg`] values into the
//! actor's mailbox. This is the single-writer discipline a multi-threaded
//! executor needs without locks: one task per Run with a mailbox.

use std::{collections::HashMap, sync::Arc, time::Duration};

use jiff::Timestamp;
use llm::{Adapter, DriveInput, build_adapter, messages::NormalizedBody, provider::ProviderKind};
use secrecy::SecretString;
use serde_json::Value;
use std::str::FromStr;
use store::{Delta, DeltaLog, KvStore, keys};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    notifier::Notifier,
    protocol::{BeginMessage, ClientMessage, PollResponse, ServerMessage, StopMessage},
    run::{Phase, Snapshot},
    sanitize,
};

/// Batching/timeout tunables, sourced from [`config::Config`] rather than
/// hardcoded so tests can shrink them.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// Size trigger for flushing `pending` into a `Delta`.
    pub batch_bytes: usize,
    /// Time trigger for flushing `pending`, armed on first byte into an empty buffer.
    pub batch_ms: Duration,
    /// Hard wall-clock limit on a `running` Run.
    pub max_run_ms: Duration,
    /// TTL applied to every KV entry this coordinator writes.
    pub kv_ttl: Duration,
    /// Interval of the background sweep.
    pub sweep_interval: Duration,
}

/// Messages accepted by a per-uid actor's mailbox.
pub enum ActorMsg {
    /// A socket has joined this uid's subscriber set.
    Attach {
        /// Identifies the socket for later `Detach`/broadcast bookkeeping.
        socket_id: u64,
        /// Channel the actor sends outbound frames into for this socket.
        tx: mpsc::UnboundedSender<ServerMessage>,
    },
    /// A socket has closed.
    Detach {
        /// The socket to remove from the subscriber set.
        socket_id: u64,
    },
    /// A parsed, well-typed inbound frame from a still-open socket.
    Client {
        /// Which socket sent it (needed to reply to a lone `busy`/replay without broadcasting).
        socket_id: u64,
        /// The parsed message.
        message: ClientMessage,
    },
    /// An HTTP poll request; the actor computes the current view and replies.
    Poll {
        /// Where to send the computed [`PollResponse`].
        reply: oneshot::Sender<PollResponse>,
    },
    /// Periodic nudge from the background sweep.
    Sweep,
}

/// Builds the adapter that drives one `begin` call. Defaults to
/// [`build_adapter`] against the real upstream; tests substitute a fake
/// [`llm::Adapter`] so the coordinator's state machine can be exercised
/// without a network.
type AdapterFactory = Arc<dyn Fn(ProviderKind) -> Box<dyn Adapter> + Send + Sync>;

/// Owns the uid → actor-mailbox table and the background sweep task.
pub struct Coordinator {
    store: Arc<dyn KvStore>,
    delta_log: DeltaLog,
    notifier: Notifier,
    config: CoordinatorConfig,
    adapter_factory: AdapterFactory,
    actors: Arc<dashmap::DashMap<String, mpsc::UnboundedSender<ActorMsg>>>,
}

impl Coordinator {
    /// Build a coordinator over `store`, notifying via `notifier`.
    pub fn new(store: Arc<dyn KvStore>, notifier: Notifier, config: CoordinatorConfig) -> Self {
        Self::with_adapter_factory(store, notifier, config, Arc::new(|kind| build_adapter(kind, None)))
    }

    /// Like [`Self::new`], but substitutes `adapter_factory` for the default
    /// real-upstream one. Exposed beyond `#[cfg(test)]` only because a future
    /// caller may want to point at a non-default base URL per environment;
    /// production code should keep using [`Self::new`].
    pub fn with_adapter_factory(
        store: Arc<dyn KvStore>,
        notifier: Notifier,
        config: CoordinatorConfig,
        adapter_factory: AdapterFactory,
    ) -> Self {
        let delta_log = DeltaLog::new(store.clone(), config.kv_ttl);
        Self {
            store,
            delta_log,
            notifier,
            config,
            adapter_factory,
            actors: Arc::new(dashmap::DashMap::new()),
        }
    }

    /// Get this uid's actor mailbox, spawning a fresh `idle` actor on first
    /// use: lazily, on first socket attach, first begin, or first poll.
    pub fn handle(&self, uid: &str) -> mpsc::UnboundedSender<ActorMsg> {
        if let Some(existing) = self.actors.get(uid) {
            return existing.clone();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.actors.insert(uid.to_string(), tx.clone());

        let shared = ActorShared {
            uid: uid.to_string(),
            store: self.store.clone(),
            delta_log: self.delta_log.clone(),
            notifier: self.notifier.clone(),
            config: self.config,
            adapter_factory: self.adapter_factory.clone(),
            actors: self.actors.clone(),
        };
        tokio::spawn(run_actor(rx, shared));

        tx
    }

    /// Compute the HTTP poll view for `uid`.
    pub async fn poll(&self, uid: &str) -> PollResponse {
        let (reply, rx) = oneshot::channel();
        let _ = self.handle(uid).send(ActorMsg::Poll { reply });
        rx.await.unwrap_or_else(|_| PollResponse::sentinel())
    }

    /// Spawn the background sweep: nudges every live actor every
    /// `config.sweep_interval` so it can self-evict or force-timeout.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for entry in this.actors.iter() {
                            let _ = entry.value().send(ActorMsg::Sweep);
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}

#[derive(Clone)]
struct ActorShared {
    uid: String,
    store: Arc<dyn KvStore>,
    delta_log: DeltaLog,
    notifier: Notifier,
    config: CoordinatorConfig,
    adapter_factory: AdapterFactory,
    actors: Arc<dashmap::DashMap<String, mpsc::UnboundedSender<ActorMsg>>>,
}

/// Outcome of a periodic sweep over this uid's Run.
#[derive(Debug, PartialEq, Eq)]
enum SweepOutcome {
    /// Terminal and empty of sockets: caller evicts this uid's actor.
    Evict,
    /// A running Run was force-failed for exceeding `max_run_ms`.
    TimedOut,
    /// Nothing needed doing.
    Continue,
}

/// Mutable, single-writer Run state for one uid. Never shared across tasks;
/// only `run_actor`'s own loop mutates it.
struct RunState {
    rid: Option<String>,
    seq: i64,
    phase: Phase,
    error: Option<String>,
    started_at: Option<i64>,
    pending: String,
    pending_images: Vec<Value>,
    sockets: HashMap<u64, mpsc::UnboundedSender<ServerMessage>>,
    controller: CancellationToken,
}

impl RunState {
    fn idle() -> Self {
        Self {
            rid: None,
            seq: -1,
            phase: Phase::Idle,
            error: None,
            started_at: None,
            pending: String::new(),
            pending_images: Vec::new(),
            sockets: HashMap::new(),
            controller: CancellationToken::new(),
        }
    }

    fn broadcast(&self, message: ServerMessage) {
        for tx in self.sockets.values() {
            // Best-effort; a dropped receiver means the socket is closing
            // and will send its own `Detach` shortly.
            let _ = tx.send(message.clone());
        }
    }

    fn send_to(&self, socket_id: u64, message: ServerMessage) {
        if let Some(tx) = self.sockets.get(&socket_id) {
            let _ = tx.send(message);
        }
    }

    async fn persist_snapshot(&self, shared: &ActorShared) {
        let Some(rid) = &self.rid else { return };
        let snapshot = Snapshot {
            rid: rid.clone(),
            seq: self.seq,
            phase: self.phase,
            error: self.error.clone(),
            started_at: self.started_at,
        };
        let value = serde_json::to_value(&snapshot).expect("Snapshot serialization is infallible");
        shared.store.set(&keys::run(rid), value, shared.config.kv_ttl).await;
    }

    /// Flush `pending`/`pending_images` into a new `Delta`. A non-forced
    /// flush of an empty buffer is a no-op; a forced flush always persists
    /// the Snapshot.
    async fn flush(&mut self, shared: &ActorShared, force: bool) {
        let has_content = !self.pending.is_empty() || !self.pending_images.is_empty();
        if !has_content && !force {
            return;
        }

        if has_content {
            let Some(rid) = self.rid.clone() else { return };
            self.seq += 1;
            let delta = Delta {
                seq: self.seq as u64,
                text: std::mem::take(&mut self.pending),
                images: std::mem::take(&mut self.pending_images),
            };
            shared.delta_log.append(&rid, &delta).await;
            self.broadcast(ServerMessage::Delta {
                seq: delta.seq,
                text: delta.text,
                images: delta.images,
            });
        }

        if force {
            self.persist_snapshot(shared).await;
        }
    }

    /// Queue the synthetic failure trailer, flush what's pending first (so
    /// it lands as its own delta), then the trailer as a forced final flush.
    async fn fail(&mut self, shared: &ActorShared, message: String) {
        self.flush(shared, false).await;

        self.pending.push_str(&format!("\n\nRun failed: {message}"));
        self.phase = Phase::Error;
        self.error = Some(message.clone());

        self.flush(shared, true).await;
        self.controller.cancel();

        self.broadcast(ServerMessage::Err { message: message.clone() });
        shared.notifier.notify_detached(format!("Run failed: {message}"), 4, &["run", "error"]);
    }

    async fn succeed(&mut self, shared: &ActorShared) {
        self.flush(shared, true).await;
        self.phase = Phase::Done;
        self.controller.cancel();

        self.broadcast(ServerMessage::Done);
        shared.notifier.notify_detached("Run finished", 2, &["run", "done"]);
    }

    async fn begin(
        &mut self,
        shared: &ActorShared,
        socket_id: u64,
        begin: BeginMessage,
    ) -> Option<(JoinHandle<anyhow::Result<()>>, mpsc::UnboundedReceiver<llm::AdapterDelta>)> {
        let Some(rid) = begin.rid.clone().filter(|r| !r.is_empty()) else {
            self.send_to(socket_id, ServerMessage::missing_fields());
            return None;
        };
        let Some(api_key) = begin.api_key.clone().filter(|k| !k.is_empty()) else {
            self.send_to(socket_id, ServerMessage::missing_fields());
            return None;
        };

        // Resume: same rid on a non-idle Run is replay-only, no state change.
        if self.phase != Phase::Idle && self.rid.as_deref() == Some(rid.as_str()) {
            self.replay(shared, socket_id, begin.after).await;
            return None;
        }

        // A second rid while a Run is actively running is rejected; the
        // running Run is left completely untouched.
        if self.phase == Phase::Running {
            self.send_to(socket_id, ServerMessage::busy());
            return None;
        }

        let body = match begin.normalized_body() {
            Ok(body) => body,
            Err(_) => {
                self.send_to(socket_id, ServerMessage::missing_fields());
                return None;
            }
        };
        if body.messages.is_empty() {
            self.send_to(socket_id, ServerMessage::missing_fields());
            return None;
        }

        let provider = begin
            .provider
            .as_deref()
            .and_then(|p| ProviderKind::from_str(p).ok())
            .unwrap_or_default();

        Some(self.start(shared, rid, api_key, provider, body).await)
    }

    async fn replay(&self, shared: &ActorShared, socket_id: u64, after: i64) {
        let Some(rid) = &self.rid else { return };
        for delta in shared.delta_log.read_after(rid, after).await {
            self.send_to(
                socket_id,
                ServerMessage::Delta {
                    seq: delta.seq,
                    text: delta.text,
                    images: delta.images,
                },
            );
        }

        match self.phase {
            Phase::Done => self.send_to(socket_id, ServerMessage::Done),
            Phase::Error | Phase::Evicted => self.send_to(
                socket_id,
                ServerMessage::Err {
                    message: self.error.clone().unwrap_or_default(),
                },
            ),
            Phase::Idle | Phase::Running => {}
        }
    }

    async fn start(
        &mut self,
        shared: &ActorShared,
        rid: String,
        api_key: String,
        provider: ProviderKind,
        mut body: NormalizedBody,
    ) -> (JoinHandle<anyhow::Result<()>>, mpsc::UnboundedReceiver<llm::AdapterDelta>) {
        let sanitized = sanitize::sanitize_messages(&body.messages);
        body.messages = sanitized.clone();

        self.rid = Some(rid.clone());
        self.seq = -1;
        self.pending.clear();
        self.pending_images.clear();
        self.phase = Phase::Running;
        self.error = None;
        self.started_at = Some(now_millis());
        self.controller = CancellationToken::new();

        self.persist_snapshot(shared).await;
        shared
            .store
            .set(
                &keys::prompt(&rid),
                serde_json::to_value(&sanitized).expect("messages serialize"),
                shared.config.kv_ttl,
            )
            .await;

        let (delta_tx, delta_rx) = mpsc::unbounded_channel();
        let adapter = (shared.adapter_factory)(provider);
        let input = DriveInput {
            api_key: SecretString::from(api_key),
            body,
            cancel: self.controller.clone(),
            on_delta: delta_tx,
        };
        let handle = tokio::spawn(async move { adapter.drive(input).await });

        (handle, delta_rx)
    }

    /// Returns whether this call actually stopped a running Run, so the
    /// caller knows whether it must also cancel its own `flush_deadline`.
    async fn stop(&mut self, shared: &ActorShared, stop: StopMessage) -> bool {
        if self.phase != Phase::Running {
            return false; // cancellation is idempotent: no-op on a non-running Run
        }
        if stop.rid.as_deref() != self.rid.as_deref() {
            return false;
        }

        self.flush(shared, true).await;
        self.phase = Phase::Done;
        self.controller.cancel();

        self.broadcast(ServerMessage::Done);
        shared.notifier.notify_detached("Run stopped", 1, &["run", "stop"]);
        true
    }

    /// Append `delta` to the pending buffers, flushing immediately on the
    /// size or image trigger. The time trigger is armed/disarmed by the
    /// actor loop around this call, since
    /// it alone owns the `flush_deadline` timer.
    async fn on_adapter_delta(&mut self, shared: &ActorShared, delta: llm::AdapterDelta) {
        let has_images = !delta.images.is_empty();

        self.pending.push_str(&delta.text);
        self.pending_images.extend(delta.images);

        if has_images || self.pending.len() >= shared.config.batch_bytes {
            self.flush(shared, false).await;
        }
    }

    async fn on_adapter_finished(&mut self, shared: &ActorShared, result: Result<anyhow::Result<()>, tokio::task::JoinError>) {
        if self.phase != Phase::Running {
            return; // already stopped or timed out; suppress
        }
        if self.controller.is_cancelled() {
            return; // cancellation raced the adapter's return; not a failure
        }

        match result {
            Ok(Ok(())) => self.succeed(shared).await,
            Ok(Err(e)) => self.fail(shared, e.to_string()).await,
            Err(join_error) => self.fail(shared, format!("internal error: {join_error}")).await,
        }
    }

    async fn on_sweep(&mut self, shared: &ActorShared) -> SweepOutcome {
        if self.phase.is_terminal() && self.sockets.is_empty() {
            return SweepOutcome::Evict; // caller removes this uid's mailbox and ends the task
        }

        if self.phase == Phase::Running {
            if let Some(started_at) = self.started_at {
                let elapsed = now_millis() - started_at;
                if elapsed >= shared.config.max_run_ms.as_millis() as i64 {
                    let minutes = shared.config.max_run_ms.as_secs() / 60;
                    self.fail(shared, format!("Run timed out after {minutes} minutes.")).await;
                    return SweepOutcome::TimedOut;
                }
            }
        }

        SweepOutcome::Continue
    }

    async fn poll_response(&self, shared: &ActorShared) -> PollResponse {
        let Some(rid) = &self.rid else {
            return PollResponse::sentinel();
        };

        let mut text = shared.delta_log.concat_text(rid).await;
        text.push_str(&self.pending);

        let mut images = shared.delta_log.concat_images(rid).await;
        images.extend(self.pending_images.clone());

        PollResponse {
            rid: Some(rid.clone()),
            seq: self.seq,
            phase: self.phase,
            done: self.phase.is_terminal(),
            error: self.error.clone(),
            text,
            images,
        }
    }
}

fn now_millis() -> i64 {
    Timestamp::now().as_millisecond()
}

async fn recv_delta(rx: &mut Option<mpsc::UnboundedReceiver<llm::AdapterDelta>>) -> Option<llm::AdapterDelta> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn join_adapter(handle: &mut Option<JoinHandle<anyhow::Result<()>>>) -> Result<anyhow::Result<()>, tokio::task::JoinError> {
    match handle {
        Some(h) => h.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The per-uid actor loop: the sole writer of this uid's [`RunState`].
async fn run_actor(mut mailbox: mpsc::UnboundedReceiver<ActorMsg>, shared: ActorShared) {
    let mut state = RunState::idle();
    let mut delta_rx: Option<mpsc::UnboundedReceiver<llm::AdapterDelta>> = None;
    let mut adapter_handle: Option<JoinHandle<anyhow::Result<()>>> = None;
    let mut flush_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            maybe_msg = mailbox.recv() => {
                let Some(msg) = maybe_msg else { break };
                match msg {
                    ActorMsg::Attach { socket_id, tx } => {
                        state.sockets.insert(socket_id, tx);
                    }
                    ActorMsg::Detach { socket_id } => {
                        state.sockets.remove(&socket_id);
                    }
                    ActorMsg::Client { socket_id, message } => match message {
                        ClientMessage::Begin(begin) => {
                            if let Some((handle, rx)) = state.begin(&shared, socket_id, begin).await {
                                if let Some(old_handle) = adapter_handle.take() {
                                    old_handle.abort();
                                }
                                adapter_handle = Some(handle);
                                delta_rx = Some(rx);
                            }
                        }
                        ClientMessage::Stop(stop) => {
                            if state.stop(&shared, stop).await {
                                flush_deadline = None;
                            }
                        }
                        ClientMessage::Unknown => {
                            state.send_to(socket_id, ServerMessage::bad_type());
                        }
                    },
                    ActorMsg::Poll { reply } => {
                        let _ = reply.send(state.poll_response(&shared).await);
                    }
                    ActorMsg::Sweep => match state.on_sweep(&shared).await {
                        SweepOutcome::Evict => {
                            shared.actors.remove(&shared.uid);
                            break;
                        }
                        SweepOutcome::TimedOut => {
                            flush_deadline = None;
                        }
                        SweepOutcome::Continue => {}
                    },
                }
            }
            Some(delta) = recv_delta(&mut delta_rx) => {
                let was_empty = state.pending.is_empty() && state.pending_images.is_empty();
                state.on_adapter_delta(&shared, delta).await;
                if state.pending.is_empty() && state.pending_images.is_empty() {
                    flush_deadline = None; // the delta flushed immediately
                } else if was_empty && flush_deadline.is_none() {
                    flush_deadline = Some(Instant::now() + shared.config.batch_ms);
                }
            }
            result = join_adapter(&mut adapter_handle) => {
                // Drain anything the adapter sent just before returning: a
                // send into the unbounded channel happens-before the task's
                // completion is observable, so everything is already queued.
                if let Some(rx) = delta_rx.as_mut() {
                    while let Ok(delta) = rx.try_recv() {
                        state.on_adapter_delta(&shared, delta).await;
                    }
                }
                adapter_handle = None;
                delta_rx = None;
                flush_deadline = None;
                state.on_adapter_finished(&shared, result).await;
            }
            _ = sleep_until_opt(flush_deadline) => {
                flush_deadline = None;
                state.flush(&shared, false).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm::AdapterDelta;
    use store::MemoryKvStore;

    /// A scripted [`Adapter`] for driving the coordinator's state machine
    /// without a network: emits a fixed sequence of text deltas, then either
    /// returns `Ok(())` or fails with a message.
    struct ScriptedAdapter {
        texts: Vec<&'static str>,
        failure: Option<&'static str>,
    }

    #[async_trait::async_trait]
    impl Adapter for ScriptedAdapter {
        async fn drive(&self, input: llm::DriveInput) -> anyhow::Result<()> {
            for text in &self.texts {
                let _ = input.on_delta.send(AdapterDelta {
                    text: text.to_string(),
                    images: vec![],
                });
            }
            match self.failure {
                Some(message) => Err(anyhow::anyhow!(message)),
                None => Ok(()),
            }
        }
    }

    /// An [`Adapter`] that never returns until cancelled, polling
    /// `is_running()`.
    struct HangingAdapter;

    #[async_trait::async_trait]
    impl Adapter for HangingAdapter {
        async fn drive(&self, input: llm::DriveInput) -> anyhow::Result<()> {
            loop {
                if !input.is_running() {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    fn test_shared(config: CoordinatorConfig) -> ActorShared {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        ActorShared {
            uid: "u1".to_string(),
            delta_log: DeltaLog::new(store.clone(), config.kv_ttl),
            store,
            notifier: Notifier::new(None),
            config,
            adapter_factory: Arc::new(|_kind| Box::new(HangingAdapter) as Box<dyn Adapter>),
            actors: Arc::new(dashmap::DashMap::new()),
        }
    }

    fn default_config() -> CoordinatorConfig {
        CoordinatorConfig {
            batch_bytes: 3400,
            batch_ms: Duration::from_millis(800),
            max_run_ms: Duration::from_secs(9 * 60),
            kv_ttl: Duration::from_secs(20 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }

    fn begin_message(rid: &str, api_key: &str, after: i64) -> BeginMessage {
        BeginMessage {
            rid: Some(rid.to_string()),
            api_key: Some(api_key.to_string()),
            provider: None,
            or_body: None,
            model: Some("m".to_string()),
            messages: Some(vec![llm::messages::Message {
                role: llm::messages::Role::User,
                content: llm::messages::Content::Text("hi".to_string()),
            }]),
            after,
            temperature: None,
            top_p: None,
            max_tokens: None,
            reasoning: None,
            verbosity: None,
            response_format: None,
        }
    }

    fn recv_all(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn socket() -> (mpsc::UnboundedSender<ServerMessage>, mpsc::UnboundedReceiver<ServerMessage>) {
        mpsc::unbounded_channel()
    }

    /// A full happy path: adapter emits `"hel"` then `"lo"`, returns
    /// normally; the socket sees a `done` frame and the delta-text
    /// concatenation is `"hello"`, and polling afterwards reports
    /// `phase: done`.
    #[tokio::test]
    async fn happy_path_flushes_then_broadcasts_done() {
        let shared = test_shared(default_config());
        let mut state = RunState::idle();
        let (tx, mut rx) = socket();
        state.sockets.insert(1, tx);

        let begin = state.begin(&shared, 1, begin_message("r1", "K", -1)).await;
        assert!(begin.is_some(), "fresh rid on an idle Run must start");

        // Drive a scripted adapter's output directly against the Run's own
        // buffers, the way the actor loop's `recv_delta` arm would.
        for text in ["hel", "lo"] {
            state
                .on_adapter_delta(
                    &shared,
                    AdapterDelta {
                        text: text.to_string(),
                        images: vec![],
                    },
                )
                .await;
        }
        state.on_adapter_finished(&shared, Ok(Ok(()))).await;

        let messages = recv_all(&mut rx);
        let text: String = messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Delta { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "hello");
        assert!(matches!(messages.last(), Some(ServerMessage::Done)));

        let poll = state.poll_response(&shared).await;
        assert_eq!(poll.phase, Phase::Done);
        assert!(poll.done);
        assert_eq!(poll.text, "hello");
        assert_eq!(poll.error, None);
    }

    /// 3401 contiguous bytes in one adapter call produce exactly one
    /// `seq=0` delta of that exact length, via the size trigger rather than
    /// the time-based flush timer.
    #[tokio::test]
    async fn batch_boundary_flushes_immediately_on_size_trigger() {
        let config = CoordinatorConfig {
            batch_bytes: 3400,
            ..default_config()
        };
        let shared = test_shared(config);
        let mut state = RunState::idle();
        let (tx, mut rx) = socket();
        state.sockets.insert(1, tx);
        state.begin(&shared, 1, begin_message("r1", "K", -1)).await;

        let payload = "a".repeat(3401);
        state
            .on_adapter_delta(
                &shared,
                AdapterDelta {
                    text: payload.clone(),
                    images: vec![],
                },
            )
            .await;

        let messages = recv_all(&mut rx);
        let deltas: Vec<_> = messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Delta { seq, text, .. } => Some((*seq, text.clone())),
                _ => None,
            })
            .collect();

        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].0, 0);
        assert_eq!(deltas[0].1.len(), 3401);
    }

    /// A second `rid` while a Run is `running` is rejected with `busy`,
    /// and the running Run's phase/seq/buffers are untouched.
    #[tokio::test]
    async fn busy_rejection_leaves_running_run_untouched() {
        let shared = test_shared(default_config());
        let mut state = RunState::idle();
        let (tx, mut rx) = socket();
        state.sockets.insert(1, tx);

        state.begin(&shared, 1, begin_message("r1", "K", -1)).await;
        state
            .on_adapter_delta(&shared, AdapterDelta { text: "partial".to_string(), images: vec![] })
            .await;
        let _ = recv_all(&mut rx);

        let phase_before = state.phase;
        let seq_before = state.seq;
        let pending_before = state.pending.clone();

        state.begin(&shared, 1, begin_message("r2", "K", -1)).await;

        let messages = recv_all(&mut rx);
        assert!(matches!(
            messages.as_slice(),
            [ServerMessage::Err { message }] if message == "busy"
        ));
        assert_eq!(state.phase, phase_before);
        assert_eq!(state.seq, seq_before);
        assert_eq!(state.pending, pending_before);
        assert_eq!(state.rid.as_deref(), Some("r1"));
    }

    /// Reconnecting with the same `rid` on a terminal Run replays every
    /// delta with `seq > after` then the terminal signal, without starting
    /// a new adapter call.
    #[tokio::test]
    async fn replay_delivers_recorded_deltas_then_terminal_signal() {
        let shared = test_shared(default_config());
        let mut state = RunState::idle();
        let (tx, mut rx) = socket();
        state.sockets.insert(1, tx);

        state.begin(&shared, 1, begin_message("r1", "K", -1)).await;
        for text in ["hel", "lo"] {
            state
                .on_adapter_delta(&shared, AdapterDelta { text: text.to_string(), images: vec![] })
                .await;
        }
        state.on_adapter_finished(&shared, Ok(Ok(()))).await;
        let _ = recv_all(&mut rx);

        let (tx2, mut rx2) = socket();
        state.sockets.insert(2, tx2);
        state.begin(&shared, 2, begin_message("r1", "K", -1)).await;

        let messages = recv_all(&mut rx2);
        let text: String = messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Delta { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "hello");
        assert!(matches!(messages.last(), Some(ServerMessage::Done)));
    }

    /// The adapter emits `"par"` then fails with `"boom"`; the synthetic
    /// trailer lands as its own delta, followed by a terminal `err`, and
    /// polling reports the failure.
    #[tokio::test]
    async fn failure_trailer_is_appended_then_terminal_err_sent() {
        let shared = test_shared(default_config());
        let mut state = RunState::idle();
        let (tx, mut rx) = socket();
        state.sockets.insert(1, tx);

        state.begin(&shared, 1, begin_message("r1", "K", -1)).await;
        state
            .on_adapter_delta(&shared, AdapterDelta { text: "par".to_string(), images: vec![] })
            .await;
        state
            .on_adapter_finished(&shared, Ok(Err(anyhow::anyhow!("boom"))))
            .await;

        let messages = recv_all(&mut rx);
        let text: String = messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Delta { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "par\n\nRun failed: boom");
        assert!(matches!(messages.last(), Some(ServerMessage::Err { message }) if message == "boom"));

        let poll = state.poll_response(&shared).await;
        assert_eq!(poll.phase, Phase::Error);
        assert!(poll.done);
        assert_eq!(poll.error.as_deref(), Some("boom"));
        assert_eq!(poll.text, "par\n\nRun failed: boom");
    }

    /// A Run whose adapter never returns is force-failed once
    /// `max_run_ms` has elapsed, with a message matching `/timed out/`, and
    /// any buffered pending text is flushed as its own delta first.
    #[tokio::test]
    async fn sweep_times_out_an_overlong_running_run() {
        let shared = test_shared(default_config());
        let mut state = RunState::idle();
        let (tx, mut rx) = socket();
        state.sockets.insert(1, tx);

        state.begin(&shared, 1, begin_message("r1", "K", -1)).await;
        state
            .on_adapter_delta(&shared, AdapterDelta { text: "stuck".to_string(), images: vec![] })
            .await;
        // Backdate started_at well past max_run_ms instead of racing the
        // real clock against a tiny configured timeout.
        state.started_at = Some(now_millis() - shared.config.max_run_ms.as_millis() as i64 - 1);
        assert_eq!(state.on_sweep(&shared).await, SweepOutcome::TimedOut);

        let messages = recv_all(&mut rx);
        assert!(messages.iter().any(|m| matches!(m, ServerMessage::Delta { text, .. } if text == "stuck")));
        assert!(messages.iter().any(|m| matches!(m, ServerMessage::Err { message } if message.to_lowercase().contains("timed out"))));
        assert_eq!(state.phase, Phase::Error);
    }

    /// A terminal Run with no connected sockets is eligible for eviction by
    /// the sweep; one with a connected socket is not.
    #[tokio::test]
    async fn sweep_evicts_terminal_runs_only_once_sockets_are_empty() {
        let shared = test_shared(default_config());
        let mut state = RunState::idle();
        let (tx, _rx) = socket();
        state.sockets.insert(1, tx);

        state.begin(&shared, 1, begin_message("r1", "K", -1)).await;
        state.on_adapter_finished(&shared, Ok(Ok(()))).await;

        assert_eq!(
            state.on_sweep(&shared).await,
            SweepOutcome::Continue,
            "socket still attached, must not evict yet"
        );

        state.sockets.remove(&1);
        assert_eq!(
            state.on_sweep(&shared).await,
            SweepOutcome::Evict,
            "terminal and empty must evict"
        );
    }

    /// `stop` is idempotent: re-entering it on a non-running Run is a no-op.
    #[tokio::test]
    async fn stop_on_a_non_running_run_is_a_no_op() {
        let shared = test_shared(default_config());
        let mut state = RunState::idle();

        let stopped = state.stop(&shared, StopMessage { rid: Some("r1".to_string()) }).await;
        assert!(!stopped);
        assert_eq!(state.phase, Phase::Idle);
    }

    /// Missing `rid`/`apiKey`/`messages` on `begin` answers `missing_fields`
    /// to the sender without mutating the Run.
    #[tokio::test]
    async fn begin_without_rid_reports_missing_fields() {
        let shared = test_shared(default_config());
        let mut state = RunState::idle();
        let (tx, mut rx) = socket();
        state.sockets.insert(1, tx);

        let mut begin = begin_message("r1", "K", -1);
        begin.rid = None;
        let result = state.begin(&shared, 1, begin).await;

        assert!(result.is_none());
        assert_eq!(state.phase, Phase::Idle);
        assert!(matches!(
            recv_all(&mut rx).as_slice(),
            [ServerMessage::Err { message }] if message == "missing_fields"
        ));
    }

    /// Polling a uid that has never called `begin` returns the sentinel shape.
    #[tokio::test]
    async fn poll_on_untouched_uid_returns_sentinel() {
        let shared = test_shared(default_config());
        let state = RunState::idle();

        let poll = state.poll_response(&shared).await;
        assert_eq!(poll.rid, None);
        assert_eq!(poll.seq, -1);
        assert_eq!(poll.phase, Phase::Idle);
        assert!(!poll.done);
        assert_eq!(poll.error, None);
        assert_eq!(poll.text, "");
        assert!(poll.images.is_empty());
    }

    /// End-to-end through the real [`Coordinator`]/actor-mailbox path (not
    /// just [`RunState`] directly): a scripted adapter drives a full
    /// begin → delta* → done cycle through `run_actor`'s own
    /// `tokio::select!` loop.
    #[tokio::test]
    async fn actor_loop_drives_a_scripted_adapter_to_completion() {
        let factory: AdapterFactory = Arc::new(|_kind| {
            Box::new(ScriptedAdapter {
                texts: vec!["hel", "lo"],
                failure: None,
            }) as Box<dyn Adapter>
        });
        let coordinator = Coordinator::with_adapter_factory(
            Arc::new(MemoryKvStore::new()),
            Notifier::new(None),
            default_config(),
            factory,
        );

        let mailbox = coordinator.handle("u1");
        let (tx, mut rx) = socket();
        let _ = mailbox.send(ActorMsg::Attach { socket_id: 1, tx });
        let _ = mailbox.send(ActorMsg::Client {
            socket_id: 1,
            message: ClientMessage::Begin(begin_message("r1", "K", -1)),
        });

        let mut text = String::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(ServerMessage::Delta { text: delta, .. })) => text.push_str(&delta),
                Ok(Some(ServerMessage::Done)) => break,
                Ok(Some(ServerMessage::Err { message })) => panic!("unexpected err: {message}"),
                Ok(None) => panic!("socket channel closed before done"),
                Err(_) => panic!("timed out waiting for the actor to reach done"),
            }
        }
        assert_eq!(text, "hello");

        let poll = coordinator.poll("u1").await;
        assert_eq!(poll.phase, Phase::Done);
        assert_eq!(poll.text, "hello");
    }

    /// Stopping a running Run and immediately beginning a new `rid` on the
    /// same uid must not leave the old adapter task or a stale
    /// `flush_deadline` behind: the second Run has to finish within its own
    /// bounded wait, not hang on state left over from the first.
    #[tokio::test]
    async fn stop_then_new_begin_does_not_inherit_stale_timer_or_adapter() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let factory: AdapterFactory = {
            let calls = calls.clone();
            Arc::new(move |_kind| {
                if calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    Box::new(HangingAdapter) as Box<dyn Adapter>
                } else {
                    Box::new(ScriptedAdapter {
                        texts: vec!["hi"],
                        failure: None,
                    }) as Box<dyn Adapter>
                }
            })
        };

        let coordinator = Coordinator::with_adapter_factory(
            Arc::new(MemoryKvStore::new()),
            Notifier::new(None),
            default_config(),
            factory,
        );

        let mailbox = coordinator.handle("u1");
        let (tx, mut rx) = socket();
        let _ = mailbox.send(ActorMsg::Attach { socket_id: 1, tx });
        let _ = mailbox.send(ActorMsg::Client {
            socket_id: 1,
            message: ClientMessage::Begin(begin_message("r1", "K", -1)),
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = mailbox.send(ActorMsg::Client {
            socket_id: 1,
            message: ClientMessage::Stop(StopMessage { rid: Some("r1".to_string()) }),
        });
        assert!(matches!(
            tokio::time::timeout(Duration::from_secs(2), rx.recv()).await,
            Ok(Some(ServerMessage::Done))
        ));

        let _ = mailbox.send(ActorMsg::Client {
            socket_id: 1,
            message: ClientMessage::Begin(begin_message("r2", "K", -1)),
        });

        let mut text = String::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(ServerMessage::Delta { text: delta, .. })) => text.push_str(&delta),
                Ok(Some(ServerMessage::Done)) => break,
                Ok(Some(ServerMessage::Err { message })) => panic!("unexpected err: {message}"),
                Ok(None) => panic!("socket channel closed before done"),
                Err(_) => panic!("second run never completed: stale timer or detached adapter"),
            }
        }
        assert_eq!(text, "hi");
    }
}
