//! Session controller.
//!
//! A session drives the turn loop, owns the listener registry and the
//! steering/follow-up queues, persists history entries as they are
//! produced, and exposes a completion latch (`wait_for_idle`).

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::agent::AgentConfig;
use crate::core::events::{AgentEvent, EventKind, ToolDecision};
use crate::core::history::{build_context, SessionEntry};
use crate::core::turn::{MessageSource, TurnConfig, TurnLoop};
use crate::error::{Error, Result};
use crate::provider::{ChatMessage, Role};
use crate::store::SessionStore;

/// Capacity of the loop-to-driver event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How `send` schedules a message while a turn is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendMode {
    /// Influence the next model round-trip of the running turn, denying
    /// tool calls still awaiting a decision.
    #[default]
    Steer,
    /// Extend the running turn once it would otherwise end.
    Queue,
}

/// Options for a single `send`.
#[derive(Default)]
pub struct SendOptions {
    /// Overrides the session's default mode for this message.
    pub mode: Option<SendMode>,
    /// Cancels the turn this send starts. Ignored when a turn is already
    /// running.
    pub signal: Option<CancellationToken>,
}

/// Handle returned by listener registration; pass to [`Session::off`].
pub type ListenerId = u64;

/// The pending tool call handed to tool-call listeners.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub args: Value,
}

type EventListener = Arc<dyn Fn(AgentEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type ToolCallListener = Arc<
    dyn Fn(ToolCallRequest) -> BoxFuture<'static, anyhow::Result<Option<ToolDecision>>>
        + Send
        + Sync,
>;

#[derive(Default)]
struct Listeners {
    next_id: ListenerId,
    events: HashMap<EventKind, Vec<(ListenerId, EventListener)>>,
    tool_calls: Vec<(ListenerId, ToolCallListener)>,
}

#[derive(Debug, Clone)]
enum LatchState {
    Running,
    Done,
    Failed(Error),
}

struct SessionState {
    entries: Vec<SessionEntry>,
    leaf_id: Option<String>,
    messages: Vec<ChatMessage>,
    steering: VecDeque<ChatMessage>,
    follow_ups: VecDeque<ChatMessage>,
    latch_tx: Option<watch::Sender<LatchState>>,
    latch_rx: Option<watch::Receiver<LatchState>>,
}

/// A conversation with durable, branchable history.
///
/// Cheap to clone; clones share the same underlying session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .finish()
    }
}

struct SessionInner {
    id: String,
    config: Arc<AgentConfig>,
    default_mode: SendMode,
    state: Mutex<SessionState>,
    listeners: Mutex<Listeners>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        config: Arc<AgentConfig>,
        default_mode: SendMode,
        entries: Vec<SessionEntry>,
        leaf_id: Option<String>,
    ) -> Self {
        let messages = build_context(&entries, leaf_id.as_deref());
        Self {
            inner: Arc::new(SessionInner {
                id,
                config,
                default_mode,
                state: Mutex::new(SessionState {
                    entries,
                    leaf_id,
                    messages,
                    steering: VecDeque::new(),
                    follow_ups: VecDeque::new(),
                    latch_tx: None,
                    latch_rx: None,
                }),
                listeners: Mutex::new(Listeners::default()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The current tip of this session's history, `None` for an empty
    /// session.
    pub fn leaf_entry_id(&self) -> Option<String> {
        self.inner.lock_state().leaf_id.clone()
    }

    /// Snapshot of all persisted entries.
    pub fn entries(&self) -> Vec<SessionEntry> {
        self.inner.lock_state().entries.clone()
    }

    /// Snapshot of the reconstructed conversation.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner.lock_state().messages.clone()
    }

    /// True when no turn is running.
    pub fn is_idle(&self) -> bool {
        self.inner.lock_state().latch_tx.is_none()
    }

    /// Sends a user message with the session's default mode.
    ///
    /// Non-blocking: when the session is idle this starts a turn on a
    /// spawned task; while a turn runs the message is queued according to
    /// the effective mode. Must be called within a tokio runtime.
    pub fn send(&self, text: impl Into<String>) {
        self.send_with(text, SendOptions::default());
    }

    /// Sends a user message with explicit options.
    pub fn send_with(&self, text: impl Into<String>, opts: SendOptions) {
        let message = ChatMessage::user(text.into());
        let mode = opts.mode.unwrap_or(self.inner.default_mode);

        let mut state = self.inner.lock_state();
        if state.latch_tx.is_some() {
            match mode {
                SendMode::Steer => state.steering.push_back(message),
                SendMode::Queue => state.follow_ups.push_back(message),
            }
            return;
        }

        let (tx, rx) = watch::channel(LatchState::Running);
        state.latch_tx = Some(tx);
        state.latch_rx = Some(rx);
        drop(state);

        let cancel = opts.signal.unwrap_or_default();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            SessionInner::run_turn(inner, vec![message], cancel).await;
        });
    }

    /// Resolves when the running turn completes; rejects with the turn's
    /// error if it fails. Resolves immediately when idle.
    pub async fn wait_for_idle(&self) -> Result<()> {
        let rx = {
            let state = self.inner.lock_state();
            match state.latch_rx.clone() {
                Some(rx) => rx,
                None => return Ok(()),
            }
        };
        let mut rx = rx;
        loop {
            let current = rx.borrow_and_update().clone();
            match current {
                LatchState::Running => {}
                LatchState::Done => return Ok(()),
                LatchState::Failed(error) => return Err(error),
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Appends a compaction entry and makes it the new leaf. The session
    /// must be idle.
    pub async fn compact(
        &self,
        summary: impl Into<String>,
        first_kept_id: impl Into<String>,
    ) -> Result<()> {
        let entry = {
            let mut state = self.inner.lock_state();
            if state.latch_tx.is_some() {
                return Err(Error::Busy(
                    "cannot compact while a turn is running".to_string(),
                ));
            }
            let entry =
                SessionEntry::compaction(state.leaf_id.clone(), summary, first_kept_id);
            state.leaf_id = Some(entry.id().to_string());
            state.entries.push(entry.clone());
            let messages = build_context(&state.entries, state.leaf_id.as_deref());
            state.messages = messages;
            entry
        };
        self.inner.config.store.append(&self.inner.id, &entry).await
    }

    /// Registers a listener for one event kind. Listeners run in
    /// registration order and are awaited one at a time.
    ///
    /// `tool_call` events do not flow through this registry; register
    /// decision-capable listeners with [`Session::on_tool_call`].
    pub fn on<F, Fut>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(AgentEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut listeners = self.inner.lock_listeners();
        let id = listeners.next_id;
        listeners.next_id += 1;

        if kind == EventKind::ToolCall {
            // Observation-only listener on tool calls: joins the decider
            // chain returning "no decision" so first-decision-wins ordering
            // holds across both registration methods.
            let listener = Arc::new(listener);
            let wrapped: ToolCallListener = Arc::new(move |request: ToolCallRequest| {
                let fut = listener(AgentEvent::ToolCall {
                    call_id: request.call_id,
                    name: request.name,
                    args: request.args,
                });
                Box::pin(async move { fut.await.map(|()| None) })
            });
            listeners.tool_calls.push((id, wrapped));
        } else {
            let wrapped: EventListener = Arc::new(move |event| Box::pin(listener(event)));
            listeners.events.entry(kind).or_default().push((id, wrapped));
        }
        id
    }

    /// Registers a tool-call listener. Listeners are polled in
    /// registration order; the first to return a decision wins and later
    /// ones are not invoked for that call.
    pub fn on_tool_call<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(ToolCallRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<ToolDecision>>> + Send + 'static,
    {
        let mut listeners = self.inner.lock_listeners();
        let id = listeners.next_id;
        listeners.next_id += 1;
        let wrapped: ToolCallListener =
            Arc::new(move |request| Box::pin(listener(request)));
        listeners.tool_calls.push((id, wrapped));
        id
    }

    /// Removes a listener by id. Returns whether one was removed.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.lock_listeners();
        for list in listeners.events.values_mut() {
            let before = list.len();
            list.retain(|(listener_id, _)| *listener_id != id);
            if list.len() != before {
                return true;
            }
        }
        let before = listeners.tool_calls.len();
        listeners.tool_calls.retain(|(listener_id, _)| *listener_id != id);
        listeners.tool_calls.len() != before
    }
}

impl SessionInner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().expect("session state lock poisoned")
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().expect("listener registry lock poisoned")
    }

    fn drain_steering(&self) -> Vec<ChatMessage> {
        self.lock_state().steering.drain(..).collect()
    }

    fn drain_follow_ups(&self) -> Vec<ChatMessage> {
        self.lock_state().follow_ups.drain(..).collect()
    }

    /// Runs one turn to completion and settles the latch.
    async fn run_turn(inner: Arc<Self>, initial: Vec<ChatMessage>, cancel: CancellationToken) {
        let result = Self::drive(&inner, initial, cancel).await;

        // Settle: capture the latch and clear both queues atomically.
        // Messages queued against this turn are deliberately discarded;
        // sends arriving after this point start a fresh turn.
        let latch_tx = {
            let mut state = inner.lock_state();
            state.steering.clear();
            state.follow_ups.clear();
            state.latch_rx = None;
            state.latch_tx.take()
        };

        match result {
            Ok(()) => {
                if let Some(tx) = latch_tx {
                    let _ = tx.send(LatchState::Done);
                }
            }
            Err(error) => {
                warn!(%error, session = %inner.id, "turn failed");
                // The in-memory conversation mirror may be missing messages
                // the failed turn already persisted; rebuild it from the log.
                {
                    let mut state = inner.lock_state();
                    let messages = build_context(&state.entries, state.leaf_id.as_deref());
                    state.messages = messages;
                }
                // Best-effort: an error-listener failure must not mask the
                // original error.
                if let Err(listener_error) = inner
                    .dispatch_event(AgentEvent::Error {
                        message: error.to_string(),
                    })
                    .await
                {
                    warn!(%listener_error, "error listener failed");
                }
                if let Some(tx) = latch_tx {
                    let _ = tx.send(LatchState::Failed(error));
                }
            }
        }
    }

    async fn drive(
        inner: &Arc<Self>,
        initial: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut turn_messages: Vec<ChatMessage> = Vec::new();
        let mut last_text = String::new();

        // The initial user batch is persisted and announced before the
        // first model call.
        for message in &initial {
            inner.persist_message(message).await?;
            turn_messages.push(message.clone());
            inner
                .dispatch_event(AgentEvent::Message {
                    message: message.clone(),
                })
                .await?;
        }

        let messages = {
            let mut state = inner.lock_state();
            state.messages.extend(initial.iter().cloned());
            state.messages.clone()
        };

        let (event_tx, mut event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (decision_tx, decision_rx) = mpsc::channel(1);

        let steering: MessageSource = {
            let inner = inner.clone();
            Arc::new(move || inner.drain_steering())
        };
        let follow_ups: MessageSource = {
            let inner = inner.clone();
            Arc::new(move || inner.drain_follow_ups())
        };

        let config = TurnConfig {
            provider: inner.config.provider.clone(),
            system_prompt: inner.config.system_prompt.clone(),
            tools: inner.config.tools.clone(),
            runtime: inner.config.runtime.clone(),
            max_steps: inner.config.max_steps,
            steering: Some(steering),
            follow_ups: Some(follow_ups),
        };

        debug!(session = %inner.id, "starting turn");
        let loop_task = tokio::spawn(
            TurnLoop::new(config, messages, cancel, event_tx, decision_rx).run(),
        );

        let drive_result: Result<()> = async {
            while let Some(event) = event_rx.recv().await {
                match &event {
                    AgentEvent::Message { message } => {
                        inner.persist_message(message).await?;
                        turn_messages.push(message.clone());
                        if message.role == Role::Assistant {
                            last_text = message.text();
                        }
                        inner.dispatch_event(event.clone()).await?;
                    }
                    AgentEvent::ToolCall {
                        call_id,
                        name,
                        args,
                    } => {
                        let decision = inner
                            .collect_decision(ToolCallRequest {
                                call_id: call_id.clone(),
                                name: name.clone(),
                                args: args.clone(),
                            })
                            .await?;
                        decision_tx.send(decision).await.map_err(|_| {
                            Error::Disconnected("turn loop dropped its decision channel".to_string())
                        })?;
                    }
                    AgentEvent::ToolResult { message, .. } => {
                        inner.persist_message(message).await?;
                        turn_messages.push(message.clone());
                        inner.dispatch_event(event.clone()).await?;
                    }
                    AgentEvent::TextDelta { .. } | AgentEvent::Step { .. } => {
                        inner.dispatch_event(event.clone()).await?;
                    }
                    AgentEvent::TurnEnd { .. } | AgentEvent::Error { .. } => {
                        // The loop never emits these.
                    }
                }
            }
            Ok(())
        }
        .await;

        match drive_result {
            Ok(()) => {
                let outcome = loop_task
                    .await
                    .map_err(|join_error| {
                        Error::Disconnected(format!("turn task failed: {join_error}"))
                    })??;
                {
                    let mut state = inner.lock_state();
                    state.messages = outcome.messages;
                }
                if !outcome.cancelled {
                    inner
                        .dispatch_event(AgentEvent::TurnEnd {
                            messages: turn_messages,
                            text: last_text,
                        })
                        .await?;
                }
                Ok(())
            }
            Err(error) => {
                loop_task.abort();
                Err(error)
            }
        }
    }

    /// Appends a message entry (parented on the current leaf), persists
    /// it, and advances the leaf.
    async fn persist_message(&self, message: &ChatMessage) -> Result<()> {
        let entry = {
            let mut state = self.lock_state();
            let entry = SessionEntry::message(state.leaf_id.clone(), message.clone());
            state.leaf_id = Some(entry.id().to_string());
            state.entries.push(entry.clone());
            entry
        };
        self.config.store.append(&self.id, &entry).await
    }

    async fn dispatch_event(&self, event: AgentEvent) -> Result<()> {
        let listeners: Vec<EventListener> = {
            let registry = self.lock_listeners();
            registry
                .events
                .get(&event.kind())
                .map(|list| list.iter().map(|(_, listener)| listener.clone()).collect())
                .unwrap_or_default()
        };
        for listener in listeners {
            listener(event.clone())
                .await
                .map_err(|error| Error::Listener(error.to_string()))?;
        }
        Ok(())
    }

    /// Polls tool-call listeners in registration order; the first decision
    /// wins and later listeners are not invoked for this call.
    async fn collect_decision(&self, request: ToolCallRequest) -> Result<Option<ToolDecision>> {
        let listeners: Vec<ToolCallListener> = {
            let registry = self.lock_listeners();
            registry
                .tool_calls
                .iter()
                .map(|(_, listener)| listener.clone())
                .collect()
        };
        for listener in listeners {
            let decision = listener(request.clone())
                .await
                .map_err(|error| Error::Listener(error.to_string()))?;
            if decision.is_some() {
                return Ok(decision);
            }
        }
        Ok(None)
    }
}
