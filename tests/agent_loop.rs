//! End-to-end turn-loop scenarios driven through a scripted provider.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use skein::{
    build_context, Agent, AgentEvent, ChatMessage, Error, EventKind, JsonlStore, Provider,
    ProviderRequest, ProviderStream, ResumeOptions, Role, SendMode, SendOptions, Session,
    SessionEntry, SessionStore, StreamPart, Tool, ToolContext, ToolDecision, Usage,
    STEERING_DENY_REASON,
};

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Provider that plays back scripted turns and records every request's
/// message snapshot.
struct ScriptProvider {
    turns: Mutex<VecDeque<Vec<skein::Result<StreamPart>>>>,
    requests: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl ScriptProvider {
    fn new(turns: Vec<Vec<skein::Result<StreamPart>>>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            requests: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }

    fn push_turn(&self, turn: Vec<skein::Result<StreamPart>>) {
        self.turns.lock().unwrap().push_back(turn);
    }
}

#[async_trait]
impl Provider for ScriptProvider {
    async fn stream(&self, request: ProviderRequest<'_>) -> skein::Result<ProviderStream> {
        self.requests.lock().unwrap().push(request.messages.to_vec());
        let parts = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![Ok(finish("stop"))]);
        Ok(futures_util::stream::iter(parts).boxed())
    }
}

fn finish(reason: &str) -> StreamPart {
    StreamPart::Finish {
        usage: Usage {
            input: 10,
            output: 5,
        },
        finish_reason: reason.to_string(),
    }
}

fn text_turn(text: &str) -> Vec<skein::Result<StreamPart>> {
    vec![
        Ok(StreamPart::TextDelta {
            text: text.to_string(),
        }),
        Ok(finish("stop")),
    ]
}

fn tool_turn(calls: &[(&str, &str, Value)]) -> Vec<skein::Result<StreamPart>> {
    let mut parts: Vec<skein::Result<StreamPart>> = calls
        .iter()
        .map(|(id, name, input)| {
            Ok(StreamPart::ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                input: input.clone(),
            })
        })
        .collect();
    parts.push(Ok(finish("tool_use")));
    parts
}

/// Tool that returns its `text` argument.
struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes the text argument back."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> anyhow::Result<String> {
        Ok(args
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

/// Tool that records when it started, then sleeps.
struct SleepTool {
    delay: Duration,
    starts: Arc<Mutex<Vec<Instant>>>,
}

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "Sleeps for a fixed delay."
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> anyhow::Result<String> {
        self.starts.lock().unwrap().push(Instant::now());
        tokio::time::sleep(self.delay).await;
        Ok("slept".to_string())
    }
}

/// Records every event a session emits, tool calls included.
fn record_events(session: &Session) -> Arc<Mutex<Vec<AgentEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    for kind in [
        EventKind::TextDelta,
        EventKind::Message,
        EventKind::ToolResult,
        EventKind::Step,
        EventKind::TurnEnd,
        EventKind::Error,
    ] {
        let sink = events.clone();
        session.on(kind, move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event);
                Ok(())
            }
        });
    }
    let sink = events.clone();
    session.on(EventKind::ToolCall, move |event| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(event);
            Ok(())
        }
    });
    events
}

fn kinds(events: &[AgentEvent]) -> Vec<EventKind> {
    events.iter().map(AgentEvent::kind).collect()
}

fn message_texts(messages: &[ChatMessage]) -> Vec<String> {
    messages.iter().map(ChatMessage::text).collect()
}

fn agent_with(provider: Arc<ScriptProvider>, tools: Vec<Arc<dyn Tool>>) -> Agent {
    Agent::builder(provider).tools(tools).build()
}

// ---------------------------------------------------------------------------
// End-to-end scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_simple_text_turn() {
    let provider = ScriptProvider::new(vec![text_turn("Hello")]);
    let agent = agent_with(provider.clone(), vec![]);
    let session = agent.create_session();
    let events = record_events(&session);

    session.send("Hi");
    session.wait_for_idle().await.unwrap();

    let events = events.lock().unwrap().clone();
    assert_eq!(
        kinds(&events),
        vec![
            EventKind::Message,
            EventKind::TextDelta,
            EventKind::Message,
            EventKind::Step,
            EventKind::TurnEnd,
        ]
    );

    match &events[4] {
        AgentEvent::TurnEnd { messages, text } => {
            assert_eq!(text, "Hello");
            assert_eq!(messages.len(), 2);
            assert_eq!(messages[0].role, Role::User);
            assert_eq!(messages[1].role, Role::Assistant);
        }
        other => panic!("expected turn_end, got {other:?}"),
    }

    match &events[3] {
        AgentEvent::Step { finish_reason, .. } => assert_eq!(finish_reason, "stop"),
        other => panic!("expected step, got {other:?}"),
    }
}

#[tokio::test]
async fn test_second_turn_sees_prior_history() {
    let provider = ScriptProvider::new(vec![text_turn("A"), text_turn("B")]);
    let agent = agent_with(provider.clone(), vec![]);
    let session = agent.create_session();

    session.send("Hi1");
    session.wait_for_idle().await.unwrap();
    session.send("Hi2");
    session.wait_for_idle().await.unwrap();

    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(message_texts(&requests[1]), vec!["Hi1", "A", "Hi2"]);
}

#[tokio::test]
async fn test_tool_round_trip_with_bash() {
    let temp = tempfile::TempDir::new().unwrap();
    let provider = ScriptProvider::new(vec![
        tool_turn(&[("c1", "bash", json!({"command": "echo hi"}))]),
        text_turn("Done"),
    ]);
    let agent = Agent::builder(provider.clone())
        .tool(Arc::new(skein::tools::bash::BashTool::new()))
        .runtime(Arc::new(skein::LocalRuntime::new(temp.path())))
        .build();
    let session = agent.create_session();
    let events = record_events(&session);

    session.send("run it");
    session.wait_for_idle().await.unwrap();

    let events = events.lock().unwrap().clone();
    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::ToolCall { name, .. } if name == "bash"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::ToolResult { result, is_error: false, .. } if result == "hi\n"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::TurnEnd { text, .. } if text == "Done"
    )));
}

#[tokio::test]
async fn test_deny_decision_produces_error_result() {
    let provider = ScriptProvider::new(vec![
        tool_turn(&[("c1", "echo", json!({"text": "hi"}))]),
        text_turn("ok"),
    ]);
    let agent = agent_with(provider.clone(), vec![Arc::new(EchoTool)]);
    let session = agent.create_session();
    let events = record_events(&session);

    session.on_tool_call(|_request| async move {
        Ok(Some(ToolDecision::Deny {
            reason: "blocked".to_string(),
        }))
    });

    session.send("go");
    session.wait_for_idle().await.unwrap();

    let events = events.lock().unwrap().clone();
    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::ToolResult { result, is_error: true, .. } if result == "blocked"
    )));
    // The model still runs the next step and sees the denial.
    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    let last = requests[1].last().unwrap();
    assert_eq!(last.role, Role::Tool);
}

#[tokio::test]
async fn test_rewrite_decision_substitutes_args() {
    let provider = ScriptProvider::new(vec![
        tool_turn(&[("c1", "echo", json!({"text": "original"}))]),
        text_turn("ok"),
    ]);
    let agent = agent_with(provider.clone(), vec![Arc::new(EchoTool)]);
    let session = agent.create_session();
    let events = record_events(&session);

    session.on_tool_call(|_request| async move {
        Ok(Some(ToolDecision::Rewrite {
            args: json!({"text": "rewritten"}),
        }))
    });

    session.send("go");
    session.wait_for_idle().await.unwrap();

    let events = events.lock().unwrap().clone();
    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::ToolResult { result, is_error: false, .. } if result == "rewritten"
    )));
}

#[tokio::test]
async fn test_first_decision_wins() {
    let provider = ScriptProvider::new(vec![
        tool_turn(&[("c1", "echo", json!({"text": "original"}))]),
        text_turn("ok"),
    ]);
    let agent = agent_with(provider.clone(), vec![Arc::new(EchoTool)]);
    let session = agent.create_session();

    let first_polled = Arc::new(AtomicBool::new(false));
    let third_polled = Arc::new(AtomicBool::new(false));

    let flag = first_polled.clone();
    session.on_tool_call(move |_request| {
        let flag = flag.clone();
        async move {
            flag.store(true, Ordering::SeqCst);
            Ok(None)
        }
    });
    session.on_tool_call(|_request| async move {
        Ok(Some(ToolDecision::Deny {
            reason: "second wins".to_string(),
        }))
    });
    let flag = third_polled.clone();
    session.on_tool_call(move |_request| {
        let flag = flag.clone();
        async move {
            flag.store(true, Ordering::SeqCst);
            Ok(Some(ToolDecision::Deny {
                reason: "never reached".to_string(),
            }))
        }
    });

    let events = record_events(&session);
    session.send("go");
    session.wait_for_idle().await.unwrap();

    let events = events.lock().unwrap().clone();
    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::ToolResult { result, .. } if result == "second wins"
    )));
    assert!(first_polled.load(Ordering::SeqCst));
    assert!(!third_polled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_parallel_execution_preserves_result_order() {
    let starts = Arc::new(Mutex::new(Vec::new()));
    let provider = ScriptProvider::new(vec![
        tool_turn(&[
            ("c1", "slow", json!({})),
            ("c2", "slow", json!({})),
        ]),
        text_turn("done"),
    ]);
    let agent = agent_with(
        provider.clone(),
        vec![Arc::new(SleepTool {
            delay: Duration::from_millis(50),
            starts: starts.clone(),
        })],
    );
    let session = agent.create_session();
    let events = record_events(&session);

    session.send("go");
    session.wait_for_idle().await.unwrap();

    // Both executions began close together rather than back to back.
    let starts = starts.lock().unwrap().clone();
    assert_eq!(starts.len(), 2);
    let gap = starts[1].saturating_duration_since(starts[0]);
    assert!(gap < Duration::from_millis(40), "gap was {gap:?}");

    // Results come back in call order regardless of completion order.
    let events = events.lock().unwrap().clone();
    let result_ids: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::ToolResult { call_id, .. } => Some(call_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(result_ids, vec!["c1", "c2"]);
}

#[tokio::test]
async fn test_steering_lands_before_next_round_trip() {
    let provider = ScriptProvider::new(vec![
        tool_turn(&[("c1", "slow", json!({}))]),
        text_turn("after"),
    ]);
    let starts = Arc::new(Mutex::new(Vec::new()));
    let agent = agent_with(
        provider.clone(),
        vec![Arc::new(SleepTool {
            delay: Duration::from_millis(100),
            starts,
        })],
    );
    let session = agent.create_session();
    let events = record_events(&session);

    // Steer while the tool is executing: the decider runs before Phase 2,
    // so the message is queued during the slow execution and drained at the
    // next step's pre-call drain point.
    let steer_session = session.clone();
    session.on_tool_call(move |_request| {
        let steer_session = steer_session.clone();
        async move {
            steer_session.send_with("steer", SendOptions {
                mode: Some(SendMode::Steer),
                ..Default::default()
            });
            Ok(None)
        }
    });

    session.send("go");
    session.wait_for_idle().await.unwrap();

    let events = events.lock().unwrap().clone();
    let result_pos = events
        .iter()
        .position(|e| matches!(e, AgentEvent::ToolResult { .. }))
        .unwrap();
    let steer_pos = events
        .iter()
        .position(|e| matches!(e, AgentEvent::Message { message } if message.text() == "steer"))
        .unwrap();
    assert!(steer_pos > result_pos, "steer message must follow the tool result");

    // The next model call sees the steering message.
    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    assert!(message_texts(&requests[1]).contains(&"steer".to_string()));

    // The turn's accumulator includes both user messages.
    let turn_end = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::TurnEnd { messages, .. } => Some(messages.clone()),
            _ => None,
        })
        .unwrap();
    let user_texts: Vec<String> = turn_end
        .iter()
        .filter(|m| m.role == Role::User)
        .map(ChatMessage::text)
        .collect();
    assert_eq!(user_texts, vec!["go", "steer"]);
}

#[tokio::test]
async fn test_steering_mid_phase_auto_denies_tail() {
    let provider = ScriptProvider::new(vec![
        tool_turn(&[
            ("c1", "echo", json!({"text": "first"})),
            ("c2", "echo", json!({"text": "second"})),
        ]),
        text_turn("ok"),
    ]);
    let agent = agent_with(provider.clone(), vec![Arc::new(EchoTool)]);
    let session = agent.create_session();
    let events = record_events(&session);

    // The first call's decider enqueues steering, so the drain point
    // between Phase 1 iterations fires before the second call is yielded.
    let steer_session = session.clone();
    session.on_tool_call(move |request| {
        let steer_session = steer_session.clone();
        async move {
            if request.call_id == "c1" {
                steer_session.send("mid-phase steer");
            }
            Ok(None)
        }
    });

    session.send("go");
    session.wait_for_idle().await.unwrap();

    let events = events.lock().unwrap().clone();

    // Only the first call was yielded for a decision.
    let yielded: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::ToolCall { call_id, .. } => Some(call_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(yielded, vec!["c1"]);

    // The first call ran; the tail was denied with the canonical reason.
    let results: Vec<(String, String, bool)> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::ToolResult {
                call_id,
                result,
                is_error,
                ..
            } => Some((call_id.clone(), result.clone(), *is_error)),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0], ("c1".to_string(), "first".to_string(), false));
    assert_eq!(
        results[1],
        ("c2".to_string(), STEERING_DENY_REASON.to_string(), true)
    );

    // The steering entry lands after every tool result of the step.
    let last_result_pos = events
        .iter()
        .rposition(|e| matches!(e, AgentEvent::ToolResult { .. }))
        .unwrap();
    let steer_pos = events
        .iter()
        .position(|e| {
            matches!(e, AgentEvent::Message { message } if message.text() == "mid-phase steer")
        })
        .unwrap();
    assert!(steer_pos > last_result_pos);

    let requests = provider.requests();
    assert!(message_texts(&requests[1]).contains(&"mid-phase steer".to_string()));
}

#[tokio::test]
async fn test_queue_mode_extends_running_turn() {
    let provider = ScriptProvider::new(vec![text_turn("A"), text_turn("B")]);
    let agent = Agent::builder(provider.clone())
        .send_mode(SendMode::Queue)
        .build();
    let session = agent.create_session();
    let events = record_events(&session);

    session.send("m1");
    // Queued while the turn runs; drained at the keep-alive drain point.
    session.send("m2");
    session.send("m3");
    session.wait_for_idle().await.unwrap();

    let events = events.lock().unwrap().clone();
    let turn_ends: Vec<&AgentEvent> = events
        .iter()
        .filter(|e| matches!(e, AgentEvent::TurnEnd { .. }))
        .collect();
    assert_eq!(turn_ends.len(), 1);

    let assistant_texts: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::Message { message } if message.role == Role::Assistant => {
                Some(message.text())
            }
            _ => None,
        })
        .collect();
    assert_eq!(assistant_texts, vec!["A", "B"]);

    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(
        message_texts(&requests[1]),
        vec!["m1", "A", "m2", "m3"]
    );
}

#[tokio::test]
async fn test_unknown_tool_reports_without_yielding() {
    let provider = ScriptProvider::new(vec![
        tool_turn(&[("c1", "nope", json!({}))]),
        text_turn("ok"),
    ]);
    let agent = agent_with(provider.clone(), vec![Arc::new(EchoTool)]);
    let session = agent.create_session();
    let events = record_events(&session);

    session.send("go");
    session.wait_for_idle().await.unwrap();

    let events = events.lock().unwrap().clone();
    assert!(!events
        .iter()
        .any(|e| matches!(e, AgentEvent::ToolCall { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::ToolResult { result, is_error: true, .. }
            if result == "Tool not found: nope"
    )));
}

// ---------------------------------------------------------------------------
// Boundary behaviors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_max_steps_zero_terminates_immediately() {
    let provider = ScriptProvider::new(vec![text_turn("never")]);
    let agent = Agent::builder(provider.clone()).max_steps(0).build();
    let session = agent.create_session();
    let events = record_events(&session);

    session.send("hi");
    session.wait_for_idle().await.unwrap();

    let events = events.lock().unwrap().clone();
    assert!(!events.iter().any(|e| matches!(e, AgentEvent::Step { .. })));
    assert!(provider.requests().is_empty());
}

#[tokio::test]
async fn test_pre_aborted_signal_produces_no_loop_events() {
    let provider = ScriptProvider::new(vec![text_turn("never")]);
    let agent = agent_with(provider.clone(), vec![]);
    let session = agent.create_session();
    let events = record_events(&session);

    let cancel = CancellationToken::new();
    cancel.cancel();
    session.send_with(
        "hi",
        SendOptions {
            signal: Some(cancel),
            ..Default::default()
        },
    );
    session.wait_for_idle().await.unwrap();

    let events = events.lock().unwrap().clone();
    // The initial user message is announced; the loop itself emits nothing
    // and no turn_end is produced.
    assert_eq!(kinds(&events), vec![EventKind::Message]);
    assert!(provider.requests().is_empty());
}

#[tokio::test]
async fn test_empty_assistant_reply_ends_turn() {
    let provider = ScriptProvider::new(vec![vec![Ok(finish("stop"))]]);
    let agent = agent_with(provider.clone(), vec![]);
    let session = agent.create_session();
    let events = record_events(&session);

    session.send("hi");
    session.wait_for_idle().await.unwrap();

    let events = events.lock().unwrap().clone();
    assert_eq!(
        kinds(&events),
        vec![
            EventKind::Message,
            EventKind::Message,
            EventKind::Step,
            EventKind::TurnEnd,
        ]
    );
}

#[tokio::test]
async fn test_listener_error_rejects_wait_and_next_send_recovers() {
    let provider = ScriptProvider::new(vec![text_turn("A")]);
    let agent = agent_with(provider.clone(), vec![]);
    let session = agent.create_session();

    let error_seen = Arc::new(AtomicBool::new(false));
    let flag = error_seen.clone();
    session.on(EventKind::Error, move |_event| {
        let flag = flag.clone();
        async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }
    });

    let bad = session.on(EventKind::Step, |_event| async move {
        anyhow::bail!("listener exploded")
    });

    session.send("hi");
    let error = session.wait_for_idle().await.unwrap_err();
    assert!(matches!(error, Error::Listener(_)));
    assert!(error_seen.load(Ordering::SeqCst));
    assert!(session.is_idle());

    // A fresh send starts a fresh loop.
    session.off(bad);
    provider.push_turn(text_turn("B"));
    session.send("again");
    session.wait_for_idle().await.unwrap();
    assert_eq!(provider.requests().len(), 2);
}

#[tokio::test]
async fn test_provider_error_rejects_wait_and_emits_error_event() {
    let provider = ScriptProvider::new(vec![vec![Err(Error::Provider("boom".to_string()))]]);
    let agent = agent_with(provider.clone(), vec![]);
    let session = agent.create_session();
    let events = record_events(&session);

    session.send("hi");
    let error = session.wait_for_idle().await.unwrap_err();
    assert!(matches!(error, Error::Provider(_)));

    let events = events.lock().unwrap().clone();
    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::Error { message } if message.contains("boom")
    )));
    assert!(!events
        .iter()
        .any(|e| matches!(e, AgentEvent::TurnEnd { .. })));

    // The session recovers on the next send.
    provider.push_turn(text_turn("recovered"));
    session.send("retry");
    session.wait_for_idle().await.unwrap();
}

#[tokio::test]
async fn test_wait_for_idle_when_idle_resolves_immediately() {
    let provider = ScriptProvider::new(vec![]);
    let agent = agent_with(provider, vec![]);
    let session = agent.create_session();
    session.wait_for_idle().await.unwrap();
}

// ---------------------------------------------------------------------------
// History, persistence, resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_context_round_trips_through_entries() {
    let provider = ScriptProvider::new(vec![
        tool_turn(&[("c1", "echo", json!({"text": "x"}))]),
        text_turn("done"),
    ]);
    let agent = agent_with(provider.clone(), vec![Arc::new(EchoTool)]);
    let session = agent.create_session();

    session.send("hi");
    session.wait_for_idle().await.unwrap();

    let entries = session.entries();
    let leaf = session.leaf_entry_id();
    let rebuilt = build_context(&entries, leaf.as_deref());
    assert_eq!(rebuilt, session.messages());
}

#[tokio::test]
async fn test_resume_session_round_trip_via_jsonl() {
    let temp = tempfile::TempDir::new().unwrap();
    let store = Arc::new(JsonlStore::new(temp.path()));

    let provider = ScriptProvider::new(vec![text_turn("first answer")]);
    let agent = Agent::builder(provider.clone()).store(store.clone()).build();
    let session = agent.create_session();
    let id = session.id().to_string();

    session.send("hello");
    session.wait_for_idle().await.unwrap();
    let saved_messages = session.messages();

    // A fresh agent over the same directory resumes the conversation.
    let provider2 = ScriptProvider::new(vec![text_turn("second answer")]);
    let agent2 = Agent::builder(provider2.clone())
        .store(Arc::new(JsonlStore::new(temp.path())))
        .build();
    let resumed = agent2.resume_session(&id).await.unwrap();
    assert_eq!(resumed.messages(), saved_messages);

    resumed.send("and again");
    resumed.wait_for_idle().await.unwrap();
    let requests = provider2.requests();
    assert_eq!(
        message_texts(&requests[0]),
        vec!["hello", "first answer", "and again"]
    );
}

#[tokio::test]
async fn test_resume_missing_session_fails() {
    let provider = ScriptProvider::new(vec![]);
    let agent = agent_with(provider, vec![]);
    let error = agent.resume_session("ghost").await.unwrap_err();
    assert!(matches!(error, Error::SessionNotFound(_)));
    assert!(error.to_string().contains("Session not found: ghost"));
}

#[tokio::test]
async fn test_resume_with_unknown_leaf_fails() {
    let store = Arc::new(skein::MemoryStore::new());
    let entry = SessionEntry::message(None, ChatMessage::user("hi"));
    store.append("s1", &entry).await.unwrap();

    let provider = ScriptProvider::new(vec![]);
    let agent = Agent::builder(provider).store(store).build();

    let error = agent
        .resume_session_with(
            "s1",
            ResumeOptions {
                leaf_id: Some("missing".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(error, Error::EntryNotFound(_)));
}

#[tokio::test]
async fn test_resume_mid_tree_leaf_forks_branch() {
    let store = Arc::new(skein::MemoryStore::new());
    let a = SessionEntry::message(None, ChatMessage::user("one"));
    let b = SessionEntry::message(Some(a.id().to_string()), ChatMessage::assistant("two"));
    let c = SessionEntry::message(Some(b.id().to_string()), ChatMessage::user("left"));
    let d = SessionEntry::message(Some(b.id().to_string()), ChatMessage::user("right"));
    for entry in [&a, &b, &c, &d] {
        store.append("s1", entry).await.unwrap();
    }

    let provider = ScriptProvider::new(vec![text_turn("branched")]);
    let agent = Agent::builder(provider.clone()).store(store).build();

    // Default leaf is the last loaded entry.
    let session = agent.resume_session("s1").await.unwrap();
    assert_eq!(session.leaf_entry_id().as_deref(), Some(d.id()));
    assert_eq!(message_texts(&session.messages()), vec!["one", "two", "right"]);

    // An explicit mid-tree leaf reconstructs exactly its own path.
    let session = agent
        .resume_session_with(
            "s1",
            ResumeOptions {
                leaf_id: Some(c.id().to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(message_texts(&session.messages()), vec!["one", "two", "left"]);

    // New entries descend from the chosen leaf, forking a branch.
    session.send("continue here");
    session.wait_for_idle().await.unwrap();
    let entries = session.entries();
    let new_user = entries
        .iter()
        .find(|e| matches!(e, SessionEntry::Message(m) if m.message.text() == "continue here"))
        .unwrap();
    assert_eq!(new_user.parent_id(), Some(c.id()));
}

#[tokio::test]
async fn test_compaction_on_resume_path() {
    let store = Arc::new(skein::MemoryStore::new());
    let a = SessionEntry::message(None, ChatMessage::user("old question"));
    let b = SessionEntry::message(Some(a.id().to_string()), ChatMessage::assistant("old answer"));
    let c = SessionEntry::message(Some(b.id().to_string()), ChatMessage::user("kept"));
    let k = SessionEntry::compaction(Some(c.id().to_string()), "S", c.id());
    for entry in [&a, &b, &c, &k] {
        store.append("s1", entry).await.unwrap();
    }

    let provider = ScriptProvider::new(vec![]);
    let agent = Agent::builder(provider).store(store).build();
    let session = agent.resume_session("s1").await.unwrap();

    assert_eq!(
        message_texts(&session.messages()),
        vec!["<summary>S</summary>", "kept"]
    );
}

#[tokio::test]
async fn test_compact_while_idle_rewrites_context() {
    let provider = ScriptProvider::new(vec![text_turn("answer")]);
    let agent = agent_with(provider.clone(), vec![]);
    let session = agent.create_session();

    session.send("question");
    session.wait_for_idle().await.unwrap();

    // Keep only the assistant answer behind a summary.
    let entries = session.entries();
    let answer_id = entries
        .iter()
        .find(|e| matches!(e, SessionEntry::Message(m) if m.message.role == Role::Assistant))
        .unwrap()
        .id()
        .to_string();
    session.compact("earlier talk", &answer_id).await.unwrap();

    assert_eq!(
        message_texts(&session.messages()),
        vec!["<summary>earlier talk</summary>", "answer"]
    );

    // The next round-trip is built from the compacted context.
    provider.push_turn(text_turn("next"));
    session.send("more");
    session.wait_for_idle().await.unwrap();
    let requests = provider.requests();
    assert_eq!(
        message_texts(&requests[1]),
        vec!["<summary>earlier talk</summary>", "answer", "more"]
    );
}
