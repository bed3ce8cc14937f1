//! The per-turn state machine.
//!
//! One turn is one or more model round-trips (steps). The loop runs as a
//! dedicated task crossed by two channels: it sends [`AgentEvent`]s down
//! to its driver and, for every `tool_call` it emits, blocks until the
//! driver sends back a decision. That keeps approval serialized while
//! Phase 2 still executes the approved calls in parallel.
//!
//! Externally queued user messages enter at three fixed drain points:
//! before each model call, between Phase 1 decisions (steering there
//! auto-denies the remaining calls), and at the terminal check (queued
//! follow-ups keep the turn alive for another step).

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::events::{AgentEvent, ToolDecision, STEERING_DENY_REASON};
use crate::error::{Error, Result};
use crate::provider::{
    ChatMessage, ContentBlock, MessageContent, Provider, ProviderRequest, Role, StreamPart,
    ToolDescriptor, Usage,
};
use crate::runtime::Runtime;
use crate::tools::{Tool, ToolContext};

/// Source of externally queued user messages, polled at the drain points.
/// Each call drains the queue it fronts.
pub(crate) type MessageSource = Arc<dyn Fn() -> Vec<ChatMessage> + Send + Sync>;

pub(crate) struct TurnConfig {
    pub provider: Arc<dyn Provider>,
    pub system_prompt: Option<String>,
    pub tools: Vec<Arc<dyn Tool>>,
    pub runtime: Arc<dyn Runtime>,
    pub max_steps: u32,
    pub steering: Option<MessageSource>,
    pub follow_ups: Option<MessageSource>,
}

/// What a finished turn hands back to the driver.
pub(crate) struct TurnOutcome {
    pub messages: Vec<ChatMessage>,
    pub cancelled: bool,
}

/// A tool call collected from the model stream.
struct ToolCallPart {
    id: String,
    name: String,
    args: Value,
}

/// A tool call with its execution plan, fixed during Phase 1.
struct PendingCall {
    id: String,
    name: String,
    plan: CallPlan,
}

enum CallPlan {
    Run { tool: Arc<dyn Tool>, args: Value },
    Deny(String),
    NotFound,
}

pub(crate) struct TurnLoop {
    config: TurnConfig,
    messages: Vec<ChatMessage>,
    cancel: CancellationToken,
    events: mpsc::Sender<AgentEvent>,
    decisions: mpsc::Receiver<Option<ToolDecision>>,
}

impl TurnLoop {
    pub(crate) fn new(
        config: TurnConfig,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
        events: mpsc::Sender<AgentEvent>,
        decisions: mpsc::Receiver<Option<ToolDecision>>,
    ) -> Self {
        Self {
            config,
            messages,
            cancel,
            events,
            decisions,
        }
    }

    pub(crate) async fn run(mut self) -> Result<TurnOutcome> {
        let mut step = 0u32;
        loop {
            step += 1;
            if step > self.config.max_steps {
                debug!(step, max_steps = self.config.max_steps, "max steps reached");
                return Ok(self.finish(false));
            }
            if self.cancel.is_cancelled() {
                return Ok(self.finish(true));
            }

            // Drain point 1: steering sent before this round-trip must be
            // visible to it.
            let steering = drain(&self.config.steering);
            self.append_user_messages(steering).await?;

            let Some(round) = self.model_round_trip().await? else {
                // Cancelled mid-stream.
                return Ok(self.finish(true));
            };
            let RoundTrip {
                text,
                tool_calls,
                usage,
                finish_reason,
            } = round;

            let mut blocks = Vec::with_capacity(tool_calls.len() + 1);
            if !text.is_empty() {
                blocks.push(ContentBlock::Text { text });
            }
            for call in &tool_calls {
                blocks.push(ContentBlock::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.args.clone(),
                });
            }
            let assistant = ChatMessage {
                role: Role::Assistant,
                content: MessageContent::Blocks(blocks),
            };
            self.messages.push(assistant.clone());
            self.emit(AgentEvent::Message { message: assistant }).await?;
            self.emit(AgentEvent::Step {
                usage,
                finish_reason,
            })
            .await?;

            if tool_calls.is_empty() {
                // Drain point 3: queued follow-ups keep the turn alive.
                let follow_ups = drain(&self.config.follow_ups);
                if follow_ups.is_empty() {
                    return Ok(self.finish(false));
                }
                self.append_user_messages(follow_ups).await?;
                continue;
            }

            // Phase 1: serialized decision collection.
            let mut pending: Vec<PendingCall> = Vec::with_capacity(tool_calls.len());
            let mut deferred_steering: Vec<ChatMessage> = Vec::new();
            let mut calls = tool_calls.into_iter();
            while let Some(call) = calls.next() {
                // Drain point 2: steering mid-phase defers its messages and
                // auto-denies this call and every one after it.
                let steering = drain(&self.config.steering);
                if !steering.is_empty() {
                    debug!(call = %call.name, "steering arrived mid-phase, denying remaining calls");
                    deferred_steering = steering;
                    pending.push(denied(call));
                    for rest in calls.by_ref() {
                        pending.push(denied(rest));
                    }
                    break;
                }

                let Some(tool) = self.find_tool(&call.name) else {
                    pending.push(PendingCall {
                        id: call.id,
                        name: call.name,
                        plan: CallPlan::NotFound,
                    });
                    continue;
                };

                self.emit(AgentEvent::ToolCall {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    args: call.args.clone(),
                })
                .await?;
                let decision = self
                    .decisions
                    .recv()
                    .await
                    .ok_or_else(|| Error::Disconnected("decision channel closed".to_string()))?;

                let plan = match decision {
                    Some(ToolDecision::Deny { reason }) => CallPlan::Deny(reason),
                    Some(ToolDecision::Rewrite { args }) => CallPlan::Run { tool, args },
                    None => CallPlan::Run {
                        tool,
                        args: call.args,
                    },
                };
                pending.push(PendingCall {
                    id: call.id,
                    name: call.name,
                    plan,
                });
            }

            // Phase 2: parallel execution of everything still pending.
            let results = self.execute_pending(&pending).await;

            // Phase 3: results in original call order, one tool-role
            // message each.
            for (call, (output, is_error)) in pending.iter().zip(results) {
                let message = ChatMessage::tool_result(&call.id, &call.name, &output);
                self.messages.push(message.clone());
                self.emit(AgentEvent::ToolResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    result: output,
                    is_error,
                    message,
                })
                .await?;
            }

            // Deferred steering lands after the tool results it displaced,
            // keeping every tool call adjacent to its result.
            self.append_user_messages(deferred_steering).await?;
        }
    }

    fn finish(self, cancelled: bool) -> TurnOutcome {
        TurnOutcome {
            messages: self.messages,
            cancelled,
        }
    }

    fn find_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.config
            .tools
            .iter()
            .find(|tool| tool.name() == name)
            .cloned()
    }

    async fn emit(&self, event: AgentEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| Error::Disconnected("event channel closed".to_string()))
    }

    /// Appends injected user messages and announces each one.
    async fn append_user_messages(&mut self, messages: Vec<ChatMessage>) -> Result<()> {
        for message in messages {
            self.messages.push(message.clone());
            self.emit(AgentEvent::Message { message }).await?;
        }
        Ok(())
    }

    /// Runs one streamed model round-trip. Returns `None` when cancelled
    /// mid-stream.
    async fn model_round_trip(&mut self) -> Result<Option<RoundTrip>> {
        let descriptors: Vec<ToolDescriptor> = self
            .config
            .tools
            .iter()
            .map(|tool| crate::tools::descriptor(tool.as_ref()))
            .collect();

        let mut stream = {
            let request = ProviderRequest {
                system: self.config.system_prompt.as_deref(),
                messages: &self.messages,
                tools: &descriptors,
                cancel: self.cancel.clone(),
            };
            self.config.provider.stream(request).await?
        };

        let mut text = String::new();
        let mut tool_calls: Vec<ToolCallPart> = Vec::new();
        let mut usage = Usage::default();
        let mut finish_reason = "stop".to_string();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(None),
                next = stream.next() => next,
            };
            let Some(part) = next else {
                break;
            };
            match part? {
                StreamPart::TextDelta { text: delta } => {
                    if !delta.is_empty() {
                        text.push_str(&delta);
                        self.emit(AgentEvent::TextDelta { delta }).await?;
                    }
                }
                StreamPart::ToolCall { id, name, input } => {
                    tool_calls.push(ToolCallPart {
                        id,
                        name,
                        args: input,
                    });
                }
                StreamPart::Finish {
                    usage: u,
                    finish_reason: reason,
                } => {
                    usage = u;
                    finish_reason = reason;
                }
            }
        }

        Ok(Some(RoundTrip {
            text,
            tool_calls,
            usage,
            finish_reason,
        }))
    }

    /// Executes all pending calls concurrently; results come back indexed
    /// so Phase 3 can emit them in the original call order.
    async fn execute_pending(&self, pending: &[PendingCall]) -> Vec<(String, bool)> {
        let mut slots: Vec<Option<(String, bool)>> = Vec::with_capacity(pending.len());
        slots.resize_with(pending.len(), || None);
        let mut join_set: JoinSet<(usize, String, bool)> = JoinSet::new();

        for (i, call) in pending.iter().enumerate() {
            match &call.plan {
                CallPlan::NotFound => {
                    slots[i] = Some((format!("Tool not found: {}", call.name), true));
                }
                CallPlan::Deny(reason) => {
                    slots[i] = Some((reason.clone(), true));
                }
                CallPlan::Run { tool, args } => {
                    let tool = tool.clone();
                    let args = args.clone();
                    let ctx = ToolContext {
                        runtime: self.config.runtime.clone(),
                        cancel: self.cancel.clone(),
                    };
                    join_set.spawn(async move {
                        match tool.execute(args, &ctx).await {
                            Ok(output) => (i, output, false),
                            Err(error) => (i, error.to_string(), true),
                        }
                    });
                }
            }
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((i, output, is_error)) => slots[i] = Some((output, is_error)),
                Err(error) => warn!(%error, "tool task failed to join"),
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| ("Tool execution aborted".to_string(), true)))
            .collect()
    }
}

struct RoundTrip {
    text: String,
    tool_calls: Vec<ToolCallPart>,
    usage: Usage,
    finish_reason: String,
}

fn drain(source: &Option<MessageSource>) -> Vec<ChatMessage> {
    source.as_ref().map(|f| f()).unwrap_or_default()
}

fn denied(call: ToolCallPart) -> PendingCall {
    PendingCall {
        id: call.id,
        name: call.name,
        plan: CallPlan::Deny(STEERING_DENY_REASON.to_string()),
    }
}
