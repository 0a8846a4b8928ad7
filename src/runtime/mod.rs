pub mod circuit_breaker;
pub mod interpreter;

pub use circuit_breaker::{BreakerDecision, LoopBreaker};

use crate::bus::{ChannelBus, Envelope, EventBus, events};
use crate::config::{AgentConfig, ChannelConfig, RuntimeConfig};
use crate::conversation::{
    Compactor, ConversationHistory, ConversationMessage, PairingPolicy, ToolCall, compaction,
};
use crate::errors::MxfError;
use crate::memory::{MemoryAccessor, MemoryEntry, MemoryScope, MemoryService};
use crate::params::{ParamService, Phase};
use crate::prompt::{PromptBuilder, TemplateContext, attributed};
use crate::providers::base::{InferenceRequest, LlmProvider, RetryConfig};
use crate::session::SessionManager;
use crate::tasks::{ActiveTaskMap, TaskService};
use crate::tools::convert::args_hash;
use crate::tools::registry::{AgentToolProfile, ToolRegistry};
use crate::tools::{ExecutionContext, ToolResult};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Synthesized terminal content when a turn exhausts its iteration budget.
pub const ITERATION_LIMIT_MESSAGE: &str = "iteration_limit_reached";

/// Inputs consumed by an agent runtime while idle.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    PeerMessage { from: String, content: String },
    ChannelMessage { from: String, content: String },
    TaskAssigned { task_id: String },
    Tick,
    Cancel,
}

/// Observable ORPAR machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Idle,
    Observe,
    Reason,
    Plan,
    Act,
    Reflect,
    Complete,
}

impl RuntimeState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Observe => "observe",
            Self::Reason => "reason",
            Self::Plan => "plan",
            Self::Act => "act",
            Self::Reflect => "reflect",
            Self::Complete => "complete",
        }
    }
}

/// Shared services threaded into every runtime at construction.
#[derive(Clone)]
pub struct RuntimeDeps {
    pub bus: Arc<EventBus>,
    pub registry: Arc<ToolRegistry>,
    pub params: Arc<ParamService>,
    pub provider: Arc<dyn LlmProvider>,
    pub tasks: Arc<TaskService>,
    pub sessions: Arc<SessionManager>,
    pub memory: Arc<MemoryService>,
    pub active_tasks: ActiveTaskMap,
}

/// Control handle returned by [`AgentRuntime::spawn`].
pub struct RuntimeHandle {
    pub events: mpsc::Sender<AgentEvent>,
    pub task: tokio::task::JoinHandle<()>,
    runtime: Arc<AgentRuntime>,
}

impl RuntimeHandle {
    /// Request cancellation; the runtime observes it at the next state
    /// transition and returns to Idle with pairing preserved.
    pub fn cancel(&self) {
        self.runtime.cancelled.store(true, Ordering::Release);
    }

    pub async fn state(&self) -> RuntimeState {
        *self.runtime.state.lock().await
    }
}

/// One per `{agentId, channelId}`: the ORPAR cognitive loop.
///
/// The machine is logically single-threaded — the event loop processes one
/// input at a time and the turn lock is implicit in that — which is what
/// preserves the tool-call pairing invariant without finer locking.
pub struct AgentRuntime {
    agent: AgentConfig,
    channel: ChannelConfig,
    config: RuntimeConfig,
    deps: RuntimeDeps,
    channel_bus: ChannelBus,
    profile: AgentToolProfile,
    prompt_builder: PromptBuilder,
    conversation: Mutex<ConversationHistory>,
    compactor: Option<Compactor>,
    breaker: Mutex<LoopBreaker>,
    state: Mutex<RuntimeState>,
    cancelled: AtomicBool,
    retry: RetryConfig,
}

impl AgentRuntime {
    pub fn new(
        agent: AgentConfig,
        channel: ChannelConfig,
        config: RuntimeConfig,
        deps: RuntimeDeps,
    ) -> Arc<Self> {
        let channel_bus = ChannelBus::new(deps.bus.clone(), channel.id.clone(), agent.agent_id.clone());
        let profile = AgentToolProfile {
            allowed_tools: agent
                .allowed_tools
                .clone()
                .map(|tools| tools.into_iter().collect()),
        };
        let compactor = config.compaction.enabled.then(|| {
            Compactor::new(
                deps.provider.clone(),
                agent.model.clone(),
                config.compaction.keep_last,
            )
        });
        let breaker = LoopBreaker::new(
            config.breaker_threshold,
            config.breaker_window,
            agent.circuit_breaker_exempt_tools.iter().cloned(),
        );

        Arc::new(Self {
            conversation: Mutex::new(ConversationHistory::with_dedup_window(config.dedup_window)),
            breaker: Mutex::new(breaker),
            state: Mutex::new(RuntimeState::Idle),
            cancelled: AtomicBool::new(false),
            retry: RetryConfig::default(),
            prompt_builder: PromptBuilder::new(),
            compactor,
            channel_bus,
            profile,
            agent,
            channel,
            config,
            deps,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent.agent_id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel.id
    }

    /// Start the event loop. One runtime instance per `{agentId, channelId}`
    /// at any moment; the caller enforces that.
    pub fn spawn(self: Arc<Self>) -> RuntimeHandle {
        let (tx, mut rx) = mpsc::channel::<AgentEvent>(64);
        let runtime = self.clone();
        let task = tokio::spawn(async move {
            runtime
                .channel_bus
                .emit(Envelope::new(
                    events::AGENT_REGISTERED,
                    json!({ "agentId": &runtime.agent.agent_id }),
                ))
                .await;
            info!(
                "runtime for {}@{} started",
                runtime.agent.agent_id, runtime.channel.id
            );
            while let Some(event) = rx.recv().await {
                if matches!(event, AgentEvent::Cancel) {
                    runtime.cancelled.store(true, Ordering::Release);
                    continue;
                }
                runtime.handle_event(event).await;
            }
            info!(
                "runtime for {}@{} stopped",
                runtime.agent.agent_id, runtime.channel.id
            );
        });
        RuntimeHandle {
            events: tx,
            task,
            runtime: self,
        }
    }

    fn max_iterations(&self) -> usize {
        self.agent.max_iterations.unwrap_or(self.config.max_iterations)
    }

    async fn set_state(&self, state: RuntimeState) {
        *self.state.lock().await = state;
    }

    async fn emit_phase(&self, event_type: &str, data: serde_json::Value) {
        self.channel_bus.emit(Envelope::new(event_type, data)).await;
    }

    /// Consume one input event: Observe, then drive the reason/act loop.
    pub async fn handle_event(&self, event: AgentEvent) {
        if self.cancelled.swap(false, Ordering::AcqRel) {
            // A cancel that raced the queue: drop this input and stay idle.
            self.set_state(RuntimeState::Idle).await;
            return;
        }
        if matches!(event, AgentEvent::Cancel) {
            self.cancelled.store(true, Ordering::Release);
            self.set_state(RuntimeState::Idle).await;
            return;
        }

        // Observe: fold the input into the conversation.
        self.set_state(RuntimeState::Observe).await;
        let observation = match &event {
            AgentEvent::PeerMessage { from, content } => {
                self.conversation
                    .lock()
                    .await
                    .append(ConversationMessage::user(content.clone()).with_agent(from.clone()));
                format!("peer message from {}", from)
            }
            AgentEvent::ChannelMessage { from, content } => {
                self.conversation
                    .lock()
                    .await
                    .append(ConversationMessage::user(content.clone()).with_agent(from.clone()));
                format!("channel message from {}", from)
            }
            AgentEvent::TaskAssigned { task_id } => {
                match self.observe_task(task_id).await {
                    Ok(summary) => summary,
                    Err(e) => {
                        warn!(
                            "{}: task {} could not be observed: {}",
                            self.agent.agent_id, task_id, e
                        );
                        self.set_state(RuntimeState::Idle).await;
                        return;
                    }
                }
            }
            AgentEvent::Tick => "scheduled tick".to_string(),
            AgentEvent::Cancel => return,
        };
        self.emit_phase(
            events::CONTROLLOOP_OBSERVATION,
            json!({ "input": observation }),
        )
        .await;

        self.run_turn().await;
    }

    async fn observe_task(&self, task_id: &str) -> Result<String, MxfError> {
        let task = self
            .deps
            .tasks
            .start(task_id, &self.agent.agent_id)
            .await?;
        self.deps
            .active_tasks
            .write()
            .await
            .insert(self.agent.agent_id.clone(), task.task_id.clone());
        self.conversation.lock().await.append(ConversationMessage::user(format!(
            "You have been assigned task {}: {}\n{}\nWhen finished, call task_complete with a summary.",
            task.task_id, task.title, task.description
        )));
        Ok(format!("task {} assigned", task.task_id))
    }

    /// The reason/act loop. One iteration = one inference plus the dispatch
    /// of every tool call in that inference's assistant message.
    async fn run_turn(&self) {
        let max_iterations = self.max_iterations();
        let mut iterations = 0usize;
        let mut forced_reflection: Option<String> = None;
        let mut terminal_content: Option<String> = None;

        if self.config.planning_enabled {
            self.run_planning_phase().await;
        }

        loop {
            if self.cancelled.swap(false, Ordering::AcqRel) {
                // Observe the cancel at a state transition: close any open
                // pairs and return to Idle.
                let mut conversation = self.conversation.lock().await;
                let _ = conversation.enforce_pairing(PairingPolicy::Synthesize);
                drop(conversation);
                self.set_state(RuntimeState::Idle).await;
                return;
            }
            if iterations >= max_iterations {
                warn!(
                    "{}: iteration limit {} reached, forcing terminal message",
                    self.agent.agent_id, max_iterations
                );
                self.conversation
                    .lock()
                    .await
                    .append(ConversationMessage::assistant(ITERATION_LIMIT_MESSAGE));
                terminal_content = Some(ITERATION_LIMIT_MESSAGE.to_string());
                break;
            }

            // Pairing enforcer gates every inference.
            {
                let mut conversation = self.conversation.lock().await;
                match conversation.enforce_pairing(self.config.pairing_policy) {
                    Ok(synthesized) if !synthesized.is_empty() => {
                        debug!(
                            "{}: synthesized {} missing tool results",
                            self.agent.agent_id,
                            synthesized.len()
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Abort policy: end the turn, do not crash.
                        self.channel_bus
                            .emit(Envelope::new(
                                events::AGENT_ERROR,
                                json!({ "type": "pairing", "error": e.to_string() }),
                            ))
                            .await;
                        self.set_state(RuntimeState::Idle).await;
                        return;
                    }
                }
            }

            self.maybe_compact().await;

            // Reason.
            self.set_state(RuntimeState::Reason).await;
            self.emit_phase(
                events::CONTROLLOOP_REASONING,
                json!({ "iteration": iterations + 1 }),
            )
            .await;

            let response = self.infer(Phase::Reasoning).await;
            iterations += 1;
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    // Retries exhausted: the failure becomes reflection
                    // input and the turn ends.
                    warn!("{}: inference failed: {}", self.agent.agent_id, e);
                    forced_reflection = Some(format!("inference failed: {}", e));
                    break;
                }
            };

            let mut tool_calls = response.tool_calls.clone();
            let mut interpreted = false;
            if tool_calls.is_empty() && self.config.interpreter_enabled {
                if let Some(content) = &response.content {
                    let known: Vec<String> = self
                        .deps
                        .registry
                        .definitions_for(&self.channel.id, &self.profile)
                        .await
                        .into_iter()
                        .map(|d| d.name)
                        .collect();
                    if let Some(call) = interpreter::detect_intended_tool_call(content, &known) {
                        interpreted = true;
                        tool_calls.push(call);
                    }
                }
            }

            self.conversation.lock().await.append(
                ConversationMessage::assistant_with_calls(
                    response.content.clone().unwrap_or_default(),
                    tool_calls.clone(),
                )
                .with_agent(self.agent.agent_id.clone()),
            );

            if tool_calls.is_empty() {
                terminal_content = response.content;
                break;
            }

            // Act.
            self.set_state(RuntimeState::Act).await;
            self.emit_phase(
                events::CONTROLLOOP_ACTION,
                json!({
                    "tools": tool_calls.iter().map(|c| c.name.clone()).collect::<Vec<_>>(),
                    "source": if interpreted { "interpreted" } else { "model" },
                }),
            )
            .await;

            let (results, tripped) = self.dispatch_tool_calls(&tool_calls).await;
            if let Some(tool) = tripped {
                forced_reflection = Some(format!("circuit breaker open for tool '{}'", tool));
            }

            let mut terminal = false;
            {
                let mut conversation = self.conversation.lock().await;
                for (call, result) in &results {
                    conversation.append(ConversationMessage::tool_result(
                        call.tool_call_id.clone(),
                        result.content.clone(),
                    ));
                    if !result.is_error
                        && (call.name == "task_complete" || call.name == "no_further_action")
                    {
                        terminal = true;
                    }
                }
            }
            if terminal {
                break;
            }
            if forced_reflection.is_some() {
                break;
            }
        }

        self.deps.params.end_phase(&self.agent.agent_id, Phase::Reasoning);

        if forced_reflection.is_some() || self.config.reflection_enabled {
            self.run_reflection_phase(forced_reflection).await;
        }

        // Complete: surface the terminal output to the channel, then Idle.
        self.set_state(RuntimeState::Complete).await;
        if let Some(content) = terminal_content {
            if !content.is_empty() {
                self.channel_bus
                    .emit(Envelope::new(
                        events::MESSAGE_SENT,
                        json!({ "from": &self.agent.agent_id, "content": content }),
                    ))
                    .await;
            }
        }
        self.set_state(RuntimeState::Idle).await;
    }

    async fn run_planning_phase(&self) {
        self.set_state(RuntimeState::Plan).await;
        match self.infer(Phase::Planning).await {
            Ok(response) => {
                if let Some(plan) = response.content {
                    if !plan.is_empty() {
                        self.conversation.lock().await.append(
                            ConversationMessage::assistant(format!("Plan:\n{}", plan))
                                .with_agent(self.agent.agent_id.clone()),
                        );
                        self.emit_phase(events::CONTROLLOOP_PLAN, json!({ "plan": plan })).await;
                    }
                }
            }
            Err(e) => warn!("{}: planning inference failed: {}", self.agent.agent_id, e),
        }
        self.deps.params.end_phase(&self.agent.agent_id, Phase::Planning);
    }

    async fn run_reflection_phase(&self, trigger: Option<String>) {
        self.set_state(RuntimeState::Reflect).await;
        if let Some(trigger) = &trigger {
            self.conversation.lock().await.append(ConversationMessage::system(format!(
                "Reflection requested: {}. Review the recent attempts and adjust the approach.",
                trigger
            )));
        }
        self.emit_phase(
            events::CONTROLLOOP_REFLECTION,
            json!({ "trigger": trigger.as_deref().unwrap_or("scheduled") }),
        )
        .await;

        match self.infer(Phase::Reflection).await {
            Ok(response) => {
                if let Some(reflection) = response.content {
                    if !reflection.is_empty() {
                        self.conversation.lock().await.append(
                            ConversationMessage::assistant(reflection.clone())
                                .with_agent(self.agent.agent_id.clone()),
                        );
                        // Outcomes persist in agent-scoped memory.
                        let accessor =
                            MemoryAccessor::agent(&self.agent.agent_id, &self.channel.id);
                        let entry = MemoryEntry {
                            key: "last_reflection".to_string(),
                            value: json!(reflection),
                            entry_type: "reflection".to_string(),
                            metadata: json!({}),
                            expires_at: None,
                        };
                        if let Err(e) = self.deps.memory.put(
                            &accessor,
                            &MemoryScope::Agent(self.agent.agent_id.clone()),
                            &entry,
                        ) {
                            warn!("{}: reflection write failed: {}", self.agent.agent_id, e);
                        }
                    }
                }
            }
            Err(e) => warn!("{}: reflection inference failed: {}", self.agent.agent_id, e),
        }
        self.deps.params.end_phase(&self.agent.agent_id, Phase::Reflection);
    }

    /// One inference with phase-resolved parameters. `next_call` overrides
    /// are consumed after exactly this call, under the turn's serialization.
    async fn infer(
        &self,
        phase: Phase,
    ) -> anyhow::Result<crate::providers::base::InferenceResponse> {
        let mut params = self
            .deps
            .params
            .resolve(&self.agent.agent_id, &self.channel.id, phase);
        if let Some(model) = &self.agent.model {
            // The per-agent model applies only when nothing more specific
            // (override or channel default) chose one.
            if params.model == self.deps.params.default_model() {
                params.model = model.clone();
            }
        }

        let definitions = self
            .deps
            .registry
            .definitions_for(&self.channel.id, &self.profile)
            .await;
        let roster = self.deps.sessions.channel_roster(&self.channel.id).await;
        let template = TemplateContext {
            agent_id: self.agent.agent_id.clone(),
            channel_id: self.channel.id.clone(),
            channel_name: self.channel.name.clone(),
            active_agents: roster,
            llm_provider: self.deps.provider.name().to_string(),
            llm_model: params.model.clone(),
            system_llm_enabled: self.channel.system_llm_enabled,
            orpar_phase: phase.as_str().to_string(),
        };
        let system_prompt =
            self.prompt_builder
                .build(&template, &self.channel.description, &definitions);

        let mut messages = Vec::with_capacity(self.conversation.lock().await.len() + 1);
        messages.push(ConversationMessage::system(system_prompt));
        {
            let conversation = self.conversation.lock().await;
            messages.extend(conversation.messages().iter().map(attributed));
        }

        let model = params.model.clone();
        let request = InferenceRequest {
            messages,
            tools: Some(definitions),
            params,
        };
        let result = self.deps.provider.infer_with_retry(request, &self.retry).await;
        self.deps.params.consume_next_call(&self.agent.agent_id);

        if let Ok(response) = &result {
            self.deps.params.record_usage(phase, &model, response.usage);
        }
        result
    }

    /// Dispatch every tool call of one assistant message. Calls run
    /// concurrently; results are ordered deterministically by `toolCallId`
    /// before they are appended. Returns the tripped tool, if the loop
    /// breaker opened during this batch.
    async fn dispatch_tool_calls(
        &self,
        tool_calls: &[ToolCall],
    ) -> (Vec<(ToolCall, ToolResult)>, Option<String>) {
        let mut results: Vec<(ToolCall, ToolResult)> = Vec::with_capacity(tool_calls.len());
        let mut join_set: JoinSet<(usize, Result<ToolResult, MxfError>)> = JoinSet::new();
        let mut tripped: Option<String> = None;

        for (index, call) in tool_calls.iter().enumerate() {
            let hash = args_hash(&call.name, &call.arguments);
            let decision = self.breaker.lock().await.check(&call.name, &hash);
            match decision {
                BreakerDecision::JustTripped | BreakerDecision::CircuitOpen => {
                    if decision == BreakerDecision::JustTripped {
                        tripped = Some(call.name.clone());
                    }
                    results.push((
                        call.clone(),
                        ToolResult::error(
                            json!({ "success": false, "error": "CIRCUIT_OPEN" }).to_string(),
                        ),
                    ));
                }
                BreakerDecision::Proceed => {
                    let registry = self.deps.registry.clone();
                    let profile = self.profile.clone();
                    let ctx = ExecutionContext::new(
                        self.agent.agent_id.clone(),
                        self.channel.id.clone(),
                        call.tool_call_id.clone(),
                    );
                    let call = call.clone();
                    join_set.spawn(async move {
                        let result = registry
                            .invoke(&call.name, call.arguments.clone(), &ctx, &profile)
                            .await;
                        (index, result)
                    });
                }
            }
        }

        let mut dispatched: Vec<(usize, Result<ToolResult, MxfError>)> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(entry) => dispatched.push(entry),
                Err(e) => warn!("{}: tool dispatch task failed: {}", self.agent.agent_id, e),
            }
        }
        for (index, result) in dispatched {
            let call = tool_calls[index].clone();
            let tool_result = match result {
                Ok(result) => result,
                // Resolution/validation failures become synthetic paired
                // results; the turn continues.
                Err(e) => ToolResult::error(
                    json!({ "success": false, "error": e.code().as_str(), "message": e.to_string() })
                        .to_string(),
                ),
            };
            results.push((call, tool_result));
        }

        results.sort_by(|a, b| a.0.tool_call_id.cmp(&b.0.tool_call_id));
        (results, tripped)
    }

    async fn maybe_compact(&self) {
        let Some(compactor) = &self.compactor else { return };
        let mut conversation = self.conversation.lock().await;
        if compaction::estimate_history_tokens(&conversation) < self.config.compaction.trigger_tokens
        {
            return;
        }
        if let Err(e) = compactor.compact(&mut conversation).await {
            warn!("{}: compaction failed: {}", self.agent.agent_id, e);
        }
    }

    /// Test/diagnostic view of the conversation.
    pub async fn conversation_snapshot(&self) -> Vec<ConversationMessage> {
        self.conversation.lock().await.messages().to_vec()
    }
}

#[cfg(test)]
mod tests;
