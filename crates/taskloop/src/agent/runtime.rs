//! The PLAN → ACT → OBSERVE → REFLECT loop.
//!
//! [`Runtime::run`] hands back an [`AgentRun`], a lazy, pull-driven sequence
//! of [`AgentUpdate`]s. Nothing happens until the caller asks for the next
//! update; each pull advances the state machine by at most one phase, so
//! the caller controls pacing and every update for phase N is delivered
//! before any work for phase N+1 starts.
//!
//! Before every transition the runtime checks the cancellation token and
//! the [`Budget`](super::budget::Budget). A tripped budget ends the run in
//! `BUDGET_EXCEEDED` with a partial-result summary; cancellation ends it in
//! `FAILED` tagged `cancelled`. Iterations count ACT batches and only bind
//! when another batch is about to start, so a run that finishes in exactly
//! `max_iterations` batches still completes.
//!
//! Tool failures never end a run by themselves: they are recorded as
//! observations and reflection decides what happens next.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use futures::Stream;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::budget;
use crate::agent::config::RuntimeConfig;
use crate::agent::events::{AgentUpdate, UpdateKind, UpdateObserver};
use crate::agent::machine::{Phase, TransitionEvent, transition};
use crate::agent::memory::Observation;
use crate::agent::plan::{
    PlannedSubgoal, apply_plan, fail_blocked, next_ready, validate_additions, validate_plan,
};
use crate::agent::session::StateStore;
use crate::agent::state::{AgentState, StepResult, SubgoalStatus, Task, Termination};
use crate::api::gateway::{CompletionGateway, Reply};
use crate::api::pricing::CompletionUsage;
use crate::api::prompts::{self, NextAction, Reflection};
use crate::error::AgentError;
use crate::tools::{ToolInvocation, ToolRegistry, ToolResult};

/// Factory for runs. Consumed by [`run`](Self::run) or
/// [`resume`](Self::resume): a finished run cannot be restarted.
pub struct Runtime {
    gateway: Arc<CompletionGateway>,
    tools: Arc<ToolRegistry>,
    config: RuntimeConfig,
    cancel: CancellationToken,
    store: Option<StateStore>,
    observers: Vec<Arc<dyn UpdateObserver>>,
}

impl Runtime {
    pub fn new(gateway: CompletionGateway, tools: Arc<ToolRegistry>, config: RuntimeConfig) -> Self {
        Self {
            gateway: Arc::new(gateway),
            tools,
            config,
            cancel: CancellationToken::new(),
            store: None,
            observers: Vec::new(),
        }
    }

    /// Checkpoint to `store` periodically and at terminal states.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_observer(mut self, observer: impl UpdateObserver + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that aborts the run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start a fresh run for `task`.
    pub fn run(self, task: Task) -> AgentRun {
        info!("Starting task {}: {}", task.id, task.description);
        let state = AgentState::new(task, self.config.memory_capacity);
        AgentRun::new(self, state)
    }

    /// Continue from a snapshot.
    ///
    /// A plan-less state re-plans. A batch that ran but was never observed
    /// resumes at OBSERVE, so its tools are not executed twice. Otherwise
    /// any active subgoal returns to pending and the run resumes at ACT (or
    /// at REFLECT when nothing is runnable). Terminal snapshots only replay
    /// their terminal update.
    pub fn resume(self, mut state: AgentState) -> AgentRun {
        info!(
            "Resuming task {} from {} ({})",
            state.task.id,
            state.phase,
            state.progress_summary()
        );
        if !state.phase.is_terminal() && has_unobserved_batch(&state) {
            debug!("Last tool batch was not observed; resuming at OBSERVING");
            state.phase = Phase::Observing;
        } else if !state.phase.is_terminal() {
            let active: Vec<String> = state
                .subgoals
                .iter()
                .filter(|s| s.status == SubgoalStatus::Active)
                .map(|s| s.id.clone())
                .collect();
            for id in &active {
                state.mark_pending(id);
            }
            state.phase = if state.subgoals.is_empty() {
                Phase::Planning
            } else if next_ready(&state).is_some() {
                Phase::Acting
            } else {
                Phase::Reflecting
            };
        }
        let mut run = AgentRun::new(self, state);
        run.resumed = true;
        run
    }
}

/// The latest step result belongs to the active subgoal's current attempt
/// and no OBSERVE has consumed it yet.
fn has_unobserved_batch(state: &AgentState) -> bool {
    let Some(step) = state.step_results.last() else {
        return false;
    };
    matches!(state.phase, Phase::Acting | Phase::Observing)
        && step.iteration == state.iterations
        && state
            .subgoal(&step.subgoal_id)
            .is_some_and(|s| s.status == SubgoalStatus::Active)
}

/// One in-flight run. Pull updates with [`next_update`](Self::next_update)
/// or [`into_stream`](Self::into_stream).
pub struct AgentRun {
    gateway: Arc<CompletionGateway>,
    tools: Arc<ToolRegistry>,
    config: RuntimeConfig,
    cancel: CancellationToken,
    store: Option<StateStore>,
    observers: Vec<Arc<dyn UpdateObserver>>,
    state: AgentState,
    queue: VecDeque<AgentUpdate>,
    /// Proximate cause for the next fatal transition.
    error: Option<AgentError>,
    clock: Instant,
    base_elapsed: f64,
    resumed: bool,
    started: bool,
    finished: bool,
}

impl AgentRun {
    fn new(runtime: Runtime, state: AgentState) -> Self {
        let base_elapsed = state.elapsed_secs;
        Self {
            gateway: runtime.gateway,
            tools: runtime.tools,
            config: runtime.config,
            cancel: runtime.cancel,
            store: runtime.store,
            observers: runtime.observers,
            state,
            queue: VecDeque::new(),
            error: None,
            clock: Instant::now(),
            base_elapsed,
            resumed: false,
            started: false,
            finished: false,
        }
    }

    /// Next update, or `None` once the terminal update has been delivered.
    pub async fn next_update(&mut self) -> Option<AgentUpdate> {
        loop {
            if let Some(update) = self.queue.pop_front() {
                return Some(update);
            }
            if self.finished {
                return None;
            }
            self.step().await;
        }
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn into_state(self) -> AgentState {
        self.state
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished && self.queue.is_empty()
    }

    /// Adapt into a [`Stream`] of updates.
    pub fn into_stream(self) -> impl Stream<Item = AgentUpdate> + Send {
        futures::stream::unfold(self, |mut run| async move {
            run.next_update().await.map(|update| (update, run))
        })
    }

    /// Drive the run to the end, returning every update and the final state.
    pub async fn collect(mut self) -> (Vec<AgentUpdate>, AgentState) {
        let mut updates = Vec::new();
        while let Some(update) = self.next_update().await {
            updates.push(update);
        }
        (updates, self.state)
    }

    // ── Driver ─────────────────────────────────────────────────────

    async fn step(&mut self) {
        self.tick();

        if !self.started {
            self.started = true;
            if self.state.phase.is_terminal() {
                debug!("Replaying terminal state {}", self.state.phase);
                let update = self.terminal_update();
                self.push(update);
                self.finished = true;
                return;
            }
            if self.resumed {
                self.emit(
                    UpdateKind::PhaseChanged,
                    format!("resumed at {}", self.state.phase),
                    json!({"from": null, "to": self.state.phase, "event": "resumed"}),
                );
            }
        }

        if let Some(event) = self.checkpoint(self.state.phase) {
            self.apply(event);
            return;
        }

        match self.state.phase {
            Phase::Planning => self.plan().await,
            Phase::Acting => self.act().await,
            Phase::Observing => self.observe(),
            Phase::Reflecting => self.reflect().await,
            Phase::Completed | Phase::Failed | Phase::BudgetExceeded => self.finished = true,
        }
    }

    fn tick(&mut self) {
        self.state.elapsed_secs = self.base_elapsed + self.clock.elapsed().as_secs_f64();
    }

    /// Cancellation and budget check ahead of entering `next`.
    fn checkpoint(&mut self, next: Phase) -> Option<TransitionEvent> {
        self.tick();
        if self.cancel.is_cancelled() {
            return Some(TransitionEvent::Cancelled);
        }
        let mut usage = self.state.usage_snapshot();
        if next != Phase::Acting {
            usage.iterations = 0;
        }
        let verdict = budget::check(&self.state.task.budget, &usage);
        verdict.dimension.map(TransitionEvent::BudgetTripped)
    }

    /// Transition after the budget and cancellation checks.
    fn advance(&mut self, event: TransitionEvent) {
        let target = transition(self.state.phase, &event).ok();
        let interrupt = target.and_then(|next| self.checkpoint(next));
        self.apply(interrupt.unwrap_or(event));
    }

    fn apply(&mut self, event: TransitionEvent) {
        let from = self.state.phase;
        match transition(from, &event) {
            Ok(to) => {
                debug!("Phase transition: {from} -> {to} ({event})");
                self.state.phase = to;
                self.emit(
                    UpdateKind::PhaseChanged,
                    format!("{from} -> {to}"),
                    json!({"from": from, "to": to, "event": event.to_string()}),
                );
                if to.is_terminal() {
                    self.finish(&event);
                }
            }
            Err(err) => {
                error!("{err}");
                if from.is_terminal() {
                    self.finished = true;
                } else {
                    self.error = Some(err);
                    self.apply(TransitionEvent::Fatal);
                }
            }
        }
    }

    /// Fail with `err` as the proximate cause.
    fn fail(&mut self, err: AgentError) {
        let event = match &err {
            AgentError::Cancelled => TransitionEvent::Cancelled,
            AgentError::BudgetExceeded { dimension } => TransitionEvent::BudgetTripped(*dimension),
            AgentError::InvalidPlan(_) if self.state.phase == Phase::Planning => {
                TransitionEvent::PlanRejected
            }
            _ => TransitionEvent::Fatal,
        };
        if !matches!(err, AgentError::Cancelled) {
            self.state.record_error(err.to_string());
        }
        self.error = Some(err);
        self.apply(event);
    }

    fn finish(&mut self, event: &TransitionEvent) {
        let phase = self.state.phase;
        let cause = match event {
            TransitionEvent::BudgetTripped(dimension) => Some(AgentError::BudgetExceeded {
                dimension: *dimension,
            }),
            TransitionEvent::Cancelled => Some(AgentError::Cancelled),
            TransitionEvent::Fatal | TransitionEvent::PlanRejected => Some(
                self.error
                    .take()
                    .unwrap_or_else(|| AgentError::Validation("unrecoverable error".into())),
            ),
            _ => None,
        };

        let progress = self.state.progress_summary();
        let reason = match &cause {
            None => "all subgoals completed".to_string(),
            Some(AgentError::BudgetExceeded { dimension }) => {
                format!("budget exceeded: {dimension}; {progress}")
            }
            Some(AgentError::Cancelled) => format!("cancelled; {progress}"),
            Some(err) => err.to_string(),
        };
        if phase != Phase::Completed && self.state.final_output.is_none() {
            self.state.final_output = Some(format!(
                "{progress}\n{}",
                self.state.subgoal_report()
            ));
        }
        self.state.termination = Some(Termination {
            phase,
            reason,
            error_kind: cause.as_ref().map(|e| e.kind().to_string()),
        });

        match phase {
            Phase::Completed => info!("Task {} completed. {}", self.state.task.id, progress),
            _ => warn!(
                "Task {} ended in {phase}: {}",
                self.state.task.id,
                cause.as_ref().map(ToString::to_string).unwrap_or_default()
            ),
        }

        self.save_checkpoint();
        if phase == Phase::Failed
            && let Some(ref store) = self.store
            && let Some(ref err) = cause
            && let Err(e) = store.save_debug(&self.state, err)
        {
            warn!("Failed to write debug snapshot: {e}");
        }

        let update = self.terminal_update();
        self.push(update);
        self.finished = true;
    }

    /// The final update for the current terminal state.
    fn terminal_update(&self) -> AgentUpdate {
        let termination = self.state.termination.clone().unwrap_or(Termination {
            phase: self.state.phase,
            reason: String::new(),
            error_kind: None,
        });
        let kind = match (termination.phase, termination.error_kind.as_deref()) {
            (Phase::Completed, _) => UpdateKind::Completed,
            (Phase::BudgetExceeded, _) => UpdateKind::BudgetExceeded,
            (_, Some("cancelled")) => UpdateKind::Cancelled,
            _ => UpdateKind::Error,
        };
        let message = match kind {
            UpdateKind::Completed => self
                .state
                .final_output
                .clone()
                .unwrap_or_else(|| termination.reason.clone()),
            _ => termination.reason.clone(),
        };
        let counts = self.state.counts();
        let update = AgentUpdate::new(
            kind,
            message,
            json!({
                "phase": termination.phase,
                "reason": termination.reason,
                "error_kind": termination.error_kind,
                "total_cost_usd": self.state.usage.total_cost_usd,
                "total_tokens": self.state.usage.total_tokens(),
                "iterations": self.state.iterations,
                "elapsed_secs": self.state.elapsed_secs,
                "subgoals": counts,
                "final_output": self.state.final_output,
            }),
        );
        for observer in &self.observers {
            observer.on_update(&update);
        }
        update
    }

    // ── Updates ────────────────────────────────────────────────────

    fn emit(&mut self, kind: UpdateKind, message: impl Into<String>, payload: serde_json::Value) {
        let update = AgentUpdate::new(kind, message, payload);
        for observer in &self.observers {
            observer.on_update(&update);
        }
        self.push(update);
    }

    fn push(&mut self, update: AgentUpdate) {
        self.queue.push_back(update);
    }

    /// Forward streamed text and account for one completion call.
    fn account(&mut self, phase: Phase, reply: &Reply) {
        for chunk in &reply.chunks {
            self.emit(UpdateKind::Text, chunk.clone(), json!({"phase": phase}));
        }
        self.state.record_usage(phase, &reply.usage);
        self.emit_cost(phase, reply.usage.cost_usd);
    }

    fn emit_cost(&mut self, phase: Phase, call_cost: f64) {
        let total = self.state.usage.total_cost_usd;
        let tokens = self.state.usage.total_tokens();
        self.emit(
            UpdateKind::CostUpdate,
            format!("${total:.4} spent, {tokens} tokens"),
            json!({
                "phase": phase,
                "call_cost_usd": call_cost,
                "total_cost_usd": total,
                "total_tokens": tokens,
                "llm_calls": self.state.llm_calls,
            }),
        );
    }

    /// Count an unusable planner response; escalate past the ceiling.
    fn validation_failure(&mut self, phase: Phase, message: String) -> Result<(), AgentError> {
        self.state.validation_failures += 1;
        warn!(
            "Unusable {phase} response ({}/{}): {message}",
            self.state.validation_failures, self.config.max_validation_failures
        );
        self.state.record_error(format!("{phase}: {message}"));
        self.state.memory.append(
            Observation::text(phase, self.state.current_subgoal.clone(), message.clone())
                .with_metadata("validation_error", json!(true)),
        );
        if self.state.validation_failures > self.config.max_validation_failures {
            return Err(AgentError::Validation(format!(
                "{} unusable responses, last: {message}",
                self.state.validation_failures
            )));
        }
        Ok(())
    }

    fn save_checkpoint(&mut self) {
        if let Some(ref store) = self.store
            && let Err(e) = store.save(&self.state)
        {
            warn!("Checkpoint failed: {e}");
            self.state.record_error(format!("checkpoint failed: {e}"));
        }
    }

    // ── PLANNING ───────────────────────────────────────────────────

    async fn plan(&mut self) {
        let gateway = Arc::clone(&self.gateway);
        let catalog = self.tools.describe_for_llm();
        let outcome = gateway
            .plan(
                &self.state.task,
                &catalog,
                self.config.max_subgoals,
                &self.cancel,
            )
            .await;
        let completion = match outcome {
            Ok(c) => c,
            Err(e) => return self.fail(e.into()),
        };
        self.account(Phase::Planning, &completion.reply);

        let plan = match completion.parsed {
            Ok(plan) => plan,
            Err(message) => return self.fail(AgentError::InvalidPlan(message)),
        };
        if let Err(err) = validate_plan(&plan, self.config.max_subgoals) {
            return self.fail(err);
        }

        let ids = apply_plan(&mut self.state, plan);
        info!("Created plan with {} subgoals", ids.len());
        let listing = self.state.subgoal_report();
        self.state
            .memory
            .append(Observation::text(Phase::Planning, None, format!("Plan:\n{listing}")));
        self.advance(TransitionEvent::PlanReady);
    }

    // ── ACTING ─────────────────────────────────────────────────────

    async fn act(&mut self) {
        let Some(id) = next_ready(&self.state) else {
            return self.fail(AgentError::SubgoalsFailed("no runnable subgoal".into()));
        };
        self.state.mark_active(&id);
        self.state.iterations += 1;
        let iteration = self.state.iterations;
        let Some(subgoal) = self.state.subgoal(&id).cloned() else {
            return self.fail(AgentError::Validation(format!("unknown subgoal {id}")));
        };
        debug!(
            "Iteration {iteration}: {} (attempt {}) {}",
            subgoal.id, subgoal.attempts, subgoal.description
        );

        let gateway = Arc::clone(&self.gateway);
        let context = self.state.memory.to_context_string(self.config.context_window);
        let outcome = gateway
            .act(
                &self.state.task,
                &subgoal,
                &self.tools,
                &context,
                self.config.max_tool_calls_per_step,
                &self.cancel,
            )
            .await;
        let completion = match outcome {
            Ok(c) => c,
            Err(e) => return self.fail(e.into()),
        };
        self.account(Phase::Acting, &completion.reply);

        let (mut invocations, reasoning) = match completion.parsed {
            Ok(decision) => (decision.invocations, decision.reasoning),
            Err(message) => {
                if let Err(err) = self.validation_failure(Phase::Acting, message) {
                    return self.fail(err);
                }
                (Vec::new(), None)
            }
        };
        if invocations.len() > self.config.max_tool_calls_per_step {
            warn!(
                "Dropping {} tool calls beyond the per-step limit of {}",
                invocations.len() - self.config.max_tool_calls_per_step,
                self.config.max_tool_calls_per_step
            );
            invocations.truncate(self.config.max_tool_calls_per_step);
        }

        if let Some(event) = self.checkpoint(Phase::Observing) {
            return self.apply(event);
        }

        let results = match self.dispatch(&id, &invocations).await {
            Some(results) => results,
            None => return self.apply(TransitionEvent::Cancelled),
        };

        self.state.step_results.push(StepResult {
            iteration,
            subgoal_id: id,
            invocations,
            results,
            reasoning,
            timestamp: chrono::Utc::now(),
        });
        self.advance(TransitionEvent::BatchFinished);
        // Saved after the transition so a resume observes this batch
        // instead of running it again.
        if self.state.phase == Phase::Observing
            && self.config.state_save_interval > 0
            && iteration % self.config.state_save_interval == 0
        {
            self.save_checkpoint();
        }
    }

    /// Run one batch. `None` if cancelled mid-batch.
    async fn dispatch(
        &mut self,
        subgoal_id: &str,
        invocations: &[ToolInvocation],
    ) -> Option<Vec<ToolResult>> {
        for (index, inv) in invocations.iter().enumerate() {
            self.emit(
                UpdateKind::ToolStarted,
                format!("Using {}...", inv.tool),
                json!({
                    "tool": inv.tool,
                    "index": index,
                    "params": inv.params,
                    "subgoal_id": subgoal_id,
                }),
            );
        }

        let tools = Arc::clone(&self.tools);
        let batch = tools.execute_batch(
            invocations,
            self.config.max_parallel_tools,
            self.config.tool_timeout,
            &self.config.dangerous_policy,
        );
        let results = tokio::select! {
            _ = self.cancel.cancelled() => {
                info!("Tool batch abandoned: run cancelled");
                return None;
            }
            results = batch => results,
        };
        self.state.tool_calls += results.len() as u32;

        for (index, result) in results.iter().enumerate() {
            self.emit(
                UpdateKind::ToolFinished,
                result.brief(200),
                json!({
                    "tool": result.tool_name,
                    "index": index,
                    "success": result.success,
                    "elapsed_secs": result.elapsed_secs,
                    "error_kind": result.error_kind(),
                    "error": result.error_message(),
                    "output": result.output,
                }),
            );
        }

        let tool_cost: f64 = results.iter().map(|r| r.cost_usd).sum();
        if tool_cost > 0.0 {
            self.state.usage.record(
                "tools",
                &CompletionUsage {
                    input_tokens: 0,
                    output_tokens: 0,
                    cost_usd: tool_cost,
                },
            );
            self.emit_cost(Phase::Acting, tool_cost);
        }
        Some(results)
    }

    // ── OBSERVING ──────────────────────────────────────────────────

    fn observe(&mut self) {
        let Some(step) = self.state.step_results.last().cloned() else {
            return self.advance(TransitionEvent::ObservationsRecorded);
        };
        let id = step.subgoal_id.clone();

        if step.results.is_empty() {
            self.state.memory.append(Observation::text(
                Phase::Observing,
                Some(id.clone()),
                "No tool calls were made.",
            ));
        }
        for result in &step.results {
            self.state.memory.append(Observation::tool(
                Phase::Observing,
                Some(id.clone()),
                result.clone(),
            ));
        }

        let combined = step
            .results
            .iter()
            .map(|r| r.brief(200))
            .collect::<Vec<_>>()
            .join("\n");
        if step.succeeded() {
            self.state.mark_done(&id, Some(combined));
        } else if combined.is_empty() {
            self.state.mark_failed(&id, "no tool calls were made");
        } else {
            self.state.mark_failed(&id, combined);
        }
        self.advance(TransitionEvent::ObservationsRecorded);
    }

    // ── REFLECTING ─────────────────────────────────────────────────

    async fn reflect(&mut self) {
        let gateway = Arc::clone(&self.gateway);
        let context = self.state.memory.to_context_string(self.config.context_window);
        let outcome = gateway
            .reflect(
                &self.state,
                &context,
                self.config.allow_plan_augmentation,
                &self.cancel,
            )
            .await;
        let completion = match outcome {
            Ok(c) => c,
            Err(e) => return self.fail(e.into()),
        };
        self.account(Phase::Reflecting, &completion.reply);

        let reflection = match completion.parsed {
            Ok(r) => r,
            Err(message) => {
                if let Err(err) = self.validation_failure(Phase::Reflecting, message) {
                    return self.fail(err);
                }
                Reflection::default()
            }
        };
        if let Err(err) = self.apply_reflection(reflection) {
            return self.fail(err);
        }

        let blocked = fail_blocked(&mut self.state);
        if !blocked.is_empty() {
            info!("Subgoals blocked by failed dependencies: {}", blocked.join(", "));
        }

        if next_ready(&self.state).is_some() {
            return self.advance(TransitionEvent::ReflectContinue);
        }
        if !self.state.all_done() {
            let failed = self.state.failed_subgoals.join(", ");
            return self.fail(AgentError::SubgoalsFailed(format!(
                "subgoals failed: {failed}"
            )));
        }

        if let Some(event) = self.checkpoint(Phase::Completed) {
            return self.apply(event);
        }
        self.summarize().await;
        self.apply(TransitionEvent::ReflectComplete);
    }

    fn apply_reflection(&mut self, reflection: Reflection) -> Result<(), AgentError> {
        let current = self.state.current_subgoal.clone();
        debug!(
            "Reflection on {}: completed={}, next={:?}, {}",
            current.as_deref().unwrap_or("-"),
            reflection.subgoal_completed,
            reflection.next_action,
            reflection.reasoning
        );
        if !reflection.reasoning.is_empty() {
            self.state.memory.append(
                Observation::text(Phase::Reflecting, current.clone(), &reflection.reasoning)
                    .with_metadata("next_action", json!(reflection.next_action)),
            );
        }

        if let Some(ref id) = current {
            if reflection.subgoal_completed {
                self.state.mark_done(id, None);
            }
            let status = self.state.subgoal(id).map(|s| (s.status, s.attempts));
            match (reflection.next_action, status) {
                (NextAction::Abort, _) => {
                    return Err(AgentError::Aborted(if reflection.reasoning.is_empty() {
                        "reflection requested abort".into()
                    } else {
                        reflection.reasoning.clone()
                    }));
                }
                (_, Some((SubgoalStatus::Done, _))) | (NextAction::Continue, _) | (_, None) => {}
                (NextAction::Retry, Some((_, attempts))) => {
                    if attempts < self.config.max_subgoal_attempts {
                        info!("Retrying {id} (attempt {} next)", attempts + 1);
                        self.state.mark_pending(id);
                    } else {
                        self.state.mark_failed(
                            id,
                            format!("gave up after {attempts} attempt(s)"),
                        );
                    }
                }
                (NextAction::Skip, Some(_)) => {
                    self.state
                        .mark_failed(id, format!("skipped: {}", reflection.reasoning));
                }
            }
        } else if reflection.next_action == NextAction::Abort {
            return Err(AgentError::Aborted(reflection.reasoning));
        }

        if !reflection.new_subgoals.is_empty() {
            self.augment(reflection.new_subgoals);
        }
        Ok(())
    }

    fn augment(&mut self, additions: Vec<PlannedSubgoal>) {
        if !self.config.allow_plan_augmentation {
            debug!(
                "Ignoring {} proposed subgoals: plan augmentation disabled",
                additions.len()
            );
            return;
        }
        let existing: Vec<String> = self.state.subgoals.iter().map(|s| s.id.clone()).collect();
        match validate_additions(&existing, &additions, self.config.max_subgoals) {
            Ok(()) => {
                let ids = apply_plan(&mut self.state, additions);
                info!("Plan augmented with {}", ids.join(", "));
            }
            Err(err) => {
                warn!("Rejected plan augmentation: {err}");
                self.state.record_error(err.to_string());
            }
        }
    }

    async fn summarize(&mut self) {
        if !self.config.summarize_on_completion {
            self.state.final_output = Some(prompts::fallback_summary(&self.state));
            return;
        }
        let gateway = Arc::clone(&self.gateway);
        let outcome = gateway.summarize(&self.state, &self.cancel).await;
        let summary = match outcome {
            Ok(completion) => {
                self.account(Phase::Reflecting, &completion.reply);
                completion.parsed.unwrap_or_else(|e| {
                    debug!("Falling back to a generated summary: {e}");
                    prompts::fallback_summary(&self.state)
                })
            }
            Err(e) => {
                warn!("Summary request failed: {e}");
                prompts::fallback_summary(&self.state)
            }
        };
        self.state.final_output = Some(summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::budget::Budget;
    use crate::agent::events::FnObserver;
    use crate::api::retry::RetryConfig;
    use crate::api::scripted::ScriptedBackend;
    use crate::error::GatewayError;
    use crate::tools::{
        DangerousToolPolicy, Tool, ToolCategory, ToolErrorKind, ToolFuture, ToolMetadata,
    };
    use std::sync::Mutex;
    use std::time::Duration;

    const DONE: &str = r#"{"subgoal_completed": true, "next_action": "continue", "reasoning": "done"}"#;
    const RETRY: &str = r#"{"subgoal_completed": false, "next_action": "retry", "reasoning": "again"}"#;

    fn config() -> RuntimeConfig {
        RuntimeConfig::new("deepseek-chat").with_retry(RetryConfig::immediate(5))
    }

    fn runtime(
        backend: &Arc<ScriptedBackend>,
        tools: ToolRegistry,
        config: RuntimeConfig,
    ) -> Runtime {
        let gateway = CompletionGateway::new(backend.clone(), &config);
        Runtime::new(gateway, Arc::new(tools), config)
    }

    fn workspace_tools(dir: &std::path::Path) -> ToolRegistry {
        ToolRegistry::new().with_workspace_tools(dir).unwrap()
    }

    fn kinds(updates: &[AgentUpdate]) -> Vec<UpdateKind> {
        updates.iter().map(|u| u.kind).collect()
    }

    fn phases(updates: &[AgentUpdate]) -> Vec<String> {
        updates
            .iter()
            .filter(|u| u.kind == UpdateKind::PhaseChanged)
            .filter_map(|u| u.payload["to"].as_str().map(str::to_string))
            .collect()
    }

    struct Exploding;

    impl Tool for Exploding {
        fn metadata(&self) -> ToolMetadata {
            ToolMetadata::new("explode", "Always panics", ToolCategory::System)
        }

        fn execute(&self, args: serde_json::Value) -> ToolFuture<'_> {
            Box::pin(async move {
                if args.is_object() {
                    panic!("kaboom");
                }
                Ok(serde_json::Value::Null)
            })
        }
    }

    #[tokio::test]
    async fn scenario_a_single_subgoal_completes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            ScriptedBackend::new()
                .text(r#"[{"description": "write a.txt", "tools": ["write_file"]}]"#)
                .tool_calls(&[("write_file", json!({"path": "a.txt", "content": "hi"}))])
                .text(DONE)
                .text("Created a.txt containing 'hi'."),
        );
        let task = Task::new("create file a.txt with content 'hi'", dir.path().to_string_lossy());
        let (updates, state) = runtime(&backend, workspace_tools(dir.path()), config())
            .run(task)
            .collect()
            .await;

        assert_eq!(state.phase, Phase::Completed);
        assert_eq!(state.step_results.len(), 1);
        let results = &state.step_results[0].results;
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert!(state.usage.total_cost_usd > 0.0);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "hi");
        assert_eq!(
            phases(&updates),
            vec!["ACTING", "OBSERVING", "REFLECTING", "COMPLETED"]
        );
        let last = updates.last().unwrap();
        assert_eq!(last.kind, UpdateKind::Completed);
        assert_eq!(last.message, "Created a.txt containing 'hi'.");
        assert_eq!(state.final_output.as_deref(), Some("Created a.txt containing 'hi'."));
        state.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn scenario_b_unknown_tool_reaches_reflection() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            ScriptedBackend::new()
                .text(r#"[{"description": "remove old file"}]"#)
                .tool_calls(&[("delete_file", json!({"path": "old.txt"}))])
                .text(DONE)
                .text("nothing to delete"),
        );
        let tools = ToolRegistry::new();
        let (updates, state) = runtime(&backend, tools, config())
            .run(Task::new("delete old.txt", dir.path().to_string_lossy()))
            .collect()
            .await;

        let finished = updates
            .iter()
            .find(|u| u.kind == UpdateKind::ToolFinished)
            .unwrap();
        assert_eq!(finished.payload["success"], false);
        assert_eq!(finished.payload["error_kind"], "unknown_tool");
        assert!(phases(&updates).contains(&"REFLECTING".to_string()));
        assert_eq!(
            state.step_results[0].results[0].error_kind(),
            Some(ToolErrorKind::UnknownTool)
        );
        assert_eq!(state.phase, Phase::Completed);
    }

    #[tokio::test]
    async fn scenario_c_zero_cost_budget_stops_before_acting() {
        let backend = Arc::new(ScriptedBackend::new().text(r#"[{"description": "x"}]"#));
        let task = Task::new("anything", ".").with_budget(Budget::default().with_max_cost_usd(0.0));
        let (updates, state) = runtime(&backend, ToolRegistry::new(), config())
            .run(task)
            .collect()
            .await;

        assert_eq!(state.phase, Phase::BudgetExceeded);
        assert_eq!(backend.calls(), 0);
        assert!(!kinds(&updates).contains(&UpdateKind::ToolStarted));
        assert_eq!(phases(&updates), vec!["BUDGET_EXCEEDED"]);
        let last = updates.last().unwrap();
        assert_eq!(last.kind, UpdateKind::BudgetExceeded);
        assert!(last.message.contains("budget exceeded: cost"));
        assert_eq!(
            state.termination.as_ref().unwrap().error_kind.as_deref(),
            Some("budget_exceeded")
        );
    }

    #[tokio::test]
    async fn scenario_d_transient_errors_are_absorbed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            ScriptedBackend::new()
                .fail(GatewayError::Transient("API HTTP 503: overloaded".into()))
                .fail(GatewayError::Transient("API HTTP 503: overloaded".into()))
                .fail(GatewayError::Transient("API HTTP 503: overloaded".into()))
                .text(r#"[{"description": "list files"}]"#)
                .tool_calls(&[("list_directory", json!({}))])
                .text(DONE)
                .text("listed"),
        );
        let (_, state) = runtime(&backend, workspace_tools(dir.path()), config())
            .run(Task::new("list", "."))
            .collect()
            .await;
        assert_eq!(state.phase, Phase::Completed);
        assert_eq!(backend.calls(), 7);
        assert_eq!(state.llm_calls, 4);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_run() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .fail(GatewayError::Transient("HTTP 503".into()))
                .fail(GatewayError::Transient("HTTP 503".into())),
        );
        let cfg = config().with_retry(RetryConfig::immediate(1));
        let (updates, state) = runtime(&backend, ToolRegistry::new(), cfg)
            .run(Task::new("t", "."))
            .collect()
            .await;
        assert_eq!(state.phase, Phase::Failed);
        let last = updates.last().unwrap();
        assert_eq!(last.kind, UpdateKind::Error);
        assert_eq!(last.payload["error_kind"], "gateway_transient");
    }

    #[tokio::test]
    async fn malformed_plan_fails_with_structured_error() {
        let backend = Arc::new(ScriptedBackend::new().text("Sure! I will do it."));
        let (updates, state) = runtime(&backend, ToolRegistry::new(), config())
            .run(Task::new("t", "."))
            .collect()
            .await;
        assert_eq!(state.phase, Phase::Failed);
        assert_eq!(updates.last().unwrap().payload["error_kind"], "invalid_plan");
        assert_eq!(state.llm_calls, 1);

        let cyclic = Arc::new(ScriptedBackend::new().text(
            r#"[{"description": "a", "depends_on": [2]}, {"description": "b", "depends_on": [1]}]"#,
        ));
        let (_, state) = runtime(&cyclic, ToolRegistry::new(), config())
            .run(Task::new("t", "."))
            .collect()
            .await;
        assert_eq!(state.phase, Phase::Failed);
        assert!(state.termination.unwrap().reason.contains("cycle"));
    }

    #[tokio::test]
    async fn iteration_budget_bounds_act_batches() {
        for k in 1..=3u32 {
            let backend = Arc::new(ScriptedBackend::new().text(r#"[{"description": "loop"}]"#));
            for _ in 0..6 {
                backend.push(Ok(crate::CompletionResponse::tool_calls(
                    vec![crate::ToolCall::new("c", "read_file", r#"{"path": "missing.txt"}"#)],
                    crate::UsageInfo::new(10, 2),
                )));
                backend.push(Ok(crate::CompletionResponse::text(
                    RETRY,
                    crate::UsageInfo::new(10, 2),
                )));
            }
            let dir = tempfile::tempdir().unwrap();
            let cfg = RuntimeConfig {
                max_subgoal_attempts: 100,
                ..config()
            };
            let task = Task::new("spin", ".")
                .with_budget(Budget::default().with_max_iterations(k));
            let (updates, state) = runtime(&backend, workspace_tools(dir.path()), cfg)
                .run(task)
                .collect()
                .await;

            let batches = updates
                .iter()
                .filter(|u| u.kind == UpdateKind::PhaseChanged && u.payload["to"] == "ACTING")
                .count();
            assert!(batches as u32 <= k, "k={k}: {batches} batches");
            assert_eq!(state.iterations, k);
            assert_eq!(state.phase, Phase::BudgetExceeded);
            assert!(state.termination.unwrap().reason.contains("iterations"));
        }
    }

    #[tokio::test]
    async fn finishing_in_exactly_k_iterations_completes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            ScriptedBackend::new()
                .text(r#"[{"description": "only"}]"#)
                .tool_calls(&[("list_directory", json!({}))])
                .text(DONE)
                .text("ok"),
        );
        let task = Task::new("t", ".").with_budget(Budget::default().with_max_iterations(1));
        let (_, state) = runtime(&backend, workspace_tools(dir.path()), config())
            .run(task)
            .collect()
            .await;
        assert_eq!(state.phase, Phase::Completed);
    }

    #[tokio::test]
    async fn panicking_tool_is_isolated() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .text(r#"[{"description": "blow up"}]"#)
                .tool_calls(&[("explode", json!({}))])
                .text(r#"{"subgoal_completed": false, "next_action": "skip", "reasoning": "broken tool"}"#),
        );
        let tools = ToolRegistry::new().with(Exploding).unwrap();
        let (updates, state) = runtime(&backend, tools, config())
            .run(Task::new("t", "."))
            .collect()
            .await;

        assert!(phases(&updates).contains(&"OBSERVING".to_string()));
        let result = &state.step_results[0].results[0];
        assert!(!result.success);
        assert!(result.error_message().unwrap().contains("kaboom"));
        assert_eq!(state.phase, Phase::Failed);
        assert_eq!(state.failed_subgoals, vec!["subgoal_1"]);
        assert_eq!(updates.last().unwrap().payload["error_kind"], "subgoals_failed");
    }

    #[tokio::test]
    async fn retry_and_dependency_cascade() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            ScriptedBackend::new()
                .text(
                    r#"[{"description": "read input"}, {"description": "process", "depends_on": [1]}]"#,
                )
                .tool_calls(&[("read_file", json!({"path": "missing.txt"}))])
                .text(RETRY)
                .tool_calls(&[("read_file", json!({"path": "missing.txt"}))])
                .text(RETRY),
        );
        let (_, state) = runtime(&backend, workspace_tools(dir.path()), config())
            .run(Task::new("t", "."))
            .collect()
            .await;

        assert_eq!(state.iterations, 2);
        let first = state.subgoal("subgoal_1").unwrap();
        assert_eq!(first.attempts, 2);
        assert_eq!(first.status, SubgoalStatus::Failed);
        assert_eq!(
            state.subgoal("subgoal_2").unwrap().error.as_deref(),
            Some("dependency failed")
        );
        assert_eq!(state.phase, Phase::Failed);
        state.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn reflection_abort_fails_with_reasoning() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            ScriptedBackend::new()
                .text(r#"[{"description": "x"}]"#)
                .tool_calls(&[("list_directory", json!({}))])
                .text(r#"{"next_action": "abort", "reasoning": "task is impossible"}"#),
        );
        let (updates, state) = runtime(&backend, workspace_tools(dir.path()), config())
            .run(Task::new("t", "."))
            .collect()
            .await;
        assert_eq!(state.phase, Phase::Failed);
        assert!(updates.last().unwrap().message.contains("task is impossible"));
    }

    #[tokio::test]
    async fn unparseable_reflection_counts_and_escalates() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            ScriptedBackend::new()
                .text(r#"[{"description": "a"}, {"description": "b"}]"#)
                .tool_calls(&[("list_directory", json!({}))])
                .text("looks fine to me")
                .tool_calls(&[("list_directory", json!({}))])
                .text("still fine"),
        );
        let cfg = RuntimeConfig {
            max_validation_failures: 1,
            ..config()
        };
        let (updates, state) = runtime(&backend, workspace_tools(dir.path()), cfg)
            .run(Task::new("t", "."))
            .collect()
            .await;
        assert_eq!(state.validation_failures, 2);
        assert_eq!(state.subgoal("subgoal_1").unwrap().status, SubgoalStatus::Done);
        assert_eq!(updates.last().unwrap().payload["error_kind"], "validation");
    }

    #[tokio::test]
    async fn plan_augmentation_is_opt_in() {
        let proposal = r#"{"subgoal_completed": true, "next_action": "continue",
            "new_subgoals": [{"description": "verify", "depends_on": [1]}]}"#;
        let script = |backend: ScriptedBackend| {
            backend
                .text(r#"[{"description": "write"}]"#)
                .tool_calls(&[("list_directory", json!({}))])
                .text(proposal)
                .tool_calls(&[("list_directory", json!({}))])
                .text(DONE)
                .text("summary")
        };
        let dir = tempfile::tempdir().unwrap();

        let off = Arc::new(script(ScriptedBackend::new()));
        let (_, state) = runtime(&off, workspace_tools(dir.path()), config())
            .run(Task::new("t", "."))
            .collect()
            .await;
        assert_eq!(state.subgoals.len(), 1);
        assert_eq!(state.phase, Phase::Completed);

        let on = Arc::new(script(ScriptedBackend::new()));
        let (_, state) = runtime(
            &on,
            workspace_tools(dir.path()),
            config().with_plan_augmentation(true),
        )
        .run(Task::new("t", "."))
        .collect()
        .await;
        assert_eq!(state.subgoals.len(), 2);
        assert_eq!(state.iterations, 2);
        assert_eq!(state.phase, Phase::Completed);
    }

    #[tokio::test]
    async fn dangerous_tools_respect_policy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.txt"), "x").unwrap();
        let backend = Arc::new(
            ScriptedBackend::new()
                .text(r#"[{"description": "delete"}]"#)
                .tool_calls(&[("delete_file", json!({"path": "old.txt"}))])
                .text(DONE)
                .text("done"),
        );
        let cfg = config().with_dangerous_policy(DangerousToolPolicy::deny_all());
        let (_, state) = runtime(&backend, workspace_tools(dir.path()), cfg)
            .run(Task::new("t", "."))
            .collect()
            .await;
        assert_eq!(
            state.step_results[0].results[0].error_kind(),
            Some(ToolErrorKind::PermissionDenied)
        );
        assert!(dir.path().join("old.txt").exists());
    }

    #[tokio::test]
    async fn registry_policy_is_not_widened_by_runtime_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.txt"), "x").unwrap();
        let backend = Arc::new(
            ScriptedBackend::new()
                .text(r#"[{"description": "delete"}]"#)
                .tool_calls(&[("delete_file", json!({"path": "old.txt"}))])
                .text(DONE)
                .text("done"),
        );
        let tools = workspace_tools(dir.path()).with_policy(DangerousToolPolicy::deny_all());
        let cfg = config().with_dangerous_policy(DangerousToolPolicy::Allow);
        let (_, state) = runtime(&backend, tools, cfg)
            .run(Task::new("t", "."))
            .collect()
            .await;
        assert_eq!(
            state.step_results[0].results[0].error_kind(),
            Some(ToolErrorKind::PermissionDenied)
        );
        assert!(dir.path().join("old.txt").exists());
    }

    #[tokio::test]
    async fn cancellation_ends_in_failed_cancelled() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .text(r#"[{"description": "x"}]"#)
                .with_latency(Duration::from_secs(30)),
        );
        let rt = runtime(&backend, ToolRegistry::new(), config());
        let token = rt.cancellation_token();
        let run = rt.run(Task::new("t", "."));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let (updates, state) = run.collect().await;

        assert_eq!(state.phase, Phase::Failed);
        let last = updates.last().unwrap();
        assert_eq!(last.kind, UpdateKind::Cancelled);
        assert_eq!(
            state.termination.unwrap().error_kind.as_deref(),
            Some("cancelled")
        );
    }

    #[tokio::test]
    async fn updates_are_causal_and_costs_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            ScriptedBackend::new()
                .text(r#"[{"description": "a"}, {"description": "b", "depends_on": [1]}]"#)
                .tool_calls(&[
                    ("write_file", json!({"path": "1.txt", "content": "1"})),
                    ("write_file", json!({"path": "2.txt", "content": "2"})),
                    ("read_file", json!({"path": "nope.txt"})),
                ])
                .text(DONE)
                .tool_calls(&[("list_directory", json!({}))])
                .text(DONE)
                .text("summary"),
        );
        let seen = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&seen);
        let (updates, state) = runtime(&backend, workspace_tools(dir.path()), config())
            .with_observer(FnObserver::new(move |_: &AgentUpdate| {
                if let Ok(mut n) = counter.lock() {
                    *n += 1;
                }
            }))
            .run(Task::new("t", "."))
            .collect()
            .await;

        assert_eq!(*seen.lock().unwrap(), updates.len());
        assert_eq!(state.phase, Phase::Completed);

        let costs: Vec<f64> = updates
            .iter()
            .filter(|u| u.kind == UpdateKind::CostUpdate)
            .filter_map(|u| u.payload["total_cost_usd"].as_f64())
            .collect();
        assert!(costs.windows(2).all(|w| w[1] >= w[0]));
        let tokens: Vec<u64> = updates
            .iter()
            .filter(|u| u.kind == UpdateKind::CostUpdate)
            .filter_map(|u| u.payload["total_tokens"].as_u64())
            .collect();
        assert!(tokens.windows(2).all(|w| w[1] >= w[0]));

        // Finished events follow request order.
        let finished: Vec<u64> = updates
            .iter()
            .filter(|u| u.kind == UpdateKind::ToolFinished)
            .filter_map(|u| u.payload["index"].as_u64())
            .collect();
        assert_eq!(finished, vec![0, 1, 2, 0]);
        assert_eq!(state.step_results[0].results[2].tool_name, "read_file");

        // Exactly one terminal update, and it is last.
        assert_eq!(updates.iter().filter(|u| u.is_final()).count(), 1);
        assert!(updates.last().unwrap().is_final());
        state.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn streaming_forwards_text_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            ScriptedBackend::new()
                .text(r#"[{"description": "a"}]"#)
                .tool_calls(&[("list_directory", json!({}))])
                .text(DONE)
                .text("all good"),
        );
        let (updates, _) = runtime(
            &backend,
            workspace_tools(dir.path()),
            config().with_streaming(true),
        )
        .run(Task::new("t", "."))
        .collect()
        .await;
        let texts: Vec<&str> = updates
            .iter()
            .filter(|u| u.kind == UpdateKind::Text)
            .map(|u| u.message.as_str())
            .collect();
        assert_eq!(texts.first(), Some(&r#"[{"description": "a"}]"#));
        assert_eq!(texts.last(), Some(&"all good"));
    }

    #[tokio::test]
    async fn store_checkpoints_and_resume_continues() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(store_dir.path()).unwrap();

        // A run interrupted mid-ACT: one subgoal done, the second active.
        let mut state = AgentState::new(Task::new("t", ".").with_id("task_resume"), 5);
        state.add_subgoal("first", vec![], vec![]);
        state.add_subgoal("second", vec!["subgoal_1".into()], vec![]);
        state.mark_active("subgoal_1");
        state.mark_done("subgoal_1", Some("ok".into()));
        state.mark_active("subgoal_2");
        state.phase = Phase::Acting;
        state.iterations = 1;
        state.elapsed_secs = 12.5;
        store.save(&state).unwrap();

        let snapshot = store.load("task_resume").unwrap().unwrap();
        let backend = Arc::new(
            ScriptedBackend::new()
                .tool_calls(&[("list_directory", json!({}))])
                .text(DONE)
                .text("resumed and finished"),
        );
        let (updates, finished) = runtime(&backend, workspace_tools(dir.path()), config())
            .with_store(store.clone())
            .resume(snapshot.state)
            .collect()
            .await;

        assert_eq!(updates[0].payload["event"], "resumed");
        assert_eq!(finished.phase, Phase::Completed);
        assert_eq!(finished.subgoal("subgoal_2").unwrap().attempts, 2);
        assert_eq!(finished.iterations, 2);
        assert!(finished.elapsed_secs >= 12.5);

        let saved = store.load("task_resume").unwrap().unwrap();
        assert_eq!(saved.state, finished);

        // A terminal snapshot only replays its final update.
        let replay_backend = Arc::new(ScriptedBackend::new());
        let (replay, _) = runtime(&replay_backend, ToolRegistry::new(), config())
            .resume(saved.state)
            .collect()
            .await;
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].kind, UpdateKind::Completed);
        assert_eq!(replay_backend.calls(), 0);
    }

    #[tokio::test]
    async fn resume_after_crash_does_not_rerun_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(store_dir.path()).unwrap();
        let backend = Arc::new(
            ScriptedBackend::new()
                .text(r#"[{"description": "append x"}]"#)
                .tool_calls(&[(
                    "write_file",
                    json!({"path": "log.txt", "content": "x", "append": true}),
                )]),
        );
        let cfg = RuntimeConfig {
            state_save_interval: 1,
            ..config()
        };

        // Stop pulling right after the batch finishes, as if the process died.
        let mut run = runtime(&backend, workspace_tools(dir.path()), cfg.clone())
            .with_store(store.clone())
            .run(Task::new("t", ".").with_id("task_crash"));
        while let Some(update) = run.next_update().await {
            if update.kind == UpdateKind::ToolFinished {
                break;
            }
        }
        drop(run);

        let saved = store.load("task_crash").unwrap().unwrap();
        assert_eq!(saved.state.phase, Phase::Observing);
        assert_eq!(saved.state.step_results.len(), 1);

        let resumed = Arc::new(ScriptedBackend::new().text(DONE).text("appended"));
        let (updates, state) = runtime(&resumed, workspace_tools(dir.path()), cfg)
            .with_store(store.clone())
            .resume(saved.state)
            .collect()
            .await;

        assert!(!kinds(&updates).contains(&UpdateKind::ToolStarted));
        assert_eq!(state.phase, Phase::Completed);
        assert_eq!(state.iterations, 1);
        assert_eq!(state.step_results.len(), 1);
        assert_eq!(state.subgoal("subgoal_1").unwrap().status, SubgoalStatus::Done);
        assert_eq!(std::fs::read_to_string(dir.path().join("log.txt")).unwrap(), "x");
        state.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn resume_observes_batch_saved_mid_act() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = AgentState::new(Task::new("t", "."), 5);
        state.add_subgoal("only", vec![], vec![]);
        state.mark_active("subgoal_1");
        state.iterations = 1;
        state.phase = Phase::Acting;
        state.step_results.push(StepResult {
            iteration: 1,
            subgoal_id: "subgoal_1".into(),
            invocations: vec![ToolInvocation::new("list_directory", json!({}))],
            results: vec![ToolResult::ok("list_directory", json!([]), 0.01)],
            reasoning: None,
            timestamp: chrono::Utc::now(),
        });

        let backend = Arc::new(ScriptedBackend::new().text(DONE).text("done"));
        let (updates, finished) = runtime(&backend, workspace_tools(dir.path()), config())
            .resume(state)
            .collect()
            .await;
        assert_eq!(updates[0].payload["to"], "OBSERVING");
        assert_eq!(finished.phase, Phase::Completed);
        assert_eq!(finished.iterations, 1);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn failures_write_debug_snapshots() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(store_dir.path()).unwrap();
        let backend = Arc::new(
            ScriptedBackend::new().fail(GatewayError::Permanent("API HTTP 401: bad key".into())),
        );
        let (_, state) = runtime(&backend, ToolRegistry::new(), config())
            .with_store(store)
            .run(Task::new("t", ".").with_id("task_dbg"))
            .collect()
            .await;
        assert_eq!(state.phase, Phase::Failed);
        let files: Vec<String> = std::fs::read_dir(store_dir.path().join("task_dbg"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(files.contains(&"state.json".to_string()));
        assert!(files.iter().any(|f| f.starts_with("debug-")));
    }

    #[tokio::test]
    async fn stream_adapter_yields_same_sequence() {
        use futures::StreamExt;
        let backend = Arc::new(ScriptedBackend::new().text("not a plan"));
        let updates: Vec<AgentUpdate> = runtime(&backend, ToolRegistry::new(), config())
            .run(Task::new("t", "."))
            .into_stream()
            .collect()
            .await;
        assert_eq!(
            kinds(&updates),
            vec![UpdateKind::CostUpdate, UpdateKind::PhaseChanged, UpdateKind::Error]
        );
    }
}
