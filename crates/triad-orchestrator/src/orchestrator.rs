//! The plan, execute, verify and replan pipeline
//!
//! A run plans a TODO list for the user's request, then walks it item by
//! item. Every attempt is executed and then judged by the verifier; a failed
//! judgment either retries the item with backoff or asks the replanner for a
//! [`PlanningDecision`]. Events stream back to the caller as they happen.
//!
//! With mode selection enabled, a request first goes to a classifier. Chat
//! requests are answered directly and never reach the planner.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use triad_agent::CircuitBreaker;
use triad_core::config::SessionConfig;
use triad_core::fail_open::fail_open_or;
use triad_core::{
    ItemStatus, NextAction, Result, TodoList, TodoSummary, TriadConfig, TriadError,
};

use crate::decision::PlanningDecision;
use crate::events::StageEvent;
use crate::roles::{
    ChatResponder, ItemExecutor, ItemVerifier, Mode, ModeSelection, ModeSelector, ReplanContext,
    Replanner, TodoPlanner,
};
use crate::session::{Session, SessionRegistry, Turn};
use crate::state_machine::{transition, Stage, StageAction};

/// How a run ended, short of an infrastructure failure
enum RunOutcome {
    Complete(TodoSummary),
    Aborted(String),
    /// Answered in chat mode
    Replied(String),
}

/// Classifier and responder for chat-mode requests
struct ChatRoute {
    selector: Arc<dyn ModeSelector>,
    responder: Arc<dyn ChatResponder>,
}

/// Where to continue after an item settled
enum ItemStep {
    Next(usize),
    Abort(String),
}

/// Sends events and tracks the stage they lead to
struct Emitter {
    session_id: String,
    tx: mpsc::UnboundedSender<StageEvent>,
    stage: Stage,
}

impl Emitter {
    fn new(session_id: String, tx: mpsc::UnboundedSender<StageEvent>) -> Self {
        Self {
            session_id,
            tx,
            stage: Stage::Idle,
        }
    }

    fn emit(&mut self, event: StageEvent) {
        let stage = std::mem::replace(&mut self.stage, Stage::Idle);
        let (next, actions) = transition(stage, &event);
        for action in actions {
            match action {
                StageAction::LogActivity { message } => {
                    debug!(session_id = %self.session_id, "{}", message)
                }
                other => debug!(session_id = %self.session_id, action = ?other, "Stage action"),
            }
        }
        if let Stage::Failed { error } = &next {
            warn!(session_id = %self.session_id, "Stage machine rejected event: {}", error);
        }
        self.stage = next;

        // A closed receiver means the caller stopped listening; the run still finishes.
        let _ = self.tx.send(event);
    }
}

/// Aborts the run task when the event stream is dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Drives TODO lists through plan, execute, verify and replan
pub struct Orchestrator {
    planner: Arc<dyn TodoPlanner>,
    executor: Arc<dyn ItemExecutor>,
    verifier: Arc<dyn ItemVerifier>,
    replanner: Arc<dyn Replanner>,
    chat: Option<ChatRoute>,
    breaker: Arc<CircuitBreaker>,
    sessions: SessionRegistry,
    config: SessionConfig,
}

impl Orchestrator {
    pub fn new(
        planner: Arc<dyn TodoPlanner>,
        executor: Arc<dyn ItemExecutor>,
        verifier: Arc<dyn ItemVerifier>,
        replanner: Arc<dyn Replanner>,
        config: &TriadConfig,
    ) -> Self {
        Self {
            planner,
            executor,
            verifier,
            replanner,
            chat: None,
            breaker: Arc::new(CircuitBreaker::new(
                "pipeline",
                config.pipeline_breaker.clone(),
            )),
            sessions: SessionRegistry::new(
                config.session.history_limit,
                Duration::from_secs(config.session.session_ttl_secs),
            ),
            config: config.session.clone(),
        }
    }

    /// Classify each request first and answer chat requests directly
    pub fn with_mode_selection(
        mut self,
        selector: Arc<dyn ModeSelector>,
        responder: Arc<dyn ChatResponder>,
    ) -> Self {
        self.chat = Some(ChatRoute {
            selector,
            responder,
        });
        self
    }

    /// Share a breaker with other orchestrators
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Start a run and stream its events
    ///
    /// The stream always ends with exactly one `WorkflowComplete` or
    /// `WorkflowAborted`. Dropping it cancels the run.
    pub fn orchestrate(
        self: &Arc<Self>,
        input: impl Into<String>,
        session_id: impl Into<String>,
    ) -> impl Stream<Item = StageEvent> + Send + 'static {
        let input = input.into();
        let session_id = session_id.into();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            this.run(input, Emitter::new(session_id, tx)).await;
        });
        let guard = AbortOnDrop(task);

        async_stream::stream! {
            let _guard = guard;
            while let Some(event) = rx.recv().await {
                yield event;
            }
        }
    }

    /// Collect every event of a run
    pub async fn run_to_end(
        self: &Arc<Self>,
        input: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Vec<StageEvent> {
        use futures::StreamExt;
        self.orchestrate(input, session_id).collect().await
    }

    #[instrument(skip(self, input, emit), fields(session_id = %emit.session_id))]
    async fn run(&self, input: String, mut emit: Emitter) {
        let pruned = self.sessions.prune_expired();
        if pruned > 0 {
            debug!("Pruned {} idle sessions", pruned);
        }

        let session_id = emit.session_id.clone();
        let Ok(mut session) = self.sessions.get_or_create(&session_id).try_lock_owned() else {
            warn!("Session {} is busy, rejecting run", session_id);
            emit.emit(StageEvent::WorkflowAborted {
                reason: TriadError::SessionBusy(session_id).to_string(),
            });
            return;
        };
        session.generation += 1;
        session.touch();
        info!("Run {} started: {}", session.generation, input);

        let outcome = {
            let current: &mut Session = &mut session;
            let events = &mut emit;
            let request = input.as_str();
            self.breaker
                .execute(move || self.run_pipeline(current, request, events))
                .await
        };

        let terminal = match outcome {
            Ok(RunOutcome::Complete(summary)) => {
                info!(
                    "Run finished: {}/{} items completed",
                    summary.completed, summary.total
                );
                session.push(
                    "assistant",
                    &format!(
                        "Completed {} of {} items ({} failed, {} skipped)",
                        summary.completed, summary.total, summary.failed, summary.skipped
                    ),
                );
                StageEvent::WorkflowComplete { summary }
            }
            Ok(RunOutcome::Aborted(reason)) => {
                info!("Run aborted: {}", reason);
                session.push("assistant", &format!("Aborted: {}", reason));
                StageEvent::WorkflowAborted { reason }
            }
            Ok(RunOutcome::Replied(reply)) => {
                info!("Chat reply sent ({} chars)", reply.len());
                session.push("assistant", &reply);
                StageEvent::WorkflowComplete {
                    summary: TodoSummary::default(),
                }
            }
            Err(e) => {
                warn!("Run failed: {}", e);
                let reason = e.to_string();
                if let Some(list) = session.todo.as_mut() {
                    if !list.is_aborted() {
                        list.abort(reason.clone());
                    }
                }
                StageEvent::WorkflowAborted { reason }
            }
        };
        session.touch();
        emit.emit(terminal);
    }

    async fn run_pipeline(
        &self,
        session: &mut Session,
        input: &str,
        emit: &mut Emitter,
    ) -> Result<RunOutcome> {
        let history: Vec<Turn> = session.history().cloned().collect();

        if let Some(route) = &self.chat {
            let selection = fail_open_or(
                "mode_selection",
                ModeSelection::fallback("mode selection unavailable"),
                || route.selector.select_mode(input, &history),
            )
            .await;
            info!(
                "Mode {} at {:.2} confidence",
                selection.mode, selection.confidence
            );
            emit.emit(StageEvent::ModeSelected {
                mode: selection.mode,
                confidence: selection.confidence,
                reasoning: selection.reasoning,
            });

            if selection.mode == Mode::Chat {
                session.push("user", input);
                let reply = route.responder.respond(input, &history).await?;
                emit.emit(StageEvent::ChatReplied {
                    content: reply.clone(),
                });
                return Ok(RunOutcome::Replied(reply));
            }
        }

        emit.emit(StageEvent::PlanningStarted {
            session_id: session.id.clone(),
            request: input.to_string(),
        });

        session.push("user", input);
        session.todo = None;

        let planned = self.planner.plan(input, &history).await?;
        info!("Planned {} items", planned.len());
        emit.emit(StageEvent::TodoCreated {
            list_id: planned.id.clone(),
            items: planned.items.clone(),
        });
        let list = session.todo.insert(planned);

        let mut index = 0;
        while let Some(next) = list.next_pending(index) {
            match self.run_item(list, next, emit).await? {
                ItemStep::Next(resume) => index = resume,
                ItemStep::Abort(reason) => {
                    list.abort(reason.clone());
                    return Ok(RunOutcome::Aborted(reason));
                }
            }
        }

        Ok(RunOutcome::Complete(list.summary()))
    }

    /// Drive one item until it completes, is skipped or replaced, or aborts the list
    async fn run_item(
        &self,
        list: &mut TodoList,
        index: usize,
        emit: &mut Emitter,
    ) -> Result<ItemStep> {
        loop {
            let item = &mut list.items[index];
            item.attempt += 1;
            item.status = ItemStatus::Executing;
            let snapshot = item.clone();
            emit.emit(StageEvent::ItemStarted {
                item_id: snapshot.id.clone(),
                action: snapshot.action.clone(),
                attempt: snapshot.attempt,
            });

            let execution = self.executor.execute(&snapshot).await?;
            debug!("Item {} executed: {}", snapshot.id, execution.summary);
            emit.emit(StageEvent::ItemExecuted {
                result: execution.clone(),
            });

            list.items[index].status = ItemStatus::Verifying;
            let verification = self.verifier.verify(&snapshot, &execution).await;
            emit.emit(StageEvent::ItemVerified {
                result: verification.clone(),
            });

            if verification.verified {
                let item = &mut list.items[index];
                item.status = ItemStatus::Completed;
                item.last_failure = None;
                info!(
                    "Item {} verified at {}% confidence",
                    snapshot.id, verification.confidence
                );
                return Ok(ItemStep::Next(index + 1));
            }

            list.items[index].last_failure = Some(verification.reason.clone());
            let attempts_left = snapshot.attempt < snapshot.max_attempts;

            if verification.next_action == NextAction::Retry && attempts_left {
                self.schedule_retry(list, index, emit).await;
                continue;
            }

            let context = ReplanContext::new(
                list,
                &list.items[index],
                Some(&execution),
                &verification,
            );
            let decision = match self.replanner.decide(&context).await {
                Ok(decision) => decision,
                Err(e) => {
                    warn!("Replanner failed for item {}, skipping it: {}", snapshot.id, e);
                    PlanningDecision::Skip {
                        continue_from: None,
                    }
                }
            };
            info!("Item {} decision: {}", snapshot.id, decision.strategy());
            emit.emit(StageEvent::ItemAdjusted {
                item_id: snapshot.id.clone(),
                strategy: decision.strategy().to_string(),
            });

            match decision {
                PlanningDecision::Continue if attempts_left => {
                    self.schedule_retry(list, index, emit).await;
                }
                PlanningDecision::Continue => {
                    let exhausted = TriadError::MaxAttemptsExceeded {
                        item_id: snapshot.id.clone(),
                        max_attempts: snapshot.max_attempts,
                    };
                    let reason = format!("{}: {}", exhausted, verification.reason);
                    return Ok(self.skip_item(list, index, None, reason, emit));
                }
                PlanningDecision::Replan { items } => {
                    match list.splice_after(&snapshot.id, items) {
                        Ok(inserted) => {
                            list.items[index].status = ItemStatus::Failed;
                            self.verifier.forget(&snapshot.id);
                            emit.emit(StageEvent::Replanned {
                                after_item_id: snapshot.id.clone(),
                                inserted,
                            });
                            return Ok(ItemStep::Next(index + 1));
                        }
                        Err(e) => {
                            warn!("Could not splice replanned items: {}", e);
                            return Ok(self.skip_item(
                                list,
                                index,
                                None,
                                verification.reason.clone(),
                                emit,
                            ));
                        }
                    }
                }
                PlanningDecision::Skip { continue_from } => {
                    return Ok(self.skip_item(
                        list,
                        index,
                        continue_from,
                        verification.reason.clone(),
                        emit,
                    ));
                }
                PlanningDecision::Abort { reason } => {
                    list.items[index].status = ItemStatus::Failed;
                    self.verifier.forget(&snapshot.id);
                    emit.emit(StageEvent::ItemFailed {
                        item_id: snapshot.id.clone(),
                        reason: reason.clone(),
                    });
                    return Ok(ItemStep::Abort(reason));
                }
            }
        }
    }

    async fn schedule_retry(&self, list: &mut TodoList, index: usize, emit: &mut Emitter) {
        let item = &mut list.items[index];
        item.status = ItemStatus::Pending;
        let next_attempt = item.attempt + 1;
        let delay = self.backoff(next_attempt);
        info!(
            "Retrying item {} (attempt {}) in {}ms",
            item.id,
            next_attempt,
            delay.as_millis()
        );
        emit.emit(StageEvent::ItemRetry {
            item_id: item.id.clone(),
            attempt: next_attempt,
            delay_ms: delay.as_millis() as u64,
        });
        tokio::time::sleep(delay).await;
    }

    fn skip_item(
        &self,
        list: &mut TodoList,
        index: usize,
        continue_from: Option<String>,
        reason: String,
        emit: &mut Emitter,
    ) -> ItemStep {
        let item_id = list.items[index].id.clone();
        if let Err(e) = list.skip(&item_id) {
            warn!("Could not skip item {}: {}", item_id, e);
        }
        self.verifier.forget(&item_id);
        emit.emit(StageEvent::ItemSkipped { item_id, reason });

        let resume = match continue_from {
            Some(id) => match list.position(&id) {
                Some(position) => position,
                None => {
                    warn!("Unknown continue_from item {}, resuming after skip", id);
                    index + 1
                }
            },
            None => index + 1,
        };
        ItemStep::Next(resume)
    }

    /// Delay before `attempt`: base * 2^(attempt - 2), capped
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(2).min(32);
        let delay = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.backoff_max_ms);
        Duration::from_millis(delay)
    }
}
