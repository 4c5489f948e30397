use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use payflux_core::config::EngineConfig;
use payflux_core::error::{FlowError, Result};
use payflux_core::event::{EngineEvent, EventBus};
use payflux_core::flow::{FlowEvent, FlowRecord, FlowStatus};
use payflux_core::step::{select_branch, Step, StepResult, StepStatus};
use payflux_core::traits::FlowStore;

use crate::executor::{StepContext, StepExecutor, StepOutput};
use crate::registry::RuntimeRegistry;

/// Drives flows from Queued to a terminal status.
///
/// Each active flow is owned by exactly one run loop. A loop iteration
/// has three phases: plan (under the flow lock: pick eligible steps,
/// mark them Running, persist), execute (outside the lock: run the
/// handlers), and commit (under the lock again: merge results,
/// persist once, decide what happens next). Pause and cancel are only
/// observed between iterations, so steps never stop mid-flight.
pub struct FlowRuntime {
    store: Arc<dyn FlowStore>,
    executor: Arc<StepExecutor>,
    registry: Arc<RuntimeRegistry>,
    bus: Arc<EventBus>,
    config: EngineConfig,
}

/// What the commit phase decided the loop should do next.
enum NextAction {
    Continue,
    Backoff(Duration),
    Halt,
}

impl FlowRuntime {
    pub fn new(
        store: Arc<dyn FlowStore>,
        executor: Arc<StepExecutor>,
        registry: Arc<RuntimeRegistry>,
        bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            executor,
            registry,
            bus,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Persist a new flow and start driving it.
    pub async fn submit(self: &Arc<Self>, flow: FlowRecord) -> Result<String> {
        let flow_id = flow.flow_id.clone();
        self.store.save(&flow).await?;
        info!(flow_id = %flow_id, flow_type = %flow.flow_type, "Flow submitted");
        self.bus
            .publish(EngineEvent::flow_status_changed(flow.summary()));
        self.spawn(flow_id.clone());
        Ok(flow_id)
    }

    /// Start a run loop for a flow unless one already owns it.
    pub fn spawn(self: &Arc<Self>, flow_id: String) {
        if !self.registry.activate(&flow_id) {
            return;
        }
        let runtime = self.clone();
        tokio::spawn(async move {
            runtime.run_loop(&flow_id).await;
        });
    }

    async fn run_loop(self: &Arc<Self>, flow_id: &str) {
        let shutdown = self.registry.shutdown_token();
        loop {
            if shutdown.is_cancelled() {
                info!(flow_id = %flow_id, "Run loop stopping for shutdown");
                break;
            }

            let planned = match self.plan(flow_id).await {
                Ok(Some(steps)) => steps,
                Ok(None) => break,
                Err(e) => {
                    error!(flow_id = %flow_id, error = %e, "Run loop aborting");
                    self.bus.publish(EngineEvent::FlowError {
                        flow_id: flow_id.to_string(),
                        error: e.to_string(),
                        timestamp: Utc::now(),
                    });
                    break;
                }
            };

            let results = self.execute(flow_id, &planned).await;

            match self.commit(flow_id, planned, results).await {
                Ok(NextAction::Continue) => {}
                Ok(NextAction::Backoff(delay)) => tokio::time::sleep(delay).await,
                Ok(NextAction::Halt) => break,
                Err(e) => {
                    error!(flow_id = %flow_id, error = %e, "Commit failed");
                    self.bus.publish(EngineEvent::FlowError {
                        flow_id: flow_id.to_string(),
                        error: e.to_string(),
                        timestamp: Utc::now(),
                    });
                    break;
                }
            }
        }

        self.registry.release(flow_id);

        // A resume may have arrived while this loop was halting. The
        // resume's spawn would have lost the activation race, so check
        // the store and restart if the flow is Running with no owner.
        if !shutdown.is_cancelled() {
            if let Ok(Some(flow)) = self.store.load(flow_id).await {
                if flow.status == FlowStatus::Running && !self.registry.is_active(flow_id) {
                    self.spawn(flow_id.to_string());
                }
            }
        }
    }

    /// Pick the next eligible step(s), mark them Running, and persist
    /// before anything executes. Returns None when the loop should
    /// halt (flow paused, terminal, failed, or complete).
    async fn plan(&self, flow_id: &str) -> Result<Option<Vec<Step>>> {
        let lock = self.registry.lock_for(flow_id);
        let _guard = lock.lock().await;

        let mut flow = self
            .store
            .load(flow_id)
            .await?
            .ok_or_else(|| FlowError::FlowNotFound(flow_id.to_string()))?;

        match flow.status {
            FlowStatus::Queued => {
                flow.transition_to(FlowStatus::Running)?;
                flow.record_event(FlowEvent::new("flow_started", "Flow execution started"));
                self.store.save(&flow).await?;
                self.bus
                    .publish(EngineEvent::flow_status_changed(flow.summary()));
            }
            FlowStatus::Running => {}
            // Paused, Failed, and terminal flows have no loop to run;
            // resume/retry restart one explicitly.
            _ => return Ok(None),
        }

        if flow.all_steps_succeeded() {
            self.complete(&mut flow).await?;
            return Ok(None);
        }

        let eligible: Vec<usize> = flow
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == StepStatus::Pending && s.is_eligible(&flow.steps, &flow.data))
            .map(|(i, _)| i)
            .collect();

        if eligible.is_empty() {
            let detail = flow
                .steps
                .iter()
                .find(|s| s.status == StepStatus::Pending)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| "unknown".to_string());
            self.fail(
                &mut flow,
                &format!("No eligible step; {detail} is blocked on an unsatisfiable dependency"),
            )
            .await?;
            return Ok(None);
        }

        // A leading parallel step pulls in every other eligible
        // parallel step; otherwise steps run one at a time.
        let chosen: Vec<usize> = if flow.steps[eligible[0]].parallel {
            eligible
                .into_iter()
                .filter(|&i| flow.steps[i].parallel)
                .collect()
        } else {
            vec![eligible[0]]
        };

        let mut planned = Vec::with_capacity(chosen.len());
        for idx in chosen {
            let attempts = flow.steps[idx].attempts + 1;
            let name = flow.steps[idx].name.clone();
            flow.steps[idx].status = StepStatus::Running;
            flow.steps[idx].attempts = attempts;

            if flow.steps[idx].idempotent {
                // The key survives crashes and retries, so the external
                // call it guards happens at most once.
                flow.data
                    .entry(format!("_idem.{name}"))
                    .or_insert_with(|| serde_json::json!(Uuid::new_v4().to_string()));
            } else {
                // Marker for crash recovery: this step may have started
                // a side effect it cannot safely repeat.
                flow.data
                    .insert(format!("_started.{name}"), serde_json::json!(attempts));
            }

            flow.record_event(
                FlowEvent::new("step_started", format!("Step {name} started"))
                    .with_payload(serde_json::json!({ "step": name, "attempt": attempts })),
            );
            planned.push(flow.steps[idx].clone());
        }
        flow.current_step_index = flow
            .steps
            .iter()
            .position(|s| s.status == StepStatus::Running)
            .unwrap_or(flow.current_step_index);
        flow.current_step_name = flow.steps.get(flow.current_step_index).map(|s| s.name.clone());

        // Persist before any handler runs: a crash after this point
        // finds the Running markers and the idempotency keys.
        self.store.save(&flow).await?;

        for step in &planned {
            self.publish_step(&flow, step, StepStatus::Running, None);
        }

        Ok(Some(planned))
    }

    /// Run the planned attempts outside the flow lock.
    async fn execute(&self, flow_id: &str, planned: &[Step]) -> Vec<Result<StepOutput>> {
        // Snapshot taken without the lock; the store record cannot
        // move while this loop owns the flow and holds Running steps.
        let flow = match self.store.load(flow_id).await {
            Ok(Some(flow)) => flow,
            Ok(None) => {
                return planned
                    .iter()
                    .map(|_| Err(FlowError::FlowNotFound(flow_id.to_string())))
                    .collect()
            }
            Err(e) => {
                return planned
                    .iter()
                    .map(|s| {
                        Err(FlowError::StepFailed {
                            step: s.name.clone(),
                            message: e.to_string(),
                        })
                    })
                    .collect()
            }
        };

        let futures: Vec<_> = planned
            .iter()
            .map(|step| {
                let ctx = StepContext {
                    flow_id: flow_id.to_string(),
                    step_name: step.name.clone(),
                    data: flow.data.clone(),
                    payment: flow.payment.clone(),
                    attempt: step.attempts,
                    idempotency_key: flow
                        .data
                        .get(&format!("_idem.{}", step.name))
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    cancel: self.registry.shutdown_token(),
                };
                self.executor.run(step, ctx)
            })
            .collect();

        futures::future::join_all(futures).await
    }

    /// Fold the attempt results back into the flow under the lock.
    async fn commit(
        &self,
        flow_id: &str,
        planned: Vec<Step>,
        results: Vec<Result<StepOutput>>,
    ) -> Result<NextAction> {
        let lock = self.registry.lock_for(flow_id);
        let _guard = lock.lock().await;

        let mut flow = self
            .store
            .load(flow_id)
            .await?
            .ok_or_else(|| FlowError::FlowNotFound(flow_id.to_string()))?;

        // A cancel that landed during execution wins; whatever the
        // steps produced is discarded.
        if flow.status == FlowStatus::Cancelled {
            info!(flow_id = %flow_id, "Discarding step results for cancelled flow");
            return Ok(NextAction::Halt);
        }

        let mut backoff: Option<Duration> = None;
        let mut failed_terminally = false;

        for (planned_step, result) in planned.iter().zip(results) {
            let name = &planned_step.name;
            match result {
                Ok(output) => {
                    for (key, value) in output.data {
                        flow.data.insert(key, value);
                    }
                    if let Some(payment) = output.payment {
                        flow.payment = Some(payment);
                    }
                    for event in output.events {
                        flow.record_event(event);
                    }
                    let step_result = StepResult::ok(&output.message);
                    let spliced: Option<Vec<Step>> = flow
                        .step(name)
                        .and_then(|s| s.branches.as_ref())
                        .and_then(|branches| select_branch(branches, &flow.data))
                        .map(|b| b.steps.clone())
                        .filter(|steps| !steps.is_empty());
                    if let Some(step) = flow.step_mut(name) {
                        step.status = StepStatus::Completed;
                        step.result = Some(step_result.clone());
                    }
                    flow.record_event(
                        FlowEvent::new("step_completed", format!("Step {name} completed"))
                            .with_payload(serde_json::json!({ "step": name })),
                    );
                    // The selected branch replaces everything after the
                    // carrying step, not just prepends to it.
                    if let Some(branch_steps) = spliced {
                        let at = flow
                            .steps
                            .iter()
                            .position(|s| s.name == *name)
                            .map(|i| i + 1)
                            .unwrap_or(flow.steps.len());
                        flow.steps.truncate(at);
                        flow.steps.extend(branch_steps);
                    }
                    self.publish_step(&flow, planned_step, StepStatus::Completed, Some(step_result));
                }
                Err(e) => {
                    let message = e.to_string();
                    let can_retry = !planned_step.critical
                        && planned_step.attempts <= planned_step.max_retries;
                    if can_retry {
                        if let Some(payment) = flow.payment.as_mut() {
                            payment.retry_count += 1;
                        }
                    }
                    if let Some(step) = flow.step_mut(name) {
                        step.result = Some(StepResult::failed(&message));
                        step.status = if can_retry {
                            StepStatus::Pending
                        } else {
                            StepStatus::Failed
                        };
                    }
                    flow.record_event(
                        FlowEvent::new("step_failed", format!("Step {name} failed: {message}"))
                            .with_payload(serde_json::json!({
                                "step": name,
                                "attempt": planned_step.attempts,
                                "error": message,
                            })),
                    );
                    self.publish_step(
                        &flow,
                        planned_step,
                        StepStatus::Failed,
                        Some(StepResult::failed(&message)),
                    );

                    if can_retry {
                        let delay = calculate_backoff(planned_step, &self.config);
                        warn!(
                            flow_id = %flow_id,
                            step = %name,
                            attempt = planned_step.attempts,
                            max_retries = planned_step.max_retries,
                            backoff_ms = delay.as_millis() as u64,
                            "Retrying step"
                        );
                        flow.record_event(
                            FlowEvent::new("step_retrying", format!("Step {name} will retry"))
                                .with_payload(serde_json::json!({
                                    "step": name,
                                    "attempt": planned_step.attempts,
                                })),
                        );
                        backoff = Some(backoff.map_or(delay, |d| d.max(delay)));
                    } else {
                        failed_terminally = true;
                        flow.last_error = Some(message);
                    }
                }
            }
        }

        flow.sync_cursor();

        if failed_terminally && flow.status == FlowStatus::Running {
            let error = flow.last_error.clone().unwrap_or_default();
            flow.transition_to(FlowStatus::Failed)?;
            flow.record_event(FlowEvent::new("flow_failed", format!("Flow failed: {error}")));
            self.store.save(&flow).await?;
            error!(flow_id = %flow_id, error = %error, "Flow failed");
            self.bus
                .publish(EngineEvent::flow_status_changed(flow.summary()));
            self.bus.publish(EngineEvent::FlowError {
                flow_id: flow_id.to_string(),
                error,
                timestamp: Utc::now(),
            });
            return Ok(NextAction::Halt);
        }

        if flow.status == FlowStatus::Running && flow.all_steps_succeeded() {
            self.complete(&mut flow).await?;
            return Ok(NextAction::Halt);
        }

        // A pause that landed during execution keeps the recorded
        // results; the loop halts at this boundary.
        let halting = flow.status == FlowStatus::Paused;
        self.store.save(&flow).await?;

        if halting {
            info!(flow_id = %flow_id, "Run loop halting at pause boundary");
            return Ok(NextAction::Halt);
        }
        Ok(match backoff {
            Some(delay) => NextAction::Backoff(delay),
            None => NextAction::Continue,
        })
    }

    async fn complete(&self, flow: &mut FlowRecord) -> Result<()> {
        flow.transition_to(FlowStatus::Completed)?;
        flow.record_event(FlowEvent::new("flow_completed", "All steps completed"));
        flow.sync_cursor();
        self.store.save(flow).await?;
        info!(flow_id = %flow.flow_id, "Flow completed");
        self.bus
            .publish(EngineEvent::flow_status_changed(flow.summary()));
        Ok(())
    }

    async fn fail(&self, flow: &mut FlowRecord, error: &str) -> Result<()> {
        flow.last_error = Some(error.to_string());
        flow.transition_to(FlowStatus::Failed)?;
        flow.record_event(FlowEvent::new("flow_failed", format!("Flow failed: {error}")));
        self.store.save(flow).await?;
        error!(flow_id = %flow.flow_id, error = %error, "Flow failed");
        self.bus
            .publish(EngineEvent::flow_status_changed(flow.summary()));
        self.bus.publish(EngineEvent::FlowError {
            flow_id: flow.flow_id.clone(),
            error: error.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn publish_step(
        &self,
        flow: &FlowRecord,
        step: &Step,
        step_status: StepStatus,
        step_result: Option<StepResult>,
    ) {
        self.bus.publish(EngineEvent::StepStatusChanged {
            flow_id: flow.flow_id.clone(),
            step_name: step.name.clone(),
            step_status,
            step_result,
            current_step_index: flow.current_step_index,
            current_step_name: flow.current_step_name.clone(),
            flow_status: flow.status,
            timestamp: Utc::now(),
        });
    }
}

/// Exponential backoff seeded from the step's own delay, capped by the
/// engine config.
fn calculate_backoff(step: &Step, config: &EngineConfig) -> Duration {
    let base = if step.retry_delay_ms > 0 {
        step.retry_delay_ms
    } else {
        config.retry.initial_backoff_ms
    };
    let exp = step.attempts.saturating_sub(1).min(16);
    let ms = base
        .saturating_mul(2u64.pow(exp))
        .min(config.retry.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}
