use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use payflux_core::error::Result;
use payflux_core::event::EngineEvent;
use payflux_core::flow::{FlowEvent, FlowFilter, FlowRecord, FlowStatus};
use payflux_core::step::{StepResult, StepStatus};

use crate::runtime::FlowRuntime;

/// Outcome of a recovery scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub scanned: usize,
    /// Flows whose loops were restarted.
    pub recovered_flows: Vec<String>,
    /// Flows forced to Failed, with the reason.
    pub failed_flows: Vec<(String, String)>,
}

/// Repairs flows left Running by a crashed process and restarts their
/// run loops.
pub struct RecoveryManager {
    runtime: Arc<FlowRuntime>,
}

impl RecoveryManager {
    pub fn new(runtime: Arc<FlowRuntime>) -> Self {
        Self { runtime }
    }

    /// Scan for flows stuck in Running with no live loop, repair their
    /// step state, and either restart them or fail them.
    ///
    /// A step found Running was interrupted mid-attempt. Idempotent
    /// steps are reset to Pending and re-run. A non-idempotent step
    /// whose start marker was persisted may already have produced its
    /// side effect, so the flow is failed with a recovery error; an
    /// operator can retry it after verifying the provider side.
    pub async fn recover_crashed(&self) -> Result<RecoveryReport> {
        let store = self.runtime.store().clone();
        let registry = self.runtime.registry().clone();
        let mut report = RecoveryReport::default();

        let running = store.list(&FlowFilter::by_status(FlowStatus::Running)).await?;
        for summary in running {
            let flow_id = summary.flow_id;
            if registry.is_active(&flow_id) {
                continue;
            }
            report.scanned += 1;

            let lock = registry.lock_for(&flow_id);
            let _guard = lock.lock().await;

            let Some(mut flow) = store.load(&flow_id).await? else {
                continue;
            };
            if flow.status != FlowStatus::Running {
                continue;
            }

            if let Err(reason) = validate_record(&flow) {
                warn!(flow_id = %flow_id, reason = %reason, "Unrecoverable flow record");
                flow.last_error = Some(reason.clone());
                flow.transition_to(FlowStatus::Failed)?;
                flow.record_event(FlowEvent::new(
                    "flow_failed",
                    format!("Recovery rejected record: {reason}"),
                ));
                store.save(&flow).await?;
                self.runtime
                    .bus()
                    .publish(EngineEvent::flow_status_changed(flow.summary()));
                report.failed_flows.push((flow_id, reason));
                continue;
            }

            let mut unsafe_step: Option<String> = None;
            for step in &mut flow.steps {
                if step.status != StepStatus::Running {
                    continue;
                }
                let started_marker = flow.data.contains_key(&format!("_started.{}", step.name));
                if !step.idempotent && started_marker {
                    // The side effect may already have gone out; this
                    // attempt cannot be replayed blindly.
                    unsafe_step.get_or_insert_with(|| step.name.clone());
                    step.status = StepStatus::Failed;
                    step.result = Some(StepResult::failed(
                        "interrupted mid-attempt with no idempotency guarantee",
                    ));
                } else {
                    step.status = StepStatus::Pending;
                    step.result = None;
                }
            }
            flow.sync_cursor();

            if let Some(step_name) = unsafe_step {
                let reason = format!(
                    "recovery: non-idempotent step {step_name} was interrupted after starting"
                );
                warn!(flow_id = %flow.flow_id, step = %step_name, "Failing unreplayable flow");
                flow.last_error = Some(reason.clone());
                flow.transition_to(FlowStatus::Failed)?;
                flow.record_event(FlowEvent::new(
                    "flow_failed",
                    format!("Recovery failed flow: {reason}"),
                ));
                store.save(&flow).await?;
                self.runtime
                    .bus()
                    .publish(EngineEvent::flow_status_changed(flow.summary()));
                report.failed_flows.push((flow.flow_id.clone(), reason));
            } else {
                flow.record_event(FlowEvent::new(
                    "flow_recovered",
                    "Recovered after crash; resuming execution",
                ));
                store.save(&flow).await?;
                info!(flow_id = %flow.flow_id, "Flow recovered, restarting loop");
                drop(_guard);
                self.runtime.spawn(flow.flow_id.clone());
                report.recovered_flows.push(flow.flow_id.clone());
            }
        }

        Ok(report)
    }

    /// Restart loops for flows that are startable but have no loop:
    /// Queued flows never picked up, and Running flows left at a clean
    /// step boundary. Run after [`Self::recover_crashed`] on boot.
    pub async fn restore_runtime(&self) -> Result<usize> {
        let store = self.runtime.store().clone();
        let registry = self.runtime.registry().clone();
        let mut restored = 0;

        for status in [FlowStatus::Queued, FlowStatus::Running] {
            let summaries = store.list(&FlowFilter::by_status(status)).await?;
            for summary in summaries {
                if registry.is_active(&summary.flow_id) {
                    continue;
                }
                if let Some(flow) = store.load(&summary.flow_id).await? {
                    // Skip flows recover_crashed would need to repair
                    if flow.steps.iter().any(|s| s.status == StepStatus::Running) {
                        continue;
                    }
                    self.runtime.spawn(flow.flow_id.clone());
                    restored += 1;
                }
            }
        }

        if restored > 0 {
            info!(restored, "Restored run loops from the store");
        }
        Ok(restored)
    }
}

fn validate_record(flow: &FlowRecord) -> std::result::Result<(), String> {
    if flow.steps.is_empty() {
        return Err("flow has no steps".to_string());
    }
    if flow.current_step_index > flow.steps.len() {
        return Err(format!(
            "step cursor {} out of range for {} steps",
            flow.current_step_index,
            flow.steps.len()
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for step in &flow.steps {
        if !seen.insert(step.name.as_str()) {
            return Err(format!("duplicate step name: {}", step.name));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{
        HandlerRegistry, StepContext, StepExecutor, StepHandler, StepOutput,
    };
    use crate::registry::RuntimeRegistry;
    use futures::future::BoxFuture;
    use payflux_core::config::EngineConfig;
    use payflux_core::event::EventBus;
    use payflux_core::step::Step;
    use payflux_core::traits::FlowStore;
    use payflux_store::MemoryFlowStore;
    use std::time::Duration;

    struct Succeeds {
        name: &'static str,
    }

    impl StepHandler for Succeeds {
        fn name(&self) -> &str {
            self.name
        }

        fn execute(&self, _ctx: StepContext) -> BoxFuture<'_, Result<StepOutput>> {
            Box::pin(async move { Ok(StepOutput::message("ok")) })
        }
    }

    fn runtime() -> Arc<FlowRuntime> {
        let mut handlers = HandlerRegistry::new();
        handlers.register(Arc::new(Succeeds { name: "a" }));
        handlers.register(Arc::new(Succeeds { name: "b" }));
        let store: Arc<dyn FlowStore> = Arc::new(MemoryFlowStore::new());
        Arc::new(FlowRuntime::new(
            store,
            Arc::new(StepExecutor::new(Arc::new(handlers), 30)),
            Arc::new(RuntimeRegistry::new()),
            Arc::new(EventBus::default()),
            EngineConfig::default(),
        ))
    }

    async fn save_crashed(
        runtime: &Arc<FlowRuntime>,
        idempotent: bool,
        mark_started: bool,
    ) -> String {
        let mut step = Step::new("a");
        step.idempotent = idempotent;
        step.status = StepStatus::Running;
        step.attempts = 1;
        let mut flow = FlowRecord::new("payment", "u", "c", vec![step, Step::new("b").depends_on("a")]);
        flow.transition_to(FlowStatus::Running).unwrap();
        if mark_started {
            flow.data.insert("_started.a".into(), serde_json::json!(1));
        }
        let flow_id = flow.flow_id.clone();
        runtime.store().save(&flow).await.unwrap();
        flow_id
    }

    async fn wait_done(runtime: &Arc<FlowRuntime>, flow_id: &str) -> FlowRecord {
        for _ in 0..200 {
            let flow = runtime.store().load(flow_id).await.unwrap().unwrap();
            if flow.status == FlowStatus::Completed {
                return flow;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("flow never completed");
    }

    #[tokio::test]
    async fn test_recover_idempotent_step_resumes() {
        let runtime = runtime();
        let flow_id = save_crashed(&runtime, true, false).await;

        let recovery = RecoveryManager::new(runtime.clone());
        let report = recovery.recover_crashed().await.unwrap();
        assert_eq!(report.recovered_flows, vec![flow_id.clone()]);
        assert!(report.failed_flows.is_empty());

        let done = wait_done(&runtime, &flow_id).await;
        assert!(done.all_steps_succeeded());
        assert!(done.events.iter().any(|e| e.kind == "flow_recovered"));
    }

    #[tokio::test]
    async fn test_recover_non_idempotent_started_step_fails_flow() {
        let runtime = runtime();
        let flow_id = save_crashed(&runtime, false, true).await;

        let recovery = RecoveryManager::new(runtime.clone());
        let report = recovery.recover_crashed().await.unwrap();
        assert!(report.recovered_flows.is_empty());
        assert_eq!(report.failed_flows.len(), 1);
        assert_eq!(report.failed_flows[0].0, flow_id);
        assert!(report.failed_flows[0].1.contains("non-idempotent"));

        let flow = runtime.store().load(&flow_id).await.unwrap().unwrap();
        assert_eq!(flow.status, FlowStatus::Failed);
        assert_eq!(flow.steps[0].status, StepStatus::Failed);
        assert!(flow.last_error.as_deref().unwrap().contains("recovery"));
        assert!(flow.last_error.as_deref().unwrap().contains("a"));
    }

    #[tokio::test]
    async fn test_recover_non_idempotent_unstarted_step_resumes() {
        // Crashed before the start marker was written: nothing went
        // out, so the step is safe to run fresh.
        let runtime = runtime();
        let flow_id = save_crashed(&runtime, false, false).await;

        let recovery = RecoveryManager::new(runtime.clone());
        let report = recovery.recover_crashed().await.unwrap();
        assert_eq!(report.recovered_flows, vec![flow_id.clone()]);
        assert!(report.failed_flows.is_empty());

        let done = wait_done(&runtime, &flow_id).await;
        assert!(done.all_steps_succeeded());
    }

    #[tokio::test]
    async fn test_recover_rejects_corrupt_cursor() {
        let runtime = runtime();
        let mut flow = FlowRecord::new("payment", "u", "c", vec![Step::new("a")]);
        flow.transition_to(FlowStatus::Running).unwrap();
        flow.current_step_index = 7;
        let flow_id = flow.flow_id.clone();
        runtime.store().save(&flow).await.unwrap();

        let recovery = RecoveryManager::new(runtime.clone());
        let report = recovery.recover_crashed().await.unwrap();
        assert_eq!(report.failed_flows.len(), 1);
        assert_eq!(report.failed_flows[0].0, flow_id);

        let flow = runtime.store().load(&flow_id).await.unwrap().unwrap();
        assert_eq!(flow.status, FlowStatus::Failed);
    }

    #[tokio::test]
    async fn test_restore_runtime_picks_up_queued_flow() {
        let runtime = runtime();
        let flow = FlowRecord::new("payment", "u", "c", vec![Step::new("a")]);
        let flow_id = flow.flow_id.clone();
        runtime.store().save(&flow).await.unwrap();

        let recovery = RecoveryManager::new(runtime.clone());
        let restored = recovery.restore_runtime().await.unwrap();
        assert_eq!(restored, 1);

        let done = wait_done(&runtime, &flow_id).await;
        assert!(done.all_steps_succeeded());
    }
}
