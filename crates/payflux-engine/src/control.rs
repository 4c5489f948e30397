use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use payflux_core::error::{FlowError, Result};
use payflux_core::event::{BatchItem, BatchReport, EngineEvent};
use payflux_core::flow::{FlowEvent, FlowFilter, FlowRecord, FlowStatus, FlowSummary};
use payflux_core::step::StepStatus;

use crate::runtime::FlowRuntime;

/// Operator-facing flow operations. Every mutation takes the same
/// per-flow lock the run loop uses, so control actions and step
/// commits never interleave.
pub struct ControlPlane {
    runtime: Arc<FlowRuntime>,
}

/// Outcome of a single control operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub flow_id: String,
    pub status: FlowStatus,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOperation {
    Pause,
    Resume,
    Cancel,
    Retry,
}

impl BatchOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::Retry => "retry",
        }
    }
}

/// Paging window for flow listings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ListPage {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

impl Default for ListPage {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowListing {
    pub flows: Vec<FlowSummary>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

/// Aggregate counts over flows in the store, optionally windowed by
/// creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistics {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
    /// completed / (completed + cancelled + failed), None before any
    /// flow settles.
    pub success_rate: Option<f64>,
    pub active_loops: usize,
}

impl ControlPlane {
    pub fn new(runtime: Arc<FlowRuntime>) -> Self {
        Self { runtime }
    }

    /// Pause a running flow at its next step boundary. Steps already
    /// in flight finish and their results are kept.
    pub async fn pause(
        &self,
        flow_id: &str,
        reason: &str,
        message: Option<&str>,
    ) -> Result<OperationResult> {
        let lock = self.runtime.registry().lock_for(flow_id);
        let _guard = lock.lock().await;

        let mut flow = self.load(flow_id).await?;
        flow.transition_to(FlowStatus::Paused)?;
        flow.pause_reason = Some(reason.to_string());
        flow.pause_message = message.map(String::from);
        flow.record_event(
            FlowEvent::new("flow_paused", format!("Flow paused: {reason}"))
                .with_payload(serde_json::json!({ "reason": reason, "message": message })),
        );
        self.runtime.store().save(&flow).await?;
        info!(flow_id = %flow_id, reason = %reason, "Flow paused");
        self.runtime
            .bus()
            .publish(EngineEvent::flow_status_changed(flow.summary()));
        Ok(OperationResult {
            flow_id: flow_id.to_string(),
            status: flow.status,
            message: format!("Paused: {reason}"),
        })
    }

    /// Resume a paused flow and restart its run loop. `resume_data`
    /// entries are merged into the data bag before execution resumes,
    /// letting an operator supply what a paused step was missing.
    pub async fn resume(
        &self,
        flow_id: &str,
        resume_data: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<OperationResult> {
        let lock = self.runtime.registry().lock_for(flow_id);
        {
            let _guard = lock.lock().await;

            let mut flow = self.load(flow_id).await?;
            if flow.status != FlowStatus::Paused {
                return Err(FlowError::InvalidStateTransition {
                    from: flow.status,
                    to: FlowStatus::Running,
                });
            }
            if let Some(data) = resume_data {
                for (key, value) in data {
                    flow.data.insert(key, value);
                }
            }
            flow.transition_to(FlowStatus::Running)?;
            flow.pause_reason = None;
            flow.pause_message = None;
            flow.record_event(FlowEvent::new("flow_resumed", "Flow resumed"));
            self.runtime.store().save(&flow).await?;
            info!(flow_id = %flow_id, "Flow resumed");
            self.runtime
                .bus()
                .publish(EngineEvent::flow_status_changed(flow.summary()));
        }
        self.runtime.spawn(flow_id.to_string());
        Ok(OperationResult {
            flow_id: flow_id.to_string(),
            status: FlowStatus::Running,
            message: "Resumed".to_string(),
        })
    }

    /// Cancel a flow. Running flows stop at the next step boundary and
    /// any in-flight step results are discarded.
    pub async fn cancel(&self, flow_id: &str, reason: Option<&str>) -> Result<OperationResult> {
        let lock = self.runtime.registry().lock_for(flow_id);
        let _guard = lock.lock().await;

        let mut flow = self.load(flow_id).await?;
        flow.transition_to(FlowStatus::Cancelled)?;
        let reason = reason.unwrap_or("operator request");
        flow.record_event(FlowEvent::new(
            "flow_cancelled",
            format!("Flow cancelled: {reason}"),
        ));
        self.runtime.store().save(&flow).await?;
        info!(flow_id = %flow_id, reason = %reason, "Flow cancelled");
        self.runtime
            .bus()
            .publish(EngineEvent::flow_status_changed(flow.summary()));
        Ok(OperationResult {
            flow_id: flow_id.to_string(),
            status: flow.status,
            message: format!("Cancelled: {reason}"),
        })
    }

    /// Close out a failed or paused flow that an operator has handled
    /// outside the system. The flow ends Cancelled with the resolution
    /// note on its timeline.
    pub async fn resolve(&self, flow_id: &str, note: &str) -> Result<OperationResult> {
        let lock = self.runtime.registry().lock_for(flow_id);
        let _guard = lock.lock().await;

        let mut flow = self.load(flow_id).await?;
        if !matches!(flow.status, FlowStatus::Failed | FlowStatus::Paused) {
            return Err(FlowError::InvalidStateTransition {
                from: flow.status,
                to: FlowStatus::Cancelled,
            });
        }
        flow.transition_to(FlowStatus::Cancelled)?;
        flow.record_event(
            FlowEvent::new("flow_cancelled", format!("Resolved by operator: {note}"))
                .with_payload(serde_json::json!({ "resolution": note })),
        );
        self.runtime.store().save(&flow).await?;
        info!(flow_id = %flow_id, "Flow resolved by operator");
        self.runtime
            .bus()
            .publish(EngineEvent::flow_status_changed(flow.summary()));
        Ok(OperationResult {
            flow_id: flow_id.to_string(),
            status: flow.status,
            message: format!("Resolved: {note}"),
        })
    }

    /// Retry a failed flow from its failed step. Only the failed
    /// step's attempt counter resets; completed work is untouched.
    pub async fn retry(&self, flow_id: &str) -> Result<OperationResult> {
        let lock = self.runtime.registry().lock_for(flow_id);
        {
            let _guard = lock.lock().await;

            let mut flow = self.load(flow_id).await?;
            if flow.status != FlowStatus::Failed {
                return Err(FlowError::InvalidStateTransition {
                    from: flow.status,
                    to: FlowStatus::Running,
                });
            }
            let mut retried = Vec::new();
            for step in &mut flow.steps {
                if step.status == StepStatus::Failed {
                    step.reset_for_retry();
                    retried.push(step.name.clone());
                }
            }
            flow.last_error = None;
            flow.transition_to(FlowStatus::Running)?;
            flow.sync_cursor();
            flow.record_event(
                FlowEvent::new("flow_resumed", "Flow retried after failure")
                    .with_payload(serde_json::json!({ "retried_steps": retried })),
            );
            self.runtime.store().save(&flow).await?;
            info!(flow_id = %flow_id, "Flow retried");
            self.runtime
                .bus()
                .publish(EngineEvent::flow_status_changed(flow.summary()));
        }
        self.runtime.spawn(flow_id.to_string());
        Ok(OperationResult {
            flow_id: flow_id.to_string(),
            status: FlowStatus::Running,
            message: "Retrying from failed step".to_string(),
        })
    }

    /// Apply one operation to many flows. Failures are reported per
    /// flow; the batch itself always succeeds.
    pub async fn batch(
        &self,
        operation: BatchOperation,
        flow_ids: &[String],
        reason: Option<&str>,
    ) -> Result<BatchReport> {
        let reason = reason.unwrap_or("batch");
        let mut items = Vec::with_capacity(flow_ids.len());
        for flow_id in flow_ids {
            let result = match operation {
                BatchOperation::Pause => self.pause(flow_id, reason, None).await,
                BatchOperation::Resume => self.resume(flow_id, None).await,
                BatchOperation::Cancel => self.cancel(flow_id, Some(reason)).await,
                BatchOperation::Retry => self.retry(flow_id).await,
            };
            items.push(match result {
                Ok(op) => BatchItem {
                    flow_id: flow_id.clone(),
                    success: true,
                    message: op.message,
                },
                Err(e) => BatchItem {
                    flow_id: flow_id.clone(),
                    success: false,
                    message: e.to_string(),
                },
            });
        }
        let report = BatchReport::new(operation.as_str(), items);
        info!(
            operation = operation.as_str(),
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            "Batch operation finished"
        );
        self.runtime.bus().publish(EngineEvent::BatchCompleted {
            report: report.clone(),
            timestamp: Utc::now(),
        });
        Ok(report)
    }

    pub async fn list(&self, filter: &FlowFilter, page: ListPage) -> Result<FlowListing> {
        let all = self.runtime.store().list(filter).await?;
        let total = all.len();
        let flows = all
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();
        Ok(FlowListing {
            flows,
            total,
            limit: page.limit,
            offset: page.offset,
        })
    }

    pub async fn detail(&self, flow_id: &str) -> Result<FlowRecord> {
        self.load(flow_id).await
    }

    pub async fn timeline(&self, flow_id: &str) -> Result<Vec<FlowEvent>> {
        Ok(self.load(flow_id).await?.events)
    }

    pub async fn statistics(
        &self,
        start: Option<chrono::DateTime<chrono::Utc>>,
        end: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Statistics> {
        let filter = FlowFilter {
            created_after: start,
            created_before: end,
            ..Default::default()
        };
        let all = self.runtime.store().list(&filter).await?;
        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        for summary in &all {
            *by_status.entry(summary.status.to_string()).or_default() += 1;
            *by_type.entry(summary.flow_type.clone()).or_default() += 1;
        }
        let completed = by_status.get("completed").copied().unwrap_or(0);
        let settled = completed
            + by_status.get("cancelled").copied().unwrap_or(0)
            + by_status.get("failed").copied().unwrap_or(0);
        let success_rate = (settled > 0).then(|| completed as f64 / settled as f64);
        Ok(Statistics {
            total: all.len(),
            by_status,
            by_type,
            success_rate,
            active_loops: self.runtime.registry().active_count(),
        })
    }

    async fn load(&self, flow_id: &str) -> Result<FlowRecord> {
        self.runtime
            .store()
            .load(flow_id)
            .await?
            .ok_or_else(|| FlowError::FlowNotFound(flow_id.to_string()))
    }
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

    struct Succeeds;

    impl StepHandler for Succeeds {
        fn name(&self) -> &str {
            "work"
        }

        fn execute(&self, _ctx: StepContext) -> BoxFuture<'_, Result<StepOutput>> {
            Box::pin(async move { Ok(StepOutput::message("ok")) })
        }
    }

    fn control() -> (Arc<FlowRuntime>, ControlPlane) {
        let mut handlers = HandlerRegistry::new();
        handlers.register(Arc::new(Succeeds));
        let store: Arc<dyn FlowStore> = Arc::new(MemoryFlowStore::new());
        let runtime = Arc::new(FlowRuntime::new(
            store,
            Arc::new(StepExecutor::new(Arc::new(handlers), 30)),
            Arc::new(RuntimeRegistry::new()),
            Arc::new(EventBus::default()),
            EngineConfig::default(),
        ));
        (runtime.clone(), ControlPlane::new(runtime))
    }

    async fn saved_flow(runtime: &Arc<FlowRuntime>, status: FlowStatus) -> String {
        let mut flow = FlowRecord::new("payment", "u", "c", vec![Step::new("work")]);
        match status {
            FlowStatus::Queued => {}
            FlowStatus::Running => {
                flow.transition_to(FlowStatus::Running).unwrap();
            }
            FlowStatus::Paused => {
                flow.transition_to(FlowStatus::Running).unwrap();
                flow.transition_to(FlowStatus::Paused).unwrap();
            }
            FlowStatus::Failed => {
                flow.transition_to(FlowStatus::Running).unwrap();
                flow.steps[0].status = StepStatus::Failed;
                flow.steps[0].attempts = 1;
                flow.last_error = Some("boom".into());
                flow.transition_to(FlowStatus::Failed).unwrap();
            }
            _ => panic!("unsupported fixture status"),
        }
        let flow_id = flow.flow_id.clone();
        runtime.store().save(&flow).await.unwrap();
        flow_id
    }

    async fn wait_completed(runtime: &Arc<FlowRuntime>, flow_id: &str) -> FlowRecord {
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
    async fn test_pause_requires_running() {
        let (runtime, control) = control();
        let running = saved_flow(&runtime, FlowStatus::Running).await;
        let queued = saved_flow(&runtime, FlowStatus::Queued).await;

        let result = control.pause(&running, "maintenance", None).await.unwrap();
        assert_eq!(result.status, FlowStatus::Paused);
        let flow = runtime.store().load(&running).await.unwrap().unwrap();
        assert_eq!(flow.pause_reason.as_deref(), Some("maintenance"));
        assert!(flow.events.iter().any(|e| e.kind == "flow_paused"));

        assert!(matches!(
            control.pause(&queued, "maintenance", None).await,
            Err(FlowError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_resume_clears_pause_and_completes() {
        let (runtime, control) = control();
        let flow_id = saved_flow(&runtime, FlowStatus::Paused).await;

        let mut resume_data = HashMap::new();
        resume_data.insert("operator_note".to_string(), serde_json::json!("checked"));
        control.resume(&flow_id, Some(resume_data)).await.unwrap();
        let done = wait_completed(&runtime, &flow_id).await;
        assert!(done.pause_reason.is_none());
        assert_eq!(done.data["operator_note"], "checked");
        assert!(done.events.iter().any(|e| e.kind == "flow_resumed"));
    }

    #[tokio::test]
    async fn test_cancel_paused_flow() {
        let (runtime, control) = control();
        let flow_id = saved_flow(&runtime, FlowStatus::Paused).await;

        let result = control.cancel(&flow_id, None).await.unwrap();
        assert_eq!(result.status, FlowStatus::Cancelled);

        // Terminal flows reject further control actions
        assert!(control.resume(&flow_id, None).await.is_err());
        assert!(control.cancel(&flow_id, None).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_resumes_at_failed_step() {
        let (runtime, control) = control();
        let flow_id = saved_flow(&runtime, FlowStatus::Failed).await;

        control.retry(&flow_id).await.unwrap();
        let done = wait_completed(&runtime, &flow_id).await;
        assert!(done.all_steps_succeeded());
        assert!(done.last_error.is_none());
    }

    #[tokio::test]
    async fn test_resolve_only_failed_or_paused() {
        let (runtime, control) = control();
        let failed = saved_flow(&runtime, FlowStatus::Failed).await;
        let running = saved_flow(&runtime, FlowStatus::Running).await;

        let result = control.resolve(&failed, "refunded manually").await.unwrap();
        assert_eq!(result.status, FlowStatus::Cancelled);
        let flow = runtime.store().load(&failed).await.unwrap().unwrap();
        assert!(flow
            .events
            .iter()
            .any(|e| e.description.contains("refunded manually")));

        assert!(control.resolve(&running, "nope").await.is_err());
    }

    #[tokio::test]
    async fn test_batch_reports_partial_success() {
        let (runtime, control) = control();
        let p1 = saved_flow(&runtime, FlowStatus::Paused).await;
        let p2 = saved_flow(&runtime, FlowStatus::Paused).await;
        let queued = saved_flow(&runtime, FlowStatus::Queued).await;

        let mut rx = runtime.bus().subscribe();
        let report = control
            .batch(
                BatchOperation::Resume,
                &[p1.clone(), p2.clone(), queued.clone()],
                None,
            )
            .await
            .unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        let failed_item = report.items.iter().find(|i| !i.success).unwrap();
        assert_eq!(failed_item.flow_id, queued);

        // BatchCompleted lands on the bus after the per-flow events
        let mut saw_batch = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EngineEvent::BatchCompleted { .. }) {
                saw_batch = true;
            }
        }
        assert!(saw_batch);
    }

    #[tokio::test]
    async fn test_list_pages_and_statistics() {
        let (runtime, control) = control();
        for _ in 0..3 {
            saved_flow(&runtime, FlowStatus::Queued).await;
        }
        saved_flow(&runtime, FlowStatus::Failed).await;

        let page = control
            .list(
                &FlowFilter::default(),
                ListPage {
                    limit: 2,
                    offset: 0,
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.flows.len(), 2);

        let rest = control
            .list(
                &FlowFilter::default(),
                ListPage {
                    limit: 10,
                    offset: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(rest.flows.len(), 2);

        let stats = control.statistics(None, None).await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.by_status.get("queued"), Some(&3));
        assert_eq!(stats.by_status.get("failed"), Some(&1));
        assert_eq!(stats.by_type.get("payment"), Some(&4));
        assert_eq!(stats.success_rate, Some(0.0));

        let windowed = control
            .statistics(Some(chrono::Utc::now() + chrono::Duration::hours(1)), None)
            .await
            .unwrap();
        assert_eq!(windowed.total, 0);
    }

    #[tokio::test]
    async fn test_timeline_and_detail() {
        let (runtime, control) = control();
        let flow_id = saved_flow(&runtime, FlowStatus::Paused).await;

        let detail = control.detail(&flow_id).await.unwrap();
        assert_eq!(detail.flow_id, flow_id);

        let timeline = control.timeline(&flow_id).await.unwrap();
        assert_eq!(timeline[0].kind, "flow_created");

        assert!(matches!(
            control.detail("missing").await,
            Err(FlowError::FlowNotFound(_))
        ));
    }
}
