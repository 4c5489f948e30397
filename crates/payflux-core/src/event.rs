use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::flow::{FlowStatus, FlowSummary};
use crate::step::{StepResult, StepStatus};

/// Real-time notification emitted by the engine as flows progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    FlowStatusChanged {
        flow_id: String,
        status: FlowStatus,
        detail: FlowSummary,
        timestamp: DateTime<Utc>,
    },
    StepStatusChanged {
        flow_id: String,
        step_name: String,
        step_status: StepStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        step_result: Option<StepResult>,
        current_step_index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_step_name: Option<String>,
        flow_status: FlowStatus,
        timestamp: DateTime<Utc>,
    },
    BatchCompleted {
        report: BatchReport,
        timestamp: DateTime<Utc>,
    },
    FlowError {
        flow_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn flow_id(&self) -> Option<&str> {
        match self {
            Self::FlowStatusChanged { flow_id, .. }
            | Self::StepStatusChanged { flow_id, .. }
            | Self::FlowError { flow_id, .. } => Some(flow_id),
            Self::BatchCompleted { .. } => None,
        }
    }

    pub fn flow_status_changed(detail: FlowSummary) -> Self {
        Self::FlowStatusChanged {
            flow_id: detail.flow_id.clone(),
            status: detail.status,
            detail,
            timestamp: Utc::now(),
        }
    }
}

/// Per-flow outcome of a batch operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub flow_id: String,
    pub success: bool,
    pub message: String,
}

/// Summary of a batch pause/resume/cancel operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub operation: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub items: Vec<BatchItem>,
}

impl BatchReport {
    pub fn new(operation: impl Into<String>, items: Vec<BatchItem>) -> Self {
        let succeeded = items.iter().filter(|i| i.success).count();
        Self {
            operation: operation.into(),
            total: items.len(),
            succeeded,
            failed: items.len() - succeeded,
            items,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_report_counts() {
        let report = BatchReport::new(
            "pause",
            vec![
                BatchItem {
                    flow_id: "f1".into(),
                    success: true,
                    message: "paused".into(),
                },
                BatchItem {
                    flow_id: "f2".into(),
                    success: false,
                    message: "not running".into(),
                },
            ],
        );
        assert_eq!(report.total, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::FlowError {
            flow_id: "f1".into(),
            error: "boom".into(),
            timestamp: Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.flow_id(), Some("f1"));
    }
}
