use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FlowError, Result};
use crate::payment::PaymentState;
use crate::step::{Step, StepStatus};

/// Lifecycle status of a flow. Transitions are restricted to the edges
/// encoded in [`FlowStatus::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// The legal state machine edges:
    /// Queued -> Running; Running -> Completed | Failed | Paused |
    /// Cancelled; Paused -> Running | Cancelled; Failed -> Running
    /// (retry) | Cancelled (cancel/resolve).
    pub fn can_transition_to(&self, next: FlowStatus) -> bool {
        use FlowStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
                | (Failed, Running)
                | (Failed, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FlowStatus {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(FlowError::Config(format!("unknown flow status: {other}"))),
        }
    }
}

/// An entry in a flow's append-only audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    pub kind: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl FlowEvent {
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            timestamp: Utc::now(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// The persisted state of one workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub flow_id: String,
    pub flow_type: String,
    pub status: FlowStatus,
    pub correlation_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub paused_at: Option<DateTime<Utc>>,
    pub current_step_index: usize,
    #[serde(default)]
    pub current_step_name: Option<String>,
    #[serde(default)]
    pub pause_reason: Option<String>,
    #[serde(default)]
    pub pause_message: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub steps: Vec<Step>,
    /// Shared scratch space steps read and write.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    /// Append-only audit trail.
    #[serde(default)]
    pub events: Vec<FlowEvent>,
    /// Domain payload for payment flows.
    #[serde(default)]
    pub payment: Option<PaymentState>,
}

impl FlowRecord {
    pub fn new(
        flow_type: impl Into<String>,
        user_id: impl Into<String>,
        correlation_id: impl Into<String>,
        steps: Vec<Step>,
    ) -> Self {
        let flow_type = flow_type.into();
        let mut record = Self {
            flow_id: Uuid::new_v4().to_string(),
            flow_type: flow_type.clone(),
            status: FlowStatus::Queued,
            correlation_id: correlation_id.into(),
            user_id: user_id.into(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            paused_at: None,
            current_step_index: 0,
            current_step_name: steps.first().map(|s| s.name.clone()),
            pause_reason: None,
            pause_message: None,
            last_error: None,
            steps,
            data: HashMap::new(),
            events: Vec::new(),
            payment: None,
        };
        record.record_event(FlowEvent::new(
            "flow_created",
            format!("{flow_type} flow created"),
        ));
        record
    }

    /// Append to the audit trail. Events are never mutated or removed.
    pub fn record_event(&mut self, event: FlowEvent) {
        self.events.push(event);
    }

    /// Transition the flow status along a legal edge, maintaining the
    /// lifecycle timestamps.
    pub fn transition_to(&mut self, next: FlowStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FlowError::InvalidStateTransition {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        match next {
            FlowStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
                self.paused_at = None;
            }
            FlowStatus::Paused => self.paused_at = Some(now),
            FlowStatus::Completed | FlowStatus::Cancelled => self.completed_at = Some(now),
            FlowStatus::Failed => {}
            FlowStatus::Queued => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    /// Index of the first step without a successful result.
    pub fn first_incomplete_index(&self) -> Option<usize> {
        self.steps.iter().position(|s| !s.succeeded())
    }

    pub fn all_steps_succeeded(&self) -> bool {
        self.steps.iter().all(|s| s.succeeded())
    }

    /// Move the cursor to the first incomplete step. The cursor only
    /// moves backward on explicit retry/resume rewinds.
    pub fn sync_cursor(&mut self) {
        if let Some(idx) = self.first_incomplete_index() {
            self.current_step_index = idx;
            self.current_step_name = Some(self.steps[idx].name.clone());
        } else {
            self.current_step_index = self.steps.len();
            self.current_step_name = None;
        }
    }

    /// First step currently marked Failed, if any.
    pub fn failed_step_index(&self) -> Option<usize> {
        self.steps.iter().position(|s| s.status == StepStatus::Failed)
    }

    pub fn summary(&self) -> FlowSummary {
        FlowSummary {
            flow_id: self.flow_id.clone(),
            flow_type: self.flow_type.clone(),
            status: self.status,
            user_id: self.user_id.clone(),
            correlation_id: self.correlation_id.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
            current_step_index: self.current_step_index,
            current_step_name: self.current_step_name.clone(),
            pause_reason: self.pause_reason.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Condensed flow view for listings and status-change events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSummary {
    pub flow_id: String,
    pub flow_type: String,
    pub status: FlowStatus,
    pub user_id: String,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub current_step_index: usize,
    pub current_step_name: Option<String>,
    pub pause_reason: Option<String>,
    pub last_error: Option<String>,
}

/// Query filter for flow listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowFilter {
    #[serde(default)]
    pub status: Option<FlowStatus>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub flow_type: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub pause_reason: Option<String>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
}

impl FlowFilter {
    pub fn by_status(status: FlowStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, flow: &FlowRecord) -> bool {
        if self.status.is_some_and(|s| s != flow.status) {
            return false;
        }
        if self.user_id.as_ref().is_some_and(|u| *u != flow.user_id) {
            return false;
        }
        if self.flow_type.as_ref().is_some_and(|t| *t != flow.flow_type) {
            return false;
        }
        if self
            .correlation_id
            .as_ref()
            .is_some_and(|c| *c != flow.correlation_id)
        {
            return false;
        }
        if self
            .pause_reason
            .as_ref()
            .is_some_and(|r| flow.pause_reason.as_deref() != Some(r.as_str()))
        {
            return false;
        }
        if self.created_after.is_some_and(|t| flow.created_at < t) {
            return false;
        }
        if self.created_before.is_some_and(|t| flow.created_at > t) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn flow() -> FlowRecord {
        FlowRecord::new("payment", "user-1", "corr-1", vec![Step::new("a")])
    }

    #[test]
    fn test_new_flow_is_queued_with_created_event() {
        let f = flow();
        assert_eq!(f.status, FlowStatus::Queued);
        assert_eq!(f.current_step_index, 0);
        assert_eq!(f.current_step_name.as_deref(), Some("a"));
        assert_eq!(f.events.len(), 1);
        assert_eq!(f.events[0].kind, "flow_created");
    }

    #[test]
    fn test_legal_transitions() {
        let mut f = flow();
        f.transition_to(FlowStatus::Running).unwrap();
        assert!(f.started_at.is_some());
        f.transition_to(FlowStatus::Paused).unwrap();
        assert!(f.paused_at.is_some());
        f.transition_to(FlowStatus::Running).unwrap();
        assert!(f.paused_at.is_none());
        f.transition_to(FlowStatus::Failed).unwrap();
        f.transition_to(FlowStatus::Running).unwrap();
        f.transition_to(FlowStatus::Completed).unwrap();
        assert!(f.completed_at.is_some());
        assert!(f.status.is_terminal());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut f = flow();

        // Queued cannot pause or complete
        assert!(matches!(
            f.transition_to(FlowStatus::Paused),
            Err(FlowError::InvalidStateTransition { .. })
        ));
        assert!(matches!(
            f.transition_to(FlowStatus::Completed),
            Err(FlowError::InvalidStateTransition { .. })
        ));

        // Terminal states admit nothing
        f.transition_to(FlowStatus::Running).unwrap();
        f.transition_to(FlowStatus::Completed).unwrap();
        for next in [
            FlowStatus::Running,
            FlowStatus::Paused,
            FlowStatus::Failed,
            FlowStatus::Cancelled,
        ] {
            assert!(f.transition_to(next).is_err());
        }
    }

    #[test]
    fn test_failed_transition_rejected_from_paused() {
        let mut f = flow();
        f.transition_to(FlowStatus::Running).unwrap();
        f.transition_to(FlowStatus::Paused).unwrap();
        assert!(f.transition_to(FlowStatus::Failed).is_err());
        assert!(f.transition_to(FlowStatus::Completed).is_err());
    }

    #[test]
    fn test_filter_matching() {
        let f = flow();
        assert!(FlowFilter::default().matches(&f));
        assert!(FlowFilter::by_status(FlowStatus::Queued).matches(&f));
        assert!(!FlowFilter::by_status(FlowStatus::Running).matches(&f));

        let by_user = FlowFilter {
            user_id: Some("user-1".into()),
            ..Default::default()
        };
        assert!(by_user.matches(&f));

        let before_creation = FlowFilter {
            created_before: Some(f.created_at - Duration::seconds(60)),
            ..Default::default()
        };
        assert!(!before_creation.matches(&f));
    }

    #[test]
    fn test_sync_cursor_advances() {
        let mut f = FlowRecord::new(
            "payment",
            "u",
            "c",
            vec![Step::new("a"), Step::new("b")],
        );
        f.steps[0].status = StepStatus::Completed;
        f.steps[0].result = Some(crate::step::StepResult::ok("done"));
        f.sync_cursor();
        assert_eq!(f.current_step_index, 1);
        assert_eq!(f.current_step_name.as_deref(), Some("b"));

        f.steps[1].status = StepStatus::Completed;
        f.steps[1].result = Some(crate::step::StepResult::ok("done"));
        f.sync_cursor();
        assert_eq!(f.current_step_index, 2);
        assert!(f.current_step_name.is_none());
        assert!(f.all_steps_succeeded());
    }
}
