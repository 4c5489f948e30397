use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use payflux_core::error::{FlowError, Result};
use payflux_core::flow::FlowEvent;
use payflux_core::payment::PaymentState;
use payflux_core::step::Step;

/// Read-only snapshot handed to a step handler for one attempt.
#[derive(Clone)]
pub struct StepContext {
    pub flow_id: String,
    pub step_name: String,
    /// Flow data bag as of the start of the attempt.
    pub data: HashMap<String, serde_json::Value>,
    pub payment: Option<PaymentState>,
    /// 1-based attempt counter.
    pub attempt: u32,
    /// Persisted before the handler runs, for steps with external
    /// side effects. None for pure steps.
    pub idempotency_key: Option<String>,
    pub cancel: CancellationToken,
}

/// What a successful step attempt produced. `data` entries are merged
/// into the flow's data bag; a Some `payment` replaces the flow's
/// payment payload; `events` are appended to the flow's timeline.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub message: String,
    pub data: HashMap<String, serde_json::Value>,
    pub payment: Option<PaymentState>,
    pub events: Vec<FlowEvent>,
}

impl StepOutput {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_payment(mut self, payment: PaymentState) -> Self {
        self.payment = Some(payment);
        self
    }

    pub fn with_event(mut self, event: FlowEvent) -> Self {
        self.events.push(event);
        self
    }
}

/// Step handler — the unit of business logic the engine schedules.
pub trait StepHandler: Send + Sync + 'static {
    /// Handler name, matched against [`Step::name`].
    fn name(&self) -> &str;

    /// Run one attempt. An Err marks the attempt failed and feeds the
    /// retry policy.
    fn execute(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepOutput>>;
}

/// Registry mapping step names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn StepHandler>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| FlowError::HandlerNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

/// Runs a single step attempt under its timeout.
pub struct StepExecutor {
    registry: Arc<HandlerRegistry>,
    default_timeout_secs: u64,
}

impl StepExecutor {
    pub fn new(registry: Arc<HandlerRegistry>, default_timeout_secs: u64) -> Self {
        Self {
            registry,
            default_timeout_secs,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Execute one attempt of `step`. A timeout counts as a failed
    /// attempt like any other error.
    pub async fn run(&self, step: &Step, ctx: StepContext) -> Result<StepOutput> {
        let handler = self.registry.get(&step.name)?;
        let timeout_secs = step.timeout_secs.unwrap_or(self.default_timeout_secs);
        let timeout = Duration::from_secs(timeout_secs);

        match tokio::time::timeout(timeout, handler.execute(ctx)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(step = %step.name, timeout_secs, "Step attempt timed out");
                Err(FlowError::StepTimeout {
                    step: step.name.clone(),
                    timeout_secs,
                })
            }
        }
    }
}
