use std::sync::Arc;

use payflux_core::event::EventBus;
use payflux_engine::{ControlPlane, RecoveryManager};

/// Shared application state for axum handlers.
pub struct AppState {
    pub control: Arc<ControlPlane>,
    pub recovery: Arc<RecoveryManager>,
    pub event_bus: Arc<EventBus>,
}
