use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use payflux_core::error::{FlowError, Result};
use payflux_core::flow::{FlowFilter, FlowRecord, FlowSummary};
use payflux_core::traits::FlowStore;

/// In-memory flow store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryFlowStore {
    flows: Mutex<HashMap<String, FlowRecord>>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlowStore for MemoryFlowStore {
    fn save(&self, flow: &FlowRecord) -> BoxFuture<'_, Result<()>> {
        let flow = flow.clone();
        Box::pin(async move {
            let mut flows = self
                .flows
                .lock()
                .map_err(|e| FlowError::Store(e.to_string()))?;
            flows.insert(flow.flow_id.clone(), flow);
            Ok(())
        })
    }

    fn load(&self, flow_id: &str) -> BoxFuture<'_, Result<Option<FlowRecord>>> {
        let flow_id = flow_id.to_string();
        Box::pin(async move {
            let flows = self
                .flows
                .lock()
                .map_err(|e| FlowError::Store(e.to_string()))?;
            Ok(flows.get(&flow_id).cloned())
        })
    }

    fn list(&self, filter: &FlowFilter) -> BoxFuture<'_, Result<Vec<FlowSummary>>> {
        let filter = filter.clone();
        Box::pin(async move {
            let flows = self
                .flows
                .lock()
                .map_err(|e| FlowError::Store(e.to_string()))?;
            let mut summaries: Vec<FlowSummary> = flows
                .values()
                .filter(|f| filter.matches(f))
                .map(|f| f.summary())
                .collect();
            summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(summaries)
        })
    }

    fn delete(&self, flow_id: &str) -> BoxFuture<'_, Result<bool>> {
        let flow_id = flow_id.to_string();
        Box::pin(async move {
            let mut flows = self
                .flows
                .lock()
                .map_err(|e| FlowError::Store(e.to_string()))?;
            Ok(flows.remove(&flow_id).is_some())
        })
    }
}
