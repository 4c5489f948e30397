use futures::future::BoxFuture;

use crate::error::Result;
use crate::flow::{FlowFilter, FlowRecord, FlowSummary};
use crate::payment::{CaptureReceipt, OrderAck, OrderFill, OrderRequest};

/// Flow store — persistence backend.
///
/// The engine persists the full record BEFORE advancing past any step,
/// so a save must be durable by the time it returns Ok.
pub trait FlowStore: Send + Sync + 'static {
    /// Insert or replace a flow record keyed by flow_id.
    fn save(&self, flow: &FlowRecord) -> BoxFuture<'_, Result<()>>;

    /// Load a flow record by id.
    fn load(&self, flow_id: &str) -> BoxFuture<'_, Result<Option<FlowRecord>>>;

    /// List flow summaries matching a filter, newest first.
    fn list(&self, filter: &FlowFilter) -> BoxFuture<'_, Result<Vec<FlowSummary>>>;

    /// Delete a flow record. Returns true if a record existed.
    fn delete(&self, flow_id: &str) -> BoxFuture<'_, Result<bool>>;
}

/// Payment gateway — captures customer charges.
pub trait PaymentGateway: Send + Sync + 'static {
    /// Capture a charge. Must be safe to call twice with the same
    /// idempotency key; the second call returns the original receipt.
    fn capture(
        &self,
        charge_id: &str,
        amount: f64,
        currency: &str,
        idempotency_key: &str,
    ) -> BoxFuture<'_, Result<CaptureReceipt>>;
}

/// Exchange client — order placement and fill polling.
pub trait ExchangeClient: Send + Sync + 'static {
    /// Submit an order. The client_order_id in the request is the
    /// dedupe key; resubmitting it must not create a second order.
    fn place_order(&self, request: &OrderRequest) -> BoxFuture<'_, Result<OrderAck>>;

    /// Fetch the current fill state of an order.
    fn order_status(&self, client_order_id: &str) -> BoxFuture<'_, Result<OrderFill>>;
}
