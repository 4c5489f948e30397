use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use payflux_core::error::{FlowError, Result};
use payflux_core::flow::{FlowEvent, FlowRecord};
use payflux_core::payment::{
    AllocationStatus, AssetAllocation, CaptureReceipt, ExchangeOrder, LedgerEntry, OrderAck,
    OrderFill, OrderRequest, OrderSide, OrderStatus, PaymentState, ALLOCATION_SUM_TOLERANCE,
};
use payflux_core::step::Step;
use payflux_core::traits::{ExchangeClient, PaymentGateway};

use crate::executor::{HandlerRegistry, StepContext, StepHandler, StepOutput};
use crate::reconcile::reconcile;

pub const STEP_CAPTURE: &str = "capture-charge";
pub const STEP_ALLOCATE: &str = "allocate-assets";
pub const STEP_PLACE_ORDERS: &str = "place-orders";
pub const STEP_SETTLE: &str = "settle-orders";
pub const STEP_RECONCILE: &str = "reconcile";

const DATA_CHARGE: &str = "charge";

/// Incoming charge a payment flow is built from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeNotice {
    pub charge_id: String,
    pub user_id: String,
    pub amount: f64,
    pub currency: String,
    pub allocations: Vec<AllocationRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub asset: String,
    pub percent: f64,
}

/// Build the standard payment flow for a charge.
///
/// capture-charge -> allocate-assets -> place-orders -> settle-orders
/// -> reconcile. Settlement polls by retrying until every order is
/// terminal.
pub fn payment_flow(notice: &ChargeNotice) -> Result<FlowRecord> {
    // A charge whose allocations do not cover 100% never becomes a
    // flow; the caller gets the rejection synchronously.
    let total: f64 = notice.allocations.iter().map(|a| a.percent).sum();
    if (total - 100.0).abs() > ALLOCATION_SUM_TOLERANCE {
        return Err(FlowError::InvalidAllocation { total });
    }
    let steps = vec![
        Step::new(STEP_CAPTURE).critical().idempotent().timeout(30),
        Step::new(STEP_ALLOCATE).depends_on(STEP_CAPTURE),
        Step::new(STEP_PLACE_ORDERS)
            .depends_on(STEP_ALLOCATE)
            .data_dependency("allocations_ready", STEP_ALLOCATE)
            .idempotent()
            .retries(3, 500)
            .timeout(30),
        Step::new(STEP_SETTLE)
            .depends_on(STEP_PLACE_ORDERS)
            .idempotent()
            .retries(30, 200)
            .timeout(30),
        Step::new(STEP_RECONCILE).depends_on(STEP_SETTLE),
    ];
    let mut flow = FlowRecord::new("payment", &notice.user_id, &notice.charge_id, steps);
    flow.data
        .insert(DATA_CHARGE.to_string(), serde_json::to_value(notice)?);
    Ok(flow)
}

/// Register the payment pipeline handlers against a gateway and an
/// exchange.
pub fn register_payment_handlers(
    registry: &mut HandlerRegistry,
    gateway: Arc<dyn PaymentGateway>,
    exchange: Arc<dyn ExchangeClient>,
    reconcile_tolerance: f64,
) {
    registry.register(Arc::new(CaptureCharge { gateway }));
    registry.register(Arc::new(AllocateAssets));
    registry.register(Arc::new(PlaceOrders {
        exchange: exchange.clone(),
    }));
    registry.register(Arc::new(SettleOrders { exchange }));
    registry.register(Arc::new(Reconcile {
        tolerance: reconcile_tolerance,
    }));
}

fn charge_from(ctx: &StepContext) -> Result<ChargeNotice> {
    let value = ctx
        .data
        .get(DATA_CHARGE)
        .ok_or_else(|| FlowError::StepFailed {
            step: ctx.step_name.clone(),
            message: "charge notice missing from flow data".to_string(),
        })?;
    Ok(serde_json::from_value(value.clone())?)
}

fn payment_from(ctx: &StepContext) -> Result<PaymentState> {
    ctx.payment.clone().ok_or_else(|| FlowError::StepFailed {
        step: ctx.step_name.clone(),
        message: "payment state missing".to_string(),
    })
}

/// Captures the customer charge through the payment gateway and seeds
/// the payment state. Critical: an invalid charge fails the flow with
/// no retries.
pub struct CaptureCharge {
    gateway: Arc<dyn PaymentGateway>,
}

impl StepHandler for CaptureCharge {
    fn name(&self) -> &str {
        STEP_CAPTURE
    }

    fn execute(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            let notice = charge_from(&ctx)?;
            let key = ctx
                .idempotency_key
                .clone()
                .ok_or_else(|| FlowError::StepFailed {
                    step: ctx.step_name.clone(),
                    message: "capture requires an idempotency key".to_string(),
                })?;

            // Percent validation happens again here, before any money
            // moves, in case the flow was built by hand
            let allocations = notice
                .allocations
                .iter()
                .map(|a| AssetAllocation::new(&a.asset, a.percent))
                .collect();
            let mut payment =
                PaymentState::new(&notice.charge_id, notice.amount, &notice.currency, allocations)?;

            let receipt = self
                .gateway
                .capture(&notice.charge_id, notice.amount, &notice.currency, &key)
                .await?;
            info!(
                charge_id = %notice.charge_id,
                provider_charge_id = %receipt.provider_charge_id,
                amount = notice.amount,
                fee = receipt.processing_fee,
                "Charge captured"
            );
            payment.apply_capture(&receipt.provider_charge_id, receipt.processing_fee);
            payment.ledger.push(LedgerEntry::new(
                "charge_captured",
                &notice.currency,
                notice.amount,
                format!("Captured charge {}", receipt.provider_charge_id),
            ));
            if receipt.processing_fee > 0.0 {
                payment.ledger.push(LedgerEntry::new(
                    "processing_fee",
                    &notice.currency,
                    -receipt.processing_fee,
                    format!("Provider fee on {}", receipt.provider_charge_id),
                ));
            }

            Ok(
                StepOutput::message(format!("Captured {}", receipt.provider_charge_id))
                    .with_data(
                        "gateway_charge_id",
                        serde_json::json!(receipt.provider_charge_id),
                    )
                    .with_payment(payment),
            )
        })
    }
}

/// Splits the captured amount across the allocation targets, rounding
/// each slice to the cent.
pub struct AllocateAssets;

impl StepHandler for AllocateAssets {
    fn name(&self) -> &str {
        STEP_ALLOCATE
    }

    fn execute(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            let mut payment = payment_from(&ctx)?;
            let total = payment.amount;
            for allocation in &mut payment.allocations {
                allocation.amount = (total * allocation.percent / 100.0 * 100.0).round() / 100.0;
                payment.ledger.push(LedgerEntry::new(
                    "allocation",
                    &allocation.asset,
                    allocation.amount,
                    format!("{}% of {total}", allocation.percent),
                ));
            }
            let count = payment.allocations.len();
            Ok(StepOutput::message(format!("Allocated across {count} assets"))
                .with_data("allocations_ready", serde_json::json!(true))
                .with_payment(payment))
        })
    }
}

/// Submits one buy order per allocation. Client order ids are derived
/// from the flow id, so a re-run after a crash resubmits the same ids
/// and the exchange dedupes them.
pub struct PlaceOrders {
    exchange: Arc<dyn ExchangeClient>,
}

impl StepHandler for PlaceOrders {
    fn name(&self) -> &str {
        STEP_PLACE_ORDERS
    }

    fn execute(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            let mut payment = payment_from(&ctx)?;
            let allocations = payment.allocations.clone();
            for allocation in &allocations {
                let client_order_id = format!("{}-{}", ctx.flow_id, allocation.asset);
                if payment
                    .order(&client_order_id)
                    .is_some_and(|o| o.exchange_order_id.is_some())
                {
                    debug!(client_order_id = %client_order_id, "Order already submitted, skipping");
                    continue;
                }
                // A record without an exchange id means an earlier
                // attempt died before the ack; this is a resubmission.
                let resubmissions = payment
                    .order(&client_order_id)
                    .map(|o| o.retry_count + 1)
                    .unwrap_or(0);
                let ack = self
                    .exchange
                    .place_order(&OrderRequest {
                        client_order_id: client_order_id.clone(),
                        asset: allocation.asset.clone(),
                        side: OrderSide::Buy,
                        amount: allocation.amount,
                    })
                    .await?;
                if ack.status == OrderStatus::Rejected {
                    return Err(FlowError::Exchange(format!(
                        "order {client_order_id} rejected: {}",
                        ack.reject_reason.unwrap_or_default()
                    )));
                }
                let mut order = ExchangeOrder::new(
                    &client_order_id,
                    &allocation.asset,
                    OrderSide::Buy,
                    allocation.amount,
                );
                order.exchange_order_id = Some(ack.exchange_order_id);
                order.status = ack.status;
                order.retry_count = resubmissions;
                if let Some(existing) = payment.order_mut(&client_order_id) {
                    *existing = order;
                } else {
                    payment.orders.push(order);
                }
            }
            for allocation in &mut payment.allocations {
                allocation.status = AllocationStatus::Ordered;
            }
            let count = payment.orders.len();
            Ok(StepOutput::message(format!("Placed {count} orders")).with_payment(payment))
        })
    }
}

/// Polls the exchange until every order is terminal. Each poll that
/// finds an order still in flight fails the attempt, and the retry
/// backoff becomes the polling interval.
pub struct SettleOrders {
    exchange: Arc<dyn ExchangeClient>,
}

impl StepHandler for SettleOrders {
    fn name(&self) -> &str {
        STEP_SETTLE
    }

    fn execute(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            let mut payment = payment_from(&ctx)?;
            let ids: Vec<String> = payment
                .orders
                .iter()
                .filter(|o| !o.status.is_terminal())
                .map(|o| o.client_order_id.clone())
                .collect();

            for client_order_id in ids {
                let fill = self.exchange.order_status(&client_order_id).await?;
                if let Some(order) = payment.order_mut(&client_order_id) {
                    order.status = fill.status;
                    order.filled_amount = fill.filled_amount;
                    order.filled_quantity = fill.filled_quantity;
                    order.price = fill.price;
                    order.updated_at = Some(chrono::Utc::now());
                    if fill.status == OrderStatus::Filled {
                        payment.ledger.push(
                            LedgerEntry::new(
                                "fill",
                                &fill.client_order_id,
                                fill.filled_amount,
                                format!("Order {client_order_id} filled"),
                            )
                            .with_fill(fill.filled_quantity, fill.price),
                        );
                    }
                }
            }

            if !payment.orders_terminal() {
                let open = payment
                    .orders
                    .iter()
                    .filter(|o| !o.status.is_terminal())
                    .count();
                return Err(FlowError::StepFailed {
                    step: ctx.step_name.clone(),
                    message: format!("{open} orders still settling"),
                });
            }

            let mut filled_by_asset: HashMap<String, f64> = HashMap::new();
            for order in &payment.orders {
                *filled_by_asset.entry(order.asset.clone()).or_default() += order.filled_amount;
            }
            for allocation in &mut payment.allocations {
                let filled = filled_by_asset
                    .get(&allocation.asset)
                    .copied()
                    .unwrap_or(0.0);
                allocation.status = if filled > 0.0 {
                    AllocationStatus::Filled
                } else {
                    AllocationStatus::Failed
                };
            }

            let filled: f64 = payment.orders.iter().map(|o| o.filled_amount).sum();
            Ok(
                StepOutput::message(format!("All orders settled, {filled:.2} filled"))
                    .with_payment(payment),
            )
        })
    }
}

/// Computes the expected-vs-filled reconciliation report and attaches
/// it to the payment.
pub struct Reconcile {
    tolerance: f64,
}

impl StepHandler for Reconcile {
    fn name(&self) -> &str {
        STEP_RECONCILE
    }

    fn execute(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            let mut payment = payment_from(&ctx)?;
            let details = reconcile(&payment, self.tolerance);
            let status = details.status;
            let variance = details.total_variance;
            info!(
                flow_id = %ctx.flow_id,
                status = ?status,
                variance = variance,
                "Reconciliation computed"
            );
            let event = FlowEvent::new(
                "reconciliation_computed",
                format!("Reconciliation {status:?}, variance {variance:.2}"),
            )
            .with_payload(serde_json::to_value(&details)?);
            payment.reconciliation_status = status;
            payment.reconciliation = Some(details);
            Ok(
                StepOutput::message(format!("Reconciliation {status:?}"))
                    .with_data("reconciliation_status", serde_json::json!(format!("{status:?}").to_lowercase()))
                    .with_payment(payment)
                    .with_event(event),
            )
        })
    }
}

/// In-process payment gateway with idempotency-key dedupe; stands in
/// for a real processor in the binary and in tests.
#[derive(Default)]
pub struct PaperGateway {
    captures: Mutex<HashMap<String, CaptureReceipt>>,
}

impl PaperGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capture_count(&self) -> usize {
        self.captures.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl PaymentGateway for PaperGateway {
    fn capture(
        &self,
        charge_id: &str,
        amount: f64,
        _currency: &str,
        idempotency_key: &str,
    ) -> BoxFuture<'_, Result<CaptureReceipt>> {
        let charge_id = charge_id.to_string();
        let key = idempotency_key.to_string();
        Box::pin(async move {
            if amount <= 0.0 {
                return Err(FlowError::Gateway(format!(
                    "invalid amount {amount} for charge {charge_id}"
                )));
            }
            let mut captures = self.captures.lock().unwrap_or_else(|e| e.into_inner());
            let receipt = captures
                .entry(key)
                .or_insert_with(|| CaptureReceipt {
                    provider_charge_id: format!("cap_{}", Uuid::new_v4().simple()),
                    // Card-style fee schedule
                    processing_fee: ((amount * 0.029 + 0.30) * 100.0).round() / 100.0,
                })
                .clone();
            Ok(receipt)
        })
    }
}

struct PaperOrder {
    amount: f64,
    polls_until_fill: u32,
}

/// In-process exchange simulator. Orders dedupe on client_order_id and
/// fill after a configurable number of status polls.
pub struct PaperExchange {
    orders: Mutex<HashMap<String, PaperOrder>>,
    /// Fraction of the requested notional that fills, 0..=1.
    fill_ratio: f64,
    polls_until_fill: u32,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
            fill_ratio: 1.0,
            polls_until_fill: 1,
        }
    }

    pub fn with_fill_ratio(mut self, ratio: f64) -> Self {
        self.fill_ratio = ratio;
        self
    }

    pub fn with_polls_until_fill(mut self, polls: u32) -> Self {
        self.polls_until_fill = polls;
        self
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeClient for PaperExchange {
    fn place_order(&self, request: &OrderRequest) -> BoxFuture<'_, Result<OrderAck>> {
        let request = request.clone();
        Box::pin(async move {
            let mut orders = self.orders.lock().unwrap_or_else(|e| e.into_inner());
            orders
                .entry(request.client_order_id.clone())
                .or_insert(PaperOrder {
                    amount: request.amount,
                    polls_until_fill: self.polls_until_fill,
                });
            Ok(OrderAck {
                client_order_id: request.client_order_id.clone(),
                exchange_order_id: format!("ex-{}", request.client_order_id),
                status: OrderStatus::Submitted,
                reject_reason: None,
            })
        })
    }

    fn order_status(&self, client_order_id: &str) -> BoxFuture<'_, Result<OrderFill>> {
        let client_order_id = client_order_id.to_string();
        Box::pin(async move {
            let mut orders = self.orders.lock().unwrap_or_else(|e| e.into_inner());
            let order = orders
                .get_mut(&client_order_id)
                .ok_or_else(|| FlowError::Exchange(format!("unknown order {client_order_id}")))?;
            if order.polls_until_fill > 0 {
                order.polls_until_fill -= 1;
                return Ok(OrderFill {
                    client_order_id,
                    status: OrderStatus::Submitted,
                    filled_amount: 0.0,
                    filled_quantity: 0.0,
                    price: None,
                });
            }
            let filled = order.amount * self.fill_ratio;
            Ok(OrderFill {
                client_order_id,
                status: OrderStatus::Filled,
                filled_amount: filled,
                // Flat unit price keeps quantity equal to notional
                filled_quantity: filled,
                price: Some(1.0),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::StepExecutor;
    use crate::registry::RuntimeRegistry;
    use crate::runtime::FlowRuntime;
    use payflux_core::config::EngineConfig;
    use payflux_core::event::EventBus;
    use payflux_core::flow::FlowStatus;
    use payflux_core::payment::ReconciliationStatus;
    use payflux_core::traits::FlowStore;
    use payflux_store::MemoryFlowStore;
    use std::time::Duration;

    fn notice(allocations: Vec<(&str, f64)>) -> ChargeNotice {
        ChargeNotice {
            charge_id: "ch_test".into(),
            user_id: "user-1".into(),
            amount: 100.0,
            currency: "USD".into(),
            allocations: allocations
                .into_iter()
                .map(|(asset, percent)| AllocationRequest {
                    asset: asset.into(),
                    percent,
                })
                .collect(),
        }
    }

    fn runtime_with(
        gateway: Arc<PaperGateway>,
        exchange: Arc<PaperExchange>,
    ) -> Arc<FlowRuntime> {
        let mut handlers = HandlerRegistry::new();
        register_payment_handlers(&mut handlers, gateway, exchange, 0.01);
        let store: Arc<dyn FlowStore> = Arc::new(MemoryFlowStore::new());
        Arc::new(FlowRuntime::new(
            store,
            Arc::new(StepExecutor::new(Arc::new(handlers), 30)),
            Arc::new(RuntimeRegistry::new()),
            Arc::new(EventBus::default()),
            EngineConfig::default(),
        ))
    }

    async fn wait_settled(runtime: &Arc<FlowRuntime>, flow_id: &str) -> FlowRecord {
        for _ in 0..500 {
            if let Some(flow) = runtime.store().load(flow_id).await.unwrap() {
                if flow.status.is_terminal() || flow.status == FlowStatus::Failed {
                    return flow;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("flow never settled");
    }

    #[tokio::test]
    async fn test_payment_flow_end_to_end() {
        let gateway = Arc::new(PaperGateway::new());
        let exchange = Arc::new(PaperExchange::new().with_polls_until_fill(2));
        let runtime = runtime_with(gateway.clone(), exchange);

        let flow = payment_flow(&notice(vec![("BTC", 60.0), ("ETH", 40.0)])).unwrap();
        let flow_id = runtime.submit(flow).await.unwrap();

        let done = wait_settled(&runtime, &flow_id).await;
        assert_eq!(done.status, FlowStatus::Completed);
        assert_eq!(gateway.capture_count(), 1);

        let payment = done.payment.as_ref().unwrap();
        assert_eq!(payment.orders.len(), 2);
        assert!((payment.allocations[0].amount - 60.0).abs() < 1e-9);
        assert!((payment.allocations[1].amount - 40.0).abs() < 1e-9);
        assert!(payment.orders_terminal());

        // Capture details flow through to the payment record
        assert!(payment.provider_id.as_deref().unwrap().starts_with("cap_"));
        assert!((payment.processing_fee - 3.20).abs() < 1e-9);
        assert!((payment.net_amount - 96.80).abs() < 1e-9);
        assert!(payment
            .ledger
            .iter()
            .any(|e| e.entry_type == "processing_fee"));
        assert!(payment
            .allocations
            .iter()
            .all(|a| a.status == AllocationStatus::Filled));
        assert!(payment.orders.iter().all(|o| o.price == Some(1.0)));
        assert_eq!(payment.reconciliation_status, ReconciliationStatus::Complete);
        let fill = payment
            .ledger
            .iter()
            .find(|e| e.entry_type == "fill")
            .unwrap();
        assert!(fill.quantity > 0.0);
        assert!(!fill.transaction_id.is_empty());

        let details = payment.reconciliation.as_ref().unwrap();
        assert_eq!(details.status, ReconciliationStatus::Complete);
        assert!(details.total_variance.abs() < 1e-9);

        // Ledger carries the capture, both allocations, and both fills
        assert!(payment.ledger.iter().any(|e| e.entry_type == "charge_captured"));
        assert_eq!(
            payment.ledger.iter().filter(|e| e.entry_type == "allocation").count(),
            2
        );
        assert_eq!(
            payment.ledger.iter().filter(|e| e.entry_type == "fill").count(),
            2
        );

        assert!(done.events.iter().any(|e| e.kind == "reconciliation_computed"));
        // Settlement polled at least once before settling
        assert!(done.steps[3].attempts >= 2);
    }

    #[tokio::test]
    async fn test_partial_fills_reconcile_as_partial() {
        let gateway = Arc::new(PaperGateway::new());
        let exchange = Arc::new(PaperExchange::new().with_fill_ratio(0.6));
        let runtime = runtime_with(gateway, exchange);

        let flow = payment_flow(&notice(vec![("BTC", 100.0)])).unwrap();
        let flow_id = runtime.submit(flow).await.unwrap();

        let done = wait_settled(&runtime, &flow_id).await;
        assert_eq!(done.status, FlowStatus::Completed);

        let details = done
            .payment
            .as_ref()
            .unwrap()
            .reconciliation
            .as_ref()
            .unwrap();
        assert_eq!(details.status, ReconciliationStatus::Partial);
        assert!((details.total_variance - 40.0).abs() < 1e-9);
        assert_eq!(done.data["reconciliation_status"], "partial");
    }

    #[test]
    fn test_invalid_allocation_rejected_before_flow_exists() {
        // A 90% split never becomes a flow; the caller gets the error
        // synchronously instead of a Failed record later.
        let err = payment_flow(&notice(vec![("BTC", 90.0)])).unwrap_err();
        assert!(matches!(
            err,
            FlowError::InvalidAllocation { total } if (total - 90.0).abs() < 1e-9
        ));

        let err = payment_flow(&notice(vec![("BTC", 60.0), ("ETH", 60.0)])).unwrap_err();
        assert!(matches!(err, FlowError::InvalidAllocation { .. }));

        // Within tolerance still builds
        assert!(payment_flow(&notice(vec![
            ("BTC", 33.33),
            ("ETH", 33.33),
            ("SOL", 33.34),
        ]))
        .is_ok());
    }

    #[tokio::test]
    async fn test_place_orders_rerun_does_not_duplicate() {
        let exchange = Arc::new(PaperExchange::new());
        let handler = PlaceOrders {
            exchange: exchange.clone(),
        };

        let mut allocation = AssetAllocation::new("BTC", 100.0);
        allocation.amount = 100.0;
        let mut payment = PaymentState::new("ch_1", 100.0, "USD", vec![allocation]).unwrap();
        let ctx = |payment: PaymentState| StepContext {
            flow_id: "flow-1".into(),
            step_name: STEP_PLACE_ORDERS.into(),
            data: HashMap::new(),
            payment: Some(payment),
            attempt: 1,
            idempotency_key: None,
            cancel: tokio_util::sync::CancellationToken::new(),
        };

        let output = handler.execute(ctx(payment.clone())).await.unwrap();
        payment = output.payment.unwrap();
        assert_eq!(payment.orders.len(), 1);

        // Re-running with the submitted order skips the exchange call
        let output = handler.execute(ctx(payment)).await.unwrap();
        let payment = output.payment.unwrap();
        assert_eq!(payment.orders.len(), 1);
        assert_eq!(exchange.orders.lock().unwrap().len(), 1);
    }
}
