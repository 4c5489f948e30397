use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Tolerance used when checking that allocation percentages sum to 100.
pub const ALLOCATION_SUM_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Rejected | Self::Cancelled)
    }
}

/// Lifecycle of one allocation slice, from the split through fills.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    #[default]
    Pending,
    Ordered,
    Filled,
    Failed,
}

/// One slice of a charge directed at a single asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetAllocation {
    pub asset: String,
    /// Share of the charge in percent, 0..=100.
    pub percent: f64,
    /// Dollar amount computed from the charge total.
    pub amount: f64,
    #[serde(default)]
    pub status: AllocationStatus,
}

impl AssetAllocation {
    pub fn new(asset: impl Into<String>, percent: f64) -> Self {
        Self {
            asset: asset.into(),
            percent,
            amount: 0.0,
            status: AllocationStatus::Pending,
        }
    }
}

/// An order as tracked by the flow, from submission through fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrder {
    /// Deterministic id supplied to the exchange for dedupe.
    pub client_order_id: String,
    #[serde(default)]
    pub exchange_order_id: Option<String>,
    pub asset: String,
    pub side: OrderSide,
    /// Notional dollar amount requested.
    pub amount: f64,
    /// Dollar amount filled so far.
    #[serde(default)]
    pub filled_amount: f64,
    /// Asset quantity filled so far.
    #[serde(default)]
    pub filled_quantity: f64,
    /// Average fill price, once known.
    #[serde(default)]
    pub price: Option<f64>,
    /// Submission attempts beyond the first.
    #[serde(default)]
    pub retry_count: u32,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reject_reason: Option<String>,
}

impl ExchangeOrder {
    pub fn new(client_order_id: impl Into<String>, asset: impl Into<String>, side: OrderSide, amount: f64) -> Self {
        Self {
            client_order_id: client_order_id.into(),
            exchange_order_id: None,
            asset: asset.into(),
            side,
            amount,
            filled_amount: 0.0,
            filled_quantity: 0.0,
            price: None,
            retry_count: 0,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
            updated_at: None,
            reject_reason: None,
        }
    }
}

/// Double-entry style ledger line recorded as money moves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub transaction_id: String,
    pub entry_type: String,
    pub asset: String,
    pub amount: f64,
    /// Asset quantity moved, zero for pure cash lines.
    #[serde(default)]
    pub quantity: f64,
    /// Execution price for fill lines.
    #[serde(default)]
    pub price: Option<f64>,
    pub description: String,
    pub executed_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        entry_type: impl Into<String>,
        asset: impl Into<String>,
        amount: f64,
        description: impl Into<String>,
    ) -> Self {
        Self {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            entry_type: entry_type.into(),
            asset: asset.into(),
            amount,
            quantity: 0.0,
            price: None,
            description: description.into(),
            executed_at: Utc::now(),
        }
    }

    pub fn with_fill(mut self, quantity: f64, price: Option<f64>) -> Self {
        self.quantity = quantity;
        self.price = price;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    #[default]
    Pending,
    Complete,
    Partial,
    Failed,
}

/// Expected-vs-filled comparison for one asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetReconciliation {
    pub asset: String,
    pub expected: f64,
    pub ordered: f64,
    pub filled: f64,
    pub variance: f64,
    /// Orders submitted for this asset.
    pub order_count: usize,
    pub within_tolerance: bool,
    pub status: ReconciliationStatus,
}

/// Outcome of reconciling a payment's allocations against its orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationDetails {
    pub status: ReconciliationStatus,
    pub total_expected: f64,
    pub total_ordered: f64,
    pub total_filled: f64,
    pub total_variance: f64,
    pub tolerance: f64,
    pub assets: Vec<AssetReconciliation>,
    pub computed_at: DateTime<Utc>,
}

/// Domain payload carried by a payment flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentState {
    pub charge_id: String,
    /// Charge id assigned by the payment provider, once captured.
    #[serde(default)]
    pub provider_id: Option<String>,
    /// Total charge in dollars.
    pub amount: f64,
    /// Amount left after the provider's processing fee.
    #[serde(default)]
    pub net_amount: f64,
    #[serde(default)]
    pub processing_fee: f64,
    pub currency: String,
    /// Step retries absorbed while driving this payment.
    #[serde(default)]
    pub retry_count: u32,
    pub allocations: Vec<AssetAllocation>,
    #[serde(default)]
    pub orders: Vec<ExchangeOrder>,
    #[serde(default)]
    pub ledger: Vec<LedgerEntry>,
    #[serde(default)]
    pub reconciliation_status: ReconciliationStatus,
    #[serde(default)]
    pub reconciliation: Option<ReconciliationDetails>,
}

impl PaymentState {
    /// Build the payment payload, validating that allocation percentages
    /// sum to 100 within [`ALLOCATION_SUM_TOLERANCE`].
    pub fn new(
        charge_id: impl Into<String>,
        amount: f64,
        currency: impl Into<String>,
        allocations: Vec<AssetAllocation>,
    ) -> Result<Self> {
        let total: f64 = allocations.iter().map(|a| a.percent).sum();
        if (total - 100.0).abs() > ALLOCATION_SUM_TOLERANCE {
            return Err(FlowError::InvalidAllocation { total });
        }
        Ok(Self {
            charge_id: charge_id.into(),
            provider_id: None,
            amount,
            net_amount: amount,
            processing_fee: 0.0,
            currency: currency.into(),
            retry_count: 0,
            allocations,
            orders: Vec::new(),
            ledger: Vec::new(),
            reconciliation_status: ReconciliationStatus::Pending,
            reconciliation: None,
        })
    }

    /// Record the provider's capture outcome: its charge id and the
    /// processing fee taken off the top.
    pub fn apply_capture(&mut self, provider_id: impl Into<String>, processing_fee: f64) {
        self.provider_id = Some(provider_id.into());
        self.processing_fee = processing_fee;
        self.net_amount = self.amount - processing_fee;
    }

    pub fn order(&self, client_order_id: &str) -> Option<&ExchangeOrder> {
        self.orders.iter().find(|o| o.client_order_id == client_order_id)
    }

    pub fn order_mut(&mut self, client_order_id: &str) -> Option<&mut ExchangeOrder> {
        self.orders
            .iter_mut()
            .find(|o| o.client_order_id == client_order_id)
    }

    /// True once every submitted order has reached a terminal status.
    pub fn orders_terminal(&self) -> bool {
        !self.orders.is_empty() && self.orders.iter().all(|o| o.status.is_terminal())
    }
}

/// Request handed to an exchange when placing an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub asset: String,
    pub side: OrderSide,
    pub amount: f64,
}

/// Exchange acknowledgement of a placed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub reject_reason: Option<String>,
}

/// Fill snapshot reported by an exchange for one order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub client_order_id: String,
    pub status: OrderStatus,
    pub filled_amount: f64,
    pub filled_quantity: f64,
    #[serde(default)]
    pub price: Option<f64>,
}

/// What a payment provider reports back for a captured charge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureReceipt {
    pub provider_charge_id: String,
    pub processing_fee: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(asset: &str, percent: f64, amount: f64) -> AssetAllocation {
        let mut allocation = AssetAllocation::new(asset, percent);
        allocation.amount = amount;
        allocation
    }

    #[test]
    fn test_allocations_must_sum_to_100() {
        let ok = PaymentState::new(
            "ch_1",
            100.0,
            "USD",
            vec![alloc("BTC", 60.0, 60.0), alloc("ETH", 40.0, 40.0)],
        );
        assert!(ok.is_ok());

        let short = PaymentState::new("ch_2", 100.0, "USD", vec![alloc("BTC", 90.0, 90.0)]);
        assert!(matches!(
            short,
            Err(FlowError::InvalidAllocation { total }) if (total - 90.0).abs() < 1e-9
        ));

        // Sum within tolerance passes
        let near = PaymentState::new(
            "ch_3",
            100.0,
            "USD",
            vec![
                alloc("BTC", 33.33, 33.33),
                alloc("ETH", 33.33, 33.33),
                alloc("SOL", 33.34, 33.34),
            ],
        );
        assert!(near.is_ok());
    }

    #[test]
    fn test_orders_terminal() {
        let mut p = PaymentState::new("ch", 100.0, "USD", vec![alloc("BTC", 100.0, 100.0)]).unwrap();
        assert!(!p.orders_terminal());

        p.orders.push(ExchangeOrder::new("ord-1", "BTC", OrderSide::Buy, 100.0));
        assert!(!p.orders_terminal());

        p.order_mut("ord-1").unwrap().status = OrderStatus::Filled;
        assert!(p.orders_terminal());
    }

    #[test]
    fn test_new_payment_starts_uncaptured() {
        let p = PaymentState::new("ch", 100.0, "USD", vec![alloc("BTC", 100.0, 0.0)]).unwrap();
        assert!(p.provider_id.is_none());
        assert!((p.net_amount - 100.0).abs() < 1e-9);
        assert_eq!(p.retry_count, 0);
        assert_eq!(p.reconciliation_status, ReconciliationStatus::Pending);
        assert_eq!(p.allocations[0].status, AllocationStatus::Pending);
    }

    #[test]
    fn test_apply_capture_nets_out_the_fee() {
        let mut p = PaymentState::new("ch", 100.0, "USD", vec![alloc("BTC", 100.0, 0.0)]).unwrap();
        p.apply_capture("cap_123", 3.20);
        assert_eq!(p.provider_id.as_deref(), Some("cap_123"));
        assert!((p.processing_fee - 3.20).abs() < 1e-9);
        assert!((p.net_amount - 96.80).abs() < 1e-9);
    }

    #[test]
    fn test_ledger_entry_carries_fill_detail() {
        let entry = LedgerEntry::new("fill", "BTC", 60.0, "order filled").with_fill(0.002, Some(30_000.0));
        assert!(!entry.transaction_id.is_empty());
        assert!((entry.quantity - 0.002).abs() < 1e-12);
        assert_eq!(entry.price, Some(30_000.0));
    }

    #[test]
    fn test_order_lookup_by_client_id() {
        let mut p = PaymentState::new("ch", 50.0, "USD", vec![alloc("ETH", 100.0, 50.0)]).unwrap();
        p.orders.push(ExchangeOrder::new("ord-a", "ETH", OrderSide::Buy, 50.0));
        assert!(p.order("ord-a").is_some());
        assert!(p.order("ord-b").is_none());
    }
}
