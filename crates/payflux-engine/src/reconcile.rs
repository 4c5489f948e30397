use std::collections::BTreeMap;

use chrono::Utc;

use payflux_core::payment::{
    AssetReconciliation, PaymentState, ReconciliationDetails, ReconciliationStatus,
};

/// Compare what a payment was supposed to buy against what its orders
/// actually filled.
///
/// Status rules:
/// - Pending while no orders exist or any order is still in flight
/// - Failed when orders went out but nothing filled
/// - Complete when every asset's variance is within `tolerance`
/// - Partial otherwise
pub fn reconcile(payment: &PaymentState, tolerance: f64) -> ReconciliationDetails {
    // BTreeMap keeps asset rows in a stable order so repeated runs
    // over the same state produce identical reports.
    let mut expected: BTreeMap<&str, f64> = BTreeMap::new();
    for allocation in &payment.allocations {
        *expected.entry(allocation.asset.as_str()).or_default() += allocation.amount;
    }

    let mut ordered: BTreeMap<&str, f64> = BTreeMap::new();
    let mut filled: BTreeMap<&str, f64> = BTreeMap::new();
    let mut order_counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut in_flight: BTreeMap<&str, bool> = BTreeMap::new();
    for order in &payment.orders {
        *ordered.entry(order.asset.as_str()).or_default() += order.amount;
        *filled.entry(order.asset.as_str()).or_default() += order.filled_amount;
        *order_counts.entry(order.asset.as_str()).or_default() += 1;
        if !order.status.is_terminal() {
            in_flight.insert(order.asset.as_str(), true);
        }
    }

    // Every asset seen on either side gets a row; an order for an
    // unallocated asset shows up with expected 0.
    let mut asset_names: Vec<&str> = expected.keys().copied().collect();
    for asset in ordered.keys() {
        if !expected.contains_key(asset) {
            asset_names.push(asset);
        }
    }

    let assets: Vec<AssetReconciliation> = asset_names
        .iter()
        .map(|asset| {
            let expected = expected.get(asset).copied().unwrap_or(0.0);
            let ordered = ordered.get(asset).copied().unwrap_or(0.0);
            let filled = filled.get(asset).copied().unwrap_or(0.0);
            let variance = expected - filled;
            let within_tolerance = variance.abs() <= tolerance;
            let status = if in_flight.get(asset).copied().unwrap_or(false) {
                ReconciliationStatus::Pending
            } else if within_tolerance {
                ReconciliationStatus::Complete
            } else if filled.abs() <= tolerance && ordered > tolerance {
                ReconciliationStatus::Failed
            } else {
                ReconciliationStatus::Partial
            };
            AssetReconciliation {
                asset: asset.to_string(),
                expected,
                ordered,
                filled,
                variance,
                order_count: order_counts.get(asset).copied().unwrap_or(0),
                within_tolerance,
                status,
            }
        })
        .collect();

    let total_expected: f64 = assets.iter().map(|a| a.expected).sum();
    let total_ordered: f64 = assets.iter().map(|a| a.ordered).sum();
    let total_filled: f64 = assets.iter().map(|a| a.filled).sum();
    let total_variance = total_expected - total_filled;

    let status = if payment.orders.is_empty() || !payment.orders_terminal() {
        ReconciliationStatus::Pending
    } else if total_filled.abs() <= tolerance {
        ReconciliationStatus::Failed
    } else if assets.iter().all(|a| a.within_tolerance) {
        ReconciliationStatus::Complete
    } else {
        ReconciliationStatus::Partial
    };

    ReconciliationDetails {
        status,
        total_expected,
        total_ordered,
        total_filled,
        total_variance,
        tolerance,
        assets,
        computed_at: Utc::now(),
    }
}
