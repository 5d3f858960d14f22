use serde::Deserialize;
use serde_json::json;

use crate::{
    domain::{
        order::{FundingSnapshot, Order},
        state_machine::{self, OrderState},
        store::OrderStore,
    },
    errors::AppError,
    infra::rpc::WalletRpcClient,
};

const SAT_PER_BTC: f64 = 100_000_000.0;

#[derive(Debug, Deserialize)]
struct ListUnspentEntry {
    txid: String,
    vout: i64,
    amount: f64,
    confirmations: i64,
    label: Option<String>,
}

fn btc_to_sat(amount: f64) -> i64 {
    (amount * SAT_PER_BTC).round() as i64
}

/// Pure aggregation over an order's labelled UTXOs: total value, minimum confirmation count,
/// and the first UTXO recorded as the order's funding reference.
fn aggregate(order: &Order, entries: &[ListUnspentEntry]) -> FundingSnapshot {
    let mut total_sat = 0i64;
    let mut min_conf: Option<i64> = None;
    let mut first: Option<(&ListUnspentEntry, i64)> = None;

    for entry in entries {
        if entry.label.as_deref() != Some(order.label.as_str()) {
            continue;
        }
        let sat = btc_to_sat(entry.amount);
        total_sat += sat;
        min_conf = Some(min_conf.map_or(entry.confirmations, |m: i64| m.min(entry.confirmations)));
        if first.is_none() {
            first = Some((entry, sat));
        }
    }

    let expected = order.expected_gross_sat();
    let shortfall_sat = if total_sat < expected {
        Some(expected - total_sat)
    } else {
        None
    };

    FundingSnapshot {
        funding_txid: first.map(|(e, _)| e.txid.clone()),
        vout: first.map(|(e, _)| e.vout),
        confirmations: min_conf,
        total_sat,
        shortfall_sat,
    }
}

fn is_promotable(order: &Order, snapshot: &FundingSnapshot) -> bool {
    let expected = order.expected_gross_sat();
    let tolerance = order.funding_tolerance_sat();
    let confs = snapshot.confirmations.unwrap_or(0);
    confs >= order.min_conf && snapshot.total_sat + tolerance >= expected
}

/// Pull-based reconciliation invoked from `GET /orders/{id}/status`. Enumerates unspent
/// outputs carrying this order's label (client-side filtered; the wallet's native label
/// filter is unreliable) and promotes to `escrow_funded` when the deposit is sufficient.
pub async fn reconcile(
    store: &OrderStore,
    rpc: &WalletRpcClient,
    order_id: &str,
) -> Result<(Order, FundingSnapshot), AppError> {
    let order = store
        .get_order(order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

    let entries: Vec<ListUnspentEntry> = rpc
        .call("listunspent", json!([0, 9_999_999]))
        .await
        .unwrap_or_default();

    let snapshot = aggregate(&order, &entries);
    if !entries.is_empty() {
        store.update_funding(order_id, &snapshot).await?;
    }

    let promoted = order.state == OrderState::AwaitingDeposit
        && is_promotable(&order, &snapshot)
        && state_machine::allowed(order.state, OrderState::EscrowFunded);

    let updated = if promoted {
        let deadline = None; // escrow_funded does not itself stamp a deadline; signing does.
        store
            .update_state(
                order_id,
                OrderState::EscrowFunded,
                snapshot.confirmations,
                deadline,
            )
            .await?
    } else {
        order
    };

    Ok((updated, snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn sample_order() -> Order {
        Order {
            order_id: "order1".into(),
            descriptor: "wsh(sortedmulti(2,...))".into(),
            index: 0,
            label: "escrow:order1".into(),
            min_conf: 2,
            amount_sat: 60_000,
            fee_est_sat: 1_500,
            state: OrderState::AwaitingDeposit,
            funding_txid: None,
            vout: None,
            confirmations: None,
            partials: vec![],
            outputs: None,
            output_type: None,
            payout_txid: None,
            deadline_ts: None,
            rbf_psbt: None,
            rbf_partials: vec![],
            rbf_state: None,
            last_webhook_ts: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn promotion_requires_confirmations_and_amount() {
        let order = sample_order();
        let entries = vec![ListUnspentEntry {
            txid: "abc".into(),
            vout: 0,
            amount: 0.000665, // 66_500 sat
            confirmations: 2,
            label: Some("escrow:order1".into()),
        }];
        let snapshot = aggregate(&order, &entries);
        assert_eq!(snapshot.total_sat, 66_500);
        assert!(is_promotable(&order, &snapshot));
    }

    #[test]
    fn underfunded_deposit_reports_shortfall_and_stays_unpromoted() {
        let order = sample_order();
        let entries = vec![ListUnspentEntry {
            txid: "abc".into(),
            vout: 0,
            amount: 0.0006, // 60_000 sat
            confirmations: 2,
            label: Some("escrow:order1".into()),
        }];
        let snapshot = aggregate(&order, &entries);
        assert_eq!(snapshot.total_sat, 60_000);
        assert_eq!(snapshot.shortfall_sat, Some(1_500));
        assert!(!is_promotable(&order, &snapshot));
    }

    #[test]
    fn unlabelled_utxos_are_ignored() {
        let order = sample_order();
        let entries = vec![ListUnspentEntry {
            txid: "other".into(),
            vout: 0,
            amount: 1.0,
            confirmations: 10,
            label: Some("escrow:someone-else".into()),
        }];
        let snapshot = aggregate(&order, &entries);
        assert_eq!(snapshot.total_sat, 0);
    }

    #[test]
    fn insufficient_confirmations_blocks_promotion() {
        let order = sample_order();
        let entries = vec![ListUnspentEntry {
            txid: "abc".into(),
            vout: 0,
            amount: 0.000665,
            confirmations: 1,
            label: Some("escrow:order1".into()),
        }];
        let snapshot = aggregate(&order, &entries);
        assert!(!is_promotable(&order, &snapshot));
    }
}
