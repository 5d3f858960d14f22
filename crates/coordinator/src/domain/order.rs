use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::domain::state_machine::OrderState;

/// Satoshi-denominated outputs committed to at `signing` entry: address -> amount.
pub type Outputs = BTreeMap<String, i64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    Payout,
    Refund,
}

impl std::fmt::Display for OutputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputType::Payout => write!(f, "payout"),
            OutputType::Refund => write!(f, "refund"),
        }
    }
}

impl std::str::FromStr for OutputType {
    type Err = crate::errors::AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payout" => Ok(OutputType::Payout),
            "refund" => Ok(OutputType::Refund),
            other => Err(crate::errors::AppError::Validation(format!(
                "unknown output_type: {other}"
            ))),
        }
    }
}

/// Last observed funding snapshot for an order, as reconciled by the funding watcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FundingSnapshot {
    pub funding_txid: Option<String>,
    pub vout: Option<i64>,
    pub confirmations: Option<i64>,
    pub total_sat: i64,
    pub shortfall_sat: Option<i64>,
}

/// The sole aggregate: one row per escrow order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub descriptor: String,
    pub index: i64,
    pub label: String,
    pub min_conf: i64,
    pub amount_sat: i64,
    pub fee_est_sat: i64,
    pub state: OrderState,
    pub funding_txid: Option<String>,
    pub vout: Option<i64>,
    pub confirmations: Option<i64>,
    pub partials: Vec<String>,
    pub outputs: Option<Outputs>,
    pub output_type: Option<OutputType>,
    pub payout_txid: Option<String>,
    pub deadline_ts: Option<i64>,
    pub rbf_psbt: Option<String>,
    pub rbf_partials: Vec<String>,
    pub rbf_state: Option<OrderState>,
    pub last_webhook_ts: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Order {
    pub fn label_for(order_id: &str) -> String {
        format!("escrow:{order_id}")
    }

    /// Gross amount expected to land in the escrow address: the payout amount plus
    /// the coordinator's own fee estimate, used as the funding-promotion threshold.
    pub fn expected_gross_sat(&self) -> i64 {
        self.amount_sat + self.fee_est_sat
    }

    /// 0.5% tolerance on the expected gross amount (floor), per the funding watcher.
    pub fn funding_tolerance_sat(&self) -> i64 {
        (self.expected_gross_sat() as f64 * 0.005).floor() as i64
    }
}

/// The unsigned `wsh(sortedmulti(2, ...))` body; the caller appends `#<checksum>` from
/// `getdescriptorinfo` to get the canonical descriptor.
pub fn descriptor_template(xpub_buyer: &str, xpub_seller: &str, xpub_escrow: &str, index: i64) -> String {
    format!(
        "wsh(sortedmulti(2,{xpub_buyer}/0/{index},{xpub_seller}/0/{index},{xpub_escrow}/0/{index}))"
    )
}

/// `order_id` must be <=32 chars drawn from `[A-Za-z0-9_-]`.
pub fn validate_order_id(order_id: &str) -> Result<(), crate::errors::AppError> {
    if order_id.is_empty() || order_id.len() > 32 {
        return Err(crate::errors::AppError::Validation(format!(
            "order_id must be 1-32 chars, got {} chars",
            order_id.len()
        )));
    }
    if !order_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(crate::errors::AppError::Validation(
            "order_id must match [A-Za-z0-9_-]".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_is_namespaced() {
        assert_eq!(Order::label_for("order1"), "escrow:order1");
    }

    #[test]
    fn descriptor_template_derives_single_index_per_party() {
        let template = descriptor_template("xpubB", "xpubS", "xpubE", 3);
        assert_eq!(template, "wsh(sortedmulti(2,xpubB/0/3,xpubS/0/3,xpubE/0/3))");
    }

    #[test]
    fn order_id_validation_accepts_valid() {
        assert!(validate_order_id("order1").is_ok());
        assert!(validate_order_id("Order-1_23").is_ok());
    }

    #[test]
    fn order_id_validation_rejects_bad_chars_and_length() {
        assert!(validate_order_id("").is_err());
        assert!(validate_order_id(&"a".repeat(33)).is_err());
        assert!(validate_order_id("order!1").is_err());
        assert!(validate_order_id("order 1").is_err());
    }

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
    fn expected_gross_and_tolerance() {
        let order = sample_order();
        assert_eq!(order.expected_gross_sat(), 61_500);
        assert_eq!(order.funding_tolerance_sat(), 307);
    }
}
