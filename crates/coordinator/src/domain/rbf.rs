use serde::Deserialize;
use serde_json::json;

use crate::{
    domain::{pst, store::OrderStore},
    errors::AppError,
    infra::rpc::WalletRpcClient,
};

#[derive(Debug, Deserialize)]
struct BumpFeeResult {
    psbt: String,
}

/// `POST /tx/bumpfee`: asks the wallet to fee-bump the order's current `payout_txid`,
/// staging the result as a nested signing round (`rbf_signing`).
pub async fn bumpfee(
    store: &OrderStore,
    rpc: &WalletRpcClient,
    order_id: &str,
    target_conf: i64,
) -> Result<String, AppError> {
    let order = store
        .get_order(order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;
    let txid = order
        .payout_txid
        .ok_or_else(|| AppError::Validation("order has no payout_txid to bump".to_string()))?;

    let result: BumpFeeResult = rpc
        .call(
            "bumpfee",
            json!([txid, {"conf_target": target_conf, "psbt": true}]),
        )
        .await?;

    store.start_rbf(order_id, &result.psbt).await?;
    Ok(result.psbt)
}

/// `POST /tx/bumpfee/finalize`: validates the signed bump PST against the staged one and
/// the order's output commitment, then broadcasts and restores the order's prior state.
pub async fn bumpfee_finalize(
    store: &OrderStore,
    rpc: &WalletRpcClient,
    order_id: &str,
    signed_psbt: &str,
) -> Result<String, AppError> {
    let staged = store
        .get_rbf_psbt(order_id)
        .await?
        .ok_or_else(|| AppError::Validation("no rbf round in progress".to_string()))?;

    let staged_inputs = pst::input_outpoints(rpc, &staged).await?;
    let signed_inputs = pst::input_outpoints(rpc, signed_psbt).await?;
    if staged_inputs != signed_inputs {
        return Err(AppError::Validation(
            "bumpfee finalize inputs do not match the staged rbf psbt".to_string(),
        ));
    }
    if !pst::all_inputs_replaceable(rpc, signed_psbt).await? {
        return Err(AppError::RbfDisabled);
    }

    let finalize_result = pst::finalize(
        store,
        rpc,
        Some(order_id),
        signed_psbt,
        crate::domain::state_machine::OrderState::Completed,
    )
    .await?;

    let txid: String = rpc
        .call("sendrawtransaction", json!([finalize_result.hex]))
        .await?;

    store.set_payout_txid(order_id, &txid).await?;
    store.clear_rbf(order_id).await?;
    Ok(txid)
}
