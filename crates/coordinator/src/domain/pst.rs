use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    domain::{
        order::{Order, OutputType, Outputs},
        state_machine::OrderState,
        store::OrderStore,
    },
    errors::AppError,
    infra::rpc::WalletRpcClient,
};

const SAT_PER_BTC: f64 = 100_000_000.0;
const MAX_SAT: i64 = 21_000_000_00_000_000; // 21e14
const RBF_SEQUENCE_CEILING: i64 = 0xffff_fffe;

fn btc_to_sat(amount: f64) -> i64 {
    (amount * SAT_PER_BTC).round() as i64
}

fn sat_to_btc(sat: i64) -> f64 {
    sat as f64 / SAT_PER_BTC
}

lazy_static! {
    static ref BECH32_ADDRESS_RE: Regex =
        Regex::new(r"^(bc1|tb1)[ac-hj-np-z02-9]{11,71}$").expect("valid bech32 address regex");
}

pub fn validate_address(address: &str) -> Result<(), AppError> {
    if !BECH32_ADDRESS_RE.is_match(address) {
        return Err(AppError::Validation(format!(
            "address {address} is not a valid bech32 address"
        )));
    }
    Ok(())
}

pub fn validate_sat_amount(sat: i64) -> Result<(), AppError> {
    if sat <= 0 || sat > MAX_SAT {
        return Err(AppError::Validation(format!(
            "amount {sat} sat is out of range"
        )));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ListUnspentEntry {
    txid: String,
    vout: i64,
    amount: f64,
    confirmations: i64,
    label: Option<String>,
}

async fn funded_utxos(
    rpc: &WalletRpcClient,
    order: &Order,
    min_conf: i64,
) -> Result<Vec<ListUnspentEntry>, AppError> {
    let entries: Vec<ListUnspentEntry> = rpc
        .call("listunspent", json!([min_conf, 9_999_999]))
        .await?;
    Ok(entries
        .into_iter()
        .filter(|e| e.label.as_deref() == Some(order.label.as_str()))
        .collect())
}

#[derive(Debug, Deserialize)]
struct FundedPsbtResult {
    psbt: String,
    fee: f64,
    changepos: i64,
}

/// Shared build path for payout/refund: `walletcreatefundedpsbt` with no permitted change
/// output, validated by decoding the result.
async fn build_single_purpose_psbt(
    rpc: &WalletRpcClient,
    order: &Order,
    outputs: &Outputs,
    rbf: bool,
    target_conf: i64,
) -> Result<(String, Outputs, i64), AppError> {
    let utxos = funded_utxos(rpc, order, order.min_conf).await?;
    let in_total: i64 = utxos.iter().map(|u| btc_to_sat(u.amount)).sum();
    let requested_total: i64 = outputs.values().sum();
    if in_total < requested_total {
        return Err(AppError::NoFundedUtxo);
    }

    let inputs: Vec<Value> = utxos
        .iter()
        .map(|u| json!({"txid": u.txid, "vout": u.vout}))
        .collect();
    let outputs_param: Vec<Value> = outputs
        .iter()
        .map(|(addr, sat)| json!({addr: sat_to_btc(*sat)}))
        .collect();

    let result: FundedPsbtResult = rpc
        .call(
            "walletcreatefundedpsbt",
            json!([
                inputs,
                outputs_param,
                0,
                {
                    "includeWatching": true,
                    "replaceable": rbf,
                    "conf_target": target_conf,
                    "subtractFeeFromOutputs": [0],
                },
                true
            ]),
        )
        .await?;

    if result.changepos != -1 {
        return Err(AppError::UnexpectedChange);
    }

    let decoded = decode_psbt(rpc, &result.psbt).await?;
    if decoded.outputs.len() != outputs.len()
        || decoded.outputs.keys().any(|addr| !outputs.contains_key(addr))
    {
        return Err(AppError::OutputsMismatch);
    }

    Ok((result.psbt, decoded.outputs, btc_to_sat(result.fee).abs()))
}

/// Build and persist a payout PST; advances the order to `signing`.
pub async fn build_payout(
    store: &OrderStore,
    rpc: &WalletRpcClient,
    order_id: &str,
    outputs: &Outputs,
    rbf: bool,
    target_conf: i64,
    deadline_ts: i64,
) -> Result<String, AppError> {
    for (addr, sat) in outputs {
        validate_address(addr)?;
        validate_sat_amount(*sat)?;
    }
    let order = store
        .get_order(order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

    let (psbt, decoded_outputs, _fee) =
        build_single_purpose_psbt(rpc, &order, outputs, rbf, target_conf).await?;

    let payout_amount = decoded_outputs.values().copied().sum::<i64>();
    if payout_amount != order.amount_sat {
        return Err(AppError::OutputsMismatch);
    }

    store
        .set_outputs(order_id, &decoded_outputs, OutputType::Payout)
        .await?;
    store
        .update_state(order_id, OrderState::Signing, None, Some(deadline_ts))
        .await?;
    Ok(psbt)
}

/// Build and persist a refund PST targeting a single address; advances the order to `signing`.
pub async fn build_refund(
    store: &OrderStore,
    rpc: &WalletRpcClient,
    order_id: &str,
    address: &str,
    rbf: bool,
    target_conf: i64,
    deadline_ts: i64,
) -> Result<String, AppError> {
    validate_address(address)?;
    let order = store
        .get_order(order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

    let utxos = funded_utxos(rpc, &order, order.min_conf).await?;
    let in_total: i64 = utxos.iter().map(|u| btc_to_sat(u.amount)).sum();
    if in_total == 0 {
        return Err(AppError::NoFundedUtxo);
    }

    let mut outputs = Outputs::new();
    outputs.insert(address.to_string(), in_total);
    let (psbt, decoded_outputs, _fee) =
        build_single_purpose_psbt(rpc, &order, &outputs, rbf, target_conf).await?;

    if decoded_outputs.len() != 1 || !decoded_outputs.contains_key(address) {
        return Err(AppError::OutputsMismatch);
    }

    store
        .set_outputs(order_id, &decoded_outputs, OutputType::Refund)
        .await?;
    store
        .update_state(order_id, OrderState::Signing, None, Some(deadline_ts))
        .await?;
    Ok(psbt)
}

/// `fee_sat` a payout of `address` would incur, without persisting anything.
pub async fn payout_quote(
    store: &OrderStore,
    rpc: &WalletRpcClient,
    order_id: &str,
    address: &str,
    rbf: bool,
    target_conf: i64,
) -> Result<i64, AppError> {
    validate_address(address)?;
    let order = store
        .get_order(order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;
    let mut outputs = Outputs::new();
    outputs.insert(address.to_string(), order.amount_sat);
    let (_psbt, _outputs, fee) =
        build_single_purpose_psbt(rpc, &order, &outputs, rbf, target_conf).await?;
    Ok(fee)
}

/// Combines base64 PST fragments; if `order_id` is supplied, persists the union with prior
/// partials (deduplicated on equal fragment).
pub async fn merge(
    store: &OrderStore,
    rpc: &WalletRpcClient,
    order_id: Option<&str>,
    partials: &[String],
) -> Result<String, AppError> {
    for p in partials {
        BASE64
            .decode(p)
            .map_err(|_| AppError::Validation("partial is not valid base64".to_string()))?;
    }

    let mut all = Vec::new();
    if let Some(order_id) = order_id {
        all.extend(store.get_partials(order_id).await?);
    }
    for p in partials {
        if !all.contains(p) {
            all.push(p.clone());
        }
    }
    if let Some(order_id) = order_id {
        store.save_partials(order_id, &all).await?;
    }

    rpc.call("combinepsbt", json!([all])).await
}

pub struct DecodeResult {
    pub sign_count: i64,
    pub outputs: Outputs,
    pub fee_sat: i64,
}

#[derive(Debug, Deserialize)]
struct ScriptPubKey {
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DecodedVout {
    value: f64,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: ScriptPubKey,
}

#[derive(Debug, Deserialize)]
struct DecodedVin {
    txid: String,
    vout: i64,
    sequence: i64,
}

#[derive(Debug, Deserialize)]
struct DecodedTx {
    vin: Vec<DecodedVin>,
    vout: Vec<DecodedVout>,
}

#[derive(Debug, Deserialize, Default)]
struct DecodedInput {
    #[serde(default)]
    partial_signatures: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct RawDecodedPsbt {
    tx: DecodedTx,
    #[serde(default)]
    inputs: Vec<DecodedInput>,
    fee: Option<f64>,
}

struct DecodedPsbt {
    vin: Vec<DecodedVin>,
    outputs: Outputs,
    sign_count: i64,
    fee_sat: Option<i64>,
}

async fn decode_psbt(rpc: &WalletRpcClient, psbt: &str) -> Result<DecodedPsbt, AppError> {
    let raw: RawDecodedPsbt = rpc.call("decodepsbt", json!([psbt])).await?;
    let mut outputs = Outputs::new();
    for vout in &raw.tx.vout {
        if let Some(addr) = &vout.script_pub_key.address {
            outputs.insert(addr.clone(), btc_to_sat(vout.value));
        } else {
            return Err(AppError::OutputsMismatch);
        }
    }
    let sign_count: i64 = raw
        .inputs
        .iter()
        .map(|i| i.partial_signatures.as_ref().map(|m| m.len()).unwrap_or(0) as i64)
        .sum();
    Ok(DecodedPsbt {
        vin: raw.tx.vin,
        outputs,
        sign_count,
        fee_sat: raw.fee.map(btc_to_sat),
    })
}

/// The ordered `(txid, vout)` pairs a PST spends, for the RBF input-equality check.
pub async fn input_outpoints(rpc: &WalletRpcClient, psbt: &str) -> Result<Vec<(String, i64)>, AppError> {
    let decoded = decode_psbt(rpc, psbt).await?;
    Ok(decoded
        .vin
        .into_iter()
        .map(|v| (v.txid, v.vout))
        .collect())
}

/// Whether every input in a PST declares a replaceable sequence (`< 0xfffffffe`).
pub async fn all_inputs_replaceable(rpc: &WalletRpcClient, psbt: &str) -> Result<bool, AppError> {
    let decoded = decode_psbt(rpc, psbt).await?;
    Ok(decoded.vin.iter().all(|v| v.sequence < RBF_SEQUENCE_CEILING))
}

/// Observability-only: decode a PST into its sign count, committed outputs, and fee.
pub async fn decode(rpc: &WalletRpcClient, psbt: &str) -> Result<DecodeResult, AppError> {
    let decoded = decode_psbt(rpc, psbt).await?;
    Ok(DecodeResult {
        sign_count: decoded.sign_count,
        outputs: decoded.outputs,
        fee_sat: decoded.fee_sat.unwrap_or(0),
    })
}

pub struct FinalizeResult {
    pub hex: String,
    pub fee_sat: i64,
}

/// The validator. Any failure is fatal and mutates no state; the caller-supplied terminal
/// state is only ever applied by `broadcast`, so state and broadcast succeed or fail together.
pub async fn finalize(
    store: &OrderStore,
    rpc: &WalletRpcClient,
    order_id: Option<&str>,
    psbt: &str,
    requested_state: OrderState,
) -> Result<FinalizeResult, AppError> {
    if psbt.is_empty() {
        if order_id.is_some() && requested_state == OrderState::Dispute {
            if let Some(order_id) = order_id {
                store
                    .update_state(order_id, OrderState::Dispute, None, None)
                    .await?;
            }
            return Ok(FinalizeResult {
                hex: String::new(),
                fee_sat: 0,
            });
        }
        return Err(AppError::Validation("missing psbt".to_string()));
    }

    let decoded = decode_psbt(rpc, psbt).await?;

    let commitment: Outputs = match order_id {
        Some(order_id) => store
            .get_outputs(order_id)
            .await?
            .filter(|o| !o.is_empty())
            .ok_or(AppError::OutputsMismatch)?,
        None => decoded.outputs.clone(),
    };

    let order = match order_id {
        Some(order_id) => Some(
            store
                .get_order(order_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?,
        ),
        None => None,
    };

    let mut in_total = 0i64;
    for vin in &decoded.vin {
        if vin.sequence >= RBF_SEQUENCE_CEILING {
            return Err(AppError::RbfDisabled);
        }
        if let Some(order) = &order {
            let tx: Value = rpc.call("gettransaction", json!([vin.txid, true])).await?;
            let matches_label = tx
                .get("details")
                .and_then(Value::as_array)
                .map(|details| {
                    details.iter().any(|d| {
                        d.get("vout").and_then(Value::as_i64) == Some(vin.vout)
                            && d.get("label").and_then(Value::as_str) == Some(order.label.as_str())
                    })
                })
                .unwrap_or(false);
            if !matches_label {
                return Err(AppError::NoFundedUtxo);
            }
        }
        let txout: Option<Value> = rpc
            .call("gettxout", json!([vin.txid, vin.vout]))
            .await
            .ok()
            .flatten();
        let value_btc = txout
            .as_ref()
            .and_then(|t| t.get("value"))
            .and_then(Value::as_f64)
            .ok_or(AppError::MissingInputValue)?;
        in_total += btc_to_sat(value_btc);
    }

    if decoded.outputs != commitment {
        return Err(AppError::OutputsMismatch);
    }

    let out_total: i64 = commitment.values().sum();
    let fee = in_total - out_total;
    if fee < 0 {
        return Err(AppError::NegativeFee(fee));
    }
    if let Some(decoded_fee) = decoded.fee_sat {
        if (decoded_fee - fee).abs() > 1 {
            return Err(AppError::FeeMismatch {
                decoded: decoded_fee,
                computed: fee,
            });
        }
    }

    if let Some(order) = &order {
        let utxos = funded_utxos(rpc, order, 0).await?;
        let funded_total: i64 = utxos.iter().map(|u| btc_to_sat(u.amount)).sum();
        if out_total + fee > funded_total {
            return Err(AppError::ExceedsFunding);
        }
    }

    #[derive(Deserialize)]
    struct FinalizedPsbt {
        hex: Option<String>,
        complete: bool,
    }
    let finalized: FinalizedPsbt = rpc.call("finalizepsbt", json!([psbt])).await?;
    if !finalized.complete {
        return Err(AppError::NotEnoughSignatures(
            "finalizepsbt did not report complete".to_string(),
        ));
    }

    Ok(FinalizeResult {
        hex: finalized.hex.unwrap_or_default(),
        fee_sat: fee,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_validation_accepts_bech32_and_rejects_others() {
        assert!(validate_address("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq").is_ok());
        assert!(validate_address("tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx").is_ok());
        assert!(validate_address("1BoatSLRHtKNngkdXEeobR76b53LETtpyT").is_err());
        assert!(validate_address("not-an-address").is_err());
    }

    #[test]
    fn sat_amount_validation_bounds() {
        assert!(validate_sat_amount(0).is_err());
        assert!(validate_sat_amount(-5).is_err());
        assert!(validate_sat_amount(1).is_ok());
        assert!(validate_sat_amount(MAX_SAT).is_ok());
        assert!(validate_sat_amount(MAX_SAT + 1).is_err());
    }

    #[test]
    fn btc_sat_roundtrip() {
        assert_eq!(btc_to_sat(0.0006), 60_000);
        assert_eq!(sat_to_btc(60_000), 0.0006);
    }
}
