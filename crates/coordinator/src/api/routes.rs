use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    domain::{
        deadline,
        funding,
        order::{validate_order_id, Order, Outputs},
        pst, rbf,
        state_machine::OrderState,
        webhook::WebhookEvent,
    },
    errors::AppError,
    metrics::PENDING_SIGNATURES,
    startup::AppState,
};

pub async fn live() -> Json<serde_json::Value> {
    Json(json!({"ok": true}))
}

#[derive(Serialize)]
pub struct HealthRes {
    ok: bool,
    db: bool,
    rpc: bool,
    webhook_queue: bool,
}

pub async fn health(State(state): State<Arc<AppState>>) -> (axum::http::StatusCode, Json<HealthRes>) {
    let db_ok = state.store.count_pending_signatures().await.is_ok();
    let rpc_ok = state
        .rpc
        .call::<serde_json::Value>("getblockchaininfo", json!([]))
        .await
        .is_ok();
    let webhook_ok = state.webhooks.is_healthy();

    let ok = db_ok && rpc_ok && webhook_ok;
    let status = if ok {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthRes {
            ok,
            db: db_ok,
            rpc: rpc_ok,
            webhook_queue: webhook_ok,
        }),
    )
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Result<String, AppError> {
    refresh_pending_signatures_gauge(&state).await;
    crate::metrics::render().map_err(|e| AppError::Unavailable(e.to_string()))
}

#[derive(Deserialize)]
pub struct CreateOrderReq {
    pub order_id: Option<String>,
    pub xpub_buyer: String,
    pub xpub_seller: String,
    pub xpub_escrow: String,
    pub amount_sat: i64,
    pub fee_est_sat: i64,
    pub min_conf: Option<i64>,
    pub index: Option<i64>,
}

#[derive(Serialize)]
pub struct CreateOrderRes {
    pub order_id: String,
    pub descriptor: String,
    pub address: String,
    pub index: i64,
    pub min_conf: i64,
    pub amount_sat: i64,
    pub fee_est_sat: i64,
    pub state: OrderState,
}

pub async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateOrderReq>,
) -> Result<Json<CreateOrderRes>, AppError> {
    let order_id = req
        .order_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    validate_order_id(&order_id)?;

    if let Some(existing) = state.store.get_order(&order_id).await? {
        let addresses: Vec<String> = state
            .rpc
            .call(
                "deriveaddresses",
                json!([existing.descriptor, [existing.index, existing.index]]),
            )
            .await?;
        let address = addresses.into_iter().next().unwrap_or_default();
        return Ok(Json(to_create_order_res(&existing, address)));
    }

    let index = match req.index {
        Some(i) => i,
        None => state.store.next_index().await?,
    };

    let template = crate::domain::order::descriptor_template(
        &req.xpub_buyer,
        &req.xpub_seller,
        &req.xpub_escrow,
        index,
    );

    #[derive(Deserialize)]
    struct DescriptorInfo {
        checksum: String,
    }
    let info: DescriptorInfo = state
        .rpc
        .call("getdescriptorinfo", json!([template]))
        .await?;
    let descriptor = format!("{template}#{}", info.checksum);

    let label = Order::label_for(&order_id);
    state
        .rpc
        .call::<serde_json::Value>(
            "importdescriptors",
            json!([[{
                "desc": descriptor,
                "active": false,
                "range": [index, index],
                "next_index": index,
                "timestamp": "now",
                "label": label,
                "watchonly": true,
            }]]),
        )
        .await?;

    let addresses: Vec<String> = state
        .rpc
        .call("deriveaddresses", json!([descriptor, [index, index]]))
        .await?;
    let address = addresses
        .into_iter()
        .next()
        .ok_or_else(|| AppError::Unavailable("wallet returned no derived address".to_string()))?;

    let order = Order {
        order_id: order_id.clone(),
        descriptor: descriptor.clone(),
        index,
        label,
        min_conf: req.min_conf.unwrap_or(2),
        amount_sat: req.amount_sat,
        fee_est_sat: req.fee_est_sat,
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
        created_at: time::OffsetDateTime::now_utc(),
    };
    let saved = state.store.upsert_order(&order).await?;

    Ok(Json(CreateOrderRes {
        order_id: saved.order_id,
        descriptor,
        address,
        index: saved.index,
        min_conf: saved.min_conf,
        amount_sat: saved.amount_sat,
        fee_est_sat: saved.fee_est_sat,
        state: saved.state,
    }))
}

fn to_create_order_res(order: &Order, address: String) -> CreateOrderRes {
    CreateOrderRes {
        order_id: order.order_id.clone(),
        descriptor: order.descriptor.clone(),
        address,
        index: order.index,
        min_conf: order.min_conf,
        amount_sat: order.amount_sat,
        fee_est_sat: order.fee_est_sat,
        state: order.state,
    }
}

#[derive(Serialize)]
pub struct StatusRes {
    pub order_id: String,
    pub state: OrderState,
    pub funding: FundingView,
    pub deadline_ts: Option<i64>,
    pub payout_txid: Option<String>,
}

#[derive(Serialize)]
pub struct FundingView {
    pub funding_txid: Option<String>,
    pub vout: Option<i64>,
    pub confirmations: Option<i64>,
    pub total_sat: i64,
    pub shortfall_sat: Option<i64>,
}

pub async fn order_status(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<Json<StatusRes>, AppError> {
    let was_funded = state
        .store
        .get_order(&order_id)
        .await?
        .map(|o| o.state != OrderState::AwaitingDeposit)
        .unwrap_or(false);

    let (order, snapshot) = funding::reconcile(&state.store, &state.rpc, &order_id).await?;

    if !was_funded && order.state == OrderState::EscrowFunded {
        state.webhooks.enqueue(WebhookEvent::new(
            order_id.as_str(),
            "escrow_funded",
            json!({
                "order_id": order_id,
                "event": "escrow_funded",
                "utxos": [{"txid": snapshot.funding_txid, "vout": snapshot.vout}],
                "total_sat": snapshot.total_sat,
                "confs": snapshot.confirmations,
            }),
        ));
    }

    Ok(Json(StatusRes {
        order_id: order.order_id,
        state: order.state,
        funding: FundingView {
            funding_txid: order.funding_txid,
            vout: order.vout,
            confirmations: order.confirmations,
            total_sat: snapshot.total_sat,
            shortfall_sat: snapshot.shortfall_sat,
        },
        deadline_ts: order.deadline_ts,
        payout_txid: order.payout_txid,
    }))
}

#[derive(Deserialize)]
pub struct PayoutQuoteReq {
    pub address: String,
    #[serde(default)]
    pub rbf: bool,
    #[serde(default = "default_target_conf")]
    pub target_conf: i64,
}

fn default_target_conf() -> i64 {
    6
}

#[derive(Serialize)]
pub struct FeeRes {
    pub fee_sat: i64,
}

pub async fn payout_quote(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
    Json(req): Json<PayoutQuoteReq>,
) -> Result<Json<FeeRes>, AppError> {
    let fee_sat = pst::payout_quote(
        &state.store,
        &state.rpc,
        &order_id,
        &req.address,
        req.rbf,
        req.target_conf,
    )
    .await?;
    Ok(Json(FeeRes { fee_sat }))
}

#[derive(Deserialize)]
pub struct PstBuildReq {
    pub order_id: String,
    pub outputs: Outputs,
    #[serde(default)]
    pub rbf: bool,
    #[serde(default = "default_target_conf")]
    pub target_conf: i64,
}

#[derive(Serialize)]
pub struct PsbtRes {
    pub psbt: String,
}

pub async fn psbt_build(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PstBuildReq>,
) -> Result<Json<PsbtRes>, AppError> {
    let deadline_ts = deadline::compute_deadline(state.deadline_settings.signing_deadline_days);
    let psbt = pst::build_payout(
        &state.store,
        &state.rpc,
        &req.order_id,
        &req.outputs,
        req.rbf,
        req.target_conf,
        deadline_ts,
    )
    .await?;
    Ok(Json(PsbtRes { psbt }))
}

#[derive(Deserialize)]
pub struct PstRefundReq {
    pub order_id: String,
    pub address: String,
    #[serde(default)]
    pub rbf: bool,
    #[serde(default = "default_target_conf")]
    pub target_conf: i64,
}

pub async fn psbt_build_refund(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PstRefundReq>,
) -> Result<Json<PsbtRes>, AppError> {
    let deadline_ts = deadline::compute_deadline(state.deadline_settings.signing_deadline_days);
    let psbt = pst::build_refund(
        &state.store,
        &state.rpc,
        &req.order_id,
        &req.address,
        req.rbf,
        req.target_conf,
        deadline_ts,
    )
    .await?;
    Ok(Json(PsbtRes { psbt }))
}

#[derive(Deserialize)]
pub struct PsbtMergeReq {
    pub order_id: Option<String>,
    pub partials: Vec<String>,
}

pub async fn psbt_merge(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PsbtMergeReq>,
) -> Result<Json<PsbtRes>, AppError> {
    let psbt = pst::merge(
        &state.store,
        &state.rpc,
        req.order_id.as_deref(),
        &req.partials,
    )
    .await?;
    Ok(Json(PsbtRes { psbt }))
}

#[derive(Deserialize)]
pub struct PsbtDecodeReq {
    pub psbt: String,
}

#[derive(Serialize)]
pub struct PsbtDecodeRes {
    pub sign_count: i64,
    pub outputs: Outputs,
    pub fee_sat: i64,
}

pub async fn psbt_decode(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PsbtDecodeReq>,
) -> Result<Json<PsbtDecodeRes>, AppError> {
    let decoded = pst::decode(&state.rpc, &req.psbt).await?;
    Ok(Json(PsbtDecodeRes {
        sign_count: decoded.sign_count,
        outputs: decoded.outputs,
        fee_sat: decoded.fee_sat,
    }))
}

#[derive(Deserialize)]
pub struct PsbtFinalizeReq {
    pub order_id: Option<String>,
    pub psbt: String,
    pub state: OrderState,
}

#[derive(Serialize)]
pub struct FinalizeRes {
    pub hex: String,
    pub fee_sat: i64,
}

pub async fn psbt_finalize(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PsbtFinalizeReq>,
) -> Result<Json<FinalizeRes>, AppError> {
    let result = pst::finalize(
        &state.store,
        &state.rpc,
        req.order_id.as_deref(),
        &req.psbt,
        req.state,
    )
    .await?;
    Ok(Json(FinalizeRes {
        hex: result.hex,
        fee_sat: result.fee_sat,
    }))
}

#[derive(Deserialize)]
pub struct BroadcastReq {
    pub hex: String,
    pub order_id: Option<String>,
    pub state: OrderState,
}

#[derive(Serialize)]
pub struct TxidRes {
    pub txid: String,
}

pub async fn tx_broadcast(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BroadcastReq>,
) -> Result<Json<TxidRes>, AppError> {
    let txid: String = state
        .rpc
        .call("sendrawtransaction", json!([req.hex]))
        .await?;

    if let Some(order_id) = &req.order_id {
        state.store.set_payout_txid(order_id, &txid).await?;

        if !matches!(
            req.state,
            OrderState::Completed | OrderState::Refunded | OrderState::Dispute
        ) {
            return Err(AppError::Validation("invalid final state".to_string()));
        }

        let order = state
            .store
            .update_state(order_id, req.state, None, None)
            .await?;

        if order.last_webhook_ts.is_none() {
            let event_name = match req.state {
                OrderState::Completed => "settled".to_string(),
                OrderState::Refunded => "refunded".to_string(),
                other => other.to_string(),
            };
            state.webhooks.enqueue(WebhookEvent::new(
                order_id.as_str(),
                event_name.clone(),
                json!({"order_id": order_id, "event": event_name, "txid": txid}),
            ));
        }
    }

    Ok(Json(TxidRes { txid }))
}

#[derive(Deserialize)]
pub struct BumpFeeReq {
    pub order_id: String,
    pub target_conf: i64,
}

pub async fn tx_bumpfee(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BumpFeeReq>,
) -> Result<Json<PsbtRes>, AppError> {
    let psbt = rbf::bumpfee(&state.store, &state.rpc, &req.order_id, req.target_conf).await?;
    Ok(Json(PsbtRes { psbt }))
}

#[derive(Deserialize)]
pub struct BumpFeeFinalizeReq {
    pub order_id: String,
    pub psbt: String,
}

pub async fn tx_bumpfee_finalize(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BumpFeeFinalizeReq>,
) -> Result<Json<TxidRes>, AppError> {
    let txid = rbf::bumpfee_finalize(&state.store, &state.rpc, &req.order_id, &req.psbt).await?;
    Ok(Json(TxidRes { txid }))
}

/// Refreshes the pending-signatures gauge; called opportunistically from `GET /metrics`.
async fn refresh_pending_signatures_gauge(state: &AppState) {
    match state.store.count_pending_signatures().await {
        Ok(count) => PENDING_SIGNATURES.set(count),
        Err(e) => warn!("failed to refresh pending_signatures gauge: {e}"),
    }
}
