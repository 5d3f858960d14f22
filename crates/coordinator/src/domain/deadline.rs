use log::{error, info, warn};
use serde_json::json;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;

use crate::{
    config::DeadlineSettings,
    domain::{
        order::OutputType,
        pst, rbf,
        state_machine::OrderState,
        store::OrderStore,
        webhook::{WebhookDispatcher, WebhookEvent},
    },
    infra::rpc::WalletRpcClient,
    metrics::{STUCK_ORDERS, WATCH_ONLY_ORPHANS},
};

const SECONDS_PER_DAY: i64 = 86_400;

/// `now + SIGNING_DEADLINE_DAYS * 86400`, the deadline stamped on entry to `escrow_funded`
/// or `signing`.
pub fn compute_deadline(signing_deadline_days: i64) -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp() + signing_deadline_days * SECONDS_PER_DAY
}

/// Periodic scan over orders in `{awaiting_deposit, signing}`: flags stuck orders by age and,
/// for `signing` orders whose deadline has elapsed, attempts wallet-assisted escalation.
pub async fn run(
    store: OrderStore,
    rpc: WalletRpcClient,
    webhooks: WebhookDispatcher,
    settings: DeadlineSettings,
    cancel_token: CancellationToken,
) {
    let mut ticker = interval(Duration::from_secs(settings.check_interval_secs));
    info!("deadline worker started");
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                info!("deadline worker shutting down");
                break;
            }
            _ = ticker.tick() => {
                sweep(&store, &rpc, &webhooks, &settings).await;
            }
        }
    }
}

async fn sweep(
    store: &OrderStore,
    rpc: &WalletRpcClient,
    webhooks: &WebhookDispatcher,
    settings: &DeadlineSettings,
) {
    let orders = match store
        .list_orders_by_states(&[OrderState::AwaitingDeposit, OrderState::Signing])
        .await
    {
        Ok(orders) => orders,
        Err(e) => {
            error!("deadline sweep failed to list orders: {e}");
            return;
        }
    };

    let now = time::OffsetDateTime::now_utc();
    for order in orders {
        let age_hours = (now - order.created_at).whole_hours();
        if age_hours > settings.stuck_order_hours {
            STUCK_ORDERS.inc();
            warn!(
                "order {} stuck in {} for {age_hours}h",
                order.order_id, order.state
            );
        }

        if order.state != OrderState::Signing {
            continue;
        }
        let Some(deadline_ts) = order.deadline_ts else {
            continue;
        };
        if now.unix_timestamp() < deadline_ts {
            continue;
        }

        if let Err(e) = escalate(store, rpc, webhooks, &order.order_id).await {
            error!("deadline escalation failed for order {}: {e}", order.order_id);
        }
    }
}

async fn escalate(
    store: &OrderStore,
    rpc: &WalletRpcClient,
    webhooks: &WebhookDispatcher,
    order_id: &str,
) -> Result<(), crate::errors::AppError> {
    let partials = store.get_partials(order_id).await?;
    if partials.is_empty() {
        return Ok(());
    }

    let merged = pst::merge(store, rpc, Some(order_id), &[]).await?;
    let pre = pst::decode(rpc, &merged).await?;

    #[derive(serde::Deserialize)]
    struct ProcessResult {
        psbt: String,
    }
    let processed: ProcessResult = rpc.call("walletprocesspsbt", json!([merged])).await?;
    let post = pst::decode(rpc, &processed.psbt).await?;

    if post.sign_count == pre.sign_count {
        WATCH_ONLY_ORPHANS.inc();
        store
            .update_state(order_id, OrderState::Dispute, None, None)
            .await?;
        webhooks.enqueue(WebhookEvent::new(
            order_id,
            "dispute_opened",
            json!({"order_id": order_id, "event": "dispute_opened"}),
        ));
        return Ok(());
    }

    if post.sign_count < 2 {
        info!("order {order_id} has insufficient signatures ({}), waiting", post.sign_count);
        return Ok(());
    }

    let order = store
        .get_order(order_id)
        .await?
        .ok_or_else(|| crate::errors::AppError::NotFound(format!("order {order_id} not found")))?;
    let final_state = if order.output_type == Some(OutputType::Refund) {
        OrderState::Refunded
    } else {
        OrderState::Completed
    };

    let finalized = pst::finalize(store, rpc, Some(order_id), &processed.psbt, final_state).await?;
    let txid: String = rpc
        .call("sendrawtransaction", json!([finalized.hex]))
        .await?;
    store.set_payout_txid(order_id, &txid).await?;
    store
        .update_state(order_id, final_state, None, None)
        .await?;

    let event_name = if final_state == OrderState::Completed {
        "settled"
    } else {
        "refunded"
    };
    webhooks.enqueue(WebhookEvent::new(
        order_id,
        event_name,
        json!({"order_id": order_id, "event": event_name, "txid": txid}),
    ));

    Ok(())
}
