use hmac::{Hmac, Mac};
use log::{error, info, warn};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::{config::WebhookSettings, domain::store::OrderStore, metrics::WEBHOOK_DELIVERIES};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    pub order_id: String,
    pub event: String,
    #[serde(flatten)]
    pub payload: Value,
}

impl WebhookEvent {
    pub fn new(order_id: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            order_id: order_id.into(),
            event: event.into(),
            payload,
        }
    }

    fn is_terminal(&self) -> bool {
        self.event != "escrow_funded"
    }
}

/// Single-producer/single-reader outbound queue; the reader is the only consumer so delivery
/// order per-order is preserved.
#[derive(Clone)]
pub struct WebhookDispatcher {
    sender: async_channel::Sender<WebhookEvent>,
}

impl WebhookDispatcher {
    pub fn new() -> (Self, async_channel::Receiver<WebhookEvent>) {
        let (sender, receiver) = async_channel::unbounded();
        (Self { sender }, receiver)
    }

    pub fn enqueue(&self, event: WebhookEvent) {
        if let Err(e) = self.sender.try_send(event) {
            warn!("failed to enqueue webhook event: {e}");
        }
    }

    /// False once the dispatcher loop has exited and stopped draining the queue.
    pub fn is_healthy(&self) -> bool {
        !self.sender.is_closed()
    }
}

fn sign(secret: &str, timestamp: i64, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

async fn deliver_once(
    client: &reqwest::Client,
    settings: &WebhookSettings,
    body: &str,
) -> Result<(), String> {
    let timestamp = time::OffsetDateTime::now_utc().unix_timestamp();
    let signature = sign(&settings.hmac_secret, timestamp, body);

    let response = client
        .post(&settings.callback_url)
        .header("content-type", "application/json")
        .header("x-weo-sign", signature)
        .header("x-weo-ts", timestamp.to_string())
        .body(body.to_string())
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("webhook callback returned {}", response.status()))
    }
}

async fn deliver_with_retries(
    client: &reqwest::Client,
    settings: &WebhookSettings,
    event: &WebhookEvent,
) -> bool {
    let body = match serde_json::to_string(event) {
        Ok(b) => b,
        Err(e) => {
            error!("failed to serialize webhook event: {e}");
            return false;
        }
    };

    for attempt in 0..=settings.retries {
        match deliver_once(client, settings, &body).await {
            Ok(()) => return true,
            Err(e) => {
                warn!(
                    "webhook delivery attempt {attempt} for order {} failed: {e}",
                    event.order_id
                );
                if attempt < settings.retries {
                    let backoff = settings.backoff.powi(attempt as i32);
                    sleep(Duration::from_secs_f64(backoff)).await;
                }
            }
        }
    }
    false
}

/// Runs until `cancel_token` fires, following the coordinator's existing background-loop
/// shape: `tokio::select!` between the next queued item and cancellation.
pub async fn run(
    receiver: async_channel::Receiver<WebhookEvent>,
    store: OrderStore,
    settings: WebhookSettings,
    cancel_token: CancellationToken,
) {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build webhook http client");

    info!("webhook dispatcher started");
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                info!("webhook dispatcher shutting down");
                break;
            }
            event = receiver.recv() => {
                let Ok(event) = event else { break };
                if event.is_terminal() {
                    match store.get_order(&event.order_id).await {
                        Ok(Some(order)) if order.last_webhook_ts.is_some() => {
                            info!(
                                "dropping duplicate terminal webhook for order {}",
                                event.order_id
                            );
                            continue;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("failed to load order {} before webhook delivery: {e}", event.order_id);
                        }
                    }
                }

                let delivered = deliver_with_retries(&client, &settings, &event).await;
                let outcome = if delivered { "success" } else { "failure" };
                WEBHOOK_DELIVERIES.with_label_values(&[outcome]).inc();

                if delivered && event.is_terminal() {
                    let ts = time::OffsetDateTime::now_utc().unix_timestamp();
                    if let Err(e) = store.set_last_webhook_ts(&event.order_id, ts).await {
                        error!("failed to stamp last_webhook_ts for {}: {e}", event.order_id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let sig = sign("secret", 100, "{}");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn escrow_funded_is_never_terminal() {
        let event = WebhookEvent::new("order1", "escrow_funded", serde_json::json!({}));
        assert!(!event.is_terminal());
        let event = WebhookEvent::new("order1", "settled", serde_json::json!({}));
        assert!(event.is_terminal());
    }
}
