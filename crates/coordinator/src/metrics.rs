use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref HTTP_REQUEST_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "coordinator_http_request_duration_seconds",
            "Latency of inbound HTTP requests"
        )
    )
    .expect("failed to create http_request_latency histogram");

    pub static ref RPC_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "coordinator_wallet_rpc_duration_seconds",
            "Latency of outbound wallet RPC calls by method"
        ),
        &["method"]
    )
    .expect("failed to create rpc_latency histogram");

    pub static ref WEBHOOK_DELIVERIES: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new(
            "coordinator_webhook_deliveries_total",
            "Webhook delivery attempts by outcome"
        ),
        &["outcome"]
    )
    .expect("failed to create webhook_deliveries counter");

    pub static ref STUCK_ORDERS: IntCounter = IntCounter::new(
        "coordinator_stuck_orders_total",
        "Orders flagged as stuck by the deadline worker"
    )
    .expect("failed to create stuck_orders counter");

    pub static ref WATCH_ONLY_ORPHANS: IntCounter = IntCounter::new(
        "coordinator_watch_only_orphans_total",
        "Funding observed against a descriptor with no matching order"
    )
    .expect("failed to create watch_only_orphans counter");

    pub static ref PENDING_SIGNATURES: IntGauge = IntGauge::new(
        "coordinator_pending_signatures",
        "Orders currently awaiting at least one more signature"
    )
    .expect("failed to create pending_signatures gauge");
}

/// Registers every collector exactly once; called from `startup::build_app`.
pub fn register_all() {
    let _ = REGISTRY.register(Box::new(HTTP_REQUEST_LATENCY.clone()));
    let _ = REGISTRY.register(Box::new(RPC_LATENCY.clone()));
    let _ = REGISTRY.register(Box::new(WEBHOOK_DELIVERIES.clone()));
    let _ = REGISTRY.register(Box::new(STUCK_ORDERS.clone()));
    let _ = REGISTRY.register(Box::new(WATCH_ONLY_ORPHANS.clone()));
    let _ = REGISTRY.register(Box::new(PENDING_SIGNATURES.clone()));
}

/// Renders the registry in Prometheus text exposition format for `GET /metrics`.
pub fn render() -> Result<String, prometheus::Error> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_produces_nonempty_text_after_registration() {
        register_all();
        PENDING_SIGNATURES.set(3);
        let text = render().unwrap();
        assert!(text.contains("coordinator_pending_signatures"));
    }
}
