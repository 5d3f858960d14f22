use crate::{
    api::{
        auth::require_api_key,
        rate_limit::RateLimiter,
        rate_limit_middleware::rate_limit,
        routes::{
            create_order, health, live, metrics, order_status, payout_quote, psbt_build,
            psbt_build_refund, psbt_decode, psbt_finalize, psbt_merge, tx_broadcast, tx_bumpfee,
            tx_bumpfee_finalize,
        },
    },
    config::{
        ApiKeySettings, DeadlineSettings, RateLimitSettings, Settings, WalletRpcSettings,
        WebhookSettings,
    },
    domain::{deadline, store::OrderStore, webhook::WebhookDispatcher},
    infra::{
        db::{DBConnection, DatabasePoolConfig, DatabaseType},
        rpc::WalletRpcClient,
    },
};
use anyhow::anyhow;
use axum::{
    body::Body,
    extract::{connect_info::IntoMakeServiceWithConnectInfo, ConnectInfo, Request},
    http::HeaderValue,
    middleware::{self, AddExtension, Next},
    response::IntoResponse,
    routing::{get, post},
    serve::Serve,
    Router,
};
use hyper::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    Method,
};
use log::{error, info, warn};
use std::{net::SocketAddr, str::FromStr, sync::Arc};
use tokio::{net::TcpListener, select, signal::unix::{signal, SignalKind}};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower_http::cors::{AllowOrigin, CorsLayer};

pub struct Application {
    server: Serve<
        TcpListener,
        IntoMakeServiceWithConnectInfo<Router, SocketAddr>,
        AddExtension<Router, ConnectInfo<SocketAddr>>,
    >,
    cancellation_token: CancellationToken,
    background_tasks: TaskTracker,
}

impl Application {
    pub async fn build(config: Settings) -> Result<Self, anyhow::Error> {
        let address = format!(
            "{}:{}",
            config.api_settings.domain, config.api_settings.port
        );
        let listener = SocketAddr::from_str(&address)?;
        let origins = crate::config::load_allow_origins()?;
        let (app_state, background_tasks, cancellation_token) = build_app(config.clone()).await?;
        let server = build_server(listener, app_state, origins).await?;
        Ok(Self {
            server,
            cancellation_token,
            background_tasks,
        })
    }

    pub async fn run_until_stopped(self) -> Result<(), anyhow::Error> {
        info!("Starting server...");
        match self.server.with_graceful_shutdown(shutdown_signal()).await {
            Ok(_) => {
                info!("Server shutdown initiated");
                self.cancellation_token.cancel();

                let timeout = tokio::time::sleep(std::time::Duration::from_secs(10));
                select! {
                    _ = self.background_tasks.wait() => {
                        info!("Background tasks completed gracefully");
                    }
                    _ = timeout => {
                        warn!("Background tasks timed out during shutdown");
                    }
                }

                info!("Shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Server shutdown error: {}", e);
                self.cancellation_token.cancel();

                let _ = tokio::time::timeout(
                    std::time::Duration::from_secs(5),
                    self.background_tasks.wait(),
                )
                .await;

                Err(anyhow!("Error during server shutdown: {}", e))
            }
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: OrderStore,
    pub rpc: WalletRpcClient,
    pub webhooks: WebhookDispatcher,
    pub api_keys: Arc<ApiKeySettings>,
    pub rate_limiter: Arc<RateLimiter>,
    pub deadline_settings: DeadlineSettings,
}

pub async fn build_app(
    config: Settings,
) -> Result<(AppState, TaskTracker, CancellationToken), anyhow::Error> {
    let wallet_rpc_settings = WalletRpcSettings::from_env()?;
    let webhook_settings = WebhookSettings::from_env()?;
    let deadline_settings = DeadlineSettings::from_env()?;
    let rate_limit_settings = RateLimitSettings::from_env()?;
    let api_keys = ApiKeySettings::from_env();

    let orders_path = crate::config::orders_db_path();
    tokio::fs::create_dir_all(&orders_path)
        .await
        .map_err(|e| anyhow!("Failed to create orders data folder: {}", e))?;

    let pool_config: DatabasePoolConfig = config.db_settings.clone().into();
    let orders_db = DBConnection::new(&orders_path, "orders", pool_config, DatabaseType::Orders)
        .await
        .map_err(|e| anyhow!("Error setting up orders db: {}", e))?;

    let store = OrderStore::new(orders_db);
    let rpc = WalletRpcClient::new(
        &wallet_rpc_settings.url,
        &wallet_rpc_settings.wallet,
        wallet_rpc_settings.user,
        wallet_rpc_settings.pass,
    );

    let (webhooks, webhook_receiver) = WebhookDispatcher::new();
    let rate_limiter = Arc::new(RateLimiter::new(&rate_limit_settings));

    crate::metrics::register_all();

    let cancel_token = CancellationToken::new();
    let tracker = TaskTracker::new();

    let webhook_store = store.clone();
    let webhook_cancel = cancel_token.clone();
    tracker.spawn(async move {
        crate::domain::webhook::run(webhook_receiver, webhook_store, webhook_settings, webhook_cancel).await;
    });

    let deadline_store = store.clone();
    let deadline_rpc = rpc.clone();
    let deadline_webhooks = webhooks.clone();
    let deadline_settings_for_worker = deadline_settings.clone();
    let deadline_cancel = cancel_token.clone();
    tracker.spawn(async move {
        deadline::run(
            deadline_store,
            deadline_rpc,
            deadline_webhooks,
            deadline_settings_for_worker,
            deadline_cancel,
        )
        .await;
    });

    tracker.close();

    let app_state = AppState {
        store,
        rpc,
        webhooks,
        api_keys: Arc::new(api_keys),
        rate_limiter,
        deadline_settings,
    };

    Ok((app_state, tracker, cancel_token))
}

pub async fn build_server(
    socket_addr: SocketAddr,
    app_state: AppState,
    origins: Vec<String>,
) -> Result<
    Serve<
        TcpListener,
        IntoMakeServiceWithConnectInfo<Router, SocketAddr>,
        AddExtension<Router, ConnectInfo<SocketAddr>>,
    >,
    anyhow::Error,
> {
    let listener = TcpListener::bind(socket_addr).await?;

    info!("Setting up service");
    let app = app(app_state, origins);
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );
    info!(
        "Service running @: http://{}:{}",
        socket_addr.ip(),
        socket_addr.port()
    );
    Ok(server)
}

pub fn app(app_state: AppState, origins: Vec<String>) -> Router {
    let origins: Vec<HeaderValue> = origins
        .into_iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([ACCEPT, CONTENT_TYPE, AUTHORIZATION])
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true);

    let state = Arc::new(app_state);

    Router::new()
        .route("/live", get(live))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/orders", post(create_order))
        .route("/orders/{order_id}/status", get(order_status))
        .route("/orders/{order_id}/payout_quote", post(payout_quote))
        .route("/psbt/build", post(psbt_build))
        .route("/psbt/build_refund", post(psbt_build_refund))
        .route("/psbt/merge", post(psbt_merge))
        .route("/psbt/decode", post(psbt_decode))
        .route("/psbt/finalize", post(psbt_finalize))
        .route("/tx/broadcast", post(tx_broadcast))
        .route("/tx/bumpfee", post(tx_bumpfee))
        .route("/tx/bumpfee/finalize", post(tx_bumpfee_finalize))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
        .layer(cors)
}

async fn log_request(request: Request<Body>, next: Next) -> impl IntoResponse {
    let now = time::OffsetDateTime::now_utc();
    let path = request
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or_default();
    info!(target: "http_request", "new request, {} {}", request.method().as_str(), path);

    let response = next.run(request).await;
    let response_time = time::OffsetDateTime::now_utc() - now;
    crate::metrics::HTTP_REQUEST_LATENCY.observe(response_time.as_seconds_f64());
    info!(target: "http_response", "response, code: {}, time: {}", response.status().as_str(), response_time);

    response
}

async fn shutdown_signal() {
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

    select! {
        _ = sigint.recv() => info!("Received SIGINT signal"),
        _ = sigterm.recv() => info!("Received SIGTERM signal"),
    }
}
