use std::{sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::HeaderValue;
use tokio::{signal, sync::mpsc};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
};
use tracing::{error, info};

use storefront_checkout as api;
use storefront_checkout::config::PaymentProviderKind;
use storefront_checkout::services::payments::{
    HttpGatewayConfig, HttpPaymentGateway, PaymentGateway, SandboxPaymentGateway,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config().context("failed to load configuration")?;
    api::config::init_tracing(&cfg.log_level, cfg.log_json);
    api::handlers::health::init_start_time();

    // Init DB
    let db_config = api::db::DbConfig::from_app_config(&cfg);
    let db_pool = api::db::establish_connection_with_config(&db_config).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    let gateway: Arc<dyn PaymentGateway> = match cfg.payment_provider {
        PaymentProviderKind::Sandbox => {
            info!("using sandbox payment provider");
            Arc::new(SandboxPaymentGateway::new())
        }
        PaymentProviderKind::Http => {
            let gateway_config = HttpGatewayConfig::from_app_config(&cfg)?;
            info!(base_url = %gateway_config.base_url, "using http payment provider");
            Arc::new(HttpPaymentGateway::new(gateway_config)?)
        }
    };

    // Init events
    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(api::events::EventSender::new(event_tx));
    let handlers: Vec<Arc<dyn api::events::EventHandler>> =
        vec![Arc::new(api::events::LoggingEventHandler)];
    tokio::spawn(api::events::process_events(event_rx, handlers));

    let checkout = Arc::new(api::services::commerce::CheckoutService::new(
        db_arc.clone(),
        &cfg,
        gateway,
        event_sender.clone(),
    ));

    let cors_layer = build_cors(&cfg)?;
    let addr = format!("{}:{}", cfg.host, cfg.port);

    let app_state = api::AppState {
        db: db_arc,
        auth: api::auth::AuthConfig::new(&cfg.jwt_secret),
        config: Arc::new(cfg),
        event_sender,
        checkout,
    };

    let app = api::build_router(app_state)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(cors_layer);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("storefront-checkout listening on http://{}", addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

fn build_cors(cfg: &api::config::AppConfig) -> anyhow::Result<CorsLayer> {
    let origins: Vec<HeaderValue> = cfg
        .cors_origins()
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    if !origins.is_empty() {
        return Ok(CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any));
    }
    if cfg.is_development() {
        info!("Using permissive CORS because explicit origins were not configured (development environment)");
        return Ok(CorsLayer::permissive());
    }
    error!("Missing CORS configuration; set APP__CORS_ALLOWED_ORIGINS");
    anyhow::bail!("Missing CORS configuration: set APP__CORS_ALLOWED_ORIGINS")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
