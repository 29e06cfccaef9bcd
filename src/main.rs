use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use deskhub::config::Config;
use deskhub::engine::Engine;
use deskhub::http::{self, AppState};
use deskhub::observability::{self, Metrics, PrometheusSink};
use deskhub::payment::PaymentProcessor;
use deskhub::payment::http::HttpGateway;
use deskhub::reaper;
use deskhub::sealed::FieldCipher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    observability::init(config.metrics_port)?;
    let metrics: Metrics = Arc::new(PrometheusSink);

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let engine = Arc::new(Engine::new(
        config.wal_path(),
        config.engine_settings(),
        metrics.clone(),
    )?);

    let cipher = match config.field_key.as_deref() {
        Some(key) => FieldCipher::from_hex_key(key)?,
        None => {
            warn!("DESKHUB_FIELD_KEY not set; sealed fields will not survive a restart");
            FieldCipher::ephemeral()
        }
    };
    let gateway = HttpGateway::new(
        config.gateway_url.clone(),
        config.gateway_api_key.clone(),
        config.gateway_timeout,
        metrics.clone(),
    )?;
    let payments = Arc::new(PaymentProcessor::new(
        engine.clone(),
        Arc::new(gateway),
        config.retry_policy(),
        Arc::new(cipher),
    ));

    tokio::spawn(reaper::run_sweeper(engine.clone(), config.sweep_interval));
    tokio::spawn(reaper::run_compactor(engine.clone(), config.compact_threshold));

    if config.iot_webhook_secret.is_none() {
        warn!("DESKHUB_IOT_WEBHOOK_SECRET not set; IoT webhook deliveries will be refused");
    }
    let state = AppState {
        engine,
        payments,
        iot_secret: config.iot_webhook_secret.as_deref().map(Arc::from),
        payment_webhook_secret: config.payment_webhook_secret.as_deref().map(Arc::from),
        metrics,
    };

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("deskhub listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  gateway: {}", config.gateway_url);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("deskhub stopped");
    Ok(())
}

/// Resolves on SIGTERM or ctrl-c; in-flight requests drain before exit.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot register SIGTERM handler: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received, draining requests");
}
