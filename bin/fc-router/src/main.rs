//! FlowCatalyst Message Router
//!
//! Consumes messages from SQS FIFO queues and routes them through per-pool
//! worker pipelines to HTTP mediation targets, honoring per-group ordering,
//! pool-level rate limits, and bounded admission. Exposes a minimal health
//! endpoint; everything else (config distribution, leader election, an
//! admin surface) lives outside this binary's scope.
//!
//! Set `FLOWCATALYST_DEV_MODE=true` to run against a LocalStack SQS
//! endpoint with a built-in three-pool configuration instead of a
//! `router.toml` file.

use std::sync::Arc;
use axum::{routing::get, Json, Router, extract::State};
use fc_router::{
    QueueManager, HttpMediator, HttpMediatorConfig,
    LifecycleManager, LifecycleConfig,
    WarningService, WarningServiceConfig,
    HealthService, HealthServiceConfig,
};
use fc_common::{RouterConfig, PoolConfig as CommonPoolConfig, QueueConfig as CommonQueueConfig};
use fc_queue::sqs::SqsQueueConsumer;
use anyhow::Result;
use tracing::{info, warn, error};
use tokio::signal;
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    fc_common::logging::init_logging("fc-router");

    info!("Starting FlowCatalyst message router");

    let app_config = fc_config::AppConfig::load()?;

    // 1. SQS client, pointed at LocalStack in dev mode.
    let sqs_client = if app_config.dev_mode {
        let endpoint_url = std::env::var("LOCALSTACK_ENDPOINT")
            .unwrap_or_else(|_| "http://localhost:4566".to_string());
        info!(endpoint = %endpoint_url, "Configuring SQS client for LocalStack");

        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .endpoint_url(&endpoint_url)
            .load()
            .await;
        aws_sdk_sqs::Client::new(&config)
    } else {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        aws_sdk_sqs::Client::new(&config)
    };

    // 2. Warning and health services.
    let warning_service = Arc::new(WarningService::new(WarningServiceConfig::default()));
    let health_service = Arc::new(HealthService::new(
        HealthServiceConfig::default(),
        warning_service.clone(),
    ));

    // 3. Mediator.
    let mediator_config = HttpMediatorConfig {
        timeout: std::time::Duration::from_millis(app_config.mediator.timeout_ms),
        max_connections_per_host: app_config.mediator.max_connections_per_host,
        max_retries: app_config.mediator.max_retry_attempts,
        ..HttpMediatorConfig::production()
    };
    let mediator = Arc::new(HttpMediator::with_config(mediator_config));

    // 4. QueueManager and its pools.
    let mut queue_manager = QueueManager::new(mediator.clone());
    queue_manager.set_warning_service(warning_service.clone());
    let queue_manager = Arc::new(queue_manager);

    let router_config = load_router_config(&app_config);

    if router_config.queues.is_empty() {
        return Err(anyhow::anyhow!(
            "no queues configured — set FLOWCATALYST_DEV_MODE=true or provide router.toml"
        ));
    }

    for queue_config in &router_config.queues {
        info!(
            queue_name = %queue_config.name,
            queue_uri = %queue_config.uri,
            connections = queue_config.connections,
            visibility_timeout = queue_config.visibility_timeout,
            "Creating SQS consumer from config"
        );

        let consumer = Arc::new(
            SqsQueueConsumer::from_queue_url(
                sqs_client.clone(),
                queue_config.uri.clone(),
                queue_config.visibility_timeout as i32,
            )
            .await,
        );
        queue_manager.add_consumer(consumer).await;
    }

    queue_manager.apply_config(router_config).await?;

    // 5. Lifecycle background tasks (visibility extension, health monitoring,
    //    warning cleanup, periodic health-report logging).
    let lifecycle = LifecycleManager::start(
        queue_manager.clone(),
        warning_service.clone(),
        health_service.clone(),
        LifecycleConfig::default(),
    );

    let queue_health_monitor = Arc::new(fc_router::QueueHealthMonitor::new(
        fc_router::QueueHealthConfig::default(),
        warning_service.clone(),
    ));
    fc_router::spawn_queue_health_monitor(
        queue_health_monitor,
        queue_manager.clone(),
        lifecycle.shutdown_sender(),
    );

    // 6. HTTP health server.
    let app_state = HealthState {
        queue_manager: queue_manager.clone(),
        health_service: health_service.clone(),
    };
    let app = Router::new()
        .route("/health", get(health_handler))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = format!("{}:{}", app_config.http.host, app_config.http.port);
    info!(%addr, "Starting HTTP health server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // 7. Run the manager loop (polls consumers, routes to pools).
    let manager_handle = {
        let manager = queue_manager.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.start().await {
                error!("QueueManager error: {}", e);
            }
        })
    };

    info!("FlowCatalyst router started. Press Ctrl+C to shut down.");
    shutdown_signal().await;
    info!("Shutdown signal received, draining...");

    lifecycle.shutdown().await;
    queue_manager.shutdown().await;
    server_task.abort();

    match tokio::time::timeout(std::time::Duration::from_secs(30), manager_handle).await {
        Ok(_) => info!("Manager task completed gracefully"),
        Err(_) => warn!("Manager task did not complete within 30s shutdown timeout"),
    }

    info!("FlowCatalyst router shutdown complete");
    Ok(())
}

/// Build the router's pool/queue topology either from the loaded
/// configuration or, in dev mode with nothing configured, a built-in
/// three-pool LocalStack setup.
fn load_router_config(app_config: &fc_config::AppConfig) -> RouterConfig {
    if !app_config.pools.is_empty() || !app_config.queues.is_empty() {
        return RouterConfig {
            processing_pools: app_config
                .pools
                .iter()
                .map(|p| CommonPoolConfig {
                    code: p.code.clone(),
                    concurrency: p.concurrency,
                    rate_limit_per_minute: p.rate_limit_per_minute,
                    queue_capacity: p.queue_capacity,
                })
                .collect(),
            queues: app_config
                .queues
                .iter()
                .map(|q| CommonQueueConfig {
                    name: q.name.clone(),
                    uri: q.uri.clone(),
                    connections: q.connections,
                    visibility_timeout: q.visibility_timeout,
                })
                .collect(),
        };
    }

    if app_config.dev_mode {
        info!("No pools/queues configured — using built-in dev-mode LocalStack topology");
        return dev_router_config();
    }

    RouterConfig { processing_pools: Vec::new(), queues: Vec::new() }
}

/// Built-in LocalStack configuration used when `dev_mode` is set and no
/// `router.toml` is present.
fn dev_router_config() -> RouterConfig {
    let sqs_host = std::env::var("LOCALSTACK_SQS_HOST")
        .unwrap_or_else(|_| "http://sqs.eu-west-1.localhost.localstack.cloud:4566".to_string());

    RouterConfig {
        processing_pools: vec![
            CommonPoolConfig {
                code: "DEFAULT".to_string(),
                concurrency: 10,
                rate_limit_per_minute: None,
                queue_capacity: None,
            },
            CommonPoolConfig {
                code: "HIGH".to_string(),
                concurrency: 20,
                rate_limit_per_minute: None,
                queue_capacity: None,
            },
            CommonPoolConfig {
                code: "LOW".to_string(),
                concurrency: 5,
                rate_limit_per_minute: Some(60),
                queue_capacity: None,
            },
        ],
        queues: vec![
            CommonQueueConfig {
                name: "fc-high-priority.fifo".to_string(),
                uri: format!("{}/000000000000/fc-high-priority.fifo", sqs_host),
                connections: 2,
                visibility_timeout: 120,
            },
            CommonQueueConfig {
                name: "fc-default.fifo".to_string(),
                uri: format!("{}/000000000000/fc-default.fifo", sqs_host),
                connections: 2,
                visibility_timeout: 120,
            },
            CommonQueueConfig {
                name: "fc-low-priority.fifo".to_string(),
                uri: format!("{}/000000000000/fc-low-priority.fifo", sqs_host),
                connections: 1,
                visibility_timeout: 120,
            },
        ],
    }
}

#[derive(Clone)]
struct HealthState {
    queue_manager: Arc<QueueManager>,
    health_service: Arc<HealthService>,
}

#[derive(serde::Serialize)]
struct HealthResponse {
    healthy: bool,
    issues: Vec<String>,
}

async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    let stats = state.queue_manager.get_pool_stats();
    let report = state.health_service.get_health_report(&stats);
    Json(HealthResponse {
        healthy: report.status == fc_common::HealthStatus::Healthy,
        issues: report.issues,
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
