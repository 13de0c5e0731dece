use std::{sync::Arc, time::Instant};

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header::CONTENT_TYPE, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use doclock_relay::{
    api,
    bus::LockBus,
    config::RelayConfig,
    cors::cors_layer,
    db::{
        migrations::run_migrations,
        pool::{check_pool_health, create_pg_pool, PoolConfig},
    },
    error::{attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope},
    lock::{LockService, LockStore},
    metrics::{self, RelayMetrics},
    ws::{self, connections::ConnectionRegistry},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    let relay_metrics = Arc::new(RelayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&relay_metrics));

    let registry = ConnectionRegistry::default();
    let (store, bus) = match config.database_url.as_deref() {
        Some(database_url) => {
            let pool = create_pg_pool(database_url, PoolConfig::from_env())
                .await
                .context("failed to initialize relay PostgreSQL pool")?;
            check_pool_health(&pool).await.context("relay PostgreSQL health check failed")?;
            run_migrations(&pool).await.context("failed to run relay migrations")?;
            (LockStore::postgres(pool.clone()), LockBus::Postgres { pool, registry })
        }
        None => {
            warn!("DOCLOCK_RELAY_DATABASE_URL unset; locks live in this process only");
            (LockStore::memory(), LockBus::Local(registry))
        }
    };
    info!(backend = store.backend_name(), "lock store ready");

    let shutdown = CancellationToken::new();
    let listener_task = bus.spawn_listener(shutdown.clone());
    let service = LockService::new(store, bus, config.steal_timings, config.lock_stale_after);
    let sweeper_task = tokio::spawn(
        Arc::clone(service.orchestrator()).run_sweeper(config.sweep_interval, shutdown.clone()),
    );

    let app = build_router(service, relay_metrics, config.cors_origins.as_deref());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        countdown_secs = config.steal_timings.countdown_secs(),
        cleanup_secs = config.steal_timings.cleanup_secs(),
        "starting lock relay"
    );

    let serve_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            serve_shutdown.cancel();
        })
        .await
        .context("relay server exited unexpectedly");

    shutdown.cancel();
    if let Err(join_error) = sweeper_task.await {
        error!(?join_error, "steal sweeper task failed");
    }
    if let Some(listener_task) = listener_task {
        if let Err(join_error) = listener_task.await {
            error!(?join_error, "lock event listener task failed");
        }
    }

    served
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_router(
    service: LockService,
    relay_metrics: Arc<RelayMetrics>,
    cors_origins: Option<&str>,
) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(render_metrics).with_state(Arc::clone(&relay_metrics)))
            .merge(ws::router(service.clone()))
            .merge(api::router(service).layer(cors_layer(cors_origins))),
        relay_metrics,
    )
}

fn apply_middleware(router: Router, relay_metrics: Arc<RelayMetrics>) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn_with_state(relay_metrics, request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn render_metrics(State(relay_metrics): State<Arc<RelayMetrics>>) -> impl IntoResponse {
    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], relay_metrics.render_prometheus())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(
    State(relay_metrics): State<Arc<RelayMetrics>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let latency_ms = started_at.elapsed().as_millis() as u64;
    relay_metrics.record_http_request(
        method.as_str(),
        &path,
        response.status().as_u16(),
        latency_ms,
    );
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms,
        "request completed"
    );

    response
}
