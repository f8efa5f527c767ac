use crate::app_state::{AppState, Collaborators};
use anyhow::Context;
use axum::{Extension, Router, response::IntoResponse, routing::get, serve};
use shared::config::server::{Config, LogFormat};
use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use crate::{
    db::bootstrap,
    middleware::request_context::{self, ContextHeaders},
    routes,
    services::{
        backend::HttpGenerationBackend,
        counter_store::{CounterStore, InMemoryCounterStore},
        fast_tier::InMemoryFastTier,
        repository::{ChatRepository, InMemoryChatRepository, PgChatRepository},
        task_pool::ShutdownOutcome,
        tenants::ConfigTenantDirectory,
    },
    tracer,
};
use axum::http::{HeaderValue, StatusCode, header};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Process-wide Prometheus recorder, installed on first use.
///
/// # Panics
/// Panics if another metrics recorder was installed first.
pub fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

async fn metrics_endpoint(Extension(handle): Extension<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

/// Initializes the tracing subscriber for logging using the provided configuration.
pub fn initialize_tracing(config: &Config) -> String {
    let env_filter = build_env_filter(config);

    let fmt_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let installed = if matches!(config.logging.format, LogFormat::Json) {
        fmt_builder.json().with_ansi(false).try_init()
    } else {
        fmt_builder.with_ansi(true).try_init()
    };
    if installed.is_err() {
        warn!("tracing subscriber already installed; keeping the existing one");
    }

    config.logging.level.clone()
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

/// Durable repository: Postgres when a URL is configured, memory otherwise.
///
/// # Errors
/// Returns an error if the database is configured but cannot be reached or
/// bootstrapped.
pub async fn create_repository(config: &Config) -> anyhow::Result<Arc<dyn ChatRepository>> {
    if config.database.url.is_none() {
        warn!("no database configured; chat history is kept in memory only");
        return Ok(Arc::new(InMemoryChatRepository::new()));
    }

    let pool = bootstrap::connect(&config.database).await?;
    bootstrap::ensure_liveness(&pool)
        .await
        .context("database liveness check failed")?;
    bootstrap::run(&pool).await?;
    metrics::gauge!("db_pool_max_connections").set(f64::from(config.database.max_connections));
    info!("database ready");

    Ok(Arc::new(PgChatRepository::new(pool)))
}

/// Builds the production collaborators described by `config`.
///
/// # Errors
/// Returns an error if the repository or backend client cannot be created.
pub async fn create_collaborators(config: &Config) -> anyhow::Result<Collaborators> {
    let repository = create_repository(config).await?;
    let backend = HttpGenerationBackend::new(
        config.backend.url.clone(),
        Duration::from_secs(config.backend.connect_timeout_seconds),
    )?;
    let counter_store: Option<Arc<dyn CounterStore>> = if config.quota.enabled {
        Some(Arc::new(InMemoryCounterStore::new()))
    } else {
        info!("quota enforcement disabled");
        None
    };

    Ok(Collaborators {
        repository,
        fast_tier: Arc::new(InMemoryFastTier::new()),
        counter_store,
        backend: Arc::new(backend),
        tenants: Arc::new(ConfigTenantDirectory::new(config.quota.clone())),
    })
}

/// Creates the CORS layer for the application.
pub fn create_cors_layer(config: &Config) -> CorsLayer {
    use http::Method;

    let methods = vec![Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];

    let mut cors = CorsLayer::new()
        .allow_methods(AllowMethods::list(methods))
        .allow_headers(AllowHeaders::any())
        .allow_credentials(config.server.cors.allow_credentials)
        .max_age(Duration::from_secs(config.server.cors.max_age_seconds));

    if config.server.cors.allowed_origins.is_empty() {
        cors = cors.allow_origin(AllowOrigin::any());
    } else {
        let origins = config
            .server
            .cors
            .allowed_origins
            .iter()
            .filter_map(|origin| http::HeaderValue::from_str(origin).ok())
            .collect::<Vec<_>>();
        cors = cors.allow_origin(AllowOrigin::list(origins));
    }

    cors
}

/// Creates the main application router with all middleware and routes.
pub fn create_app_router(
    state: Arc<AppState>,
    config: &Config,
    metrics_handle: PrometheusHandle,
) -> Router {
    let cors = create_cors_layer(config);
    let context_headers = ContextHeaders::from_config(config);

    Router::new()
        .nest("/api", routes::chat::create_router_chat())
        .merge(routes::health::create_health_router())
        .merge(routes::openapi::openapi_routes())
        .route("/metrics", get(metrics_endpoint))
        .layer(Extension(metrics_handle))
        .layer(cors)
        .layer(tracer::create_trace_layer())
        .layer(axum::middleware::from_fn_with_state(
            context_headers,
            request_context::attach_request_context,
        ))
        .with_state(state)
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn create_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutting down...");
}

/// Starts the gateway and serves until a shutdown signal arrives, then drains
/// background work.
///
/// # Errors
/// Returns an error if startup fails or the listener cannot be bound.
pub async fn run(config: Config) -> anyhow::Result<()> {
    initialize_tracing(&config);
    info!("Starting server...");

    let metrics_handle = metrics_handle();
    let collaborators = create_collaborators(&config).await?;
    let state = Arc::new(AppState::assemble(&config, collaborators));
    let app = create_app_router(state.clone(), &config, metrics_handle);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);

    serve(listener, app)
        .with_graceful_shutdown(create_shutdown_signal())
        .await?;

    match state.tasks().shutdown(config.shutdown_grace()).await {
        ShutdownOutcome::Drained => info!("shutdown complete"),
        ShutdownOutcome::TimedOut => warn!("shutdown finished with background work outstanding"),
    }
    Ok(())
}
