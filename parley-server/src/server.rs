use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use axum::{
    Extension, Router,
    http::{HeaderValue, Method, StatusCode, header},
    middleware,
    response::IntoResponse,
    routing::get,
    serve,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use shared::config::server::{Config, DatabaseConfig, LogFormat};
use sqlx::{Executor, postgres::PgPoolOptions};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tracing::{Subscriber, error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt, fmt::MakeWriter};

use crate::{
    app_state::AppState,
    handlers,
    middleware::{
        auth::{self, AuthState},
        request_context::{self, RequestIdState},
    },
    routes, tracer,
};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Process-wide Prometheus handle. The first call installs the recorder.
pub fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "metrics recorder already installed; /metrics will be empty");
                PrometheusBuilder::new().build_recorder().handle()
            }
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

/// Subscriber for `config.logging`, writing to `writer`.
///
/// `RUST_LOG` wins over `logging.level` when set.
pub fn build_subscriber<W>(config: &Config, writer: W) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::builder().with_default_directive(level.into()).parse_lossy(""));
    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(writer);

    match config.logging.format {
        LogFormat::Json => Box::new(builder.json().with_ansi(false).finish()),
        LogFormat::Text => Box::new(builder.with_ansi(true).finish()),
    }
}

/// Install the process-wide subscriber. Returns the configured level.
pub fn initialize_tracing(config: &Config) -> String {
    if tracing::subscriber::set_global_default(build_subscriber(config, std::io::stdout)).is_err() {
        warn!("tracing subscriber already installed");
    }
    config.logging.level.clone()
}

/// Creates a database connection pool with the configured statement timeout
/// applied to every connection.
///
/// # Errors
/// Returns an error if the database connection pool cannot be created.
pub async fn create_database_pool(db: &DatabaseConfig) -> Result<sqlx::PgPool, sqlx::Error> {
    let statement_timeout = db.statement_timeout_ms;
    let pool = PgPoolOptions::new()
        .max_connections(db.max_connections)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                let sql = format!("SET statement_timeout = {statement_timeout}");
                conn.execute(sql.as_str()).await?;
                Ok(())
            })
        })
        .connect(&db.url)
        .await?;
    metrics::gauge!("parley_db_pool_max_connections").set(f64::from(db.max_connections));
    info!(max_connections = db.max_connections, "database pool ready");
    Ok(pool)
}

/// CORS for browser clients. An empty origin list allows any origin.
///
/// Credentialed CORS mirrors the requested headers, since a wildcard is not
/// allowed there; `Config::validate` rejects credentials without origins.
pub fn create_cors_layer(config: &Config) -> CorsLayer {
    let cors = &config.server.cors;
    let origins = if cors.allowed_origins.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            cors.allowed_origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok()),
        )
    };

    let headers = if cors.allow_credentials {
        AllowHeaders::mirror_request()
    } else {
        AllowHeaders::any()
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(headers)
        .allow_credentials(cors.allow_credentials)
        .max_age(Duration::from_secs(cors.max_age_seconds))
}

/// Routes that require an authenticated user: the REST API under `/api`
/// and the WebSocket upgrade at `/ws`.
pub fn create_protected_router(config: &Config) -> Router<Arc<AppState>> {
    Router::new()
        .nest("/api", handlers::conversations::routes())
        .route("/ws", get(handlers::ws::upgrade))
        .route_layer(middleware::from_fn_with_state(
            AuthState::from_config(config),
            auth::require_user,
        ))
}

/// Creates the main application router with all middleware and routes.
pub fn create_app_router(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let config = state.config.clone();

    Router::new()
        .merge(create_protected_router(&config))
        .merge(routes::health::create_health_router())
        .route("/metrics", get(metrics_endpoint))
        .layer(Extension(metrics_handle))
        .layer(create_cors_layer(&config))
        .layer(tracer::create_trace_layer())
        .layer(middleware::from_fn_with_state(
            RequestIdState::from_config(&config),
            request_context::assign_request_id,
        ))
        .with_state(state)
}

/// Resolves on Ctrl-C or when `shutdown` is cancelled elsewhere, then
/// closes every live connection with `1001`.
pub async fn create_shutdown_signal(state: Arc<AppState>) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(error = %err, "failed to listen for ctrl-c; waiting for cancellation");
                state.shutdown.cancelled().await;
            }
        }
        () = state.shutdown.cancelled() => {}
    }
    let connections = state.hub.connection_count().await;
    info!(connections, "Shutting down...");
    state.hub.close_all().await;
    state.shutdown.cancel();
}

/// Starts the server and serves until shutdown.
///
/// # Errors
/// Returns an error if a backend cannot be wired or the listener fails.
pub async fn run(config: Config) -> anyhow::Result<()> {
    initialize_tracing(&config);
    info!("Starting server...");

    let metrics_handle = metrics_handle();
    let config = Arc::new(config);
    let shutdown = CancellationToken::new();

    let state = AppState::build(config.clone(), shutdown.clone()).await?;
    let app = create_app_router(state.clone(), metrics_handle);

    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    info!("Listening on {}", listener.local_addr()?);

    serve(listener, app)
        .with_graceful_shutdown(create_shutdown_signal(state))
        .await?;

    shutdown.cancel();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use std::{
        io::{self, Write},
        sync::Mutex,
    };
    use tower::ServiceExt;

    /// In-memory log sink.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn first_line_logged_as(format: LogFormat) -> String {
        let mut config = Config::in_memory();
        config.logging.format = format;
        let sink = Captured::default();
        let dispatch = tracing::Dispatch::new(build_subscriber(&config, sink.clone()));
        tracing::dispatcher::with_default(&dispatch, || {
            info!(event = "log_test", "log entry");
        });
        let bytes = sink.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .find(|line| !line.trim().is_empty())
            .unwrap()
            .to_string()
    }

    #[test]
    fn initialize_tracing_returns_configured_level() {
        let config = Config::in_memory();
        assert_eq!(initialize_tracing(&config), config.logging.level);
    }

    #[test]
    fn json_format_writes_one_object_per_event() {
        let value: Value = serde_json::from_str(&first_line_logged_as(LogFormat::Json)).unwrap();
        assert_eq!(value["fields"]["message"], "log entry");
        assert_eq!(value["fields"]["event"], "log_test");
    }

    #[test]
    fn text_format_is_not_json() {
        let line = first_line_logged_as(LogFormat::Text);
        assert!(serde_json::from_str::<Value>(&line).is_err());
        assert!(line.contains("log entry"));
    }

    async fn router() -> Router {
        let state = AppState::in_memory(Config::in_memory()).await.unwrap();
        create_app_router(state, metrics_handle())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_request_latency() {
        let app = router().await;
        let health = app.clone().oneshot(get("/healthz")).await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("parley_http_request_seconds"));
    }

    #[tokio::test]
    async fn api_routes_require_a_user() {
        let response = router().await.oneshot(get("/api/conversations")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn responses_echo_the_request_id() {
        let request = Request::builder()
            .uri("/healthz")
            .header("x-request-id", "req-7")
            .body(Body::empty())
            .unwrap();
        let response = router().await.oneshot(request).await.unwrap();
        assert_eq!(response.headers().get("x-request-id").unwrap(), "req-7");
    }

    #[tokio::test]
    async fn credentialed_cors_answers_preflight() {
        let mut config = Config::in_memory();
        config.server.cors.allow_credentials = true;
        config.server.cors.allowed_origins = vec!["https://app.example".to_string()];
        assert!(config.validate().is_ok());

        let app: Router = Router::new()
            .route("/ping", axum::routing::get(|| async { "pong" }))
            .layer(create_cors_layer(&config));
        let preflight = Request::builder()
            .method(Method::OPTIONS)
            .uri("/ping")
            .header(header::ORIGIN, "https://app.example")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "x-user-id")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(preflight).await.unwrap();

        let headers = response.headers();
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(),
            "true"
        );
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://app.example"
        );
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
            "x-user-id"
        );
    }

    #[tokio::test]
    async fn shutdown_signal_runs_on_the_runtime_and_closes_the_hub() {
        let state = AppState::in_memory(Config::in_memory()).await.unwrap();
        // Spawning requires the future to be `Send`, as `with_graceful_shutdown` does.
        let signal = tokio::spawn(create_shutdown_signal(state.clone()));

        state.shutdown.cancel();
        signal.await.unwrap();
        assert_eq!(state.hub.connection_count().await, 0);
    }
}
