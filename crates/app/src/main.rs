use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use app::model::{GENERAL_CONFIG_PATH, check_model_paths};
use app::{CallOptions, GeneralConfig, ModelError, ToolRegistry, load_config, setup_agents};
use axum::Json;
use axum::Router;
use axum::extract::{DefaultBodyLimit, Path as UrlPath, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use sandbox::{CodeInterpreter, SandboxConfig, ToolInput};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::ServiceBuilder;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::compression::CompressionLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MAX_INFLIGHT: usize = 64;
const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 600;
const MAX_TOOL_BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

#[derive(Clone, Debug)]
struct AppConfig {
    host: String,
    port: u16,
    max_inflight: usize,
    request_timeout: Duration,
    general_config_path: PathBuf,
    agent_files: Vec<PathBuf>,
}

impl AppConfig {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let port = match lookup("APP_PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .context("APP_PORT must be a port number")?,
            None => DEFAULT_PORT,
        };
        let max_inflight = match lookup("APP_MAX_INFLIGHT") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|limit| *limit > 0)
                .context("APP_MAX_INFLIGHT must be a positive integer")?,
            None => DEFAULT_MAX_INFLIGHT,
        };
        let request_timeout = match lookup("APP_REQUEST_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(
                raw.trim()
                    .parse::<u64>()
                    .context("APP_REQUEST_TIMEOUT_SECS must be whole seconds")?,
            ),
            None => Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS),
        };
        Ok(Self {
            host: lookup("APP_HOST").unwrap_or_else(|| DEFAULT_HOST.to_owned()),
            port,
            max_inflight,
            request_timeout,
            general_config_path: lookup("APP_GENERAL_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(GENERAL_CONFIG_PATH)),
            agent_files: lookup("APP_AGENT_FILES")
                .map(|raw| env::split_paths(&raw).collect())
                .unwrap_or_default(),
        })
    }
}

#[derive(Clone)]
struct AppState {
    registry: Arc<ToolRegistry>,
    general: Option<Arc<GeneralConfig>>,
    config: AppConfig,
}

#[derive(Debug, Deserialize)]
struct ToolCallRequest {
    params: Value,
    #[serde(default)]
    files: Vec<PathBuf>,
    timeout_secs: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ToolCallResponse {
    call_id: String,
    tool: String,
    result: String,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

async fn healthcheck() -> Response {
    let mut response = StatusCode::OK.into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

async fn log_request_response(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();
    info!(%method, %uri, "request");
    let response = next.run(request).await;
    info!(
        %method,
        %uri,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis(),
        "response"
    );
    response
}

async fn list_tools(State(state): State<AppState>) -> Response {
    Json(state.registry.descriptors()).into_response()
}

async fn call_tool_handler(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
    Json(payload): Json<ToolCallRequest>,
) -> Response {
    let Some(tool) = state.registry.get(&name) else {
        return error_response(
            StatusCode::NOT_FOUND,
            &format!("unknown tool {name}"),
            "invalid_request_error",
        );
    };
    let requested = match payload.timeout_secs.map(Duration::try_from_secs_f64) {
        None => None,
        Some(Ok(timeout)) if !timeout.is_zero() => Some(timeout),
        Some(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "timeout_secs must be a positive number",
                "invalid_request_error",
            );
        }
    };
    let options = CallOptions {
        files: payload.files,
        timeout: resolve_timeout(requested, state.general.as_deref()),
    };
    let input = ToolInput::from(payload.params);
    let result = match tokio::task::spawn_blocking(move || tool.call(input, &options)).await {
        Ok(result) => result,
        Err(err) => {
            warn!(error = %err, tool = %name, "tool task failed");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "tool task failed",
                "server_error",
            );
        }
    };
    Json(ToolCallResponse {
        call_id: Uuid::new_v4().to_string(),
        tool: name,
        result,
    })
    .into_response()
}

async fn list_agents(State(state): State<AppState>) -> Response {
    let Some(general) = state.general.as_deref() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &format!(
                "configuration file not found at {}",
                state.config.general_config_path.display()
            ),
            "server_error",
        );
    };
    let agents = setup_agents(general, &state.registry.names(), &state.config.agent_files);
    Json(agents).into_response()
}

/// Request override first, then the general configuration. `None` leaves the
/// tool's own default in place.
fn resolve_timeout(requested: Option<Duration>, general: Option<&GeneralConfig>) -> Option<Duration> {
    requested.or_else(|| general.and_then(GeneralConfig::tool_timeout))
}

fn error_response(status: StatusCode, message: &str, error_type: &str) -> Response {
    let mut response = Json(ErrorEnvelope {
        error: ErrorBody {
            message: message.to_owned(),
            error_type: error_type.to_owned(),
        },
    })
    .into_response();
    *response.status_mut() = status;
    response
}

fn load_general_config(path: &Path) -> anyhow::Result<Option<GeneralConfig>> {
    match load_config(path) {
        Ok(config) => {
            for missing in check_model_paths(&config) {
                warn!(path = %missing.display(), "model file not found");
            }
            Ok(Some(config))
        }
        Err(ModelError::ConfigMissing(path)) => {
            warn!(path = %path.display(), "general configuration not found; agent listing disabled");
            Ok(None)
        }
        Err(err) => Err(err).context("failed to load general configuration"),
    }
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_lookup(|name| env::var(name).ok())?;
    let sandbox_config = SandboxConfig::from_env()?;
    let interpreter =
        CodeInterpreter::new(&sandbox_config).context("failed to initialize code interpreter")?;
    info!(
        instance_id = interpreter.instance_id(),
        workspace = %interpreter.workspace().path().display(),
        "code interpreter ready"
    );
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(interpreter))?;
    let general = load_general_config(&config.general_config_path)?.map(Arc::new);

    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState {
        registry: Arc::new(registry),
        general,
        config,
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    rt.block_on(async move {
        let app = Router::new()
            .route("/healthz", get(healthcheck))
            .route("/v1/tools", get(list_tools))
            .route(
                "/v1/tools/{name}/call",
                post(call_tool_handler).layer(
                    ServiceBuilder::new()
                        .layer(DefaultBodyLimit::max(MAX_TOOL_BODY_LIMIT_BYTES))
                        .layer(TimeoutLayer::with_status_code(
                            StatusCode::REQUEST_TIMEOUT,
                            state.config.request_timeout,
                        )),
                ),
            )
            .route("/v1/agents", get(list_agents))
            .layer(CompressionLayer::new())
            .layer(ConcurrencyLimitLayer::new(state.config.max_inflight))
            .layer(middleware::from_fn(log_request_response))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(%addr, "listening");
        axum::serve(listener, app).await?;
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}
