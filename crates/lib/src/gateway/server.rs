//! Gateway HTTP server: a single `/run` endpoint.
//!
//! Each request goes through auth, the method and body checks, validation and execution,
//! and exactly one audit record is written before the response leaves.

use crate::audit::{AuditLogger, AuditRecord};
use crate::auth::{AuthGate, TOKEN_HEADER};
use crate::config::{self, Config};
use crate::exec::CommandExecutor;
use crate::gateway::protocol::{RunRequest, RunResponse};
use crate::validate::{self, RejectReason, RequestValidator, ValidationOutcome};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, ConnectInfo, DefaultBodyLimit, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Path of the single endpoint.
pub const RUN_PATH: &str = "/run";

/// Largest accepted request body. Bigger bodies are answered with 413 once the caller is
/// authenticated.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Shared state for request handlers. Everything except the audit sink is read-only.
#[derive(Clone)]
pub struct GatewayState {
    pub auth: Arc<AuthGate>,
    pub validator: Arc<RequestValidator>,
    pub executor: Arc<CommandExecutor>,
    pub audit: Arc<AuditLogger>,
}

impl GatewayState {
    /// Build handler state from a validated config and an opened audit logger.
    pub fn new(config: Config, audit: AuditLogger) -> Result<Self> {
        config.validate()?;
        let token = config::resolve_api_token(&config).context("api_token is empty")?;
        Ok(Self {
            auth: Arc::new(AuthGate::new(&token)),
            validator: Arc::new(RequestValidator::new(&config)),
            executor: Arc::new(CommandExecutor::new(config.exec_timeout())),
            audit: Arc::new(audit),
        })
    }
}

/// Terminal non-success outcomes of `/run`. Display is the plain-text response body.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Invalid request body: {0}")]
    BadRequest(String),
    #[error("Request body too large (limit {} bytes)", MAX_BODY_BYTES)]
    PayloadTooLarge,
    #[error("{0}")]
    Rejected(#[from] RejectReason),
}

impl RunError {
    pub fn status(&self) -> StatusCode {
        match self {
            RunError::Unauthorized => StatusCode::UNAUTHORIZED,
            RunError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            RunError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RunError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            RunError::Rejected(_) => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for RunError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Router with the `/run` endpoint. Serve it with connect info so handlers see the caller address.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route(RUN_PATH, any(run_http))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Serve on an already-bound listener until `shutdown` completes. Each connection and
/// request runs on its own task.
pub async fn serve<F>(listener: TcpListener, state: GatewayState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("gateway server exited")
}

/// Run the gateway; binds to config.bind:config.port and blocks until SIGINT/SIGTERM.
/// `config_path` locates the config directory for a relative `log_file`.
/// Writes `service_start` once listening and `service_stop` when the shutdown signal arrives.
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    run_gateway_until(config, config_path, std::future::pending()).await
}

/// [`run_gateway`] that also stops when `stop` completes. A supervisor that cannot send
/// signals (e.g. closing the child's stdin) uses this for a clean `service_stop`.
pub async fn run_gateway_until<F>(config: Config, config_path: PathBuf, stop: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    config.validate()?;
    let bind = config.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        log::warn!(
            "gateway bound to non-loopback address {}; anyone who can reach it and holds the token can run commands",
            bind
        );
    }

    let log_path = config::resolve_log_path(&config, &config_path);
    let audit = AuditLogger::open(&log_path).await?;
    log::info!("audit log: {}", log_path.display());

    let bind_addr = format!("{}:{}", bind, config.port);
    let state = GatewayState::new(config, audit)?;
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);
    match state.executor.timeout() {
        Some(limit) => log::info!("commands are killed after {:?}", limit),
        None => log::debug!("no execution deadline configured"),
    }
    state.audit.record(&AuditRecord::service_start(&bind_addr)).await;

    let audit = state.audit.clone();
    serve(listener, state, async move {
        tokio::select! {
            _ = shutdown_signal() => {},
            _ = stop => log::info!("stop requested, draining in-flight requests"),
        }
        audit.record(&AuditRecord::service_stop()).await;
    })
    .await?;
    log::info!("gateway stopped");
    Ok(())
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to listen for SIGTERM: {}", e);
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
    log::info!("shutdown signal received, draining in-flight requests");
}

/// ANY /run: non-POST methods are answered with 405, but only after auth.
async fn run_http(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let caller = peer.to_string();
    match handle_run(&state, &caller, &method, &headers, &body).await {
        Ok(res) => Json(res).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_run(
    state: &GatewayState,
    caller: &str,
    method: &Method,
    headers: &HeaderMap,
    body: &Result<Bytes, BytesRejection>,
) -> Result<RunResponse, RunError> {
    let presented = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
    if !state.auth.verify(presented) {
        log::warn!("auth failed from {}", caller);
        state.audit.record(&AuditRecord::auth_failed(caller)).await;
        return Err(RunError::Unauthorized);
    }

    if *method != Method::POST {
        state
            .audit
            .record(&AuditRecord::rejected(caller, None, "method not allowed"))
            .await;
        return Err(RunError::MethodNotAllowed);
    }

    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            log::debug!("unreadable body from {}: {}", caller, rejection);
            let (reason, err) = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                ("request body too large", RunError::PayloadTooLarge)
            } else {
                ("invalid request body", RunError::BadRequest(rejection.body_text()))
            };
            state
                .audit
                .record(&AuditRecord::rejected(caller, None, reason))
                .await;
            return Err(err);
        }
    };

    let req: RunRequest = match serde_json::from_slice(body) {
        Ok(req) => req,
        Err(e) => {
            log::debug!("invalid body from {}: {}", caller, e);
            state
                .audit
                .record(&AuditRecord::rejected(caller, None, "invalid request body"))
                .await;
            return Err(RunError::BadRequest(e.to_string()));
        }
    };

    let cwd = match (state.validator.validate(&req), validate::resolve_dir(&req.cwd)) {
        (ValidationOutcome::Allowed, Some(cwd)) => cwd,
        (outcome, _) => {
            let reason = outcome
                .reason()
                .cloned()
                .unwrap_or_else(|| RejectReason::PathNotAllowed(req.cwd.clone()));
            log::info!("rejected {:?} from {}: {}", req.command, caller, reason);
            state
                .audit
                .record(&AuditRecord::rejected(caller, Some(&req), reason.to_string()))
                .await;
            return Err(reason.into());
        }
    };

    log::debug!(
        "running {:?} with {} arg(s) in {} for {}",
        req.command,
        req.args.len(),
        cwd.display(),
        caller
    );
    let result = state.executor.run(&req.command, &req.args, &cwd).await;
    state
        .audit
        .record(&AuditRecord::completed(caller, &req, &result))
        .await;
    log::info!(
        "completed {:?} for {} with exit code {}",
        req.command,
        caller,
        result.exit_code
    );

    Ok(RunResponse {
        stdout: result.stdout_lossy(),
        stderr: result.stderr_lossy(),
        exit_code: result.exit_code,
    })
}
