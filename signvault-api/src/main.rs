//! Signvault API Server
//!
//! Thin HTTP transport over the signing core. No business logic lives here;
//! handlers normalize requests, call the facade, and map outcomes to
//! status codes.
//!
//! Configuration (environment variables):
//!   PORT                         - Listen port (default: 3000)
//!   SIGNVAULT_DATA_DIR           - Key/metadata root (default: ./signvault-data)
//!   SIGNVAULT_LOG_FORMAT         - "json" for structured logging, "pretty" for dev
//!   SIGNVAULT_ROTATION_CHECK_SECS - Scheduled-rotation cadence (default: 3600)
//!   SIGNVAULT_CLEANUP_CHECK_SECS  - Janitor cadence (default: 3600)
//!   REDIS_HOST / REDIS_PORT / REDIS_PASSWORD / MONGO_DB_URI
//!                                - Backend wiring, surfaced to the core config

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use signvault::{
    PolicyOptions, RotationOutcome, SetupOutcome, SignOptions, Vault, VaultConfig, VaultError,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

type Shared = Arc<Vault>;

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn error_response(err: &VaultError) -> Response {
    let status = match err {
        VaultError::Validation { .. } => StatusCode::BAD_REQUEST,
        VaultError::NotFound { .. } => StatusCode::NOT_FOUND,
        VaultError::Conflict { .. } => StatusCode::CONFLICT,
        VaultError::Store { .. } | VaultError::Fatal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": err.to_string(), "kind": err.kind()}))).into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SetupReq {
    rotation_interval_days: Option<i64>,
    enabled: Option<bool>,
    note: Option<String>,
}

async fn setup_domain(
    State(state): State<Shared>,
    Path(domain): Path<String>,
    body: Option<Json<SetupReq>>,
) -> Response {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let mut opts = PolicyOptions::default();
    if let Some(days) = req.rotation_interval_days {
        opts.rotation_interval_days = days;
    }
    if let Some(enabled) = req.enabled {
        opts.enabled = enabled;
    }
    opts.note = req.note;

    match state.initial_setup_domain(&domain, Some(opts)).await {
        Ok(SetupOutcome::Created { kid }) => {
            Json(json!({"success": true, "kid": kid.to_string()})).into_response()
        }
        Ok(SetupOutcome::AlreadyExists { domain }) => (
            StatusCode::CONFLICT,
            Json(json!({"success": false, "status": "exists", "domain": domain})),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

fn rotation_response(outcome: RotationOutcome) -> Response {
    match outcome {
        RotationOutcome::Completed {
            domain,
            new_kid,
            previous_kid,
        } => Json(json!({
            "status": "completed",
            "domain": domain,
            "kid": new_kid.to_string(),
            "previousKid": previous_kid.to_string(),
        }))
        .into_response(),
        RotationOutcome::Skipped { domain, reason } => Json(json!({
            "status": "skipped",
            "domain": domain,
            "reason": reason,
        }))
        .into_response(),
        RotationOutcome::Failed { domain, error } => {
            tracing::warn!(%domain, error = %error, "rotation failed");
            error_response(&error)
        }
    }
}

async fn rotate_domain(State(state): State<Shared>, Path(domain): Path<String>) -> Response {
    match state.rotate_domain(&domain).await {
        Ok(outcome) => rotation_response(outcome),
        Err(e) => error_response(&e),
    }
}

async fn rotate_all(State(state): State<Shared>) -> Response {
    match state.rotate().await {
        Ok(summary) => Json(json!({
            "succeeded": summary.succeeded,
            "failed": summary.failed,
            "skipped": summary.skipped,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn cleanup(State(state): State<Shared>) -> Response {
    let report = state.cleanup_expired_keys().await;
    Json(json!({
        "scanned": report.scanned,
        "removed": report.removed.len(),
        "failed": report.failed.len(),
    }))
    .into_response()
}

async fn get_jwks(State(state): State<Shared>, Path(domain): Path<String>) -> Response {
    match state.get_jwks(&domain).await {
        Ok(jwks) => Json(jwks).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignReq {
    payload: Value,
    expires_in_secs: Option<i64>,
}

async fn sign(
    State(state): State<Shared>,
    Path(domain): Path<String>,
    Json(req): Json<SignReq>,
) -> Response {
    let opts = SignOptions {
        expires_in_secs: req.expires_in_secs,
    };
    match state.sign(&domain, &req.payload, opts).await {
        Ok(token) => Json(json!({"token": token})).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigureReq {
    retry_interval_ms: Option<u64>,
    max_retries: Option<u32>,
}

async fn configure(State(state): State<Shared>, Json(req): Json<ConfigureReq>) -> Response {
    match state.configure(req.retry_interval_ms, req.max_retries) {
        Ok(config) => Json(json!({
            "retryIntervalMs": config.retry_interval_ms(),
            "maxRetries": config.max_retries(),
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let log_format = std::env::var("SIGNVAULT_LOG_FORMAT").unwrap_or_else(|_| "pretty".into());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "signvault=info,signvault_api=info,tower_http=info".into());
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = VaultConfig::from_env();
    let port = config.port;
    let data_dir = config.data_dir.clone();
    let rotation_check_secs: u64 = std::env::var("SIGNVAULT_ROTATION_CHECK_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3600);
    let cleanup_check_secs: u64 = std::env::var("SIGNVAULT_CLEANUP_CHECK_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3600);

    let vault = match Vault::with_defaults(config) {
        Ok(vault) => Arc::new(vault),
        Err(e) => {
            tracing::error!(error = %e, "failed to build the signing core");
            std::process::exit(1);
        }
    };

    // Cron collaborators: scheduled rotation and janitor reaping.
    let rotation_state = vault.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(rotation_check_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match rotation_state.schedule_rotation().await {
                Ok(summary) => tracing::info!(
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    skipped = summary.skipped,
                    "scheduled rotation pass"
                ),
                Err(e) => tracing::error!(error = %e, "scheduled rotation aborted"),
            }
        }
    });
    let cleanup_state = vault.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(cleanup_check_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let report = cleanup_state.cleanup_expired_keys().await;
            tracing::info!(
                scanned = report.scanned,
                removed = report.removed.len(),
                failed = report.failed.len(),
                "cleanup pass"
            );
        }
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/domains/:domain/setup", post(setup_domain))
        .route("/api/domains/:domain/rotate", post(rotate_domain))
        .route("/api/domains/:domain/jwks", get(get_jwks))
        .route("/api/domains/:domain/sign", post(sign))
        .route("/api/rotate", post(rotate_all))
        .route("/api/cleanup", post(cleanup))
        .route("/api/scheduler/config", patch(configure))
        .layer(cors)
        .with_state(vault);

    tracing::info!(port, data_dir = %data_dir.display(), "starting signvault API server");
    let addr = format!("0.0.0.0:{}", port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr, error = %e, "bind failed");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server exited");
        std::process::exit(1);
    }
}
