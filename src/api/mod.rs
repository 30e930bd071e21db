//! HTTP API for health checks, the tracked snapshot, and operation status

use crate::assets::Explorer;
use crate::chain::TxStatus;
use crate::config::ApiConfig;
use crate::error::{ClientError, ClientResult};
use crate::orchestrator::ContractInteractionOrchestrator;
use crate::state::SnapshotView;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::types::{Address, H256};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ContractInteractionOrchestrator>,
    pub explorer: Arc<Explorer>,
    pub identity: watch::Receiver<Option<Address>>,
    /// Instance served by `/snapshot`
    pub contract: Address,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/snapshot", get(get_snapshot))
        .route("/refresh", post(refresh_snapshot))
        .route("/status", get(get_status))
        .route("/identity", get(get_identity))
        .route("/tx/:hash", get(get_tx_status))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> ClientResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ClientError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| ClientError::Internal(format!("API server failed: {}", e)))
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Last known snapshot, including any unconfirmed local change
async fn get_snapshot(State(state): State<AppState>) -> Response {
    let store = state.orchestrator.store();
    match store.current(&state.contract) {
        Some(snapshot) => {
            let view = SnapshotView::render(
                &snapshot,
                state.orchestrator.assets(),
                &state.explorer,
                *state.identity.borrow(),
                store.has_unconfirmed_patch(&state.contract),
            );
            (StatusCode::OK, Json(view)).into_response()
        }
        None => error_response(
            StatusCode::NOT_FOUND,
            &ClientError::NoSnapshot(state.contract),
        ),
    }
}

/// Read the instance from the chain now
async fn refresh_snapshot(State(state): State<AppState>) -> Response {
    match state.orchestrator.read_snapshot(state.contract).await {
        Ok(snapshot) => {
            let view = SnapshotView::render(
                &snapshot,
                state.orchestrator.assets(),
                &state.explorer,
                *state.identity.borrow(),
                false,
            );
            (StatusCode::OK, Json(view)).into_response()
        }
        Err(e) => error_response(StatusCode::BAD_GATEWAY, &e),
    }
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.status())
}

async fn get_identity(State(state): State<AppState>) -> impl IntoResponse {
    let identity = *state.identity.borrow();
    Json(IdentityResponse {
        identity: identity.map(|a| format!("{:?}", a)),
        address_url: identity.map(|a| state.explorer.address_url(&a)),
    })
}

async fn get_tx_status(State(state): State<AppState>, Path(hash): Path<String>) -> Response {
    let tx_hash = match hash.parse::<H256>() {
        Ok(h) => h,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    kind: "invalid_input",
                    message: format!("invalid transaction hash {:?}", hash),
                }),
            )
                .into_response()
        }
    };

    match state.orchestrator.transaction_status(tx_hash).await {
        Ok(status) => Json(TxStatusResponse {
            tx_hash: format!("{:?}", tx_hash),
            tx_url: state.explorer.tx_url(&tx_hash),
            status,
        })
        .into_response(),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, &e),
    }
}

fn error_response(status: StatusCode, error: &ClientError) -> Response {
    (
        status,
        Json(ErrorResponse {
            kind: error.kind(),
            message: error.to_string(),
        }),
    )
        .into_response()
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct IdentityResponse {
    identity: Option<String>,
    address_url: Option<String>,
}

#[derive(Serialize)]
struct TxStatusResponse {
    tx_hash: String,
    tx_url: String,
    status: TxStatus,
}

#[derive(Serialize)]
struct ErrorResponse {
    kind: &'static str,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExplorerConfig;
    use crate::testing::{self, FakeChain, ALICE, FACTORY, USDC};

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ethers::types::H160;
    use serde_json::Value;
    use tower::ServiceExt;

    const DERIVATIVE: Address = H160([0xdd; 20]);

    fn app() -> (Arc<FakeChain>, Arc<ContractInteractionOrchestrator>, Router) {
        let chain = Arc::new(FakeChain::new());
        chain.add_derivative(DERIVATIVE, ALICE, USDC, testing::units(500));
        let orchestrator = Arc::new(ContractInteractionOrchestrator::new(
            chain.clone(),
            chain.clone(),
            Arc::new(testing::assets()),
            FACTORY,
        ));
        let (_tx, identity) = watch::channel(Some(ALICE));
        let state = AppState {
            orchestrator: orchestrator.clone(),
            explorer: Arc::new(Explorer::new(&ExplorerConfig {
                base_url: "https://explorer.example.com/".into(),
            })),
            identity,
            contract: DERIVATIVE,
        };
        (chain, orchestrator, router(state))
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (_, _, app) = app();
        let (status, body) = send(app, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_snapshot_not_found_before_first_read() {
        let (_, _, app) = app();
        let (status, body) = send(app, "GET", "/snapshot").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "no_snapshot");
    }

    #[tokio::test]
    async fn test_refresh_then_snapshot() {
        let (_, _, app) = app();
        let (status, body) = send(app.clone(), "POST", "/refresh").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["strike_price"], "2000.0");

        let (status, body) = send(app, "GET", "/snapshot").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["collateral_asset"], "USDC");
        assert_eq!(body["collateral_amount"], "500.0");
        assert_eq!(body["position"], "Long");
        assert_eq!(body["deployer_deposited"], "No");
        assert_eq!(body["unconfirmed"], false);
        assert!(body["address_url"]
            .as_str()
            .unwrap()
            .starts_with("https://explorer.example.com/address/0x"));
    }

    #[tokio::test]
    async fn test_refresh_failure_is_bad_gateway() {
        let (chain, orchestrator, app) = app();
        chain.fail_reads(true);
        let (status, body) = send(app, "POST", "/refresh").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["kind"], "read_failed");
        assert!(orchestrator.store().current(&DERIVATIVE).is_none());
    }

    #[tokio::test]
    async fn test_status_and_identity() {
        let (_, _, app) = app();
        let (status, body) = send(app.clone(), "GET", "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["operation"], "idle");

        let (_, body) = send(app, "GET", "/identity").await;
        assert_eq!(body["identity"], format!("{:?}", ALICE));
    }

    #[tokio::test]
    async fn test_tx_status() {
        let (_, _, app) = app();
        let (status, body) = send(app.clone(), "GET", "/tx/not-a-hash").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_input");

        let unknown = format!("/tx/{:?}", H256::repeat_byte(0x42));
        let (status, body) = send(app, "GET", &unknown).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"]["status"], "pending");
    }
}
