//! HTTP API Server
//!
//! REST API for minting, peer replication, chain export and node status.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result, ValidationError};
use crate::ledger::{Block, Record};
use crate::node::NotaryNode;
use crate::reconcile::ReconcileOutcome;
use crate::replication::protocol::{ErrorResponse, MintRequest, MintResponse};
use crate::replication::{SyncOutcome, SyncResponse};

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    bind_address: String,
    node: Arc<NotaryNode>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, bind_address: String, node: Arc<NotaryNode>) -> Self {
        Self {
            config,
            bind_address,
            node,
        }
    }

    /// Create the router
    pub fn router(node: Arc<NotaryNode>, cors_enabled: bool) -> Router {
        let router = Router::new()
            // Client operations
            .route("/register", post(handle_register))
            .route("/verify/:needle", get(handle_verify))
            .route("/documents", get(handle_documents))
            // Peer operations
            .route("/sync", post(handle_sync))
            .route("/blockchain", get(handle_blockchain))
            .route("/reconcile", post(handle_reconcile))
            // Status and info
            .route("/status", get(handle_status))
            .route("/health", get(handle_health))
            .layer(TraceLayer::new_for_http())
            .with_state(node);

        if cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Bind and serve until `shutdown` resolves
    pub async fn start<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.bind_address);
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = Self::router(Arc::clone(&self.node), self.config.cors_enabled);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub address: String,
    pub role: String,
}

/// Record lookup response
#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<Block>,
}

/// Document listing response
#[derive(Debug, Serialize)]
pub struct DocumentsResponse {
    pub count: usize,
    pub documents: Vec<Record>,
}

/// Reconciliation response
#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ValidationError>,
}

impl From<ReconcileOutcome> for ReconcileResponse {
    fn from(outcome: ReconcileOutcome) -> Self {
        let mut response = Self {
            outcome: "",
            source: None,
            length: None,
            reason: None,
        };
        response.outcome = match outcome {
            ReconcileOutcome::NoPeers => "no_peers",
            ReconcileOutcome::Unreachable => "unreachable",
            ReconcileOutcome::Disconnected => "disconnected",
            ReconcileOutcome::Adopted { source, length } => {
                response.source = Some(source);
                response.length = Some(length);
                "adopted"
            }
            ReconcileOutcome::Kept(reason) => {
                response.reason = Some(reason);
                "kept"
            }
        };
        response
    }
}

fn error_response(status: StatusCode, code: &str, error: String, leader: Option<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error,
            code: code.to_string(),
            leader,
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_register(
    State(node): State<Arc<NotaryNode>>,
    body: std::result::Result<Json<MintRequest>, JsonRejection>,
) -> Response {
    let document = match body {
        Ok(Json(MintRequest { document: Some(document) })) if !document.is_null() => document,
        Ok(_) => {
            return error_response(StatusCode::BAD_REQUEST, "BAD_REQUEST", "document is required".into(), None);
        }
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, "BAD_REQUEST", rejection.body_text(), None);
        }
    };

    match node.mint(document).await {
        Ok((block, _replication)) => (
            StatusCode::CREATED,
            Json(MintResponse {
                status: "registered".to_string(),
                block,
            }),
        )
            .into_response(),
        Err(Error::LeaderRequired { leader }) => error_response(
            StatusCode::FORBIDDEN,
            "LEADER_REQUIRED",
            "only the leader registers documents".into(),
            leader,
        ),
        Err(Error::ShuttingDown) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "SHUTTING_DOWN",
            "node is shutting down".into(),
            None,
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e.to_string(), None),
    }
}

async fn handle_sync(
    State(node): State<Arc<NotaryNode>>,
    body: std::result::Result<Json<Value>, JsonRejection>,
) -> Response {
    let outcome = match body {
        Ok(Json(value)) => node.sync_value(value).await,
        Err(rejection) => SyncOutcome::Rejected(ValidationError::Malformed {
            detail: rejection.body_text(),
        }),
    };

    let status = if outcome.is_accepted() {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    (status, Json(SyncResponse::from(outcome))).into_response()
}

async fn handle_blockchain(State(node): State<Arc<NotaryNode>>) -> impl IntoResponse {
    Json(node.export_chain().await)
}

async fn handle_status(State(node): State<Arc<NotaryNode>>) -> impl IntoResponse {
    Json(node.status().await)
}

async fn handle_health(State(node): State<Arc<NotaryNode>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        address: node.address().to_string(),
        role: node.role().to_string(),
    })
}

async fn handle_verify(State(node): State<Arc<NotaryNode>>, Path(needle): Path<String>) -> Response {
    match node.find_record(&needle).await {
        Some(block) => Json(VerifyResponse {
            found: true,
            block: Some(block),
        })
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(VerifyResponse {
                found: false,
                block: None,
            }),
        )
            .into_response(),
    }
}

async fn handle_documents(State(node): State<Arc<NotaryNode>>) -> impl IntoResponse {
    let documents = node.records().await;
    Json(DocumentsResponse {
        count: documents.len(),
        documents,
    })
}

async fn handle_reconcile(State(node): State<Arc<NotaryNode>>) -> impl IntoResponse {
    Json(ReconcileResponse::from(node.reconcile().await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotaryConfig;
    use crate::coordination::MemoryBackend;
    use crate::ledger::Ledger;
    use crate::replication::PeerTransport;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    struct Offline;

    #[async_trait::async_trait]
    impl PeerTransport for Offline {
        async fn push_block(&self, peer: &str, _block: &Block) -> Result<SyncOutcome> {
            Err(Error::Network(peer.to_string()))
        }

        async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>> {
            Err(Error::Network(peer.to_string()))
        }
    }

    fn follower_node() -> Arc<NotaryNode> {
        let config = NotaryConfig::for_address("a:1");
        Arc::new(NotaryNode::new(&config, Arc::new(MemoryBackend::new()), Arc::new(Offline)))
    }

    async fn call(node: &Arc<NotaryNode>, method: &str, uri: &str, body: Option<String>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map(Body::from).unwrap_or_else(Body::empty))
            .unwrap();

        let response = HttpServer::router(Arc::clone(node), false).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_register_on_follower_is_forbidden() {
        let node = follower_node();
        let (status, body) = call(&node, "POST", "/register", Some(json!({"document": "x"}).to_string())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "LEADER_REQUIRED");
    }

    #[tokio::test]
    async fn test_register_without_document() {
        let node = follower_node();
        let (status, _) = call(&node, "POST", "/register", Some("{}".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_sync_accepts_and_rejects() {
        let node = follower_node();
        let leader = Ledger::new(0);
        let block = leader.append_local(json!({"hash": "d1"})).await.unwrap();
        let push = json!({ "block": block }).to_string();

        let (status, body) = call(&node, "POST", "/sync", Some(push.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "synced");

        let (status, body) = call(&node, "POST", "/sync", Some(push)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["reason"]["reason"], "duplicate");

        let (status, body) = call(&node, "POST", "/sync", Some("{not json".into())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["reason"]["reason"], "malformed");

        let (status, body) = call(&node, "GET", "/verify/d1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["block"]["index"], 1);

        let (status, _) = call(&node, "GET", "/verify/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&node, "GET", "/documents", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["documents"][0]["index"], 1);
        assert_eq!(body["documents"][0]["payload"]["hash"], "d1");
    }

    #[tokio::test]
    async fn test_blockchain_and_status() {
        let node = follower_node();

        let (status, body) = call(&node, "GET", "/blockchain", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["index"], 0);
        assert_eq!(body[0]["previous_hash"], "0");
        assert_eq!(body[0]["timestamp"], "2022-12-31T21:00:00.000000Z");

        let (status, body) = call(&node, "GET", "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_leader"], false);
        assert_eq!(body["role"], "CONNECTING");
        assert_eq!(body["chain_length"], 1);
    }
}
