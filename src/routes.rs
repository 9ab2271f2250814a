//! JSON endpoints in front of [`DiscoveryService`].

use crate::discovery::DiscoveryService;
use crate::metrics::SharedMetrics;
use crate::services::metadata::{IdpRecord, MetadataStore};
use crate::utils::nethash::client_network_hash;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub discovery: Arc<DiscoveryService>,
    pub metadata: Arc<MetadataStore>,
    pub metrics: SharedMetrics,
}

#[derive(Deserialize)]
struct LoginRequest {
    #[serde(rename = "entityID")]
    entity_id: String,
}

#[derive(Deserialize)]
struct RankingQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct SuggestionQuery {
    limit: Option<usize>,
    filter: Option<String>,
    favourite: Option<String>,
}

#[derive(Serialize)]
struct RankingResponse {
    nethash: Option<u16>,
    idps: Vec<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/login", post(login_handler))
        .route("/ranking", get(ranking_handler))
        .route("/ranking/global", get(global_ranking_handler))
        .route("/suggestions", get(suggestions_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn requester_network(peer: SocketAddr, headers: &HeaderMap) -> Option<u16> {
    let forwarded_for = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok());
    client_network_hash(peer.ip(), forwarded_for)
}

fn effective_limit(requested: Option<usize>, discovery: &DiscoveryService) -> usize {
    let size = discovery.ranking_size();
    requested.map_or(size, |limit| limit.min(size))
}

/// Record a login for the requester's network
async fn login_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> StatusCode {
    let nethash = requester_network(peer, &headers);
    state.discovery.record_login(nethash, &request.entity_id);
    StatusCode::NO_CONTENT
}

async fn ranking_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<RankingQuery>,
) -> Json<RankingResponse> {
    let nethash = requester_network(peer, &headers);
    let limit = effective_limit(query.limit, &state.discovery);
    let idps = state.discovery.ranked_idps(nethash, limit).await;
    Json(RankingResponse { nethash, idps })
}

async fn global_ranking_handler(
    State(state): State<AppState>,
    Query(query): Query<RankingQuery>,
) -> Json<RankingResponse> {
    let limit = effective_limit(query.limit, &state.discovery);
    let idps = state.discovery.global_ranked_idps(limit).await;
    Json(RankingResponse {
        nethash: None,
        idps,
    })
}

async fn suggestions_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<SuggestionQuery>,
) -> Json<Vec<IdpRecord>> {
    let nethash = requester_network(peer, &headers);
    let limit = effective_limit(query.limit, &state.discovery);
    let suggestions = state
        .discovery
        .suggested_idps(
            query.favourite.as_deref(),
            nethash,
            query.filter.as_deref(),
            limit,
        )
        .await;
    Json(suggestions)
}

/// Prometheus metrics endpoint
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// Health check endpoint
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    // without metadata every login is ignored and nothing can be suggested
    let status = if state.metadata.is_empty() {
        "degraded"
    } else {
        "healthy"
    };

    let body = serde_json::json!({
        "status": status,
        "idps": state.metadata.len(),
        "version": env!("CARGO_PKG_VERSION"),
    });

    (
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}
