//! Read-only JSON query API over the stored opportunity rows.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use samops_core::OpportunityRow;
use samops_storage::{OppQuery, OpportunityStore, SortOrder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::warn;

pub const CRATE_NAME: &str = "samops-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn OpportunityStore>,
    /// When set, `POST /maintenance/cleanup` requires a matching
    /// `X-Admin-Token` header.
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(store: Arc<dyn OpportunityStore>, admin_token: Option<String>) -> Self {
        Self { store, admin_token }
    }
}

#[derive(Debug, Deserialize, Default)]
struct OppsParams {
    active: Option<bool>,
    naics: Option<String>,
    keyword: Option<String>,
    zip: Option<String>,
    setaside: Option<String>,
    sort: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

/// Row shape the front end consumes; a few columns carry legacy aliases.
#[derive(Debug, Serialize)]
struct OppView {
    id: String,
    title: String,
    solicitation_number: String,
    posted_date: Option<NaiveDate>,
    response_date: Option<NaiveDate>,
    set_aside: String,
    naics: String,
    #[serde(rename = "organizationName")]
    org: String,
    #[serde(rename = "place_city")]
    city: String,
    #[serde(rename = "place_state")]
    state: String,
    #[serde(rename = "place_zip")]
    zip: String,
    #[serde(rename = "website")]
    url: String,
    description: String,
}

impl From<OpportunityRow> for OppView {
    fn from(row: OpportunityRow) -> Self {
        Self {
            id: row.id,
            title: row.title,
            solicitation_number: row.solicitation_number,
            posted_date: row.posted_date,
            response_date: row.response_date,
            set_aside: row.set_aside,
            naics: row.naics,
            org: row.org,
            city: row.city,
            state: row.state,
            zip: row.zip,
            url: row.url,
            description: row.description,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/opps", get(list_opps_handler))
        .route("/maintenance/cleanup", post(cleanup_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("SAMOPS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Liveness plus database reachability; never errors.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let db_ok = state.store.ping().await.is_ok();
    Json(json!({"ok": true, "db": db_ok}))
}

async fn list_opps_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<OppsParams>,
) -> Response {
    let query = OppQuery {
        active: params.active.unwrap_or(true),
        naics: params.naics.filter(|v| !v.is_empty()),
        keyword: params.keyword.filter(|v| !v.is_empty()),
        zip: params.zip.filter(|v| !v.is_empty()),
        set_aside: params.setaside.filter(|v| !v.is_empty()),
        sort: match params.sort.as_deref() {
            Some("posted_desc") => SortOrder::PostedDesc,
            _ => SortOrder::DueThenPosted,
        },
        limit: params.limit.unwrap_or(100).clamp(1, 500),
        offset: params.offset.unwrap_or(0).max(0),
    };

    match state.store.query(&query).await {
        Ok(rows) => {
            let views: Vec<OppView> = rows.into_iter().map(OppView::from).collect();
            Json(views).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn cleanup_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(required) = &state.admin_token {
        let supplied = headers.get("x-admin-token").and_then(|v| v.to_str().ok());
        if supplied != Some(required.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"detail": "Unauthorized"})),
            )
                .into_response();
        }
    }

    match state.store.delete_expired().await {
        Ok(deleted) => Json(json!({"ok": true, "deleted": deleted})).into_response(),
        Err(err) => {
            warn!(error = %err, "manual cleanup failed");
            server_error(err)
        }
    }
}

fn server_error(err: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"detail": err.to_string()})),
    )
        .into_response()
}
