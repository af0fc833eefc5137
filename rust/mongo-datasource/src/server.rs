use crate::{
    adapter::QueryAdapter,
    backend::HttpBackend,
    config::AppConfig,
    error::{Result, ServiceError},
    models::{
        DataQueryRequest, DataQueryResponse, MetricFindValue, MongoQuery, QueryOptions,
        ScopedVars, VariableQuery, VariableValue,
    },
    state::AppState,
    templating::TemplateSrv,
};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableQueryRequest {
    pub query: VariableQuery,
    #[serde(default)]
    pub options: QueryOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableQueryResponse {
    pub values: Vec<MetricFindValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateRequest {
    pub query: MongoQuery,
    #[serde(default)]
    pub scoped_vars: ScopedVars,
}

pub struct Server {
    listen_addr: SocketAddr,
    state: AppState,
}

impl Server {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let templates = Arc::new(TemplateSrv::new());
        let backend = Arc::new(HttpBackend::new(config.backend.clone())?);
        let adapter = QueryAdapter::new(templates.clone(), backend)
            .with_default_range(config.default_range);
        let state = AppState::new(config.api_key, adapter, templates);

        Ok(Self {
            listen_addr: config.listen_addr,
            state,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "mongo datasource adapter listening");
        axum::serve(listener, build_router(self.state)).await?;
        Ok(())
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/api/query", post(query))
        .route("/api/variable-query", post(variable_query))
        .route("/api/translate", post(translate))
        .route("/api/variables/:name", put(set_variable))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DataQueryRequest>,
) -> Result<Json<DataQueryResponse>> {
    enforce_api_key(&headers, &state)?;
    if let Some(target) = request
        .targets
        .iter()
        .find(|target| !target.has_consistent_value_fields())
    {
        return Err(ServiceError::InvalidRequest(format!(
            "target '{}' declares {} value fields but {} value field types",
            target.ref_id,
            target.value_fields.len(),
            target.value_field_types.len()
        )));
    }

    let mut stream = state.adapter.execute_query(request).await?;
    let mut last = None;
    while let Some(item) = stream.next().await {
        last = Some(item?);
    }

    last.map(Json).ok_or(ServiceError::EmptyResponse)
}

async fn variable_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<VariableQueryRequest>,
) -> Result<Json<VariableQueryResponse>> {
    enforce_api_key(&headers, &state)?;
    let values = state
        .adapter
        .resolve_variable_query(&request.query, request.options)
        .await?;
    Ok(Json(VariableQueryResponse { values }))
}

async fn translate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TranslateRequest>,
) -> Result<Json<MongoQuery>> {
    enforce_api_key(&headers, &state)?;
    let adapted = state
        .adapter
        .adapt_query(&request.query, &request.scoped_vars)?;
    Ok(Json(adapted))
}

async fn set_variable(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(value): Json<VariableValue>,
) -> Result<StatusCode> {
    enforce_api_key(&headers, &state)?;
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ServiceError::InvalidRequest(format!(
            "invalid variable name '{name}'"
        )));
    }
    state.templates.set_variable(name, value);
    Ok(StatusCode::NO_CONTENT)
}

fn enforce_api_key(headers: &HeaderMap, state: &AppState) -> Result<()> {
    if let Some(expected) = &state.api_key {
        let provided = headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok());

        if provided != Some(expected.as_ref()) {
            return Err(ServiceError::Auth);
        }
    }

    Ok(())
}
