//! Client side of the backend query engine.

use crate::{
    error::{Result, ServiceError},
    models::{
        DataFrame, DataQueryRequest, DataQueryResponse, Field, FieldType, MongoQuery, QueryError,
        ScopedVars, TimeRange,
    },
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, pin::Pin, time::Duration};
use tokio_stream::Stream;
use tracing::{debug, warn};

pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<DataQueryResponse>> + Send>>;

/// Per-target hook the backend runs on every target before sending it.
pub trait TargetPreparer: Send + Sync {
    fn apply_template_variables(
        &self,
        query: &MongoQuery,
        scoped_vars: &ScopedVars,
        range: &TimeRange,
    ) -> Result<MongoQuery>;
}

#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn query(
        &self,
        request: DataQueryRequest,
        preparer: &dyn TargetPreparer,
    ) -> Result<ResponseStream>;
}

/// Prepares every target of `request` in order, against the request's own
/// time range.
pub fn prepare_targets(
    request: &DataQueryRequest,
    preparer: &dyn TargetPreparer,
) -> Result<Vec<MongoQuery>> {
    request
        .targets
        .iter()
        .map(|target| {
            preparer.apply_template_variables(target, &request.scoped_vars, &request.range)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Sends prepared targets to the backend's `/api/ds/query` endpoint.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    config: HttpBackendConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BackendRequest<'a> {
    from: String,
    to: String,
    request_id: &'a str,
    queries: Vec<MongoQuery>,
}

#[derive(Debug, Default, Deserialize)]
struct BackendResponse {
    #[serde(default)]
    results: BTreeMap<String, BackendResult>,
}

#[derive(Debug, Default, Deserialize)]
struct BackendResult {
    #[serde(default)]
    frames: Vec<WireFrame>,
    #[serde(default)]
    error: Option<String>,
}

/// Frame as encoded by `/api/ds/query`: column metadata under `schema`,
/// column values under `data.values`, matched by position.
#[derive(Debug, Default, Deserialize)]
struct WireFrame {
    #[serde(default)]
    schema: WireSchema,
    #[serde(default)]
    data: WireData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSchema {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    ref_id: Option<String>,
    #[serde(default)]
    fields: Vec<WireField>,
}

#[derive(Debug, Deserialize)]
struct WireField {
    name: String,
    #[serde(rename = "type", default = "unknown_field_type")]
    field_type: FieldType,
}

fn unknown_field_type() -> FieldType {
    FieldType::Other
}

#[derive(Debug, Default, Deserialize)]
struct WireData {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

impl From<WireFrame> for DataFrame {
    fn from(frame: WireFrame) -> Self {
        let mut columns = frame.data.values.into_iter();
        let fields = frame
            .schema
            .fields
            .into_iter()
            .map(|field| Field {
                name: field.name,
                field_type: field.field_type,
                values: columns.next().unwrap_or_default(),
            })
            .collect();

        DataFrame {
            name: frame.schema.name,
            ref_id: frame.schema.ref_id,
            fields,
        }
    }
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| {
                ServiceError::Config(format!("failed to build backend client: {err}"))
            })?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/ds/query", self.config.url.trim_end_matches('/'))
    }

    async fn dispatch(&self, body: &BackendRequest<'_>) -> Result<BackendResponse> {
        let mut builder = self.client.post(self.endpoint()).json(body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !carries_results(status) {
            return Err(ServiceError::Transport(format!(
                "backend returned status {status}"
            )));
        }

        Ok(response.json().await?)
    }
}

/// Success, multi-status and 4xx answers all carry a per-target results body.
fn carries_results(status: StatusCode) -> bool {
    status.is_success() || status.is_client_error()
}

#[async_trait]
impl QueryBackend for HttpBackend {
    async fn query(
        &self,
        request: DataQueryRequest,
        preparer: &dyn TargetPreparer,
    ) -> Result<ResponseStream> {
        let queries = prepare_targets(&request, preparer)?;
        let body = BackendRequest {
            from: request.range.from.timestamp_millis().to_string(),
            to: request.range.to.timestamp_millis().to_string(),
            request_id: &request.request_id,
            queries,
        };
        debug!(
            request_id = %request.request_id,
            targets = body.queries.len(),
            "dispatching backend query"
        );

        let response = self.dispatch(&body).await?;
        let merged = merge_results(response, &request.targets);
        if let Some(err) = &merged.error {
            warn!(request_id = %request.request_id, error = %err.message, "backend query failed");
        }

        Ok(Box::pin(tokio_stream::once(Ok(merged))))
    }
}

/// Folds per-target results into a single response, keeping target order.
/// The first reported error wins.
fn merge_results(response: BackendResponse, targets: &[MongoQuery]) -> DataQueryResponse {
    let mut results = response.results;
    let mut merged = DataQueryResponse::default();

    let ordered = targets
        .iter()
        .filter_map(|target| {
            results
                .remove(&target.ref_id)
                .map(|result| (target.ref_id.clone(), result))
        })
        .collect::<Vec<_>>();

    for (ref_id, result) in ordered.into_iter().chain(results) {
        if let Some(message) = result.error {
            merged.error.get_or_insert(QueryError {
                message,
                ref_id: Some(ref_id.clone()),
            });
        }
        merged.data.extend(result.frames.into_iter().map(|frame| {
            let mut frame = DataFrame::from(frame);
            frame.ref_id.get_or_insert_with(|| ref_id.clone());
            frame
        }));
    }

    merged
}
