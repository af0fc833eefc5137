use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{self, Request, StatusCode},
    Router,
};
use mongo_datasource::{
    adapter::QueryAdapter,
    backend::{prepare_targets, QueryBackend, ResponseStream, TargetPreparer},
    error::Result,
    models::{DataQueryRequest, DataQueryResponse, MongoQuery},
    server::build_router,
    state::AppState,
    templating::TemplateSrv,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Once};
use tower::ServiceExt;

pub const API_KEY: &str = "test-api-key";

static TRACING_INIT: Once = Once::new();

/// What the stub backend observed for one request.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub request: DataQueryRequest,
    pub prepared: Vec<MongoQuery>,
}

/// Backend double that answers every request with a canned response.
pub struct StubBackend {
    response: DataQueryResponse,
    seen: Mutex<Vec<SeenRequest>>,
}

impl StubBackend {
    pub fn new(response: DataQueryResponse) -> Arc<Self> {
        Arc::new(Self {
            response,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl QueryBackend for StubBackend {
    async fn query(
        &self,
        request: DataQueryRequest,
        preparer: &dyn TargetPreparer,
    ) -> Result<ResponseStream> {
        let prepared = prepare_targets(&request, preparer)?;
        self.seen.lock().push(SeenRequest { request, prepared });
        Ok(Box::pin(tokio_stream::once(Ok(self.response.clone()))))
    }
}

pub struct TestHarness {
    router: Router,
    pub backend: Arc<StubBackend>,
}

impl TestHarness {
    pub fn new(response: DataQueryResponse) -> Self {
        TRACING_INIT.call_once(|| {
            let _ = tracing_subscriber::fmt::try_init();
        });

        let backend = StubBackend::new(response);
        let templates = Arc::new(TemplateSrv::new());
        let adapter = QueryAdapter::new(templates.clone(), backend.clone());
        let state = AppState::new(Some(API_KEY.to_string()), adapter, templates);

        Self {
            router: build_router(state),
            backend,
        }
    }

    pub async fn get(&self, path: &str) -> http::Response<Body> {
        self.send("GET", path, &(), true).await
    }

    pub async fn post<T: Serialize>(&self, path: &str, payload: &T) -> http::Response<Body> {
        self.send("POST", path, payload, true).await
    }

    pub async fn put<T: Serialize>(&self, path: &str, payload: &T) -> http::Response<Body> {
        self.send("PUT", path, payload, true).await
    }

    pub async fn post_without_api_key<T: Serialize>(
        &self,
        path: &str,
        payload: &T,
    ) -> http::Response<Body> {
        self.send("POST", path, payload, false).await
    }

    async fn send<T: Serialize>(
        &self,
        method: &str,
        path: &str,
        payload: &T,
        include_api_key: bool,
    ) -> http::Response<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/json");

        if include_api_key {
            builder = builder.header("x-api-key", API_KEY);
        }

        let body = serde_json::to_vec(payload).expect("request payload should serialize");
        let request = builder
            .body(Body::from(body))
            .expect("failed to build harness request");

        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request")
    }
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should be readable");
    if bytes.is_empty() {
        return (status, Value::Null);
    }
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}
