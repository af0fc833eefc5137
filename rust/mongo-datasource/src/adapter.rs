use crate::{
    backend::{QueryBackend, ResponseStream, TargetPreparer},
    error::Result,
    escape::{escape, restore},
    models::{DataQueryRequest, MongoQuery, ScopedVars, TimeRange},
    substitute::substitute,
    templating::TemplateService,
};
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Returns a copy of `query` with template variables resolved in its
/// aggregation. Operator keys are escaped around the substitution so the
/// templating service never sees them as variable references.
pub fn adapt_query(
    templates: &dyn TemplateService,
    query: &MongoQuery,
    scoped_vars: &ScopedVars,
) -> Result<MongoQuery> {
    adapt(templates, query, scoped_vars, None)
}

/// [`adapt_query`] with `$__from`/`$__to` bound to `range`.
pub fn adapt_query_in_range(
    templates: &dyn TemplateService,
    query: &MongoQuery,
    scoped_vars: &ScopedVars,
    range: &TimeRange,
) -> Result<MongoQuery> {
    adapt(templates, query, scoped_vars, Some(range))
}

fn adapt(
    templates: &dyn TemplateService,
    query: &MongoQuery,
    scoped_vars: &ScopedVars,
    range: Option<&TimeRange>,
) -> Result<MongoQuery> {
    let escaped = query.aggregation.as_deref().map(escape);
    let replaced = substitute(templates, escaped.as_deref(), scoped_vars, range)?;
    let aggregation = restore(&replaced).into_owned();

    Ok(MongoQuery {
        aggregation: Some(aggregation),
        ..query.clone()
    })
}

const DEFAULT_RANGE_HOURS: i64 = 6;

/// Adapts dashboard requests before they reach the backend.
#[derive(Clone)]
pub struct QueryAdapter {
    templates: Arc<dyn TemplateService>,
    backend: Arc<dyn QueryBackend>,
    default_range: Duration,
}

impl QueryAdapter {
    pub fn new(templates: Arc<dyn TemplateService>, backend: Arc<dyn QueryBackend>) -> Self {
        Self {
            templates,
            backend,
            default_range: Duration::hours(DEFAULT_RANGE_HOURS),
        }
    }

    /// Window used when a variable query arrives without a time range.
    pub fn with_default_range(mut self, range: Duration) -> Self {
        self.default_range = range;
        self
    }

    pub fn default_range(&self) -> Duration {
        self.default_range
    }

    pub fn adapt_query(&self, query: &MongoQuery, scoped_vars: &ScopedVars) -> Result<MongoQuery> {
        adapt_query(self.templates.as_ref(), query, scoped_vars)
    }

    /// Syncs the template time range with the request, then hands the request
    /// to the backend unchanged. Targets are adapted by the backend through
    /// [`TargetPreparer`], with time built-ins bound to the request's own
    /// range so concurrent requests never see each other's window.
    #[instrument(skip_all, fields(request_id = %request.request_id, targets = request.targets.len()))]
    pub async fn execute_query(&self, request: DataQueryRequest) -> Result<ResponseStream> {
        self.templates.update_time_range(&request.range);
        debug!("forwarding request to backend");
        self.backend.query(request, self).await
    }
}

impl TargetPreparer for QueryAdapter {
    fn apply_template_variables(
        &self,
        query: &MongoQuery,
        scoped_vars: &ScopedVars,
        range: &TimeRange,
    ) -> Result<MongoQuery> {
        adapt_query_in_range(self.templates.as_ref(), query, scoped_vars, range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::prepare_targets,
        error::ServiceError,
        models::{DataFrame, DataQueryResponse, Field, FieldType, QueryType, ScopedVar},
        templating::{TemplateError, TemplateSrv},
    };
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio_stream::StreamExt;

    fn scoped(name: &str, value: &str) -> ScopedVars {
        let mut vars = ScopedVars::new();
        vars.insert(name.to_string(), ScopedVar::new(value));
        vars
    }

    fn panel_query(aggregation: Option<&str>) -> MongoQuery {
        MongoQuery {
            ref_id: "A".into(),
            database: "metrics".into(),
            collection: "cpu".into(),
            query_type: QueryType::Timeseries,
            aggregation: aggregation.map(str::to_string),
            timestamp_field: "ts".into(),
            timestamp_format: "2006-01-02".into(),
            label_fields: vec!["host".into()],
            value_fields: vec!["usage".into()],
            value_field_types: vec!["double".into()],
            auto_time_bound: true,
            auto_time_sort: true,
            schema_inference: true,
            schema_inference_depth: 20,
        }
    }

    #[test]
    fn operator_keys_survive_substitution() {
        let templates = TemplateSrv::new();
        let query = panel_query(Some(r#"{"$group": {"_id": "$field"}}"#));

        let adapted = adapt_query(&templates, &query, &ScopedVars::new()).unwrap();
        assert_eq!(
            adapted.aggregation.as_deref(),
            Some(r#"{"$group": {"_id": "$field"}}"#)
        );
    }

    #[test]
    fn operator_key_named_like_a_variable_is_not_substituted() {
        let templates = TemplateSrv::new();
        let query = panel_query(Some(r#"[{"$match": {"host": "$match"}}]"#));

        let adapted = adapt_query(&templates, &query, &scoped("match", "web.1")).unwrap();
        assert_eq!(
            adapted.aggregation.as_deref(),
            Some(r#"[{"$match": {"host": "web\.1"}}]"#)
        );
    }

    #[test]
    fn value_position_variables_are_regex_escaped() {
        let templates = TemplateSrv::new();
        let query = panel_query(Some(
            r#"[{"$match": {"host": {"$regex": "^$host$"}}}]"#,
        ));

        let adapted = adapt_query(&templates, &query, &scoped("host", "a|b")).unwrap();
        assert_eq!(
            adapted.aggregation.as_deref(),
            Some(r#"[{"$match": {"host": {"$regex": "^a\|b$"}}}]"#)
        );
    }

    #[test]
    fn other_fields_pass_through_and_input_is_untouched() {
        let templates = TemplateSrv::new();
        let query = panel_query(Some(r#"{"$limit": 1}"#));
        let before = query.clone();

        let adapted = adapt_query(&templates, &query, &ScopedVars::new()).unwrap();
        assert_eq!(query, before);
        assert_eq!(
            adapted,
            MongoQuery {
                aggregation: Some(r#"{"$limit": 1}"#.into()),
                ..before
            }
        );
    }

    #[test]
    fn missing_aggregation_becomes_empty_string() {
        let templates = TemplateSrv::new();
        let adapted = adapt_query(&templates, &panel_query(None), &ScopedVars::new()).unwrap();
        assert_eq!(adapted.aggregation.as_deref(), Some(""));
    }

    #[test]
    fn substitution_errors_propagate() {
        let templates = TemplateSrv::new();
        let query = panel_query(Some(r#"{"host": "${host"}"#));
        let err = adapt_query(&templates, &query, &ScopedVars::new()).unwrap_err();
        assert!(
            matches!(err, ServiceError::Template(TemplateError::Malformed(10))),
            "{err:?}"
        );
    }

    /// Records what the backend saw, including the template time range at
    /// the moment the call arrived.
    struct RecordingBackend {
        templates: Arc<TemplateSrv>,
        seen: Mutex<Vec<(Option<TimeRange>, Vec<MongoQuery>)>>,
    }

    #[async_trait]
    impl QueryBackend for RecordingBackend {
        async fn query(
            &self,
            request: DataQueryRequest,
            preparer: &dyn TargetPreparer,
        ) -> Result<ResponseStream> {
            let prepared = prepare_targets(&request, preparer)?;
            self.seen.lock().push((self.templates.time_range(), prepared));
            let response = DataQueryResponse::default();
            Ok(Box::pin(tokio_stream::once(Ok(response))))
        }
    }

    #[tokio::test]
    async fn execute_syncs_time_range_before_backend_call() {
        let templates = Arc::new(TemplateSrv::new());
        let backend = Arc::new(RecordingBackend {
            templates: Arc::clone(&templates),
            seen: Mutex::new(Vec::new()),
        });
        let adapter = QueryAdapter::new(templates.clone(), backend.clone());

        let range = TimeRange {
            from: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            to: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::hours(1),
        };
        let request = DataQueryRequest {
            request_id: "req-1".into(),
            targets: vec![panel_query(Some(
                r#"[{"$match": {"ts": {"$gte": $__from}}}]"#,
            ))],
            range,
            scoped_vars: ScopedVars::new(),
            interval_ms: None,
            max_data_points: None,
            panel_id: None,
            dashboard_uid: None,
            timezone: "utc".into(),
        };

        let mut stream = adapter.execute_query(request).await.unwrap();
        let response = stream.next().await.unwrap().unwrap();
        assert_eq!(response, DataQueryResponse::default());

        let seen = backend.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, Some(range));
        assert_eq!(
            seen[0].1[0].aggregation.as_deref(),
            Some(r#"[{"$match": {"ts": {"$gte": 1709251200000}}}]"#)
        );
    }

    /// Answers with the prepared aggregation so each caller can check what
    /// its own targets became.
    struct EchoBackend;

    #[async_trait]
    impl QueryBackend for EchoBackend {
        async fn query(
            &self,
            request: DataQueryRequest,
            preparer: &dyn TargetPreparer,
        ) -> Result<ResponseStream> {
            tokio::task::yield_now().await;
            let prepared = prepare_targets(&request, preparer)?;
            let response = DataQueryResponse {
                data: vec![DataFrame {
                    name: None,
                    ref_id: Some(request.request_id.clone()),
                    fields: vec![Field {
                        name: "aggregation".into(),
                        field_type: FieldType::String,
                        values: prepared
                            .iter()
                            .map(|query| json!(query.aggregation))
                            .collect(),
                    }],
                }],
                error: None,
            };
            Ok(Box::pin(tokio_stream::once(Ok(response))))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_resolve_their_own_time_range() {
        let adapter = QueryAdapter::new(Arc::new(TemplateSrv::new()), Arc::new(EchoBackend));
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let handles: Vec<_> = (0..500i64)
            .map(|i| {
                let adapter = adapter.clone();
                let from = base + Duration::minutes(i);
                tokio::spawn(async move {
                    let request = DataQueryRequest {
                        request_id: format!("req-{i}"),
                        targets: vec![panel_query(Some("$__from"))],
                        range: TimeRange {
                            from,
                            to: from + Duration::hours(1),
                        },
                        scoped_vars: ScopedVars::new(),
                        interval_ms: None,
                        max_data_points: None,
                        panel_id: None,
                        dashboard_uid: None,
                        timezone: "utc".into(),
                    };
                    let mut stream = adapter.execute_query(request).await.unwrap();
                    let response = stream.next().await.unwrap().unwrap();
                    (from, response.data[0].fields[0].values[0].clone())
                })
            })
            .collect();

        for handle in handles {
            let (from, aggregation) = handle.await.unwrap();
            assert_eq!(aggregation, json!(from.timestamp_millis().to_string()));
        }
    }
}
