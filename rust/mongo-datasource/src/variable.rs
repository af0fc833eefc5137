//! Dashboard variable population through a synthetic table query.

use crate::{
    adapter::QueryAdapter,
    error::{Result, ServiceError},
    frame::frame_to_metric_find_values,
    models::{
        DataQueryResponse, MetricFindValue, MongoQuery, QueryOptions, QueryType, VariableQuery,
    },
};
use tokio_stream::StreamExt;
use tracing::{debug, instrument};

/// Correlation id carried by every variable query target.
pub const METRIC_FIND_REF_ID: &str = "metricFindQuery";

impl From<&VariableQuery> for MongoQuery {
    fn from(query: &VariableQuery) -> Self {
        MongoQuery {
            ref_id: METRIC_FIND_REF_ID.to_string(),
            database: query.database.clone(),
            collection: query.collection.clone(),
            query_type: QueryType::Table,
            aggregation: query.aggregation.clone(),
            timestamp_field: String::new(),
            timestamp_format: String::new(),
            label_fields: Vec::new(),
            value_fields: vec![query.field_name.clone()],
            value_field_types: vec![query.field_type.clone()],
            auto_time_bound: false,
            auto_time_sort: false,
            schema_inference: false,
            schema_inference_depth: 0,
        }
    }
}

impl QueryAdapter {
    /// Runs `query` as a one-target table request and flattens the first
    /// returned frame into variable options.
    #[instrument(skip_all, fields(database = %query.database, collection = %query.collection))]
    pub async fn resolve_variable_query(
        &self,
        query: &VariableQuery,
        options: QueryOptions,
    ) -> Result<Vec<MetricFindValue>> {
        let target = MongoQuery::from(query);
        let request = options.into_request(vec![target], self.default_range());

        let mut stream = self.execute_query(request).await?;
        let mut last = None;
        while let Some(item) = stream.next().await {
            last = Some(item?);
        }

        let response = last.ok_or(ServiceError::EmptyResponse)?;
        values_from_response(response)
    }
}

fn values_from_response(response: DataQueryResponse) -> Result<Vec<MetricFindValue>> {
    if let Some(err) = response.error {
        return Err(ServiceError::Backend(err.message));
    }

    match response.data.first() {
        Some(frame) => {
            let values = frame_to_metric_find_values(frame);
            debug!(
                values = values.len(),
                frames = response.data.len(),
                "variable query resolved"
            );
            Ok(values)
        }
        None => Ok(Vec::new()),
    }
}
