//! Wire types shared by the adapter, the backend client and the HTTP surface.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Shape of the result the backend should produce for a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    #[default]
    Timeseries,
    Table,
}

/// A single datasource target, as authored in a dashboard panel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MongoQuery {
    pub ref_id: String,
    pub database: String,
    pub collection: String,
    pub query_type: QueryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<String>,
    pub timestamp_field: String,
    pub timestamp_format: String,
    pub label_fields: Vec<String>,
    pub value_fields: Vec<String>,
    pub value_field_types: Vec<String>,
    pub auto_time_bound: bool,
    pub auto_time_sort: bool,
    pub schema_inference: bool,
    pub schema_inference_depth: u32,
}

impl MongoQuery {
    /// Every declared value field must carry exactly one declared type.
    pub fn has_consistent_value_fields(&self) -> bool {
        self.value_fields.len() == self.value_field_types.len()
    }
}

/// Reduced query used to populate a dashboard variable's options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VariableQuery {
    pub database: String,
    pub collection: String,
    pub field_name: String,
    pub field_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<String>,
}

/// Current value of a template variable: one selection or several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableValue {
    Single(String),
    Multi(Vec<String>),
}

impl VariableValue {
    pub fn values(&self) -> Vec<&str> {
        match self {
            VariableValue::Single(value) => vec![value.as_str()],
            VariableValue::Multi(values) => values.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        VariableValue::Single(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedVar {
    #[serde(default)]
    pub text: Option<String>,
    pub value: VariableValue,
}

impl ScopedVar {
    pub fn new(value: impl Into<VariableValue>) -> Self {
        Self {
            text: None,
            value: value.into(),
        }
    }
}

pub type ScopedVars = HashMap<String, ScopedVar>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    /// Window of the given length ending now.
    pub fn last(window: Duration) -> Self {
        let to = Utc::now();
        Self {
            from: to - window,
            to,
        }
    }
}

/// A query execution request carrying one or more targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQueryRequest {
    pub request_id: String,
    pub targets: Vec<MongoQuery>,
    pub range: TimeRange,
    #[serde(default)]
    pub scoped_vars: ScopedVars,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_data_points: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panel_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_uid: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "browser".to_string()
}

/// Caller-supplied settings for a variable query. Anything left unset falls
/// back to a default when the request is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptions {
    pub range: Option<TimeRange>,
    pub request_id: Option<String>,
    pub scoped_vars: ScopedVars,
    pub interval_ms: Option<u64>,
    pub max_data_points: Option<u64>,
    pub panel_id: Option<i64>,
    pub dashboard_uid: Option<String>,
    pub timezone: Option<String>,
}

impl QueryOptions {
    pub fn into_request(self, targets: Vec<MongoQuery>, default_range: Duration) -> DataQueryRequest {
        DataQueryRequest {
            request_id: self
                .request_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            targets,
            range: self.range.unwrap_or_else(|| TimeRange::last(default_range)),
            scoped_vars: self.scoped_vars,
            interval_ms: self.interval_ms,
            max_data_points: self.max_data_points,
            panel_id: self.panel_id,
            dashboard_uid: self.dashboard_uid,
            timezone: self.timezone.unwrap_or_else(default_timezone),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Time,
    Number,
    String,
    Boolean,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub values: Vec<Value>,
}

/// Columnar result table returned by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
    #[serde(default)]
    pub fields: Vec<Field>,
}

impl DataFrame {
    /// Number of rows, taken from the longest column.
    pub fn len(&self) -> usize {
        self.fields
            .iter()
            .map(|field| field.values.len())
            .max()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryError {
    pub message: String,
    #[serde(default, rename = "refId", skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataQueryResponse {
    #[serde(default)]
    pub data: Vec<DataFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricFindValue {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}
