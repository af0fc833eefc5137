//! Dashboard template variable interpolation.
//!
//! [`TemplateService`] is the capability the adapter is handed by its host.
//! [`TemplateSrv`] is the in-process implementation used by the service
//! binary: it resolves scoped variables, dashboard variables and the
//! time-range built-ins (`$__from`, `$__to`).

use crate::models::{ScopedVars, TimeRange, VariableValue};
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unknown interpolation format '{format}' for variable '{variable}'")]
    UnknownFormat { variable: String, format: String },

    #[error("malformed variable reference at offset {0}")]
    Malformed(usize),
}

/// How a variable's value is rendered into the target text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationFormat {
    Regex,
    Pipe,
    Csv,
    Glob,
    Json,
    Raw,
    DoubleQuote,
    SingleQuote,
}

impl FromStr for InterpolationFormat {
    type Err = ();

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "regex" => Ok(Self::Regex),
            "pipe" => Ok(Self::Pipe),
            "csv" => Ok(Self::Csv),
            "glob" => Ok(Self::Glob),
            "json" => Ok(Self::Json),
            "raw" => Ok(Self::Raw),
            "doublequote" => Ok(Self::DoubleQuote),
            "singlequote" => Ok(Self::SingleQuote),
            _ => Err(()),
        }
    }
}

impl fmt::Display for InterpolationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Regex => "regex",
            Self::Pipe => "pipe",
            Self::Csv => "csv",
            Self::Glob => "glob",
            Self::Json => "json",
            Self::Raw => "raw",
            Self::DoubleQuote => "doublequote",
            Self::SingleQuote => "singlequote",
        };
        f.write_str(name)
    }
}

/// Host-provided variable interpolation.
pub trait TemplateService: Send + Sync {
    fn replace(
        &self,
        text: &str,
        scoped_vars: &ScopedVars,
        format: InterpolationFormat,
    ) -> Result<String, TemplateError>;

    /// Like [`TemplateService::replace`], with `$__from`/`$__to` taken from
    /// `range` instead of the shared time range.
    fn replace_in_range(
        &self,
        text: &str,
        scoped_vars: &ScopedVars,
        range: &TimeRange,
        format: InterpolationFormat,
    ) -> Result<String, TemplateError> {
        let _ = range;
        self.replace(text, scoped_vars, format)
    }

    fn update_time_range(&self, range: &TimeRange);
}

// `$var`, `[[var]]`, `[[var:fmt]]`, `${var}`, `${var:fmt}`
static VARIABLE_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$([A-Za-z0-9_]+)|\[\[([A-Za-z0-9_]+?)(?::([A-Za-z0-9_]+))?\]\]|\$\{([A-Za-z0-9_]+)(?::([^}]+))?\}")
        .expect("variable reference pattern is valid")
});

static BRACED_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\$\{[A-Za-z0-9_]+(?::[^}]+)?\}").expect("braced reference pattern is valid")
});

static REGEX_SPECIALS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\\^$*+?.()|\[\]{}/]").expect("regex escape pattern is valid"));

/// Escapes a value for literal use inside a regular expression.
pub fn regex_escape(value: &str) -> String {
    REGEX_SPECIALS.replace_all(value, r"\$0").into_owned()
}

#[derive(Default)]
struct TemplateState {
    variables: HashMap<String, VariableValue>,
    time_range: Option<TimeRange>,
}

/// In-process template service holding dashboard variables and the active
/// time range.
#[derive(Default)]
pub struct TemplateSrv {
    state: RwLock<TemplateState>,
}

impl TemplateSrv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a dashboard-level variable.
    pub fn set_variable(&self, name: impl Into<String>, value: VariableValue) {
        let name = name.into();
        debug!(variable = %name, "dashboard variable updated");
        self.state.write().variables.insert(name, value);
    }

    pub fn time_range(&self) -> Option<TimeRange> {
        self.state.read().time_range
    }

    fn lookup(
        &self,
        name: &str,
        scoped_vars: &ScopedVars,
        range: Option<TimeRange>,
    ) -> Option<Resolved> {
        if let Some(var) = scoped_vars.get(name) {
            return Some(Resolved::Value(var.value.clone()));
        }

        let state = self.state.read();
        if let Some(value) = state.variables.get(name) {
            return Some(Resolved::Value(value.clone()));
        }

        let range = range.or(state.time_range)?;
        match name {
            "__from" => Some(Resolved::Instant(range.from)),
            "__to" => Some(Resolved::Instant(range.to)),
            _ => None,
        }
    }

    fn interpolate(
        &self,
        text: &str,
        scoped_vars: &ScopedVars,
        range: Option<TimeRange>,
        format: InterpolationFormat,
    ) -> Result<String, TemplateError> {
        if let Some(offset) = find_malformed(text) {
            return Err(TemplateError::Malformed(offset));
        }

        let mut failure = None;
        let replaced = VARIABLE_REF.replace_all(text, |caps: &Captures| {
            let whole = caps[0].to_string();
            let Some(name) = caps.get(1).or(caps.get(2)).or(caps.get(4)) else {
                return whole;
            };
            let inline_format = caps.get(3).or(caps.get(5)).map(|m| m.as_str());

            let Some(resolved) = self.lookup(name.as_str(), scoped_vars, range) else {
                trace!(variable = name.as_str(), "leaving unknown variable untouched");
                return whole;
            };

            match render(name.as_str(), resolved, inline_format, format) {
                Ok(rendered) => rendered,
                Err(err) => {
                    failure.get_or_insert(err);
                    whole
                }
            }
        });

        match failure {
            Some(err) => Err(err),
            None => Ok(replaced.into_owned()),
        }
    }
}

enum Resolved {
    Value(VariableValue),
    Instant(DateTime<Utc>),
}

impl TemplateService for TemplateSrv {
    fn replace(
        &self,
        text: &str,
        scoped_vars: &ScopedVars,
        format: InterpolationFormat,
    ) -> Result<String, TemplateError> {
        self.interpolate(text, scoped_vars, None, format)
    }

    fn replace_in_range(
        &self,
        text: &str,
        scoped_vars: &ScopedVars,
        range: &TimeRange,
        format: InterpolationFormat,
    ) -> Result<String, TemplateError> {
        self.interpolate(text, scoped_vars, Some(*range), format)
    }

    fn update_time_range(&self, range: &TimeRange) {
        debug!(from = %range.from, to = %range.to, "template time range updated");
        self.state.write().time_range = Some(*range);
    }
}

fn render(
    name: &str,
    resolved: Resolved,
    inline_format: Option<&str>,
    format: InterpolationFormat,
) -> Result<String, TemplateError> {
    match resolved {
        Resolved::Instant(instant) => match inline_format {
            None => Ok(instant.timestamp_millis().to_string()),
            Some("date") | Some("date:iso") => {
                Ok(instant.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            Some("date:seconds") => Ok(instant.timestamp().to_string()),
            Some(other) => Err(TemplateError::UnknownFormat {
                variable: name.to_string(),
                format: other.to_string(),
            }),
        },
        Resolved::Value(value) => {
            let format = match inline_format {
                Some(raw) => raw.parse().map_err(|_| TemplateError::UnknownFormat {
                    variable: name.to_string(),
                    format: raw.to_string(),
                })?,
                None => format,
            };
            Ok(format_value(&value, format))
        }
    }
}

fn format_value(value: &VariableValue, format: InterpolationFormat) -> String {
    let values = value.values();
    let single = match value {
        VariableValue::Single(value) => Some(value.as_str()),
        VariableValue::Multi(values) if values.len() == 1 => Some(values[0].as_str()),
        VariableValue::Multi(_) => None,
    };

    match format {
        InterpolationFormat::Regex => match single {
            Some(value) => regex_escape(value),
            None => {
                let escaped: Vec<String> = values.iter().map(|v| regex_escape(v)).collect();
                format!("({})", escaped.join("|"))
            }
        },
        InterpolationFormat::Pipe => values.join("|"),
        InterpolationFormat::Csv | InterpolationFormat::Raw => values.join(","),
        InterpolationFormat::Glob => match single {
            Some(value) => value.to_string(),
            None => format!("{{{}}}", values.join(",")),
        },
        InterpolationFormat::Json => match value {
            VariableValue::Single(value) => serde_json::Value::from(value.as_str()).to_string(),
            VariableValue::Multi(values) => serde_json::Value::from(values.clone()).to_string(),
        },
        InterpolationFormat::DoubleQuote => values
            .iter()
            .map(|v| format!("\"{}\"", v.replace('"', "\\\"")))
            .collect::<Vec<_>>()
            .join(","),
        InterpolationFormat::SingleQuote => values
            .iter()
            .map(|v| format!("'{}'", v.replace('\'', "\\'")))
            .collect::<Vec<_>>()
            .join(","),
    }
}

/// Offset of the first `${` that does not open a well-formed reference.
fn find_malformed(text: &str) -> Option<usize> {
    text.match_indices("${")
        .map(|(start, _)| start)
        .find(|&start| !BRACED_REF.is_match(&text[start..]))
}
