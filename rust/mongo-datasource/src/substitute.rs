use crate::{
    models::{ScopedVars, TimeRange},
    templating::{InterpolationFormat, TemplateError, TemplateService},
};

/// Interpolation mode used for aggregation text. Inserted values are
/// regex-escaped since pipelines commonly feed them into `$regex` matches.
pub const AGGREGATION_FORMAT: InterpolationFormat = InterpolationFormat::Regex;

/// Replaces template variables in already-escaped aggregation text.
///
/// Empty or absent text skips the templating service and yields `""`.
/// When `range` is given, time built-ins resolve against it rather than the
/// service's shared time range.
pub fn substitute(
    templates: &dyn TemplateService,
    escaped: Option<&str>,
    scoped_vars: &ScopedVars,
    range: Option<&TimeRange>,
) -> Result<String, TemplateError> {
    match (escaped, range) {
        (Some(text), _) if text.is_empty() => Ok(String::new()),
        (Some(text), Some(range)) => {
            templates.replace_in_range(text, scoped_vars, range, AGGREGATION_FORMAT)
        }
        (Some(text), None) => templates.replace(text, scoped_vars, AGGREGATION_FORMAT),
        (None, _) => Ok(String::new()),
    }
}
