//! Shields aggregation operator keys (`"$group":`) from variable
//! interpolation, which treats every `$word` as a variable reference.
//!
//! Only key-position tokens are rewritten. A `$token` in value position is a
//! legitimate substitution target and must reach the templating service as is.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::borrow::Cow;

/// Character inserted after `$` to hide an operator key from the interpolator.
pub const ESCAPE_MARKER: char = '_';

static OPERATOR_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\$[A-Za-z0-9_]+":"#).expect("operator key pattern is valid"));

static ESCAPED_OPERATOR_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\$_[A-Za-z0-9_]+":"#).expect("escaped key pattern is valid"));

/// Rewrites every `$key":` to `$_key":`.
pub fn escape(input: &str) -> Cow<'_, str> {
    OPERATOR_KEY.replace_all(input, |caps: &Captures| {
        format!("${ESCAPE_MARKER}{}", &caps[0][1..])
    })
}

/// Inverse of [`escape`]: rewrites every `$_key":` back to `$key":`.
pub fn restore(input: &str) -> Cow<'_, str> {
    ESCAPED_OPERATOR_KEY.replace_all(input, |caps: &Captures| format!("${}", &caps[0][2..]))
}
