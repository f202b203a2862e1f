//! Error classification
//!
//! Turns any failure shape (a bare string, an HTTP error body, a transport
//! error) into one [`DataQueryError`]. Both functions here are total.

use serde_json::{json, Value};

use crate::error::TransportError;
use crate::models::{DataQueryError, TestingStatus};
use crate::normalize::{normalize, RawBackendResponse};

/// Message some backends put in `data.message` for every query failure
const GENERIC_DATA_MESSAGE: &str = "Query data error";

/// Fallback when nothing better is found
const DEFAULT_MESSAGE: &str = "Query error";

/// Normalize an arbitrary failure value into a [`DataQueryError`]
///
/// ```
/// # use dsq_core::classify::classify;
/// # use serde_json::json;
/// assert_eq!(classify(&json!("boom")).message, "boom");
/// assert_eq!(classify(&json!({"data": {"error": "bad expr"}})).message, "bad expr");
/// let err = classify(&json!({"status": 500, "statusText": "Internal"}));
/// assert_eq!(err.message, "Query error: 500 Internal");
/// assert_eq!(classify(&json!(null)).message, "Query error");
/// ```
pub fn classify(candidate: &Value) -> DataQueryError {
    let obj = match candidate {
        Value::String(s) => return DataQueryError::new(s.clone()),
        Value::Object(obj) => obj,
        _ => return DataQueryError::new(DEFAULT_MESSAGE),
    };

    let str_field = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);

    let mut error = DataQueryError {
        message: String::new(),
        ref_id: str_field("refId"),
        status: obj
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok()),
        status_text: str_field("statusText"),
        data: obj.get("data").filter(|d| !d.is_null()).cloned(),
    };

    error.message = match str_field("message").filter(|m| !m.is_empty()) {
        Some(message) => message,
        None => synthesize_message(&error),
    };
    error
}

fn synthesize_message(error: &DataQueryError) -> String {
    if let Some(message) = error.data_message().filter(|m| *m != GENERIC_DATA_MESSAGE) {
        return message.to_string();
    }
    if let Some(message) = error.data_error() {
        return message.to_string();
    }
    if let Some(status) = error.status {
        return match error.status_text.as_deref().filter(|t| !t.is_empty()) {
            Some(text) => format!("{}: {} {}", DEFAULT_MESSAGE, status, text),
            None => format!("{}: {}", DEFAULT_MESSAGE, status),
        };
    }
    DEFAULT_MESSAGE.to_string()
}

/// Classify a transport failure
pub fn classify_transport(err: &TransportError) -> DataQueryError {
    classify(&err.to_candidate())
}

/// Convert a failed query call into the status shown after testing a datasource
///
/// Recognises the two shapes a query-based datasource test fails with: an
/// error body from the query endpoint (`data.message`, optionally
/// `data.error`), and a per-query error inside an otherwise successful
/// response (`refId` + `message`). Anything else falls back to the
/// classified message.
pub fn classify_for_health_test(candidate: &Value) -> TestingStatus {
    let error = classify(candidate);

    if let Some(message) = error.data_message() {
        let details = error.data_error().map(|e| json!({ "message": e }));
        return TestingStatus::error(message, details);
    }
    if error.ref_id.is_some() {
        return TestingStatus::error(error.message, None);
    }
    match first_query_error(candidate) {
        Some(query_error) => TestingStatus::error(query_error.message, None),
        None => TestingStatus::error(error.message, None),
    }
}

/// First per-query error inside a full response body (`data.results`)
fn first_query_error(candidate: &Value) -> Option<DataQueryError> {
    let raw = RawBackendResponse::from_value(candidate);
    raw.results()?;
    normalize(&raw, None)
        .error()
        .filter(|e| e.ref_id.is_some())
        .cloned()
}
