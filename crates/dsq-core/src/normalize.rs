//! Response normalization
//!
//! Parses the body of `POST /api/ds/query` into a [`QueryResult`]. Each entry of
//! `results` may carry several historical encodings at once; which ones are
//! processed is decided in a single place, [`entry_encodings`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::classify::classify;
use crate::decode::{decode_frame, decode_series, decode_table};
use crate::error::DecodeError;
use crate::models::{DataFrame, DataQueryError, Query, QueryResult};

/// A backend response as received by the transport
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBackendResponse {
    /// HTTP status, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,

    /// Decoded JSON body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RawBackendResponse {
    /// Successful (200) response with the given body
    pub fn ok(data: Value) -> Self {
        Self {
            status: Some(200),
            status_text: Some("OK".to_string()),
            data: Some(data),
        }
    }

    /// Read a response from a loosely shaped JSON value
    ///
    /// Non-object values produce an empty response.
    pub fn from_value(value: &Value) -> Self {
        Self {
            status: value
                .get("status")
                .and_then(Value::as_u64)
                .and_then(|s| u16::try_from(s).ok()),
            status_text: value
                .get("statusText")
                .and_then(Value::as_str)
                .map(str::to_string),
            data: value.get("data").filter(|d| !d.is_null()).cloned(),
        }
    }

    /// `data.results`, when present
    pub fn results(&self) -> Option<&Map<String, Value>> {
        self.data
            .as_ref()
            .and_then(|d| d.get("results"))
            .and_then(Value::as_object)
    }

    /// JSON view handed to the error classifier
    pub fn to_candidate(&self) -> Value {
        json!({
            "status": self.status,
            "statusText": self.status_text,
            "data": self.data,
        })
    }
}

/// One historical result encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultEncoding {
    Frames,
    Series,
    Tables,
}

impl ResultEncoding {
    /// Field of the result entry holding this encoding
    pub fn key(self) -> &'static str {
        match self {
            ResultEncoding::Frames => "frames",
            ResultEncoding::Series => "series",
            ResultEncoding::Tables => "tables",
        }
    }

    /// Decode one item of this encoding
    pub fn decode(self, item: &Value) -> Result<DataFrame, DecodeError> {
        match self {
            ResultEncoding::Frames => decode_frame(item),
            ResultEncoding::Series => decode_series(item),
            ResultEncoding::Tables => decode_table(item),
        }
    }
}

/// Encodings of one result entry to process, in order
///
/// A non-empty `frames` list suppresses the legacy encodings for that entry.
/// Otherwise `series` and `tables` are both processed; they are additive.
pub fn entry_encodings(entry: &Map<String, Value>) -> Vec<(ResultEncoding, &[Value])> {
    let items = move |encoding: ResultEncoding| {
        entry
            .get(encoding.key())
            .and_then(Value::as_array)
            .filter(|items| !items.is_empty())
            .map(|items| (encoding, items.as_slice()))
    };

    if let Some(frames) = items(ResultEncoding::Frames) {
        return vec![frames];
    }
    [ResultEncoding::Series, ResultEncoding::Tables]
        .into_iter()
        .filter_map(items)
        .collect()
}

/// Normalize a raw backend response
///
/// When `queries` is given, results are collected in query order and
/// refIds the caller did not ask for are ignored. Never fails: malformed
/// input yields an empty or error result.
pub fn normalize(raw: &RawBackendResponse, queries: Option<&[Query]>) -> QueryResult {
    let mut result = QueryResult::empty();

    if let Some(results) = raw.results() {
        let ref_ids: Vec<&str> = match queries {
            Some(queries) => queries.iter().map(|q| q.ref_id.as_str()).collect(),
            None => results.keys().map(String::as_str).collect(),
        };

        for ref_id in ref_ids {
            let Some(entry) = results.get(ref_id).and_then(Value::as_object) else {
                continue;
            };

            if let Some(message) = entry.get("error").and_then(Value::as_str) {
                if !message.is_empty()
                    && !result.record_error(DataQueryError::for_ref_id(ref_id, message))
                {
                    debug!(ref_id = %ref_id, error = %message, "Dropping additional query error");
                }
            }

            for (encoding, items) in entry_encodings(entry) {
                for item in items {
                    match encoding.decode(item) {
                        Ok(mut frame) => {
                            frame.stamp_ref_id(ref_id);
                            result.data.push(frame);
                        }
                        Err(e) => {
                            warn!(ref_id = %ref_id, error = %e, "Skipping undecodable result item")
                        }
                    }
                }
            }
        }
    }

    if let Some(status) = raw.status.filter(|s| *s != 200) {
        if !result.is_error() {
            debug!(status, "Non-200 query response");
            result.record_error(classify(&raw.to_candidate()));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LoadingState;
    use pretty_assertions::assert_eq;

    fn frame_json(ref_id: Option<&str>, value: i64) -> Value {
        let mut schema = json!({"fields": [{"name": "v", "type": "number"}]});
        if let Some(r) = ref_id {
            schema["refId"] = json!(r);
        }
        json!({"schema": schema, "data": {"values": [[value]]}})
    }

    #[test]
    fn frames_are_decoded_and_stamped() {
        let raw =
            RawBackendResponse::ok(json!({"results": {"A": {"frames": [frame_json(None, 1)]}}}));
        let result = normalize(&raw, Some(&[Query::new("A")][..]));

        assert_eq!(result.state(), LoadingState::Done);
        assert_eq!(result.data.len(), 1);
        assert_eq!(result.data[0].ref_id.as_deref(), Some("A"));
        assert_eq!(result.data[0].fields[0].values, vec![json!(1)]);
    }

    #[test]
    fn per_query_error() {
        let raw = RawBackendResponse::ok(json!({"results": {"A": {"error": "boom"}}}));
        let result = normalize(&raw, None);

        assert_eq!(result.state(), LoadingState::Error);
        assert!(result.data.is_empty());
        assert_eq!(result.error(), Some(&DataQueryError::for_ref_id("A", "boom")));
    }

    #[test]
    fn http_failure_without_results() {
        let raw = RawBackendResponse {
            status: Some(500),
            status_text: Some("Internal".into()),
            data: None,
        };
        let result = normalize(&raw, None);

        assert_eq!(result.state(), LoadingState::Error);
        assert_eq!(result.error().unwrap().message, "Query error: 500 Internal");
    }

    #[test]
    fn missing_or_empty_results() {
        let result = normalize(&RawBackendResponse::ok(json!({})), None);
        assert_eq!(result, QueryResult::empty());

        let result = normalize(&RawBackendResponse::ok(json!({"results": {}})), None);
        assert_eq!(result, QueryResult::empty());

        let result = normalize(&RawBackendResponse::default(), None);
        assert_eq!(result, QueryResult::empty());
    }

    #[test]
    fn only_first_error_is_kept() {
        let raw = RawBackendResponse::ok(json!({"results": {
            "A": {"error": "first"},
            "B": {"error": "second"},
            "C": {"error": "third"}
        }}));
        let result = normalize(&raw, None);
        assert_eq!(result.error().unwrap().message, "first");
        assert_eq!(result.error().unwrap().ref_id.as_deref(), Some("A"));

        let queries = [Query::new("C"), Query::new("A")];
        let result = normalize(&raw, Some(&queries[..]));
        assert_eq!(result.error().unwrap().message, "third");
    }

    #[test]
    fn query_order_wins_and_unrequested_refids_are_skipped() {
        let raw = RawBackendResponse::ok(json!({"results": {
            "A": {"frames": [frame_json(None, 1)]},
            "B": {"frames": [frame_json(None, 2)]},
            "X": {"frames": [frame_json(None, 9)]}
        }}));
        let queries = [Query::new("B"), Query::new("A"), Query::new("missing")];
        let result = normalize(&raw, Some(&queries[..]));

        let ref_ids: Vec<_> = result.data.iter().map(|f| f.ref_id.clone().unwrap()).collect();
        assert_eq!(ref_ids, vec!["B", "A"]);
    }

    #[test]
    fn frames_suppress_legacy_encodings() {
        let raw = RawBackendResponse::ok(json!({"results": {"A": {
            "frames": [frame_json(None, 1)],
            "series": [{"target": "s", "datapoints": [[1, 1]]}],
            "tables": [{"columns": [{"text": "c"}], "rows": [[1]]}]
        }}}));
        let result = normalize(&raw, None);
        assert_eq!(result.data.len(), 1);
        assert!(result.data[0].name.is_none());
    }

    #[test]
    fn series_and_tables_are_additive() {
        let raw = RawBackendResponse::ok(json!({"results": {"A": {
            "frames": [],
            "series": [{"target": "s", "datapoints": [[1, 1]]}],
            "tables": [{"columns": [{"text": "c"}], "rows": [[1]], "refId": "T"}]
        }}}));
        let result = normalize(&raw, None);
        assert_eq!(result.data.len(), 2);
        assert_eq!(result.data[0].name.as_deref(), Some("s"));
        assert_eq!(result.data[0].ref_id.as_deref(), Some("A"));
        assert_eq!(result.data[1].ref_id.as_deref(), Some("T"));
    }

    #[test]
    fn entry_encodings_precedence() {
        let entry = json!({"series": [{}], "tables": [{}]});
        let kinds: Vec<_> = entry_encodings(entry.as_object().unwrap())
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(kinds, vec![ResultEncoding::Series, ResultEncoding::Tables]);

        let entry = json!({"frames": [{}], "tables": [{}]});
        let kinds: Vec<_> = entry_encodings(entry.as_object().unwrap())
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(kinds, vec![ResultEncoding::Frames]);
    }

    #[test]
    fn error_and_frames_together() {
        let raw = RawBackendResponse::ok(json!({"results": {
            "A": {"frames": [frame_json(None, 1)], "error": "partial"},
            "B": {"frames": [frame_json(Some("B2"), 2)]}
        }}));
        let result = normalize(&raw, None);
        assert_eq!(result.state(), LoadingState::Error);
        assert_eq!(result.data.len(), 2);
        assert_eq!(result.data[1].ref_id.as_deref(), Some("B2"));
    }

    #[test]
    fn non_200_keeps_per_query_error() {
        let raw = RawBackendResponse {
            status: Some(400),
            status_text: Some("Bad Request".into()),
            data: Some(json!({"results": {"A": {"error": "parse error"}}})),
        };
        let result = normalize(&raw, None);
        assert_eq!(result.error().unwrap().message, "parse error");
    }

    #[test]
    fn undecodable_items_are_skipped() {
        let raw = RawBackendResponse::ok(json!({"results": {"A": {
            "series": [{"target": "no points"}, {"target": "ok", "datapoints": [[1, 2]]}]
        }}}));
        let result = normalize(&raw, None);
        assert_eq!(result.data.len(), 1);
        assert_eq!(result.data[0].name.as_deref(), Some("ok"));
    }
}
