//! Query request models

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Type and uid of the expression pseudo-datasource
pub const EXPRESSION_DATASOURCE_TYPE: &str = "__expr__";
/// Display name of the expression pseudo-datasource
pub const EXPRESSION_DATASOURCE_NAME: &str = "Expression";
/// Legacy numeric id of the expression pseudo-datasource
pub const EXPRESSION_DATASOURCE_ID: i64 = -100;

/// Reference to a datasource from inside a query
///
/// Deserializes from either an object (`{"type": "...", "uid": "..."}`) or a
/// bare string, which older dashboards use to reference a datasource by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "DataSourceRefRepr")]
pub struct DataSourceRef {
    /// Plugin type (e.g. "prometheus")
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,

    /// Datasource uid
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    /// Legacy name reference
    #[serde(skip_serializing)]
    pub name: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DataSourceRefRepr {
    Name(String),
    Object {
        #[serde(rename = "type", default)]
        type_name: Option<String>,
        #[serde(default)]
        uid: Option<String>,
    },
}

impl From<DataSourceRefRepr> for DataSourceRef {
    fn from(repr: DataSourceRefRepr) -> Self {
        match repr {
            DataSourceRefRepr::Name(name) => Self {
                type_name: None,
                uid: None,
                name: Some(name),
            },
            DataSourceRefRepr::Object { type_name, uid } => Self {
                type_name,
                uid,
                name: None,
            },
        }
    }
}

impl DataSourceRef {
    /// Reference by uid only
    pub fn uid(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
            ..Default::default()
        }
    }

    /// Reference by type and uid
    pub fn new(type_name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            type_name: Some(type_name.into()),
            uid: Some(uid.into()),
            name: None,
        }
    }

    /// Legacy reference by datasource name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// The canonical reference stamped on expression queries
    pub fn expression() -> Self {
        Self::new(EXPRESSION_DATASOURCE_TYPE, EXPRESSION_DATASOURCE_TYPE)
    }

    /// Whether this reference points at the expression pseudo-datasource
    ///
    /// ```
    /// # use dsq_core::models::DataSourceRef;
    /// assert!(DataSourceRef::expression().is_expression());
    /// assert!(DataSourceRef::named("Expression").is_expression());
    /// assert!(DataSourceRef::named("-100").is_expression());
    /// assert!(!DataSourceRef::uid("prom-1").is_expression());
    /// ```
    pub fn is_expression(&self) -> bool {
        let legacy_id = EXPRESSION_DATASOURCE_ID.to_string();
        [&self.type_name, &self.uid, &self.name]
            .into_iter()
            .flatten()
            .any(|v| {
                v == EXPRESSION_DATASOURCE_TYPE
                    || v == EXPRESSION_DATASOURCE_NAME
                    || *v == legacy_id
            })
    }
}

impl std::fmt::Display for DataSourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.type_name, &self.uid, &self.name) {
            (_, _, Some(name)) => write!(f, "\"{}\"", name),
            (Some(t), Some(uid), _) => write!(f, "{{\"type\":\"{}\",\"uid\":\"{}\"}}", t, uid),
            (None, Some(uid), _) => write!(f, "{{\"uid\":\"{}\"}}", uid),
            (Some(t), None, _) => write!(f, "{{\"type\":\"{}\"}}", t),
            (None, None, None) => f.write_str("{}"),
        }
    }
}

/// One sub-query of a request
///
/// Provider-specific fields (e.g. `expr`, `rawSql`) are kept opaque in `model`
/// and sent back to the backend untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// Identifier unique within the request
    pub ref_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource: Option<DataSourceRef>,

    /// Numeric datasource id, stamped during dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hide: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_data_points: Option<u64>,

    /// Provider-specific fields
    #[serde(flatten)]
    pub model: Map<String, Value>,
}

impl Query {
    pub fn new(ref_id: impl Into<String>) -> Self {
        Self {
            ref_id: ref_id.into(),
            datasource: None,
            datasource_id: None,
            hide: None,
            query_type: None,
            interval_ms: None,
            max_data_points: None,
            model: Map::new(),
        }
    }

    pub fn with_datasource(mut self, datasource: DataSourceRef) -> Self {
        self.datasource = Some(datasource);
        self
    }

    /// Set a provider-specific field
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.model.insert(key.into(), value);
        self
    }

    /// Whether this query targets the expression pseudo-datasource
    pub fn is_expression(&self) -> bool {
        self.datasource
            .as_ref()
            .map(DataSourceRef::is_expression)
            .unwrap_or(false)
    }
}

/// The unparsed bounds of a time range as the user entered them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTimeRange {
    pub from: String,
    pub to: String,
}

/// Sentinel used as the raw `to` bound of a live (moving) range
pub const LIVE_RANGE_SENTINEL: &str = "now";

/// Resolved time range of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub raw: RawTimeRange,
}

impl TimeRange {
    /// Fixed range whose raw bounds are the RFC 3339 timestamps
    pub fn absolute(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            raw: RawTimeRange {
                from: from.to_rfc3339(),
                to: to.to_rfc3339(),
            },
        }
    }

    /// Range covering the last `span` before `now`, with `to` left as "now"
    pub fn last(span: Duration, now: DateTime<Utc>) -> Self {
        Self {
            from: now - span,
            to: now,
            raw: RawTimeRange {
                from: format!("now-{}s", span.num_seconds()),
                to: LIVE_RANGE_SENTINEL.to_string(),
            },
        }
    }

    /// Whether the upper bound follows the wall clock
    pub fn is_live(&self) -> bool {
        self.raw.to == LIVE_RANGE_SENTINEL
    }

    /// Width of the range in milliseconds
    pub fn span_ms(&self) -> i64 {
        (self.to - self.from).num_milliseconds()
    }

    pub fn from_ms(&self) -> i64 {
        self.from.timestamp_millis()
    }

    pub fn to_ms(&self) -> i64 {
        self.to.timestamp_millis()
    }
}

/// One logical "fetch data for a panel" request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    /// Correlates the backend call and allows cancelling it
    pub request_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<TimeRange>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_data_points: Option<u64>,

    pub targets: Vec<Query>,

    /// Variables available to template hooks
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub scoped_vars: HashMap<String, Value>,
}

impl QueryRequest {
    /// Create a request with a freshly generated request id
    pub fn new(targets: Vec<Query>) -> Self {
        Self {
            request_id: format!("Q{}", uuid::Uuid::new_v4().simple()),
            range: None,
            interval_ms: None,
            max_data_points: None,
            targets,
            scoped_vars: HashMap::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_range(mut self, range: TimeRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = Some(interval_ms);
        self
    }

    pub fn with_max_data_points(mut self, max_data_points: u64) -> Self {
        self.max_data_points = Some(max_data_points);
        self
    }
}
