//! Data frame models

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Semantic type of a field's values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Time,
    Number,
    String,
    Boolean,
    #[default]
    #[serde(other)]
    Other,
}

impl FieldType {
    /// Guess a field type from a sample value
    pub fn guess(value: &Value) -> Self {
        match value {
            Value::Number(_) => FieldType::Number,
            Value::String(_) => FieldType::String,
            Value::Bool(_) => FieldType::Boolean,
            _ => FieldType::Other,
        }
    }
}

/// One column of a data frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,

    #[serde(rename = "type", default)]
    pub field_type: FieldType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    /// Display configuration, opaque to this crate
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,

    #[serde(default)]
    pub values: Vec<Value>,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            field_type,
            labels: None,
            config: Map::new(),
            values,
        }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Frame metadata
///
/// Only `channel` is interpreted here; everything else is carried through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMeta {
    /// Live channel id (`scope/namespace/path`) this frame invites a subscription to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    #[serde(flatten)]
    pub custom: Map<String, Value>,
}

/// A typed, columnar result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,

    #[serde(default)]
    pub fields: Vec<Field>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<FrameMeta>,
}

impl DataFrame {
    pub fn new(fields: Vec<Field>) -> Self {
        Self {
            fields,
            ..Default::default()
        }
    }

    pub fn with_ref_id(mut self, ref_id: impl Into<String>) -> Self {
        self.ref_id = Some(ref_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach a live channel id to the frame's metadata
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.meta.get_or_insert_with(FrameMeta::default).channel = Some(channel.into());
        self
    }

    /// The live channel id, if this frame carries one
    pub fn channel(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|m| m.channel.as_deref())
    }

    /// Set `ref_id` unless the frame already has one
    pub fn stamp_ref_id(&mut self, ref_id: &str) {
        if self.ref_id.as_deref().map_or(true, str::is_empty) {
            self.ref_id = Some(ref_id.to_string());
        }
    }

    /// Number of rows (length of the longest field)
    pub fn len(&self) -> usize {
        self.fields.iter().map(Field::len).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the first time field
    pub fn time_field_index(&self) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.field_type == FieldType::Time)
    }
}
