//! Decoders for the historical result encodings
//!
//! - **frames**: current columnar encoding, `{ schema, data: { values } }`
//! - **series**: legacy time series, `{ target, datapoints: [[value, time]] }`
//! - **tables**: legacy tables, `{ columns: [{ text }], rows: [[...]] }`

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::models::{DataFrame, Field, FieldType, FrameMeta};

/// Name of the time field produced from legacy series
pub const TIME_FIELD_NAME: &str = "Time";
/// Name of the value field produced from legacy series
pub const VALUE_FIELD_NAME: &str = "Value";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameJson {
    #[serde(default)]
    schema: Option<FrameSchema>,
    #[serde(default)]
    data: Option<FrameData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameSchema {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    ref_id: Option<String>,
    #[serde(default)]
    meta: Option<FrameMeta>,
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Deserialize)]
struct FieldSchema {
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    field_type: FieldType,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    config: Map<String, Value>,
}

#[derive(Deserialize)]
struct FrameData {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

/// Decode one frame from its wire form
///
/// Frames already in the columnar in-memory shape (`fields` with inline
/// `values`) are accepted as well.
pub fn decode_frame(value: &Value) -> Result<DataFrame, DecodeError> {
    if value.get("schema").is_none() && value.get("fields").is_some() {
        return DataFrame::deserialize(value)
            .map_err(|e| DecodeError::malformed("frame", e.to_string()));
    }

    let wire =
        FrameJson::deserialize(value).map_err(|e| DecodeError::malformed("frame", e.to_string()))?;
    let schema = wire.schema.unwrap_or(FrameSchema {
        name: None,
        ref_id: None,
        meta: None,
        fields: Vec::new(),
    });
    let mut columns = wire.data.map(|d| d.values).unwrap_or_default().into_iter();

    let fields = schema
        .fields
        .into_iter()
        .map(|f| Field {
            name: f.name,
            field_type: f.field_type,
            labels: f.labels,
            config: f.config,
            values: columns.next().unwrap_or_default(),
        })
        .collect();

    Ok(DataFrame {
        name: schema.name,
        ref_id: schema.ref_id,
        fields,
        meta: schema.meta,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeriesJson {
    #[serde(default, alias = "name")]
    target: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(alias = "points")]
    datapoints: Vec<Vec<Value>>,
    #[serde(default)]
    tags: Option<BTreeMap<String, String>>,
    #[serde(default)]
    ref_id: Option<String>,
    #[serde(default)]
    meta: Option<FrameMeta>,
}

/// Convert a legacy time series into a `Time` + `Value` frame
pub fn decode_series(value: &Value) -> Result<DataFrame, DecodeError> {
    let series =
        SeriesJson::deserialize(value)
            .map_err(|e| DecodeError::malformed("series", e.to_string()))?;

    let mut times = Vec::with_capacity(series.datapoints.len());
    let mut values = Vec::with_capacity(series.datapoints.len());
    for point in series.datapoints {
        let mut point = point.into_iter();
        values.push(point.next().unwrap_or(Value::Null));
        times.push(point.next().unwrap_or(Value::Null));
    }

    let mut value_field = Field::new(VALUE_FIELD_NAME, FieldType::Number, values);
    value_field.labels = series.tags;
    if let Some(title) = series.title {
        value_field
            .config
            .insert("displayNameFromDS".to_string(), Value::String(title));
    }

    Ok(DataFrame {
        name: series.target,
        ref_id: series.ref_id,
        fields: vec![
            Field::new(TIME_FIELD_NAME, FieldType::Time, times),
            value_field,
        ],
        meta: series.meta,
    })
}

#[derive(Deserialize)]
struct ColumnJson {
    #[serde(alias = "name")]
    text: String,
    #[serde(rename = "type", default)]
    column_type: Option<FieldType>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableJson {
    #[serde(default)]
    name: Option<String>,
    columns: Vec<ColumnJson>,
    #[serde(default)]
    rows: Vec<Vec<Value>>,
    #[serde(default)]
    ref_id: Option<String>,
    #[serde(default)]
    meta: Option<FrameMeta>,
}

/// Convert a legacy table into one field per column
pub fn decode_table(value: &Value) -> Result<DataFrame, DecodeError> {
    let table =
        TableJson::deserialize(value).map_err(|e| DecodeError::malformed("table", e.to_string()))?;

    let mut fields: Vec<Field> = table
        .columns
        .iter()
        .map(|c| Field::new(c.text.clone(), FieldType::Other, Vec::with_capacity(table.rows.len())))
        .collect();

    for row in table.rows {
        let mut cells = row.into_iter();
        for field in fields.iter_mut() {
            field.values.push(cells.next().unwrap_or(Value::Null));
        }
    }

    for (field, column) in fields.iter_mut().zip(&table.columns) {
        field.field_type = column.column_type.unwrap_or_else(|| {
            field
                .values
                .iter()
                .find(|v| !v.is_null())
                .map(FieldType::guess)
                .unwrap_or_default()
        });
    }

    Ok(DataFrame {
        name: table.name,
        ref_id: table.ref_id,
        fields,
        meta: table.meta,
    })
}
