use crate::error::SinkError;
use chrono::{DateTime, Utc};
use model::{
    core::{time::truncate_millis, value::Value},
    records::row::RowData,
};
use serde_json::{Map, Number, Value as Json};

/// `DateTime64(3)` text form accepted by the default input format.
pub fn format_datetime64(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Light type coercion applied to every value on its way to the sink.
pub fn coerce_for_sink(value: Value) -> Value {
    match value {
        Value::Float(f) if !f.is_finite() => Value::Null,
        Value::Timestamp(ts) => Value::Timestamp(truncate_millis(ts)),
        Value::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Value::String(text),
            Err(err) => Value::Bytes(err.into_bytes()),
        },
        Value::Json(Json::Null) => Value::Null,
        Value::Json(Json::String(s)) => Value::String(s),
        Value::Json(Json::Bool(b)) => Value::Boolean(b),
        other => other,
    }
}

pub fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Int(v) => Json::from(*v),
        Value::Uint(v) => Json::from(*v),
        Value::Float(v) => Number::from_f64(*v).map_or(Json::Null, Json::Number),
        Value::Decimal(v) => Json::String(v.to_string()),
        Value::String(v) => Json::String(v.clone()),
        Value::Boolean(v) => Json::Bool(*v),
        Value::Json(Json::String(s)) => Json::String(s.clone()),
        Value::Json(v) => Json::String(v.to_string()),
        Value::Uuid(v) => Json::String(v.to_string()),
        Value::Bytes(v) => Json::String(v.iter().map(|b| format!("{b:02x}")).collect()),
        Value::Date(v) => Json::String(v.format("%Y-%m-%d").to_string()),
        Value::Timestamp(v) => Json::String(format_datetime64(v)),
        Value::StringArray(v) => Json::Array(v.iter().cloned().map(Json::String).collect()),
        Value::Null => Json::Null,
    }
}

pub fn json_to_value(json: Json) -> Value {
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Boolean(b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::Uint(u)
            } else {
                n.as_f64().map_or(Value::Null, Value::Float)
            }
        }
        Json::String(s) => Value::String(s),
        Json::Array(items) if items.iter().all(Json::is_string) => Value::StringArray(
            items
                .into_iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect(),
        ),
        other => Value::Json(other),
    }
}

/// One JSON object per line, keys limited to `columns`. Missing columns are
/// sent as null.
pub fn encode_json_each_row(rows: &[RowData], columns: &[String]) -> Result<String, SinkError> {
    let mut body = String::new();
    for row in rows {
        let mut obj = Map::with_capacity(columns.len());
        for column in columns {
            obj.insert(column.clone(), value_to_json(&row.get_value(column)));
        }
        let line = serde_json::to_string(&Json::Object(obj))
            .map_err(|e| SinkError::Encode(e.to_string()))?;
        body.push_str(&line);
        body.push('\n');
    }
    Ok(body)
}

pub fn decode_json_each_row(body: &str, entity: &str) -> Result<Vec<RowData>, SinkError> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let obj: Map<String, Json> =
                serde_json::from_str(line).map_err(|e| SinkError::Decode(e.to_string()))?;
            let mut row = RowData::new(entity, Vec::with_capacity(obj.len()));
            for (name, value) in obj {
                row.set(&name, json_to_value(value));
            }
            Ok(row)
        })
        .collect()
}
