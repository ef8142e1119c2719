//! Postgres change-data-capture: subscription filters and the transform
//! applied to raw change payloads before user callbacks run.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One `postgres_changes` subscription filter. The server answers the
/// join with a parallel list of these plus assigned ids; dispatch is by
/// id from then on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresFilter {
    /// `*`, `INSERT`, `UPDATE` or `DELETE`.
    pub event: String,
    pub schema: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl PostgresFilter {
    pub fn new(event: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            schema: schema.into(),
            table: None,
            filter: None,
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub(crate) fn matches_event(&self, event_type: &str) -> bool {
        self.event == "*" || self.event.eq_ignore_ascii_case(event_type)
    }

    /// Whether a server handshake entry describes the same filter.
    pub(crate) fn matches_server_entry(&self, entry: &Value) -> bool {
        let field = |name: &str| entry.get(name).and_then(Value::as_str);
        field("event") == Some(self.event.as_str())
            && field("schema") == Some(self.schema.as_str())
            && field("table") == self.table.as_deref()
            && field("filter") == self.filter.as_deref()
    }
}

/// A change event after decoding, with `new`/`old` columns converted
/// according to the column metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresChange {
    #[serde(rename = "eventType")]
    pub event_type: String,
    pub schema: String,
    pub table: String,
    pub commit_timestamp: String,
    #[serde(default)]
    pub new: Map<String, Value>,
    #[serde(default)]
    pub old: Map<String, Value>,
    #[serde(default)]
    pub errors: Option<Value>,
}

/// Builds the user-facing change from the raw `data` object of a
/// `postgres_changes` payload. INSERT/UPDATE populate `new`,
/// UPDATE/DELETE populate `old`.
pub(crate) fn transform_change(data: &Value) -> PostgresChange {
    let text = |name: &str| {
        data.get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let event_type = text("type");
    let columns = data
        .get("columns")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let records = |name: &str| {
        data.get(name)
            .and_then(Value::as_object)
            .map(|record| convert_change_data(&columns, record))
            .unwrap_or_default()
    };

    let new = match event_type.as_str() {
        "INSERT" | "UPDATE" => records("record"),
        _ => Map::new(),
    };
    let old = match event_type.as_str() {
        "UPDATE" | "DELETE" => records("old_record"),
        _ => Map::new(),
    };

    PostgresChange {
        event_type,
        schema: text("schema"),
        table: text("table"),
        commit_timestamp: text("commit_timestamp"),
        new,
        old,
        errors: data.get("errors").filter(|e| !e.is_null()).cloned(),
    }
}

fn convert_change_data(columns: &[Value], record: &Map<String, Value>) -> Map<String, Value> {
    let mut converted = Map::new();
    for (name, value) in record {
        let column_type = columns.iter().find_map(|column| {
            (column.get("name").and_then(Value::as_str) == Some(name.as_str()))
                .then(|| column.get("type").and_then(Value::as_str))
                .flatten()
        });
        let value = match column_type {
            Some(ty) => convert_cell(ty, value),
            None => value.clone(),
        };
        converted.insert(name.clone(), value);
    }
    converted
}

/// Converts one cell by Postgres type name. Unknown types pass through.
fn convert_cell(column_type: &str, value: &Value) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    if let Some(inner) = column_type.strip_prefix('_') {
        return convert_array(inner, value);
    }
    match column_type {
        "bool" => convert_bool(value),
        "int2" | "int4" | "int8" | "float4" | "float8" | "numeric" | "oid" => {
            convert_number(value)
        }
        "json" | "jsonb" => convert_json(value),
        "timestamp" => convert_timestamp(value),
        _ => value.clone(),
    }
}

fn convert_bool(value: &Value) -> Value {
    match value {
        Value::Bool(_) => value.clone(),
        Value::String(s) if s == "t" => Value::Bool(true),
        Value::String(s) if s == "f" => Value::Bool(false),
        _ => value.clone(),
    }
}

fn convert_number(value: &Value) -> Value {
    match value {
        Value::Number(_) => value.clone(),
        Value::String(s) => s
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| value.clone()),
        _ => value.clone(),
    }
}

fn convert_json(value: &Value) -> Value {
    match value {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| value.clone()),
        _ => value.clone(),
    }
}

/// `2019-09-10 00:00:00` becomes `2019-09-10T00:00:00`.
fn convert_timestamp(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.replacen(' ', "T", 1)),
        _ => value.clone(),
    }
}

/// Postgres array literals arrive either as JSON arrays or as `{a,b,c}`
/// strings; both forms convert element-wise.
fn convert_array(inner_type: &str, value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| convert_cell(inner_type, item))
                .collect(),
        ),
        Value::String(s) if s.starts_with('{') && s.ends_with('}') => {
            let trimmed = &s[1..s.len() - 1];
            if trimmed.is_empty() {
                return Value::Array(Vec::new());
            }
            Value::Array(
                trimmed
                    .split(',')
                    .map(|item| convert_cell(inner_type, &Value::String(item.to_string())))
                    .collect(),
            )
        }
        _ => value.clone(),
    }
}
