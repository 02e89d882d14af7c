use std::collections::BTreeMap;

use ::serde::{Deserialize, Serialize};
use pyni_core::{ErrorInfo, PyniError};
use serde_json::{Map, Value};

fn serde_error(code: &str, err: impl ToString) -> PyniError {
    PyniError::Serde(ErrorInfo::new(code, err.to_string()))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let ordered: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(key, val)| (key, canonicalize(val)))
                .collect();
            Value::Object(Map::from_iter(ordered))
        }
        Value::Array(values) => Value::Array(values.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Serializes a value into JSON bytes with object keys in sorted order.
pub fn to_canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, PyniError> {
    let value =
        serde_json::to_value(value).map_err(|err| serde_error("pyni_host.json_encode", err))?;
    serde_json::to_vec(&canonicalize(value)).map_err(|err| serde_error("pyni_host.json_write", err))
}

pub fn from_json_slice<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, PyniError> {
    serde_json::from_slice(data).map_err(|err| serde_error("pyni_host.json_read", err))
}
