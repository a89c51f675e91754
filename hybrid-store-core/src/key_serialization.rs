//! Feast v3 entity key serialization, shared by the SQLite and Redis layouts.

use crate::error::AdapterError;
use crate::types::value::Val;
use crate::types::{EntityKey, Value, ValueType};

fn push_prefixed(bytes: &mut Vec<u8>, value_type: ValueType, payload: &[u8]) {
    bytes.extend((value_type as u32).to_le_bytes());
    bytes.extend((payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(payload);
}

fn serialize_value(bytes: &mut Vec<u8>, value: &Value) -> Result<(), AdapterError> {
    let val = value
        .val
        .as_ref()
        .ok_or_else(|| AdapterError::schema("entity key value is null"))?;
    match val {
        Val::Int32Val(v) => push_prefixed(bytes, ValueType::Int32, &v.to_le_bytes()),
        Val::Int64Val(v) => push_prefixed(bytes, ValueType::Int64, &v.to_le_bytes()),
        Val::StringVal(v) => push_prefixed(bytes, ValueType::String, v.as_bytes()),
        Val::BytesVal(v) => push_prefixed(bytes, ValueType::Bytes, v),
        other => {
            return Err(AdapterError::schema(format!(
                "unsupported entity key value type: {:?}",
                other
            )));
        }
    }
    Ok(())
}

pub(crate) fn serialize_key(entity_key: &EntityKey) -> Result<Vec<u8>, AdapterError> {
    if entity_key.join_keys.len() != entity_key.entity_values.len() {
        return Err(AdapterError::schema(format!(
            "entity key has {} join keys but {} values",
            entity_key.join_keys.len(),
            entity_key.entity_values.len()
        )));
    }
    let mut pairs: Vec<(&str, &Value)> = entity_key
        .join_keys
        .iter()
        .map(String::as_str)
        .zip(entity_key.entity_values.iter())
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    let mut bytes: Vec<u8> = Vec::with_capacity(4 + pairs.len() * 24);
    bytes.extend((pairs.len() as u32).to_le_bytes());
    for (key, _) in &pairs {
        push_prefixed(&mut bytes, ValueType::String, key.as_bytes());
    }
    for (_, value) in &pairs {
        serialize_value(&mut bytes, value)?;
    }
    Ok(bytes)
}
