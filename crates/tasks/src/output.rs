//! Task output handoff and merge rules.
//!
//! A finished task writes its result under a key derived from its session
//! key; whoever rolls the job up reads and deletes it.

use serde_json::{Number, Value};

use crate::cache::SessionCache;
use crate::error::{AccumulateError, CacheError};

pub fn output_key(session_key: &str) -> String {
    format!("{session_key}_output")
}

/// Fetch and delete a task's output. A second caller sees nothing.
pub async fn get_output(
    cache: &dyn SessionCache,
    session_key: &str,
) -> Result<Option<Value>, CacheError> {
    let key = output_key(session_key);
    let output = cache.get(&key).await?;
    cache.delete(&key).await?;
    Ok(output)
}

/// Merge `new` into `old`.
///
/// `Null` on either side yields the other. Objects merge shallowly with
/// `new` winning on shared keys. Numbers add (integer if both are
/// integers). Arrays and strings concatenate. Any other pairing is an
/// error.
pub fn accumulate(old: Value, new: Value) -> Result<Value, AccumulateError> {
    match (old, new) {
        (Value::Null, new) => Ok(new),
        (old, Value::Null) => Ok(old),
        (Value::Object(mut old), Value::Object(new)) => {
            old.extend(new);
            Ok(Value::Object(old))
        }
        (Value::Number(a), Value::Number(b)) => Ok(Value::Number(add_numbers(&a, &b))),
        (Value::Array(mut a), Value::Array(b)) => {
            a.extend(b);
            Ok(Value::Array(a))
        }
        (Value::String(mut a), Value::String(b)) => {
            a.push_str(&b);
            Ok(Value::String(a))
        }
        (old, new) => Err(AccumulateError::Incompatible {
            old: kind(&old),
            new: kind(&new),
        }),
    }
}

fn add_numbers(a: &Number, b: &Number) -> Number {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Number::from(sum);
        }
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        if let Some(sum) = x.checked_add(y) {
            return Number::from(sum);
        }
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(sum).unwrap_or_else(|| Number::from(0))
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Fold a sequence of outputs, left to right.
pub fn accumulate_all<I>(outputs: I) -> Result<Value, AccumulateError>
where
    I: IntoIterator<Item = Value>,
{
    outputs
        .into_iter()
        .try_fold(Value::Null, |acc, next| accumulate(acc, next))
}
