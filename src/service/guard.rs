//! Argument guards for callers assembling payloads.

use serde_json::Value;

use crate::error::AppError;

/// Null, missing and `""` are rejected.
pub fn check_arg_empty(v: Option<&Value>, name: &str) -> Result<(), AppError> {
    match v {
        None | Some(Value::Null) => Err(AppError::Validation(format!("{} is required", name))),
        Some(Value::String(s)) if s.is_empty() => Err(AppError::Validation(format!("{} is required", name))),
        _ => Ok(()),
    }
}

/// Strings count characters, arrays count elements; anything else passes.
pub fn check_arg_length(v: Option<&Value>, max: usize, name: &str) -> Result<(), AppError> {
    let len = match v {
        Some(Value::String(s)) => s.chars().count(),
        Some(Value::Array(items)) => items.len(),
        _ => return Ok(()),
    };
    if len > max {
        return Err(AppError::Validation(format!(
            "{} must be at most {} long, got {}",
            name, max, len
        )));
    }
    Ok(())
}
