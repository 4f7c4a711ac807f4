//! Custom filters for node config templates
//!
//! - `base64_encode`: Encode string to base64 (cloud-config `encoding: b64`)
//! - `required`: Fail if value is undefined or none

use base64::{engine::general_purpose::STANDARD, Engine};
use minijinja::{Error, ErrorKind, Value};

/// Base64 encode filter
///
/// Usage: `{{ value | base64_encode }}`
pub fn base64_encode(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}

/// Required filter - fails if value is undefined or none
///
/// Usage: `{{ value | required }}`
pub fn required(value: Value) -> Result<Value, Error> {
    if value.is_undefined() || value.is_none() {
        Err(Error::new(
            ErrorKind::UndefinedError,
            "required value is missing",
        ))
    } else {
        Ok(value)
    }
}
