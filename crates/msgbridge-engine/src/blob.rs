//! Opaque blobs
//!
//! A blob carries native bytes the bridge has no descriptor for: pointers,
//! unions, inline arrays, bitfields and unregistered structs. Bytes are
//! copied on creation and handed back verbatim, so such values survive a
//! round trip through script code untouched.

use std::fmt;
use std::rc::Rc;

use msgbridge_sdk::{BridgeError, BridgeResult};

use crate::bootstrap::Metatable;
use crate::context::Context;
use crate::value::Value;

/// Immutable byte carrier
#[derive(Clone, PartialEq, Eq)]
pub struct Blob(Rc<[u8]>);

impl Blob {
    /// Copy `bytes` into a new blob
    pub fn push(bytes: &[u8]) -> Self {
        Blob(Rc::from(bytes))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blob({} bytes)", self.0.len())
    }
}

/// Argument `arg` as a blob. `expected_len == 0` accepts any length.
pub fn check(value: &Value, expected_len: usize, arg: usize) -> BridgeResult<&Blob> {
    match value {
        Value::Blob(blob) => {
            if expected_len != 0 && blob.len() != expected_len {
                return Err(BridgeError::SizeMismatch {
                    expected: expected_len,
                    got: blob.len(),
                });
            }
            Ok(blob)
        }
        other => Err(BridgeError::type_check(arg, "blob", other.type_name())),
    }
}

// ============================================================================
// Metatable
// ============================================================================

pub(crate) fn metatable() -> Metatable {
    Metatable {
        name: "blob",
        len: Some(blob_len),
        tostring: Some(blob_tostring),
        ..Metatable::default()
    }
}

fn blob_len(_ctx: &Context, value: &Value) -> BridgeResult<Value> {
    let blob = check(value, 0, 1)?;
    Ok(Value::Number(blob.len() as f64))
}

fn blob_tostring(_ctx: &Context, value: &Value) -> BridgeResult<String> {
    let blob = check(value, 0, 1)?;
    Ok(format!("<blob: {} bytes>", blob.len()))
}
