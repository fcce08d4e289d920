//! Object handles
//!
//! An `ObjectHandle` is the script-side owner of one native reference. The
//! handle is created either by retaining a borrowed object or by adopting a
//! reference the caller already owns (+1 results of `alloc`, `new`, `copy`
//! and friends). Dropping the last clone releases it, exactly once.

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use msgbridge_sdk::{BridgeError, BridgeResult, Id, NativeRuntime};

use crate::bootstrap::Metatable;
use crate::context::Context;
use crate::value::Value;

/// How a native object reference reaches the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Borrowed (+0): retain it
    Retain,
    /// Owned (+1): take over the reference
    Adopt,
    /// `init` family: the call consumes the receiver and returns +1
    Init,
}

impl Ownership {
    /// Ownership of the result of the method named `selector`
    pub fn for_selector(selector: &str) -> Self {
        let base = selector.trim_start_matches('_');
        if in_family(base, "init") {
            Ownership::Init
        } else if in_family(base, "alloc")
            || in_family(base, "new")
            || in_family(base, "copy")
            || in_family(base, "mutableCopy")
        {
            Ownership::Adopt
        } else {
            Ownership::Retain
        }
    }

    /// Whether the returned reference is already owned
    pub fn owns_result(self) -> bool {
        !matches!(self, Ownership::Retain)
    }
}

/// `name` starts with the family word, not followed by a lowercase letter
/// (`copy` and `copyWithZone:` are in the family, `copyright` is not)
fn in_family(name: &str, family: &str) -> bool {
    match name.strip_prefix(family) {
        Some(rest) => !rest.starts_with(|c: char| c.is_ascii_lowercase()),
        None => false,
    }
}

struct HandleInner {
    id: Id,
    runtime: Arc<dyn NativeRuntime>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.runtime.release(self.id);
    }
}

/// Shared owner of a non-nil native object
#[derive(Clone)]
pub struct ObjectHandle(Rc<HandleInner>);

impl ObjectHandle {
    /// Retain a borrowed object. Returns `None` for nil.
    pub fn retain(runtime: &Arc<dyn NativeRuntime>, id: Id) -> Option<Self> {
        if id.is_nil() {
            return None;
        }
        runtime.retain(id);
        Some(Self::wrap(runtime, id))
    }

    /// Take over an owned (+1) reference. Returns `None` for nil.
    pub fn adopt(runtime: &Arc<dyn NativeRuntime>, id: Id) -> Option<Self> {
        if id.is_nil() {
            return None;
        }
        Some(Self::wrap(runtime, id))
    }

    /// Handle for a reference with the given ownership
    pub fn with_ownership(runtime: &Arc<dyn NativeRuntime>, id: Id, ownership: Ownership) -> Option<Self> {
        if ownership.owns_result() {
            Self::adopt(runtime, id)
        } else {
            Self::retain(runtime, id)
        }
    }

    fn wrap(runtime: &Arc<dyn NativeRuntime>, id: Id) -> Self {
        ObjectHandle(Rc::new(HandleInner {
            id,
            runtime: runtime.clone(),
        }))
    }

    pub fn id(&self) -> Id {
        self.0.id
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHandle({:p})", self.0.id.as_ptr())
    }
}

// ============================================================================
// Pushing and checking
// ============================================================================

/// Convert a native object to a script value, unwrapping number and string
/// wrappers
pub fn push_object(ctx: &Context, id: Id, ownership: Ownership) -> Value {
    if id.is_nil() {
        return Value::Nil;
    }
    let runtime = ctx.runtime();
    let unwrapped = if let Some(n) = runtime.number_value(id) {
        Some(Value::Number(n))
    } else {
        runtime.string_value(id).map(|s| Value::string(&s))
    };
    match unwrapped {
        Some(value) => {
            if ownership.owns_result() {
                runtime.release(id);
            }
            value
        }
        None => push_object_strict(ctx, id, ownership),
    }
}

/// Convert a native object to an object handle, never unwrapping
pub fn push_object_strict(ctx: &Context, id: Id, ownership: Ownership) -> Value {
    match ObjectHandle::with_ownership(ctx.runtime(), id, ownership) {
        Some(handle) => Value::Object(handle),
        None => Value::Nil,
    }
}

/// Argument `arg` as a non-nil object
pub fn check_id(value: &Value, arg: usize) -> BridgeResult<Id> {
    match value {
        Value::Object(handle) => Ok(handle.id()),
        other => Err(BridgeError::type_check(arg, "object", other.type_name())),
    }
}

/// Argument `arg` as an object or nil
pub fn check_id_or_nil(value: &Value, arg: usize) -> BridgeResult<Id> {
    match value {
        Value::Nil => Ok(Id::nil()),
        other => check_id(other, arg),
    }
}

// ============================================================================
// Metatable
// ============================================================================

pub(crate) fn metatable() -> Metatable {
    Metatable {
        name: "object",
        index: Some(object_index),
        newindex: Some(object_newindex),
        tostring: Some(object_tostring),
        ..Metatable::default()
    }
}

/// `obj.member` binds the method the member name maps to
fn object_index(ctx: &Context, value: &Value, key: &Value) -> BridgeResult<Value> {
    let Value::Object(handle) = value else {
        return Err(BridgeError::type_check(1, "object", value.type_name()));
    };
    let member = key.check_str(2)?;
    crate::dispatch::bind_member(ctx, handle, member)
}

/// `obj.title = v` sends `setTitle:`
fn object_newindex(ctx: &Context, value: &Value, key: &Value, new_value: Value) -> BridgeResult<()> {
    let member = key.check_str(2)?;
    let selector = setter_name(member);
    let sel = crate::selector::get(ctx, &selector)?;
    crate::dispatch::send(ctx, value, sel, &[new_value])?;
    Ok(())
}

fn object_tostring(ctx: &Context, value: &Value) -> BridgeResult<String> {
    let id = check_id(value, 1)?;
    Ok(ctx.runtime().describe(id))
}

/// `title` -> `setTitle:`
pub fn setter_name(member: &str) -> String {
    let mut chars = member.chars();
    let mut name = String::with_capacity(member.len() + 4);
    name.push_str("set");
    if let Some(first) = chars.next() {
        name.extend(first.to_uppercase());
    }
    name.push_str(chars.as_str());
    name.push(':');
    name
}
