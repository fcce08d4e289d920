//! Dynamic dispatch engine
//!
//! Every call goes through five stages:
//!
//! 1. **Resolve**: class of the receiver, then the per-context
//!    (class, selector) cache, reflecting encoding and IMP on a miss
//! 2. **Build**: scan format to descriptors to a libffi call interface
//!    (cached together with the resolution)
//! 3. **Marshal In**: argument count first, then each argument in order
//! 4. **Invoke**: `ffi_call` with `[receiver, selector, args...]`
//! 5. **Marshal Out**: return slot to script value
//!
//! Any failure before stage 4 means no native code runs.

pub mod callback;
pub mod invoke;
pub mod signature;

use std::rc::Rc;

use msgbridge_sdk::{BridgeError, BridgeResult, Id, Sel};

pub use callback::ScriptImp;
pub use signature::{MethodSignature, ResolvedMethod};

use crate::abi::StructRegistry;
use crate::bootstrap::Metatable;
use crate::context::Context;
use crate::object::{ObjectHandle, Ownership};
use crate::selector;
use crate::value::Value;

/// Resolve `sel` for the class of `receiver`
pub fn resolve(ctx: &Context, receiver: Id, sel: Sel) -> BridgeResult<Rc<ResolvedMethod>> {
    let runtime = ctx.runtime();
    let class = runtime.class_of(receiver);
    if let Some(method) = ctx.cached_method(class, sel) {
        return Ok(method);
    }

    let name = selector::name(ctx, sel);
    let not_found = || BridgeError::MethodNotFound {
        class: runtime.class_name(class),
        selector: name.clone(),
    };
    let encoding = runtime.method_type_encoding(class, sel).ok_or_else(not_found)?;
    let imp = runtime
        .method_implementation(class, sel)
        .filter(|imp| !imp.is_null())
        .ok_or_else(not_found)?;
    log::debug!(
        "reflected -[{} {}] with encoding {}",
        runtime.class_name(class),
        name,
        encoding
    );

    let signature = MethodSignature::parse(
        &encoding,
        StructRegistry::global(),
        ctx.options().opaque_unknown_structs,
    )?;
    let method = Rc::new(ResolvedMethod {
        class,
        selector: sel,
        ownership: Ownership::for_selector(&name),
        name,
        signature,
        imp,
    });
    ctx.cache_method(method.clone());
    Ok(method)
}

/// Send `sel` to `target` with script arguments. Messaging nil yields nil.
pub fn send(ctx: &Context, target: &Value, sel: Sel, args: &[Value]) -> BridgeResult<Value> {
    let receiver = match target {
        Value::Object(handle) => handle.id(),
        Value::Nil => {
            log::trace!("message {} sent to nil", selector::name(ctx, sel));
            return Ok(Value::Nil);
        }
        other => return Err(BridgeError::type_check(1, "object", other.type_name())),
    };
    let method = resolve(ctx, receiver, sel)?;
    invoke::call(ctx, &method, receiver, args)
}

/// Look up a member on an object: maps the member name to a selector and
/// resolves it, yielding a callable bound method
pub fn bind_member(ctx: &Context, handle: &ObjectHandle, member: &str) -> BridgeResult<Value> {
    let name = ctx.options().selector_name(member);
    let sel = selector::get(ctx, &name)?;
    let method = resolve(ctx, handle.id(), sel)?;
    Ok(Value::Method(Rc::new(BoundMethod {
        receiver: handle.clone(),
        method,
    })))
}

/// A resolved method paired with its receiver
pub struct BoundMethod {
    receiver: ObjectHandle,
    method: Rc<ResolvedMethod>,
}

impl BoundMethod {
    pub fn receiver(&self) -> &ObjectHandle {
        &self.receiver
    }

    pub fn method(&self) -> &Rc<ResolvedMethod> {
        &self.method
    }

    pub fn selector_name(&self) -> &str {
        &self.method.name
    }

    /// Call without re-resolving
    pub fn call(&self, ctx: &Context, args: &[Value]) -> BridgeResult<Value> {
        invoke::call(ctx, &self.method, self.receiver.id(), args)
    }
}

// ============================================================================
// Metatable
// ============================================================================

pub(crate) fn metatable() -> Metatable {
    Metatable {
        name: "method",
        index: Some(method_index),
        call: Some(method_call),
        tostring: Some(method_tostring),
        ..Metatable::default()
    }
}

fn as_method(value: &Value) -> BridgeResult<&Rc<BoundMethod>> {
    match value {
        Value::Method(m) => Ok(m),
        other => Err(BridgeError::type_check(1, "method", other.type_name())),
    }
}

fn method_index(_ctx: &Context, value: &Value, key: &Value) -> BridgeResult<Value> {
    let method = as_method(value)?;
    match key.check_str(2)? {
        "selector" => Ok(Value::Selector(method.method.selector)),
        "encoding" => Ok(Value::string(&method.method.signature.encoding)),
        "arity" => Ok(Value::Number(method.method.signature.arity() as f64)),
        "receiver" => Ok(Value::Object(method.receiver.clone())),
        _ => Ok(Value::Nil),
    }
}

fn method_call(ctx: &Context, value: &Value, args: &[Value]) -> BridgeResult<Value> {
    as_method(value)?.call(ctx, args)
}

fn method_tostring(ctx: &Context, value: &Value) -> BridgeResult<String> {
    let method = as_method(value)?;
    Ok(format!(
        "<method -[{} {}]>",
        ctx.runtime().class_name(method.method.class),
        method.method.name
    ))
}
