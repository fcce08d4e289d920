//! Call execution
//!
//! Marshal In, Invoke and Marshal Out for one resolved method. All per-call
//! state (argument slots, keep-alive list, return buffer) lives on this
//! stack frame, so dispatches may nest freely.

use std::ffi::c_void;
use std::mem;

use libffi::middle::CodePtr;
use libffi::raw;
use msgbridge_sdk::{BridgeError, BridgeResult, Id};

use super::signature::ResolvedMethod;
use crate::context::Context;
use crate::marshal::{self, KeepAlive};
use crate::object::Ownership;
use crate::value::Value;

/// 8-byte aligned storage for one argument
fn slot(size: usize) -> Box<[u64]> {
    vec![0u64; size.div_ceil(mem::size_of::<u64>()).max(1)].into_boxed_slice()
}

/// Call `method` on `receiver` with script arguments
pub fn call(ctx: &Context, method: &ResolvedMethod, receiver: Id, args: &[Value]) -> BridgeResult<Value> {
    let signature = &method.signature;
    if args.len() != signature.arity() {
        return Err(BridgeError::ArgumentCount {
            selector: method.name.clone(),
            expected: signature.arity(),
            got: args.len(),
        });
    }

    // Marshal In: receiver, selector, then the declared parameters
    let mut keep = KeepAlive::default();
    let mut slots: Vec<Box<[u64]>> = Vec::with_capacity(args.len() + 2);
    let mut receiver_slot = slot(mem::size_of::<Id>());
    let mut selector_slot = slot(mem::size_of::<Id>());
    unsafe {
        (receiver_slot.as_mut_ptr() as *mut *mut c_void).write(receiver.as_ptr());
        (selector_slot.as_mut_ptr() as *mut *const c_void).write(method.selector.as_ptr());
    }
    slots.push(receiver_slot);
    slots.push(selector_slot);
    for (i, (desc, value)) in signature.params.iter().zip(args).enumerate() {
        let mut arg_slot = slot(desc.size);
        unsafe {
            marshal::write_value(ctx, desc, value, i + 1, arg_slot.as_mut_ptr() as *mut u8, &mut keep)?;
        }
        slots.push(arg_slot);
    }

    let mut ret = slot(marshal::return_buffer_size(&signature.ret));
    let mut arg_ptrs: Vec<*mut c_void> = slots
        .iter_mut()
        .map(|s| s.as_mut_ptr() as *mut c_void)
        .collect();

    if method.ownership == Ownership::Init {
        // init consumes its receiver; the receiver's handle keeps its own reference
        ctx.runtime().retain(receiver);
    }

    log::trace!("dispatch -[{} {}]", ctx.runtime().class_name(method.class), method.name);
    ctx.record_dispatch();

    // Values parked by callbacks during the call stay alive until the guard drops
    let _guard = ctx.enter_dispatch();
    let code = CodePtr::from_ptr(method.imp.as_ptr());
    unsafe {
        raw::ffi_call(
            signature.cif().as_raw_ptr(),
            Some(*code.as_safe_fun()),
            ret.as_mut_ptr() as *mut c_void,
            arg_ptrs.as_mut_ptr(),
        );
    }

    // Marshal Out, before temporaries the result may alias are released
    let result = unsafe { marshal::read_return(ctx, &signature.ret, ret.as_ptr() as *const u8, method.ownership) };
    drop(keep);
    result
}
