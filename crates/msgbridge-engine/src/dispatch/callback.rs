//! Reverse dispatch
//!
//! A script function installed as a native method. libffi builds a closure
//! whose entry point has exactly the method's ABI; the trampoline behind it
//! marshals the native arguments into script values, calls the function
//! with `(self, args...)` and marshals the result into the return slot.
//!
//! Errors cannot propagate into native frames: they are logged and the
//! native caller sees a zeroed return value.

use std::cell::RefCell;
use std::ffi::c_void;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::Weak;
use std::thread::{self, ThreadId};

use libffi::low::ffi_cif;
use libffi::middle::Closure;
use msgbridge_sdk::{BridgeResult, Id, Imp};

use super::signature::MethodSignature;
use crate::abi::TypeDesc;
use crate::context::{Context, ContextInner};
use crate::marshal::{self, KeepAlive};
use crate::object::{self, Ownership};
use crate::value::Function;

struct CallbackData {
    context: Weak<ContextInner>,
    signature: MethodSignature,
    /// Taken when the owning context closes
    function: RefCell<Option<Function>>,
    selector: String,
    thread: ThreadId,
}

/// A script function exposed as a native IMP.
///
/// The runtime keeps the IMP in its method tables after the owning context
/// closes, so the closure and its data are never freed. Dropping this value
/// only releases the script function; later calls see a zeroed return.
pub struct ScriptImp {
    data: &'static CallbackData,
    imp: Imp,
}

impl ScriptImp {
    pub(crate) fn new(ctx: &Context, signature: MethodSignature, function: Function, selector: &str) -> Self {
        let cif = signature.build_cif();
        let data: &'static CallbackData = Box::leak(Box::new(CallbackData {
            context: ctx.downgrade(),
            signature,
            function: RefCell::new(Some(function)),
            selector: selector.to_string(),
            thread: thread::current().id(),
        }));
        let closure: &'static Closure<'static> = Box::leak(Box::new(Closure::new(cif, trampoline, data)));
        let imp = Imp::from_ptr(*closure.code_ptr() as *const c_void);
        ScriptImp { data, imp }
    }

    pub fn imp(&self) -> Imp {
        self.imp
    }

    pub fn selector(&self) -> &str {
        &self.data.selector
    }
}

impl Drop for ScriptImp {
    fn drop(&mut self) {
        // Runs on the context's thread, never inside one of its callbacks
        let released = self.data.function.borrow_mut().take();
        drop(released);
    }
}

/// Bytes the native caller reads back for a return of type `desc`
fn return_width(desc: &TypeDesc) -> usize {
    if desc.is_small_integer() {
        mem::size_of::<usize>()
    } else {
        desc.size
    }
}

unsafe extern "C" fn trampoline(
    _cif: &ffi_cif,
    result: &mut u64,
    args: *const *const c_void,
    data: &CallbackData,
) {
    let ret = result as *mut u64 as *mut u8;
    let ret_desc = &data.signature.ret;

    if thread::current().id() != data.thread {
        log::error!("method {} called off the thread of its context", data.selector);
    } else if let Some((ctx, function)) = live(data) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| run(&ctx, data, &function, args, ret)));
        match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => log::error!("script method {} failed: {}", data.selector, e),
            Err(_) => log::error!("script method {} panicked", data.selector),
        }
    } else {
        log::error!("method {} called after its context closed", data.selector);
    }

    if !ret_desc.is_void() {
        ptr::write_bytes(ret, 0, return_width(ret_desc));
    }
}

/// Owning context and script function, unless the context has closed
fn live(data: &CallbackData) -> Option<(Context, Function)> {
    let inner = data.context.upgrade()?;
    let function = data.function.borrow().clone()?;
    Some((Context::from_inner(inner), function))
}

unsafe fn run(
    ctx: &Context,
    data: &CallbackData,
    function: &Function,
    args: *const *const c_void,
    ret: *mut u8,
) -> BridgeResult<()> {
    let signature = &data.signature;
    ctx.record_callback();

    let receiver = *(*args as *const *mut c_void);
    let mut script_args = Vec::with_capacity(signature.arity() + 1);
    script_args.push(object::push_object_strict(ctx, Id::from_ptr(receiver), Ownership::Retain));
    for (i, desc) in signature.params.iter().enumerate() {
        let src = *args.add(i + 2) as *const u8;
        script_args.push(marshal::read_value(ctx, desc, src, Ownership::Retain)?);
    }

    log::trace!("callback {} with {} arguments", data.selector, signature.arity());
    let value = function.call(ctx, &script_args)?;

    let mut keep = KeepAlive::default();
    marshal::write_return(ctx, &signature.ret, &value, ret, &mut keep)?;
    ctx.park(keep);
    Ok(())
}
