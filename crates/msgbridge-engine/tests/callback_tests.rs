//! Script functions installed as native methods

mod common;

use std::ffi::c_void;
use std::rc::Rc;

use common::{bridge, context, define_class, new_object, retain_count, runtime, Payload};
use msgbridge_engine::{BridgeError, Context, Function, Id, Ownership, Sel, Value};

/// Fresh `Calculator` subclass and an instance of it
fn subclass(ctx: &Context, name: &str) -> Value {
    let class = define_class(name, Some("Calculator"));
    ctx.push_object_strict(new_object(class, Payload::Plain), Ownership::Adopt)
}

fn doubler() -> Function {
    Function::new(|_ctx, args| {
        let x = args[1].as_number().unwrap_or(0.0);
        Ok(Value::Number(x * 2.0))
    })
}

#[test]
fn test_native_code_calls_script_method() {
    let (_rt, ctx) = context();
    let obj = subclass(&ctx, "ComputeDouble");
    ctx.implement(&Value::string("ComputeDouble"), "compute:", "i20@0:8i16", doubler())
        .unwrap();
    let result = ctx.send_str(&obj, "callCompute:", &[20.into()]).unwrap();
    assert_eq!(result, Value::Number(41.0));
    assert_eq!(ctx.stats().callbacks, 1);
    assert_eq!(ctx.installed_methods(), 1);
}

#[test]
fn test_script_method_receives_self() {
    let (_rt, ctx) = context();
    let obj = subclass(&ctx, "ComputeSelf");
    let id = obj.as_object().unwrap().id();
    let expected = id.as_ptr() as usize;
    let check = Function::new(move |_ctx, args| {
        let receiver = args[0].as_object().map(|h| h.id().as_ptr() as usize);
        Ok(Value::Bool(receiver == Some(expected)))
    });
    ctx.implement(&Value::string("ComputeSelf"), "compute:", "i20@0:8i16", check)
        .unwrap();
    assert_eq!(
        ctx.send_str(&obj, "callCompute:", &[0.into()]).unwrap(),
        Value::Number(2.0)
    );
    // the receiver handle made for the callback is gone again
    assert_eq!(retain_count(id), 1);
}

#[test]
fn test_script_method_called_from_script() {
    let (_rt, ctx) = context();
    let obj = subclass(&ctx, "ComputeDirect");
    let class = ctx.class("ComputeDirect").unwrap();
    ctx.implement(&class, "compute:", "i20@0:8i16", doubler()).unwrap();
    assert_eq!(
        ctx.send_str(&obj, "compute:", &[(-8).into()]).unwrap(),
        Value::Number(-16.0)
    );
}

#[test]
fn test_reentrant_dispatch_from_callback() {
    let (_rt, ctx) = context();
    let obj = subclass(&ctx, "ComputeReentrant");
    let nested = Function::new(|ctx, args| {
        assert_eq!(ctx.depth(), 1);
        ctx.send_str(&args[0], "add:flag:", &[args[1].clone(), true.into()])
    });
    ctx.implement(&Value::string("ComputeReentrant"), "compute:", "i20@0:8i16", nested)
        .unwrap();
    let result = ctx.send_str(&obj, "callCompute:", &[10.into()]).unwrap();
    assert_eq!(result, Value::Number(12.0));
    assert_eq!(ctx.depth(), 0);
    assert_eq!(ctx.stats().dispatches, 2);
}

#[test]
fn test_failing_callback_returns_zero() {
    let (_rt, ctx) = context();
    let obj = subclass(&ctx, "ComputeFailing");
    let failing = Function::new(|_ctx, _args| Err(BridgeError::ClassNotFound("Nowhere".to_string())));
    ctx.implement(&Value::string("ComputeFailing"), "compute:", "i20@0:8i16", failing)
        .unwrap();
    let result = ctx.send_str(&obj, "callCompute:", &[5.into()]).unwrap();
    assert_eq!(result, Value::Number(1.0));
}

#[test]
fn test_bad_return_value_returns_zero() {
    let (_rt, ctx) = context();
    let obj = subclass(&ctx, "ComputeBadReturn");
    let wrong = Function::new(|_ctx, _args| Ok(Value::string("not a number")));
    ctx.implement(&Value::string("ComputeBadReturn"), "compute:", "i20@0:8i16", wrong)
        .unwrap();
    let result = ctx.send_str(&obj, "callCompute:", &[5.into()]).unwrap();
    assert_eq!(result, Value::Number(1.0));
}

#[test]
fn test_returned_strings_outlive_the_callback() {
    let (_rt, ctx) = context();
    let obj = subclass(&ctx, "LabelString");
    let label = Function::new(|_ctx, _args| Ok(Value::string("four")));
    ctx.implement(&Value::string("LabelString"), "label", "*16@0:8", label)
        .unwrap();
    let result = ctx.send_str(&obj, "callLabel", &[]).unwrap();
    assert_eq!(result, Value::Number(4.0));
    // drained once the outermost dispatch returned
    assert_eq!(ctx.return_pool_len(), 0);
}

#[test]
fn test_struct_return_from_callback() {
    let (_rt, ctx) = context();
    let obj = subclass(&ctx, "MakePoint");
    let make = Function::new(|ctx, args| {
        let x = args[1].as_number().unwrap_or(0.0);
        ctx.new_struct("CGPoint", &[x.into(), (x * 2.0).into()])
    });
    ctx.implement(&Value::string("MakePoint"), "makePoint:", "{CGPoint=dd}24@0:8d16", make)
        .unwrap();
    let result = ctx.send_str(&obj, "callMakePoint:", &[1.5.into()]).unwrap();
    assert_eq!(result, Value::Number(4.5));
}

#[test]
fn test_large_struct_return_from_callback() {
    let (_rt, ctx) = context();
    let obj = subclass(&ctx, "MakeRect");
    let make = Function::new(|ctx, args| {
        let width = args[1].as_number().unwrap_or(0.0);
        let origin = ctx.new_struct("CGPoint", &[1.into(), 2.into()])?;
        let size = ctx.new_struct("CGSize", &[width.into(), 3.into()])?;
        ctx.new_struct("CGRect", &[origin, size])
    });
    ctx.implement(
        &Value::string("MakeRect"),
        "makeRect:",
        "{CGRect={CGPoint=dd}{CGSize=dd}}24@0:8d16",
        make,
    )
    .unwrap();
    // 1 + 2 * 10 + 4 * 3
    let result = ctx.send_str(&obj, "callMakeRect:", &[4.into()]).unwrap();
    assert_eq!(result, Value::Number(33.0));

    let rect = ctx.send_str(&obj, "makeRect:", &[2.into()]).unwrap();
    let size = ctx.index(&rect, &Value::string("size")).unwrap();
    assert_eq!(ctx.index(&size, &Value::string("width")).unwrap(), Value::Number(2.0));
}

#[test]
fn test_failing_large_struct_return_is_zeroed() {
    let (_rt, ctx) = context();
    let obj = subclass(&ctx, "MakeRectFailing");
    let wrong = Function::new(|ctx, _args| ctx.new_struct("CGPoint", &[5.into(), 5.into()]));
    ctx.implement(
        &Value::string("MakeRectFailing"),
        "makeRect:",
        "{CGRect={CGPoint=dd}{CGSize=dd}}24@0:8d16",
        wrong,
    )
    .unwrap();
    let result = ctx.send_str(&obj, "callMakeRect:", &[4.into()]).unwrap();
    assert_eq!(result, Value::Number(0.0));
}

#[test]
fn test_script_method_outlives_its_context() {
    let rt = runtime();
    let bridge = bridge(&rt);
    let owner = Context::open(bridge.clone()).unwrap();
    let other = Context::open(bridge).unwrap();
    let class = define_class("ComputeClosed", Some("Calculator"));
    let obj = other.push_object_strict(new_object(class, Payload::Plain), Ownership::Adopt);

    let captured = Rc::new(());
    let held = Rc::clone(&captured);
    let compute = Function::new(move |_ctx, args| {
        let _ = &held;
        Ok(Value::Number(args[1].as_number().unwrap_or(0.0) * 2.0))
    });
    owner
        .implement(&Value::string("ComputeClosed"), "compute:", "i20@0:8i16", compute)
        .unwrap();
    assert_eq!(other.send_str(&obj, "callCompute:", &[20.into()]).unwrap(), Value::Number(41.0));
    // cached in the other context's method cache
    assert_eq!(other.send_str(&obj, "compute:", &[3.into()]).unwrap(), Value::Number(6.0));

    drop(owner);
    assert_eq!(Rc::strong_count(&captured), 1);
    assert_eq!(other.send_str(&obj, "callCompute:", &[20.into()]).unwrap(), Value::Number(1.0));
    assert_eq!(other.send_str(&obj, "compute:", &[3.into()]).unwrap(), Value::Number(0.0));
}

#[test]
fn test_reimplementing_flushes_method_cache() {
    let (_rt, ctx) = context();
    let obj = subclass(&ctx, "ComputeReplace");
    ctx.implement(&Value::string("ComputeReplace"), "compute:", "i20@0:8i16", doubler())
        .unwrap();
    assert_eq!(ctx.send_str(&obj, "compute:", &[3.into()]).unwrap(), Value::Number(6.0));

    let tripler = Function::new(|_ctx, args| Ok(Value::Number(args[1].as_number().unwrap_or(0.0) * 3.0)));
    ctx.implement(&Value::string("ComputeReplace"), "compute:", "i20@0:8i16", tripler)
        .unwrap();
    assert_eq!(ctx.send_str(&obj, "compute:", &[3.into()]).unwrap(), Value::Number(9.0));
}

#[test]
fn test_callback_off_thread_returns_zero() {
    let (_rt, ctx) = context();
    let obj = subclass(&ctx, "ComputeThreaded");
    let imp = ctx
        .implement(&Value::string("ComputeThreaded"), "compute:", "i20@0:8i16", doubler())
        .unwrap();
    let sel = ctx.sel("compute:").unwrap();

    let imp = imp.as_ptr() as usize;
    let receiver = obj.as_object().unwrap().id().as_ptr() as usize;
    let sel = sel.as_ptr() as usize;
    let result = std::thread::spawn(move || {
        let f: extern "C" fn(Id, Sel, i32) -> i32 = unsafe { std::mem::transmute(imp as *const c_void) };
        f(
            Id::from_ptr(receiver as *mut c_void),
            Sel::from_ptr(sel as *const c_void),
            21,
        )
    })
    .join()
    .unwrap();
    assert_eq!(result, 0);
    assert_eq!(ctx.stats().callbacks, 0);
}

#[test]
fn test_library_implement() {
    let (_rt, ctx) = context();
    let obj = subclass(&ctx, "ComputeLibrary");
    let lib = ctx.library();
    let implement = ctx.index(&lib, &Value::string("implement")).unwrap();
    let imp = ctx
        .call(
            &implement,
            &[
                "ComputeLibrary".into(),
                "compute:".into(),
                "i20@0:8i16".into(),
                Value::Function(doubler()),
            ],
        )
        .unwrap();
    let Value::Blob(blob) = &imp else {
        panic!("expected the IMP as a blob, got {:?}", imp);
    };
    assert_eq!(blob.len(), std::mem::size_of::<usize>());
    assert_eq!(ctx.send_str(&obj, "callCompute:", &[4.into()]).unwrap(), Value::Number(9.0));

    let err = ctx
        .call(&implement, &["ComputeLibrary".into(), "compute:".into(), "i20@0:8i16".into(), 1.into()])
        .unwrap_err();
    assert_eq!(err, BridgeError::type_check(4, "function", "number"));
}

#[test]
fn test_implement_rejects_bad_input() {
    let (_rt, ctx) = context();
    let err = ctx
        .implement(&Value::string("NoSuchClass"), "compute:", "i20@0:8i16", doubler())
        .unwrap_err();
    assert_eq!(err, BridgeError::ClassNotFound("NoSuchClass".to_string()));

    let err = ctx
        .implement(&Value::Number(1.0), "compute:", "i20@0:8i16", doubler())
        .unwrap_err();
    assert_eq!(err, BridgeError::type_check(1, "class", "number"));

    // an instance is not a class
    let instance = subclass(&ctx, "ComputeInstance");
    let err = ctx
        .implement(&instance, "compute:", "i20@0:8i16", doubler())
        .unwrap_err();
    assert_eq!(err, BridgeError::type_check(1, "class", "object"));
    assert_eq!(ctx.send_str(&instance, "callCompute:", &[1.into()]).unwrap(), Value::Number(-1.0));

    let err = ctx
        .implement(&Value::string("Calculator"), "compute:", "i20", doubler())
        .unwrap_err();
    assert!(err.is_hard_failure());
    assert_eq!(ctx.installed_methods(), 0);
}
