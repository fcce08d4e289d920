//! Value marshaling
//!
//! Converts script values into native ABI slots and back, driven entirely by
//! `TypeDesc`s reflected at run time. Writers take a `KeepAlive` that owns
//! every temporary the native side may still point into (C strings, boxed
//! objects) until the caller decides the native side is done with them.
//!
//! All reads and writes are unaligned: struct buffers are plain byte boxes.

use std::cell::RefCell;
use std::ffi::{c_char, c_void, CStr, CString};
use std::mem;
use std::ptr;
use std::rc::Rc;

use msgbridge_sdk::{BridgeError, BridgeResult, Class, Id, Sel};
use rustc_hash::FxHashSet;

use crate::abi::{TypeDesc, TypeKind};
use crate::blob::{self, Blob};
use crate::context::Context;
use crate::object::{self, ObjectHandle, Ownership};
use crate::selector;
use crate::structs::{self, StructValue};
use crate::value::{Table, Value};

/// Temporaries that must outlive a native call
#[derive(Default)]
pub struct KeepAlive {
    strings: Vec<CString>,
    objects: Vec<ObjectHandle>,
}

impl KeepAlive {
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty() && self.objects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.strings.len() + self.objects.len()
    }

    /// Move everything `other` holds into `self`
    pub fn absorb(&mut self, other: KeepAlive) {
        self.strings.extend(other.strings);
        self.objects.extend(other.objects);
    }

    fn string(&mut self, s: CString) -> *const c_char {
        // The heap buffer does not move when the CString does
        let ptr = s.as_ptr();
        self.strings.push(s);
        ptr
    }

    fn object(&mut self, handle: Option<ObjectHandle>) -> Id {
        match handle {
            Some(handle) => {
                let id = handle.id();
                self.objects.push(handle);
                id
            }
            None => Id::nil(),
        }
    }
}

// ============================================================================
// Argument checks
// ============================================================================

/// Number, with booleans coerced to 0/1
pub fn check_number_or_bool(value: &Value, arg: usize) -> BridgeResult<f64> {
    match value {
        Value::Number(n) => Ok(*n),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => Err(BridgeError::type_check(arg, "number", other.type_name())),
    }
}

/// Boolean, with numbers compared against zero
pub fn check_bool(value: &Value, arg: usize) -> BridgeResult<bool> {
    Ok(check_number_or_bool(value, arg)? != 0.0)
}

/// C string, or `None` for nil
pub fn check_cstring(value: &Value, arg: usize) -> BridgeResult<Option<CString>> {
    match value {
        Value::Nil => Ok(None),
        Value::String(s) => CString::new(s.as_bytes())
            .map(Some)
            .map_err(|_| BridgeError::type_check(arg, "string without NUL bytes", "string")),
        other => Err(BridgeError::type_check(arg, "string", other.type_name())),
    }
}

/// Convert a script value into a native object, boxing primitives and
/// converting tables into collections. `None` is nil.
///
/// A table that contains itself, directly or through nested tables, is
/// rejected.
pub fn to_object(ctx: &Context, value: &Value, arg: usize) -> BridgeResult<Option<ObjectHandle>> {
    let mut open = FxHashSet::default();
    to_object_inner(ctx, value, arg, &mut open)
}

fn to_object_inner(
    ctx: &Context,
    value: &Value,
    arg: usize,
    open: &mut FxHashSet<*const RefCell<Table>>,
) -> BridgeResult<Option<ObjectHandle>> {
    let runtime = ctx.runtime();
    let boxed = match value {
        Value::Nil => return Ok(None),
        Value::Object(handle) => return Ok(Some(handle.clone())),
        Value::Number(n) => runtime.new_number(*n),
        Value::Bool(b) => runtime.new_bool(*b),
        Value::String(s) => runtime.new_string(s),
        Value::Table(cell) => {
            let key = Rc::as_ptr(cell);
            if !open.insert(key) {
                return Err(BridgeError::type_check(arg, "acyclic table", "cyclic table"));
            }
            let table = cell.borrow();
            let boxed = if table.is_sequence() {
                let items = table
                    .array()
                    .iter()
                    .map(|item| to_object_inner(ctx, item, arg, open))
                    .collect::<BridgeResult<Vec<_>>>()?;
                let ids: Vec<Id> = items.iter().map(handle_id).collect();
                runtime.new_array(&ids)
            } else {
                let mut keys = Vec::new();
                let mut values = Vec::new();
                for (k, v) in table.pairs() {
                    keys.push(to_object_inner(ctx, &k, arg, open)?);
                    values.push(to_object_inner(ctx, &v, arg, open)?);
                }
                let key_ids: Vec<Id> = keys.iter().map(handle_id).collect();
                let value_ids: Vec<Id> = values.iter().map(handle_id).collect();
                runtime.new_dictionary(&key_ids, &value_ids)
            };
            // Shared subtables are fine, only the current path counts
            open.remove(&key);
            boxed
        }
        other => return Err(BridgeError::type_check(arg, "object", other.type_name())),
    };
    Ok(ObjectHandle::adopt(runtime, boxed))
}

fn handle_id(handle: &Option<ObjectHandle>) -> Id {
    handle.as_ref().map_or(Id::nil(), ObjectHandle::id)
}

/// Selector argument; nil is the null selector
pub fn check_selector(value: &Value, arg: usize) -> BridgeResult<Sel> {
    selector::check(value, arg)
}

/// Selector argument, interning strings (dispatch call sites only)
pub fn check_selector_or_string(ctx: &Context, value: &Value, arg: usize) -> BridgeResult<Sel> {
    selector::check_or_string(ctx, value, arg)
}

/// Class argument: a class object, or nil
pub fn check_class(ctx: &Context, value: &Value, arg: usize) -> BridgeResult<Class> {
    let id = object::check_id_or_nil(value, arg)?;
    if !id.is_nil() && !ctx.runtime().is_class(id) {
        return Err(BridgeError::type_check(arg, "class", "object"));
    }
    Ok(id.as_class())
}

/// Integer bits of a number, truncated toward zero like a C cast
fn int_bits(n: f64) -> u64 {
    if n >= 0.0 {
        n as u64
    } else {
        n as i64 as u64
    }
}

// ============================================================================
// Script -> native
// ============================================================================

/// Write `value` as `desc` at `dst`.
///
/// # Safety
/// `dst` must be valid for writes of `desc.size` bytes.
pub unsafe fn write_value(
    ctx: &Context,
    desc: &TypeDesc,
    value: &Value,
    arg: usize,
    dst: *mut u8,
    keep: &mut KeepAlive,
) -> BridgeResult<()> {
    match &desc.kind {
        TypeKind::Void => {
            return Err(BridgeError::UnsupportedType {
                code: desc.code.clone(),
                reason: "void value".to_string(),
            })
        }
        TypeKind::Char => put(dst, int_bits(check_number_or_bool(value, arg)?) as i8),
        TypeKind::UChar => put(dst, int_bits(check_number_or_bool(value, arg)?) as u8),
        TypeKind::Bool => put(dst, check_bool(value, arg)? as u8),
        TypeKind::Short => put(dst, int_bits(check_number_or_bool(value, arg)?) as i16),
        TypeKind::UShort => put(dst, int_bits(check_number_or_bool(value, arg)?) as u16),
        TypeKind::Int | TypeKind::Long => put(dst, int_bits(check_number_or_bool(value, arg)?) as i32),
        TypeKind::UInt | TypeKind::ULong => put(dst, int_bits(check_number_or_bool(value, arg)?) as u32),
        TypeKind::LongLong => put(dst, int_bits(check_number_or_bool(value, arg)?) as i64),
        TypeKind::ULongLong => put(dst, int_bits(check_number_or_bool(value, arg)?)),
        TypeKind::Float => put(dst, check_number_or_bool(value, arg)? as f32),
        TypeKind::Double => put(dst, check_number_or_bool(value, arg)?),
        TypeKind::CString => {
            let ptr = match check_cstring(value, arg)? {
                Some(s) => keep.string(s),
                None => ptr::null(),
            };
            put(dst, ptr);
        }
        TypeKind::Object => {
            let id = keep.object(to_object(ctx, value, arg)?);
            put(dst, id.as_ptr());
        }
        TypeKind::Class => put(dst, check_class(ctx, value, arg)?.as_ptr()),
        TypeKind::Selector => put(dst, check_selector(value, arg)?.as_ptr()),
        TypeKind::Pointer | TypeKind::Opaque(_) => {
            if value.is_nil() {
                ptr::write_bytes(dst, 0, desc.size);
            } else {
                let blob = blob::check(value, desc.size, arg)?;
                ptr::copy_nonoverlapping(blob.bytes().as_ptr(), dst, desc.size);
            }
        }
        TypeKind::Struct(def) => {
            let s = structs::check(value, &def.name, arg)?;
            s.copy_to(dst);
        }
    }
    Ok(())
}

#[inline]
unsafe fn put<T>(dst: *mut u8, value: T) {
    ptr::write_unaligned(dst as *mut T, value);
}

#[inline]
unsafe fn get<T>(src: *const u8) -> T {
    ptr::read_unaligned(src as *const T)
}

// ============================================================================
// Native -> script
// ============================================================================

/// Read a `desc` value at `src`. Object results follow `ownership`.
///
/// # Safety
/// `src` must be valid for reads of `desc.size` bytes, and pointer-typed
/// slots must hold valid (or null) pointers of their kind.
pub unsafe fn read_value(
    ctx: &Context,
    desc: &TypeDesc,
    src: *const u8,
    ownership: Ownership,
) -> BridgeResult<Value> {
    let value = match &desc.kind {
        TypeKind::Void => Value::Nil,
        TypeKind::Char => Value::Number(get::<i8>(src) as f64),
        TypeKind::UChar => Value::Number(get::<u8>(src) as f64),
        TypeKind::Bool => Value::Bool(get::<u8>(src) != 0),
        TypeKind::Short => Value::Number(get::<i16>(src) as f64),
        TypeKind::UShort => Value::Number(get::<u16>(src) as f64),
        TypeKind::Int | TypeKind::Long => Value::Number(get::<i32>(src) as f64),
        TypeKind::UInt | TypeKind::ULong => Value::Number(get::<u32>(src) as f64),
        TypeKind::LongLong => Value::Number(get::<i64>(src) as f64),
        TypeKind::ULongLong => Value::Number(get::<u64>(src) as f64),
        TypeKind::Float => Value::Number(get::<f32>(src) as f64),
        TypeKind::Double => Value::Number(get::<f64>(src)),
        TypeKind::CString => read_cstring(get::<*const c_char>(src)),
        TypeKind::Object => object::push_object(ctx, Id::from_ptr(get::<*mut c_void>(src)), ownership),
        TypeKind::Class => object::push_object_strict(ctx, Id::from_ptr(get::<*mut c_void>(src)), ownership),
        TypeKind::Selector => {
            let sel = Sel::from_ptr(get::<*const c_void>(src));
            if sel.is_null() {
                Value::Nil
            } else {
                Value::Selector(sel)
            }
        }
        TypeKind::Pointer => {
            if get::<*const c_void>(src).is_null() {
                Value::Nil
            } else {
                Value::Blob(Blob::push(std::slice::from_raw_parts(src, desc.size)))
            }
        }
        TypeKind::Opaque(_) => Value::Blob(Blob::push(std::slice::from_raw_parts(src, desc.size))),
        TypeKind::Struct(def) => {
            let bytes = std::slice::from_raw_parts(src, def.size);
            Value::Struct(StructValue::from_bytes(def.clone(), bytes)?)
        }
    };
    Ok(value)
}

unsafe fn read_cstring(ptr: *const c_char) -> Value {
    if ptr.is_null() {
        return Value::Nil;
    }
    let cstr = CStr::from_ptr(ptr);
    match cstr.to_str() {
        Ok(s) => Value::string(s),
        Err(e) => {
            log::warn!("C string is not valid UTF-8 ({}), returning it as a blob", e);
            Value::Blob(Blob::push(cstr.to_bytes()))
        }
    }
}

/// Read a call's return value. Integers narrower than a word come back
/// widened to a full `ffi_arg` and are narrowed here.
///
/// # Safety
/// `src` must hold the return buffer of a completed call with return type
/// `desc`, at least one word long.
pub unsafe fn read_return(
    ctx: &Context,
    desc: &TypeDesc,
    src: *const u8,
    ownership: Ownership,
) -> BridgeResult<Value> {
    if !desc.is_small_integer() {
        return read_value(ctx, desc, src, ownership);
    }
    let word = get::<usize>(src);
    let value = match desc.kind {
        TypeKind::Char => Value::Number(word as i8 as f64),
        TypeKind::UChar => Value::Number(word as u8 as f64),
        TypeKind::Bool => Value::Bool(word as u8 != 0),
        TypeKind::Short => Value::Number(word as i16 as f64),
        TypeKind::UShort => Value::Number(word as u16 as f64),
        TypeKind::Int | TypeKind::Long => Value::Number(word as i32 as f64),
        _ => Value::Number(word as u32 as f64),
    };
    Ok(value)
}

/// Write a callback's return value, widening narrow integers to a word.
///
/// # Safety
/// `dst` must be the closure's return buffer for return type `desc`.
pub unsafe fn write_return(
    ctx: &Context,
    desc: &TypeDesc,
    value: &Value,
    dst: *mut u8,
    keep: &mut KeepAlive,
) -> BridgeResult<()> {
    if desc.is_void() {
        return Ok(());
    }
    if !desc.is_small_integer() {
        return write_value(ctx, desc, value, 0, dst, keep);
    }
    let bits = int_bits(check_number_or_bool(value, 0)?);
    let word = match desc.kind {
        TypeKind::Char => bits as i8 as isize as usize,
        TypeKind::UChar => bits as u8 as usize,
        TypeKind::Bool => (bits != 0) as usize,
        TypeKind::Short => bits as i16 as isize as usize,
        TypeKind::UShort => bits as u16 as usize,
        TypeKind::Int | TypeKind::Long => bits as i32 as isize as usize,
        _ => bits as u32 as usize,
    };
    put(dst, word);
    Ok(())
}

/// Size of the buffer a call's return value needs
pub fn return_buffer_size(desc: &TypeDesc) -> usize {
    desc.size.max(mem::size_of::<u64>())
}
