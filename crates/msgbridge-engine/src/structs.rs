//! Struct values
//!
//! A struct value is a byte buffer laid out exactly as the native ABI lays
//! out the registered struct, tagged with its definition. Fields are read
//! and written through the marshaling layer at their computed offsets.
//! Struct values of different names are never interchangeable, even when
//! their layouts agree.

use std::cell::{Ref, RefCell};
use std::fmt::Write as _;
use std::rc::Rc;
use std::sync::Arc;

use msgbridge_sdk::{BridgeError, BridgeResult};

use crate::abi::{StructDef, StructField};
use crate::bootstrap::Metatable;
use crate::context::Context;
use crate::marshal::{self, KeepAlive};
use crate::object::Ownership;
use crate::value::{Table, Value};

struct StructBox {
    def: Arc<StructDef>,
    bytes: RefCell<Box<[u8]>>,
    /// C strings and objects referenced from pointer fields
    keep: RefCell<KeepAlive>,
}

/// Script-side struct value
#[derive(Clone)]
pub struct StructValue(Rc<StructBox>);

impl StructValue {
    /// Zero-initialized value of `def`
    pub fn zeroed(def: Arc<StructDef>) -> Self {
        let bytes = vec![0u8; def.size].into_boxed_slice();
        Self::from_box(def, bytes)
    }

    /// Value of `def` holding a copy of `data`
    pub fn from_bytes(def: Arc<StructDef>, data: &[u8]) -> BridgeResult<Self> {
        if data.len() != def.size {
            return Err(BridgeError::SizeMismatch {
                expected: def.size,
                got: data.len(),
            });
        }
        Ok(Self::from_box(def, data.into()))
    }

    fn from_box(def: Arc<StructDef>, bytes: Box<[u8]>) -> Self {
        StructValue(Rc::new(StructBox {
            def,
            bytes: RefCell::new(bytes),
            keep: RefCell::new(KeepAlive::default()),
        }))
    }

    pub fn def(&self) -> &Arc<StructDef> {
        &self.0.def
    }

    pub fn bytes(&self) -> Ref<'_, [u8]> {
        Ref::map(self.0.bytes.borrow(), |b| &**b)
    }

    /// Copy the raw bytes into `dst`, which must hold `def().size` bytes
    ///
    /// # Safety
    /// `dst` must be valid for writes of the struct's size.
    pub(crate) unsafe fn copy_to(&self, dst: *mut u8) {
        let bytes = self.0.bytes.borrow();
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
    }

    fn field(&self, key: &Value) -> BridgeResult<&StructField> {
        let name = match key {
            Value::String(s) => s.to_string(),
            Value::Number(n) => n.to_string(),
            other => return Err(BridgeError::type_check(2, "string or number", other.type_name())),
        };
        self.0.def.field(&name).ok_or_else(|| BridgeError::UnknownField {
            name: self.0.def.name.clone(),
            field: name,
        })
    }

    /// Read a field by name or 1-based position
    pub fn get(&self, ctx: &Context, key: &Value) -> BridgeResult<Value> {
        let field = self.field(key)?;
        let bytes = self.0.bytes.borrow();
        // Fields lie inside the buffer by construction of the layout
        let src = unsafe { bytes.as_ptr().add(field.offset) };
        unsafe { marshal::read_value(ctx, &field.ty, src, Ownership::Retain) }
    }

    /// Write a field by name or 1-based position
    pub fn set(&self, ctx: &Context, key: &Value, value: &Value) -> BridgeResult<()> {
        let field = self.field(key)?;
        let mut keep = KeepAlive::default();
        {
            let mut bytes = self.0.bytes.borrow_mut();
            let dst = unsafe { bytes.as_mut_ptr().add(field.offset) };
            unsafe { marshal::write_value(ctx, &field.ty, value, 3, dst, &mut keep)? };
        }
        self.0.keep.borrow_mut().absorb(keep);
        Ok(())
    }
}

impl PartialEq for StructValue {
    fn eq(&self, other: &StructValue) -> bool {
        self.0.def.name == other.0.def.name && *self.bytes() == *other.bytes()
    }
}

impl std::fmt::Debug for StructValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StructValue({}, {:?})", self.0.def.name, &*self.bytes())
    }
}

/// Argument `arg` as a struct value named `name`
pub fn check<'a>(value: &'a Value, name: &str, arg: usize) -> BridgeResult<&'a StructValue> {
    match value {
        Value::Struct(s) if s.def().name == name => Ok(s),
        Value::Struct(s) => Err(BridgeError::type_check(arg, name, s.def().name.as_str())),
        other => Err(BridgeError::type_check(arg, name, other.type_name())),
    }
}

/// Struct value named `name` holding a copy of `data`
pub fn push(name: &str, data: &[u8]) -> BridgeResult<Value> {
    let def = crate::abi::StructRegistry::global()
        .lookup(name)
        .ok_or_else(|| BridgeError::UnknownStruct(name.to_string()))?;
    Ok(Value::Struct(StructValue::from_bytes(def, data)?))
}

/// Build a value of `def` from constructor arguments: nothing (zeroed), one
/// table (fields by name or position), or one argument per field
pub fn construct(ctx: &Context, def: &Arc<StructDef>, args: &[Value]) -> BridgeResult<StructValue> {
    let value = StructValue::zeroed(def.clone());
    match args {
        [] => {}
        [Value::Table(table)] => {
            let entries = table.borrow().pairs();
            for (key, field_value) in entries {
                value.set(ctx, &key, &field_value)?;
            }
        }
        _ => {
            if args.len() > def.fields.len() {
                return Err(BridgeError::ArgumentCount {
                    selector: def.name.clone(),
                    expected: def.fields.len(),
                    got: args.len(),
                });
            }
            for (i, arg) in args.iter().enumerate() {
                value.set(ctx, &Value::Number(i as f64 + 1.0), arg)?;
            }
        }
    }
    Ok(value)
}

// ============================================================================
// Metatables
// ============================================================================

pub(crate) fn metatable() -> Metatable {
    Metatable {
        name: "struct",
        index: Some(struct_index),
        newindex: Some(struct_newindex),
        tostring: Some(struct_tostring),
        len: Some(struct_len),
        ..Metatable::default()
    }
}

pub(crate) fn def_metatable() -> Metatable {
    Metatable {
        name: "structdef",
        index: Some(def_index),
        call: Some(def_call),
        tostring: Some(def_tostring),
        ..Metatable::default()
    }
}

fn as_struct(value: &Value) -> BridgeResult<&StructValue> {
    match value {
        Value::Struct(s) => Ok(s),
        other => Err(BridgeError::type_check(1, "struct", other.type_name())),
    }
}

fn as_def(value: &Value) -> BridgeResult<&Arc<StructDef>> {
    match value {
        Value::StructDef(def) => Ok(def),
        other => Err(BridgeError::type_check(1, "structdef", other.type_name())),
    }
}

fn struct_index(ctx: &Context, value: &Value, key: &Value) -> BridgeResult<Value> {
    as_struct(value)?.get(ctx, key)
}

fn struct_newindex(ctx: &Context, value: &Value, key: &Value, new_value: Value) -> BridgeResult<()> {
    as_struct(value)?.set(ctx, key, &new_value)
}

fn struct_len(_ctx: &Context, value: &Value) -> BridgeResult<Value> {
    Ok(Value::Number(as_struct(value)?.def().size as f64))
}

fn struct_tostring(ctx: &Context, value: &Value) -> BridgeResult<String> {
    let s = as_struct(value)?;
    let def = s.def();
    let mut out = format!("{}(", def.name);
    for (i, field) in def.fields.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let key = Value::Number(i as f64 + 1.0);
        let shown = ctx.tostring(&s.get(ctx, &key)?)?;
        match &field.name {
            Some(name) => {
                let _ = write!(out, "{}={}", name, shown);
            }
            None => out.push_str(&shown),
        }
    }
    out.push(')');
    Ok(out)
}

fn def_index(_ctx: &Context, value: &Value, key: &Value) -> BridgeResult<Value> {
    let def = as_def(value)?;
    match key.check_str(2)? {
        "name" => Ok(Value::string(&def.name)),
        "size" => Ok(Value::Number(def.size as f64)),
        "align" => Ok(Value::Number(def.align as f64)),
        "fields" => {
            let names = def
                .fields
                .iter()
                .map(|f| f.name.as_deref().map_or(Value::Nil, Value::string))
                .collect();
            Ok(Value::table(Table::from_array(names)))
        }
        _ => Ok(Value::Nil),
    }
}

fn def_call(ctx: &Context, value: &Value, args: &[Value]) -> BridgeResult<Value> {
    let def = as_def(value)?;
    Ok(Value::Struct(construct(ctx, def, args)?))
}

fn def_tostring(_ctx: &Context, value: &Value) -> BridgeResult<String> {
    let def = as_def(value)?;
    Ok(format!("structdef {} ({} bytes)", def.name, def.size))
}
