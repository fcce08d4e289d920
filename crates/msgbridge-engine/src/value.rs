//! Scripting values
//!
//! The scripting side of the bridge is dynamically typed. Every value is one
//! of twelve distinct kinds; the bridge-specific kinds (object, selector,
//! struct, structdef, blob, method) are only ever created by the bridge.
//!
//! Values are reference counted with `Rc`, so they never leave the thread of
//! the context that created them.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use msgbridge_sdk::{BridgeError, BridgeResult, Sel};
use rustc_hash::FxHashMap;

use crate::abi::StructDef;
use crate::blob::Blob;
use crate::context::Context;
use crate::dispatch::BoundMethod;
use crate::object::ObjectHandle;
use crate::structs::StructValue;

/// Signature of functions callable from script code
pub type NativeFn = dyn Fn(&Context, &[Value]) -> BridgeResult<Value>;

/// A callable script value
#[derive(Clone)]
pub struct Function(Rc<NativeFn>);

impl Function {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Context, &[Value]) -> BridgeResult<Value> + 'static,
    {
        Function(Rc::new(f))
    }

    pub fn call(&self, ctx: &Context, args: &[Value]) -> BridgeResult<Value> {
        (self.0)(ctx, args)
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function: {:p}", Rc::as_ptr(&self.0) as *const ())
    }
}

/// A scripting value
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Table(Rc<RefCell<Table>>),
    Function(Function),
    /// Shared reference to a native object
    Object(ObjectHandle),
    Selector(Sel),
    Struct(StructValue),
    /// Constructor for a registered struct type
    StructDef(Arc<StructDef>),
    Blob(Blob),
    /// Member looked up on an object, ready to call
    Method(Rc<BoundMethod>),
}

impl Value {
    /// Kind name used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Table(_) => "table",
            Value::Function(_) => "function",
            Value::Object(_) => "object",
            Value::Selector(_) => "selector",
            Value::Struct(_) => "struct",
            Value::StructDef(_) => "structdef",
            Value::Blob(_) => "blob",
            Value::Method(_) => "method",
        }
    }

    pub fn string(s: &str) -> Self {
        Value::String(Rc::from(s))
    }

    pub fn table(table: Table) -> Self {
        Value::Table(Rc::new(RefCell::new(table)))
    }

    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&Context, &[Value]) -> BridgeResult<Value> + 'static,
    {
        Value::Function(Function::new(f))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectHandle> {
        match self {
            Value::Object(h) => Some(h),
            _ => None,
        }
    }

    /// Lua-style truthiness: only nil and false are false
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// Argument `arg` as a string, or a type error
    pub fn check_str(&self, arg: usize) -> BridgeResult<&str> {
        self.as_str()
            .ok_or_else(|| BridgeError::type_check(arg, "string", self.type_name()))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Object(a), Value::Object(b)) => a.id() == b.id(),
            (Value::Selector(a), Value::Selector(b)) => a == b,
            (Value::Struct(a), Value::Struct(b)) => a == b,
            (Value::StructDef(a), Value::StructDef(b)) => Arc::ptr_eq(a, b),
            (Value::Blob(a), Value::Blob(b)) => a == b,
            (Value::Method(a), Value::Method(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Table(t) => write!(f, "table: {:p}", Rc::as_ptr(t)),
            Value::Function(func) => write!(f, "{:?}", func),
            Value::Object(h) => write!(f, "object: {:p}", h.id().as_ptr()),
            Value::Selector(sel) => write!(f, "selector: {:p}", sel.as_ptr()),
            Value::Struct(s) => write!(f, "struct {}: {:?}", s.def().name, s.bytes()),
            Value::StructDef(def) => write!(f, "structdef {}", def.name),
            Value::Blob(b) => write!(f, "blob: {} bytes", b.len()),
            Value::Method(m) => write!(f, "method {}", m.selector_name()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

// ============================================================================
// Tables
// ============================================================================

/// Hashable view of a table key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TableKey {
    Bool(bool),
    Int(i64),
    /// Non-integral number, by bit pattern
    Num(u64),
    Str(Rc<str>),
}

impl TableKey {
    fn from_value(key: &Value) -> BridgeResult<Self> {
        match key {
            Value::Bool(b) => Ok(TableKey::Bool(*b)),
            Value::Number(n) if n.is_nan() => Err(BridgeError::type_check(2, "non-NaN key", "NaN")),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 => {
                Ok(TableKey::Int(*n as i64))
            }
            Value::Number(n) => Ok(TableKey::Num(n.to_bits())),
            Value::String(s) => Ok(TableKey::Str(s.clone())),
            other => Err(BridgeError::type_check(
                2,
                "boolean, number or string key",
                other.type_name(),
            )),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            TableKey::Bool(b) => Value::Bool(*b),
            TableKey::Int(i) => Value::Number(*i as f64),
            TableKey::Num(bits) => Value::Number(f64::from_bits(*bits)),
            TableKey::Str(s) => Value::String(s.clone()),
        }
    }
}

/// Script table: a 1-based array part plus a hash part
#[derive(Debug, Default)]
pub struct Table {
    array: Vec<Value>,
    hash: FxHashMap<TableKey, Value>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table whose array part holds `items`
    pub fn from_array(items: Vec<Value>) -> Self {
        let mut table = Table {
            array: items,
            hash: FxHashMap::default(),
        };
        while table.array.last().is_some_and(Value::is_nil) {
            table.array.pop();
        }
        table
    }

    pub fn get(&self, key: &Value) -> Value {
        match TableKey::from_value(key) {
            Ok(TableKey::Int(i)) if i >= 1 && (i as usize) <= self.array.len() => {
                self.array[i as usize - 1].clone()
            }
            Ok(k) => self.hash.get(&k).cloned().unwrap_or_default(),
            Err(_) => Value::Nil,
        }
    }

    pub fn get_str(&self, key: &str) -> Value {
        self.hash
            .get(&TableKey::Str(Rc::from(key)))
            .cloned()
            .unwrap_or_default()
    }

    /// Assign `table[key] = value`; assigning nil removes the entry
    pub fn set(&mut self, key: Value, value: Value) -> BridgeResult<()> {
        if key.is_nil() {
            return Err(BridgeError::type_check(2, "non-nil key", "nil"));
        }
        let key = TableKey::from_value(&key)?;
        if let TableKey::Int(i) = key {
            let len = self.array.len() as i64;
            if i >= 1 && i <= len {
                self.array[i as usize - 1] = value;
                while self.array.last().is_some_and(Value::is_nil) {
                    self.array.pop();
                }
                return Ok(());
            }
            if i == len + 1 && !value.is_nil() {
                self.array.push(value);
                // Pull following integer keys out of the hash part
                let mut next = len + 2;
                while let Some(v) = self.hash.remove(&TableKey::Int(next)) {
                    self.array.push(v);
                    next += 1;
                }
                return Ok(());
            }
        }
        if value.is_nil() {
            self.hash.remove(&key);
        } else {
            self.hash.insert(key, value);
        }
        Ok(())
    }

    pub fn set_str(&mut self, key: &str, value: Value) {
        let key = TableKey::Str(Rc::from(key));
        if value.is_nil() {
            self.hash.remove(&key);
        } else {
            self.hash.insert(key, value);
        }
    }

    pub fn push(&mut self, value: Value) {
        let next = self.array.len() as f64 + 1.0;
        // Integral, non-nil key: cannot fail
        let _ = self.set(Value::Number(next), value);
    }

    /// Length of the array part
    pub fn len(&self) -> usize {
        self.array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.array.is_empty() && self.hash.is_empty()
    }

    /// True when the table has no hash part (a pure sequence)
    pub fn is_sequence(&self) -> bool {
        self.hash.is_empty()
    }

    pub fn array(&self) -> &[Value] {
        &self.array
    }

    /// All entries, array part first
    pub fn pairs(&self) -> Vec<(Value, Value)> {
        let mut out: Vec<(Value, Value)> = self
            .array
            .iter()
            .enumerate()
            .map(|(i, v)| (Value::Number(i as f64 + 1.0), v.clone()))
            .collect();
        out.extend(self.hash.iter().map(|(k, v)| (k.to_value(), v.clone())));
        out
    }
}
