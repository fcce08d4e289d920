//! Selector cache
//!
//! Two levels sit in front of the runtime's (locked) interning routine:
//!
//! 1. a per-context table in registry slot `SEL_CACHE`, no locking;
//! 2. the bridge-wide `SelectorInterner`, shared by every context on the
//!    same `Bridge`.
//!
//! The runtime is only asked to intern a name the bridge has never seen.
//! Entries are never evicted; selectors are immortal in the runtime too.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use msgbridge_sdk::{BridgeError, BridgeResult, NativeRuntime, Sel};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::bootstrap::{Metatable, RegistryEntry, RegistrySlot, Stats};
use crate::context::Context;
use crate::value::Value;

// ============================================================================
// Bridge-wide interner
// ============================================================================

/// Process-level selector map shared by all contexts of a bridge
#[derive(Default)]
pub struct SelectorInterner {
    map: RwLock<FxHashMap<String, Sel>>,
    native_interns: AtomicU64,
}

impl SelectorInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `name`, calling into the runtime only on a bridge-wide miss
    pub fn intern(&self, runtime: &dyn NativeRuntime, name: &str) -> Sel {
        if let Some(sel) = self.map.read().get(name) {
            return *sel;
        }
        let mut map = self.map.write();
        // Another context may have interned it between the two locks
        if let Some(sel) = map.get(name) {
            return *sel;
        }
        let sel = runtime.register_selector(name);
        self.native_interns.fetch_add(1, Ordering::Relaxed);
        log::debug!("interned selector {}", name);
        map.insert(name.to_string(), sel);
        sel
    }

    /// Number of calls made into the runtime's interning routine
    pub fn native_interns(&self) -> u64 {
        self.native_interns.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

// ============================================================================
// Per-context table
// ============================================================================

/// Context-local selector table (registry slot `SEL_CACHE`)
#[derive(Default)]
pub struct SelectorTable {
    map: RefCell<FxHashMap<String, Sel>>,
}

impl SelectorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Sel> {
        self.map.borrow().get(name).copied()
    }

    pub fn insert(&self, name: &str, sel: Sel) {
        self.map.borrow_mut().insert(name.to_string(), sel);
    }

    pub fn len(&self) -> usize {
        self.map.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.borrow().is_empty()
    }
}

/// Selector for `name`, through the context table and the bridge interner
pub fn get(ctx: &Context, name: &str) -> BridgeResult<Sel> {
    let entry = ctx.slot(RegistrySlot::SEL_CACHE)?;
    let RegistryEntry::Selectors(table) = &*entry else {
        return Err(corrupt_slot());
    };
    let stats = ctx.stats_entry()?;
    let stats = match &*stats {
        RegistryEntry::Stats(stats) => Some(stats),
        _ => None,
    };
    if let Some(sel) = table.get(name) {
        if let Some(stats) = stats {
            Stats::bump(&stats.selector_hits);
        }
        return Ok(sel);
    }
    if let Some(stats) = stats {
        Stats::bump(&stats.selector_misses);
    }
    let bridge = ctx.bridge();
    let sel = bridge.selectors().intern(bridge.runtime().as_ref(), name);
    table.insert(name, sel);
    Ok(sel)
}

fn corrupt_slot() -> BridgeError {
    BridgeError::SlotOrder {
        name: RegistrySlot::SEL_CACHE.name,
        expected: RegistrySlot::SEL_CACHE.index,
        got: -1,
    }
}

/// Selector value for `name`
pub fn push(ctx: &Context, name: &str) -> BridgeResult<Value> {
    Ok(Value::Selector(get(ctx, name)?))
}

/// Argument `arg` as a selector; nil is the null selector
pub fn check(value: &Value, arg: usize) -> BridgeResult<Sel> {
    match value {
        Value::Nil => Ok(Sel::null()),
        Value::Selector(sel) => Ok(*sel),
        other => Err(BridgeError::type_check(arg, "selector", other.type_name())),
    }
}

/// Like `check`, but strings are interned on the spot
pub fn check_or_string(ctx: &Context, value: &Value, arg: usize) -> BridgeResult<Sel> {
    match value {
        Value::String(name) => get(ctx, name),
        other => check(other, arg),
    }
}

/// Name of a selector as the runtime reports it
pub fn name(ctx: &Context, sel: Sel) -> String {
    ctx.runtime().selector_name(sel)
}

// ============================================================================
// Metatable
// ============================================================================

pub(crate) fn metatable() -> Metatable {
    Metatable {
        name: "selector",
        index: Some(selector_index),
        call: Some(selector_call),
        tostring: Some(selector_tostring),
        ..Metatable::default()
    }
}

fn selector_index(ctx: &Context, value: &Value, key: &Value) -> BridgeResult<Value> {
    let sel = check(value, 1)?;
    match key.check_str(2)? {
        "name" => Ok(Value::string(&name(ctx, sel))),
        "args" => {
            let count = name(ctx, sel).bytes().filter(|&b| b == b':').count();
            Ok(Value::Number(count as f64))
        }
        _ => Ok(Value::Nil),
    }
}

/// `sel(target, ...)` sends the selector to `target`
fn selector_call(ctx: &Context, value: &Value, args: &[Value]) -> BridgeResult<Value> {
    let sel = check(value, 0)?;
    let Some((target, rest)) = args.split_first() else {
        return Err(BridgeError::type_check(1, "object", "no value"));
    };
    crate::dispatch::send(ctx, target, sel, rest)
}

fn selector_tostring(ctx: &Context, value: &Value) -> BridgeResult<String> {
    let sel = check(value, 1)?;
    Ok(format!("@selector({})", name(ctx, sel)))
}
