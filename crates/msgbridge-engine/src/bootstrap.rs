//! Registry bootstrap
//!
//! Each context owns a registry: an append-only list of shared entries
//! addressed by 1-based integer references, plus an optional name index.
//! The bridge keeps its per-kind behaviour tables, its statistics and its
//! selector table in fixed slots so hot paths can fetch them by integer
//! instead of hashing a name.
//!
//! Slot numbers are an ordering contract: `open` registers the tables in a
//! fixed order and verifies every returned reference. A registry that
//! already holds entries shifts every reference and is rejected unless
//! `fast_lookups` is off.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use msgbridge_sdk::{BridgeError, BridgeResult};
use rustc_hash::FxHashMap;

use crate::context::Context;
use crate::options::BridgeOptions;
use crate::selector::SelectorTable;
use crate::value::Value;

// ============================================================================
// Metatables
// ============================================================================

pub type IndexFn = fn(&Context, &Value, &Value) -> BridgeResult<Value>;
pub type NewIndexFn = fn(&Context, &Value, &Value, Value) -> BridgeResult<()>;
pub type CallFn = fn(&Context, &Value, &[Value]) -> BridgeResult<Value>;
pub type ToStringFn = fn(&Context, &Value) -> BridgeResult<String>;
pub type LenFn = fn(&Context, &Value) -> BridgeResult<Value>;

/// Behaviour table for one bridge value kind
#[derive(Default, Clone)]
pub struct Metatable {
    pub name: &'static str,
    pub index: Option<IndexFn>,
    pub newindex: Option<NewIndexFn>,
    pub call: Option<CallFn>,
    pub tostring: Option<ToStringFn>,
    pub len: Option<LenFn>,
}

// ============================================================================
// Statistics
// ============================================================================

/// Per-context counters
#[derive(Debug, Default)]
pub struct Stats {
    pub dispatches: Cell<u64>,
    pub signature_hits: Cell<u64>,
    pub signature_misses: Cell<u64>,
    pub selector_hits: Cell<u64>,
    pub selector_misses: Cell<u64>,
    pub callbacks: Cell<u64>,
}

impl Stats {
    pub(crate) fn bump(counter: &Cell<u64>) {
        counter.set(counter.get() + 1);
    }
}

/// Point-in-time copy of a context's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub dispatches: u64,
    pub signature_hits: u64,
    pub signature_misses: u64,
    pub selector_hits: u64,
    pub selector_misses: u64,
    pub callbacks: u64,
    /// Calls into the runtime's selector interning routine (bridge-wide)
    pub native_interns: u64,
}

// ============================================================================
// Registry
// ============================================================================

/// Registry entry
pub enum RegistryEntry {
    Metatable(Metatable),
    Selectors(SelectorTable),
    Stats(Stats),
    Value(Value),
}

/// Fixed registry slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySlot {
    pub name: &'static str,
    pub index: i32,
}

impl RegistrySlot {
    pub const OBJECT_MT: Self = Self::new("OBJECT_MT", 1);
    pub const UNKNOWN_MT: Self = Self::new("UNKNOWN_MT", 2);
    pub const STATS: Self = Self::new("STATS", 3);
    pub const SEL_CACHE: Self = Self::new("SEL_CACHE", 4);
    pub const SELECTOR_MT: Self = Self::new("SELECTOR_MT", 5);
    pub const STRUCT_MT: Self = Self::new("STRUCT_MT", 6);
    pub const STRUCT_DEF_MT: Self = Self::new("STRUCT_DEF_MT", 7);
    pub const METHOD_MT: Self = Self::new("METHOD_MT", 8);

    /// Registration order
    pub const ALL: [Self; 8] = [
        Self::OBJECT_MT,
        Self::UNKNOWN_MT,
        Self::STATS,
        Self::SEL_CACHE,
        Self::SELECTOR_MT,
        Self::STRUCT_MT,
        Self::STRUCT_DEF_MT,
        Self::METHOD_MT,
    ];

    const fn new(name: &'static str, index: i32) -> Self {
        Self { name, index }
    }
}

/// Reference-addressed registry
#[derive(Default)]
pub struct Registry {
    entries: RefCell<Vec<Rc<RegistryEntry>>>,
    names: RefCell<FxHashMap<String, i32>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an entry and return its reference (1-based)
    pub fn reference(&self, entry: RegistryEntry) -> i32 {
        let mut entries = self.entries.borrow_mut();
        entries.push(Rc::new(entry));
        entries.len() as i32
    }

    /// Store an entry and make it reachable by name
    pub fn set_named(&self, name: &str, entry: RegistryEntry) -> i32 {
        let reference = self.reference(entry);
        self.names.borrow_mut().insert(name.to_string(), reference);
        reference
    }

    pub fn get(&self, reference: i32) -> Option<Rc<RegistryEntry>> {
        if reference < 1 {
            return None;
        }
        self.entries.borrow().get(reference as usize - 1).cloned()
    }

    pub fn get_named(&self, name: &str) -> Option<Rc<RegistryEntry>> {
        let reference = *self.names.borrow().get(name)?;
        self.get(reference)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Fetch a fixed slot, by integer or by name depending on `fast_lookups`
    pub fn slot(&self, slot: RegistrySlot, fast_lookups: bool) -> Option<Rc<RegistryEntry>> {
        if fast_lookups {
            self.get(slot.index)
        } else {
            self.get_named(slot.name)
        }
    }
}

fn entry_for(slot: RegistrySlot) -> RegistryEntry {
    match slot.index {
        1 => RegistryEntry::Metatable(crate::object::metatable()),
        2 => RegistryEntry::Metatable(crate::blob::metatable()),
        3 => RegistryEntry::Stats(Stats::default()),
        4 => RegistryEntry::Selectors(SelectorTable::new()),
        5 => RegistryEntry::Metatable(crate::selector::metatable()),
        6 => RegistryEntry::Metatable(crate::structs::metatable()),
        7 => RegistryEntry::Metatable(crate::structs::def_metatable()),
        _ => RegistryEntry::Metatable(crate::dispatch::metatable()),
    }
}

/// Register the fixed tables in slot order.
///
/// With `fast_lookups` every reference must match its slot; otherwise the
/// tables are indexed by name and may land anywhere.
pub fn open(registry: &Registry, options: &BridgeOptions) -> BridgeResult<()> {
    for slot in RegistrySlot::ALL {
        let got = registry.set_named(slot.name, entry_for(slot));
        if options.fast_lookups && got != slot.index {
            return Err(BridgeError::SlotOrder {
                name: slot.name,
                expected: slot.index,
                got,
            });
        }
    }
    log::debug!(
        "bridge registry opened ({} entries, fast lookups {})",
        registry.len(),
        options.fast_lookups
    );
    Ok(())
}
