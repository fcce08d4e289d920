//! Bridge and scripting contexts
//!
//! A `Bridge` pairs a native runtime with the bridge-wide selector interner
//! and may be shared across threads. A `Context` is one single-threaded
//! scripting state on top of a bridge: its own registry (fixed slots for
//! behaviour tables, statistics and the selector table), its method cache,
//! the script methods it installed and its return pool.
//!
//! # Example
//!
//! ```ignore
//! let bridge = Bridge::system();
//! let ctx = Context::open(bridge)?;
//! let cls = ctx.class("NSMutableArray")?;
//! let array = ctx.call(&ctx.index(&cls, &"new".into())?, &[])?;
//! ```

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use msgbridge_sdk::{BridgeError, BridgeResult, Class, Id, Imp, NativeRuntime, Sel};
use rustc_hash::FxHashMap;

use crate::abi::StructRegistry;
use crate::blob::Blob;
use crate::bootstrap::{self, Metatable, Registry, RegistryEntry, RegistrySlot, Stats, StatsSnapshot};
use crate::dispatch::{self, MethodSignature, ResolvedMethod, ScriptImp};
use crate::marshal::{self, KeepAlive};
use crate::object::{self, ObjectHandle, Ownership};
use crate::options::BridgeOptions;
use crate::selector::{self, SelectorInterner};
use crate::structs;
use crate::value::{Function, Table, Value};

// ============================================================================
// Bridge
// ============================================================================

/// A native runtime plus the selector interner shared by its contexts
pub struct Bridge {
    runtime: Arc<dyn NativeRuntime>,
    selectors: SelectorInterner,
}

impl Bridge {
    pub fn new(runtime: Arc<dyn NativeRuntime>) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            selectors: SelectorInterner::new(),
        })
    }

    /// Bridge over the system Objective-C runtime
    #[cfg(target_vendor = "apple")]
    pub fn system() -> Arc<Self> {
        Self::new(Arc::new(crate::objc::ObjcRuntime::new()))
    }

    pub fn runtime(&self) -> &Arc<dyn NativeRuntime> {
        &self.runtime
    }

    pub fn selectors(&self) -> &SelectorInterner {
        &self.selectors
    }

    /// Calls made into the runtime's selector interning routine so far
    pub fn native_interns(&self) -> u64 {
        self.selectors.native_interns()
    }
}

// ============================================================================
// Context
// ============================================================================

pub struct ContextInner {
    bridge: Arc<Bridge>,
    options: BridgeOptions,
    registry: Registry,
    methods: RefCell<FxHashMap<(Class, Sel), Rc<ResolvedMethod>>>,
    callbacks: RefCell<Vec<ScriptImp>>,
    return_pool: RefCell<KeepAlive>,
    depth: Cell<usize>,
}

/// Single-threaded scripting context
#[derive(Clone)]
pub struct Context(Rc<ContextInner>);

/// Tracks dispatch nesting; the return pool drains when the outermost
/// dispatch finishes
pub(crate) struct DispatchGuard<'a> {
    ctx: &'a Context,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        let depth = self.ctx.0.depth.get() - 1;
        self.ctx.0.depth.set(depth);
        if depth == 0 {
            self.ctx.drain_return_pool();
        }
    }
}

impl Context {
    /// Open a context with default options
    pub fn open(bridge: Arc<Bridge>) -> BridgeResult<Self> {
        Self::with_options(bridge, BridgeOptions::default())
    }

    pub fn with_options(bridge: Arc<Bridge>, options: BridgeOptions) -> BridgeResult<Self> {
        Self::open_with(bridge, options, Registry::new())
    }

    /// Open a context on an existing registry. The registry must be empty
    /// when `fast_lookups` is on.
    pub fn open_with(bridge: Arc<Bridge>, options: BridgeOptions, registry: Registry) -> BridgeResult<Self> {
        options.validate()?;
        bootstrap::open(&registry, &options)?;
        Ok(Context(Rc::new(ContextInner {
            bridge,
            options,
            registry,
            methods: RefCell::new(FxHashMap::default()),
            callbacks: RefCell::new(Vec::new()),
            return_pool: RefCell::new(KeepAlive::default()),
            depth: Cell::new(0),
        })))
    }

    pub(crate) fn from_inner(inner: Rc<ContextInner>) -> Self {
        Context(inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<ContextInner> {
        Rc::downgrade(&self.0)
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.0.bridge
    }

    pub fn runtime(&self) -> &Arc<dyn NativeRuntime> {
        &self.0.bridge.runtime
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.0.options
    }

    pub fn registry(&self) -> &Registry {
        &self.0.registry
    }

    // ========================================================================
    // Registry access
    // ========================================================================

    /// Fetch a fixed registry slot
    pub fn slot(&self, slot: RegistrySlot) -> BridgeResult<Rc<RegistryEntry>> {
        self.0
            .registry
            .slot(slot, self.0.options.fast_lookups)
            .ok_or(BridgeError::SlotOrder {
                name: slot.name,
                expected: slot.index,
                got: -1,
            })
    }

    pub(crate) fn stats_entry(&self) -> BridgeResult<Rc<RegistryEntry>> {
        self.slot(RegistrySlot::STATS)
    }

    fn with_stats(&self, f: impl FnOnce(&Stats)) {
        if let Ok(entry) = self.stats_entry() {
            if let RegistryEntry::Stats(stats) = &*entry {
                f(stats);
            }
        }
    }

    fn metatable(&self, slot: RegistrySlot) -> BridgeResult<Metatable> {
        match &*self.slot(slot)? {
            RegistryEntry::Metatable(mt) => Ok(mt.clone()),
            _ => Err(BridgeError::SlotOrder {
                name: slot.name,
                expected: slot.index,
                got: -1,
            }),
        }
    }

    fn metatable_of(&self, value: &Value) -> BridgeResult<Option<Metatable>> {
        let slot = match value {
            Value::Object(_) => RegistrySlot::OBJECT_MT,
            Value::Blob(_) => RegistrySlot::UNKNOWN_MT,
            Value::Selector(_) => RegistrySlot::SELECTOR_MT,
            Value::Struct(_) => RegistrySlot::STRUCT_MT,
            Value::StructDef(_) => RegistrySlot::STRUCT_DEF_MT,
            Value::Method(_) => RegistrySlot::METHOD_MT,
            _ => return Ok(None),
        };
        self.metatable(slot).map(Some)
    }

    /// Counters for this context
    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = StatsSnapshot {
            native_interns: self.bridge().native_interns(),
            ..StatsSnapshot::default()
        };
        self.with_stats(|stats| {
            snapshot.dispatches = stats.dispatches.get();
            snapshot.signature_hits = stats.signature_hits.get();
            snapshot.signature_misses = stats.signature_misses.get();
            snapshot.selector_hits = stats.selector_hits.get();
            snapshot.selector_misses = stats.selector_misses.get();
            snapshot.callbacks = stats.callbacks.get();
        });
        snapshot
    }

    pub(crate) fn record_dispatch(&self) {
        self.with_stats(|stats| Stats::bump(&stats.dispatches));
    }

    pub(crate) fn record_callback(&self) {
        self.with_stats(|stats| Stats::bump(&stats.callbacks));
    }

    // ========================================================================
    // Method cache and return pool
    // ========================================================================

    pub(crate) fn cached_method(&self, class: Class, sel: Sel) -> Option<Rc<ResolvedMethod>> {
        let hit = if self.0.options.cache_signatures {
            self.0.methods.borrow().get(&(class, sel)).cloned()
        } else {
            None
        };
        self.with_stats(|stats| match hit {
            Some(_) => Stats::bump(&stats.signature_hits),
            None => Stats::bump(&stats.signature_misses),
        });
        hit
    }

    pub(crate) fn cache_method(&self, method: Rc<ResolvedMethod>) {
        if self.0.options.cache_signatures {
            self.0
                .methods
                .borrow_mut()
                .insert((method.class, method.selector), method);
        }
    }

    /// Forget every resolved method (after methods were added or replaced)
    pub fn flush_method_cache(&self) {
        self.0.methods.borrow_mut().clear();
    }

    pub(crate) fn enter_dispatch(&self) -> DispatchGuard<'_> {
        self.0.depth.set(self.0.depth.get() + 1);
        DispatchGuard { ctx: self }
    }

    /// Current dispatch nesting depth
    pub fn depth(&self) -> usize {
        self.0.depth.get()
    }

    /// Keep values handed to native code alive until the pool drains
    pub(crate) fn park(&self, keep: KeepAlive) {
        if !keep.is_empty() {
            self.0.return_pool.borrow_mut().absorb(keep);
        }
    }

    /// Release everything parked for native callers
    pub fn drain_return_pool(&self) {
        let pool = std::mem::take(&mut *self.0.return_pool.borrow_mut());
        if !pool.is_empty() {
            log::trace!("draining {} parked values", pool.len());
        }
        drop(pool);
    }

    /// Number of values currently parked
    pub fn return_pool_len(&self) -> usize {
        self.0.return_pool.borrow().len()
    }

    // ========================================================================
    // Selectors, classes, messaging
    // ========================================================================

    /// Interned selector for `name`
    pub fn sel(&self, name: &str) -> BridgeResult<Sel> {
        selector::get(self, name)
    }

    /// Selector value for `name`
    pub fn selector(&self, name: &str) -> BridgeResult<Value> {
        selector::push(self, name)
    }

    /// Class object named `name`
    pub fn class(&self, name: &str) -> BridgeResult<Value> {
        let class = self
            .runtime()
            .get_class(name)
            .ok_or_else(|| BridgeError::ClassNotFound(name.to_string()))?;
        Ok(object::push_object_strict(self, class.as_id(), Ownership::Retain))
    }

    /// Send `sel` to `target`
    pub fn send(&self, target: &Value, sel: Sel, args: &[Value]) -> BridgeResult<Value> {
        dispatch::send(self, target, sel, args)
    }

    /// Send the selector named `name` to `target`
    pub fn send_str(&self, target: &Value, name: &str, args: &[Value]) -> BridgeResult<Value> {
        let sel = self.sel(name)?;
        dispatch::send(self, target, sel, args)
    }

    // ========================================================================
    // Generic value operations
    // ========================================================================

    /// `value[key]`
    pub fn index(&self, value: &Value, key: &Value) -> BridgeResult<Value> {
        if let Value::Table(table) = value {
            return Ok(table.borrow().get(key));
        }
        match self.metatable_of(value)?.and_then(|mt| mt.index) {
            Some(index) => index(self, value, key),
            None => Err(BridgeError::NotIndexable(value.type_name().to_string())),
        }
    }

    /// `value[key] = new_value`
    pub fn set_index(&self, value: &Value, key: &Value, new_value: Value) -> BridgeResult<()> {
        if let Value::Table(table) = value {
            return table.borrow_mut().set(key.clone(), new_value);
        }
        match self.metatable_of(value)?.and_then(|mt| mt.newindex) {
            Some(newindex) => newindex(self, value, key, new_value),
            None => Err(BridgeError::NotIndexable(value.type_name().to_string())),
        }
    }

    /// `value(args...)`
    pub fn call(&self, value: &Value, args: &[Value]) -> BridgeResult<Value> {
        if let Value::Function(function) = value {
            return function.call(self, args);
        }
        match self.metatable_of(value)?.and_then(|mt| mt.call) {
            Some(call) => call(self, value, args),
            None => Err(BridgeError::NotCallable(value.type_name().to_string())),
        }
    }

    /// `tostring(value)`
    pub fn tostring(&self, value: &Value) -> BridgeResult<String> {
        match value {
            Value::Nil => return Ok("nil".to_string()),
            Value::Bool(b) => return Ok(b.to_string()),
            Value::Number(n) => return Ok(n.to_string()),
            Value::String(s) => return Ok(s.to_string()),
            Value::Table(_) | Value::Function(_) => return Ok(format!("{:?}", value)),
            _ => {}
        }
        match self.metatable_of(value)?.and_then(|mt| mt.tostring) {
            Some(tostring) => tostring(self, value),
            None => Ok(format!("{}: {:?}", value.type_name(), value)),
        }
    }

    /// `#value`
    pub fn len(&self, value: &Value) -> BridgeResult<usize> {
        match value {
            Value::String(s) => return Ok(s.len()),
            Value::Table(t) => return Ok(t.borrow().len()),
            _ => {}
        }
        match self.metatable_of(value)?.and_then(|mt| mt.len) {
            Some(len) => match len(self, value)? {
                Value::Number(n) => Ok(n as usize),
                other => Err(BridgeError::type_check(0, "number", other.type_name())),
            },
            None => Err(BridgeError::type_check(1, "string, table or blob", value.type_name())),
        }
    }

    // ========================================================================
    // Bridge values
    // ========================================================================

    /// Struct definition value for a registered struct
    pub fn struct_def(&self, name: &str) -> BridgeResult<Value> {
        StructRegistry::global()
            .lookup(name)
            .map(Value::StructDef)
            .ok_or_else(|| BridgeError::UnknownStruct(name.to_string()))
    }

    /// Register a struct and return its definition value
    pub fn register_struct(&self, name: &str, encoding: &str) -> BridgeResult<Value> {
        Ok(Value::StructDef(StructRegistry::global().register(name, encoding)?))
    }

    /// New struct value from constructor arguments
    pub fn new_struct(&self, name: &str, args: &[Value]) -> BridgeResult<Value> {
        let def = StructRegistry::global()
            .lookup(name)
            .ok_or_else(|| BridgeError::UnknownStruct(name.to_string()))?;
        Ok(Value::Struct(structs::construct(self, &def, args)?))
    }

    /// Blob holding a copy of `bytes`
    pub fn push_blob(&self, bytes: &[u8]) -> Value {
        Value::Blob(Blob::push(bytes))
    }

    /// Script value for a native object, unwrapping numbers and strings
    pub fn push_object(&self, id: Id, ownership: Ownership) -> Value {
        object::push_object(self, id, ownership)
    }

    /// Script value for a native object, always a handle
    pub fn push_object_strict(&self, id: Id, ownership: Ownership) -> Value {
        object::push_object_strict(self, id, ownership)
    }

    /// Native object for a script value (boxing primitives and tables)
    pub fn to_object(&self, value: &Value) -> BridgeResult<Option<ObjectHandle>> {
        marshal::to_object(self, value, 1)
    }

    // ========================================================================
    // Reverse dispatch
    // ========================================================================

    /// Install `function` as the implementation of `selector` on `class`.
    ///
    /// `class` is a class object or a class name; `types` is the method's
    /// native encoding. The function is called with `(self, args...)`.
    pub fn implement(&self, class: &Value, selector_name: &str, types: &str, function: Function) -> BridgeResult<Imp> {
        let runtime = self.runtime();
        let class = match class {
            Value::Object(handle) if runtime.is_class(handle.id()) => handle.id().as_class(),
            Value::Object(_) => return Err(BridgeError::type_check(1, "class", "object")),
            Value::String(name) => runtime
                .get_class(name)
                .ok_or_else(|| BridgeError::ClassNotFound(name.to_string()))?,
            other => return Err(BridgeError::type_check(1, "class", other.type_name())),
        };
        let sel = self.sel(selector_name)?;
        let signature = MethodSignature::parse(
            types,
            StructRegistry::global(),
            self.0.options.opaque_unknown_structs,
        )?;

        let script_imp = ScriptImp::new(self, signature, function, selector_name);
        let imp = script_imp.imp();
        if !runtime.add_method(class, sel, imp, types) {
            return Err(BridgeError::UnsupportedType {
                code: types.to_string(),
                reason: format!("runtime refused method {}", selector_name),
            });
        }
        log::debug!(
            "installed script method -[{} {}] {}",
            runtime.class_name(class),
            selector_name,
            types
        );
        self.0.callbacks.borrow_mut().push(script_imp);
        self.flush_method_cache();
        Ok(imp)
    }

    /// Number of script methods installed by this context
    pub fn installed_methods(&self) -> usize {
        self.0.callbacks.borrow().len()
    }

    // ========================================================================
    // Library
    // ========================================================================

    /// The `objc` library table
    pub fn library(&self) -> Value {
        let mut lib = Table::new();
        lib.set_str("class", Value::function(lib_class));
        lib.set_str("sel", Value::function(lib_sel));
        lib.set_str("struct", Value::function(lib_struct));
        lib.set_str("blob", Value::function(lib_blob));
        lib.set_str("strict", Value::function(lib_strict));
        lib.set_str("send", Value::function(lib_send));
        lib.set_str("implement", Value::function(lib_implement));
        Value::table(lib)
    }
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or_default()
}

fn lib_class(ctx: &Context, args: &[Value]) -> BridgeResult<Value> {
    ctx.class(arg(args, 0).check_str(1)?)
}

fn lib_sel(ctx: &Context, args: &[Value]) -> BridgeResult<Value> {
    ctx.selector(arg(args, 0).check_str(1)?)
}

/// `struct(name)` looks a struct up, `struct(name, encoding)` registers it
fn lib_struct(ctx: &Context, args: &[Value]) -> BridgeResult<Value> {
    let name = arg(args, 0);
    let name = name.check_str(1)?;
    match arg(args, 1) {
        Value::Nil => ctx.struct_def(name),
        encoding => ctx.register_struct(name, encoding.check_str(2)?),
    }
}

fn lib_blob(ctx: &Context, args: &[Value]) -> BridgeResult<Value> {
    match arg(args, 0) {
        Value::String(s) => Ok(ctx.push_blob(s.as_bytes())),
        blob @ Value::Blob(_) => Ok(blob),
        other => Err(BridgeError::type_check(1, "string", other.type_name())),
    }
}

/// Box a value into a native object and return the undecorated handle
fn lib_strict(ctx: &Context, args: &[Value]) -> BridgeResult<Value> {
    Ok(marshal::to_object(ctx, &arg(args, 0), 1)?.map_or(Value::Nil, Value::Object))
}

fn lib_send(ctx: &Context, args: &[Value]) -> BridgeResult<Value> {
    let target = arg(args, 0);
    let sel = marshal::check_selector_or_string(ctx, &arg(args, 1), 2)?;
    let rest = args.get(2..).unwrap_or(&[]);
    ctx.send(&target, sel, rest)
}

fn lib_implement(ctx: &Context, args: &[Value]) -> BridgeResult<Value> {
    let class = arg(args, 0);
    let selector_name = arg(args, 1);
    let types = arg(args, 2);
    let function = match arg(args, 3) {
        Value::Function(f) => f,
        other => return Err(BridgeError::type_check(4, "function", other.type_name())),
    };
    let imp = ctx.implement(&class, selector_name.check_str(2)?, types.check_str(3)?, function)?;
    Ok(Value::Blob(Blob::push(&(imp.as_ptr() as usize).to_ne_bytes())))
}
