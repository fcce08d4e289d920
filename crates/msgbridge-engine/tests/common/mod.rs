//! Mock message-dispatch runtime for integration tests
//!
//! Classes and objects are leaked on purpose: tests inspect retain counts
//! after the bridge has released its references, so the memory must stay
//! valid. Method implementations are real `extern "C"` functions with the
//! ABI their encodings describe, so every dispatch goes through libffi.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use msgbridge_engine::{Bridge, BridgeOptions, Class, Context, Id, Imp, NativeRuntime, Sel};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

// ============================================================================
// Selectors
// ============================================================================

/// Process-wide selector table, like the real runtime's
static SELECTORS: Lazy<Mutex<HashMap<String, usize>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn intern(name: &str) -> Sel {
    let mut selectors = SELECTORS.lock();
    let ptr = *selectors.entry(name.to_string()).or_insert_with(|| {
        let leaked: &'static CStr = Box::leak(CString::new(name).unwrap().into_boxed_c_str());
        leaked.as_ptr() as usize
    });
    Sel::from_ptr(ptr as *const c_void)
}

// ============================================================================
// Classes and objects
// ============================================================================

#[repr(C)]
pub struct MockClass {
    /// Metaclass for classes, null for metaclasses
    isa: *const MockClass,
    name: String,
    superclass: *const MockClass,
    methods: RwLock<HashMap<usize, (String, Imp)>>,
}

pub enum Payload {
    Plain,
    Number(f64),
    Str(String),
    Array(Vec<Id>),
    Dict(Vec<Id>, Vec<Id>),
}

#[repr(C)]
pub struct MockObject {
    isa: *const MockClass,
    pub retains: AtomicI64,
    pub value: AtomicI64,
    /// Native calls made on this object
    pub calls: AtomicU64,
    pub payload: Payload,
}

struct ClassTable {
    by_name: HashMap<String, usize>,
    all: HashSet<usize>,
}

static CLASSES: Lazy<Mutex<ClassTable>> = Lazy::new(|| {
    Mutex::new(ClassTable {
        by_name: HashMap::new(),
        all: HashSet::new(),
    })
});

static BUILTINS: Lazy<()> = Lazy::new(install_builtins);

fn leak_class(name: &str, isa: *const MockClass, superclass: *const MockClass) -> *const MockClass {
    Box::leak(Box::new(MockClass {
        isa,
        name: name.to_string(),
        superclass,
        methods: RwLock::new(HashMap::new()),
    }))
}

/// Define a class (and its metaclass) inheriting from `superclass`
pub fn define_class(name: &str, superclass: Option<&str>) -> Class {
    let superclass = superclass.map_or(std::ptr::null(), lookup_class);
    let super_meta = if superclass.is_null() {
        std::ptr::null()
    } else {
        unsafe { (*superclass).isa }
    };
    let meta = leak_class(name, std::ptr::null(), super_meta);
    let class = leak_class(name, meta, superclass);
    let mut classes = CLASSES.lock();
    classes.by_name.insert(name.to_string(), class as usize);
    classes.all.insert(class as usize);
    classes.all.insert(meta as usize);
    Class::from_ptr(class as *const c_void)
}

fn lookup_class(name: &str) -> *const MockClass {
    CLASSES
        .lock()
        .by_name
        .get(name)
        .map_or(std::ptr::null(), |&p| p as *const MockClass)
}

pub fn class(name: &str) -> Class {
    Lazy::force(&BUILTINS);
    Class::from_ptr(lookup_class(name) as *const c_void)
}

fn metaclass(class: Class) -> Class {
    unsafe { Class::from_ptr((*(class.as_ptr() as *const MockClass)).isa as *const c_void) }
}

fn is_class(id: Id) -> bool {
    CLASSES.lock().all.contains(&(id.as_ptr() as usize))
}

/// Add an instance method to `class`
pub fn add_method(class: Class, selector: &str, types: &str, imp: *const c_void) {
    let class = unsafe { &*(class.as_ptr() as *const MockClass) };
    class
        .methods
        .write()
        .insert(intern(selector).as_ptr() as usize, (types.to_string(), Imp::from_ptr(imp)));
}

/// Add a class method to `class`
pub fn add_class_method(class: Class, selector: &str, types: &str, imp: *const c_void) {
    add_method(metaclass(class), selector, types, imp);
}

fn find_method(class: Class, sel: Sel) -> Option<(String, Imp)> {
    let mut current = class.as_ptr() as *const MockClass;
    while !current.is_null() {
        let class = unsafe { &*current };
        if let Some(found) = class.methods.read().get(&(sel.as_ptr() as usize)) {
            return Some(found.clone());
        }
        current = class.superclass;
    }
    None
}

/// New object at +1
pub fn new_object(class: Class, payload: Payload) -> Id {
    let object = Box::leak(Box::new(MockObject {
        isa: class.as_ptr() as *const MockClass,
        retains: AtomicI64::new(1),
        value: AtomicI64::new(0),
        calls: AtomicU64::new(0),
        payload,
    }));
    Id::from_ptr(object as *mut MockObject as *mut c_void)
}

pub fn object(id: Id) -> &'static MockObject {
    unsafe { &*(id.as_ptr() as *const MockObject) }
}

pub fn retain_count(id: Id) -> i64 {
    object(id).retains.load(Ordering::SeqCst)
}

pub fn calls(id: Id) -> u64 {
    object(id).calls.load(Ordering::SeqCst)
}

fn class_of_object(id: Id) -> Class {
    unsafe { Class::from_ptr((*(id.as_ptr() as *const MockClass)).isa as *const c_void) }
}

// ============================================================================
// Fixture methods
// ============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CGPoint {
    pub x: f64,
    pub y: f64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CGSize {
    pub width: f64,
    pub height: f64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CGRect {
    pub origin: CGPoint,
    pub size: CGSize,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mystery {
    pub a: i32,
    pub b: i32,
}

fn touch(this: Id) {
    object(this).calls.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn calc_new(class: Id, _cmd: Sel) -> Id {
    new_object(class.as_class(), Payload::Plain)
}

extern "C" fn calc_alloc(class: Id, _cmd: Sel) -> Id {
    new_object(class.as_class(), Payload::Plain)
}

extern "C" fn calc_init(this: Id, _cmd: Sel) -> Id {
    touch(this);
    object(this).value.store(1, Ordering::SeqCst);
    // init consumes the receiver and returns it at +1
    this
}

extern "C" fn calc_add_flag(this: Id, _cmd: Sel, a: i32, flag: u8) -> i32 {
    touch(this);
    a + flag as i32
}

extern "C" fn calc_negate(this: Id, _cmd: Sel, a: i16) -> i16 {
    touch(this);
    -a
}

extern "C" fn calc_value(this: Id, _cmd: Sel) -> i32 {
    touch(this);
    object(this).value.load(Ordering::SeqCst) as i32
}

extern "C" fn calc_set_value(this: Id, _cmd: Sel, value: i32) {
    touch(this);
    object(this).value.store(value as i64, Ordering::SeqCst);
}

extern "C" fn calc_scale(this: Id, _cmd: Sel, factor: f64) -> f64 {
    touch(this);
    object(this).value.load(Ordering::SeqCst) as f64 * factor
}

extern "C" fn calc_origin(this: Id, _cmd: Sel) -> CGPoint {
    touch(this);
    CGPoint { x: 1.5, y: -2.0 }
}

extern "C" fn calc_offset_by(this: Id, _cmd: Sel, point: CGPoint, delta: f64) -> CGPoint {
    touch(this);
    CGPoint {
        x: point.x + delta,
        y: point.y + delta,
    }
}

extern "C" fn calc_frame(this: Id, _cmd: Sel) -> CGRect {
    touch(this);
    CGRect {
        origin: CGPoint { x: 0.0, y: 10.0 },
        size: CGSize {
            width: 320.0,
            height: 480.0,
        },
    }
}

extern "C" fn calc_area(this: Id, _cmd: Sel, rect: CGRect) -> f64 {
    touch(this);
    rect.size.width * rect.size.height
}

extern "C" fn calc_mystery(this: Id, _cmd: Sel) -> Mystery {
    touch(this);
    Mystery { a: 7, b: 9 }
}

extern "C" fn calc_echo_mystery(this: Id, _cmd: Sel, m: Mystery) -> i32 {
    touch(this);
    m.a * 10 + m.b
}

/// Autoreleased (+0) number, kept alive by the leak
extern "C" fn calc_answer(this: Id, _cmd: Sel) -> Id {
    touch(this);
    new_object(class("NSNumber"), Payload::Number(42.0))
}

extern "C" fn calc_greeting(this: Id, _cmd: Sel) -> *const c_char {
    touch(this);
    b"hello\0".as_ptr() as *const c_char
}

extern "C" fn calc_garbage(this: Id, _cmd: Sel) -> *const c_char {
    touch(this);
    b"\xff\xfe\0".as_ptr() as *const c_char
}

extern "C" fn calc_length(this: Id, _cmd: Sel, s: *const c_char) -> i32 {
    touch(this);
    if s.is_null() {
        return -1;
    }
    unsafe { CStr::from_ptr(s).to_bytes().len() as i32 }
}

extern "C" fn calc_identity(this: Id, _cmd: Sel, value: Id) -> Id {
    touch(this);
    value
}

extern "C" fn calc_count(this: Id, _cmd: Sel, collection: Id) -> u64 {
    touch(this);
    if collection.is_nil() {
        return 0;
    }
    match &object(collection).payload {
        Payload::Array(items) => items.len() as u64,
        Payload::Dict(keys, _) => keys.len() as u64,
        _ => u64::MAX,
    }
}

extern "C" fn calc_selector_name(this: Id, _cmd: Sel, sel: Sel) -> *const c_char {
    touch(this);
    sel.as_ptr() as *const c_char
}

extern "C" fn calc_self_selector(this: Id, cmd: Sel) -> Sel {
    touch(this);
    cmd
}

extern "C" fn calc_class_of(this: Id, _cmd: Sel) -> Class {
    touch(this);
    class_of_object(this)
}

extern "C" fn calc_is_nil_class(this: Id, _cmd: Sel, class: Class) -> u8 {
    touch(this);
    class.is_null() as u8
}

extern "C" fn calc_pointer(this: Id, _cmd: Sel) -> *const c_void {
    touch(this);
    this.as_ptr()
}

extern "C" fn calc_same_pointer(this: Id, _cmd: Sel, ptr: *const c_void) -> u8 {
    touch(this);
    (ptr == this.as_ptr() as *const c_void) as u8
}

/// Calls `compute:` on itself through the method table and adds one
extern "C" fn calc_call_compute(this: Id, _cmd: Sel, x: i32) -> i32 {
    touch(this);
    let sel = intern("compute:");
    match find_method(class_of_object(this), sel) {
        Some((_, imp)) => {
            let f: extern "C" fn(Id, Sel, i32) -> i32 = unsafe { std::mem::transmute(imp.as_ptr()) };
            f(this, sel, x) + 1
        }
        None => -1,
    }
}

/// Calls `label` on itself and reports the C string's length
extern "C" fn calc_call_label(this: Id, _cmd: Sel) -> i32 {
    touch(this);
    let sel = intern("label");
    match find_method(class_of_object(this), sel) {
        Some((_, imp)) => {
            let f: extern "C" fn(Id, Sel) -> *const c_char = unsafe { std::mem::transmute(imp.as_ptr()) };
            let s = f(this, sel);
            if s.is_null() {
                -1
            } else {
                unsafe { CStr::from_ptr(s).to_bytes().len() as i32 }
            }
        }
        None => -2,
    }
}

/// Calls `makePoint:` on itself and sums the result
extern "C" fn calc_call_make_point(this: Id, _cmd: Sel, x: f64) -> f64 {
    touch(this);
    let sel = intern("makePoint:");
    match find_method(class_of_object(this), sel) {
        Some((_, imp)) => {
            let f: extern "C" fn(Id, Sel, f64) -> CGPoint = unsafe { std::mem::transmute(imp.as_ptr()) };
            let p = f(this, sel, x);
            p.x + p.y
        }
        None => -1.0,
    }
}

/// Calls `makeRect:` on itself and folds the rect into one number
extern "C" fn calc_call_make_rect(this: Id, _cmd: Sel, width: f64) -> f64 {
    touch(this);
    let sel = intern("makeRect:");
    match find_method(class_of_object(this), sel) {
        Some((_, imp)) => {
            let f: extern "C" fn(Id, Sel, f64) -> CGRect = unsafe { std::mem::transmute(imp.as_ptr()) };
            let r = f(this, sel, width);
            r.origin.x + r.origin.y * 10.0 + r.size.width * r.size.height
        }
        None => -1.0,
    }
}

fn install_builtins() {
    define_class("NSObject", None);
    define_class("NSNumber", Some("NSObject"));
    define_class("NSString", Some("NSObject"));
    define_class("NSArray", Some("NSObject"));
    define_class("NSDictionary", Some("NSObject"));
    let calc = define_class("Calculator", Some("NSObject"));

    add_class_method(calc, "new", "@16@0:8", calc_new as *const c_void);
    add_class_method(calc, "alloc", "@16@0:8", calc_alloc as *const c_void);
    add_method(calc, "init", "@16@0:8", calc_init as *const c_void);
    add_method(calc, "add:flag:", "i24@0:8i16B20", calc_add_flag as *const c_void);
    add_method(calc, "negate:", "s18@0:8s16", calc_negate as *const c_void);
    add_method(calc, "value", "i16@0:8", calc_value as *const c_void);
    add_method(calc, "setValue:", "v20@0:8i16", calc_set_value as *const c_void);
    add_method(calc, "scale:", "d24@0:8d16", calc_scale as *const c_void);
    add_method(calc, "origin", "{CGPoint=dd}16@0:8", calc_origin as *const c_void);
    add_method(
        calc,
        "offset:by:",
        "{CGPoint=dd}40@0:8{CGPoint=dd}16d32",
        calc_offset_by as *const c_void,
    );
    add_method(
        calc,
        "frame",
        "{CGRect={CGPoint=dd}{CGSize=dd}}16@0:8",
        calc_frame as *const c_void,
    );
    add_method(
        calc,
        "area:",
        "d48@0:8{CGRect={CGPoint=dd}{CGSize=dd}}16",
        calc_area as *const c_void,
    );
    add_method(calc, "mystery", "{Mystery=ii}16@0:8", calc_mystery as *const c_void);
    add_method(calc, "echoMystery:", "i24@0:8{Mystery=ii}16", calc_echo_mystery as *const c_void);
    add_method(calc, "answer", "@16@0:8", calc_answer as *const c_void);
    add_method(calc, "greeting", "r*16@0:8", calc_greeting as *const c_void);
    add_method(calc, "garbage", "*16@0:8", calc_garbage as *const c_void);
    add_method(calc, "lengthOf:", "i24@0:8r*16", calc_length as *const c_void);
    add_method(calc, "identity:", "@24@0:8@16", calc_identity as *const c_void);
    add_method(calc, "count:", "Q24@0:8@16", calc_count as *const c_void);
    add_method(calc, "nameOf:", "*24@0:8:16", calc_selector_name as *const c_void);
    add_method(calc, "currentSelector", ":16@0:8", calc_self_selector as *const c_void);
    add_method(calc, "classOf", "#16@0:8", calc_class_of as *const c_void);
    add_method(calc, "isNilClass:", "B24@0:8#16", calc_is_nil_class as *const c_void);
    add_method(calc, "pointer", "^v16@0:8", calc_pointer as *const c_void);
    add_method(calc, "isSelf:", "B24@0:8^v16", calc_same_pointer as *const c_void);
    add_method(calc, "callCompute:", "i20@0:8i16", calc_call_compute as *const c_void);
    add_method(calc, "callLabel", "i16@0:8", calc_call_label as *const c_void);
    add_method(calc, "callMakePoint:", "d24@0:8d16", calc_call_make_point as *const c_void);
    add_method(calc, "callMakeRect:", "d24@0:8d16", calc_call_make_rect as *const c_void);
    add_method(calc, "badSignature", "v16i0:8", calc_value as *const c_void);
}

// ============================================================================
// Runtime
// ============================================================================

/// Mock runtime. Interning is process-wide; the call counter is per runtime.
#[derive(Default)]
pub struct MockRuntime {
    pub register_calls: AtomicU64,
}

impl MockRuntime {
    pub fn new() -> Self {
        Lazy::force(&BUILTINS);
        Self::default()
    }

    pub fn register_calls(&self) -> u64 {
        self.register_calls.load(Ordering::SeqCst)
    }
}

impl NativeRuntime for MockRuntime {
    fn register_selector(&self, name: &str) -> Sel {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        intern(name)
    }

    fn selector_name(&self, sel: Sel) -> String {
        if sel.is_null() {
            return "(null)".to_string();
        }
        unsafe { CStr::from_ptr(sel.as_ptr() as *const c_char) }
            .to_string_lossy()
            .into_owned()
    }

    fn get_class(&self, name: &str) -> Option<Class> {
        let class = class(name);
        (!class.is_null()).then_some(class)
    }

    fn is_class(&self, object: Id) -> bool {
        is_class(object)
    }

    fn class_of(&self, object: Id) -> Class {
        class_of_object(object)
    }

    fn class_name(&self, class: Class) -> String {
        unsafe { (*(class.as_ptr() as *const MockClass)).name.clone() }
    }

    fn method_type_encoding(&self, class: Class, sel: Sel) -> Option<String> {
        find_method(class, sel).map(|(types, _)| types)
    }

    fn method_implementation(&self, class: Class, sel: Sel) -> Option<Imp> {
        find_method(class, sel).map(|(_, imp)| imp)
    }

    fn add_method(&self, class: Class, sel: Sel, imp: Imp, types: &str) -> bool {
        let class = unsafe { &*(class.as_ptr() as *const MockClass) };
        class
            .methods
            .write()
            .insert(sel.as_ptr() as usize, (types.to_string(), imp));
        true
    }

    fn retain(&self, object: Id) {
        if !is_class(object) {
            self::object(object).retains.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn release(&self, object: Id) {
        if !is_class(object) {
            self::object(object).retains.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn number_value(&self, object: Id) -> Option<f64> {
        if is_class(object) {
            return None;
        }
        match self::object(object).payload {
            Payload::Number(n) => Some(n),
            _ => None,
        }
    }

    fn string_value(&self, object: Id) -> Option<String> {
        if is_class(object) {
            return None;
        }
        match &self::object(object).payload {
            Payload::Str(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn new_number(&self, value: f64) -> Id {
        new_object(class("NSNumber"), Payload::Number(value))
    }

    fn new_bool(&self, value: bool) -> Id {
        new_object(class("NSNumber"), Payload::Number(if value { 1.0 } else { 0.0 }))
    }

    fn new_string(&self, value: &str) -> Id {
        new_object(class("NSString"), Payload::Str(value.to_string()))
    }

    fn new_array(&self, items: &[Id]) -> Id {
        for &item in items {
            self.retain(item);
        }
        new_object(class("NSArray"), Payload::Array(items.to_vec()))
    }

    fn new_dictionary(&self, keys: &[Id], values: &[Id]) -> Id {
        for &item in keys.iter().chain(values) {
            self.retain(item);
        }
        new_object(class("NSDictionary"), Payload::Dict(keys.to_vec(), values.to_vec()))
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn runtime() -> Arc<MockRuntime> {
    Arc::new(MockRuntime::new())
}

pub fn bridge(runtime: &Arc<MockRuntime>) -> Arc<Bridge> {
    let runtime: Arc<dyn NativeRuntime> = runtime.clone();
    Bridge::new(runtime)
}

/// Fresh runtime and context with default options
pub fn context() -> (Arc<MockRuntime>, Context) {
    context_with(BridgeOptions::default())
}

pub fn context_with(options: BridgeOptions) -> (Arc<MockRuntime>, Context) {
    let runtime = runtime();
    let ctx = Context::with_options(bridge(&runtime), options).unwrap();
    (runtime, ctx)
}

/// New `Calculator` instance at +1
pub fn calculator() -> Id {
    Lazy::force(&BUILTINS);
    new_object(class("Calculator"), Payload::Plain)
}
