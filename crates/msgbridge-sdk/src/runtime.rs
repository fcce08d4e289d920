//! NativeRuntime trait: abstract message-dispatch runtime
//!
//! Defines the interface a reflective native object runtime implements so
//! the engine can dispatch into it. The engine only sees this trait; the
//! Objective-C backend and the test mock runtime both program against it.
//!
//! # Ownership conventions
//!
//! - `new_*` constructors return objects at +1: the caller owns one
//!   reference and must balance it with [`NativeRuntime::release`].
//! - Objects handed to the runtime as arguments are borrowed for the
//!   duration of the call.

use crate::value::{Class, Id, Imp, Sel};

/// Abstract native runtime used by the dispatch engine.
///
/// Implementations must be usable from several scripting contexts at once,
/// hence `Send + Sync`. Locking (for selector interning and method lookup)
/// is the implementation's own concern.
pub trait NativeRuntime: Send + Sync {
    // ========================================================================
    // Method identifiers
    // ========================================================================

    /// Intern a selector name. Identical names must yield identical selectors.
    ///
    /// This is the lock-protected path the engine's selector cache shields.
    fn register_selector(&self, name: &str) -> Sel;

    /// Name of an interned selector
    fn selector_name(&self, sel: Sel) -> String;

    // ========================================================================
    // Classes and reflection
    // ========================================================================

    /// Look up a class by name
    fn get_class(&self, name: &str) -> Option<Class>;

    /// Whether `object` is a class (or metaclass) rather than an instance
    fn is_class(&self, object: Id) -> bool;

    /// Class of an object. For a class object this is its metaclass, so
    /// class methods resolve through the same path as instance methods.
    fn class_of(&self, object: Id) -> Class;

    /// Name of a class
    fn class_name(&self, class: Class) -> String;

    /// Type encoding of the method `sel` on instances of `class`, if any
    fn method_type_encoding(&self, class: Class, sel: Sel) -> Option<String>;

    /// Implementation of the method `sel` on instances of `class`, if any
    fn method_implementation(&self, class: Class, sel: Sel) -> Option<Imp>;

    /// Install (or replace) a method implementation on `class`.
    ///
    /// Returns false if the runtime refused the method.
    fn add_method(&self, class: Class, sel: Sel, imp: Imp, types: &str) -> bool;

    // ========================================================================
    // Reference counting
    // ========================================================================

    /// Increment the retain count of a non-nil object
    fn retain(&self, object: Id);

    /// Decrement the retain count of a non-nil object
    fn release(&self, object: Id);

    // ========================================================================
    // Wrapper objects
    // ========================================================================

    /// Numeric value if `object` is a number wrapper
    fn number_value(&self, object: Id) -> Option<f64>;

    /// String contents if `object` is a string object
    fn string_value(&self, object: Id) -> Option<String>;

    /// Box a number (+1)
    fn new_number(&self, value: f64) -> Id;

    /// Box a boolean (+1)
    fn new_bool(&self, value: bool) -> Id;

    /// Create a string object (+1)
    fn new_string(&self, value: &str) -> Id;

    /// Create an ordered collection (+1). Elements are retained by the array.
    fn new_array(&self, items: &[Id]) -> Id;

    /// Create a key-value collection (+1). `keys` and `values` have equal length.
    fn new_dictionary(&self, keys: &[Id], values: &[Id]) -> Id;

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Human readable description of an object
    fn describe(&self, object: Id) -> String {
        let class = self.class_of(object);
        format!("<{}: {:p}>", self.class_name(class), object.as_ptr())
    }
}
