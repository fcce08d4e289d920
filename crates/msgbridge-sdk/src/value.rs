//! Native pointer newtypes
//!
//! The runtime hands out four kinds of raw pointers: objects (`id`),
//! selectors (`SEL`), classes (`Class`) and method implementations (`IMP`).
//! Each is wrapped in a `#[repr(transparent)]` newtype so they can be passed
//! straight into an ABI call slot and cannot be confused with one another on
//! the Rust side.
//!
//! None of these types own anything. Ownership of objects is tracked by the
//! engine's `ObjectHandle`, which pairs retain/release calls with handle
//! creation and drop.

use std::ffi::c_void;
use std::fmt;

/// Raw object pointer (`id`). May be nil.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Id(*mut c_void);

/// Interned method identifier (`SEL`). May be null.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Sel(*const c_void);

/// Class pointer (`Class`). Classes are objects too, see [`Class::as_id`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Class(*const c_void);

/// Method implementation entry point (`IMP`).
///
/// Every IMP takes the receiver and the selector as its first two
/// arguments, followed by the method's declared parameters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Imp(*const c_void);

// Pointers are only identities here; dereferencing is the runtime's job.
unsafe impl Send for Id {}
unsafe impl Sync for Id {}
unsafe impl Send for Sel {}
unsafe impl Sync for Sel {}
unsafe impl Send for Class {}
unsafe impl Sync for Class {}
unsafe impl Send for Imp {}
unsafe impl Sync for Imp {}

impl Id {
    /// The nil object
    #[inline]
    pub const fn nil() -> Self {
        Id(std::ptr::null_mut())
    }

    /// Wrap a raw object pointer
    #[inline]
    pub const fn from_ptr(ptr: *mut c_void) -> Self {
        Id(ptr)
    }

    /// Raw pointer value
    #[inline]
    pub const fn as_ptr(self) -> *mut c_void {
        self.0
    }

    /// Check for nil
    #[inline]
    pub fn is_nil(self) -> bool {
        self.0.is_null()
    }

    /// Reinterpret as a class pointer (valid when the object is a class)
    #[inline]
    pub const fn as_class(self) -> Class {
        Class(self.0 as *const c_void)
    }
}

impl Sel {
    /// The null selector
    #[inline]
    pub const fn null() -> Self {
        Sel(std::ptr::null())
    }

    /// Wrap a raw selector pointer
    #[inline]
    pub const fn from_ptr(ptr: *const c_void) -> Self {
        Sel(ptr)
    }

    /// Raw pointer value
    #[inline]
    pub const fn as_ptr(self) -> *const c_void {
        self.0
    }

    /// Check for the null selector
    #[inline]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

impl Class {
    /// Wrap a raw class pointer
    #[inline]
    pub const fn from_ptr(ptr: *const c_void) -> Self {
        Class(ptr)
    }

    /// Raw pointer value
    #[inline]
    pub const fn as_ptr(self) -> *const c_void {
        self.0
    }

    /// Check for a null class
    #[inline]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// The class viewed as an object, for sending class methods
    #[inline]
    pub const fn as_id(self) -> Id {
        Id(self.0 as *mut c_void)
    }
}

impl Imp {
    /// Wrap a raw code pointer
    #[inline]
    pub const fn from_ptr(ptr: *const c_void) -> Self {
        Imp(ptr)
    }

    /// Raw code pointer
    #[inline]
    pub const fn as_ptr(self) -> *const c_void {
        self.0
    }

    /// Check for a null implementation
    #[inline]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::nil()
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "Id(nil)")
        } else {
            write!(f, "Id({:p})", self.0)
        }
    }
}

impl fmt::Debug for Sel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sel({:p})", self.0)
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Class({:p})", self.0)
    }
}

impl fmt::Debug for Imp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Imp({:p})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nil_and_null() {
        assert!(Id::nil().is_nil());
        assert!(Sel::null().is_null());
        assert_eq!(Id::default(), Id::nil());
    }

    #[test]
    fn test_class_object_round_trip() {
        let mut storage = 0u64;
        let class = Class::from_ptr(&mut storage as *mut u64 as *const c_void);
        assert_eq!(class.as_id().as_class(), class);
        assert!(!class.as_id().is_nil());
    }

    #[test]
    fn test_debug_format() {
        assert_eq!(format!("{:?}", Id::nil()), "Id(nil)");
    }
}
