//! Objective-C runtime backend
//!
//! Implements `NativeRuntime` on top of `libobjc` and Foundation. Messages
//! the backend itself needs (boxing, unboxing, collections) go through
//! `objc_msgSend` cast to the exact function type of each method.

use std::ffi::{c_char, c_void, CStr, CString};
use std::mem;

use msgbridge_sdk::{Class, Id, Imp, NativeRuntime, Sel};

type ObjcId = *mut c_void;
type ObjcSel = *const c_void;
type ObjcClass = *const c_void;
type ObjcMethod = *const c_void;

#[link(name = "objc")]
extern "C" {
    fn sel_registerName(name: *const c_char) -> ObjcSel;
    fn sel_getName(sel: ObjcSel) -> *const c_char;
    fn objc_getClass(name: *const c_char) -> ObjcClass;
    fn object_getClass(object: ObjcId) -> ObjcClass;
    fn object_isClass(object: ObjcId) -> i8;
    fn class_getName(class: ObjcClass) -> *const c_char;
    fn class_getInstanceMethod(class: ObjcClass, sel: ObjcSel) -> ObjcMethod;
    fn class_addMethod(class: ObjcClass, sel: ObjcSel, imp: *const c_void, types: *const c_char) -> i8;
    fn class_replaceMethod(
        class: ObjcClass,
        sel: ObjcSel,
        imp: *const c_void,
        types: *const c_char,
    ) -> *const c_void;
    fn method_getTypeEncoding(method: ObjcMethod) -> *const c_char;
    fn method_getImplementation(method: ObjcMethod) -> *const c_void;
    fn objc_retain(object: ObjcId) -> ObjcId;
    fn objc_release(object: ObjcId);
    fn objc_msgSend();
}

#[link(name = "Foundation", kind = "framework")]
extern "C" {}

/// `objc_msgSend` cast to a concrete method type
macro_rules! msg_send {
    ($receiver:expr, $sel:expr $(, $arg:expr => $ty:ty)* ; -> $ret:ty) => {{
        let f: unsafe extern "C" fn(ObjcId, ObjcSel $(, $ty)*) -> $ret =
            mem::transmute(objc_msgSend as unsafe extern "C" fn());
        f($receiver, $sel $(, $arg)*)
    }};
}

/// The process's Objective-C runtime
pub struct ObjcRuntime {
    number_class: ObjcClass,
    string_class: ObjcClass,
    array_class: ObjcClass,
    dictionary_class: ObjcClass,
}

// Class pointers are immortal and the runtime API is thread safe
unsafe impl Send for ObjcRuntime {}
unsafe impl Sync for ObjcRuntime {}

impl ObjcRuntime {
    pub fn new() -> Self {
        Self {
            number_class: class_named("NSNumber"),
            string_class: class_named("NSString"),
            array_class: class_named("NSArray"),
            dictionary_class: class_named("NSDictionary"),
        }
    }

    fn sel(&self, name: &str) -> ObjcSel {
        match CString::new(name) {
            Ok(name) => unsafe { sel_registerName(name.as_ptr()) },
            Err(_) => std::ptr::null(),
        }
    }

    fn is_kind_of(&self, object: Id, class: ObjcClass) -> bool {
        if class.is_null() {
            return false;
        }
        let sel = self.sel("isKindOfClass:");
        unsafe { msg_send!(object.as_ptr(), sel, class => ObjcClass; -> i8) != 0 }
    }

    fn alloc(&self, class: ObjcClass) -> ObjcId {
        let sel = self.sel("alloc");
        unsafe { msg_send!(class as ObjcId, sel; -> ObjcId) }
    }
}

impl Default for ObjcRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn class_named(name: &str) -> ObjcClass {
    match CString::new(name) {
        Ok(name) => unsafe { objc_getClass(name.as_ptr()) },
        Err(_) => std::ptr::null(),
    }
}

unsafe fn owned_str(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

impl NativeRuntime for ObjcRuntime {
    fn register_selector(&self, name: &str) -> Sel {
        Sel::from_ptr(self.sel(name))
    }

    fn selector_name(&self, sel: Sel) -> String {
        if sel.is_null() {
            return "(null)".to_string();
        }
        unsafe { owned_str(sel_getName(sel.as_ptr())) }
    }

    fn get_class(&self, name: &str) -> Option<Class> {
        let class = Class::from_ptr(class_named(name));
        (!class.is_null()).then_some(class)
    }

    fn is_class(&self, object: Id) -> bool {
        !object.is_nil() && unsafe { object_isClass(object.as_ptr()) } != 0
    }

    fn class_of(&self, object: Id) -> Class {
        Class::from_ptr(unsafe { object_getClass(object.as_ptr()) })
    }

    fn class_name(&self, class: Class) -> String {
        unsafe { owned_str(class_getName(class.as_ptr())) }
    }

    fn method_type_encoding(&self, class: Class, sel: Sel) -> Option<String> {
        unsafe {
            let method = class_getInstanceMethod(class.as_ptr(), sel.as_ptr());
            if method.is_null() {
                return None;
            }
            let types = method_getTypeEncoding(method);
            (!types.is_null()).then(|| owned_str(types))
        }
    }

    fn method_implementation(&self, class: Class, sel: Sel) -> Option<Imp> {
        unsafe {
            let method = class_getInstanceMethod(class.as_ptr(), sel.as_ptr());
            if method.is_null() {
                return None;
            }
            Some(Imp::from_ptr(method_getImplementation(method)))
        }
    }

    fn add_method(&self, class: Class, sel: Sel, imp: Imp, types: &str) -> bool {
        let Ok(types) = CString::new(types) else {
            return false;
        };
        unsafe {
            if class_addMethod(class.as_ptr(), sel.as_ptr(), imp.as_ptr(), types.as_ptr()) != 0 {
                return true;
            }
            class_replaceMethod(class.as_ptr(), sel.as_ptr(), imp.as_ptr(), types.as_ptr());
        }
        true
    }

    fn retain(&self, object: Id) {
        unsafe {
            objc_retain(object.as_ptr());
        }
    }

    fn release(&self, object: Id) {
        unsafe { objc_release(object.as_ptr()) }
    }

    fn number_value(&self, object: Id) -> Option<f64> {
        if !self.is_kind_of(object, self.number_class) {
            return None;
        }
        let sel = self.sel("doubleValue");
        Some(unsafe { msg_send!(object.as_ptr(), sel; -> f64) })
    }

    fn string_value(&self, object: Id) -> Option<String> {
        if !self.is_kind_of(object, self.string_class) {
            return None;
        }
        let sel = self.sel("UTF8String");
        Some(unsafe { owned_str(msg_send!(object.as_ptr(), sel; -> *const c_char)) })
    }

    fn new_number(&self, value: f64) -> Id {
        let sel = self.sel("initWithDouble:");
        let obj = self.alloc(self.number_class);
        Id::from_ptr(unsafe { msg_send!(obj, sel, value => f64; -> ObjcId) })
    }

    fn new_bool(&self, value: bool) -> Id {
        let sel = self.sel("initWithBool:");
        let obj = self.alloc(self.number_class);
        Id::from_ptr(unsafe { msg_send!(obj, sel, value as i8 => i8; -> ObjcId) })
    }

    fn new_string(&self, value: &str) -> Id {
        let sel = self.sel("initWithBytes:length:encoding:");
        let obj = self.alloc(self.string_class);
        const NS_UTF8_STRING_ENCODING: usize = 4;
        Id::from_ptr(unsafe {
            msg_send!(
                obj,
                sel,
                value.as_ptr() as *const c_void => *const c_void,
                value.len() => usize,
                NS_UTF8_STRING_ENCODING => usize;
                -> ObjcId
            )
        })
    }

    fn new_array(&self, items: &[Id]) -> Id {
        let sel = self.sel("initWithObjects:count:");
        let obj = self.alloc(self.array_class);
        Id::from_ptr(unsafe {
            msg_send!(obj, sel, items.as_ptr() as *const ObjcId => *const ObjcId, items.len() => usize; -> ObjcId)
        })
    }

    fn new_dictionary(&self, keys: &[Id], values: &[Id]) -> Id {
        let sel = self.sel("initWithObjects:forKeys:count:");
        let obj = self.alloc(self.dictionary_class);
        let count = keys.len().min(values.len());
        Id::from_ptr(unsafe {
            msg_send!(
                obj,
                sel,
                values.as_ptr() as *const ObjcId => *const ObjcId,
                keys.as_ptr() as *const ObjcId => *const ObjcId,
                count => usize;
                -> ObjcId
            )
        })
    }

    fn describe(&self, object: Id) -> String {
        let sel = self.sel("description");
        let description = unsafe { msg_send!(object.as_ptr(), sel; -> ObjcId) };
        self.string_value(Id::from_ptr(description))
            .unwrap_or_else(|| format!("<{:p}>", object.as_ptr()))
    }
}
