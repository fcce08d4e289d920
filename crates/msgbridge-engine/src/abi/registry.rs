//! Struct registry
//!
//! Process-wide map from aggregate name to layout. The dispatch engine
//! consults it whenever a signature mentions a struct by value; script code
//! registers its own structs through `objc.struct`.
//!
//! Registration is append-only. Re-registering a name with an identical
//! layout returns the existing definition; a different layout under the same
//! name is rejected.

use std::sync::Arc;

use msgbridge_sdk::{BridgeError, BridgeResult};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::types::{compute_layout, Position, StructDef, StructField, TypeParser};
use crate::encoding;

/// Global struct registry
static GLOBAL_REGISTRY: Lazy<StructRegistry> = Lazy::new(StructRegistry::with_builtins);

#[cfg(target_pointer_width = "64")]
const CGFLOAT: &str = "d";
#[cfg(not(target_pointer_width = "64"))]
const CGFLOAT: &str = "f";

#[cfg(target_pointer_width = "64")]
const NSUINTEGER: &str = "Q";
#[cfg(not(target_pointer_width = "64"))]
const NSUINTEGER: &str = "I";

/// Registry of struct layouts
pub struct StructRegistry {
    structs: RwLock<FxHashMap<String, Arc<StructDef>>>,
}

impl StructRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            structs: RwLock::new(FxHashMap::default()),
        }
    }

    /// Create a registry preloaded with the platform geometry and range types
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        let builtins: [(&str, [(&str, &str); 2]); 5] = [
            ("CGPoint", [("x", CGFLOAT), ("y", CGFLOAT)]),
            ("CGSize", [("width", CGFLOAT), ("height", CGFLOAT)]),
            ("CGVector", [("dx", CGFLOAT), ("dy", CGFLOAT)]),
            ("_NSRange", [("location", NSUINTEGER), ("length", NSUINTEGER)]),
            ("CGRect", [("origin", "{CGPoint}"), ("size", "{CGSize}")]),
        ];
        for (name, fields) in builtins {
            if let Err(e) = registry.register_fields(name, &fields) {
                log::error!("failed to register builtin struct {}: {}", name, e);
            }
        }
        registry
    }

    /// The process-wide registry
    pub fn global() -> &'static StructRegistry {
        &GLOBAL_REGISTRY
    }

    /// Register a struct from its encoding (`{name=...}`, field names optional)
    pub fn register(&self, name: &str, encoding: &str) -> BridgeResult<Arc<StructDef>> {
        if name.is_empty() {
            return Err(BridgeError::malformed(encoding, "empty struct name"));
        }
        let tag = encoding::struct_name(encoding)?;
        if tag != name {
            return Err(BridgeError::malformed(
                encoding,
                format!("struct tag {} does not match name {}", tag, name),
            ));
        }
        let members = encoding::aggregate_members(encoding)?;
        if members.is_empty() {
            return Err(BridgeError::malformed(encoding, "struct has no fields"));
        }

        // Nested lookups take the read lock, so build before locking for write
        let parser = TypeParser::new(self, false);
        let parsed = parser.parse_members(&members)?;
        let types: Vec<_> = parsed.iter().map(|(_, ty)| ty.clone()).collect();
        let (size, align, offsets) = compute_layout(&types)?;
        let def = StructDef {
            name: name.to_string(),
            encoding: encoding.to_string(),
            size,
            align,
            fields: parsed
                .into_iter()
                .zip(offsets)
                .map(|((name, ty), offset)| StructField { name, offset, ty })
                .collect(),
        };

        let mut structs = self.structs.write();
        if let Some(existing) = structs.get(name) {
            if existing.same_layout(&def) {
                return Ok(existing.clone());
            }
            return Err(BridgeError::LayoutConflict(name.to_string()));
        }
        log::debug!("registered struct {} ({} bytes, align {})", name, size, align);
        let def = Arc::new(def);
        structs.insert(name.to_string(), def.clone());
        Ok(def)
    }

    /// Register a struct from `(field name, type code)` pairs
    pub fn register_fields(&self, name: &str, fields: &[(&str, &str)]) -> BridgeResult<Arc<StructDef>> {
        let mut encoding = format!("{{{}=", name);
        for (field, code) in fields {
            encoding.push('"');
            encoding.push_str(field);
            encoding.push('"');
            encoding.push_str(code);
        }
        encoding.push('}');
        self.register(name, &encoding)
    }

    /// Definition of a registered struct
    pub fn lookup(&self, name: &str) -> Option<Arc<StructDef>> {
        self.structs.read().get(name).cloned()
    }

    /// Size of a registered struct, 0 when absent
    pub fn lookup_size(&self, name: &str) -> usize {
        self.structs.read().get(name).map_or(0, |def| def.size)
    }

    /// Number of registered structs
    pub fn len(&self) -> usize {
        self.structs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.structs.read().is_empty()
    }

    /// Descriptor for a struct type code, resolved through this registry
    pub fn describe(&self, code: &str) -> BridgeResult<super::TypeDesc> {
        TypeParser::new(self, false).parse(code, Position::Field)
    }
}

impl Default for StructRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::TypeKind;

    #[test]
    fn test_builtins_registered() {
        let registry = StructRegistry::with_builtins();
        let word = std::mem::size_of::<usize>();
        assert_eq!(registry.lookup_size("CGPoint"), 2 * word);
        assert_eq!(registry.lookup_size("CGSize"), 2 * word);
        assert_eq!(registry.lookup_size("CGRect"), 4 * word);
        assert_eq!(registry.lookup_size("_NSRange"), 2 * word);
        assert_eq!(registry.lookup_size("CGVector"), 2 * word);
        assert_eq!(registry.lookup_size("NotAStruct"), 0);
    }

    #[test]
    fn test_cgrect_fields_nest() {
        let registry = StructRegistry::with_builtins();
        let rect = registry.lookup("CGRect").unwrap();
        let size = rect.field("size").unwrap();
        assert_eq!(size.offset, 2 * std::mem::size_of::<usize>());
        match &size.ty.kind {
            TypeKind::Struct(def) => assert_eq!(def.name, "CGSize"),
            other => panic!("expected nested struct, got {:?}", other),
        }
        assert_eq!(rect.field("2").unwrap().offset, size.offset);
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = StructRegistry::new();
        let a = registry.register("Pair", "{Pair=iq}").unwrap();
        let b = registry.register("Pair", "{Pair=\"a\"i\"b\"q}").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.lookup_size("Pair"), 16);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_conflicting_layout() {
        let registry = StructRegistry::new();
        registry.register("Pair", "{Pair=ii}").unwrap();
        let err = registry.register("Pair", "{Pair=id}").unwrap_err();
        assert_eq!(err, BridgeError::LayoutConflict("Pair".to_string()));
        assert_eq!(registry.lookup_size("Pair"), 8);
    }

    #[test]
    fn test_nested_requires_registration() {
        let registry = StructRegistry::new();
        let err = registry
            .register("Outer", "{Outer={Inner=ii}c}")
            .unwrap_err();
        assert_eq!(err, BridgeError::UnknownStruct("Inner".to_string()));

        registry.register("Inner", "{Inner=ii}").unwrap();
        let outer = registry.register("Outer", "{Outer={Inner=ii}c}").unwrap();
        assert_eq!(outer.size, 12);
        assert_eq!(outer.fields[1].offset, 8);
    }

    #[test]
    fn test_register_rejects_empty_struct() {
        let registry = StructRegistry::new();
        assert!(registry.register("Empty", "{Empty}").is_err());
        assert!(registry.register("", "{X=i}").is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_rejects_mismatched_tag() {
        let registry = StructRegistry::new();
        let err = registry.register("Foo", "{Bar=ii}").unwrap_err();
        assert!(matches!(err, BridgeError::MalformedSignature { .. }));
        assert!(registry.lookup("Foo").is_none());
        assert!(registry.lookup("Bar").is_none());
        assert!(registry.is_empty());
    }
}
