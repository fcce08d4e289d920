//! ABI type descriptors
//!
//! A `TypeDesc` is what the dispatch engine knows about one entry of a
//! method signature: its kind, size and alignment, plus the original type
//! code for diagnostics. libffi `Type`s are built from descriptors on
//! demand, so descriptors themselves stay `Send + Sync` and can live in the
//! process-wide struct registry.

use std::ffi::c_void;
use std::mem;
use std::sync::Arc;

use libffi::middle::Type;
use libffi::raw;
use msgbridge_sdk::{BridgeError, BridgeResult};

use super::registry::StructRegistry;
use crate::encoding;

/// What kind of value an ABI slot carries
#[derive(Debug, Clone)]
pub enum TypeKind {
    Void,
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    /// `l`: 32 bits in the encoding grammar regardless of target
    Long,
    ULong,
    LongLong,
    ULongLong,
    Float,
    Double,
    Bool,
    CString,
    Object,
    Class,
    Selector,
    Pointer,
    /// Registered aggregate
    Struct(Arc<StructDef>),
    /// Inline bytes with a known layout but no script-visible structure
    /// (unions, inline arrays, bitfield runs, unregistered structs)
    Opaque(Arc<[TypeDesc]>),
}

/// Descriptor of one ABI slot
#[derive(Debug, Clone)]
pub struct TypeDesc {
    pub kind: TypeKind,
    pub size: usize,
    pub align: usize,
    /// Type code this descriptor was parsed from
    pub code: String,
}

impl TypeDesc {
    fn scalar(kind: TypeKind, size: usize, code: &str) -> Self {
        TypeDesc {
            kind,
            size,
            align: size.max(1),
            code: code.to_string(),
        }
    }

    /// Build the libffi type for this descriptor
    pub fn ffi_type(&self) -> Type {
        match &self.kind {
            TypeKind::Void => Type::void(),
            TypeKind::Char => Type::i8(),
            TypeKind::UChar | TypeKind::Bool => Type::u8(),
            TypeKind::Short => Type::i16(),
            TypeKind::UShort => Type::u16(),
            TypeKind::Int | TypeKind::Long => Type::i32(),
            TypeKind::UInt | TypeKind::ULong => Type::u32(),
            TypeKind::LongLong => Type::i64(),
            TypeKind::ULongLong => Type::u64(),
            TypeKind::Float => Type::f32(),
            TypeKind::Double => Type::f64(),
            TypeKind::CString
            | TypeKind::Object
            | TypeKind::Class
            | TypeKind::Selector
            | TypeKind::Pointer => Type::pointer(),
            TypeKind::Struct(def) => Type::structure(def.fields.iter().map(|f| f.ty.ffi_type())),
            TypeKind::Opaque(members) => Type::structure(members.iter().map(TypeDesc::ffi_type)),
        }
    }

    /// Whether values of this type are returned widened to a full word
    pub fn is_small_integer(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Char
                | TypeKind::UChar
                | TypeKind::Bool
                | TypeKind::Short
                | TypeKind::UShort
                | TypeKind::Int
                | TypeKind::UInt
                | TypeKind::Long
                | TypeKind::ULong
        )
    }

    pub fn is_void(&self) -> bool {
        matches!(self.kind, TypeKind::Void)
    }

    /// Same size, alignment and slot class
    pub fn layout_eq(&self, other: &TypeDesc) -> bool {
        if self.size != other.size || self.align != other.align {
            return false;
        }
        match (&self.kind, &other.kind) {
            (TypeKind::Struct(a), TypeKind::Struct(b)) => a.same_layout(b),
            (TypeKind::Opaque(a), TypeKind::Opaque(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.layout_eq(y))
            }
            (a, b) => mem::discriminant(a) == mem::discriminant(b),
        }
    }
}

// ============================================================================
// Struct definitions
// ============================================================================

/// One field of a registered struct
#[derive(Debug, Clone)]
pub struct StructField {
    /// Field name when the encoding carries one
    pub name: Option<String>,
    pub offset: usize,
    pub ty: TypeDesc,
}

/// Layout of a registered aggregate
#[derive(Debug)]
pub struct StructDef {
    pub name: String,
    /// Encoding the struct was registered with
    pub encoding: String,
    pub size: usize,
    pub align: usize,
    pub fields: Vec<StructField>,
}

impl StructDef {
    /// Field by name, or by 1-based position
    pub fn field(&self, key: &str) -> Option<&StructField> {
        self.fields
            .iter()
            .find(|f| f.name.as_deref() == Some(key))
            .or_else(|| {
                key.parse::<usize>()
                    .ok()
                    .filter(|&i| i >= 1)
                    .and_then(|i| self.fields.get(i - 1))
            })
    }

    /// Same size, alignment and field layout (names are ignored)
    pub fn same_layout(&self, other: &StructDef) -> bool {
        self.size == other.size
            && self.align == other.align
            && self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(other.fields.iter())
                .all(|(a, b)| a.offset == b.offset && a.ty.layout_eq(&b.ty))
    }
}

/// Compute size, alignment and member offsets of a C struct made of `members`
pub(crate) fn compute_layout(members: &[TypeDesc]) -> BridgeResult<(usize, usize, Vec<usize>)> {
    let ffi_type = Type::structure(members.iter().map(TypeDesc::ffi_type));
    let raw_type = ffi_type.as_raw_ptr();
    let mut offsets = vec![0usize; members.len()];
    let status = unsafe {
        raw::ffi_get_struct_offsets(
            raw::ffi_abi_FFI_DEFAULT_ABI,
            raw_type,
            offsets.as_mut_ptr(),
        )
    };
    if status != raw::ffi_status_FFI_OK {
        return Err(BridgeError::UnsupportedType {
            code: members.iter().map(|m| m.code.as_str()).collect(),
            reason: "libffi rejected the aggregate layout".to_string(),
        });
    }
    let size = unsafe { (*raw_type).size };
    let align = unsafe { (*raw_type).alignment } as usize;
    Ok((size, align, offsets))
}

// ============================================================================
// Parsing type codes
// ============================================================================

/// Where a type code appears; decides how arrays and `void` are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Return,
    Argument,
    Field,
}

/// Turns single type codes into descriptors, resolving structs through the
/// registry
pub struct TypeParser<'a> {
    registry: &'a StructRegistry,
    opaque_unknown_structs: bool,
}

impl<'a> TypeParser<'a> {
    pub fn new(registry: &'a StructRegistry, opaque_unknown_structs: bool) -> Self {
        Self {
            registry,
            opaque_unknown_structs,
        }
    }

    /// Parse one complete type code (qualifiers allowed, offsets not)
    pub fn parse(&self, code: &str, position: Position) -> BridgeResult<TypeDesc> {
        let body = encoding::strip_qualifiers(code);
        let Some(&first) = body.as_bytes().first() else {
            return Err(BridgeError::malformed(code, "empty type code"));
        };
        let ptr = mem::size_of::<*const c_void>();
        let desc = match first {
            b'v' => {
                if position != Position::Return {
                    return Err(unsupported(code, "void is only valid as a return type"));
                }
                TypeDesc {
                    kind: TypeKind::Void,
                    size: 0,
                    align: 1,
                    code: body.to_string(),
                }
            }
            b'c' => TypeDesc::scalar(TypeKind::Char, 1, body),
            b'C' => TypeDesc::scalar(TypeKind::UChar, 1, body),
            b'B' => TypeDesc::scalar(TypeKind::Bool, 1, body),
            b's' => TypeDesc::scalar(TypeKind::Short, 2, body),
            b'S' => TypeDesc::scalar(TypeKind::UShort, 2, body),
            b'i' => TypeDesc::scalar(TypeKind::Int, 4, body),
            b'I' => TypeDesc::scalar(TypeKind::UInt, 4, body),
            b'l' => TypeDesc::scalar(TypeKind::Long, 4, body),
            b'L' => TypeDesc::scalar(TypeKind::ULong, 4, body),
            b'q' => TypeDesc::scalar(TypeKind::LongLong, 8, body),
            b'Q' => TypeDesc::scalar(TypeKind::ULongLong, 8, body),
            b'f' => TypeDesc::scalar(TypeKind::Float, 4, body),
            b'd' => TypeDesc::scalar(TypeKind::Double, 8, body),
            b'*' => TypeDesc::scalar(TypeKind::CString, ptr, body),
            b'@' => TypeDesc::scalar(TypeKind::Object, ptr, body),
            b'#' => TypeDesc::scalar(TypeKind::Class, ptr, body),
            b':' => TypeDesc::scalar(TypeKind::Selector, ptr, body),
            b'^' => TypeDesc::scalar(TypeKind::Pointer, ptr, body),
            b'[' => match position {
                Position::Argument => TypeDesc::scalar(TypeKind::Pointer, ptr, body),
                Position::Field => self.parse_inline_array(body)?,
                Position::Return => return Err(unsupported(code, "arrays cannot be returned")),
            },
            b'{' => self.parse_struct(body)?,
            b'(' => self.parse_union(body)?,
            b'D' => return Err(unsupported(code, "long double")),
            b'b' => return Err(unsupported(code, "bitfield outside of a struct")),
            b'?' => return Err(unsupported(code, "unknown type")),
            _ => return Err(BridgeError::malformed(code, "unknown type code")),
        };
        Ok(desc)
    }

    /// Parse the member list of an aggregate into field descriptors, folding
    /// bitfield runs into 32-bit units
    pub fn parse_members(
        &self,
        members: &[(Option<&str>, &str)],
    ) -> BridgeResult<Vec<(Option<String>, TypeDesc)>> {
        let mut out = Vec::with_capacity(members.len());
        let mut bits = 0usize;
        let mut run_code = String::new();
        for (name, code) in members {
            if let Some(width) = code.strip_prefix('b') {
                bits += width
                    .parse::<usize>()
                    .map_err(|_| BridgeError::malformed(*code, "bad bitfield width"))?;
                run_code.push_str(code);
                continue;
            }
            if bits > 0 {
                out.push((None, bitfield_run(&run_code, bits)));
                bits = 0;
                run_code.clear();
            }
            out.push((name.map(str::to_string), self.parse(code, Position::Field)?));
        }
        if bits > 0 {
            out.push((None, bitfield_run(&run_code, bits)));
        }
        Ok(out)
    }

    fn parse_struct(&self, code: &str) -> BridgeResult<TypeDesc> {
        let name = encoding::struct_name(code)?;
        if let Some(def) = self.registry.lookup(name) {
            return Ok(TypeDesc {
                size: def.size,
                align: def.align,
                kind: TypeKind::Struct(def),
                code: code.to_string(),
            });
        }
        if !self.opaque_unknown_structs {
            return Err(BridgeError::UnknownStruct(name.to_string()));
        }
        let members = encoding::aggregate_members(code)?;
        if members.is_empty() {
            return Err(BridgeError::UnknownStruct(name.to_string()));
        }
        let fields: Vec<TypeDesc> = self
            .parse_members(&members)?
            .into_iter()
            .map(|(_, ty)| ty)
            .collect();
        log::debug!("carrying unregistered struct {} as opaque bytes", name);
        opaque(code, fields)
    }

    fn parse_union(&self, code: &str) -> BridgeResult<TypeDesc> {
        let members = encoding::aggregate_members(code)?;
        if members.is_empty() {
            return Err(unsupported(code, "union without members"));
        }
        let parsed = self.parse_members(&members)?;
        let mut size = 0;
        let mut widest: Option<&TypeDesc> = None;
        for (_, ty) in &parsed {
            size = size.max(ty.size);
            if widest.map_or(true, |w| ty.align > w.align) {
                widest = Some(ty);
            }
        }
        let Some(widest) = widest else {
            return Err(unsupported(code, "union without members"));
        };
        let align = widest.align;
        let size = size.div_ceil(align) * align;
        let mut layout = vec![widest.clone()];
        let uchar = TypeDesc::scalar(TypeKind::UChar, 1, "C");
        layout.extend(std::iter::repeat(uchar).take(size - widest.size));
        opaque(code, layout)
    }

    fn parse_inline_array(&self, code: &str) -> BridgeResult<TypeDesc> {
        let (count, elem) = encoding::array_parts(code)?;
        if count == 0 {
            return Err(unsupported(code, "zero-length inline array"));
        }
        let elem = self.parse(elem, Position::Field)?;
        opaque(code, vec![elem; count])
    }
}

fn bitfield_run(code: &str, bits: usize) -> TypeDesc {
    let unit = TypeDesc::scalar(TypeKind::UInt, 4, "I");
    let units = bits.div_ceil(32);
    let members: Arc<[TypeDesc]> = vec![unit; units].into();
    TypeDesc {
        kind: TypeKind::Opaque(members),
        size: units * 4,
        align: 4,
        code: code.to_string(),
    }
}

fn opaque(code: &str, members: Vec<TypeDesc>) -> BridgeResult<TypeDesc> {
    let (size, align, _) = compute_layout(&members)?;
    Ok(TypeDesc {
        kind: TypeKind::Opaque(members.into()),
        size,
        align,
        code: code.to_string(),
    })
}

fn unsupported(code: &str, reason: &str) -> BridgeError {
    BridgeError::UnsupportedType {
        code: code.to_string(),
        reason: reason.to_string(),
    }
}
