//! Method signatures
//!
//! A `MethodSignature` is the reflected, immutable half of a call
//! descriptor: parsed entry descriptors plus the prepared libffi call
//! interface. It is built once per (class, selector) and shared by every
//! call that resolves to the same method.

use libffi::middle::{Cif, Type};
use msgbridge_sdk::{BridgeError, BridgeResult, Class, Imp, Sel};

use crate::abi::{Position, StructRegistry, TypeDesc, TypeParser};
use crate::encoding;
use crate::object::Ownership;

/// Reflected signature of one method
pub struct MethodSignature {
    /// Native encoding
    pub encoding: String,
    /// Delimited scan format of `encoding`
    pub scan: String,
    pub ret: TypeDesc,
    /// Receiver (`@` or `#`)
    pub receiver: TypeDesc,
    /// Declared parameters, after receiver and selector
    pub params: Vec<TypeDesc>,
    cif: Cif,
}

impl MethodSignature {
    /// Parse a method encoding and prepare its call interface
    pub fn parse(encoding: &str, registry: &StructRegistry, opaque_unknown_structs: bool) -> BridgeResult<Self> {
        let scan = encoding::convert(encoding)?;
        let count = encoding::arg_count(&scan);
        if count < encoding::FIRST_PARAM_INDEX {
            return Err(BridgeError::malformed(encoding, "missing receiver or selector"));
        }

        let receiver_code = encoding::strip_qualifiers(encoding::arg_code(&scan, 1)?);
        if !(receiver_code.starts_with('@') || receiver_code.starts_with('#')) {
            return Err(BridgeError::malformed(encoding, "receiver is not an object"));
        }
        let selector_code = encoding::strip_qualifiers(encoding::arg_code(&scan, 2)?);
        if selector_code != ":" {
            return Err(BridgeError::malformed(encoding, "second argument is not a selector"));
        }

        let parser = TypeParser::new(registry, opaque_unknown_structs);
        let ret = parser.parse(encoding::arg_code(&scan, encoding::RETURN_INDEX)?, Position::Return)?;
        let receiver = parser.parse(receiver_code, Position::Argument)?;
        let params = (encoding::FIRST_PARAM_INDEX..count)
            .map(|i| parser.parse(encoding::arg_code(&scan, i)?, Position::Argument))
            .collect::<BridgeResult<Vec<_>>>()?;

        let cif = build_cif(&receiver, &params, &ret);
        Ok(Self {
            encoding: encoding.to_string(),
            scan,
            ret,
            receiver,
            params,
            cif,
        })
    }

    pub fn cif(&self) -> &Cif {
        &self.cif
    }

    /// A fresh call interface with the same types (closures take theirs by value)
    pub fn build_cif(&self) -> Cif {
        build_cif(&self.receiver, &self.params, &self.ret)
    }

    /// Number of declared parameters
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

fn build_cif(receiver: &TypeDesc, params: &[TypeDesc], ret: &TypeDesc) -> Cif {
    let args: Vec<Type> = std::iter::once(receiver.ffi_type())
        .chain(std::iter::once(Type::pointer()))
        .chain(params.iter().map(TypeDesc::ffi_type))
        .collect();
    Cif::new(args, ret.ffi_type())
}

impl std::fmt::Debug for MethodSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodSignature")
            .field("encoding", &self.encoding)
            .field("arity", &self.params.len())
            .finish()
    }
}

/// A method resolved for a class: everything a call needs except arguments
#[derive(Debug)]
pub struct ResolvedMethod {
    pub class: Class,
    pub selector: Sel,
    pub name: String,
    pub signature: MethodSignature,
    pub imp: Imp,
    pub ownership: Ownership,
}
