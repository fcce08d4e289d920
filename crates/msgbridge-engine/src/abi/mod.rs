//! ABI type registry and descriptors

pub mod registry;
pub mod types;

pub use registry::StructRegistry;
pub use types::{Position, StructDef, StructField, TypeDesc, TypeKind, TypeParser};
