//! msgbridge engine
//!
//! Dynamic dispatch and value marshaling between a dynamically typed
//! scripting layer and a reflective message-dispatch object runtime.
//!
//! # Architecture
//!
//! ```text
//! script value ──> Context::index ──> selector cache ──> dispatch::resolve
//!                                                          │
//!                       encoding ──> abi (TypeDesc, StructRegistry)
//!                                                          │
//!                  marshal (in) ──> ffi_call(IMP) ──> marshal (out)
//! ```
//!
//! - [`encoding`]: type-encoding string <-> delimited scan format
//! - [`abi`]: type descriptors and the process-wide struct registry
//! - [`selector`]: two-level selector cache in front of the runtime
//! - [`marshal`], [`object`], [`structs`], [`blob`]: value conversion
//! - [`dispatch`]: Resolve, Build, Marshal In, Invoke, Marshal Out, and
//!   script-implemented methods
//! - [`bootstrap`]: fixed-slot registry setup
//! - [`context`]: `Bridge` (shared) and `Context` (per script state)

pub mod abi;
pub mod blob;
pub mod bootstrap;
pub mod context;
pub mod dispatch;
pub mod encoding;
pub mod marshal;
pub mod object;
pub mod options;
pub mod selector;
pub mod structs;
pub mod value;

#[cfg(target_vendor = "apple")]
pub mod objc;

pub use abi::{StructDef, StructRegistry, TypeDesc, TypeKind};
pub use blob::Blob;
pub use bootstrap::{Registry, RegistryEntry, RegistrySlot, StatsSnapshot};
pub use context::{Bridge, Context};
pub use dispatch::{BoundMethod, MethodSignature, ResolvedMethod, ScriptImp};
pub use object::{ObjectHandle, Ownership};
pub use options::BridgeOptions;
pub use structs::StructValue;
pub use value::{Function, Table, Value};

pub use msgbridge_sdk::{BridgeError, BridgeResult, Class, Id, Imp, NativeRuntime, Sel};

#[cfg(target_vendor = "apple")]
pub use objc::ObjcRuntime;
