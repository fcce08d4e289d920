//! msgbridge SDK - the seam between the bridge engine and a native runtime
//!
//! This crate provides the minimal types and traits needed to plug a
//! reflective, message-dispatch object runtime into the bridge without
//! depending on the engine itself.
//!
//! # Example
//!
//! ```ignore
//! use msgbridge_sdk::{Class, Id, Imp, NativeRuntime, Sel};
//!
//! struct MyRuntime { /* ... */ }
//!
//! impl NativeRuntime for MyRuntime {
//!     fn register_selector(&self, name: &str) -> Sel { /* ... */ }
//!     // ...
//! }
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod runtime;
pub mod value;

pub use error::{BridgeError, BridgeResult};
pub use runtime::NativeRuntime;
pub use value::{Class, Id, Imp, Sel};
