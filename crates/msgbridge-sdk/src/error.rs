//! Error types for the bridge

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge error types
///
/// Everything except `MalformedSignature` describes a script-level mistake
/// and is meant to be surfaced to the script as a catchable error.
/// `MalformedSignature` points at a decoding defect or a corrupt reflected
/// signature.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    /// Argument or value kind does not match the expected kind
    #[error("bad argument #{arg} ({expected} expected, got {got})")]
    TypeCheck {
        /// 1-based argument position (0 for the receiver or a return value)
        arg: usize,
        /// Expected kind
        expected: String,
        /// Actual kind
        got: String,
    },

    /// Target class does not respond to the selector
    #[error("{class} does not respond to selector '{selector}'")]
    MethodNotFound {
        /// Class of the receiver
        class: String,
        /// Selector name
        selector: String,
    },

    /// Aggregate or blob length does not match the expected length
    #[error("size mismatch: expected {expected} bytes, got {got}")]
    SizeMismatch {
        /// Expected length in bytes
        expected: usize,
        /// Actual length in bytes
        got: usize,
    },

    /// Type encoding could not be parsed
    #[error("malformed type encoding '{encoding}': {reason}")]
    MalformedSignature {
        /// Offending encoding
        encoding: String,
        /// What went wrong
        reason: String,
    },

    /// Call supplied the wrong number of arguments
    #[error("wrong number of arguments to '{selector}': expected {expected}, got {got}")]
    ArgumentCount {
        /// Selector name
        selector: String,
        /// Declared parameter count
        expected: usize,
        /// Supplied argument count
        got: usize,
    },

    /// Aggregate type is not registered with the ABI type registry
    #[error("struct type '{0}' is not registered")]
    UnknownStruct(String),

    /// Aggregate name already registered with a different layout
    #[error("struct type '{0}' is already registered with a different layout")]
    LayoutConflict(String),

    /// Type code is valid but cannot cross the bridge in this position
    #[error("unsupported type '{code}' ({reason})")]
    UnsupportedType {
        /// Offending type code
        code: String,
        /// Why it is unsupported
        reason: String,
    },

    /// Fixed registry slot assigned out of order during bootstrap
    #[error("registry slot '{name}' assigned reference {got}, expected {expected}")]
    SlotOrder {
        /// Slot name
        name: &'static str,
        /// Expected reference number
        expected: i32,
        /// Reference actually assigned
        got: i32,
    },

    /// Value cannot be indexed
    #[error("attempt to index a {0} value")]
    NotIndexable(String),

    /// Value cannot be called
    #[error("attempt to call a {0} value")]
    NotCallable(String),

    /// Struct has no such field
    #[error("struct '{name}' has no field '{field}'")]
    UnknownField {
        /// Struct name
        name: String,
        /// Requested field
        field: String,
    },

    /// No class with this name
    #[error("class '{0}' not found")]
    ClassNotFound(String),

    /// Options could not be parsed
    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

impl BridgeError {
    /// Convenience constructor for `TypeCheck`
    pub fn type_check(arg: usize, expected: impl Into<String>, got: impl Into<String>) -> Self {
        BridgeError::TypeCheck {
            arg,
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Convenience constructor for `MalformedSignature`
    pub fn malformed(encoding: impl Into<String>, reason: impl Into<String>) -> Self {
        BridgeError::MalformedSignature {
            encoding: encoding.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error indicates a decoding defect rather than a script mistake
    pub fn is_hard_failure(&self) -> bool {
        matches!(self, BridgeError::MalformedSignature { .. })
    }
}
