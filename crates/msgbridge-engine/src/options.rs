//! Bridge configuration
//!
//! Options are plain data; contexts copy them at open time. They can be
//! built in code or read from a TOML table:
//!
//! ```toml
//! fast_lookups = true
//! cache_signatures = true
//! opaque_unknown_structs = false
//! member_separator = "_"
//! ```

use msgbridge_sdk::{BridgeError, BridgeResult};
use serde::Deserialize;

/// Per-context bridge options
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeOptions {
    /// Fetch fixed registry tables by integer slot (asserted at bootstrap).
    /// When off, tables are registered and looked up by name.
    pub fast_lookups: bool,

    /// Cache reflected method signatures per (class, selector)
    pub cache_signatures: bool,

    /// Carry structs missing from the ABI registry as blobs sized from their
    /// inline encoding instead of failing the call
    pub opaque_unknown_structs: bool,

    /// Character in member names that maps to `:` in selector names
    pub member_separator: char,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            fast_lookups: true,
            cache_signatures: true,
            opaque_unknown_structs: false,
            member_separator: '_',
        }
    }
}

impl BridgeOptions {
    /// Parse options from a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> BridgeResult<Self> {
        let options: BridgeOptions =
            toml::from_str(source).map_err(|e| BridgeError::InvalidOptions(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Reject separators that would collide with selector syntax
    pub fn validate(&self) -> BridgeResult<()> {
        if self.member_separator == ':' || self.member_separator.is_whitespace() {
            return Err(BridgeError::InvalidOptions(format!(
                "member_separator cannot be {:?}",
                self.member_separator
            )));
        }
        Ok(())
    }

    /// Map a script member name to a selector name
    pub fn selector_name(&self, member: &str) -> String {
        member.replace(self.member_separator, ":")
    }
}
