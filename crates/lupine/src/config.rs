use serde::{Deserialize, Serialize};

use crate::{error::ContractViolation, slots::POOL_SIZE};

/// Default name of the global table holding the bridge's library functions.
pub const DEFAULT_LIBRARY_NAME: &str = "host";

/// Per-interpreter bridge settings.
///
/// Built with [`BridgeConfig::new`] and the builder methods, or deserialized
/// (missing fields take their defaults):
///
/// ```
/// let config = lupine::BridgeConfig::new().slot_capacity(64).library_name("rust");
/// assert_eq!(config.slot_capacity, 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Number of pool slots usable by this interpreter. At most [`POOL_SIZE`].
    pub slot_capacity: usize,
    /// Global name of the library table (`as_attrgetter`, `iter`, `none`, ...).
    pub library_name: String,
    /// Decode interpreter strings as UTF-8 when pulling them. Invalid UTF-8 always stays bytes.
    pub autodecode: bool,
    /// Open the standard libraries when the runtime creates its own state.
    pub open_libs: bool,
    /// Record a traceback for errors raised under host-initiated protected calls.
    pub capture_traceback: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            slot_capacity: POOL_SIZE,
            library_name: DEFAULT_LIBRARY_NAME.to_owned(),
            autodecode: true,
            open_libs: true,
            capture_traceback: true,
        }
    }
}

impl BridgeConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of usable pool slots.
    #[must_use]
    pub fn slot_capacity(mut self, capacity: usize) -> Self {
        self.slot_capacity = capacity;
        self
    }

    /// Sets the global name of the library table.
    #[must_use]
    pub fn library_name(mut self, name: impl Into<String>) -> Self {
        self.library_name = name.into();
        self
    }

    /// Enables or disables UTF-8 decoding of interpreter strings.
    #[must_use]
    pub fn autodecode(mut self, enabled: bool) -> Self {
        self.autodecode = enabled;
        self
    }

    /// Enables or disables opening the standard libraries.
    #[must_use]
    pub fn open_libs(mut self, enabled: bool) -> Self {
        self.open_libs = enabled;
        self
    }

    /// Enables or disables traceback capture.
    #[must_use]
    pub fn capture_traceback(mut self, enabled: bool) -> Self {
        self.capture_traceback = enabled;
        self
    }

    /// Checks that the configuration can be installed.
    pub fn validate(&self) -> Result<(), ContractViolation> {
        if self.slot_capacity == 0 || self.slot_capacity > POOL_SIZE {
            return Err(ContractViolation::InvalidConfig {
                reason: format!("slot_capacity must be between 1 and {POOL_SIZE}, got {}", self.slot_capacity),
            });
        }
        if self.library_name.is_empty() || self.library_name.contains('\0') {
            return Err(ContractViolation::InvalidConfig {
                reason: format!("library_name {:?} is not a valid global name", self.library_name),
            });
        }
        Ok(())
    }
}
