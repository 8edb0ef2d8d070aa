//! Error types for crate and module operations.

use thiserror::Error;

/// Result type alias for SDK operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a crate of modules.
#[derive(Debug, Error)]
pub enum Error {
    /// The crate has not been initialized or has been shut down.
    #[error("crate is not ready")]
    CrateNotReady,

    /// `Crate::initialize` was called on an initialized crate.
    #[error("crate already initialized")]
    CrateAlreadyOpen,

    /// No device was found at the requested bus position.
    #[error("module not found: device={device}")]
    ModuleNotFound {
        /// Bus device number that was probed.
        device: usize,
    },

    /// Module number out of range.
    #[error("module number out of range: {number} (have {count} modules)")]
    ModuleNumberInvalid {
        /// Requested module number.
        number: i32,
        /// Number of online modules.
        count: usize,
    },

    /// No module occupies the requested slot.
    #[error("module slot not found: {slot}")]
    ModuleSlotInvalid {
        /// Requested slot.
        slot: usize,
    },

    /// The module already has a bus device bound.
    #[error("module {number} slot {slot}: already open")]
    ModuleAlreadyOpen {
        /// Logical module number, -1 if unassigned.
        number: i32,
        /// Physical slot.
        slot: usize,
    },

    /// Operation requires an online module.
    #[error("module {number} slot {slot}: module is offline")]
    ModuleOffline {
        /// Logical module number, -1 if unassigned.
        number: i32,
        /// Physical slot.
        slot: usize,
    },

    /// Boot or fixture initialization failed.
    #[error("module {number} slot {slot}: initialize failure: {reason}")]
    ModuleInitializeFailure {
        /// Logical module number, -1 if unassigned.
        number: i32,
        /// Physical slot.
        slot: usize,
        /// What went wrong.
        reason: String,
    },

    /// Channel index out of range for the module.
    #[error("module {number} slot {slot}: invalid channel number: {channel}")]
    ChannelNumberInvalid {
        /// Logical module number.
        number: i32,
        /// Physical slot.
        slot: usize,
        /// Requested channel.
        channel: usize,
    },

    /// A value was out of range for the variable or register.
    #[error("invalid value: {reason}")]
    InvalidValue {
        /// What was invalid.
        reason: String,
    },

    /// Configuration JSON was malformed.
    #[error("config JSON error: {reason}")]
    ConfigJson {
        /// Parser or structural failure description.
        reason: String,
    },

    /// A file could not be opened.
    #[error("file open failure: {path}: {reason}")]
    FileOpen {
        /// Path that failed to open.
        path: String,
        /// OS-level reason.
        reason: String,
    },

    /// A file could not be read.
    #[error("file read failure: {path}: {reason}")]
    FileRead {
        /// Path that failed to read.
        path: String,
        /// OS-level reason.
        reason: String,
    },

    /// An internal invariant was violated.
    #[error("internal failure: {reason}")]
    Internal {
        /// Invariant description.
        reason: String,
    },

    /// Bus or hardware level failure.
    #[error("bus error: {reason}")]
    Bus {
        /// Underlying failure description.
        reason: String,
    },
}

impl Error {
    /// Create a module-offline error.
    pub fn module_offline(number: i32, slot: usize) -> Self {
        Self::ModuleOffline { number, slot }
    }

    /// Create a module-initialize-failure error.
    pub fn initialize_failure(number: i32, slot: usize, reason: impl Into<String>) -> Self {
        Self::ModuleInitializeFailure {
            number,
            slot,
            reason: reason.into(),
        }
    }

    /// Create an invalid-value error.
    pub fn invalid_value(reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            reason: reason.into(),
        }
    }

    /// Create a config-JSON error.
    pub fn config_json(reason: impl Into<String>) -> Self {
        Self::ConfigJson {
            reason: reason.into(),
        }
    }

    /// Create an internal-failure error.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Create a bus error.
    pub fn bus(reason: impl Into<String>) -> Self {
        Self::Bus {
            reason: reason.into(),
        }
    }

    /// The coarse kind of the error, used when parallel workers serialize
    /// their outcomes through a channel.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CrateNotReady => ErrorKind::CrateNotReady,
            Self::CrateAlreadyOpen => ErrorKind::CrateAlreadyOpen,
            Self::ModuleNotFound { .. } => ErrorKind::ModuleNotFound,
            Self::ModuleNumberInvalid { .. } => ErrorKind::ModuleNumberInvalid,
            Self::ModuleSlotInvalid { .. } => ErrorKind::ModuleSlotInvalid,
            Self::ModuleAlreadyOpen { .. } => ErrorKind::ModuleAlreadyOpen,
            Self::ModuleOffline { .. } => ErrorKind::ModuleOffline,
            Self::ModuleInitializeFailure { .. } => ErrorKind::ModuleInitializeFailure,
            Self::ChannelNumberInvalid { .. } => ErrorKind::ChannelNumberInvalid,
            Self::InvalidValue { .. } => ErrorKind::InvalidValue,
            Self::ConfigJson { .. } => ErrorKind::ConfigJson,
            Self::FileOpen { .. } => ErrorKind::FileOpen,
            Self::FileRead { .. } => ErrorKind::FileRead,
            Self::Internal { .. } => ErrorKind::Internal,
            Self::Bus { .. } => ErrorKind::Bus,
        }
    }
}

/// Error kinds without payloads. Parallel boot and AFE workers report these
/// through their result channels; the orchestrator rethrows the first
/// non-success kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CrateNotReady,
    CrateAlreadyOpen,
    ModuleNotFound,
    ModuleNumberInvalid,
    ModuleSlotInvalid,
    ModuleAlreadyOpen,
    ModuleOffline,
    ModuleInitializeFailure,
    ChannelNumberInvalid,
    InvalidValue,
    ConfigJson,
    FileOpen,
    FileRead,
    Internal,
    Bus,
}

impl ErrorKind {
    /// Rehydrate a kind into an error carrying a generic message.
    pub fn into_error(self, what: &str) -> Error {
        match self {
            Self::CrateNotReady => Error::CrateNotReady,
            Self::CrateAlreadyOpen => Error::CrateAlreadyOpen,
            Self::ModuleNotFound => Error::ModuleNotFound { device: 0 },
            Self::ModuleNumberInvalid => Error::ModuleNumberInvalid { number: -1, count: 0 },
            Self::ModuleSlotInvalid => Error::ModuleSlotInvalid { slot: 0 },
            Self::ModuleAlreadyOpen => Error::ModuleAlreadyOpen { number: -1, slot: 0 },
            Self::ModuleOffline => Error::ModuleOffline { number: -1, slot: 0 },
            Self::ModuleInitializeFailure => Error::initialize_failure(-1, 0, what),
            Self::ChannelNumberInvalid => Error::ChannelNumberInvalid {
                number: -1,
                slot: 0,
                channel: 0,
            },
            Self::InvalidValue => Error::invalid_value(what),
            Self::ConfigJson => Error::config_json(what),
            Self::FileOpen => Error::FileOpen {
                path: String::new(),
                reason: what.into(),
            },
            Self::FileRead => Error::FileRead {
                path: String::new(),
                reason: what.into(),
            },
            Self::Internal => Error::internal(what),
            Self::Bus => Error::bus(what),
        }
    }
}
