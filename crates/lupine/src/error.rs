use std::{ffi::NulError, fmt};

use mlua_sys as ffi;

use crate::{dispatch::DispatchFamily, slots::SlotId, value::Value};

/// Status codes reported by the interpreter's protected-call machinery.
///
/// Discriminants are the interpreter's own `LUA_*` status values so raw codes
/// convert with [`LuaStatus::from_repr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::FromRepr)]
#[repr(i32)]
pub enum LuaStatus {
    #[strum(to_string = "ok")]
    Ok = ffi::LUA_OK,
    #[strum(to_string = "yield")]
    Yield = ffi::LUA_YIELD,
    #[strum(to_string = "runtime error")]
    ErrRun = ffi::LUA_ERRRUN,
    #[strum(to_string = "syntax error")]
    ErrSyntax = ffi::LUA_ERRSYNTAX,
    #[strum(to_string = "memory error")]
    ErrMem = ffi::LUA_ERRMEM,
    #[strum(to_string = "error in error handling")]
    ErrErr = ffi::LUA_ERRERR,
}

impl LuaStatus {
    /// Maps a raw status, treating unknown failure codes as runtime errors.
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        Self::from_repr(code).unwrap_or(Self::ErrRun)
    }
}

/// Broken bridge contract.
///
/// These are programming errors on either side of the bridge rather than script
/// failures, so they are kept apart from [`BridgeError::Runtime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractViolation {
    /// Every slot in the pool is bound.
    SlotsExhausted { capacity: usize },
    /// The slot has no live handler (never bound, or already released).
    SlotNotBound { slot: SlotId },
    /// A trampoline produced a result code that is neither a count nor the failure sentinel.
    InvalidResultCode { code: i32 },
    /// An operation code outside the family's defined set.
    InvalidOpcode { family: DispatchFamily, code: i32 },
    /// A unary operation was used as binary or the other way round.
    ArityMismatch { operation: &'static str, expected: usize },
    /// The interpreter has no bridge installed.
    Uninitialized,
    /// The interpreter already carries a bridge.
    AlreadyInitialized,
    /// A value from a different interpreter instance was passed in.
    ForeignObject,
    /// The interpreter has been closed.
    Closed,
    /// Configuration rejected by [`BridgeConfig::validate`](crate::BridgeConfig::validate).
    InvalidConfig { reason: String },
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SlotsExhausted { capacity } => write!(f, "all {capacity} callback slots are bound"),
            Self::SlotNotBound { slot } => write!(f, "{slot} is not bound (callback released)"),
            Self::InvalidResultCode { code } => write!(f, "invalid trampoline result code {code}"),
            Self::InvalidOpcode { family, code } => write!(f, "invalid {family} opcode {code}"),
            Self::ArityMismatch { operation, expected } => {
                write!(f, "operation '{operation}' takes {expected} operand(s)")
            }
            Self::Uninitialized => write!(f, "bridge is not initialized for this interpreter"),
            Self::AlreadyInitialized => write!(f, "bridge is already initialized for this interpreter"),
            Self::ForeignObject => write!(f, "value belongs to a different interpreter"),
            Self::Closed => write!(f, "interpreter is closed"),
            Self::InvalidConfig { reason } => write!(f, "invalid bridge configuration: {reason}"),
        }
    }
}

/// Error type for every fallible bridge operation.
#[derive(Debug, Clone)]
pub enum BridgeError {
    /// The interpreter raised an error. `payload` is the raised value, unchanged.
    Runtime {
        status: LuaStatus,
        payload: Value,
        traceback: Option<String>,
    },
    /// A chunk failed to compile.
    Syntax { message: String },
    /// See [`ContractViolation`].
    Contract(ContractViolation),
    /// The interpreter was built against a different API version.
    VersionMismatch { expected: f64, found: f64 },
    /// The interpreter could not allocate a new state.
    StateCreation,
    /// The interpreter stack could not grow.
    StackOverflow,
    /// The host object does not implement the requested operation.
    Unsupported { type_name: &'static str, operation: &'static str },
    /// A value could not be converted.
    Conversion { from: &'static str, to: &'static str },
    /// Free-form failure raised by host code.
    Host { message: String },
    /// The host object behind a proxy was already finalized.
    Finalized,
}

impl BridgeError {
    /// Host failure with a message.
    #[must_use]
    pub fn host(message: impl Into<String>) -> Self {
        Self::Host {
            message: message.into(),
        }
    }

    /// Failure that re-raises `payload` inside the interpreter unchanged.
    ///
    /// Returning this from a host closure is the host-side equivalent of Lua's `error(payload)`.
    #[must_use]
    pub fn raise(payload: impl Into<Value>) -> Self {
        Self::Runtime {
            status: LuaStatus::ErrRun,
            payload: payload.into(),
            traceback: None,
        }
    }

    /// Payload of an interpreter error.
    #[must_use]
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Runtime { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// Interpreter status behind this error, if it came from the interpreter.
    #[must_use]
    pub fn status(&self) -> Option<LuaStatus> {
        match self {
            Self::Runtime { status, .. } => Some(*status),
            Self::Syntax { .. } => Some(LuaStatus::ErrSyntax),
            _ => None,
        }
    }

    /// Traceback captured when the error was raised.
    #[must_use]
    pub fn traceback(&self) -> Option<&str> {
        match self {
            Self::Runtime { traceback, .. } => traceback.as_deref(),
            _ => None,
        }
    }

    /// The contract violation, if this is one.
    #[must_use]
    pub fn violation(&self) -> Option<&ContractViolation> {
        match self {
            Self::Contract(violation) => Some(violation),
            _ => None,
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Runtime { payload, .. } => match payload {
                Value::String(message) => write!(f, "{message}"),
                Value::Nil => write!(f, "(error object is a nil value)"),
                other => write!(f, "(error object is a {} value: {other})", other.type_name()),
            },
            Self::Syntax { message } => write!(f, "{message}"),
            Self::Contract(violation) => write!(f, "{violation}"),
            Self::VersionMismatch { expected, found } => {
                write!(f, "interpreter version mismatch: built for {expected}, running {found}")
            }
            Self::StateCreation => write!(f, "cannot create interpreter state: not enough memory"),
            Self::StackOverflow => write!(f, "interpreter stack overflow"),
            Self::Unsupported { type_name, operation } => {
                write!(f, "'{type_name}' object does not support {operation}")
            }
            Self::Conversion { from, to } => write!(f, "cannot convert {from} to {to}"),
            Self::Host { message } => write!(f, "{message}"),
            Self::Finalized => write!(f, "host object already finalized"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<ContractViolation> for BridgeError {
    fn from(violation: ContractViolation) -> Self {
        Self::Contract(violation)
    }
}

impl From<NulError> for BridgeError {
    fn from(_: NulError) -> Self {
        Self::Conversion {
            from: "string with interior NUL",
            to: "C string",
        }
    }
}
