//! Error translation between host handlers and the interpreter.
//!
//! Handlers return [`HandlerResult`]. A failure can only be expressed by a [`Staged`] token,
//! and the only way to obtain one is to push an error value through
//! [`Stack::stage`](crate::Stack::stage) or [`Stack::stage_error`](crate::Stack::stage_error).
//! The raw integer protocol (`n >= 0` results, or [`FAILURE_SENTINEL`]) exists only between
//! [`invoke`] and [`finish`], at the outermost native frame.
//!
//! The interpreter raises errors with `longjmp`, which must never cross a Rust frame that
//! still owns values. [`invoke`] therefore runs the handler to completion and drops every
//! Rust value before returning the raw code; [`finish`] owns nothing and is the only place
//! that calls `lua_error`.

use std::{
    any::Any,
    ffi::c_int,
    panic::{AssertUnwindSafe, catch_unwind},
    rc::Rc,
};

use mlua_sys as ffi;

use crate::{
    error::{BridgeError, ContractViolation},
    lua::Lua,
    slots::EntryPoint,
    stack::Stack,
};

/// Raw result code meaning "an error value is on top of the stack, raise it".
pub const FAILURE_SENTINEL: c_int = -1;

/// Proof that an error value has been pushed onto the interpreter stack.
#[derive(Debug)]
#[must_use = "a staged error must be returned from the handler"]
pub struct Staged {
    _private: (),
}

impl Staged {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

/// Outcome of a handler: the number of results left on top of the stack, or a staged error.
pub type HandlerResult = Result<usize, Staged>;

/// Host handler bound to a slot.
pub type Handler = Rc<dyn Fn(&Stack<'_>) -> HandlerResult>;

/// Decoded raw result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Return(c_int),
    Raise,
    Invalid(c_int),
}

pub(crate) fn decode(raw: c_int) -> Outcome {
    match raw {
        FAILURE_SENTINEL => Outcome::Raise,
        count if count >= 0 => Outcome::Return(count),
        other => Outcome::Invalid(other),
    }
}

pub(crate) fn into_raw(result: HandlerResult) -> c_int {
    match result {
        Ok(count) => c_int::try_from(count).unwrap_or(c_int::MAX),
        Err(Staged { .. }) => FAILURE_SENTINEL,
    }
}

/// Runs `body` for a native entry and returns the raw result code.
///
/// Panics are caught and staged as host errors. When the state has no bridge installed,
/// an error message is pushed and the failure sentinel returned.
///
/// # Safety
/// `state` must be the state the interpreter passed to the native entry.
pub(crate) unsafe fn invoke(
    state: *mut ffi::lua_State,
    entry: EntryPoint,
    body: impl FnOnce(&Stack<'_>) -> HandlerResult,
) -> c_int {
    // SAFETY: `state` is live for the duration of the native call.
    let Some(lua) = (unsafe { Lua::from_state(state) }) else {
        // SAFETY: as above; the message is pushed and nothing else is owned.
        unsafe { push_message(state, &ContractViolation::Uninitialized.to_string()) };
        return FAILURE_SENTINEL;
    };
    let _scope = lua.enter(state);
    lua.trace(|tracer| tracer.on_dispatch(entry));

    let stack = Stack::new(state, &lua);
    let result = match catch_unwind(AssertUnwindSafe(|| body(&stack))) {
        Ok(result) => result.and_then(|count| stack.check_results(count)),
        Err(panic) => Err(stack.stage_error(BridgeError::host(format!(
            "host handler panicked: {}",
            panic_message(panic.as_ref())
        )))),
    };
    if result.is_err() {
        lua.trace(|tracer| tracer.on_handler_failure(entry));
    }
    into_raw(result)
}

/// Turns a raw code into the native entry's return value, raising on failure.
///
/// Must be called with no Rust values alive in the calling frame.
///
/// # Safety
/// `state` must be the state the interpreter passed to the native entry.
#[inline(always)]
pub(crate) unsafe fn finish(state: *mut ffi::lua_State, raw: c_int) -> c_int {
    match decode(raw) {
        Outcome::Return(count) => count,
        // SAFETY: an error value was staged on top of the stack by `invoke`.
        Outcome::Raise => unsafe { ffi::lua_error(state) },
        Outcome::Invalid(code) => invalid_result(code),
    }
}

#[cold]
fn invalid_result(code: c_int) -> ! {
    eprintln!("lupine: {}", ContractViolation::InvalidResultCode { code });
    std::process::abort()
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Pushes a plain string.
///
/// # Safety
/// `state` must be a live state with one free stack slot.
pub(crate) unsafe fn push_message(state: *mut ffi::lua_State, message: &str) {
    // SAFETY: the pointer and length describe `message`.
    unsafe { ffi::lua_pushlstring(state, message.as_ptr().cast(), message.len()) };
}
