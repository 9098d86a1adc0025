//! Native entry points.
//!
//! The interpreter only accepts plain function pointers, so every way into the host is a
//! statically compiled `extern "C-unwind"` function:
//!
//! - [`POOL_SIZE`] pool trampolines, one per slot, each looking up the handler bound to
//!   its fixed slot id at call time;
//! - one entry per [`ReservedSlot`] and per [`ProxyProtocol`];
//! - the bridge anchor finalizer and the traceback message handler.
//!
//! Every entry runs its handler through [`invoke`] and returns through [`finish`], so the
//! frame that may raise owns no Rust values.

use std::{
    ffi::c_int,
    panic::{AssertUnwindSafe, catch_unwind},
    ptr,
};

use mlua_sys as ffi;

use crate::{
    error::ContractViolation,
    lua::{Anchor, Lua},
    proxy,
    slots::{EntryPoint, POOL_SIZE, ProxyProtocol, ReservedSlot, SlotId},
    translate::{finish, invoke},
};

const _: () = assert!(POOL_SIZE == 9 * 10 * 10, "trampoline table is laid out as 9 x 10 x 10");

/// Returns the native entry point bound to `slot`.
///
/// The pointer is stable for the life of the process; what it runs depends on the handler
/// bound to `slot` in the interpreter that calls it.
#[must_use]
pub fn trampoline(slot: SlotId) -> ffi::lua_CFunction {
    let raw = slot.raw();
    TRAMPOLINES[raw / 100][raw / 10 % 10][raw % 10]
}

unsafe extern "C-unwind" fn pooled<const ID: usize>(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: called by the interpreter with its own state.
    unsafe {
        let raw = run_pooled(state, SlotId::from_pool_index(ID));
        finish(state, raw)
    }
}

#[inline(never)]
unsafe fn run_pooled(state: *mut ffi::lua_State, slot: SlotId) -> c_int {
    // SAFETY: guaranteed by the caller.
    unsafe {
        invoke(state, EntryPoint::Pool(slot), |stack| match stack.lua().handler(slot) {
            Some(handler) => handler(stack),
            None => Err(stack.stage_error(ContractViolation::SlotNotBound { slot }.into())),
        })
    }
}

macro_rules! tens {
    ($h:literal, $t:literal) => {
        [
            pooled::<{ $h * 100 + $t * 10 }>,
            pooled::<{ $h * 100 + $t * 10 + 1 }>,
            pooled::<{ $h * 100 + $t * 10 + 2 }>,
            pooled::<{ $h * 100 + $t * 10 + 3 }>,
            pooled::<{ $h * 100 + $t * 10 + 4 }>,
            pooled::<{ $h * 100 + $t * 10 + 5 }>,
            pooled::<{ $h * 100 + $t * 10 + 6 }>,
            pooled::<{ $h * 100 + $t * 10 + 7 }>,
            pooled::<{ $h * 100 + $t * 10 + 8 }>,
            pooled::<{ $h * 100 + $t * 10 + 9 }>,
        ]
    };
}

macro_rules! hundreds {
    ($h:literal) => {
        [
            tens!($h, 0),
            tens!($h, 1),
            tens!($h, 2),
            tens!($h, 3),
            tens!($h, 4),
            tens!($h, 5),
            tens!($h, 6),
            tens!($h, 7),
            tens!($h, 8),
            tens!($h, 9),
        ]
    };
}

static TRAMPOLINES: [[[ffi::lua_CFunction; 10]; 10]; 9] = [
    hundreds!(0),
    hundreds!(1),
    hundreds!(2),
    hundreds!(3),
    hundreds!(4),
    hundreds!(5),
    hundreds!(6),
    hundreds!(7),
    hundreds!(8),
];

macro_rules! native_entries {
    ($owner:ident as $entry:ident { $($slot:ident => $name:ident($handler:path);)* } $($extra:ident => $extra_fn:ident;)*) => {
        $(
            unsafe extern "C-unwind" fn $name(state: *mut ffi::lua_State) -> c_int {
                // SAFETY: called by the interpreter with its own state.
                unsafe {
                    let raw = invoke(state, EntryPoint::$entry($owner::$slot), $handler);
                    finish(state, raw)
                }
            }
        )*

        impl $owner {
            /// Native entry for this role.
            #[must_use]
            pub fn function(self) -> ffi::lua_CFunction {
                match self {
                    $(Self::$slot => $name,)*
                    $(Self::$extra => $extra_fn,)*
                }
            }
        }
    };
}

native_entries! {
    ReservedSlot as Reserved {
        ObjectCall => object_call(proxy::object_call);
        ObjectStr => object_str(proxy::object_str);
        ObjectGetindex => object_getindex(proxy::object_getindex);
        ObjectSetindex => object_setindex(proxy::object_setindex);
        AsAttrgetter => as_attrgetter(proxy::as_attrgetter_entry);
        AsItemgetter => as_itemgetter(proxy::as_itemgetter_entry);
        AsFunction => as_function(proxy::as_function_entry);
        AsfuncCall => asfunc_call(proxy::asfunc_call);
        Iter => iter(crate::iter::iter_entry);
        Iterex => iterex(crate::iter::iterex_entry);
        Enumerate => enumerate(crate::iter::enumerate_entry);
        IterNext => iter_next(crate::iter::iter_next_entry);
    }
    ObjectGc => object_gc;
}

native_entries! {
    ProxyProtocol as Protocol {
        ObjectLen => object_len(proxy::object_len);
        ObjectPairs => object_pairs(proxy::object_pairs);
    }
}

/// `__gc` of every bridge userdata. Never raises.
unsafe extern "C-unwind" fn object_gc(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: `__gc` receives the userdata being finalized at index 1.
    unsafe { proxy::finalize(state) };
    0
}

/// `__gc` of the bridge anchor: releases every handler and marks the interpreter closed.
pub(crate) unsafe extern "C-unwind" fn anchor_gc(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: the anchor userdata holds an initialized `Anchor` written at install time.
    let anchor = unsafe { ffi::lua_touserdata(state, 1).cast::<Anchor>().as_mut() };
    if let Some(shared) = anchor.and_then(Option::take) {
        let detached = catch_unwind(AssertUnwindSafe(|| Lua { shared }.detach()));
        if detached.is_err() {
            eprintln!("lupine: host handler panicked while the interpreter was closing");
        }
    }
    0
}

/// Message handler for protected calls: records a traceback and returns the error
/// value unchanged.
pub(crate) unsafe extern "C-unwind" fn capture_traceback(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: message handlers are called with the error value at index 1.
    unsafe {
        ffi::lua_settop(state, 1);
        if ffi::lua_checkstack(state, 2) != 0 {
            let message = if ffi::lua_type(state, 1) == ffi::LUA_TSTRING {
                ffi::lua_tolstring(state, 1, ptr::null_mut())
            } else {
                ptr::null()
            };
            ffi::luaL_traceback(state, state, message, 1);
            record_traceback(state);
            ffi::lua_settop(state, 1);
        }
    }
    1
}

#[inline(never)]
unsafe fn record_traceback(state: *mut ffi::lua_State) {
    // SAFETY: the traceback string is on top of `state`.
    unsafe {
        let mut len = 0usize;
        let data = ffi::lua_tolstring(state, -1, &raw mut len);
        if data.is_null() {
            return;
        }
        let text = String::from_utf8_lossy(std::slice::from_raw_parts(data.cast::<u8>(), len)).into_owned();
        if let Some(lua) = Lua::from_state(state) {
            lua.record_traceback(text);
        }
    }
}
