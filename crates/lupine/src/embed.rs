//! Installing the bridge into an interpreter.
//!
//! [`init`] is for hosts that create the interpreter themselves; [`lupine_init`] is the
//! same installer exposed as a native function, for interpreters that load the bridge as
//! a C module. [`Runtime`](crate::Runtime) uses it for interpreters the bridge owns.
//!
//! Installation stores an anchor userdata in the registry. The anchor owns the per-interpreter
//! bridge state and its finalizer tears that state down when the interpreter closes, so every
//! host reference reachable from the interpreter is released with it.

use std::{
    ffi::{CString, c_int},
    panic::{AssertUnwindSafe, catch_unwind},
};

use mlua_sys as ffi;
use strum::IntoEnumIterator;

use crate::{
    config::BridgeConfig,
    error::{BridgeError, ContractViolation},
    lua::{Anchor, Lua, anchor_key, library_key},
    proxy::{self, PROXY_METATABLE},
    slots::{ProxyProtocol, ReservedSlot},
    stack::{StackGuard, ensure_stack},
    tracer::{BridgeTracer, NoopTracer},
    trampoline::anchor_gc,
    translate::{FAILURE_SENTINEL, finish, panic_message, push_message},
};

/// Interpreter version the bridge is compiled against, as `lua_version` reports it.
const LUA_VERSION_NUM: ffi::lua_Number = 504.0;

/// Integer and float sizes folded into one number, the way `luaL_checkversion` compares them.
const LUAL_NUMSIZES: usize = 16 * size_of::<ffi::lua_Integer>() + size_of::<ffi::lua_Number>();

/// Installs the bridge with the default configuration.
///
/// `path` is prepended to `package.path` as `<path>/?.lua;<path>/?/init.lua` so scripts can
/// `require` host-side support modules.
///
/// # Errors
/// [`BridgeError::VersionMismatch`] if the interpreter was built for another version, and
/// [`ContractViolation::AlreadyInitialized`] on a second call for the same interpreter.
///
/// # Safety
/// `state` must be a live interpreter thread that outlives every use of the returned handle
/// as an open interpreter. The handle notices when the interpreter is closed.
pub unsafe fn init(state: *mut ffi::lua_State, path: &str) -> Result<Lua, BridgeError> {
    // SAFETY: guaranteed by the caller.
    unsafe { init_with(state, path, BridgeConfig::default(), Box::new(NoopTracer)) }
}

/// Installs the bridge with an explicit configuration and tracer.
///
/// # Safety
/// See [`init`].
pub unsafe fn init_with(
    state: *mut ffi::lua_State,
    path: &str,
    config: BridgeConfig,
    tracer: Box<dyn BridgeTracer>,
) -> Result<Lua, BridgeError> {
    // SAFETY: guaranteed by the caller.
    unsafe { install(state, config, tracer, Some(path)) }
}

/// `require`-style entry: `lupine_init(path)` installs the bridge and returns the library.
///
/// Raises inside the interpreter if the bridge cannot be installed.
///
/// # Safety
/// Only the interpreter may call this, as a native function.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn lupine_init(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: called by the interpreter with its own state; both checks raise before any
    // Rust value exists in this frame.
    unsafe {
        ffi::luaL_checkversion_(state, LUA_VERSION_NUM, LUAL_NUMSIZES);
        let mut len = 0usize;
        let path = ffi::luaL_checklstring(state, 1, &raw mut len);
        let raw = init_from_lua(state, std::slice::from_raw_parts(path.cast::<u8>(), len));
        finish(state, raw)
    }
}

#[inline(never)]
unsafe fn init_from_lua(state: *mut ffi::lua_State, path: &[u8]) -> c_int {
    let path = String::from_utf8_lossy(path).into_owned();
    let installed = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: `state` is the calling interpreter's thread.
        unsafe { install(state, BridgeConfig::default(), Box::new(NoopTracer), Some(&path)) }
    }));
    let message = match installed {
        Ok(Ok(_)) => {
            // SAFETY: the library was stored under its registry key during install.
            unsafe { ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, library_key()) };
            return 1;
        }
        Ok(Err(error)) => error.to_string(),
        Err(panic) => format!("bridge installation panicked: {}", panic_message(panic.as_ref())),
    };
    // SAFETY: a native frame has spare slots for the message.
    unsafe { push_message(state, &message) };
    FAILURE_SENTINEL
}

/// Checks that the interpreter matches the headers the bridge was compiled against.
///
/// # Safety
/// `state` must be live.
unsafe fn check_version(state: *mut ffi::lua_State) -> Result<(), BridgeError> {
    // SAFETY: guaranteed by the caller.
    let found = unsafe { ffi::lua_version(state) };
    if found == LUA_VERSION_NUM {
        Ok(())
    } else {
        Err(BridgeError::VersionMismatch {
            expected: LUA_VERSION_NUM,
            found,
        })
    }
}

/// Installs the bridge into `state`'s interpreter.
///
/// # Safety
/// `state` must be a live interpreter thread.
pub(crate) unsafe fn install(
    state: *mut ffi::lua_State,
    config: BridgeConfig,
    tracer: Box<dyn BridgeTracer>,
    path: Option<&str>,
) -> Result<Lua, BridgeError> {
    // SAFETY: guaranteed by the caller.
    unsafe { check_version(state)? };
    config.validate()?;
    // SAFETY: guaranteed by the caller.
    unsafe {
        let _guard = StackGuard::new(state);
        ensure_stack(state, 5)?;
        if Lua::from_state(state).is_some() {
            return Err(ContractViolation::AlreadyInitialized.into());
        }
        let library_name = CString::new(config.library_name.as_str())?;

        ffi::lua_rawgeti(
            state,
            ffi::LUA_REGISTRYINDEX,
            ffi::lua_Integer::from(ffi::LUA_RIDX_MAINTHREAD),
        );
        let main = ffi::lua_tothread(state, -1);
        ffi::lua_settop(state, -2);

        let lua = Lua::new(main, config, tracer);
        {
            let _scope = lua.enter(state);
            create_anchor(&lua, state);
            register_metatable(state);
            register_library(state, &library_name);
            if let Some(path) = path {
                extend_package_path(state, path);
            }
        }
        lua.trace(|tracer| tracer.on_init(&lua.config().library_name));
        Ok(lua)
    }
}

/// # Safety
/// `state` must be live with two free slots.
unsafe fn create_anchor(lua: &Lua, state: *mut ffi::lua_State) {
    // SAFETY: guaranteed by the caller; the block is initialized before anything can
    // finalize it.
    unsafe {
        let anchor = ffi::lua_newuserdatauv(state, size_of::<Anchor>(), 0).cast::<Anchor>();
        anchor.write(Some(lua.shared.clone()));
        ffi::lua_createtable(state, 0, 1);
        ffi::lua_pushcclosure(state, anchor_gc, 0);
        ffi::lua_setfield(state, -2, c"__gc".as_ptr());
        ffi::lua_setmetatable(state, -2);
        ffi::lua_rawsetp(state, ffi::LUA_REGISTRYINDEX, anchor_key());
    }
}

/// # Safety
/// `state` must be live with two free slots.
unsafe fn register_metatable(state: *mut ffi::lua_State) {
    // SAFETY: guaranteed by the caller.
    unsafe {
        ffi::luaL_newmetatable(state, PROXY_METATABLE.as_ptr());
        for slot in ReservedSlot::iter() {
            if let Some(name) = slot.metamethod() {
                ffi::lua_pushcclosure(state, slot.function(), 0);
                ffi::lua_setfield(state, -2, name.as_ptr());
            }
        }
        for entry in ProxyProtocol::iter() {
            ffi::lua_pushcclosure(state, entry.function(), 0);
            ffi::lua_setfield(state, -2, entry.metamethod().as_ptr());
        }
        ffi::lua_settop(state, -2);
    }
}

/// Builds the library table, stores it in the registry, `package.loaded` and the globals.
///
/// # Safety
/// `state` must be live with four free slots.
unsafe fn register_library(state: *mut ffi::lua_State, name: &CString) {
    // SAFETY: guaranteed by the caller; the globals are written raw so strict-mode
    // metatables cannot raise.
    unsafe {
        ffi::lua_createtable(state, 0, 8);
        for slot in ReservedSlot::iter() {
            if let Some(field) = slot.library_field() {
                ffi::lua_pushcclosure(state, slot.function(), 0);
                ffi::lua_setfield(state, -2, field.as_ptr());
            }
        }
        ffi::lua_pushlightuserdata(state, proxy::none_marker());
        ffi::lua_setfield(state, -2, c"none".as_ptr());

        ffi::lua_pushvalue(state, -1);
        ffi::lua_rawsetp(state, ffi::LUA_REGISTRYINDEX, library_key());

        ffi::luaL_getsubtable(state, ffi::LUA_REGISTRYINDEX, c"_LOADED".as_ptr());
        ffi::lua_pushvalue(state, -2);
        ffi::lua_setfield(state, -2, name.as_ptr());
        ffi::lua_settop(state, -2);

        ffi::lua_rawgeti(
            state,
            ffi::LUA_REGISTRYINDEX,
            ffi::lua_Integer::from(ffi::LUA_RIDX_GLOBALS),
        );
        ffi::lua_pushstring(state, name.as_ptr());
        ffi::lua_pushvalue(state, -3);
        ffi::lua_rawset(state, -3);
        ffi::lua_settop(state, -3);
    }
}

/// Prepends `<path>/?.lua;<path>/?/init.lua;` to `package.path`, if the package library
/// is loaded.
///
/// # Safety
/// `state` must be live with three free slots.
unsafe fn extend_package_path(state: *mut ffi::lua_State, path: &str) {
    // SAFETY: guaranteed by the caller; only raw accesses are used.
    unsafe {
        ffi::lua_rawgeti(
            state,
            ffi::LUA_REGISTRYINDEX,
            ffi::lua_Integer::from(ffi::LUA_RIDX_GLOBALS),
        );
        ffi::lua_pushstring(state, c"package".as_ptr());
        if ffi::lua_rawget(state, -2) != ffi::LUA_TTABLE {
            ffi::lua_settop(state, -3);
            return;
        }
        ffi::lua_pushstring(state, c"path".as_ptr());
        ffi::lua_rawget(state, -2);
        let mut len = 0usize;
        let current = ffi::lua_tolstring(state, -1, &raw mut len);
        let current = if current.is_null() {
            String::new()
        } else {
            String::from_utf8_lossy(std::slice::from_raw_parts(current.cast::<u8>(), len)).into_owned()
        };
        ffi::lua_settop(state, -2);

        let extended = format!("{path}/?.lua;{path}/?/init.lua;{current}");
        ffi::lua_pushstring(state, c"path".as_ptr());
        ffi::lua_pushlstring(state, extended.as_ptr().cast(), extended.len());
        ffi::lua_rawset(state, -3);
        ffi::lua_settop(state, -3);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Runs `body` on a bare interpreter without standard libraries.
    fn with_state(body: impl FnOnce(*mut ffi::lua_State)) {
        // SAFETY: the state is created here and closed once `body` returns.
        unsafe {
            let state = ffi::luaL_newstate();
            assert!(!state.is_null());
            body(state);
            ffi::lua_close(state);
        }
    }

    #[test]
    fn linked_interpreter_passes_the_version_check() {
        with_state(|state| {
            // SAFETY: the state is live.
            assert!(unsafe { check_version(state) }.is_ok());
            // SAFETY: as above.
            assert_eq!(unsafe { ffi::lua_version(state) }, LUA_VERSION_NUM);
        });
    }

    #[test]
    fn version_is_checked_before_the_configuration() {
        with_state(|state| {
            let config = BridgeConfig::new().slot_capacity(0);
            // SAFETY: the state is live; a rejected install leaves nothing behind.
            let error = unsafe { install(state, config, Box::new(NoopTracer), None) }.unwrap_err();
            assert!(
                matches!(error, BridgeError::Contract(ContractViolation::InvalidConfig { .. })),
                "{error:?}"
            );
            // SAFETY: as above.
            assert!(unsafe { Lua::from_state(state) }.is_none());
        });
    }
}
