use std::ops::Deref;

use mlua_sys as ffi;

use crate::{
    config::BridgeConfig,
    embed,
    error::BridgeError,
    lua::Lua,
    tracer::{BridgeTracer, NoopTracer},
};

/// An interpreter owned by the bridge.
///
/// Dereferences to [`Lua`]. Dropping the runtime closes the interpreter: every proxy is
/// finalized, every handler dropped, and outstanding [`Lua`] handles report
/// [`ContractViolation::Closed`](crate::ContractViolation::Closed).
///
/// ```
/// use lupine::{Runtime, Value};
///
/// let runtime = Runtime::new().unwrap();
/// assert_eq!(runtime.eval("1 + 2").unwrap(), Value::Integer(3));
/// ```
pub struct Runtime {
    lua: Lua,
}

impl Runtime {
    /// Creates an interpreter with the standard libraries and the bridge installed.
    pub fn new() -> Result<Self, BridgeError> {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Result<Self, BridgeError> {
        Self::with_tracer(config, Box::new(NoopTracer))
    }

    pub fn with_tracer(config: BridgeConfig, tracer: Box<dyn BridgeTracer>) -> Result<Self, BridgeError> {
        config.validate()?;
        // SAFETY: the state is fresh and closed exactly once, here on failure or by `Drop`.
        unsafe {
            let state = ffi::luaL_newstate();
            if state.is_null() {
                return Err(BridgeError::StateCreation);
            }
            if config.open_libs {
                ffi::luaL_openlibs(state);
            }
            match embed::install(state, config, tracer, None) {
                Ok(lua) => Ok(Self { lua }),
                Err(error) => {
                    ffi::lua_close(state);
                    Err(error)
                }
            }
        }
    }

    #[must_use]
    pub fn lua(&self) -> &Lua {
        &self.lua
    }
}

impl Deref for Runtime {
    type Target = Lua;

    fn deref(&self) -> &Lua {
        &self.lua
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.lua.close();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").field("lua", &self.lua).finish()
    }
}
