use std::{ffi::c_int, rc::Rc};

use mlua_sys as ffi;

use crate::{
    error::BridgeError,
    host::HostError,
    lua::Lua,
    object::{LuaObject, LuaType},
    proxy::{self, Proxy},
    translate::{HandlerResult, Staged, push_message},
    value::{MultiValue, Value},
};

/// The interpreter stack as seen by a running handler.
///
/// Index 1 is the first argument. Values pushed through [`Stack::push`] land on top;
/// a handler returns how many of the topmost values are its results.
pub struct Stack<'a> {
    state: *mut ffi::lua_State,
    lua: &'a Lua,
}

impl<'a> Stack<'a> {
    pub(crate) fn new(state: *mut ffi::lua_State, lua: &'a Lua) -> Self {
        Self { state, lua }
    }

    /// Handle to the interpreter running this handler.
    #[must_use]
    pub fn lua(&self) -> &'a Lua {
        self.lua
    }

    /// Raw interpreter state, for handlers that drive the C API directly.
    #[must_use]
    pub fn raw_state(&self) -> *mut ffi::lua_State {
        self.state
    }

    /// Number of values on the stack.
    #[must_use]
    pub fn top(&self) -> usize {
        // SAFETY: the state is live while the handler runs.
        unsafe { ffi::lua_gettop(self.state) as usize }
    }

    /// Value at 1-based `index`; `Nil` past the top.
    #[must_use]
    pub fn value(&self, index: usize) -> Value {
        if index == 0 || index > self.top() {
            return Value::Nil;
        }
        // SAFETY: `index` is inside the current frame.
        unsafe { pull_value(self.lua, self.state, index as c_int) }
    }

    /// All values from `first` to the top.
    #[must_use]
    pub fn values_from(&self, first: usize) -> MultiValue {
        (first.max(1)..=self.top()).map(|index| self.value(index)).collect()
    }

    /// All arguments of the call.
    #[must_use]
    pub fn arguments(&self) -> MultiValue {
        self.values_from(1)
    }

    /// Pushes a value.
    pub fn push(&self, value: &Value) -> Result<(), BridgeError> {
        // SAFETY: the state is live while the handler runs.
        unsafe {
            ensure_stack(self.state, 1)?;
            push_value(self.lua, self.state, value)
        }
    }

    /// Pushes `values` and reports them as the handler's results.
    pub fn returning(&self, values: MultiValue) -> HandlerResult {
        // SAFETY: the state is live while the handler runs.
        if let Err(error) = unsafe { ensure_stack(self.state, values.len()) } {
            return Err(self.stage_error(error));
        }
        for value in &values {
            if let Err(error) = self.push(value) {
                return Err(self.stage_error(error));
            }
        }
        Ok(values.len())
    }

    /// Pushes `payload` as the error to raise.
    pub fn stage(&self, payload: &Value) -> Staged {
        if let Err(error) = self.push(payload) {
            // SAFETY: the interpreter guarantees spare slots in a native frame.
            unsafe { push_message(self.state, &error.to_string()) };
        }
        Staged::new()
    }

    /// Stages a host error.
    ///
    /// Interpreter errors re-raise their original payload. Other errors travel as a
    /// [`HostError`] proxy, which the host turns back into the same error if it comes back
    /// out of a protected call.
    pub fn stage_error(&self, error: BridgeError) -> Staged {
        match error {
            BridgeError::Runtime { payload, .. } => self.stage(&payload),
            other => self.stage(&Value::Host(Proxy::Attribute(Rc::new(HostError::new(other))))),
        }
    }

    pub(crate) fn check_results(&self, count: usize) -> HandlerResult {
        let top = self.top();
        if count > top {
            return Err(self.stage_error(BridgeError::host(format!(
                "handler reported {count} results with {top} values on the stack"
            ))));
        }
        Ok(count)
    }
}

/// Restores the stack top on drop.
pub(crate) struct StackGuard {
    state: *mut ffi::lua_State,
    top: c_int,
}

impl StackGuard {
    /// # Safety
    /// `state` must stay live for the guard's lifetime.
    pub unsafe fn new(state: *mut ffi::lua_State) -> Self {
        // SAFETY: guaranteed by the caller.
        let top = unsafe { ffi::lua_gettop(state) };
        Self { state, top }
    }

    pub fn top(&self) -> c_int {
        self.top
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        // SAFETY: the state outlives the guard and only values above `top` are discarded.
        unsafe { ffi::lua_settop(self.state, self.top) };
    }
}

/// Grows the stack by `extra` slots.
///
/// # Safety
/// `state` must be live.
pub(crate) unsafe fn ensure_stack(state: *mut ffi::lua_State, extra: usize) -> Result<(), BridgeError> {
    let extra = c_int::try_from(extra).map_err(|_| BridgeError::StackOverflow)?;
    // SAFETY: guaranteed by the caller.
    if unsafe { ffi::lua_checkstack(state, extra) } == 0 {
        return Err(BridgeError::StackOverflow);
    }
    Ok(())
}

/// Pushes `value` onto `state`.
///
/// # Safety
/// `state` must be a thread of `lua`'s interpreter with a free stack slot.
pub(crate) unsafe fn push_value(lua: &Lua, state: *mut ffi::lua_State, value: &Value) -> Result<(), BridgeError> {
    // SAFETY: guaranteed by the caller.
    unsafe {
        match value {
            Value::Nil => ffi::lua_pushnil(state),
            Value::Boolean(b) => ffi::lua_pushboolean(state, c_int::from(*b)),
            Value::Integer(i) => ffi::lua_pushinteger(state, *i),
            Value::Number(n) => ffi::lua_pushnumber(state, *n),
            Value::String(s) => {
                ffi::lua_pushlstring(state, s.as_ptr().cast(), s.len());
            }
            Value::Bytes(b) => {
                ffi::lua_pushlstring(state, b.as_ptr().cast(), b.len());
            }
            Value::Table(object) | Value::Function(object) | Value::Userdata(object) | Value::Thread(object) => {
                object.push_onto(lua, state)?;
            }
            Value::Host(proxy) => proxy::push_proxy(lua, state, proxy)?,
        }
    }
    Ok(())
}

/// Reads the value at `index` of `state`.
///
/// # Safety
/// `state` must be a thread of `lua`'s interpreter and `index` a valid index.
pub(crate) unsafe fn pull_value(lua: &Lua, state: *mut ffi::lua_State, index: c_int) -> Value {
    // SAFETY: guaranteed by the caller.
    unsafe {
        match ffi::lua_type(state, index) {
            ffi::LUA_TBOOLEAN => Value::Boolean(ffi::lua_toboolean(state, index) != 0),
            ffi::LUA_TNUMBER => {
                if ffi::lua_isinteger(state, index) != 0 {
                    Value::Integer(ffi::lua_tointegerx(state, index, std::ptr::null_mut()))
                } else {
                    Value::Number(ffi::lua_tonumberx(state, index, std::ptr::null_mut()))
                }
            }
            ffi::LUA_TSTRING => {
                let mut len = 0usize;
                let data = ffi::lua_tolstring(state, index, &raw mut len);
                let bytes = std::slice::from_raw_parts(data.cast::<u8>(), len).to_vec();
                if lua.config().autodecode {
                    String::from_utf8(bytes).map_or_else(|error| Value::Bytes(error.into_bytes()), Value::String)
                } else {
                    Value::Bytes(bytes)
                }
            }
            ffi::LUA_TLIGHTUSERDATA => {
                if proxy::is_none_marker(ffi::lua_touserdata(state, index)) {
                    Value::Nil
                } else {
                    Value::Userdata(LuaObject::from_stack(lua, state, index, LuaType::LightUserdata))
                }
            }
            ffi::LUA_TUSERDATA => match proxy::pull_proxy(state, index) {
                Some(proxy) => Value::Host(proxy),
                None => Value::Userdata(LuaObject::from_stack(lua, state, index, LuaType::Userdata)),
            },
            ffi::LUA_TFUNCTION => match proxy::unwrap_function(state, index) {
                Some(proxy) => Value::Host(proxy),
                None => Value::Function(LuaObject::from_stack(lua, state, index, LuaType::Function)),
            },
            ffi::LUA_TTABLE => Value::Table(LuaObject::from_stack(lua, state, index, LuaType::Table)),
            ffi::LUA_TTHREAD => Value::Thread(LuaObject::from_stack(lua, state, index, LuaType::Thread)),
            _ => Value::Nil,
        }
    }
}
