use std::{ffi::c_int, fmt, rc::Rc};

use mlua_sys as ffi;

use crate::{
    dispatch::{ArithOp, CompareOp},
    error::{BridgeError, ContractViolation},
    lua::Lua,
    stack::{StackGuard, ensure_stack, pull_value, push_value},
    value::{MultiValue, Value},
};

/// Interpreter value types that live behind a [`LuaObject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum LuaType {
    Table,
    Function,
    #[strum(to_string = "userdata")]
    Userdata,
    #[strum(to_string = "userdata")]
    LightUserdata,
    Thread,
}

/// Result of resuming a coroutine.
#[derive(Debug, Clone, PartialEq)]
pub enum Resumed {
    /// The coroutine yielded these values and can be resumed again.
    Yielded(MultiValue),
    /// The coroutine body returned these values.
    Finished(MultiValue),
}

/// Handle to an interpreter object kept alive through the registry.
///
/// Cloning shares the same registry reference; the reference is released when the last
/// clone drops, unless the interpreter has already been closed. Equality is identity.
#[derive(Clone)]
pub struct LuaObject {
    inner: Rc<ObjectRef>,
}

struct ObjectRef {
    lua: Lua,
    key: c_int,
    kind: LuaType,
    pointer: usize,
}

impl Drop for ObjectRef {
    fn drop(&mut self) {
        if let Ok(state) = self.lua.state() {
            // SAFETY: the interpreter is still open and `key` is a live registry reference.
            unsafe { ffi::luaL_unref(state, ffi::LUA_REGISTRYINDEX, self.key) };
        }
    }
}

impl LuaObject {
    /// References the value at `index`.
    ///
    /// # Safety
    /// `state` must be a thread of `lua`'s interpreter and `index` a valid index.
    pub(crate) unsafe fn from_stack(lua: &Lua, state: *mut ffi::lua_State, index: c_int, kind: LuaType) -> Self {
        // SAFETY: guaranteed by the caller.
        let (key, pointer) = unsafe {
            let pointer = ffi::lua_topointer(state, index) as usize;
            ffi::lua_pushvalue(state, index);
            (ffi::luaL_ref(state, ffi::LUA_REGISTRYINDEX), pointer)
        };
        Self {
            inner: Rc::new(ObjectRef {
                lua: lua.clone(),
                key,
                kind,
                pointer,
            }),
        }
    }

    /// Pushes the referenced value onto `state`.
    ///
    /// # Safety
    /// `state` must be a live thread of `lua`'s interpreter with a free stack slot.
    pub(crate) unsafe fn push_onto(&self, lua: &Lua, state: *mut ffi::lua_State) -> Result<(), BridgeError> {
        if !self.inner.lua.same_interpreter(lua) {
            return Err(ContractViolation::ForeignObject.into());
        }
        // SAFETY: guaranteed by the caller.
        unsafe { ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, ffi::lua_Integer::from(self.inner.key)) };
        Ok(())
    }

    /// Interpreter that owns the object.
    #[must_use]
    pub fn lua(&self) -> &Lua {
        &self.inner.lua
    }

    #[must_use]
    pub fn kind(&self) -> LuaType {
        self.inner.kind
    }

    /// Interpreter type name (`"table"`, `"function"`, ...).
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.inner.kind.into()
    }

    /// Address of the object inside the interpreter, as `lua_topointer` reports it.
    #[must_use]
    pub fn to_pointer(&self) -> usize {
        self.inner.pointer
    }

    /// Calls the object in protected mode and returns all of its results.
    pub fn call(&self, args: impl IntoIterator<Item = Value>) -> Result<MultiValue, BridgeError> {
        let lua = self.lua();
        let args: MultiValue = args.into_iter().collect();
        let state = lua.state()?;
        // SAFETY: `state` is the interpreter's current thread.
        unsafe {
            let guard = StackGuard::new(state);
            ensure_stack(state, args.len() + 2)?;
            self.push_onto(lua, state)?;
            for arg in &args {
                push_value(lua, state, arg)?;
            }
            lua.protected_call(state, args.len() as c_int, ffi::LUA_MULTRET)?;
            ensure_stack(state, 1)?;
            let top = ffi::lua_gettop(state);
            Ok(((guard.top() + 1)..=top).map(|index| pull_value(lua, state, index)).collect())
        }
    }

    /// `self[key]`, honoring `__index`.
    pub fn get(&self, key: impl Into<Value>) -> Result<Value, BridgeError> {
        self.lua().get(&Value::from(self), &key.into())
    }

    /// `self[key] = value`, honoring `__newindex`.
    pub fn set(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<(), BridgeError> {
        self.lua().set(&Value::from(self), &key.into(), &value.into())
    }

    /// `#self`, honoring `__len`.
    pub fn len(&self) -> Result<Value, BridgeError> {
        self.lua().len(&Value::from(self))
    }

    /// Binary arithmetic with `self` as the left operand.
    pub fn arith(&self, op: ArithOp, rhs: impl Into<Value>) -> Result<Value, BridgeError> {
        self.lua().arith(op, &Value::from(self), &rhs.into())
    }

    /// Unary arithmetic (`-self`, `~self`).
    pub fn unary(&self, op: ArithOp) -> Result<Value, BridgeError> {
        self.lua().arith_unary(op, &Value::from(self))
    }

    /// Comparison with `self` as the left operand.
    pub fn compare(&self, op: CompareOp, rhs: impl Into<Value>) -> Result<bool, BridgeError> {
        self.lua().compare(op, &Value::from(self), &rhs.into())
    }

    /// `tostring(self)`.
    pub fn to_display(&self) -> Result<String, BridgeError> {
        self.lua().tostring(&Value::from(self))
    }

    /// Length without metamethods.
    pub fn raw_len(&self) -> Result<usize, BridgeError> {
        let lua = self.lua();
        let state = lua.state()?;
        // SAFETY: `state` is the interpreter's current thread.
        unsafe {
            let _guard = StackGuard::new(state);
            ensure_stack(state, 1)?;
            self.push_onto(lua, state)?;
            Ok(ffi::lua_rawlen(state, -1) as usize)
        }
    }

    /// Raw key/value pairs of a table, in `next` order.
    pub fn pairs(&self) -> Result<Vec<(Value, Value)>, BridgeError> {
        self.expect_table()?;
        let lua = self.lua();
        let state = lua.state()?;
        let mut pairs = Vec::new();
        // SAFETY: `state` is the interpreter's current thread; keys come from `lua_next`
        // itself so traversal cannot raise.
        unsafe {
            let _guard = StackGuard::new(state);
            ensure_stack(state, 4)?;
            self.push_onto(lua, state)?;
            ffi::lua_pushnil(state);
            while ffi::lua_next(state, -2) != 0 {
                pairs.push((pull_value(lua, state, -2), pull_value(lua, state, -1)));
                ffi::lua_settop(state, -2);
            }
        }
        Ok(pairs)
    }

    /// Values at `1..=#self`, read raw.
    pub fn sequence_values(&self) -> Result<Vec<Value>, BridgeError> {
        self.expect_table()?;
        let lua = self.lua();
        let len = self.raw_len()?;
        let state = lua.state()?;
        // SAFETY: `state` is the interpreter's current thread.
        unsafe {
            let _guard = StackGuard::new(state);
            ensure_stack(state, 2)?;
            self.push_onto(lua, state)?;
            Ok((1..=len)
                .map(|index| {
                    ffi::lua_rawgeti(state, -1, index as ffi::lua_Integer);
                    let value = pull_value(lua, state, -1);
                    ffi::lua_settop(state, -2);
                    value
                })
                .collect())
        }
    }

    /// Resumes a coroutine with `args`.
    ///
    /// Host closures called from inside the coroutine run normally; yielding across a host
    /// closure is not supported.
    pub fn resume(&self, args: impl IntoIterator<Item = Value>) -> Result<Resumed, BridgeError> {
        if self.kind() != LuaType::Thread {
            return Err(BridgeError::Conversion {
                from: self.type_name(),
                to: "thread",
            });
        }
        let lua = self.lua();
        let args: MultiValue = args.into_iter().collect();
        let state = lua.state()?;
        // SAFETY: `state` is the interpreter's current thread; the coroutine stays referenced
        // from `state`'s stack until the guard drops.
        unsafe {
            let _guard = StackGuard::new(state);
            ensure_stack(state, 2)?;
            self.push_onto(lua, state)?;
            let thread = ffi::lua_tothread(state, -1);
            if thread == state {
                return Err(BridgeError::host("cannot resume non-suspended coroutine"));
            }
            let status = ffi::lua_status(thread);
            if status != ffi::LUA_YIELD && (status != ffi::LUA_OK || ffi::lua_gettop(thread) == 0) {
                return Err(BridgeError::host("cannot resume dead coroutine"));
            }
            ensure_stack(thread, args.len() + 1)?;
            let before = ffi::lua_gettop(thread);
            for arg in &args {
                if let Err(error) = push_value(lua, thread, arg) {
                    ffi::lua_settop(thread, before);
                    return Err(error);
                }
            }

            let mut results: c_int = 0;
            let status = ffi::lua_resume(thread, state, args.len() as c_int, &raw mut results);
            match status {
                ffi::LUA_OK | ffi::LUA_YIELD => {
                    ensure_stack(thread, 1)?;
                    let top = ffi::lua_gettop(thread);
                    let values = ((top - results + 1)..=top)
                        .map(|index| pull_value(lua, thread, index))
                        .collect();
                    ffi::lua_settop(thread, top - results);
                    Ok(if status == ffi::LUA_YIELD {
                        Resumed::Yielded(values)
                    } else {
                        Resumed::Finished(values)
                    })
                }
                failed => {
                    let payload = pull_value(lua, thread, -1);
                    let traceback = lua.thread_traceback(state, thread);
                    Err(lua.failure(failed, payload, traceback))
                }
            }
        }
    }

    fn expect_table(&self) -> Result<(), BridgeError> {
        if self.kind() == LuaType::Table {
            Ok(())
        } else {
            Err(BridgeError::Conversion {
                from: self.type_name(),
                to: "table",
            })
        }
    }
}

impl PartialEq for LuaObject {
    fn eq(&self, other: &Self) -> bool {
        self.inner.lua.same_interpreter(&other.inner.lua) && self.inner.pointer == other.inner.pointer
    }
}

impl fmt::Debug for LuaObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LuaObject")
            .field("kind", &self.inner.kind)
            .field("pointer", &format_args!("{:#x}", self.inner.pointer))
            .finish_non_exhaustive()
    }
}

impl fmt::Display for LuaObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#x}", self.type_name(), self.inner.pointer)
    }
}
