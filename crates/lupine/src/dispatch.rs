//! Protected operator dispatch.
//!
//! Arithmetic, comparison, indexing and `tostring` on interpreter values can run arbitrary
//! metamethods, and therefore raise. The host never runs them on its own stack frames:
//! each family has a native function that performs the raw operation, and the host calls
//! it through `lua_pcall` so any error comes back as a [`BridgeError`].
//!
//! The native functions own no Rust values, so an error unwinding through them has
//! nothing to clean up.

use std::{ffi::c_int, ptr};

use mlua_sys as ffi;

use crate::{
    error::{BridgeError, ContractViolation},
    lua::Lua,
    slots::EntryPoint,
    stack::{StackGuard, ensure_stack, pull_value, push_value},
    value::{MultiValue, Value},
};

/// Operator families that have a dispatch primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr, strum::EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum DispatchFamily {
    Arith,
    Compare,
    Index,
    Tostring,
}

impl DispatchFamily {
    pub(crate) fn function(self) -> ffi::lua_CFunction {
        match self {
            Self::Arith => arith_dispatch,
            Self::Compare => compare_dispatch,
            Self::Index => index_dispatch,
            Self::Tostring => tostring_dispatch,
        }
    }
}

/// Arithmetic and bitwise operators, numbered as `lua_arith` expects.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr, strum::FromRepr, strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
#[repr(i32)]
pub enum ArithOp {
    Add = ffi::LUA_OPADD,
    Sub = ffi::LUA_OPSUB,
    Mul = ffi::LUA_OPMUL,
    Mod = ffi::LUA_OPMOD,
    Pow = ffi::LUA_OPPOW,
    Div = ffi::LUA_OPDIV,
    IDiv = ffi::LUA_OPIDIV,
    BAnd = ffi::LUA_OPBAND,
    BOr = ffi::LUA_OPBOR,
    BXor = ffi::LUA_OPBXOR,
    Shl = ffi::LUA_OPSHL,
    Shr = ffi::LUA_OPSHR,
    Unm = ffi::LUA_OPUNM,
    BNot = ffi::LUA_OPBNOT,
}

impl ArithOp {
    pub fn from_code(code: i32) -> Result<Self, ContractViolation> {
        Self::from_repr(code).ok_or(ContractViolation::InvalidOpcode {
            family: DispatchFamily::Arith,
            code,
        })
    }

    #[must_use]
    pub fn is_unary(self) -> bool {
        matches!(self, Self::Unm | Self::BNot)
    }

    /// Operator as written in source.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub | Self::Unm => "-",
            Self::Mul => "*",
            Self::Mod => "%",
            Self::Pow => "^",
            Self::Div => "/",
            Self::IDiv => "//",
            Self::BAnd => "&",
            Self::BOr => "|",
            Self::BXor | Self::BNot => "~",
            Self::Shl => "<<",
            Self::Shr => ">>",
        }
    }
}

/// Comparison operators, numbered as `lua_compare` expects.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr, strum::FromRepr, strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
#[repr(i32)]
pub enum CompareOp {
    Eq = ffi::LUA_OPEQ,
    Lt = ffi::LUA_OPLT,
    Le = ffi::LUA_OPLE,
}

impl CompareOp {
    pub fn from_code(code: i32) -> Result<Self, ContractViolation> {
        Self::from_repr(code).ok_or(ContractViolation::InvalidOpcode {
            family: DispatchFamily::Compare,
            code,
        })
    }
}

/// Indexing operations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr, strum::FromRepr, strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
#[repr(i32)]
pub enum IndexOp {
    Length = 0,
    Get = 1,
    Set = 2,
}

impl IndexOp {
    pub fn from_code(code: i32) -> Result<Self, ContractViolation> {
        Self::from_repr(code).ok_or(ContractViolation::InvalidOpcode {
            family: DispatchFamily::Index,
            code,
        })
    }

    /// Operands the operation takes, target included.
    #[must_use]
    pub fn arity(self) -> usize {
        match self {
            Self::Length => 1,
            Self::Get => 2,
            Self::Set => 3,
        }
    }
}

fn opcode(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: dispatch primitives are only called with the opcode as argument 1.
    unsafe { ffi::lua_tointegerx(state, 1, ptr::null_mut()) as c_int }
}

/// `(op, a [, b])` -> `a op b`
unsafe extern "C-unwind" fn arith_dispatch(state: *mut ffi::lua_State) -> c_int {
    let code = opcode(state);
    let Some(op) = ArithOp::from_repr(code) else {
        // SAFETY: raising from a native frame that owns nothing.
        return unsafe { ffi::luaL_argerror(state, 1, c"invalid arithmetic opcode".as_ptr()) };
    };
    let operands = if op.is_unary() { 1 } else { 2 };
    // SAFETY: the stack holds the opcode and the operands; `lua_arith` replaces the
    // operands with the result.
    unsafe {
        ffi::lua_settop(state, operands + 1);
        ffi::lua_arith(state, code);
    }
    1
}

/// `(op, a, b)` -> `a op b`
unsafe extern "C-unwind" fn compare_dispatch(state: *mut ffi::lua_State) -> c_int {
    let code = opcode(state);
    if CompareOp::from_repr(code).is_none() {
        // SAFETY: raising from a native frame that owns nothing.
        return unsafe { ffi::luaL_argerror(state, 1, c"invalid comparison opcode".as_ptr()) };
    }
    // SAFETY: the operands are at 2 and 3; a native frame has spare slots for the result.
    unsafe {
        ffi::lua_settop(state, 3);
        let result = ffi::lua_compare(state, 2, 3, code);
        ffi::lua_pushboolean(state, result);
    }
    1
}

/// `(length, t)` -> `#t`, `(get, t, k)` -> `t[k]`, `(set, t, k, v)` -> nothing
unsafe extern "C-unwind" fn index_dispatch(state: *mut ffi::lua_State) -> c_int {
    let Some(op) = IndexOp::from_repr(opcode(state)) else {
        // SAFETY: raising from a native frame that owns nothing.
        return unsafe { ffi::luaL_argerror(state, 1, c"invalid index opcode".as_ptr()) };
    };
    // SAFETY: the target is at 2, followed by the key and value the operation uses.
    unsafe {
        ffi::lua_settop(state, op.arity() as c_int + 1);
        match op {
            IndexOp::Length => {
                ffi::lua_len(state, 2);
                1
            }
            IndexOp::Get => {
                ffi::lua_gettable(state, 2);
                1
            }
            IndexOp::Set => {
                ffi::lua_settable(state, 2);
                0
            }
        }
    }
}

/// `(_, v)` -> `tostring(v)`, formatted by the interpreter itself.
unsafe extern "C-unwind" fn tostring_dispatch(state: *mut ffi::lua_State) -> c_int {
    // SAFETY: the value is at 2; `luaL_tolstring` pushes exactly one string.
    unsafe {
        ffi::lua_settop(state, 2);
        ffi::luaL_tolstring(state, 2, ptr::null_mut());
        1
    }
}

impl Lua {
    fn run_dispatch(&self, family: DispatchFamily, code: i32, operands: &[&Value]) -> Result<MultiValue, BridgeError> {
        let state = self.state()?;
        self.trace(|tracer| tracer.on_dispatch(EntryPoint::Dispatch(family)));
        // SAFETY: `state` is the interpreter's current thread; the guard drops the results
        // once they are read.
        unsafe {
            let guard = StackGuard::new(state);
            ensure_stack(state, operands.len() + 3)?;
            ffi::lua_pushcclosure(state, family.function(), 0);
            ffi::lua_pushinteger(state, ffi::lua_Integer::from(code));
            for operand in operands {
                push_value(self, state, operand)?;
            }
            self.protected_call(state, operands.len() as c_int + 1, ffi::LUA_MULTRET)?;
            ensure_stack(state, 1)?;
            let top = ffi::lua_gettop(state);
            Ok(((guard.top() + 1)..=top).map(|index| pull_value(self, state, index)).collect())
        }
    }

    fn first_result(&self, family: DispatchFamily, code: i32, operands: &[&Value]) -> Result<Value, BridgeError> {
        Ok(self.run_dispatch(family, code, operands)?.into_iter().next().unwrap_or_default())
    }

    /// `lhs op rhs`, metamethods included.
    pub fn arith(&self, op: ArithOp, lhs: &Value, rhs: &Value) -> Result<Value, BridgeError> {
        if op.is_unary() {
            return Err(ContractViolation::ArityMismatch {
                operation: op.into(),
                expected: 1,
            }
            .into());
        }
        self.first_result(DispatchFamily::Arith, op as i32, &[lhs, rhs])
    }

    /// `op operand` for [`ArithOp::Unm`] and [`ArithOp::BNot`].
    pub fn arith_unary(&self, op: ArithOp, operand: &Value) -> Result<Value, BridgeError> {
        if !op.is_unary() {
            return Err(ContractViolation::ArityMismatch {
                operation: op.into(),
                expected: 2,
            }
            .into());
        }
        self.first_result(DispatchFamily::Arith, op as i32, &[operand])
    }

    pub fn compare(&self, op: CompareOp, lhs: &Value, rhs: &Value) -> Result<bool, BridgeError> {
        Ok(self
            .first_result(DispatchFamily::Compare, op as i32, &[lhs, rhs])?
            .is_truthy())
    }

    /// `#target`
    pub fn len(&self, target: &Value) -> Result<Value, BridgeError> {
        self.first_result(DispatchFamily::Index, IndexOp::Length as i32, &[target])
    }

    /// `target[key]`
    pub fn get(&self, target: &Value, key: &Value) -> Result<Value, BridgeError> {
        self.first_result(DispatchFamily::Index, IndexOp::Get as i32, &[target, key])
    }

    /// `target[key] = value`
    pub fn set(&self, target: &Value, key: &Value, value: &Value) -> Result<(), BridgeError> {
        self.run_dispatch(DispatchFamily::Index, IndexOp::Set as i32, &[target, key, value])?;
        Ok(())
    }

    /// `tostring(value)`, with `__tostring` and `__name` honored.
    pub fn tostring(&self, value: &Value) -> Result<String, BridgeError> {
        match self.run_dispatch(DispatchFamily::Tostring, 0, &[value])?.into_iter().next() {
            Some(Value::String(text)) => Ok(text),
            Some(Value::Bytes(bytes)) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            other => Err(BridgeError::host(format!("tostring produced {other:?}"))),
        }
    }

    /// Runs a dispatch primitive with a raw opcode.
    ///
    /// The opcode and operand count are checked before anything reaches the interpreter.
    /// `Tostring` takes opcode 0.
    pub fn dispatch(&self, family: DispatchFamily, code: i32, operands: &[Value]) -> Result<MultiValue, BridgeError> {
        let expected = match family {
            DispatchFamily::Arith => {
                if ArithOp::from_code(code)?.is_unary() {
                    1
                } else {
                    2
                }
            }
            DispatchFamily::Compare => {
                CompareOp::from_code(code)?;
                2
            }
            DispatchFamily::Index => IndexOp::from_code(code)?.arity(),
            DispatchFamily::Tostring if code == 0 => 1,
            DispatchFamily::Tostring => return Err(ContractViolation::InvalidOpcode { family, code }.into()),
        };
        if operands.len() != expected {
            return Err(ContractViolation::ArityMismatch {
                operation: family.into(),
                expected,
            }
            .into());
        }
        let operands: Vec<&Value> = operands.iter().collect();
        self.run_dispatch(family, code, &operands)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn opcodes_match_the_interpreter_numbering() {
        let codes: Vec<i32> = ArithOp::iter().map(|op| op as i32).collect();
        assert_eq!(codes, (0..14).collect::<Vec<_>>());
        assert_eq!(ArithOp::from_code(ffi::LUA_OPIDIV), Ok(ArithOp::IDiv));
        assert_eq!(CompareOp::from_code(ffi::LUA_OPLE), Ok(CompareOp::Le));
    }

    #[test]
    fn unknown_opcodes_are_contract_violations() {
        assert_eq!(
            ArithOp::from_code(99),
            Err(ContractViolation::InvalidOpcode {
                family: DispatchFamily::Arith,
                code: 99
            })
        );
        assert_eq!(
            IndexOp::from_code(-1),
            Err(ContractViolation::InvalidOpcode {
                family: DispatchFamily::Index,
                code: -1
            })
        );
    }

    #[test]
    fn only_negation_operators_are_unary() {
        let unary: Vec<ArithOp> = ArithOp::iter().filter(|op| op.is_unary()).collect();
        assert_eq!(unary, vec![ArithOp::Unm, ArithOp::BNot]);
        assert_eq!(ArithOp::IDiv.to_string(), "idiv");
        assert_eq!(DispatchFamily::Tostring.to_string(), "tostring");
    }

    #[test]
    fn invalid_opcodes_raise_inside_the_interpreter() {
        let cases = [
            (DispatchFamily::Index, 3, "invalid index opcode"),
            (DispatchFamily::Index, -1, "invalid index opcode"),
            (DispatchFamily::Arith, 99, "invalid arithmetic opcode"),
            (DispatchFamily::Compare, 99, "invalid comparison opcode"),
        ];
        // SAFETY: a fresh interpreter, closed at the end; every call is protected.
        unsafe {
            let state = ffi::luaL_newstate();
            assert!(!state.is_null());
            for (family, code, expected) in cases {
                ffi::lua_pushcfunction(state, family.function());
                ffi::lua_pushinteger(state, code);
                ffi::lua_pushinteger(state, 1);
                ffi::lua_pushinteger(state, 2);
                assert_eq!(ffi::lua_pcall(state, 3, 1, 0), ffi::LUA_ERRRUN, "{family} {code}");
                let mut len = 0;
                let text = ffi::lua_tolstring(state, -1, &raw mut len);
                assert!(!text.is_null());
                let message = String::from_utf8_lossy(std::slice::from_raw_parts(text.cast::<u8>(), len));
                assert!(message.contains("bad argument #1"), "{message}");
                assert!(message.contains(expected), "{message}");
                ffi::lua_settop(state, 0);
            }
            ffi::lua_close(state);
        }
    }
}
