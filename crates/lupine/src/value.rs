use std::{fmt, rc::Rc};

use smallvec::SmallVec;

use crate::{
    error::BridgeError,
    object::LuaObject,
    proxy::{HostObject, Proxy, autopack},
};

/// Values returned from or passed to a call.
pub type MultiValue = SmallVec<[Value; 2]>;

/// Host view of an interpreter value.
///
/// Scalars are copied across; tables, functions, threads and foreign userdata stay inside the
/// interpreter and are reached through a [`LuaObject`] handle. Host objects crossing the
/// other way travel as [`Proxy`] values.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    /// Interpreter string that is not valid UTF-8, or any string when autodecode is off.
    Bytes(Vec<u8>),
    Table(LuaObject),
    Function(LuaObject),
    Userdata(LuaObject),
    Thread(LuaObject),
    Host(Proxy),
}

impl Value {
    /// Wraps a host object with [`autopack`].
    pub fn host(object: impl HostObject) -> Self {
        Self::Host(autopack(Rc::new(object)))
    }

    /// Interpreter type name of the value.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) | Self::Number(_) => "number",
            Self::String(_) | Self::Bytes(_) => "string",
            Self::Table(_) => "table",
            Self::Function(_) => "function",
            Self::Userdata(_) => "userdata",
            Self::Thread(_) => "thread",
            Self::Host(Proxy::Function(_)) => "function",
            Self::Host(_) => "userdata",
        }
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Truthiness as the interpreter sees it: only `nil` and `false` are false.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Self::Nil | Self::Boolean(false))
    }

    #[must_use]
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer value, accepting floats with an exact integer representation.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Number(n) if n.fract() == 0.0 && (*n as i64) as f64 == *n => Some(*n as i64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::String(s) => Some(s.as_bytes()),
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Handle to the interpreter object, for tables, functions, userdata and threads.
    #[must_use]
    pub fn as_object(&self) -> Option<&LuaObject> {
        match self {
            Self::Table(object) | Self::Function(object) | Self::Userdata(object) | Self::Thread(object) => {
                Some(object)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn as_host(&self) -> Option<&Proxy> {
        match self {
            Self::Host(proxy) => Some(proxy),
            _ => None,
        }
    }

    /// Downcasts a host value to its concrete host type.
    #[must_use]
    pub fn downcast_host<T: HostObject>(&self) -> Option<&T> {
        self.as_host().and_then(|proxy| proxy.downcast_ref())
    }

    /// Like [`Value::as_integer`] but with a conversion error.
    pub fn to_integer(&self) -> Result<i64, BridgeError> {
        self.as_integer().ok_or(BridgeError::Conversion {
            from: self.type_name(),
            to: "integer",
        })
    }

    /// Like [`Value::as_str`] but with a conversion error.
    pub fn to_str(&self) -> Result<&str, BridgeError> {
        self.as_str().ok_or(BridgeError::Conversion {
            from: self.type_name(),
            to: "string",
        })
    }
}

impl PartialEq for Value {
    /// Scalars compare by value, interpreter objects and host objects by identity.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Integer(a), Self::Number(b)) | (Self::Number(b), Self::Integer(a)) => *a as f64 == *b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::String(a), Self::Bytes(b)) | (Self::Bytes(b), Self::String(a)) => a.as_bytes() == b.as_slice(),
            (Self::Table(a), Self::Table(b))
            | (Self::Function(a), Self::Function(b))
            | (Self::Userdata(a), Self::Userdata(b))
            | (Self::Thread(a), Self::Thread(b)) => a == b,
            (Self::Host(a), Self::Host(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "nil"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Number(n) if n.is_finite() => write!(f, "{n:?}"),
            Self::Number(n) if n.is_nan() => write!(f, "{}nan", if n.is_sign_negative() { "-" } else { "" }),
            Self::Number(n) => write!(f, "{}inf", if n.is_sign_negative() { "-" } else { "" }),
            Self::String(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            Self::Table(object) | Self::Function(object) | Self::Userdata(object) | Self::Thread(object) => {
                write!(f, "{object}")
            }
            Self::Host(proxy) => match proxy.object().to_display() {
                Ok(text) => write!(f, "{text}"),
                Err(_) => write!(f, "<{}>", proxy.object().type_name()),
            },
        }
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Self::Nil
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<LuaObject> for Value {
    fn from(object: LuaObject) -> Self {
        use crate::object::LuaType;

        match object.kind() {
            LuaType::Table => Self::Table(object),
            LuaType::Function => Self::Function(object),
            LuaType::Thread => Self::Thread(object),
            _ => Self::Userdata(object),
        }
    }
}

impl From<&LuaObject> for Value {
    fn from(object: &LuaObject) -> Self {
        Self::from(object.clone())
    }
}

impl From<Proxy> for Value {
    fn from(proxy: Proxy) -> Self {
        Self::Host(proxy)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Nil, Into::into)
    }
}
