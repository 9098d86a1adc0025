//! Ready-made host objects.
//!
//! These cover the common shapes a host hands to scripts: callables, growable lists,
//! string-keyed maps, fixed tuples and errors. Anything else implements
//! [`HostObject`] directly.

use std::{cell::RefCell, fmt::Write as _};

use indexmap::IndexMap;
use smallvec::smallvec;

use crate::{
    error::BridgeError,
    iter::HostIter,
    lua::Lua,
    proxy::HostObject,
    value::{MultiValue, Value},
};

type HostCallback = Box<dyn Fn(&Lua, MultiValue) -> Result<MultiValue, BridgeError>>;

/// Callable host object.
///
/// Unlike [`Lua::create_function`] this does not occupy a trampoline slot; calls go
/// through the proxy's `__call` entry.
pub struct HostFunction {
    name: &'static str,
    callback: HostCallback,
}

impl HostFunction {
    pub fn new(callback: impl Fn(&Lua, MultiValue) -> Result<MultiValue, BridgeError> + 'static) -> Self {
        Self::named("function", callback)
    }

    pub fn named(
        name: &'static str,
        callback: impl Fn(&Lua, MultiValue) -> Result<MultiValue, BridgeError> + 'static,
    ) -> Self {
        Self {
            name,
            callback: Box::new(callback),
        }
    }
}

impl HostObject for HostFunction {
    fn type_name(&self) -> &'static str {
        "HostFunction"
    }

    fn call(&self, lua: &Lua, args: MultiValue) -> Result<MultiValue, BridgeError> {
        (self.callback)(lua, args)
    }

    fn to_display(&self) -> Result<String, BridgeError> {
        Ok(format!("<host function {}>", self.name))
    }
}

/// 0-based index from an item key.
fn position(key: &Value) -> Result<Option<usize>, BridgeError> {
    let index = key.as_integer().ok_or(BridgeError::Conversion {
        from: key.type_name(),
        to: "index",
    })?;
    Ok(usize::try_from(index).ok())
}

fn join(values: &[Value], open: char, close: char) -> String {
    let mut text = String::from(open);
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            text.push_str(", ");
        }
        let _ = write!(text, "{value}");
    }
    text.push(close);
    text
}

fn count(len: usize) -> Result<Value, BridgeError> {
    i64::try_from(len)
        .map(Value::Integer)
        .map_err(|_| BridgeError::host("length does not fit an integer"))
}

fn values_iter(values: Vec<Value>) -> HostIter {
    Box::new(values.into_iter().map(|value| Ok(smallvec![value])))
}

/// Growable list with 0-based item access.
///
/// Reading past the end gives `nil`; writing at the length appends.
#[derive(Debug, Default)]
pub struct HostList {
    items: RefCell<Vec<Value>>,
}

impl HostList {
    pub fn new(items: impl IntoIterator<Item = Value>) -> Self {
        Self {
            items: RefCell::new(items.into_iter().collect()),
        }
    }

    pub fn push(&self, value: impl Into<Value>) {
        self.items.borrow_mut().push(value.into());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    /// Snapshot of the items.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Value> {
        self.items.borrow().clone()
    }
}

impl HostObject for HostList {
    fn type_name(&self) -> &'static str {
        "HostList"
    }

    fn to_display(&self) -> Result<String, BridgeError> {
        Ok(join(&self.items.borrow(), '[', ']'))
    }

    fn get_item(&self, _lua: &Lua, key: &Value) -> Result<Value, BridgeError> {
        let items = self.items.borrow();
        Ok(position(key)?
            .and_then(|index| items.get(index).cloned())
            .unwrap_or_default())
    }

    fn set_item(&self, _lua: &Lua, key: Value, value: Value) -> Result<(), BridgeError> {
        let mut items = self.items.borrow_mut();
        let len = items.len();
        match position(&key)? {
            Some(index) if index < len => items[index] = value,
            Some(index) if index == len => items.push(value),
            _ => return Err(BridgeError::host(format!("list index {key} out of range"))),
        }
        Ok(())
    }

    fn length(&self, _lua: &Lua) -> Result<Value, BridgeError> {
        count(self.len())
    }

    fn iter(&self, _lua: &Lua) -> Result<HostIter, BridgeError> {
        Ok(values_iter(self.to_vec()))
    }

    fn supports_items(&self) -> bool {
        true
    }
}

/// Fixed sequence of values with 0-based item access.
#[derive(Debug, Clone, Default)]
pub struct HostTuple {
    values: Vec<Value>,
}

impl HostTuple {
    pub fn new(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            values: values.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

impl HostObject for HostTuple {
    fn type_name(&self) -> &'static str {
        "HostTuple"
    }

    fn to_display(&self) -> Result<String, BridgeError> {
        Ok(join(&self.values, '(', ')'))
    }

    fn get_item(&self, _lua: &Lua, key: &Value) -> Result<Value, BridgeError> {
        Ok(position(key)?
            .and_then(|index| self.values.get(index).cloned())
            .unwrap_or_default())
    }

    fn length(&self, _lua: &Lua) -> Result<Value, BridgeError> {
        count(self.values.len())
    }

    fn iter(&self, _lua: &Lua) -> Result<HostIter, BridgeError> {
        Ok(values_iter(self.values.clone()))
    }

    fn supports_items(&self) -> bool {
        true
    }
}

/// String-keyed map in insertion order.
///
/// Attribute and item access reach the same entries. Assigning `nil` removes the key;
/// iteration and `pairs` yield `key, value` pairs.
#[derive(Debug, Default)]
pub struct HostMap {
    entries: RefCell<IndexMap<String, Value>>,
}

impl HostMap {
    pub fn new<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self {
            entries: RefCell::new(entries.into_iter().map(|(key, value)| (key.into(), value)).collect()),
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.borrow_mut().insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.borrow().get(key).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    fn store(&self, key: String, value: Value) {
        let mut entries = self.entries.borrow_mut();
        if value.is_nil() {
            entries.shift_remove(&key);
        } else {
            entries.insert(key, value);
        }
    }
}

fn map_key(key: &Value) -> Result<&str, BridgeError> {
    key.to_str().map_err(|_| BridgeError::Conversion {
        from: key.type_name(),
        to: "map key",
    })
}

impl HostObject for HostMap {
    fn type_name(&self) -> &'static str {
        "HostMap"
    }

    fn to_display(&self) -> Result<String, BridgeError> {
        let entries = self.entries.borrow();
        let mut text = String::from("{");
        for (i, (key, value)) in entries.iter().enumerate() {
            if i > 0 {
                text.push_str(", ");
            }
            let _ = write!(text, "{key}: {value}");
        }
        text.push('}');
        Ok(text)
    }

    fn get_attr(&self, _lua: &Lua, name: &str) -> Result<Value, BridgeError> {
        Ok(self.get(name).unwrap_or_default())
    }

    fn set_attr(&self, _lua: &Lua, name: &str, value: Value) -> Result<(), BridgeError> {
        self.store(name.to_owned(), value);
        Ok(())
    }

    fn get_item(&self, _lua: &Lua, key: &Value) -> Result<Value, BridgeError> {
        Ok(self.get(map_key(key)?).unwrap_or_default())
    }

    fn set_item(&self, _lua: &Lua, key: Value, value: Value) -> Result<(), BridgeError> {
        self.store(map_key(&key)?.to_owned(), value);
        Ok(())
    }

    fn length(&self, _lua: &Lua) -> Result<Value, BridgeError> {
        count(self.len())
    }

    fn iter(&self, _lua: &Lua) -> Result<HostIter, BridgeError> {
        let pairs: Vec<(String, Value)> = self
            .entries
            .borrow()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(Box::new(
            pairs
                .into_iter()
                .map(|(key, value)| Ok(smallvec![Value::String(key), value])),
        ))
    }

    fn is_mapping(&self) -> bool {
        true
    }

    fn supports_items(&self) -> bool {
        true
    }
}

/// A host error travelling through the interpreter as an error value.
///
/// Scripts can read its `message`; when it propagates back out of a protected call the
/// host gets the original error back.
#[derive(Debug, Clone)]
pub struct HostError {
    error: BridgeError,
}

impl HostError {
    #[must_use]
    pub fn new(error: BridgeError) -> Self {
        Self { error }
    }

    #[must_use]
    pub fn error(&self) -> &BridgeError {
        &self.error
    }
}

impl HostObject for HostError {
    fn type_name(&self) -> &'static str {
        "HostError"
    }

    fn to_display(&self) -> Result<String, BridgeError> {
        Ok(self.error.to_string())
    }

    fn get_attr(&self, _lua: &Lua, name: &str) -> Result<Value, BridgeError> {
        Ok(match name {
            "message" => Value::String(self.error.to_string()),
            _ => Value::Nil,
        })
    }
}
