//! Host objects inside the interpreter.
//!
//! A host object crosses into the interpreter as a full userdata sharing one metatable,
//! whose `__call`, `__tostring`, `__index`, `__newindex` and `__gc` fields are the reserved
//! slot entries, with `__len` and `__pairs` next to them. The userdata owns an `Rc` to the
//! object until it is finalized.
//!
//! The same userdata layout also carries iteration adapters and the guards that release a
//! function's slot, so a single `__gc` entry finalizes everything the bridge allocates.

use std::{
    any::Any,
    cell::RefCell,
    ffi::{CStr, c_int, c_void},
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    rc::Rc,
};

use mlua_sys as ffi;
use smallvec::smallvec;

use crate::{
    error::BridgeError,
    iter::{self, HostIter, IterAdapter, IterKind},
    lua::Lua,
    slots::{ReservedSlot, SlotId},
    stack::{Stack, ensure_stack},
    translate::{HandlerResult, Staged},
    value::{MultiValue, Value},
};

pub(crate) const PROXY_METATABLE: &CStr = c"lupine.HostObject";

static NONE_MARKER: u8 = 0;
static ASFUNC_MARKER: u8 = 0;

/// Light userdata standing for a host `nil` that must not end a generic `for`.
pub(crate) fn none_marker() -> *mut c_void {
    (&raw const NONE_MARKER).cast_mut().cast()
}

pub(crate) fn is_none_marker(pointer: *mut c_void) -> bool {
    std::ptr::eq(pointer, none_marker())
}

fn asfunc_marker() -> *mut c_void {
    (&raw const ASFUNC_MARKER).cast_mut().cast()
}

/// Operations the interpreter can perform on a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
pub enum ProxyOp {
    #[strum(to_string = "attribute access")]
    AttributeAccess,
    #[strum(to_string = "item access")]
    ItemAccess,
    #[strum(to_string = "call")]
    Call,
    #[strum(to_string = "str")]
    Str,
    #[strum(to_string = "length")]
    Length,
    #[strum(to_string = "finalize")]
    Finalize,
}

/// What a bridge userdata carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ProxyKind {
    Attribute,
    Item,
    Function,
    Iterator,
    SlotGuard,
}

/// A host object the interpreter can use through its metamethods.
///
/// Every operation defaults to [`BridgeError::Unsupported`], so implementors only write the
/// ones that make sense. `lua` is the interpreter performing the operation.
///
/// ```
/// use lupine::{BridgeError, HostObject, Lua, Runtime, Value, as_attrgetter};
/// use std::rc::Rc;
///
/// struct Point(i64, i64);
///
/// impl HostObject for Point {
///     fn get_attr(&self, _lua: &Lua, name: &str) -> Result<Value, BridgeError> {
///         match name {
///             "x" => Ok(Value::Integer(self.0)),
///             "y" => Ok(Value::Integer(self.1)),
///             _ => Ok(Value::Nil),
///         }
///     }
/// }
///
/// let runtime = Runtime::new().unwrap();
/// runtime.set_global("p", as_attrgetter(Rc::new(Point(3, 4)))).unwrap();
/// assert_eq!(runtime.eval("p.x + p.y").unwrap(), Value::Integer(7));
/// ```
pub trait HostObject: Any {
    /// Name used in messages.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn call(&self, _lua: &Lua, _args: MultiValue) -> Result<MultiValue, BridgeError> {
        Err(unsupported(self.type_name(), ProxyOp::Call))
    }

    /// Text for `tostring`.
    fn to_display(&self) -> Result<String, BridgeError> {
        Ok(format!("<{} at {:p}>", self.type_name(), self))
    }

    fn get_attr(&self, _lua: &Lua, _name: &str) -> Result<Value, BridgeError> {
        Err(unsupported(self.type_name(), ProxyOp::AttributeAccess))
    }

    fn set_attr(&self, _lua: &Lua, _name: &str, _value: Value) -> Result<(), BridgeError> {
        Err(unsupported(self.type_name(), ProxyOp::AttributeAccess))
    }

    fn get_item(&self, _lua: &Lua, _key: &Value) -> Result<Value, BridgeError> {
        Err(unsupported(self.type_name(), ProxyOp::ItemAccess))
    }

    fn set_item(&self, _lua: &Lua, _key: Value, _value: Value) -> Result<(), BridgeError> {
        Err(unsupported(self.type_name(), ProxyOp::ItemAccess))
    }

    /// Result of `#o`.
    fn length(&self, _lua: &Lua) -> Result<Value, BridgeError> {
        Err(unsupported(self.type_name(), ProxyOp::Length))
    }

    fn iter(&self, _lua: &Lua) -> Result<HostIter, BridgeError> {
        Err(BridgeError::Unsupported {
            type_name: self.type_name(),
            operation: "iteration",
        })
    }

    /// Whether [`iter`](Self::iter) yields `key, value` pairs, so `pairs(o)` passes them
    /// through instead of numbering each item from 0.
    fn is_mapping(&self) -> bool {
        false
    }

    /// Whether [`autopack`] should expose the object with item access.
    fn supports_items(&self) -> bool {
        false
    }
}

impl dyn HostObject {
    /// Downcasts to the concrete host type.
    #[must_use]
    pub fn downcast_ref<T: HostObject>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref()
    }
}

fn unsupported(type_name: &'static str, op: ProxyOp) -> BridgeError {
    BridgeError::Unsupported {
        type_name,
        operation: op.into(),
    }
}

/// Shared reference to a host object.
pub type HostRef = Rc<dyn HostObject>;

/// A host object together with how the interpreter should see it.
#[derive(Clone)]
pub enum Proxy {
    /// Indexing reads and writes attributes.
    Attribute(HostRef),
    /// Indexing reads and writes items.
    Item(HostRef),
    /// Pushed as a plain interpreter function that calls the object.
    Function(HostRef),
}

impl Proxy {
    #[must_use]
    pub fn object(&self) -> &HostRef {
        match self {
            Self::Attribute(object) | Self::Item(object) | Self::Function(object) => object,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ProxyKind {
        match self {
            Self::Attribute(_) => ProxyKind::Attribute,
            Self::Item(_) => ProxyKind::Item,
            Self::Function(_) => ProxyKind::Function,
        }
    }

    #[must_use]
    pub fn downcast_ref<T: HostObject>(&self) -> Option<&T> {
        self.object().downcast_ref()
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && Rc::ptr_eq(self.object(), other.object())
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Proxy::{:?}({})", self.kind(), self.object().type_name())
    }
}

/// Exposes `object` with attribute access.
#[must_use]
pub fn as_attrgetter(object: HostRef) -> Proxy {
    Proxy::Attribute(object)
}

/// Exposes `object` with item access.
#[must_use]
pub fn as_itemgetter(object: HostRef) -> Proxy {
    Proxy::Item(object)
}

/// Exposes `object` as an interpreter function.
#[must_use]
pub fn as_function(object: HostRef) -> Proxy {
    Proxy::Function(object)
}

/// Item access for containers, attribute access otherwise.
#[must_use]
pub fn autopack(object: HostRef) -> Proxy {
    if object.supports_items() {
        Proxy::Item(object)
    } else {
        Proxy::Attribute(object)
    }
}

#[derive(Clone, Copy)]
pub(crate) enum Access {
    Attribute,
    Item,
}

pub(crate) enum ProxyData {
    Object { object: HostRef, access: Access },
    Iterator(Rc<RefCell<IterAdapter>>),
    SlotGuard(SlotId),
}

impl ProxyData {
    fn kind(&self) -> ProxyKind {
        match self {
            Self::Object {
                access: Access::Attribute,
                ..
            } => ProxyKind::Attribute,
            Self::Object {
                access: Access::Item, ..
            } => ProxyKind::Item,
            Self::Iterator(_) => ProxyKind::Iterator,
            Self::SlotGuard(_) => ProxyKind::SlotGuard,
        }
    }
}

/// Userdata payload; `None` once finalized.
type ProxyCell = RefCell<Option<ProxyData>>;

/// # Safety
/// `state` must be a live thread of `lua`'s interpreter with a free stack slot.
unsafe fn push_data(lua: &Lua, state: *mut ffi::lua_State, data: ProxyData) {
    let kind = data.kind();
    // SAFETY: guaranteed by the caller; the interpreter aligns userdata for any Rust type
    // with pointer alignment, and the block is initialized before anything reads it.
    unsafe {
        let cell = ffi::lua_newuserdatauv(state, size_of::<ProxyCell>(), 0).cast::<ProxyCell>();
        cell.write(RefCell::new(Some(data)));
        ffi::luaL_setmetatable(state, PROXY_METATABLE.as_ptr());
    }
    lua.trace(|tracer| tracer.on_proxy_created(kind));
}

/// # Safety
/// `state` must be a live thread of `lua`'s interpreter.
pub(crate) unsafe fn push_proxy(lua: &Lua, state: *mut ffi::lua_State, proxy: &Proxy) -> Result<(), BridgeError> {
    // SAFETY: guaranteed by the caller.
    unsafe {
        ensure_stack(state, 2)?;
        match proxy {
            Proxy::Attribute(object) => push_data(
                lua,
                state,
                ProxyData::Object {
                    object: object.clone(),
                    access: Access::Attribute,
                },
            ),
            Proxy::Item(object) => push_data(
                lua,
                state,
                ProxyData::Object {
                    object: object.clone(),
                    access: Access::Item,
                },
            ),
            Proxy::Function(object) => {
                push_data(
                    lua,
                    state,
                    ProxyData::Object {
                        object: object.clone(),
                        access: Access::Attribute,
                    },
                );
                ffi::lua_pushlightuserdata(state, asfunc_marker());
                ffi::lua_pushcclosure(state, ReservedSlot::AsfuncCall.function(), 2);
            }
        }
    }
    Ok(())
}

/// # Safety
/// `state` must be a live thread of `lua`'s interpreter with a free stack slot.
pub(crate) unsafe fn push_slot_guard(lua: &Lua, state: *mut ffi::lua_State, slot: SlotId) {
    // SAFETY: guaranteed by the caller.
    unsafe { push_data(lua, state, ProxyData::SlotGuard(slot)) };
}

/// # Safety
/// `state` must be a live thread of `lua`'s interpreter with a free stack slot.
pub(crate) unsafe fn push_iterator(lua: &Lua, state: *mut ffi::lua_State, adapter: IterAdapter) {
    // SAFETY: guaranteed by the caller.
    unsafe { push_data(lua, state, ProxyData::Iterator(Rc::new(RefCell::new(adapter)))) };
}

/// # Safety
/// `state` must be live and `index` valid.
unsafe fn cell_at<'a>(state: *mut ffi::lua_State, index: c_int) -> Option<&'a ProxyCell> {
    // SAFETY: guaranteed by the caller; userdata with the proxy metatable always hold an
    // initialized `ProxyCell` and stay alive while they are on the stack.
    unsafe {
        if ffi::lua_checkstack(state, 2) == 0 {
            return None;
        }
        ffi::luaL_testudata(state, index, PROXY_METATABLE.as_ptr())
            .cast::<ProxyCell>()
            .as_ref()
    }
}

/// Host object behind the userdata at `index`.
///
/// # Safety
/// `state` must be live and `index` valid.
pub(crate) unsafe fn pull_proxy(state: *mut ffi::lua_State, index: c_int) -> Option<Proxy> {
    // SAFETY: guaranteed by the caller.
    let cell = unsafe { cell_at(state, index) }?;
    match cell.try_borrow().ok()?.as_ref()? {
        ProxyData::Object {
            object,
            access: Access::Attribute,
        } => Some(Proxy::Attribute(object.clone())),
        ProxyData::Object {
            object,
            access: Access::Item,
        } => Some(Proxy::Item(object.clone())),
        ProxyData::Iterator(_) | ProxyData::SlotGuard(_) => None,
    }
}

/// Host object behind a function created for [`Proxy::Function`].
///
/// # Safety
/// `state` must be live and `index` valid.
pub(crate) unsafe fn unwrap_function(state: *mut ffi::lua_State, index: c_int) -> Option<Proxy> {
    // SAFETY: guaranteed by the caller; every pushed upvalue is popped again.
    unsafe {
        if ffi::lua_iscfunction(state, index) == 0 || ffi::lua_checkstack(state, 3) == 0 {
            return None;
        }
        let index = ffi::lua_absindex(state, index);
        if ffi::lua_getupvalue(state, index, 2).is_null() {
            return None;
        }
        let marked = ffi::lua_touserdata(state, -1) == asfunc_marker();
        ffi::lua_settop(state, -2);
        if !marked || ffi::lua_getupvalue(state, index, 1).is_null() {
            return None;
        }
        let proxy = pull_proxy(state, -1);
        ffi::lua_settop(state, -2);
        proxy.map(|proxy| Proxy::Function(proxy.object().clone()))
    }
}

/// Iteration adapter behind the userdata at `index`.
///
/// # Safety
/// `state` must be live and `index` valid.
pub(crate) unsafe fn iterator_at(state: *mut ffi::lua_State, index: c_int) -> Option<Rc<RefCell<IterAdapter>>> {
    // SAFETY: guaranteed by the caller.
    let cell = unsafe { cell_at(state, index) }?;
    match cell.try_borrow().ok()?.as_ref()? {
        ProxyData::Iterator(adapter) => Some(adapter.clone()),
        _ => None,
    }
}

/// Finalizes the userdata at index 1.
///
/// Drops the host reference; a slot guard also releases its slot. Never raises.
///
/// # Safety
/// `state` must be the state passed to a `__gc` metamethod.
pub(crate) unsafe fn finalize(state: *mut ffi::lua_State) {
    // SAFETY: guaranteed by the caller.
    let Some(cell) = (unsafe { cell_at(state, 1) }) else {
        return;
    };
    let Some(data) = cell.try_borrow_mut().ok().and_then(|mut data| data.take()) else {
        return;
    };
    let finalized = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: the state is live for the duration of the metamethod.
        let Some(lua) = (unsafe { Lua::from_state(state) }) else {
            drop(data);
            return;
        };
        let _scope = lua.enter(state);
        let kind = data.kind();
        if let ProxyData::SlotGuard(slot) = data {
            lua.release_guard(slot);
        }
        drop(data);
        lua.trace(|tracer| tracer.on_proxy_finalized(kind));
    }));
    if finalized.is_err() {
        eprintln!("lupine: host object panicked while being finalized");
    }
}

/// Receiver of a metamethod, with finalized proxies reported as such.
fn receiver(stack: &Stack<'_>) -> Result<(HostRef, Access), Staged> {
    // SAFETY: the receiver of a metamethod is argument 1 of the running native frame.
    let cell = unsafe { cell_at(stack.raw_state(), 1) };
    let data = cell.and_then(|cell| match cell.try_borrow().ok()?.as_ref() {
        Some(ProxyData::Object { object, access }) => Some(Ok((object.clone(), *access))),
        None => Some(Err(BridgeError::Finalized)),
        Some(_) => None,
    });
    match data {
        Some(Ok(receiver)) => Ok(receiver),
        Some(Err(error)) => Err(stack.stage_error(error)),
        None => Err(stack.stage_error(bad_argument(stack, 1))),
    }
}

fn bad_argument(stack: &Stack<'_>, index: usize) -> BridgeError {
    BridgeError::host(format!(
        "bad argument #{index} (host object expected, got {})",
        stack.value(index).type_name()
    ))
}

fn attribute_name(key: &Value) -> Result<&str, BridgeError> {
    match key {
        Value::String(name) => Ok(name),
        Value::Bytes(bytes) => std::str::from_utf8(bytes).map_err(|_| BridgeError::Conversion {
            from: "non-UTF-8 string",
            to: "attribute name",
        }),
        other => Err(BridgeError::Conversion {
            from: other.type_name(),
            to: "attribute name",
        }),
    }
}

pub(crate) fn object_call(stack: &Stack<'_>) -> HandlerResult {
    let (object, _) = receiver(stack)?;
    let results = object
        .call(stack.lua(), stack.values_from(2))
        .map_err(|error| stack.stage_error(error))?;
    stack.returning(results)
}

pub(crate) fn object_str(stack: &Stack<'_>) -> HandlerResult {
    let (object, _) = receiver(stack)?;
    let text = object.to_display().map_err(|error| stack.stage_error(error))?;
    stack.returning(smallvec![Value::String(text)])
}

pub(crate) fn object_getindex(stack: &Stack<'_>) -> HandlerResult {
    let (object, access) = receiver(stack)?;
    let key = stack.value(2);
    let value = match access {
        Access::Attribute => attribute_name(&key).and_then(|name| object.get_attr(stack.lua(), name)),
        Access::Item => object.get_item(stack.lua(), &key),
    }
    .map_err(|error| stack.stage_error(error))?;
    stack.returning(smallvec![value])
}

pub(crate) fn object_setindex(stack: &Stack<'_>) -> HandlerResult {
    let (object, access) = receiver(stack)?;
    let key = stack.value(2);
    let value = stack.value(3);
    match access {
        Access::Attribute => attribute_name(&key).and_then(|name| object.set_attr(stack.lua(), name, value)),
        Access::Item => object.set_item(stack.lua(), key, value),
    }
    .map_err(|error| stack.stage_error(error))?;
    Ok(0)
}

pub(crate) fn object_len(stack: &Stack<'_>) -> HandlerResult {
    let (object, _) = receiver(stack)?;
    let length = object.length(stack.lua()).map_err(|error| stack.stage_error(error))?;
    stack.returning(smallvec![length])
}

pub(crate) fn object_pairs(stack: &Stack<'_>) -> HandlerResult {
    let (object, _) = receiver(stack)?;
    let kind = if object.is_mapping() {
        IterKind::Extended
    } else {
        IterKind::Enumerate { start: 0 }
    };
    iter::push_adapter(stack, &object, kind)
}

pub(crate) fn asfunc_call(stack: &Stack<'_>) -> HandlerResult {
    let state = stack.raw_state();
    // SAFETY: the closure was built by `push_proxy` with the proxy as upvalue 1, and a
    // native frame always has a free slot.
    unsafe {
        ffi::lua_pushvalue(state, ffi::lua_upvalueindex(1));
        ffi::lua_rotate(state, 1, 1);
    }
    object_call(stack)
}

/// The single host object argument of a library function.
pub(crate) fn host_argument(stack: &Stack<'_>, max_args: usize) -> Result<HostRef, Staged> {
    if stack.top() == 0 || stack.top() > max_args {
        return Err(stack.stage_error(BridgeError::host("invalid arguments")));
    }
    match stack.value(1) {
        Value::Host(proxy) => Ok(proxy.object().clone()),
        _ => Err(stack.stage_error(BridgeError::host("not a host object"))),
    }
}

pub(crate) fn as_attrgetter_entry(stack: &Stack<'_>) -> HandlerResult {
    let object = host_argument(stack, 1)?;
    stack.returning(smallvec![Value::Host(Proxy::Attribute(object))])
}

pub(crate) fn as_itemgetter_entry(stack: &Stack<'_>) -> HandlerResult {
    let object = host_argument(stack, 1)?;
    stack.returning(smallvec![Value::Host(Proxy::Item(object))])
}

pub(crate) fn as_function_entry(stack: &Stack<'_>) -> HandlerResult {
    let object = host_argument(stack, 1)?;
    stack.returning(smallvec![Value::Host(Proxy::Function(object))])
}
