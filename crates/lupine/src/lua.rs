use std::{
    cell::{Cell, RefCell},
    ffi::{CString, c_int, c_void},
    ptr,
    rc::Rc,
};

use mlua_sys as ffi;

use crate::{
    config::BridgeConfig,
    error::{BridgeError, ContractViolation, LuaStatus},
    host::HostError,
    object::{LuaObject, LuaType},
    proxy,
    slots::{SlotId, SlotTable},
    stack::{Stack, StackGuard, ensure_stack, pull_value, push_value},
    tracer::BridgeTracer,
    trampoline::trampoline,
    translate::Handler,
    value::{MultiValue, Value},
};

static ANCHOR_KEY: u8 = 0;
static LIBRARY_KEY: u8 = 0;

pub(crate) fn anchor_key() -> *const c_void {
    (&raw const ANCHOR_KEY).cast()
}

pub(crate) fn library_key() -> *const c_void {
    (&raw const LIBRARY_KEY).cast()
}

/// Userdata stored in the registry; owns the bridge state for the interpreter's lifetime.
pub(crate) type Anchor = Option<Rc<Shared>>;

/// Per-interpreter bridge state.
pub(crate) struct Shared {
    /// Main thread; null once the interpreter is closed.
    main: Cell<*mut ffi::lua_State>,
    /// Thread the host is currently running on: the main thread, or the coroutine whose
    /// trampoline is executing.
    current: Cell<*mut ffi::lua_State>,
    slots: RefCell<SlotTable>,
    config: BridgeConfig,
    tracer: RefCell<Box<dyn BridgeTracer>>,
    traceback: RefCell<Option<String>>,
}

/// Slot usage of one interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStats {
    pub live: usize,
    pub capacity: usize,
}

/// Handle to an interpreter with the bridge installed.
///
/// Handles are cheap to clone and do not own the interpreter: an owned interpreter is
/// closed by dropping its [`Runtime`](crate::Runtime), an embedded one by whoever created it.
/// Every operation on a closed interpreter fails with [`ContractViolation::Closed`].
#[derive(Clone)]
pub struct Lua {
    pub(crate) shared: Rc<Shared>,
}

/// Restores the previous current thread on drop.
pub(crate) struct ThreadScope<'a> {
    shared: &'a Shared,
    previous: *mut ffi::lua_State,
}

impl Drop for ThreadScope<'_> {
    fn drop(&mut self) {
        self.shared.current.set(self.previous);
    }
}

impl Lua {
    pub(crate) fn new(main: *mut ffi::lua_State, config: BridgeConfig, tracer: Box<dyn BridgeTracer>) -> Self {
        Self {
            shared: Rc::new(Shared {
                main: Cell::new(main),
                current: Cell::new(main),
                slots: RefCell::new(SlotTable::new(config.slot_capacity)),
                config,
                tracer: RefCell::new(tracer),
                traceback: RefCell::new(None),
            }),
        }
    }

    /// Finds the bridge installed in `state`'s interpreter.
    ///
    /// # Safety
    /// `state` must be a live thread with a free stack slot.
    pub(crate) unsafe fn from_state(state: *mut ffi::lua_State) -> Option<Self> {
        // SAFETY: guaranteed by the caller; the anchor userdata holds an initialized `Anchor`.
        unsafe {
            ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, anchor_key());
            let anchor = ffi::lua_touserdata(state, -1).cast::<Anchor>();
            let shared = if anchor.is_null() { None } else { (*anchor).clone() };
            ffi::lua_settop(state, -2);
            shared.map(|shared| Self { shared })
        }
    }

    /// Thread to run host-initiated operations on.
    pub(crate) fn state(&self) -> Result<*mut ffi::lua_State, BridgeError> {
        let current = self.shared.current.get();
        if current.is_null() {
            Err(ContractViolation::Closed.into())
        } else {
            Ok(current)
        }
    }

    /// Makes `state` the current thread until the scope drops.
    pub(crate) fn enter(&self, state: *mut ffi::lua_State) -> ThreadScope<'_> {
        ThreadScope {
            shared: &self.shared,
            previous: self.shared.current.replace(state),
        }
    }

    pub(crate) fn trace(&self, hook: impl FnOnce(&mut dyn BridgeTracer)) {
        if let Ok(mut tracer) = self.shared.tracer.try_borrow_mut() {
            hook(tracer.as_mut());
        }
    }

    pub(crate) fn same_interpreter(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn record_traceback(&self, traceback: String) {
        *self.shared.traceback.borrow_mut() = Some(traceback);
    }

    fn take_traceback(&self) -> Option<String> {
        self.shared.traceback.borrow_mut().take()
    }

    /// Converts a failed call's status and payload into a host error.
    ///
    /// A [`HostError`] payload gives back the host error it was staged from.
    pub(crate) fn failure(&self, status: c_int, payload: Value, traceback: Option<String>) -> BridgeError {
        if let Some(error) = payload.downcast_host::<HostError>() {
            return error.error().clone();
        }
        BridgeError::Runtime {
            status: LuaStatus::from_code(status),
            payload,
            traceback,
        }
    }

    /// Runs `lua_pcall` on the function and arguments on top of `state`.
    ///
    /// # Safety
    /// `state` must be a live thread of this interpreter holding a function and `nargs`
    /// arguments on top.
    pub(crate) unsafe fn protected_call(
        &self,
        state: *mut ffi::lua_State,
        nargs: c_int,
        nresults: c_int,
    ) -> Result<(), BridgeError> {
        // SAFETY: guaranteed by the caller.
        unsafe {
            let function = ffi::lua_gettop(state) - nargs;
            let handler = if self.config().capture_traceback {
                ffi::lua_pushcclosure(state, crate::trampoline::capture_traceback, 0);
                ffi::lua_rotate(state, function, 1);
                function
            } else {
                0
            };
            self.take_traceback();
            let status = ffi::lua_pcall(state, nargs, nresults, handler);
            if handler != 0 {
                ffi::lua_rotate(state, handler, -1);
                ffi::lua_settop(state, -2);
            }
            self.trace(|tracer| tracer.on_protected_call(nargs as usize, LuaStatus::from_code(status)));
            if status == ffi::LUA_OK {
                return Ok(());
            }
            let payload = pull_value(self, state, -1);
            ffi::lua_settop(state, -2);
            Err(self.failure(status, payload, self.take_traceback()))
        }
    }

    /// Traceback of a failed coroutine, when capture is enabled.
    ///
    /// # Safety
    /// `state` and `thread` must be live threads of this interpreter.
    pub(crate) unsafe fn thread_traceback(
        &self,
        state: *mut ffi::lua_State,
        thread: *mut ffi::lua_State,
    ) -> Option<String> {
        if !self.config().capture_traceback {
            return None;
        }
        // SAFETY: guaranteed by the caller.
        unsafe {
            ensure_stack(state, 1).ok()?;
            ffi::luaL_traceback(state, thread, ptr::null(), 0);
            let traceback = pull_value(self, state, -1);
            ffi::lua_settop(state, -2);
            traceback.as_str().map(str::to_owned)
        }
    }

    /// Closes the interpreter if this bridge owns its main thread.
    pub(crate) fn close(&self) {
        let main = self.shared.main.replace(ptr::null_mut());
        self.shared.current.set(ptr::null_mut());
        if !main.is_null() {
            // SAFETY: `main` was created by `luaL_newstate` and is closed exactly once.
            unsafe { ffi::lua_close(main) };
        }
    }

    /// Marks the interpreter as gone and drops every handler.
    pub(crate) fn detach(&self) {
        self.shared.main.set(ptr::null_mut());
        self.shared.current.set(ptr::null_mut());
        let handlers = self.shared.slots.borrow_mut().clear();
        drop(handlers);
    }

    /// Configuration the bridge was installed with.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.current.get().is_null()
    }

    /// Binds `handler` to a free slot. The slot stays bound until [`Lua::unbind`].
    pub fn bind(&self, handler: Handler) -> Result<SlotId, BridgeError> {
        self.bind_slot(handler, false)
    }

    fn bind_slot(&self, handler: Handler, guarded: bool) -> Result<SlotId, BridgeError> {
        self.state()?;
        let slot = self.shared.slots.borrow_mut().bind(handler, guarded)?;
        let live = self.shared.slots.borrow().live();
        self.trace(|tracer| tracer.on_bind(slot, live));
        Ok(slot)
    }

    /// Drops the handler bound to `slot`.
    ///
    /// Interpreter calls through the slot fail from now on. A slot owned by a function
    /// from [`Lua::create_function`] is only reused once that function is collected.
    pub fn unbind(&self, slot: SlotId) -> Result<(), BridgeError> {
        let handler = self.shared.slots.borrow_mut().unbind(slot)?;
        let live = self.shared.slots.borrow().live();
        self.trace(|tracer| tracer.on_unbind(slot, live));
        drop(handler);
        Ok(())
    }

    pub(crate) fn release_guard(&self, slot: SlotId) {
        let handler = self.shared.slots.borrow_mut().release_guard(slot);
        let live = self.shared.slots.borrow().live();
        self.trace(|tracer| tracer.on_unbind(slot, live));
        drop(handler);
    }

    pub(crate) fn handler(&self, slot: SlotId) -> Option<Handler> {
        self.shared.slots.borrow().handler(slot)
    }

    #[must_use]
    pub fn slot_stats(&self) -> SlotStats {
        let slots = self.shared.slots.borrow();
        SlotStats {
            live: slots.live(),
            capacity: slots.capacity(),
        }
    }

    /// Interpreter function calling the trampoline of `slot` directly.
    ///
    /// Nothing ties the slot to the function: after [`Lua::unbind`] the function raises
    /// "slot N is not bound", and once the slot is rebound it reaches the new handler.
    pub fn slot_function(&self, slot: SlotId) -> Result<LuaObject, BridgeError> {
        let state = self.state()?;
        // SAFETY: `state` is the interpreter's current thread.
        unsafe {
            let _guard = StackGuard::new(state);
            ensure_stack(state, 1)?;
            ffi::lua_pushcclosure(state, trampoline(slot), 0);
            Ok(LuaObject::from_stack(self, state, -1, LuaType::Function))
        }
    }

    /// Creates an interpreter function backed by a raw handler.
    ///
    /// The handler occupies a slot until the function is garbage collected.
    pub fn create_raw_function(&self, handler: Handler) -> Result<LuaObject, BridgeError> {
        let state = self.state()?;
        // SAFETY: `state` is the interpreter's current thread.
        unsafe {
            let _guard = StackGuard::new(state);
            ensure_stack(state, 3)?;
            let slot = self.bind_slot(handler, true)?;
            proxy::push_slot_guard(self, state, slot);
            ffi::lua_pushcclosure(state, trampoline(slot), 1);
            Ok(LuaObject::from_stack(self, state, -1, LuaType::Function))
        }
    }

    /// Creates an interpreter function that calls `function` with its arguments.
    ///
    /// Returning `Err` raises inside the interpreter; see [`Stack::stage_error`].
    ///
    /// ```
    /// let runtime = lupine::Runtime::new().unwrap();
    /// let double = runtime
    ///     .create_function(|_, args| {
    ///         let n = args.first().map_or(Ok(0), lupine::Value::to_integer)?;
    ///         Ok(lupine::smallvec![lupine::Value::Integer(n * 2)])
    ///     })
    ///     .unwrap();
    /// runtime.set_global("double", double).unwrap();
    /// assert_eq!(runtime.eval("double(21)").unwrap(), lupine::Value::Integer(42));
    /// ```
    pub fn create_function<F>(&self, function: F) -> Result<LuaObject, BridgeError>
    where
        F: Fn(&Self, MultiValue) -> Result<MultiValue, BridgeError> + 'static,
    {
        self.create_raw_function(Rc::new(move |stack: &Stack<'_>| {
            match function(stack.lua(), stack.arguments()) {
                Ok(results) => stack.returning(results),
                Err(error) => Err(stack.stage_error(error)),
            }
        }))
    }

    /// Compiles `source` into a function without running it.
    pub fn load(&self, source: impl AsRef<[u8]>, chunk_name: &str) -> Result<LuaObject, BridgeError> {
        let source = source.as_ref();
        let name = CString::new(format!("={chunk_name}"))?;
        let state = self.state()?;
        // SAFETY: `state` is the interpreter's current thread; the buffer outlives the call.
        unsafe {
            let _guard = StackGuard::new(state);
            ensure_stack(state, 1)?;
            let status = ffi::luaL_loadbufferx(state, source.as_ptr().cast(), source.len(), name.as_ptr(), ptr::null());
            let loaded = pull_value(self, state, -1);
            match (status, loaded) {
                (ffi::LUA_OK, Value::Function(function)) => Ok(function),
                (ffi::LUA_ERRSYNTAX, message) => Err(BridgeError::Syntax {
                    message: message.to_string(),
                }),
                (status, payload) => Err(self.failure(status, payload, None)),
            }
        }
    }

    /// Runs a chunk and returns its results.
    pub fn execute(&self, source: &str, args: impl IntoIterator<Item = Value>) -> Result<MultiValue, BridgeError> {
        self.load(source, "lupine")?.call(args)
    }

    /// Evaluates an expression and returns its first result (`nil` if there is none).
    pub fn eval(&self, expression: &str) -> Result<Value, BridgeError> {
        let results = self.load(format!("return {expression}"), "lupine")?.call([])?;
        Ok(results.into_iter().next().unwrap_or_default())
    }

    /// The global table.
    pub fn globals(&self) -> Result<LuaObject, BridgeError> {
        self.registry_object(|state| {
            // SAFETY: reads a predefined registry slot.
            unsafe { ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, ffi::lua_Integer::from(ffi::LUA_RIDX_GLOBALS)) };
        })
    }

    /// The bridge library table (`host` unless configured otherwise).
    pub fn library(&self) -> Result<LuaObject, BridgeError> {
        self.registry_object(|state| {
            // SAFETY: the library is stored under its registry key during initialization.
            unsafe { ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, library_key()) };
        })
    }

    fn registry_object(&self, push: impl FnOnce(*mut ffi::lua_State)) -> Result<LuaObject, BridgeError> {
        let state = self.state()?;
        // SAFETY: `state` is the interpreter's current thread.
        unsafe {
            let _guard = StackGuard::new(state);
            ensure_stack(state, 2)?;
            push(state);
            match pull_value(self, state, -1) {
                Value::Table(table) => Ok(table),
                other => Err(BridgeError::Conversion {
                    from: other.type_name(),
                    to: "table",
                }),
            }
        }
    }

    pub fn get_global(&self, name: &str) -> Result<Value, BridgeError> {
        self.globals()?.get(name)
    }

    pub fn set_global(&self, name: &str, value: impl Into<Value>) -> Result<(), BridgeError> {
        self.globals()?.set(name, value)
    }

    /// Creates an empty table.
    pub fn create_table(&self) -> Result<LuaObject, BridgeError> {
        self.sequence([])
    }

    /// Creates a table with `values` at `1..=n`.
    pub fn sequence(&self, values: impl IntoIterator<Item = Value>) -> Result<LuaObject, BridgeError> {
        let state = self.state()?;
        // SAFETY: `state` is the interpreter's current thread; integer keys cannot make a raw
        // set raise.
        unsafe {
            let _guard = StackGuard::new(state);
            ensure_stack(state, 3)?;
            ffi::lua_createtable(state, 0, 0);
            for (index, value) in values.into_iter().enumerate() {
                push_value(self, state, &value)?;
                ffi::lua_rawseti(state, -2, index as ffi::lua_Integer + 1);
            }
            Ok(LuaObject::from_stack(self, state, -1, LuaType::Table))
        }
    }

    /// Creates a table from key/value pairs.
    pub fn table_from<K, V>(&self, pairs: impl IntoIterator<Item = (K, V)>) -> Result<LuaObject, BridgeError>
    where
        K: Into<Value>,
        V: Into<Value>,
    {
        let table = self.create_table()?;
        for (key, value) in pairs {
            table.set(key, value)?;
        }
        Ok(table)
    }

    /// Creates a coroutine running `function`.
    pub fn create_thread(&self, function: &LuaObject) -> Result<LuaObject, BridgeError> {
        let state = self.state()?;
        // SAFETY: `state` is the interpreter's current thread.
        unsafe {
            let _guard = StackGuard::new(state);
            ensure_stack(state, 3)?;
            let thread = ffi::lua_newthread(state);
            function.push_onto(self, state)?;
            ffi::lua_xmove(state, thread, 1);
            Ok(LuaObject::from_stack(self, state, -1, LuaType::Thread))
        }
    }

    /// Runs a full garbage-collection cycle, finalizing unreachable proxies and functions.
    pub fn collect_garbage(&self) -> Result<(), BridgeError> {
        let state = self.state()?;
        // SAFETY: `state` is the interpreter's current thread.
        unsafe { ffi::lua_gc(state, ffi::LUA_GCCOLLECT, 0) };
        Ok(())
    }
}

impl std::fmt::Debug for Lua {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lua")
            .field("main", &self.shared.main.get())
            .field("slots", &self.slot_stats())
            .finish_non_exhaustive()
    }
}
