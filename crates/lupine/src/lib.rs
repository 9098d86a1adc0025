#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "stack indices are bounded by the interpreter")]
#![expect(clippy::cast_sign_loss, reason = "stack tops are never negative")]
#![expect(clippy::cast_possible_wrap, reason = "slot and stack counts fit in c_int")]
#![expect(clippy::float_cmp, reason = "the interpreter version is an exact float")]

mod config;
mod dispatch;
mod embed;
mod error;
mod host;
mod iter;
mod lua;
mod object;
mod proxy;
mod runtime;
mod slots;
mod stack;
pub mod tracer;
mod trampoline;
mod translate;
mod value;

pub use mlua_sys as ffi;
pub use smallvec::smallvec;

pub use crate::{
    config::BridgeConfig,
    dispatch::{ArithOp, CompareOp, DispatchFamily, IndexOp},
    embed::{init, init_with, lupine_init},
    error::{BridgeError, ContractViolation, LuaStatus},
    host::{HostError, HostFunction, HostList, HostMap, HostTuple},
    iter::{HostIter, IterAdapter, IterKind, IterStep},
    lua::{Lua, SlotStats},
    object::{LuaObject, LuaType, Resumed},
    proxy::{HostObject, HostRef, Proxy, ProxyKind, ProxyOp, as_attrgetter, as_function, as_itemgetter, autopack},
    runtime::Runtime,
    slots::{EntryPoint, POOL_SIZE, ProxyProtocol, RESERVED_SLOTS, ReservedSlot, SlotId},
    stack::Stack,
    tracer::{
        BridgeTracer, LogTracer, NoopTracer, ProfilingReport, ProfilingTracer, RecordingTracer, StderrTracer,
        TraceEvent,
    },
    trampoline::trampoline,
    translate::{FAILURE_SENTINEL, Handler, HandlerResult, Staged},
    value::{MultiValue, Value},
};
