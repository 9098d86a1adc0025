//! Iteration adapters for the generic `for`.
//!
//! `host.iter(o)`, `host.iterex(o)` and `host.enumerate(o [, start])` return the triple
//! `(iter_next, adapter, nil)`. Each call of `iter_next` advances the host iterator once
//! and pushes the step's values, or nothing once the iterator is exhausted. A proxy's
//! `__pairs` returns the same triple.

use std::rc::Rc;

use mlua_sys as ffi;
use smallvec::smallvec;

use crate::{
    error::BridgeError,
    host::HostTuple,
    proxy::{self, HostRef, Proxy},
    slots::ReservedSlot,
    stack::{Stack, ensure_stack},
    translate::HandlerResult,
    value::{MultiValue, Value},
};

/// Host-side iterator; each item is the tuple produced by one step.
pub type HostIter = Box<dyn Iterator<Item = Result<MultiValue, BridgeError>>>;

/// How each step is exposed to the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterKind {
    /// One value per step; multi-value items become a tuple.
    Plain,
    /// The full tuple per step.
    Extended,
    /// `index, value`, with the index starting at `start`.
    Enumerate { start: i64 },
}

/// Values produced by one step.
#[derive(Debug, Clone, PartialEq)]
pub struct IterStep {
    pub values: MultiValue,
    /// The first value is `nil` and must be pushed as `host.none` so the loop continues.
    pub leading_none: bool,
}

pub struct IterAdapter {
    source: Option<HostIter>,
    kind: IterKind,
    next_index: i64,
}

impl IterAdapter {
    #[must_use]
    pub fn new(source: HostIter, kind: IterKind) -> Self {
        let next_index = match kind {
            IterKind::Enumerate { start } => start,
            IterKind::Plain | IterKind::Extended => 0,
        };
        Self {
            source: Some(source),
            kind,
            next_index,
        }
    }

    #[must_use]
    pub fn kind(&self) -> IterKind {
        self.kind
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.source.is_none()
    }

    /// Advances the host iterator.
    ///
    /// Returns `Ok(None)` at the end, and on every later call without touching the host
    /// iterator again. An error leaves the adapter usable.
    pub fn advance(&mut self) -> Result<Option<IterStep>, BridgeError> {
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };
        match source.next() {
            Some(item) => Ok(Some(self.shape(item?))),
            None => {
                self.source = None;
                Ok(None)
            }
        }
    }

    fn shape(&mut self, mut values: MultiValue) -> IterStep {
        match self.kind {
            IterKind::Plain => {
                let value = single(values);
                IterStep {
                    leading_none: value.is_nil(),
                    values: smallvec![value],
                }
            }
            IterKind::Extended => {
                if values.is_empty() {
                    values.push(Value::Nil);
                }
                IterStep {
                    leading_none: values[0].is_nil(),
                    values,
                }
            }
            IterKind::Enumerate { .. } => {
                let index = self.next_index;
                self.next_index = index.wrapping_add(1);
                IterStep {
                    values: smallvec![Value::Integer(index), single(values)],
                    leading_none: false,
                }
            }
        }
    }
}

/// Collapses a step tuple into one value.
fn single(values: MultiValue) -> Value {
    match values.len() {
        0 => Value::Nil,
        1 => values.into_iter().next().unwrap_or_default(),
        _ => Value::Host(Proxy::Item(Rc::new(HostTuple::new(values)))),
    }
}

fn adapter_entry(stack: &Stack<'_>, kind: IterKind, max_args: usize) -> HandlerResult {
    let object = proxy::host_argument(stack, max_args)?;
    push_adapter(stack, &object, kind)
}

/// Returns the generic `for` triple driving `object`'s host iterator.
pub(crate) fn push_adapter(stack: &Stack<'_>, object: &HostRef, kind: IterKind) -> HandlerResult {
    let source = object.iter(stack.lua()).map_err(|error| stack.stage_error(error))?;
    let state = stack.raw_state();
    // SAFETY: `state` is the running native frame; three slots are reserved first.
    unsafe {
        ensure_stack(state, 3).map_err(|error| stack.stage_error(error))?;
        ffi::lua_pushcclosure(state, ReservedSlot::IterNext.function(), 0);
        proxy::push_iterator(stack.lua(), state, IterAdapter::new(source, kind));
        ffi::lua_pushnil(state);
    }
    Ok(3)
}

pub(crate) fn iter_entry(stack: &Stack<'_>) -> HandlerResult {
    adapter_entry(stack, IterKind::Plain, 1)
}

pub(crate) fn iterex_entry(stack: &Stack<'_>) -> HandlerResult {
    adapter_entry(stack, IterKind::Extended, 1)
}

pub(crate) fn enumerate_entry(stack: &Stack<'_>) -> HandlerResult {
    let start = match stack.value(2) {
        Value::Nil => 0,
        other => other.to_integer().map_err(|error| stack.stage_error(error))?,
    };
    adapter_entry(stack, IterKind::Enumerate { start }, 2)
}

/// `iter_next(adapter, control)`
pub(crate) fn iter_next_entry(stack: &Stack<'_>) -> HandlerResult {
    // SAFETY: argument 1 of the running native frame.
    let Some(cell) = (unsafe { proxy::iterator_at(stack.raw_state(), 1) }) else {
        return Err(stack.stage_error(BridgeError::host("bad argument #1 (iterator expected)")));
    };
    let Ok(mut adapter) = cell.try_borrow_mut() else {
        return Err(stack.stage_error(BridgeError::host("iterator is already running")));
    };
    let step = adapter.advance();
    drop(adapter);

    match step {
        Ok(None) => Ok(0),
        Ok(Some(step)) => push_step(stack, step),
        Err(error) => Err(stack.stage_error(error)),
    }
}

fn push_step(stack: &Stack<'_>, step: IterStep) -> HandlerResult {
    let count = step.values.len();
    let mut values = step.values.into_iter();
    if step.leading_none {
        values.next();
        let state = stack.raw_state();
        // SAFETY: `state` is the running native frame.
        unsafe {
            ensure_stack(state, 1).map_err(|error| stack.stage_error(error))?;
            ffi::lua_pushlightuserdata(state, proxy::none_marker());
        }
    }
    for value in values {
        stack.push(&value).map_err(|error| stack.stage_error(error))?;
    }
    Ok(count)
}
