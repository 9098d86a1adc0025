//! Trampoline slot registry.
//!
//! The interpreter can only call native function pointers known at compile time, so the
//! bridge ships a fixed pool of [`POOL_SIZE`] trampolines (see [`crate::trampoline`]) and
//! binds host handlers to them at runtime. This module owns the binding table: which slot
//! holds which handler, and which slots are free for reuse.
//!
//! Slots handed out by [`Lua::create_function`](crate::Lua::create_function) are *guarded*:
//! the returned interpreter closure carries a finalizer that releases the slot once the
//! closure is unreachable. Explicitly unbinding a guarded slot drops its handler but keeps
//! the slot *retired* until that finalizer runs, so a stale closure can never reach a newer
//! handler.

use std::{collections::VecDeque, ffi::CStr, fmt};

use strum::EnumCount;

use crate::{dispatch::DispatchFamily, error::ContractViolation, translate::Handler};

/// Number of statically compiled pool trampolines.
pub const POOL_SIZE: usize = 900;

/// Number of fixed-purpose entries installed next to the pool.
pub const RESERVED_SLOTS: usize = ReservedSlot::COUNT;

/// Identity of a pool slot, always in `0..POOL_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u16);

impl SlotId {
    /// Returns the slot with the given index, if it lies inside the pool.
    #[must_use]
    pub fn new(raw: usize) -> Option<Self> {
        if raw < POOL_SIZE {
            u16::try_from(raw).ok().map(Self)
        } else {
            None
        }
    }

    /// Slot for a trampoline index produced by the pool table.
    pub(crate) const fn from_pool_index(raw: usize) -> Self {
        Self(raw as u16)
    }

    /// Returns the raw slot index.
    #[must_use]
    pub fn raw(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

/// Fixed-purpose native entries used by the proxy protocol and iteration adapters.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter, strum::EnumCount, strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum ReservedSlot {
    ObjectCall,
    ObjectStr,
    ObjectGetindex,
    ObjectSetindex,
    ObjectGc,
    AsAttrgetter,
    AsItemgetter,
    AsFunction,
    AsfuncCall,
    Iter,
    Iterex,
    Enumerate,
    IterNext,
}

impl ReservedSlot {
    /// Metatable field this entry is installed under on proxies.
    #[must_use]
    pub fn metamethod(self) -> Option<&'static CStr> {
        match self {
            Self::ObjectCall => Some(c"__call"),
            Self::ObjectStr => Some(c"__tostring"),
            Self::ObjectGetindex => Some(c"__index"),
            Self::ObjectSetindex => Some(c"__newindex"),
            Self::ObjectGc => Some(c"__gc"),
            _ => None,
        }
    }

    /// Field this entry is installed under in the library table.
    #[must_use]
    pub fn library_field(self) -> Option<&'static CStr> {
        match self {
            Self::AsAttrgetter => Some(c"as_attrgetter"),
            Self::AsItemgetter => Some(c"as_itemgetter"),
            Self::AsFunction => Some(c"as_function"),
            Self::Iter => Some(c"iter"),
            Self::Iterex => Some(c"iterex"),
            Self::Enumerate => Some(c"enumerate"),
            _ => None,
        }
    }
}

/// Container protocol metamethods proxies carry next to the reserved entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ProxyProtocol {
    /// `#o`
    ObjectLen,
    /// `pairs(o)`
    ObjectPairs,
}

impl ProxyProtocol {
    /// Metatable field this entry is installed under on proxies.
    #[must_use]
    pub fn metamethod(self) -> &'static CStr {
        match self {
            Self::ObjectLen => c"__len",
            Self::ObjectPairs => c"__pairs",
        }
    }
}

/// Native entry through which control crossed into the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    Pool(SlotId),
    Reserved(ReservedSlot),
    Protocol(ProxyProtocol),
    Dispatch(DispatchFamily),
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pool(slot) => write!(f, "{slot}"),
            Self::Reserved(slot) => write!(f, "{slot}"),
            Self::Protocol(entry) => write!(f, "{entry}"),
            Self::Dispatch(family) => write!(f, "{family}_dispatch"),
        }
    }
}

enum Binding {
    Unbound,
    Bound { handler: Handler, guarded: bool },
    /// Handler dropped; waiting for the closure guard to finalize.
    Retired,
}

/// Binding table for one interpreter.
pub(crate) struct SlotTable {
    bindings: Vec<Binding>,
    free: VecDeque<SlotId>,
}

impl SlotTable {
    /// Creates a table with `capacity` free slots, `capacity <= POOL_SIZE`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(POOL_SIZE);
        Self {
            bindings: (0..capacity).map(|_| Binding::Unbound).collect(),
            free: (0..capacity).map(SlotId::from_pool_index).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.bindings.len()
    }

    /// Slots that are bound or retired.
    pub fn live(&self) -> usize {
        self.bindings.len() - self.free.len()
    }

    /// Binds `handler` to the least recently released slot.
    pub fn bind(&mut self, handler: Handler, guarded: bool) -> Result<SlotId, ContractViolation> {
        let slot = self.free.pop_front().ok_or(ContractViolation::SlotsExhausted {
            capacity: self.capacity(),
        })?;
        self.bindings[slot.raw()] = Binding::Bound { handler, guarded };
        Ok(slot)
    }

    /// Drops the slot's handler, returning it so the caller can drop it outside any borrow.
    pub fn unbind(&mut self, slot: SlotId) -> Result<Handler, ContractViolation> {
        let binding = self
            .bindings
            .get_mut(slot.raw())
            .ok_or(ContractViolation::SlotNotBound { slot })?;
        match std::mem::replace(binding, Binding::Unbound) {
            Binding::Bound { handler, guarded } => {
                if guarded {
                    *binding = Binding::Retired;
                } else {
                    self.free.push_back(slot);
                }
                Ok(handler)
            }
            previous => {
                *binding = previous;
                Err(ContractViolation::SlotNotBound { slot })
            }
        }
    }

    /// Frees a guarded slot once its closure has been finalized.
    pub fn release_guard(&mut self, slot: SlotId) -> Option<Handler> {
        let binding = self.bindings.get_mut(slot.raw())?;
        match std::mem::replace(binding, Binding::Unbound) {
            Binding::Bound { handler, .. } => {
                self.free.push_back(slot);
                Some(handler)
            }
            Binding::Retired => {
                self.free.push_back(slot);
                None
            }
            Binding::Unbound => None,
        }
    }

    pub fn handler(&self, slot: SlotId) -> Option<Handler> {
        match self.bindings.get(slot.raw()) {
            Some(Binding::Bound { handler, .. }) => Some(handler.clone()),
            _ => None,
        }
    }

    /// Unbinds everything, returning the handlers for dropping.
    pub fn clear(&mut self) -> Vec<Handler> {
        let mut handlers = Vec::new();
        for binding in &mut self.bindings {
            if let Binding::Bound { handler, .. } = std::mem::replace(binding, Binding::Unbound) {
                handlers.push(handler);
            }
        }
        self.free = (0..self.bindings.len()).map(SlotId::from_pool_index).collect();
        handlers
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::stack::Stack;

    fn handler() -> Handler {
        Rc::new(|_: &Stack<'_>| Ok(0))
    }

    #[test]
    fn exhaustion_after_capacity_binds() {
        let mut table = SlotTable::new(3);
        for _ in 0..3 {
            table.bind(handler(), false).unwrap();
        }
        assert_eq!(
            table.bind(handler(), false).err(),
            Some(ContractViolation::SlotsExhausted { capacity: 3 })
        );
    }

    #[test]
    fn released_slots_are_reused_first_in_first_out() {
        let mut table = SlotTable::new(3);
        let a = table.bind(handler(), false).unwrap();
        let b = table.bind(handler(), false).unwrap();
        table.unbind(b).unwrap();
        table.unbind(a).unwrap();
        let order: Vec<_> = (0..3).map(|_| table.bind(handler(), false).unwrap().raw()).collect();
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn unbinding_twice_is_rejected() {
        let mut table = SlotTable::new(2);
        let slot = table.bind(handler(), false).unwrap();
        table.unbind(slot).unwrap();
        assert!(matches!(table.unbind(slot), Err(ContractViolation::SlotNotBound { .. })));
        assert!(table.handler(slot).is_none());
    }

    #[test]
    fn retired_slot_waits_for_guard() {
        let mut table = SlotTable::new(1);
        let slot = table.bind(handler(), true).unwrap();
        table.unbind(slot).unwrap();
        assert_eq!(table.live(), 1);
        assert!(table.bind(handler(), true).is_err());
        assert!(table.release_guard(slot).is_none());
        assert_eq!(table.live(), 0);
        assert_eq!(table.bind(handler(), true).unwrap(), slot);
    }

    #[test]
    fn reserved_entries_have_one_role_each() {
        use strum::IntoEnumIterator;

        for slot in ReservedSlot::iter() {
            let roles = usize::from(slot.metamethod().is_some()) + usize::from(slot.library_field().is_some());
            assert!(roles <= 1, "{slot} has {roles} roles");
        }
        assert_eq!(RESERVED_SLOTS, 13);
    }

    #[test]
    fn protocol_metamethods_do_not_shadow_reserved_ones() {
        use strum::IntoEnumIterator;

        let reserved: Vec<&CStr> = ReservedSlot::iter().filter_map(ReservedSlot::metamethod).collect();
        for entry in ProxyProtocol::iter() {
            assert!(!reserved.contains(&entry.metamethod()), "{entry}");
        }
        assert_eq!(EntryPoint::Protocol(ProxyProtocol::ObjectPairs).to_string(), "object_pairs");
    }
}
