//! Bridge tracing infrastructure.
//!
//! Every crossing of the bridge reports to a [`BridgeTracer`] installed when the bridge is
//! initialized: slot binds, handler dispatch, proxy lifetimes and protected calls.
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | Does nothing (default) |
//! | [`StderrTracer`] | Human-readable crossing log to stderr |
//! | [`LogTracer`] | Structured events through the `tracing` crate |
//! | [`ProfilingTracer`] | Per-entry dispatch counters and slot high-water mark |
//! | [`RecordingTracer`] | Full event recording for tests and post-mortem |
//!
//! The tracer lives inside the interpreter's bridge state, so tracers that collect data
//! share it through a cloneable handle:
//!
//! ```
//! use lupine::{BridgeConfig, RecordingTracer, Runtime};
//!
//! let tracer = RecordingTracer::new();
//! let runtime = Runtime::with_tracer(BridgeConfig::default(), Box::new(tracer.clone())).unwrap();
//! runtime.execute("local x = 1", []).unwrap();
//! assert!(tracer.event_count() > 0);
//! ```

use std::{cell::RefCell, fmt, rc::Rc};

use ahash::AHashMap;

use crate::{
    error::LuaStatus,
    proxy::ProxyKind,
    slots::{EntryPoint, SlotId},
};

/// Trace event emitted at a bridge crossing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// The bridge was installed and its library registered under `library`.
    Init { library: String },
    /// A handler was bound; `live` counts bound and retired slots afterwards.
    Bind { slot: SlotId, live: usize },
    /// A slot was unbound or its guard released.
    Unbind { slot: SlotId, live: usize },
    /// Control crossed into the host through a native entry.
    Dispatch { entry: EntryPoint },
    /// The handler behind `entry` staged an error.
    HandlerFailure { entry: EntryPoint },
    ProxyCreated { kind: ProxyKind },
    ProxyFinalized { kind: ProxyKind },
    /// A host-initiated protected call finished.
    ProtectedCall { nargs: usize, status: LuaStatus },
}

/// Hooks called at every bridge crossing.
///
/// All methods default to no-ops; implementations override what they need. Hooks run on
/// the interpreter's thread, in the middle of a crossing, and must not call back into the
/// interpreter.
pub trait BridgeTracer: fmt::Debug {
    /// Called once the bridge is installed.
    #[inline(always)]
    fn on_init(&mut self, _library: &str) {}

    /// Called after a handler is bound to `slot`.
    ///
    /// # Arguments
    /// * `slot` - The slot just bound
    /// * `live` - Slots in use afterwards, retired slots included
    #[inline(always)]
    fn on_bind(&mut self, _slot: SlotId, _live: usize) {}

    /// Called after a slot is unbound or released by its guard.
    #[inline(always)]
    fn on_unbind(&mut self, _slot: SlotId, _live: usize) {}

    /// Called before a native entry runs its handler.
    ///
    /// This is the hottest hook: it fires for every call from the interpreter into the host.
    #[inline(always)]
    fn on_dispatch(&mut self, _entry: EntryPoint) {}

    /// Called when a handler staged an error.
    #[inline(always)]
    fn on_handler_failure(&mut self, _entry: EntryPoint) {}

    #[inline(always)]
    fn on_proxy_created(&mut self, _kind: ProxyKind) {}

    #[inline(always)]
    fn on_proxy_finalized(&mut self, _kind: ProxyKind) {}

    /// Called after a host-initiated protected call returns.
    #[inline(always)]
    fn on_protected_call(&mut self, _nargs: usize, _status: LuaStatus) {}
}

// ============================================================================
// NoopTracer
// ============================================================================

/// A tracer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl BridgeTracer for NoopTracer {}

// ============================================================================
// StderrTracer
// ============================================================================

/// Tracer that prints every crossing to stderr.
///
/// Output format:
/// ```text
///   +++ BIND   slot 0       live=1
///   >>> slot 0
///   !!! FAIL   slot 0
///   ~~~ PCALL  nargs=1 status=runtime error
/// ```
#[derive(Debug)]
pub struct StderrTracer {
    /// Maximum number of lines to print. None = unlimited.
    limit: Option<usize>,
    count: usize,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self { limit: None, count: 0 }
    }

    /// Creates a tracer that stops printing after `limit` lines.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            count: 0,
        }
    }

    fn line(&mut self, line: fmt::Arguments<'_>) {
        if self.limit.is_some_and(|limit| self.count >= limit) {
            return;
        }
        eprintln!("{line}");
        self.count += 1;
        if let Some(limit) = self.limit
            && self.count == limit
        {
            eprintln!("--- trace limit reached ({limit} lines) ---");
        }
    }
}

impl Default for StderrTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeTracer for StderrTracer {
    fn on_init(&mut self, library: &str) {
        self.line(format_args!("  *** INIT   library={library}"));
    }

    fn on_bind(&mut self, slot: SlotId, live: usize) {
        self.line(format_args!("  +++ BIND   {:<12} live={live}", slot.to_string()));
    }

    fn on_unbind(&mut self, slot: SlotId, live: usize) {
        self.line(format_args!("  --- UNBIND {:<12} live={live}", slot.to_string()));
    }

    #[inline]
    fn on_dispatch(&mut self, entry: EntryPoint) {
        self.line(format_args!("  >>> {entry}"));
    }

    fn on_handler_failure(&mut self, entry: EntryPoint) {
        self.line(format_args!("  !!! FAIL   {entry}"));
    }

    fn on_proxy_created(&mut self, kind: ProxyKind) {
        self.line(format_args!("  ... PROXY  new {kind}"));
    }

    fn on_proxy_finalized(&mut self, kind: ProxyKind) {
        self.line(format_args!("  ... PROXY  gc {kind}"));
    }

    fn on_protected_call(&mut self, nargs: usize, status: LuaStatus) {
        self.line(format_args!("  ~~~ PCALL  nargs={nargs} status={status}"));
    }
}

// ============================================================================
// LogTracer
// ============================================================================

/// Tracer that emits `tracing` events under the `lupine` target.
///
/// Dispatches are logged at `TRACE`, binds and proxy lifetimes at `DEBUG`, handler
/// failures and failed protected calls at `WARN`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracer;

impl BridgeTracer for LogTracer {
    fn on_init(&mut self, library: &str) {
        tracing::info!(target: "lupine", library, "bridge installed");
    }

    fn on_bind(&mut self, slot: SlotId, live: usize) {
        tracing::debug!(target: "lupine", slot = slot.raw(), live, "handler bound");
    }

    fn on_unbind(&mut self, slot: SlotId, live: usize) {
        tracing::debug!(target: "lupine", slot = slot.raw(), live, "handler unbound");
    }

    fn on_dispatch(&mut self, entry: EntryPoint) {
        tracing::trace!(target: "lupine", %entry, "dispatch");
    }

    fn on_handler_failure(&mut self, entry: EntryPoint) {
        tracing::warn!(target: "lupine", %entry, "handler raised");
    }

    fn on_proxy_created(&mut self, kind: ProxyKind) {
        tracing::debug!(target: "lupine", %kind, "proxy created");
    }

    fn on_proxy_finalized(&mut self, kind: ProxyKind) {
        tracing::debug!(target: "lupine", %kind, "proxy finalized");
    }

    fn on_protected_call(&mut self, nargs: usize, status: LuaStatus) {
        if status == LuaStatus::Ok {
            tracing::trace!(target: "lupine", nargs, "protected call");
        } else {
            tracing::warn!(target: "lupine", nargs, %status, "protected call failed");
        }
    }
}

// ============================================================================
// ProfilingTracer
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    dispatches: AHashMap<EntryPoint, u64>,
    failures: u64,
    binds: u64,
    max_live: usize,
    protected_calls: u64,
    proxies_created: u64,
    proxies_finalized: u64,
}

/// Tracer that collects crossing statistics.
///
/// Clones share the same counters; keep one to read [`ProfilingTracer::report`].
#[derive(Debug, Clone, Default)]
pub struct ProfilingTracer {
    counters: Rc<RefCell<Counters>>,
}

/// Summary report from a profiling trace.
#[derive(Debug)]
pub struct ProfilingReport {
    /// Dispatches per native entry, most frequent first.
    pub dispatches: Vec<(EntryPoint, u64)>,
    pub total_dispatches: u64,
    pub failures: u64,
    pub binds: u64,
    /// Highest number of slots in use at once.
    pub max_live: usize,
    pub protected_calls: u64,
    pub proxies_created: u64,
    pub proxies_finalized: u64,
}

impl ProfilingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates a report from the counters collected so far.
    #[must_use]
    pub fn report(&self) -> ProfilingReport {
        let counters = self.counters.borrow();
        let mut dispatches: Vec<_> = counters.dispatches.iter().map(|(&k, &v)| (k, v)).collect();
        dispatches.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.to_string().cmp(&b.0.to_string())));
        ProfilingReport {
            total_dispatches: dispatches.iter().map(|(_, count)| count).sum(),
            dispatches,
            failures: counters.failures,
            binds: counters.binds,
            max_live: counters.max_live,
            protected_calls: counters.protected_calls,
            proxies_created: counters.proxies_created,
            proxies_finalized: counters.proxies_finalized,
        }
    }
}

impl BridgeTracer for ProfilingTracer {
    fn on_bind(&mut self, _slot: SlotId, live: usize) {
        let mut counters = self.counters.borrow_mut();
        counters.binds += 1;
        counters.max_live = counters.max_live.max(live);
    }

    #[inline]
    fn on_dispatch(&mut self, entry: EntryPoint) {
        *self.counters.borrow_mut().dispatches.entry(entry).or_insert(0) += 1;
    }

    fn on_handler_failure(&mut self, _entry: EntryPoint) {
        self.counters.borrow_mut().failures += 1;
    }

    fn on_proxy_created(&mut self, _kind: ProxyKind) {
        self.counters.borrow_mut().proxies_created += 1;
    }

    fn on_proxy_finalized(&mut self, _kind: ProxyKind) {
        self.counters.borrow_mut().proxies_finalized += 1;
    }

    fn on_protected_call(&mut self, _nargs: usize, _status: LuaStatus) {
        self.counters.borrow_mut().protected_calls += 1;
    }
}

impl fmt::Display for ProfilingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Bridge Profiling Report ===")?;
        writeln!(f, "Total dispatches:  {}", self.total_dispatches)?;
        writeln!(f, "Handler failures:  {}", self.failures)?;
        writeln!(f, "Binds:             {}", self.binds)?;
        writeln!(f, "Max live slots:    {}", self.max_live)?;
        writeln!(f, "Protected calls:   {}", self.protected_calls)?;
        writeln!(f, "Proxies created:   {}", self.proxies_created)?;
        writeln!(f, "Proxies finalized: {}", self.proxies_finalized)?;
        writeln!(f)?;
        writeln!(f, "--- Dispatch Frequency ---")?;
        for (entry, count) in &self.dispatches {
            let pct = (*count as f64 / self.total_dispatches as f64) * 100.0;
            writeln!(f, "  {:<20} {count:>10}  ({pct:>5.1}%)", entry.to_string())?;
        }
        Ok(())
    }
}

// ============================================================================
// RecordingTracer
// ============================================================================

/// Tracer that records every event.
///
/// Clones share the same event log.
#[derive(Debug, Clone, Default)]
pub struct RecordingTracer {
    events: Rc<RefCell<Vec<TraceEvent>>>,
    limit: Option<usize>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracer that stops recording after `limit` events.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            events: Rc::new(RefCell::new(Vec::with_capacity(limit.min(1024)))),
            limit: Some(limit),
        }
    }

    /// Snapshot of the events recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.borrow().clone()
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }

    fn record(&self, event: TraceEvent) {
        let mut events = self.events.borrow_mut();
        if self.limit.is_none_or(|limit| events.len() < limit) {
            events.push(event);
        }
    }
}

impl BridgeTracer for RecordingTracer {
    fn on_init(&mut self, library: &str) {
        self.record(TraceEvent::Init {
            library: library.to_owned(),
        });
    }

    fn on_bind(&mut self, slot: SlotId, live: usize) {
        self.record(TraceEvent::Bind { slot, live });
    }

    fn on_unbind(&mut self, slot: SlotId, live: usize) {
        self.record(TraceEvent::Unbind { slot, live });
    }

    fn on_dispatch(&mut self, entry: EntryPoint) {
        self.record(TraceEvent::Dispatch { entry });
    }

    fn on_handler_failure(&mut self, entry: EntryPoint) {
        self.record(TraceEvent::HandlerFailure { entry });
    }

    fn on_proxy_created(&mut self, kind: ProxyKind) {
        self.record(TraceEvent::ProxyCreated { kind });
    }

    fn on_proxy_finalized(&mut self, kind: ProxyKind) {
        self.record(TraceEvent::ProxyFinalized { kind });
    }

    fn on_protected_call(&mut self, nargs: usize, status: LuaStatus) {
        self.record(TraceEvent::ProtectedCall { nargs, status });
    }
}
