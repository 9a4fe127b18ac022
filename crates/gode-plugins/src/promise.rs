//! Promise handles for promise-returning exports.
//!
//! Each promise is an explicit state machine (pending, fulfilled, rejected)
//! with an unbounded list of reactions, so `then` chains work at any depth.
//! Settling and reaction delivery always happen inside queued operations on
//! the host thread. A reaction registered on an already settled promise is
//! queued as well, never run inline.
//!
//! Script-side handles [`retain`](PromiseTable::retain) their promise. A
//! settled record nobody holds is evicted by
//! [`collect_settled`](PromiseTable::collect_settled), which the table also
//! queues on its own every [`SWEEP_INTERVAL`] settlements. Evicted ids report
//! `None` from [`state`](PromiseTable::state); an evicted rejection that was
//! never handled stays listed in [`unhandled_rejections`](PromiseTable::unhandled_rejections).

use gode_kernel::{
    Callable, HostScope, OperationError, PromiseId, QueueSender, ScriptException, Value,
    WorkTicket,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Settlement state of a promise.
#[derive(Debug, Clone, PartialEq)]
pub enum PromiseState {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

impl PromiseState {
    pub fn is_pending(&self) -> bool {
        matches!(self, PromiseState::Pending)
    }
}

/// Handlers attached by `then`/`catch`, plus the promise they produce.
#[derive(Clone)]
struct Reaction {
    on_fulfilled: Option<Callable>,
    on_rejected: Option<Callable>,
    derived: PromiseId,
}

/// Settlements between two automatic sweeps.
pub const SWEEP_INTERVAL: usize = 256;

struct PromiseRecord {
    state: PromiseState,
    reactions: Vec<Reaction>,
    /// Whether anything ever observed this promise's outcome.
    handled: bool,
    /// Live script handles
    handles: usize,
}

impl PromiseRecord {
    fn collectable(&self) -> bool {
        !self.state.is_pending() && self.reactions.is_empty() && self.handles == 0
    }
}

#[derive(Default)]
struct TableInner {
    next_id: u64,
    promises: HashMap<PromiseId, PromiseRecord>,
    /// Evicted rejections nobody handled
    unhandled: BTreeMap<PromiseId, Value>,
    settled_since_sweep: usize,
    sweep_queued: bool,
}

/// All promises owned by one host.
#[derive(Clone)]
pub struct PromiseTable {
    inner: Arc<Mutex<TableInner>>,
    sender: QueueSender,
}

impl PromiseTable {
    pub fn new(sender: QueueSender) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TableInner::default())),
            sender,
        }
    }

    /// A new pending promise.
    pub fn create(&self) -> PromiseId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = PromiseId(inner.next_id);
        inner.promises.insert(
            id,
            PromiseRecord {
                state: PromiseState::Pending,
                reactions: Vec::new(),
                handled: false,
                handles: 0,
            },
        );
        id
    }

    pub fn state(&self, id: PromiseId) -> Option<PromiseState> {
        self.inner.lock().promises.get(&id).map(|r| r.state.clone())
    }

    pub fn contains(&self, id: PromiseId) -> bool {
        self.inner.lock().promises.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().promises.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .promises
            .values()
            .filter(|r| r.state.is_pending())
            .count()
    }

    /// Rejected promises nobody attached a handler to.
    pub fn unhandled_rejections(&self) -> Vec<(PromiseId, Value)> {
        let inner = self.inner.lock();
        let mut rejected: Vec<(PromiseId, Value)> = inner
            .promises
            .iter()
            .filter_map(|(id, r)| match &r.state {
                PromiseState::Rejected(reason) if !r.handled => Some((*id, reason.clone())),
                _ => None,
            })
            .chain(inner.unhandled.iter().map(|(id, reason)| (*id, reason.clone())))
            .collect();
        rejected.sort_by_key(|(id, _)| *id);
        rejected
    }

    /// Record a script handle to `id`. Held promises are never evicted.
    pub fn retain(&self, id: PromiseId) {
        if let Some(record) = self.inner.lock().promises.get_mut(&id) {
            record.handles += 1;
        }
    }

    /// Drop a script handle taken with [`retain`](Self::retain).
    ///
    /// The record is only marked; eviction waits for the next sweep so an id
    /// in flight between script and host stays valid.
    pub fn release(&self, id: PromiseId) {
        if let Some(record) = self.inner.lock().promises.get_mut(&id) {
            record.handles = record.handles.saturating_sub(1);
        }
    }

    /// Evict every settled promise with no reactions and no script handle.
    ///
    /// Call between operations on the host thread. Returns the number evicted.
    pub fn collect_settled(&self) -> usize {
        let evicted: Vec<(PromiseId, PromiseRecord)> = {
            let mut inner = self.inner.lock();
            inner.settled_since_sweep = 0;
            inner.sweep_queued = false;
            let ids: Vec<PromiseId> = inner
                .promises
                .iter()
                .filter(|(_, r)| r.collectable())
                .map(|(id, _)| *id)
                .collect();
            let mut evicted = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(record) = inner.promises.remove(&id) {
                    if let PromiseState::Rejected(reason) = &record.state {
                        if !record.handled {
                            inner.unhandled.insert(id, reason.clone());
                        }
                    }
                    evicted.push((id, record));
                }
            }
            evicted
        };
        // Records may own script closures whose captures hold handles back
        // into this table, so they are dropped with the lock released.
        let count = evicted.len();
        drop(evicted);
        if count > 0 {
            debug!(evicted = count, "collected settled promises");
        }
        count
    }

    /// Register reactions and return the derived promise.
    pub fn then(
        &self,
        id: PromiseId,
        on_fulfilled: Option<Callable>,
        on_rejected: Option<Callable>,
    ) -> PromiseId {
        let derived = self.create();
        self.attach(
            id,
            Reaction {
                on_fulfilled,
                on_rejected,
                derived,
            },
        );
        derived
    }

    /// Fulfil `id` with `value`, adopting it if it is itself a promise.
    ///
    /// Must run on the host thread (inside a queued operation or the script).
    pub fn resolve(&self, id: PromiseId, value: Value) {
        if let Value::Promise(source) = value {
            if source == id {
                self.reject(id, Value::from("promise cannot be resolved with itself"));
                return;
            }
            self.adopt(id, source);
            return;
        }
        self.settle(id, PromiseState::Fulfilled(value));
    }

    pub fn reject(&self, id: PromiseId, reason: Value) {
        self.settle(id, PromiseState::Rejected(reason));
    }

    /// Settle `id` from any thread by queuing the settlement.
    ///
    /// `ticket`, when given, is released once the settlement has run.
    pub fn settle_later(
        &self,
        id: PromiseId,
        outcome: Result<Value, Value>,
        ticket: Option<WorkTicket>,
    ) -> bool {
        let table = self.clone();
        self.sender.submit(format!("promise:{}", id.0), move |_| {
            let _ticket = ticket;
            match outcome {
                Ok(value) => table.resolve(id, value),
                Err(reason) => table.reject(id, reason),
            }
            Ok(())
        })
    }

    /// Drop every promise. Pending reactions are discarded.
    pub fn clear(&self) {
        let records = {
            let mut inner = self.inner.lock();
            inner.unhandled.clear();
            std::mem::take(&mut inner.promises)
        };
        drop(records);
    }

    fn adopt(&self, target: PromiseId, source: PromiseId) {
        self.attach(
            source,
            Reaction {
                on_fulfilled: None,
                on_rejected: None,
                derived: target,
            },
        );
    }

    fn attach(&self, id: PromiseId, reaction: Reaction) {
        let settled = {
            let mut inner = self.inner.lock();
            match inner.promises.get_mut(&id) {
                Some(record) => {
                    record.handled = true;
                    match &record.state {
                        PromiseState::Pending => {
                            record.reactions.push(reaction.clone());
                            None
                        }
                        PromiseState::Fulfilled(v) => Some(Ok(v.clone())),
                        PromiseState::Rejected(e) => Some(Err(e.clone())),
                    }
                }
                None => Some(Err(Value::from(format!("unknown {}", id)))),
            }
        };

        if let Some(outcome) = settled {
            self.schedule(reaction, outcome);
        }
    }

    fn settle(&self, id: PromiseId, state: PromiseState) {
        let (reactions, sweep) = {
            let mut inner = self.inner.lock();
            let Some(record) = inner.promises.get_mut(&id) else {
                debug!(promise = %id, "settling unknown promise, ignoring");
                return;
            };
            if !record.state.is_pending() {
                debug!(promise = %id, "promise already settled, ignoring");
                return;
            }
            record.state = state.clone();
            let reactions = std::mem::take(&mut record.reactions);

            inner.settled_since_sweep += 1;
            let sweep = inner.settled_since_sweep >= SWEEP_INTERVAL && !inner.sweep_queued;
            if sweep {
                inner.sweep_queued = true;
            }
            (reactions, sweep)
        };

        if sweep {
            let table = self.clone();
            self.sender.submit("promise:sweep", move |_| {
                table.collect_settled();
                Ok(())
            });
        }

        let outcome = match state {
            PromiseState::Fulfilled(v) => Ok(v),
            PromiseState::Rejected(e) => Err(e),
            PromiseState::Pending => return,
        };
        for reaction in reactions {
            self.schedule(reaction, outcome.clone());
        }
    }

    fn schedule(&self, reaction: Reaction, outcome: Result<Value, Value>) {
        let table = self.clone();
        self.sender
            .submit(format!("promise:{}:reaction", reaction.derived.0), move |scope| {
                table.run_reaction(scope, reaction, outcome)
            });
    }

    fn run_reaction(
        &self,
        scope: &mut dyn HostScope,
        reaction: Reaction,
        outcome: Result<Value, Value>,
    ) -> Result<(), OperationError> {
        let derived = reaction.derived;
        let handler = match &outcome {
            Ok(_) => reaction.on_fulfilled.as_ref(),
            Err(_) => reaction.on_rejected.as_ref(),
        };

        let Some(handler) = handler else {
            match outcome {
                Ok(value) => self.resolve(derived, value),
                Err(reason) => self.reject(derived, reason),
            }
            return Ok(());
        };

        let argument = match outcome {
            Ok(value) | Err(value) => value,
        };
        match invoke_callable(scope, handler, vec![argument]) {
            Ok(value) => self.resolve(derived, value),
            Err(exc) => {
                warn!(promise = %derived, error = %exc, "promise handler threw");
                self.reject(derived, exc.to_value());
            }
        }
        Ok(())
    }
}

impl fmt::Debug for PromiseTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseTable")
            .field("promises", &self.len())
            .finish()
    }
}

/// Call a script or native callable on the host thread.
pub fn invoke_callable(
    scope: &mut dyn HostScope,
    callable: &Callable,
    args: Vec<Value>,
) -> Result<Value, ScriptException> {
    match callable {
        Callable::Script(function) => scope.call_function(function, args),
        Callable::Native(function) => function
            .call(args)
            .map_err(|e| ScriptException::new(e.message)),
    }
}
