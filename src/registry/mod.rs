//! Bounded registry of in-flight operations for one file handle.
//!
//! The registry owns a fixed array of [`OperationSlot`]s and a free-list stack
//! of their indices. A slot's index doubles as the 16-bit tag carried in the
//! kernel's user data, so a completion is matched back to its slot without any
//! lookup structure.
//!
//! # Invariants
//!
//! - a slot index is either on the free stack or marked in use, never both
//! - `in_flight() + free_count() == capacity()` at all times
//! - each slot's future is resolved exactly once per allocation, by either
//!   [`complete_from_event`](OperationRegistry::complete_from_event) or
//!   [`release`](OperationRegistry::release)
//!
//! The registry is not synchronised. Its owning handle only touches it from
//! the event loop thread.

use std::time::{Duration, Instant};

use crate::error::{fatal, Error, Result};
use crate::future::CompletionFuture;
use crate::logging::record_latency;
use crate::operation::OpKind;


/// Largest supported capacity; slot tags must fit in 16 bits.
pub const MAX_CAPACITY: usize = 1 << 16;

/// One reusable entry of the registry.
#[derive(Debug)]
pub struct OperationSlot {
    id: u16,
    in_use: bool,
    op: OpKind,
    correlation_id: Option<u64>,
    submitted_at: Instant,
    future: CompletionFuture,
}

impl OperationSlot {
    fn vacant(id: u16) -> Self {
        Self {
            id,
            in_use: false,
            op: OpKind::Nop,
            correlation_id: None,
            submitted_at: Instant::now(),
            future: CompletionFuture::new(),
        }
    }

    /// Index of the slot, also its wire tag.
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    pub fn op(&self) -> OpKind {
        self.op
    }

    /// User data the reactor accepted the submission under.
    ///
    /// `None` until the reactor has accepted the submission.
    pub fn correlation_id(&self) -> Option<u64> {
        self.correlation_id
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub fn future(&self) -> &CompletionFuture {
        &self.future
    }
}

/// An in-use slot that has outlived the stuck-operation timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StuckOperation {
    pub id: u16,
    pub op: OpKind,
    pub correlation_id: Option<u64>,
    pub age: Duration,
}

/// Fixed-capacity slot registry with O(1) allocate and release.
#[derive(Debug)]
pub struct OperationRegistry {
    slots: Box<[OperationSlot]>,
    free: Vec<u16>,
}

impl OperationRegistry {
    /// Create a registry with `capacity` slots, all free.
    ///
    /// Fails with [`Error::InvalidInput`] unless `1 <= capacity <= 65536`.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(Error::InvalidInput(format!(
                "registry capacity must be in 1..={}, got {}",
                MAX_CAPACITY, capacity
            )));
        }

        let slots = (0..capacity)
            .map(|i| OperationSlot::vacant(i as u16))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // Lowest index on top of the stack.
        let free = (0..capacity).rev().map(|i| i as u16).collect();

        Ok(Self { slots, free })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently in use.
    pub fn in_flight(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// True when no operation is in flight.
    pub fn is_empty(&self) -> bool {
        self.free.len() == self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// Reserve a slot for a new operation of kind `op`.
    ///
    /// The returned slot is in use, has no correlation id yet, carries a fresh
    /// unresolved future and is stamped with the current time.
    pub fn allocate(&mut self, op: OpKind) -> Result<&mut OperationSlot> {
        let id = self.free.pop().ok_or(Error::RegistryFull {
            capacity: self.slots.len(),
        })?;

        let slot = &mut self.slots[id as usize];
        debug_assert!(!slot.in_use, "slot {} on free stack while in use", id);
        slot.in_use = true;
        slot.op = op;
        slot.correlation_id = None;
        slot.submitted_at = Instant::now();
        slot.future.recycle(op);
        Ok(slot)
    }

    /// Record the user data the reactor accepted slot `id` under.
    pub fn set_correlation_id(&mut self, id: u16, correlation_id: u64) -> bool {
        match self.slots.get_mut(id as usize) {
            Some(slot) if slot.in_use => {
                slot.correlation_id = Some(correlation_id);
                true
            }
            _ => false,
        }
    }

    /// Slot `id`, if it exists.
    pub fn slot(&self, id: u16) -> Option<&OperationSlot> {
        self.slots.get(id as usize)
    }

    /// Fail slot `id` with `cause` and return it to the free pool.
    ///
    /// Idempotent: releasing a free or out-of-range slot does nothing and
    /// returns `false`.
    pub fn release(&mut self, id: u16, cause: Error) -> bool {
        let Some(slot) = self.slots.get_mut(id as usize) else {
            return false;
        };
        if !slot.in_use {
            return false;
        }

        if slot.future.fail(cause).is_err() {
            fatal(
                "registry",
                &format!("slot {} ({}) was already resolved at release", id, slot.op),
            );
        }
        slot.in_use = false;
        slot.correlation_id = None;
        self.free.push(id);
        true
    }

    /// Resolve the slot tagged `tag` with a kernel result and free it.
    ///
    /// Events for free or out-of-range slots are stale (the slot was already
    /// released, for example by the watchdog) and are ignored; the return
    /// value reports whether the event was applied.
    pub fn complete_from_event(&mut self, tag: u16, result: i32) -> bool {
        let Some(slot) = self.slots.get_mut(tag as usize) else {
            return false;
        };
        if !slot.in_use {
            crate::log_trace!("registry", "ignoring stale completion for slot {}", tag);
            return false;
        }

        record_latency(slot.op, slot.submitted_at.elapsed());
        if slot.future.complete(result).is_err() {
            fatal(
                "registry",
                &format!("slot {} ({}) completed twice", tag, slot.op),
            );
        }
        slot.in_use = false;
        slot.correlation_id = None;
        self.free.push(tag);
        true
    }

    /// In-use slots older than `timeout` as of now.
    pub fn scan_stuck(&self, timeout: Duration) -> Vec<StuckOperation> {
        self.scan_stuck_at(Instant::now(), timeout)
    }

    /// In-use slots older than `timeout` as of `now`.
    pub fn scan_stuck_at(&self, now: Instant, timeout: Duration) -> Vec<StuckOperation> {
        self.iter()
            .filter_map(|slot| {
                let age = now.saturating_duration_since(slot.submitted_at);
                (age > timeout).then_some(StuckOperation {
                    id: slot.id,
                    op: slot.op,
                    correlation_id: slot.correlation_id,
                    age,
                })
            })
            .collect()
    }

    /// Iterate over in-use slots.
    pub fn iter(&self) -> impl Iterator<Item = &OperationSlot> {
        self.slots.iter().filter(|slot| slot.in_use)
    }

    /// Fail every in-use slot with `cause`.
    pub fn release_all(&mut self, cause: Error) -> usize {
        let ids: Vec<u16> = self.iter().map(|slot| slot.id).collect();
        ids.into_iter()
            .filter(|&id| self.release(id, cause.clone()))
            .count()
    }
}
