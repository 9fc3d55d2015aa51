//! Request slot pool.
//!
//! Every in-flight operation occupies one slot. Busy slots always sit in
//! `[0, used)` and their identities are exactly their positions; idle slots
//! sit in `[used, len)` and are reused before the pool grows. The identity is
//! mirrored into a [`SlotHandle`] the engine holds, because the engine reports
//! completions by identity and identities move when slots are recycled.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Native-visible half of a slot: the identity the engine reports back.
#[derive(Debug)]
pub struct SlotHandle {
    id: AtomicU32,
}

impl SlotHandle {
    fn new(id: u32) -> Self {
        Self {
            id: AtomicU32::new(id),
        }
    }

    /// Identity the slot currently answers to.
    pub fn identity(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    fn set_identity(&self, id: u32) {
        self.id.store(id, Ordering::Release);
    }
}

#[derive(Debug)]
struct Slot<T> {
    handle: Arc<SlotHandle>,
    pending: Option<T>,
}

/// Growable arena of reusable slots, each holding one pending `T` (the
/// completion target) while busy.
#[derive(Debug)]
pub struct SlotPool<T> {
    slots: Vec<Slot<T>>,
    used: usize,
}

impl<T> Default for SlotPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SlotPool<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            used: 0,
        }
    }

    /// Pre-allocate `capacity` idle slots.
    pub fn with_slots(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|n| Slot {
                handle: Arc::new(SlotHandle::new(n as u32)),
                pending: None,
            })
            .collect();
        Self { slots, used: 0 }
    }

    /// Number of busy slots.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Number of physical slots, busy or idle.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_busy(&self, identity: u32) -> bool {
        (identity as usize) < self.used
    }

    /// Mark the slot at the `used` boundary busy, growing the pool if every
    /// slot is taken. Its identity is the pre-increment `used`.
    pub fn acquire(&mut self, pending: T) -> Arc<SlotHandle> {
        let identity = self.used;
        if identity == self.slots.len() {
            tracing::debug!(slots = identity + 1, "growing request slot pool");
            self.slots.push(Slot {
                handle: Arc::new(SlotHandle::new(identity as u32)),
                pending: None,
            });
        }

        let slot = &mut self.slots[identity];
        slot.handle.set_identity(identity as u32);
        slot.pending = Some(pending);
        self.used += 1;
        Arc::clone(&slot.handle)
    }

    /// Retire the busy slot `identity` and hand back its pending target.
    ///
    /// The last busy slot is swapped into the vacated position (and both
    /// handles rewritten) so the busy range stays contiguous. Returns `None`
    /// for identities that are not busy.
    pub fn complete(&mut self, identity: u32) -> Option<T> {
        let position = identity as usize;
        if position >= self.used {
            return None;
        }

        self.used -= 1;
        let boundary = self.used;
        if position != boundary {
            self.slots.swap(position, boundary);
            self.slots[position].handle.set_identity(position as u32);
            self.slots[boundary].handle.set_identity(boundary as u32);
        }

        self.slots[boundary].pending.take()
    }

    /// Pending target of a busy slot.
    pub fn pending(&self, identity: u32) -> Option<&T> {
        if !self.is_busy(identity) {
            return None;
        }
        self.slots[identity as usize].pending.as_ref()
    }
}
