//! Completion dispatcher.
//!
//! Owns the slot pool and is the single entry point engines use to finish an
//! operation. Each issued operation gets a oneshot channel; completing it
//! recycles the slot first and only then resolves the channel, so a waiter
//! that immediately issues more work sees a consistent pool.

use crate::engine::Payload;
use crate::error::{ErrorMapper, StatusError};
use crate::slots::{SlotHandle, SlotPool};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Successful completion: the engine's non-negative result and the buffers
/// that travelled with the operation.
#[derive(Debug)]
pub struct Completed {
    pub result: i32,
    pub payload: Payload,
}

pub type Outcome = Result<Completed, StatusError>;

#[derive(Debug)]
struct DispatchState {
    pool: Mutex<SlotPool<oneshot::Sender<Outcome>>>,
    errors: ErrorMapper,
}

/// Cloneable handle shared by the façade (issue side) and the engine
/// (completion side).
#[derive(Debug, Clone)]
pub struct Dispatcher {
    state: Arc<DispatchState>,
}

impl Dispatcher {
    pub fn new(errors: ErrorMapper, initial_slots: usize) -> Self {
        Self {
            state: Arc::new(DispatchState {
                pool: Mutex::new(SlotPool::with_slots(initial_slots)),
                errors,
            }),
        }
    }

    pub fn errors(&self) -> &ErrorMapper {
        &self.state.errors
    }

    /// Acquire a slot for a new operation.
    pub fn issue(&self) -> (Completion, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let handle = self.state.pool.lock().acquire(tx);
        tracing::trace!(identity = handle.identity(), "issued fs request");
        let completion = Completion {
            dispatcher: self.clone(),
            handle: Some(handle),
        };
        (completion, rx)
    }

    /// Complete the operation owning `handle`.
    ///
    /// The identity is read under the pool lock, so completions racing on
    /// other threads cannot move the slot between lookup and recycle.
    fn complete(&self, handle: &SlotHandle, result: i32, payload: Payload) {
        let (identity, waiter) = self.retire(handle);
        self.deliver(identity, waiter, result, payload);
    }

    /// Recycle the slot and drop its waiter unanswered.
    fn abandon(&self, handle: &SlotHandle) {
        let (identity, waiter) = self.retire(handle);
        if waiter.is_some() {
            tracing::warn!(identity, "fs engine dropped a request without completing it");
        }
    }

    fn retire(&self, handle: &SlotHandle) -> (u32, Option<oneshot::Sender<Outcome>>) {
        let mut pool = self.state.pool.lock();
        let identity = handle.identity();
        (identity, pool.complete(identity))
    }

    /// Complete by raw identity, for engines that keep only the number (see
    /// [`Completion::into_identity`]).
    pub fn on_completion(&self, identity: u32, result: i32, payload: Payload) {
        let waiter = self.state.pool.lock().complete(identity);
        self.deliver(identity, waiter, result, payload);
    }

    fn deliver(
        &self,
        identity: u32,
        waiter: Option<oneshot::Sender<Outcome>>,
        result: i32,
        payload: Payload,
    ) {
        let Some(waiter) = waiter else {
            tracing::warn!(identity, result, "completion for idle fs request slot ignored");
            return;
        };
        tracing::trace!(identity, result, "completed fs request");

        let outcome = if result < 0 {
            Err(self.state.errors.map(result))
        } else {
            Ok(Completed { result, payload })
        };
        if waiter.send(outcome).is_err() {
            tracing::trace!(identity, "fs request waiter went away");
        }
    }

    /// Number of operations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.state.pool.lock().used()
    }

    /// Number of physical slots ever allocated.
    pub fn pool_len(&self) -> usize {
        self.state.pool.lock().len()
    }
}

/// The engine's obligation to finish one issued operation.
///
/// Consumed by [`Completion::complete`]. Dropping it unfinished recycles the
/// slot and fails the caller with [`FsError::Abandoned`](crate::error::FsError::Abandoned),
/// so a request is never left waiting on an engine that lost it.
#[derive(Debug)]
pub struct Completion {
    dispatcher: Dispatcher,
    handle: Option<Arc<SlotHandle>>,
}

impl Completion {
    /// Identity the slot currently answers to.
    pub fn identity(&self) -> Option<u32> {
        self.handle.as_ref().map(|handle| handle.identity())
    }

    pub fn complete(mut self, result: i32, payload: Payload) {
        if let Some(handle) = self.handle.take() {
            self.dispatcher.complete(&handle, result, payload);
        }
    }

    /// Give up the guard and keep only the identity, to be reported later
    /// through [`Dispatcher::on_completion`]. Only valid while no other
    /// completion can move the slot.
    pub fn into_identity(mut self) -> Option<u32> {
        self.handle.take().map(|handle| handle.identity())
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.dispatcher.abandon(&handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[tokio::test]
    async fn completions_resolve_in_any_order() {
        let dispatcher = Dispatcher::new(ErrorMapper::host(), 0);
        let (a, rx_a) = dispatcher.issue();
        let (b, rx_b) = dispatcher.issue();
        let (c, rx_c) = dispatcher.issue();
        assert_eq!(dispatcher.in_flight(), 3);

        b.complete(2, Payload::None);
        c.complete(3, Payload::None);
        a.complete(1, Payload::None);

        assert_eq!(rx_a.await.unwrap().unwrap().result, 1);
        assert_eq!(rx_b.await.unwrap().unwrap().result, 2);
        assert_eq!(rx_c.await.unwrap().unwrap().result, 3);
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(dispatcher.pool_len(), 3);
    }

    #[tokio::test]
    async fn negative_result_is_mapped() {
        let dispatcher = Dispatcher::new(ErrorMapper::host(), 0);
        let (completion, rx) = dispatcher.issue();
        completion.complete(-libc::ENOENT, Payload::None);
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.code, "ENOENT");
        assert_eq!(err.errno, -libc::ENOENT);
    }

    #[tokio::test]
    async fn payload_is_handed_back() {
        let dispatcher = Dispatcher::new(ErrorMapper::host(), 0);
        let (completion, rx) = dispatcher.issue();
        let identity = completion.into_identity().unwrap();
        let buf = BytesMut::from(&b"MIT"[..]);
        dispatcher.on_completion(identity, 3, Payload::Buf(buf));
        let done = rx.await.unwrap().unwrap();
        assert_eq!(&done.payload.into_buf().unwrap()[..], b"MIT");
    }

    #[tokio::test]
    async fn waiter_can_issue_while_resolving() {
        let dispatcher = Dispatcher::new(ErrorMapper::host(), 0);
        let (first, rx) = dispatcher.issue();
        let (_second, _rx2) = dispatcher.issue();
        first.complete(0, Payload::None);
        rx.await.unwrap().unwrap();

        // The freed slot is reused without growing the pool.
        let (third, _rx3) = dispatcher.issue();
        assert_eq!(third.identity(), Some(1));
        assert_eq!(dispatcher.pool_len(), 2);
        assert_eq!(dispatcher.in_flight(), 2);
    }

    #[test]
    fn dropped_waiter_and_idle_identity_are_tolerated() {
        let dispatcher = Dispatcher::new(ErrorMapper::host(), 0);
        let (completion, rx) = dispatcher.issue();
        drop(rx);
        completion.complete(0, Payload::None);
        dispatcher.on_completion(7, 0, Payload::None);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn dropped_completion_fails_the_waiter_and_frees_the_slot() {
        let dispatcher = Dispatcher::new(ErrorMapper::host(), 0);
        let (lost, rx_lost) = dispatcher.issue();
        let (kept, rx_kept) = dispatcher.issue();

        drop(lost);
        assert!(rx_lost.await.is_err());
        assert_eq!(dispatcher.in_flight(), 1);

        // The surviving request moved into the freed position.
        assert_eq!(kept.identity(), Some(0));
        kept.complete(5, Payload::None);
        assert_eq!(rx_kept.await.unwrap().unwrap().result, 5);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[test]
    fn preallocated_slots_are_used_first() {
        let dispatcher = Dispatcher::new(ErrorMapper::host(), 8);
        let _issued: Vec<_> = (0..8).map(|_| dispatcher.issue()).collect();
        assert_eq!(dispatcher.pool_len(), 8);
        let _one_more = dispatcher.issue();
        assert_eq!(dispatcher.pool_len(), 9);
    }
}
