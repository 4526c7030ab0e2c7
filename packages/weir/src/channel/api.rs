// exposed API of channels

use self::future::*;
use super::{
    core::{self, PutCancel, PutStep, TakeStep},
    error::*,
};
use crate::pipeline::Pipeline;


/// Create a channel with the given buffer capacity
///
/// Capacity 0 creates a rendezvous channel: a put cannot complete until a matching take is
/// ready, and vice versa.
pub fn channel<T>(cap: usize) -> Channel<T> {
    Channel(core::Chan::new(cap, Pipeline::new()))
}

/// Create a channel whose buffer is decorated with a transform pipeline
///
/// The pipeline runs on every value as it enters the buffer, before the value becomes
/// visible to any take. Panics if `cap` is 0: a pipeline needs a buffer to enter.
pub fn channel_with<T>(cap: usize, pipeline: Pipeline<T>) -> Channel<T> {
    Channel(core::Chan::new(cap, pipeline))
}

/// Handle to a channel
///
/// Cheap to clone; all clones address the same channel. Routines suspend at `put`/`take`;
/// foreign threads use the blocking or try variants instead.
pub struct Channel<T>(pub(crate) core::Chan<T>);

impl<T> Channel<T> {
    /// Create a future to put a value into this channel
    ///
    /// See the API of [`PutFut`]: besides being awaited inside a routine, it can block the
    /// calling thread, try to resolve immediately, or be rescinded.
    pub fn put(&self, value: T) -> PutFut<T> {
        PutFut {
            chan: self.0.clone(),
            state: PutState::Init(value),
        }
    }

    /// Create a future to take a value from this channel
    ///
    /// Resolves to `None` once the channel is closed and drained; that case never suspends.
    pub fn take(&self) -> TakeFut<T> {
        TakeFut {
            chan: self.0.clone(),
            state: TakeState::Init,
        }
    }

    /// Close the channel
    ///
    /// Idempotent. Parked takes resolve to `None`, parked puts fail and hand their value
    /// back. Values already buffered remain takeable.
    pub fn close(&self) {
        self.0.close();
    }

    /// Put without blocking, or hand the value back
    pub fn try_put(&self, value: T) -> Result<(), TryPutError<T>> {
        match self.0.put_step(value, None, None) {
            PutStep::Done(result) => result.map_err(TryPutError::from),
            PutStep::WouldBlock(value) => Err(TryPutError::WouldBlock(value)),
            _ => unreachable!("bare put cannot park or go stale here"),
        }
    }

    /// Take without blocking
    pub fn try_take(&self) -> Result<Option<T>, WouldBlockError> {
        match self.0.take_step(None, None) {
            TakeStep::Done(out) => Ok(out),
            TakeStep::WouldBlock => Err(WouldBlockError),
            _ => unreachable!("bare take cannot park or go stale here"),
        }
    }

    /// Put, blocking the calling thread until the value is accepted
    pub fn put_blocking(&self, value: T) -> Result<(), PutError<T>> {
        self.put(value).block()
    }

    /// Take, blocking the calling thread until a value or close arrives
    pub fn take_blocking(&self) -> Option<T> {
        self.take().block()
    }

    /// Values currently buffered
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffer capacity. 0 means rendezvous
    pub fn capacity(&self) -> usize {
        self.0.capacity()
    }

    /// Whether the channel has been closed
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel(self.0.clone())
    }
}


// future types for channels.
pub(crate) mod future {
    use super::*;
    use crate::channel::{
        polling::{block_on, Timeout},
        waiter::{Fired, Waiter},
    };
    use std::{
        future::Future,
        pin::Pin,
        task::{Context, Poll},
        time::{Duration, Instant},
    };

    /// Future for taking from a [`Channel`]
    ///
    /// Resolves to `Some(value)`, or `None` once the channel is closed and drained.
    /// Dropping an unresolved `TakeFut` retracts its registration; a value that had
    /// already been handed to it is returned to the front of the channel's buffer, so
    /// nothing is lost.
    pub struct TakeFut<T> {
        pub(super) chan: core::Chan<T>,
        pub(super) state: TakeState<T>,
    }

    pub(super) enum TakeState<T> {
        Init,
        Parked(Waiter<T>),
        Done,
    }

    impl<T> Future for TakeFut<T> {
        type Output = Option<T>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<T>> {
            let this = self.get_mut();
            match std::mem::replace(&mut this.state, TakeState::Done) {
                TakeState::Init => match this.chan.take_step(None, Some(cx.waker())) {
                    TakeStep::Done(out) => Poll::Ready(out),
                    TakeStep::Parked(waiter) => {
                        this.state = TakeState::Parked(waiter);
                        Poll::Pending
                    }
                    _ => unreachable!("bare take cannot go stale"),
                },
                TakeState::Parked(waiter) => match waiter.poll_outcome(cx.waker()) {
                    None => {
                        this.state = TakeState::Parked(waiter);
                        Poll::Pending
                    }
                    Some(Fired::Value(value)) => Poll::Ready(Some(value)),
                    Some(Fired::Closed) => Poll::Ready(None),
                    Some(_) => unreachable!("take waiter fired with a put outcome"),
                },
                // for implementation of FusedFuture
                TakeState::Done => Poll::Pending,
            }
        }
    }

    impl<T> futures::future::FusedFuture for TakeFut<T> {
        fn is_terminated(&self) -> bool {
            matches!(self.state, TakeState::Done)
        }
    }

    impl<T> TakeFut<T> {
        /// Whether this future has already resolved
        pub fn is_terminated(&self) -> bool {
            matches!(self.state, TakeState::Done)
        }

        /// Try to resolve this future immediately without blocking
        ///
        /// Leaves no registration behind on failure; the future may be polled or blocked
        /// on again.
        pub fn try_now(&mut self) -> Result<Option<T>, WouldBlockError> {
            assert!(!self.is_terminated(), "TakeFut used after resolving");
            match block_on(self, Timeout::NonBlocking) {
                Ok(out) => Ok(out),
                Err(()) => match self.retract() {
                    Some(out) => Ok(out),
                    None => Err(WouldBlockError),
                },
            }
        }

        /// Block the calling thread until this future resolves
        pub fn block(&mut self) -> Option<T> {
            assert!(!self.is_terminated(), "TakeFut used after resolving");
            block_on(self, Timeout::Never)
                .ok()
                .expect("blocked without a deadline yet timed out")
        }

        /// Block until this future resolves or the timeout elapses
        pub fn block_timeout(&mut self, timeout: Duration) -> Result<Option<T>, DeadlineExceededError> {
            self.block_deadline(Instant::now() + timeout)
        }

        /// Block until this future resolves or the deadline is reached
        ///
        /// Expiry retracts the pending registration, so no stale waiter entry remains; the
        /// future may be blocked on again.
        pub fn block_deadline(&mut self, deadline: Instant) -> Result<Option<T>, DeadlineExceededError> {
            assert!(!self.is_terminated(), "TakeFut used after resolving");
            match block_on(self, Timeout::At(deadline)) {
                Ok(out) => Ok(out),
                Err(()) => match self.retract() {
                    Some(out) => Ok(out),
                    None => Err(DeadlineExceededError),
                },
            }
        }

        // retract a parked registration. yields the outcome if it fired first.
        fn retract(&mut self) -> Option<Option<T>> {
            match std::mem::replace(&mut self.state, TakeState::Init) {
                TakeState::Parked(waiter) => match self.chan.cancel_taker(&waiter) {
                    None => None,
                    Some(out) => {
                        self.state = TakeState::Done;
                        Some(out)
                    }
                },
                other => {
                    self.state = other;
                    None
                }
            }
        }
    }

    impl<T> Drop for TakeFut<T> {
        fn drop(&mut self) {
            if let TakeState::Parked(waiter) = &self.state {
                if let Some(Some(value)) = self.chan.cancel_taker(waiter) {
                    self.chan.restitute(value);
                }
            }
        }
    }


    /// Future for putting into a [`Channel`]
    ///
    /// The value is not sent until this future resolves. An unresolved `PutFut` can be
    /// [rescinded](Self::rescind) to recover the value; dropping it retracts the
    /// registration.
    pub struct PutFut<T> {
        pub(super) chan: core::Chan<T>,
        pub(super) state: PutState<T>,
    }

    pub(super) enum PutState<T> {
        Init(T),
        Parked(Waiter<T>),
        Done,
    }

    // PutFut never pin-projects through its bare `T`; it is always moved by value.
    impl<T> Unpin for PutFut<T> {}

    impl<T> Future for PutFut<T> {
        type Output = Result<(), PutError<T>>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
            let this = self.get_mut();
            match std::mem::replace(&mut this.state, PutState::Done) {
                PutState::Init(value) => {
                    match this.chan.put_step(value, None, Some(cx.waker())) {
                        PutStep::Done(result) => Poll::Ready(result),
                        PutStep::Parked(waiter) => {
                            this.state = PutState::Parked(waiter);
                            Poll::Pending
                        }
                        _ => unreachable!("bare put cannot go stale"),
                    }
                }
                PutState::Parked(waiter) => match waiter.poll_outcome(cx.waker()) {
                    None => {
                        this.state = PutState::Parked(waiter);
                        Poll::Pending
                    }
                    Some(Fired::Accepted) => Poll::Ready(Ok(())),
                    Some(Fired::Rejected(value)) => Poll::Ready(Err(PutError::Closed(value))),
                    Some(Fired::Failed(error)) => Poll::Ready(Err(PutError::Stage(error))),
                    Some(_) => unreachable!("put waiter fired with a take outcome"),
                },
                // for implementation of FusedFuture
                PutState::Done => Poll::Pending,
            }
        }
    }

    impl<T> futures::future::FusedFuture for PutFut<T> {
        fn is_terminated(&self) -> bool {
            matches!(self.state, PutState::Done)
        }
    }

    impl<T> PutFut<T> {
        /// Whether this future has already resolved or rescinded
        pub fn is_terminated(&self) -> bool {
            matches!(self.state, PutState::Done)
        }

        /// If the value has not been sent, abort the put and recover it
        ///
        /// Returns `None` if the put already resolved. A put that already failed with
        /// [`PutError::Closed`] also yields its value here.
        pub fn rescind(&mut self) -> Option<T> {
            match std::mem::replace(&mut self.state, PutState::Done) {
                PutState::Init(value) => Some(value),
                PutState::Parked(waiter) => match self.chan.cancel_putter(&waiter) {
                    PutCancel::Detached(value) => Some(value),
                    PutCancel::Fired(Err(PutError::Closed(value))) => Some(value),
                    PutCancel::Fired(_) => None,
                },
                PutState::Done => None,
            }
        }

        /// Try to resolve this future immediately without blocking
        pub fn try_now(&mut self) -> Result<Result<(), PutError<T>>, WouldBlockError> {
            assert!(!self.is_terminated(), "PutFut used after resolving");
            match block_on(self, Timeout::NonBlocking) {
                Ok(result) => Ok(result),
                Err(()) => match self.retract() {
                    Some(result) => Ok(result),
                    None => Err(WouldBlockError),
                },
            }
        }

        /// Block the calling thread until this future resolves
        pub fn block(&mut self) -> Result<(), PutError<T>> {
            assert!(!self.is_terminated(), "PutFut used after resolving");
            block_on(self, Timeout::Never)
                .ok()
                .expect("blocked without a deadline yet timed out")
        }

        /// Block until this future resolves or the timeout elapses
        pub fn block_timeout(
            &mut self,
            timeout: Duration,
        ) -> Result<Result<(), PutError<T>>, DeadlineExceededError> {
            self.block_deadline(Instant::now() + timeout)
        }

        /// Block until this future resolves or the deadline is reached
        ///
        /// Expiry retracts the pending registration and keeps the value inside the future:
        /// retry by blocking again, or recover the value with [`rescind`](Self::rescind).
        pub fn block_deadline(
            &mut self,
            deadline: Instant,
        ) -> Result<Result<(), PutError<T>>, DeadlineExceededError> {
            assert!(!self.is_terminated(), "PutFut used after resolving");
            match block_on(self, Timeout::At(deadline)) {
                Ok(result) => Ok(result),
                Err(()) => match self.retract() {
                    Some(result) => Ok(result),
                    None => Err(DeadlineExceededError),
                },
            }
        }

        // retract a parked registration, restoring the value into the future. yields the
        // put's result if it fired first.
        fn retract(&mut self) -> Option<Result<(), PutError<T>>> {
            match std::mem::replace(&mut self.state, PutState::Done) {
                PutState::Parked(waiter) => match self.chan.cancel_putter(&waiter) {
                    PutCancel::Detached(value) => {
                        self.state = PutState::Init(value);
                        None
                    }
                    PutCancel::Fired(result) => Some(result),
                },
                other => {
                    self.state = other;
                    None
                }
            }
        }
    }

    impl<T> Drop for PutFut<T> {
        fn drop(&mut self) {
            if let PutState::Parked(waiter) = &self.state {
                let _ = self.chan.cancel_putter(waiter);
            }
        }
    }
}


// ==== tests ====


#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rand_pcg::Pcg32;
    use std::{
        collections::VecDeque,
        thread,
        time::Duration,
    };

    #[test]
    fn basic_1000_test() {
        let ch = channel(500);
        let producer = ch.clone();

        let join_1 = thread::spawn(move || {
            for i in 1..=1000 {
                producer.put_blocking(i).unwrap();
                if i < 1000 && i % 100 == 0 {
                    thread::sleep(Duration::from_millis(10));
                }
            }
            producer.close();
        });
        let join_2 = thread::spawn(move || {
            for i in 1..=1000 {
                assert_eq!(ch.take_blocking(), Some(i));
            }
            assert_eq!(ch.take_blocking(), None);
        });
        join_1.join().unwrap();
        join_2.join().unwrap();
    }

    #[test]
    fn buffer_never_exceeds_capacity() {
        let ch = channel(3);
        for i in 0..3 {
            ch.try_put(i).unwrap();
        }
        assert_eq!(ch.len(), 3);
        assert!(matches!(ch.try_put(9), Err(TryPutError::WouldBlock(9))));
        assert_eq!(ch.len(), 3);
        assert_eq!(ch.try_take().unwrap(), Some(0));
        assert_eq!(ch.len(), 2);
    }

    #[test]
    fn filter_pipeline_keeps_even_numbers() {
        let ch = channel_with(4, Pipeline::new().filter(|n: &i32| n % 2 == 0));
        for n in [1, 2, 3, 4] {
            ch.try_put(n).unwrap();
        }
        assert_eq!(ch.try_take().unwrap(), Some(2));
        assert_eq!(ch.try_take().unwrap(), Some(4));
        assert!(ch.try_take().is_err());
    }

    #[test]
    fn close_wakes_pending_takers_with_none() {
        let ch = channel::<u32>(1);
        let mut waiters = Vec::new();
        for _ in 0..2 {
            let ch = ch.clone();
            waiters.push(thread::spawn(move || ch.take_blocking()));
        }
        thread::sleep(Duration::from_millis(50));
        ch.close();
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), None);
        }
    }

    #[test]
    fn close_rejects_pending_putter_with_value() {
        let ch = channel(1);
        ch.try_put(1).unwrap();
        let blocked = {
            let ch = ch.clone();
            thread::spawn(move || ch.put_blocking(2))
        };
        thread::sleep(Duration::from_millis(50));
        ch.close();
        match blocked.join().unwrap() {
            Err(PutError::Closed(2)) => (),
            other => panic!("expected the value back, got {:?}", other),
        }
        // the buffered value survives the close
        assert_eq!(ch.take_blocking(), Some(1));
        assert_eq!(ch.take_blocking(), None);
    }

    #[test]
    fn put_after_close_fails_immediately() {
        let ch = channel(4);
        ch.close();
        match ch.try_put(1) {
            Err(TryPutError::Terminal(PutError::Closed(1))) => (),
            other => panic!("expected immediate closed failure, got {:?}", other),
        }
    }

    #[test]
    fn waiting_putters_are_served_fifo() {
        let ch = channel(1);
        ch.try_put(0).unwrap();
        let first = {
            let ch = ch.clone();
            thread::spawn(move || ch.put_blocking(1).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        let second = {
            let ch = ch.clone();
            thread::spawn(move || ch.put_blocking(2).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ch.take_blocking(), Some(0));
        assert_eq!(ch.take_blocking(), Some(1));
        assert_eq!(ch.take_blocking(), Some(2));
        first.join().unwrap();
        second.join().unwrap();
    }

    #[test]
    fn take_deadline_leaves_no_stale_registration() {
        let ch = channel::<u32>(2);
        let result = ch.take().block_timeout(Duration::from_millis(20));
        assert_eq!(result, Err(DeadlineExceededError));
        // a fresh put must land in the buffer, not in a dead taker
        ch.try_put(7).unwrap();
        assert_eq!(ch.len(), 1);
        assert_eq!(ch.try_take().unwrap(), Some(7));
    }

    #[test]
    fn put_deadline_keeps_the_value_rescindable() {
        let ch = channel(1);
        ch.try_put(1).unwrap();
        let mut fut = ch.put(2);
        assert!(matches!(
            fut.block_timeout(Duration::from_millis(20)),
            Err(DeadlineExceededError),
        ));
        assert_eq!(fut.rescind(), Some(2));
        // the retracted put left no registration behind
        assert_eq!(ch.try_take().unwrap(), Some(1));
        assert!(ch.try_take().is_err());
    }

    #[test]
    fn failing_stage_closes_channel_and_fails_the_put() {
        let ch = channel_with(
            4,
            Pipeline::new().try_map(|n: i32| {
                if n == 3 {
                    Err(anyhow::anyhow!("bad value"))
                } else {
                    Ok(n)
                }
            }),
        );
        ch.try_put(1).unwrap();
        ch.try_put(2).unwrap();
        match ch.try_put(3) {
            Err(TryPutError::Terminal(PutError::Stage(_))) => (),
            other => panic!("expected a stage failure, got {:?}", other),
        }
        assert!(ch.is_closed());
        assert_eq!(ch.try_take().unwrap(), Some(1));
        assert_eq!(ch.try_take().unwrap(), Some(2));
        assert_eq!(ch.try_take().unwrap(), None);
    }

    #[test]
    fn take_while_halt_closes_for_future_puts() {
        let ch = channel_with(4, Pipeline::new().take_while(|n: &i32| *n < 3));
        ch.try_put(1).unwrap();
        ch.try_put(2).unwrap();
        // the halting value is dropped but the offer itself succeeds
        ch.try_put(3).unwrap();
        assert!(ch.is_closed());
        assert!(matches!(
            ch.try_put(4),
            Err(TryPutError::Terminal(PutError::Closed(4))),
        ));
        assert_eq!(ch.try_take().unwrap(), Some(1));
        assert_eq!(ch.try_take().unwrap(), Some(2));
        assert_eq!(ch.try_take().unwrap(), None);
    }

    #[test]
    #[should_panic(expected = "transform pipeline requires a buffered channel")]
    fn pipeline_on_rendezvous_channel_is_refused() {
        let _ = channel_with(0, Pipeline::new().map(|n: i32| n));
    }

    // stochastic equivalence against a model queue, with a fixed seed.
    #[test]
    fn stochastic_try_ops_match_model() {
        let mut rng = Pcg32::from_seed(0xdeadbeefdeadbeefdeadbeefdeadbeefu128.to_le_bytes());
        for cap in [1, 2, 7, 64] {
            let ch = channel(cap);
            let mut model = VecDeque::new();
            let mut next = 0u32;
            for _ in 0..10_000 {
                if rng.gen_ratio(52, 100) {
                    match ch.try_put(next) {
                        Ok(()) => model.push_back(next),
                        Err(TryPutError::WouldBlock(v)) => {
                            assert_eq!(v, next);
                            assert_eq!(model.len(), cap);
                        }
                        Err(other) => panic!("unexpected put failure: {:?}", other),
                    }
                    next += 1;
                } else {
                    match ch.try_take() {
                        Ok(Some(v)) => assert_eq!(Some(v), model.pop_front()),
                        Ok(None) => panic!("channel reported closed"),
                        Err(WouldBlockError) => assert!(model.is_empty()),
                    }
                }
                assert_eq!(ch.len(), model.len());
                assert!(ch.len() <= cap);
            }
        }
    }
}
