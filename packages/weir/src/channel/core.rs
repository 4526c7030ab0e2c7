// minimal complete API for the channel. the exposed API is a convenience wrapper around
// this.
//
// every operation is a single step against the lockable state: it either completes, parks
// a waiter into one of the FIFO queues, or reports that it cannot proceed. select arms pass
// their shared claim token through `own` so that committing here retires the whole call.

use super::{
    error::PutError,
    waiter::{Acquire, Cancel, Fired, Token, Waiter},
};
use crate::pipeline::{Pipeline, Step};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    task::Waker,
};


// handle to a channel.
pub(crate) struct Chan<T>(Arc<Shared<T>>);

struct Shared<T> {
    lockable: Mutex<Lockable<T>>,
}

// channel lockable state.
struct Lockable<T> {
    // buffered values. holds at most `cap` values.
    buf: VecDeque<T>,
    // buffer capacity. 0 means rendezvous: a put completes only by direct hand-off.
    cap: usize,
    // transform pipeline applied to every value entering the buffer.
    pipeline: Pipeline<T>,
    // parked takes, oldest first.
    takers: VecDeque<Waiter<T>>,
    // parked puts, oldest first. invariant: only populated while the buffer is full.
    putters: VecDeque<Waiter<T>>,
    // one-way flag. once set, puts fail and takes drain the buffer then report closed.
    closed: bool,
}

// outcome of driving a take one step.
pub(crate) enum TakeStep<T> {
    // completed. None means the channel is closed and drained.
    Done(Option<T>),
    // parked; the waiter is linked into the channel's taker queue.
    Parked(Waiter<T>),
    // could not complete immediately, and parking was not requested.
    WouldBlock,
    // the commit token was claimed by another registration of the same call.
    Stale,
}

// outcome of driving a put one step.
pub(crate) enum PutStep<T> {
    Done(Result<(), PutError<T>>),
    Parked(Waiter<T>),
    WouldBlock(T),
    Stale(T),
}

// outcome of retracting a parked put.
pub(crate) enum PutCancel<T> {
    // registration retracted; the pending value comes back.
    Detached(T),
    // the put had already completed; this is its result.
    Fired(Result<(), PutError<T>>),
}

fn claim_own(own: Option<&Token>) -> bool {
    own.map_or(true, Token::claim)
}

impl<T> Chan<T> {
    pub(crate) fn new(cap: usize, pipeline: Pipeline<T>) -> Self {
        assert!(
            cap > 0 || pipeline.is_empty(),
            "a transform pipeline requires a buffered channel",
        );
        Chan(Arc::new(Shared {
            lockable: Mutex::new(Lockable {
                buf: VecDeque::new(),
                cap,
                pipeline,
                takers: VecDeque::new(),
                putters: VecDeque::new(),
                closed: false,
            }),
        }))
    }

    pub(crate) fn clone(&self) -> Self {
        Chan(Arc::clone(&self.0))
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lockable.lock().unwrap().buf.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.0.lockable.lock().unwrap().cap
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.0.lockable.lock().unwrap().closed
    }

    // drive a take one step.
    //
    // `own` is the caller's commit token, if it already shares one with other registrations.
    // `park` enables parking: without it the step reports WouldBlock instead.
    pub(crate) fn take_step(&self, own: Option<&Token>, park: Option<&Waker>) -> TakeStep<T> {
        let mut lock = self.0.lockable.lock().unwrap();
        if lock.cap > 0 {
            lock.promote_putters();
            if !lock.buf.is_empty() {
                if !claim_own(own) {
                    return TakeStep::Stale;
                }
                let value = lock.buf.pop_front().unwrap();
                lock.promote_putters();
                return TakeStep::Done(Some(value));
            }
        } else {
            // rendezvous: pair with the oldest live parked put.
            let mut i = 0;
            while i < lock.putters.len() {
                let decision = Token::acquire(own, lock.putters[i].token());
                match decision {
                    Acquire::Sibling => i += 1,
                    Acquire::OtherLost => {
                        lock.putters.remove(i);
                    }
                    Acquire::OwnLost => return TakeStep::Stale,
                    Acquire::Both => {
                        let putter = lock.putters.remove(i).unwrap();
                        let value = putter.take_value();
                        putter.fire(Fired::Accepted);
                        return TakeStep::Done(Some(value));
                    }
                }
            }
        }
        if lock.closed {
            if !claim_own(own) {
                return TakeStep::Stale;
            }
            return TakeStep::Done(None);
        }
        match park {
            Some(waker) => {
                let token = own.map(Token::clone).unwrap_or_else(Token::new);
                let waiter = Waiter::parked_take(token, waker.clone());
                lock.takers.push_back(waiter.clone());
                TakeStep::Parked(waiter)
            }
            None => TakeStep::WouldBlock,
        }
    }

    // drive a put one step. a put on a closed channel completes (with failure) immediately.
    pub(crate) fn put_step(
        &self,
        value: T,
        own: Option<&Token>,
        park: Option<&Waker>,
    ) -> PutStep<T> {
        let mut lock = self.0.lockable.lock().unwrap();
        if lock.closed {
            if !claim_own(own) {
                return PutStep::Stale(value);
            }
            return PutStep::Done(Err(PutError::Closed(value)));
        }
        if lock.cap == 0 {
            // rendezvous: hand off to the oldest live parked take.
            let mut i = 0;
            while i < lock.takers.len() {
                let decision = Token::acquire(own, lock.takers[i].token());
                match decision {
                    Acquire::Sibling => i += 1,
                    Acquire::OtherLost => {
                        lock.takers.remove(i);
                    }
                    Acquire::OwnLost => return PutStep::Stale(value),
                    Acquire::Both => {
                        let taker = lock.takers.remove(i).unwrap();
                        taker.fire(Fired::Value(value));
                        return PutStep::Done(Ok(()));
                    }
                }
            }
        } else {
            lock.promote_putters();
            if lock.buf.len() < lock.cap && lock.putters.is_empty() {
                if !claim_own(own) {
                    return PutStep::Stale(value);
                }
                let result = lock.admit(value);
                return PutStep::Done(result);
            }
        }
        match park {
            Some(waker) => {
                let token = own.map(Token::clone).unwrap_or_else(Token::new);
                let waiter = Waiter::parked_put(token, value, waker.clone());
                lock.putters.push_back(waiter.clone());
                PutStep::Parked(waiter)
            }
            None => PutStep::WouldBlock(value),
        }
    }

    // close the channel. idempotent.
    pub(crate) fn close(&self) {
        self.0.lockable.lock().unwrap().close();
    }

    // retract a parked take. returns the take's result instead if it had already fired.
    pub(crate) fn cancel_taker(&self, waiter: &Waiter<T>) -> Option<Option<T>> {
        let mut lock = self.0.lockable.lock().unwrap();
        match waiter.cancel() {
            Cancel::Detached(_) => {
                unlink(&mut lock.takers, waiter);
                None
            }
            Cancel::AlreadyFired(Fired::Value(value)) => Some(Some(value)),
            Cancel::AlreadyFired(Fired::Closed) => Some(None),
            Cancel::AlreadyFired(_) => unreachable!("take waiter fired with a put outcome"),
        }
    }

    // retract a parked put.
    pub(crate) fn cancel_putter(&self, waiter: &Waiter<T>) -> PutCancel<T> {
        let mut lock = self.0.lockable.lock().unwrap();
        match waiter.cancel() {
            Cancel::Detached(value) => {
                unlink(&mut lock.putters, waiter);
                PutCancel::Detached(value.expect("parked put without a pending value"))
            }
            Cancel::AlreadyFired(Fired::Accepted) => PutCancel::Fired(Ok(())),
            Cancel::AlreadyFired(Fired::Rejected(value)) => {
                PutCancel::Fired(Err(PutError::Closed(value)))
            }
            Cancel::AlreadyFired(Fired::Failed(error)) => {
                PutCancel::Fired(Err(PutError::Stage(error)))
            }
            Cancel::AlreadyFired(_) => unreachable!("put waiter fired with a take outcome"),
        }
    }

    // return a handed-off value whose take was dropped before observing it. the value is
    // the oldest outstanding one, so it goes to the front.
    pub(crate) fn restitute(&self, value: T) {
        let mut lock = self.0.lockable.lock().unwrap();
        let mut value = value;
        loop {
            let Some(taker) = lock.takers.pop_front() else { break };
            if taker.token().claim() {
                taker.fire(Fired::Value(value));
                return;
            }
        }
        lock.buf.push_front(value);
    }
}

fn unlink<T>(queue: &mut VecDeque<Waiter<T>>, waiter: &Waiter<T>) {
    if let Some(pos) = queue.iter().position(|w| w.is(waiter)) {
        queue.remove(pos);
    }
}

impl<T> Lockable<T> {
    // run the pipeline on an accepted value and make the result visible: buffered, and
    // handed straight on to the oldest live parked take if one is waiting.
    fn admit(&mut self, value: T) -> Result<(), PutError<T>> {
        match self.pipeline.offer(value) {
            Err(error) => {
                error!("pipeline stage failed, closing channel");
                self.close();
                Err(PutError::Stage(error))
            }
            Ok(Step::Skip) => Ok(()),
            Ok(Step::Halt) => {
                self.close();
                Ok(())
            }
            Ok(Step::Pass(value)) => {
                self.buf.push_back(value);
                self.deliver();
                Ok(())
            }
        }
    }

    // hand buffered values to parked takes, oldest first, while both exist.
    fn deliver(&mut self) {
        while !self.buf.is_empty() {
            let Some(taker) = self.takers.pop_front() else { return };
            if taker.token().claim() {
                let value = self.buf.pop_front().unwrap();
                taker.fire(Fired::Value(value));
            }
            // a lost claim is a dead registration; drop it and keep looking
        }
    }

    // admit parked puts into free buffer space, oldest first.
    fn promote_putters(&mut self) {
        while self.buf.len() < self.cap && !self.closed {
            let Some(putter) = self.putters.pop_front() else { break };
            if !putter.token().claim() {
                continue;
            }
            let value = putter.take_value();
            match self.pipeline.offer(value) {
                Err(error) => {
                    error!("pipeline stage failed, closing channel");
                    putter.fire(Fired::Failed(error));
                    self.close();
                    return;
                }
                Ok(Step::Skip) => putter.fire(Fired::Accepted),
                Ok(Step::Halt) => {
                    putter.fire(Fired::Accepted);
                    self.close();
                    return;
                }
                Ok(Step::Pass(value)) => {
                    self.buf.push_back(value);
                    putter.fire(Fired::Accepted);
                }
            }
        }
        // dead registrations can leave both queues transiently populated
        self.deliver();
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        trace!(
            takers = self.takers.len(),
            putters = self.putters.len(),
            buffered = self.buf.len(),
            "closing channel"
        );
        for taker in self.takers.drain(..) {
            if taker.token().claim() {
                taker.fire(Fired::Closed);
            }
        }
        for putter in self.putters.drain(..) {
            if putter.token().claim() {
                let value = putter.take_value();
                putter.fire(Fired::Rejected(value));
            }
        }
    }
}
