//! The alts operator: wait on several channel operations and commit to exactly one.
//!
//! Readiness is evaluated first; if several candidates are ready at once, the committed
//! one is chosen uniformly at random, so neither side of a busy pair can be starved. When
//! nothing is ready, one registration per candidate is parked, all sharing a single claim
//! token: whichever registration is fired claims the token, and every other registration
//! becomes dead in the same moment. That claim is the atomic "fire one, cancel the rest"
//! step; the dead registrations are then retracted.

use crate::channel::{
    api::Channel,
    core::{Chan, PutCancel, PutStep, TakeStep},
    error::{DeadlineExceededError, PutError, WouldBlockError},
    polling::{block_on, Timeout},
    waiter::{Fired, Token, Waiter},
};
use rand::seq::SliceRandom;
use smallvec::SmallVec;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};


/// One candidate operation of an [`alts`] call
pub struct Op<T>(OpKind<T>);

enum OpKind<T> {
    Take(Chan<T>),
    Put(Chan<T>, T),
}

impl<T> Op<T> {
    /// Candidate take from `chan`
    pub fn take(chan: &Channel<T>) -> Self {
        Op(OpKind::Take(chan.0.clone()))
    }

    /// Candidate put of `value` into `chan`
    ///
    /// If another candidate is selected, `value` is dropped when the [`Alts`] future
    /// resolves or is dropped; clone first if it must survive non-selection.
    pub fn put(chan: &Channel<T>, value: T) -> Self {
        Op(OpKind::Put(chan.0.clone(), value))
    }
}

/// What the selected operation produced
#[derive(Debug)]
pub enum AltOutcome<T> {
    /// A take completed; `None` means its channel was closed and drained
    Taken(Option<T>),
    /// A put completed
    PutDone(Result<(), PutError<T>>),
}

/// Result of an [`alts`] call: which candidate completed, and what it produced
#[derive(Debug)]
pub struct Selected<T> {
    /// Index of the completed candidate, in the order passed to [`alts`]
    pub index: usize,
    pub outcome: AltOutcome<T>,
}

/// Wait on several channel operations and commit to exactly one
///
/// Exactly one candidate completes per call; the others observe no effect. Panics if
/// `ops` is empty.
pub fn alts<T>(ops: impl IntoIterator<Item = Op<T>>) -> Alts<T> {
    let arms: SmallVec<[Arm<T>; 4]> = ops
        .into_iter()
        .map(|op| match op.0 {
            OpKind::Take(chan) => Arm::TakeInit(chan),
            OpKind::Put(chan, value) => Arm::PutInit(chan, value),
        })
        .collect();
    assert!(!arms.is_empty(), "alts requires at least one candidate operation");
    Alts { arms, token: None, terminated: false }
}

/// Future for [`alts`]
///
/// Besides being awaited inside a routine, it can block the calling thread or try to
/// resolve immediately, like the channel operation futures.
pub struct Alts<T> {
    arms: SmallVec<[Arm<T>; 4]>,
    // present once the candidates have parked registrations
    token: Option<Token>,
    terminated: bool,
}

enum Arm<T> {
    TakeInit(Chan<T>),
    TakeParked(Chan<T>, Waiter<T>),
    PutInit(Chan<T>, T),
    PutParked(Chan<T>, Waiter<T>),
    Spent,
}

// Alts never pin-projects through its bare `T`; it is always moved by value.
impl<T> Unpin for Alts<T> {}

impl<T> Future for Alts<T> {
    type Output = Selected<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Selected<T>> {
        let this = self.get_mut();
        // for implementation of FusedFuture
        if this.terminated {
            return Poll::Pending;
        }

        if this.token.is_none() {
            // probe candidates in a uniformly shuffled order and commit to the first that
            // is ready, so simultaneously ready candidates are chosen uniformly
            let mut order: SmallVec<[usize; 4]> = (0..this.arms.len()).collect();
            order.shuffle(&mut rand::thread_rng());
            for &i in &order {
                match std::mem::replace(&mut this.arms[i], Arm::Spent) {
                    Arm::TakeInit(chan) => match chan.take_step(None, None) {
                        TakeStep::Done(out) => {
                            this.terminated = true;
                            return Poll::Ready(Selected {
                                index: i,
                                outcome: AltOutcome::Taken(out),
                            });
                        }
                        TakeStep::WouldBlock => this.arms[i] = Arm::TakeInit(chan),
                        _ => unreachable!("probe cannot park or go stale"),
                    },
                    Arm::PutInit(chan, value) => match chan.put_step(value, None, None) {
                        PutStep::Done(result) => {
                            this.terminated = true;
                            return Poll::Ready(Selected {
                                index: i,
                                outcome: AltOutcome::PutDone(result),
                            });
                        }
                        PutStep::WouldBlock(value) => this.arms[i] = Arm::PutInit(chan, value),
                        _ => unreachable!("probe cannot park or go stale"),
                    },
                    _ => unreachable!("arm already registered before probing"),
                }
            }

            // nothing ready: park one registration per candidate, re-checking readiness
            // as we go. every registration shares one claim token.
            let token = Token::new();
            this.token = Some(token.clone());
            'park: for i in 0..this.arms.len() {
                match std::mem::replace(&mut this.arms[i], Arm::Spent) {
                    Arm::TakeInit(chan) => {
                        match chan.take_step(Some(&token), Some(cx.waker())) {
                            TakeStep::Done(out) => {
                                this.retract_parked();
                                this.terminated = true;
                                return Poll::Ready(Selected {
                                    index: i,
                                    outcome: AltOutcome::Taken(out),
                                });
                            }
                            TakeStep::Parked(waiter) => {
                                this.arms[i] = Arm::TakeParked(chan, waiter);
                            }
                            TakeStep::Stale => {
                                // an already-parked candidate fired while we registered
                                this.arms[i] = Arm::TakeInit(chan);
                                break 'park;
                            }
                            TakeStep::WouldBlock => unreachable!("parking was requested"),
                        }
                    }
                    Arm::PutInit(chan, value) => {
                        match chan.put_step(value, Some(&token), Some(cx.waker())) {
                            PutStep::Done(result) => {
                                this.retract_parked();
                                this.terminated = true;
                                return Poll::Ready(Selected {
                                    index: i,
                                    outcome: AltOutcome::PutDone(result),
                                });
                            }
                            PutStep::Parked(waiter) => {
                                this.arms[i] = Arm::PutParked(chan, waiter);
                            }
                            PutStep::Stale(value) => {
                                this.arms[i] = Arm::PutInit(chan, value);
                                break 'park;
                            }
                            PutStep::WouldBlock(_) => unreachable!("parking was requested"),
                        }
                    }
                    _ => unreachable!("arm already registered before parking"),
                }
            }
            // fall through: a stale registration's outcome may already be deposited
        }

        // find the registration that fired
        for i in 0..this.arms.len() {
            let fired = match &this.arms[i] {
                Arm::TakeParked(_, waiter) | Arm::PutParked(_, waiter) => {
                    waiter.poll_outcome(cx.waker())
                }
                _ => continue,
            };
            let Some(fired) = fired else { continue };
            this.arms[i] = Arm::Spent;
            let outcome = match fired {
                Fired::Value(value) => AltOutcome::Taken(Some(value)),
                Fired::Closed => AltOutcome::Taken(None),
                Fired::Accepted => AltOutcome::PutDone(Ok(())),
                Fired::Rejected(value) => AltOutcome::PutDone(Err(PutError::Closed(value))),
                Fired::Failed(error) => AltOutcome::PutDone(Err(PutError::Stage(error))),
            };
            this.retract_parked();
            this.terminated = true;
            return Poll::Ready(Selected { index: i, outcome });
        }
        Poll::Pending
    }
}

impl<T> futures::future::FusedFuture for Alts<T> {
    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

impl<T> Alts<T> {
    /// Whether this future has already resolved
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Try to resolve immediately without blocking
    ///
    /// On `Err`, every registration has been retracted and the call is spent: unsent put
    /// values are dropped.
    pub fn try_now(&mut self) -> Result<Selected<T>, WouldBlockError> {
        assert!(!self.terminated, "Alts used after resolving");
        match block_on(self, Timeout::NonBlocking) {
            Ok(selected) => Ok(selected),
            Err(()) => {
                let resolved = self.retract_or_resolve();
                self.terminated = true;
                resolved.ok_or(WouldBlockError)
            }
        }
    }

    /// Block the calling thread until one candidate completes
    pub fn block(&mut self) -> Selected<T> {
        assert!(!self.terminated, "Alts used after resolving");
        block_on(self, Timeout::Never)
            .ok()
            .expect("blocked without a deadline yet timed out")
    }

    /// Block until one candidate completes or the timeout elapses
    pub fn block_timeout(&mut self, timeout: Duration) -> Result<Selected<T>, DeadlineExceededError> {
        self.block_deadline(Instant::now() + timeout)
    }

    /// Block until one candidate completes or the deadline is reached
    ///
    /// Expiry retracts every registration, leaving no stale waiter entry on any channel,
    /// and spends the call: unsent put values are dropped.
    pub fn block_deadline(&mut self, deadline: Instant) -> Result<Selected<T>, DeadlineExceededError> {
        assert!(!self.terminated, "Alts used after resolving");
        match block_on(self, Timeout::At(deadline)) {
            Ok(selected) => Ok(selected),
            Err(()) => {
                let resolved = self.retract_or_resolve();
                self.terminated = true;
                resolved.ok_or(DeadlineExceededError)
            }
        }
    }

    // retract every parked registration. values handed to a registration that fired while
    // being retracted go back to their channel.
    fn retract_parked(&mut self) {
        for arm in &mut self.arms {
            match std::mem::replace(arm, Arm::Spent) {
                Arm::TakeParked(chan, waiter) => {
                    if let Some(Some(value)) = chan.cancel_taker(&waiter) {
                        chan.restitute(value);
                    }
                }
                Arm::PutParked(chan, waiter) => {
                    let _ = chan.cancel_putter(&waiter);
                }
                other => *arm = other,
            }
        }
    }

    // retract every parked registration, but surface the result of one that had already
    // fired instead of discarding it.
    fn retract_or_resolve(&mut self) -> Option<Selected<T>> {
        let mut resolved = None;
        for i in 0..self.arms.len() {
            match std::mem::replace(&mut self.arms[i], Arm::Spent) {
                Arm::TakeParked(chan, waiter) => {
                    if let Some(out) = chan.cancel_taker(&waiter) {
                        resolved = Some(Selected { index: i, outcome: AltOutcome::Taken(out) });
                    }
                }
                Arm::PutParked(chan, waiter) => {
                    if let PutCancel::Fired(result) = chan.cancel_putter(&waiter) {
                        resolved = Some(Selected {
                            index: i,
                            outcome: AltOutcome::PutDone(result),
                        });
                    }
                }
                _ => (),
            }
        }
        resolved
    }
}

impl<T> Drop for Alts<T> {
    fn drop(&mut self) {
        self.retract_parked();
    }
}
