// parked operations part of a channel.
//
// a waiter is the saved state of a suspended put or take: the continuation. it is shared
// between the channel's FIFO queue and the suspended operation future. the claim token is
// the single commit point: whoever claims it first gets to fire the waiter, and everyone
// else must treat the registration as dead.

use crate::channel::error::StageError;
use std::{
    sync::{Arc, Mutex},
    task::Waker,
};


// one-shot claim token arbitrating which registration of a logical operation commits.
//
// a plain put/take owns its token alone; the arms of one alts call share a single token,
// so claiming it retires every arm at once.
pub(crate) struct Token(Arc<Mutex<bool>>);

// outcome of a two-party commit between an active operation and a parked counterpart.
pub(crate) enum Acquire {
    // both tokens claimed; the commit is on.
    Both,
    // the active operation's own token was already claimed elsewhere.
    OwnLost,
    // the counterpart is a dead registration; skip it.
    OtherLost,
    // the counterpart belongs to the same alts call; it must be left alone.
    Sibling,
}

impl Token {
    pub(crate) fn new() -> Self {
        Token(Arc::new(Mutex::new(false)))
    }

    pub(crate) fn clone(&self) -> Self {
        Token(Arc::clone(&self.0))
    }

    // claim the token. true exactly once across all clones.
    pub(crate) fn claim(&self) -> bool {
        let mut claimed = self.0.lock().unwrap();
        if *claimed {
            false
        } else {
            *claimed = true;
            true
        }
    }

    // claim `own` (if any) and `other` together, or neither.
    //
    // both flags are locked in address order, so two of these commits can never deadlock
    // against each other.
    pub(crate) fn acquire(own: Option<&Token>, other: &Token) -> Acquire {
        let Some(own) = own else {
            return if other.claim() { Acquire::Both } else { Acquire::OtherLost };
        };
        if Arc::ptr_eq(&own.0, &other.0) {
            return Acquire::Sibling;
        }
        let own_first = Arc::as_ptr(&own.0) < Arc::as_ptr(&other.0);
        let (first, second) = if own_first { (&own.0, &other.0) } else { (&other.0, &own.0) };
        let mut first = first.lock().unwrap();
        let mut second = second.lock().unwrap();
        let (own_flag, other_flag) = if own_first {
            (&mut *first, &mut *second)
        } else {
            (&mut *second, &mut *first)
        };
        if *own_flag {
            Acquire::OwnLost
        } else if *other_flag {
            Acquire::OtherLost
        } else {
            *own_flag = true;
            *other_flag = true;
            Acquire::Both
        }
    }
}


// outcome deposited into a fired waiter.
pub(crate) enum Fired<T> {
    // take: a value was handed over.
    Value(T),
    // take: the channel closed.
    Closed,
    // put: the value was admitted.
    Accepted,
    // put: the channel closed first; the value comes back.
    Rejected(T),
    // put: a pipeline stage failed while admitting the value.
    Failed(StageError),
}

// lifecycle of a waiter. Parked -> Claimed -> Fired, or Parked -> Cancelled.
enum State<T> {
    // suspended. a parked put holds its pending value here.
    Parked { value: Option<T>, waker: Option<Waker> },
    // token claimed and value drained, outcome not yet deposited.
    Claimed { waker: Option<Waker> },
    // outcome deposited. None once the owner has extracted it.
    Fired(Option<Fired<T>>),
    // registration retracted by its owner.
    Cancelled,
}

// result of owner-side cancellation.
pub(crate) enum Cancel<T> {
    // registration retracted; a parked put hands its value back.
    Detached(Option<T>),
    // the waiter had already fired; the outcome is handed over instead.
    AlreadyFired(Fired<T>),
}

// a parked operation, shared between the channel's waiter queue and the owning future.
pub(crate) struct Waiter<T>(Arc<Inner<T>>);

struct Inner<T> {
    token: Token,
    state: Mutex<State<T>>,
}

impl<T> Waiter<T> {
    pub(crate) fn parked_take(token: Token, waker: Waker) -> Self {
        Waiter(Arc::new(Inner {
            token,
            state: Mutex::new(State::Parked { value: None, waker: Some(waker) }),
        }))
    }

    pub(crate) fn parked_put(token: Token, value: T, waker: Waker) -> Self {
        Waiter(Arc::new(Inner {
            token,
            state: Mutex::new(State::Parked { value: Some(value), waker: Some(waker) }),
        }))
    }

    pub(crate) fn clone(&self) -> Self {
        Waiter(Arc::clone(&self.0))
    }

    pub(crate) fn token(&self) -> &Token {
        &self.0.token
    }

    // identity, for unlinking from a queue.
    pub(crate) fn is(&self, other: &Waiter<T>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    // drain the pending value out of a parked put. the caller must have claimed the token.
    pub(crate) fn take_value(&self) -> T {
        let mut state = self.0.state.lock().unwrap();
        match &mut *state {
            State::Parked { value, waker } => {
                let value = value.take().expect("value taken from a take waiter");
                let waker = waker.take();
                *state = State::Claimed { waker };
                value
            }
            _ => panic!("value taken from a waiter that is not parked"),
        }
    }

    // deposit the outcome and wake the owner.
    //
    // a waiter fires at most once. firing twice means a registration was resumed after it
    // already resumed, which is a bug in commit arbitration, so it aborts loudly instead of
    // being tolerated.
    pub(crate) fn fire(&self, outcome: Fired<T>) {
        let waker = {
            let mut state = self.0.state.lock().unwrap();
            match std::mem::replace(&mut *state, State::Fired(Some(outcome))) {
                State::Parked { value, waker } => {
                    debug_assert!(value.is_none(), "put waiter fired without draining its value");
                    drop(value);
                    waker
                }
                State::Claimed { waker } => waker,
                State::Fired(_) => panic!("waiter fired twice"),
                State::Cancelled => panic!("fired a cancelled waiter"),
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    // owner-side poll: extract the outcome if fired, otherwise re-arm the waker.
    pub(crate) fn poll_outcome(&self, waker: &Waker) -> Option<Fired<T>> {
        let mut state = self.0.state.lock().unwrap();
        match &mut *state {
            State::Parked { waker: slot, .. } | State::Claimed { waker: slot } => {
                *slot = Some(waker.clone());
                None
            }
            State::Fired(outcome) => Some(outcome.take().expect("waiter outcome already taken")),
            State::Cancelled => panic!("polled a cancelled waiter"),
        }
    }

    // owner-side cancellation. must be called with the owning channel's lock held, so that
    // a concurrent firing is either fully deposited or not started.
    pub(crate) fn cancel(&self) -> Cancel<T> {
        let claimed = self.0.token.claim();
        let mut state = self.0.state.lock().unwrap();
        match std::mem::replace(&mut *state, State::Cancelled) {
            State::Parked { value, .. } => {
                // when the claim was lost but the state is still parked, this is a sibling
                // arm of an alts call that committed elsewhere; retracting it is the same.
                Cancel::Detached(value)
            }
            State::Fired(Some(outcome)) => {
                debug_assert!(!claimed, "claimed a fired waiter");
                Cancel::AlreadyFired(outcome)
            }
            State::Fired(None) | State::Claimed { .. } | State::Cancelled => {
                panic!("waiter cancelled twice or cancelled mid-fire")
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Waker;

    fn noop() -> Waker {
        futures::task::noop_waker()
    }

    #[test]
    fn fire_then_extract() {
        let w: Waiter<u32> = Waiter::parked_take(Token::new(), noop());
        assert!(w.token().claim());
        w.fire(Fired::Value(7));
        match w.poll_outcome(&noop()) {
            Some(Fired::Value(7)) => (),
            _ => panic!("expected the deposited value"),
        }
    }

    #[test]
    #[should_panic(expected = "waiter fired twice")]
    fn double_fire_panics() {
        let w: Waiter<u32> = Waiter::parked_take(Token::new(), noop());
        assert!(w.token().claim());
        w.fire(Fired::Closed);
        w.fire(Fired::Closed);
    }

    #[test]
    fn cancel_detaches_put_value() {
        let w = Waiter::parked_put(Token::new(), 5u32, noop());
        match w.cancel() {
            Cancel::Detached(Some(5)) => (),
            _ => panic!("expected the pending value back"),
        }
        assert!(!w.token().claim());
    }

    #[test]
    fn shared_token_claims_once() {
        let token = Token::new();
        assert!(token.claim());
        assert!(!token.clone().claim());
        match Token::acquire(None, &token) {
            Acquire::OtherLost => (),
            _ => panic!("claimed token must read as a dead registration"),
        }
    }

    #[test]
    fn acquire_refuses_self_pairing() {
        let token = Token::new();
        match Token::acquire(Some(&token), &token.clone()) {
            Acquire::Sibling => (),
            _ => panic!("a token must not commit against itself"),
        }
        assert!(token.claim());
    }
}
