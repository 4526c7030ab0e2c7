// blocking adapter for channel futures.
//
// design based on the pollster crate: park the calling thread on a condvar until the
// future's waker notifies it. this is what lets foreign threads (event sources, tests) use
// channels without a scheduler.

use futures::task::{waker, ArcWake};
use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Condvar, Mutex},
    task::{Context, Poll},
    time::Instant,
};


// timeout for blocking on a future.
pub(crate) enum Timeout {
    // never time out.
    Never,
    // time out at the given deadline.
    At(Instant),
    // time out if the future cannot be resolved without blocking.
    NonBlocking,
}

// synchronization signal state.
enum State {
    Empty,
    Waiting,
    Notified,
}

// synchronization signal. doubles as the waker.
struct Signal {
    state: Mutex<State>,
    cond: Condvar,
}

impl ArcWake for Signal {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let mut state = arc_self.state.lock().unwrap();
        match *state {
            State::Notified => (),
            State::Empty => *state = State::Notified,
            State::Waiting => {
                *state = State::Empty;
                arc_self.cond.notify_one();
            }
        }
    }
}

// poll the future until it resolves or the timeout is reached, in which case return err.
//
// a timed-out future may have parked a registration somewhere; the caller is responsible
// for retracting it.
pub(crate) fn block_on<F>(fut: &mut F, timeout: Timeout) -> Result<F::Output, ()>
where
    F: Future + Unpin,
{
    let signal = Arc::new(Signal {
        state: Mutex::new(State::Empty),
        cond: Condvar::new(),
    });
    let waker = waker(Arc::clone(&signal));
    let mut cx = Context::from_waker(&waker);

    loop {
        // return if ready
        if let Poll::Ready(output) = Pin::new(&mut *fut).poll(&mut cx) {
            return Ok(output);
        }

        // otherwise, block until notification or timeout
        let mut state = signal.state.lock().unwrap();

        // if a notification is already present, release the lock and poll again
        if let State::Notified = *state {
            *state = State::Empty;
            continue;
        }

        debug_assert!(matches!(*state, State::Empty));
        *state = State::Waiting;
        match &timeout {
            &Timeout::Never => {
                while let State::Waiting = *state {
                    state = signal.cond.wait(state).unwrap();
                }
            }

            &Timeout::At(deadline) => {
                while let State::Waiting = *state {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return Err(());
                    };
                    let (state2, wait_result) =
                        signal.cond.wait_timeout(state, remaining).unwrap();
                    state = state2;
                    if wait_result.timed_out() {
                        return Err(());
                    }
                }
            }

            &Timeout::NonBlocking => return Err(()),
        }
        *state = State::Empty;
    }
}
