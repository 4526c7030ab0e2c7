//! The cooperative scheduler that routines run on.
//!
//! A routine body is ordinary sequential logic (an `async` block) that suspends at channel
//! operations. The scheduler is an explicit object: routines are registered against it,
//! never spawned into ambient global state. Between suspension points a routine runs
//! uninterrupted; distinct schedulers may run on distinct threads, with channels as the
//! only shared-state boundary.

use crate::channel::api::{channel, Channel};
use futures::task::{waker, ArcWake};
use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::{Arc, Condvar, Mutex, Weak},
    time::{Duration, Instant},
};


/// Cooperative scheduler for routines
pub struct Scheduler {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    // signalled when a routine becomes ready, a timer is registered, or a routine finishes
    unparked: Condvar,
}

struct State {
    routines: HashMap<u64, Routine>,
    // resumptions fire in registration order
    ready: VecDeque<u64>,
    timers: BinaryHeap<Reverse<Timer>>,
    next_routine: u64,
    next_timer: u64,
}

struct Routine {
    // absent while the routine is being polled
    fut: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
    run_state: RunState,
}

// where a routine currently stands with respect to the ready queue.
#[derive(Copy, Clone, PartialEq, Eq)]
enum RunState {
    // parked; a wake moves it to Queued.
    Idle,
    // in the ready queue (or about to be polled by spawn).
    Queued,
    // checked out by a worker.
    Running,
    // checked out, and a wake arrived meanwhile: requeue on restore.
    RunningNotified,
}

struct Timer {
    deadline: Instant,
    seq: u64,
    action: Box<dyn FnOnce() + Send>,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

// waker for a parked routine: re-enqueues it, once, in arrival order.
struct RoutineWaker {
    shared: Weak<Shared>,
    id: u64,
}

impl ArcWake for RoutineWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let Some(shared) = arc_self.shared.upgrade() else { return };
        let mut state = shared.state.lock().unwrap();
        let enqueue = {
            let Some(routine) = state.routines.get_mut(&arc_self.id) else { return };
            match routine.run_state {
                RunState::Idle => {
                    routine.run_state = RunState::Queued;
                    true
                }
                // a wake that lands while the routine is checked out must not be lost:
                // the worker requeues it when it restores the future
                RunState::Running => {
                    routine.run_state = RunState::RunningNotified;
                    false
                }
                RunState::Queued | RunState::RunningNotified => false,
            }
        };
        if enqueue {
            state.ready.push_back(arc_self.id);
            drop(state);
            shared.unparked.notify_all();
        }
    }
}

impl Scheduler {
    /// Construct a scheduler with no routines
    pub fn new() -> Self {
        Scheduler {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    routines: HashMap::new(),
                    ready: VecDeque::new(),
                    timers: BinaryHeap::new(),
                    next_routine: 0,
                    next_timer: 0,
                }),
                unparked: Condvar::new(),
            }),
        }
    }

    /// Submit a routine body
    ///
    /// The body runs synchronously up to its first suspension point, then parks until its
    /// pending operation completes; [`run`](Self::run) drives it from there. The handle
    /// yields the body's output once the routine finishes.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let routine_slot = Arc::clone(&slot);
        let wrapped = async move {
            let output = fut.await;
            *routine_slot.lock().unwrap() = Some(output);
        };
        let id = {
            let mut state = self.shared.state.lock().unwrap();
            let id = state.next_routine;
            state.next_routine += 1;
            state.routines.insert(
                id,
                Routine { fut: Some(Box::pin(wrapped)), run_state: RunState::Queued },
            );
            id
        };
        trace!(routine = id, "spawned routine");
        self.poll_routine(id);
        JoinHandle { slot }
    }

    /// Drive routines until none are live and no timers are pending
    ///
    /// The calling thread sleeps while every live routine is parked. Resumptions fire in
    /// registration order. A routine set that deadlocks keeps `run` parked.
    pub fn run(&self) {
        loop {
            let mut state = self.shared.state.lock().unwrap();

            // fire due timers first
            let now = Instant::now();
            let mut due = Vec::new();
            while state.timers.peek().is_some_and(|t| t.0.deadline <= now) {
                due.push(state.timers.pop().unwrap().0.action);
            }
            if !due.is_empty() {
                drop(state);
                for action in due {
                    action();
                }
                continue;
            }

            if let Some(id) = state.ready.pop_front() {
                drop(state);
                self.poll_routine(id);
                continue;
            }

            if state.routines.is_empty() && state.timers.is_empty() {
                return;
            }

            // everything is parked: sleep until a wake or the next timer deadline
            match state.timers.peek().map(|t| t.0.deadline) {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    drop(self.shared.unparked.wait_timeout(state, wait).unwrap());
                }
                None => {
                    drop(self.shared.unparked.wait(state).unwrap());
                }
            }
        }
    }

    /// Drive ready routines and due timers, without sleeping
    ///
    /// Returns once every live routine is parked and no timer is due, leaving parked
    /// routines in place. This is the incremental variant of [`run`](Self::run), for
    /// embedding the scheduler in an external event loop.
    pub fn run_until_idle(&self) {
        loop {
            let mut state = self.shared.state.lock().unwrap();
            let now = Instant::now();
            let mut due = Vec::new();
            while state.timers.peek().is_some_and(|t| t.0.deadline <= now) {
                due.push(state.timers.pop().unwrap().0.action);
            }
            if !due.is_empty() {
                drop(state);
                for action in due {
                    action();
                }
                continue;
            }
            if let Some(id) = state.ready.pop_front() {
                drop(state);
                self.poll_routine(id);
                continue;
            }
            return;
        }
    }

    /// A channel that closes once `after` has elapsed
    ///
    /// The deadline idiom: race an operation against a timeout channel inside
    /// [`alts`](crate::alts). The channel never carries a value; takes on it yield `None`
    /// once it fires. It is generic over the carried type so it can stand next to any
    /// other candidate. The timer runs off this scheduler's [`run`](Self::run) loop.
    pub fn timeout<T: Send + 'static>(&self, after: Duration) -> Channel<T> {
        let ch = channel(0);
        let fire = ch.clone();
        {
            let mut state = self.shared.state.lock().unwrap();
            let seq = state.next_timer;
            state.next_timer += 1;
            state.timers.push(Reverse(Timer {
                deadline: Instant::now() + after,
                seq,
                action: Box::new(move || {
                    trace!("timeout channel elapsed");
                    fire.close();
                }),
            }));
        }
        self.shared.unparked.notify_all();
        ch
    }

    // resume one routine: run it until it suspends again or finishes.
    fn poll_routine(&self, id: u64) {
        let mut fut = {
            let mut state = self.shared.state.lock().unwrap();
            let Some(routine) = state.routines.get_mut(&id) else { return };
            // only a queued routine may be checked out; anything else is a stale entry
            if routine.run_state != RunState::Queued {
                return;
            }
            routine.run_state = RunState::Running;
            routine.fut.take().expect("queued routine has no future")
        };
        let waker = waker(Arc::new(RoutineWaker {
            shared: Arc::downgrade(&self.shared),
            id,
        }));
        let mut cx = std::task::Context::from_waker(&waker);
        let done = fut.as_mut().poll(&mut cx).is_ready();
        {
            let mut state = self.shared.state.lock().unwrap();
            if done {
                state.routines.remove(&id);
            } else {
                let requeue = {
                    let Some(routine) = state.routines.get_mut(&id) else { return };
                    routine.fut = Some(fut);
                    let requeue = routine.run_state == RunState::RunningNotified;
                    routine.run_state = if requeue { RunState::Queued } else { RunState::Idle };
                    requeue
                };
                if requeue {
                    state.ready.push_back(id);
                }
            }
        }
        if done {
            trace!(routine = id, "routine finished");
            self.shared.unparked.notify_all();
        }
    }
}

impl Clone for Scheduler {
    fn clone(&self) -> Self {
        Scheduler { shared: Arc::clone(&self.shared) }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}


/// Handle to a spawned routine's output
pub struct JoinHandle<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> JoinHandle<T> {
    /// Take the routine's output, if the routine has finished
    pub fn output(&self) -> Option<T> {
        self.slot.lock().unwrap().take()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn spawn_runs_to_first_suspension_synchronously() {
        let sched = Scheduler::new();
        let ch = channel::<u32>(1);
        let put = {
            let ch = ch.clone();
            sched.spawn(async move { ch.put(5).await.is_ok() })
        };
        // the routine completed its buffered put before run() was ever called
        assert_eq!(ch.len(), 1);
        sched.run();
        assert_eq!(put.output(), Some(true));
    }

    #[test]
    fn rendezvous_put_waits_for_the_take() {
        let sched = Scheduler::new();
        let ch = channel(0);
        let log = Arc::new(Mutex::new(Vec::new()));

        let putter = {
            let ch = ch.clone();
            let log = Arc::clone(&log);
            sched.spawn(async move {
                ch.put(5).await.unwrap();
                log.lock().unwrap().push("put returned");
            })
        };
        let taker = {
            let ch = ch.clone();
            let log = Arc::clone(&log);
            sched.spawn(async move {
                let got = ch.take().await;
                log.lock().unwrap().push("took");
                got
            })
        };
        sched.run();

        assert_eq!(taker.output(), Some(Some(5)));
        assert_eq!(putter.output(), Some(()));
        // the put could not return before the take observed the value
        assert_eq!(*log.lock().unwrap(), vec!["took", "put returned"]);
    }

    #[test]
    fn timeout_channel_closes_after_duration() {
        let sched = Scheduler::new();
        let started = Instant::now();
        let elapsed = {
            let timer = sched.timeout::<()>(Duration::from_millis(50));
            sched.spawn(async move {
                timer.take().await;
                started.elapsed()
            })
        };
        sched.run();
        assert!(elapsed.output().unwrap() >= Duration::from_millis(50));
    }

    #[test]
    fn waiting_takers_are_served_fifo() {
        let sched = Scheduler::new();
        let ch = channel(0);
        let first = {
            let ch = ch.clone();
            sched.spawn(async move { ch.take().await })
        };
        let second = {
            let ch = ch.clone();
            sched.spawn(async move { ch.take().await })
        };
        {
            let ch = ch.clone();
            sched.spawn(async move {
                ch.put(1).await.unwrap();
                ch.put(2).await.unwrap();
            });
        }
        sched.run();
        assert_eq!(first.output(), Some(Some(1)));
        assert_eq!(second.output(), Some(Some(2)));
    }

    #[test]
    fn routines_interleave_through_a_channel() {
        let sched = Scheduler::new();
        let ch = channel(0);
        let sum = {
            let ch = ch.clone();
            sched.spawn(async move {
                let mut sum = 0u64;
                while let Some(n) = ch.take().await {
                    sum += n;
                }
                sum
            })
        };
        {
            let ch = ch.clone();
            sched.spawn(async move {
                for n in 1..=100 {
                    ch.put(n).await.unwrap();
                }
                ch.close();
            });
        }
        sched.run();
        assert_eq!(sum.output(), Some(5050));
    }
}
