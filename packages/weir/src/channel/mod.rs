// implementation of the weir channel.
//
// the basic architecture is as such:
//
// channel handles wrap around Arc<Mutex<shared state>>
//                                         |
//          /------------------------------/
//          v
//       shared state
//          |
//          |------ it contains a bounded VecDeque<T> holding the buffered elements; the
//          |       transform pipeline runs as values enter it
//          |
//          |------ it contains a "putter queue":
//          |
//          |       a FIFO queue of waiters, each corresponding to a pending put future.
//          |       a waiter carries the pending value, a stored waker, and a one-shot
//          |       claim token; the queue order is what gives per-channel fairness.
//          |
//          \------ it contains a "taker queue", which is the same idea for take futures.
//
// the organization of these modules is as such:
//
//      These are used like
//      library utilities:
//    /--------------------\
//
//      waiter<----------------core: holds the lockable state and all operation logic.
//                   |         ^     complete and sound, but inconvenient: every operation
//                   |         |     is a raw single step against the state.
//                   |         |
//      polling<---------------api: wraps core into the exposed API: the Channel handle and
//                                  the put/take futures with their blocking adapters. the
//                                  crate re-exports this publically.
//
// there is also the error module, which contains the relevant error types, which is also
// re-exported publically.

pub(crate) mod api;
pub(crate) mod error;

pub(crate) mod core;
pub(crate) mod polling;
pub(crate) mod waiter;
