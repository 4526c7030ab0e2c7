//! Channels, alts, merge, and a cooperative scheduler: a small CSP coordination core.
//!
//! Routine bodies are ordinary `async` blocks registered against an explicit
//! [`Scheduler`]; every channel [`put`](Channel::put), [`take`](Channel::take), or
//! [`alts`] call that cannot complete immediately is a suspension point. Foreign threads
//! (event sources, tests) reach the same channels through the blocking and try entry
//! points.

#[macro_use]
extern crate tracing;

mod channel;
mod merge;
mod runtime;
mod select;

pub mod pipeline;

pub use crate::channel::api::{channel, channel_with, Channel};
pub use crate::merge::merge;
pub use crate::pipeline::{Pipeline, Stage, Step};
pub use crate::runtime::{JoinHandle, Scheduler};
pub use crate::select::{alts, AltOutcome, Alts, Op, Selected};

/// Error types
pub mod error {
    pub use crate::channel::error::*;
}

/// Future types
pub mod future {
    pub use crate::channel::api::future::*;
}
