//! Transform pipelines applied to values as they enter a channel's buffer.
//!
//! A pipeline is fixed at channel construction and runs, stage by stage in declaration
//! order, on every value the channel admits, before the value becomes visible to any take.

use crate::channel::error::StageError;


/// What a stage decided about one offered value
pub enum Step<T> {
    /// Keep going with this (possibly transformed) value
    Pass(T),
    /// Suppress the value; the offering put still succeeds
    Skip,
    /// Suppress the value and close the channel for future puts
    Halt,
}

/// A single transformation stage
///
/// Stages may keep state between values (see [`Pipeline::dedupe`]). Returning an error is
/// fatal for the channel that owns the pipeline.
pub trait Stage<T>: Send {
    /// Offer one value to the stage
    fn apply(&mut self, value: T) -> anyhow::Result<Step<T>>;
}

/// Ordered chain of stages decorating a channel's buffer
pub struct Pipeline<T> {
    stages: Vec<Box<dyn Stage<T>>>,
}

impl<T> Pipeline<T> {
    /// The empty pipeline: every value passes unchanged
    pub fn new() -> Self {
        Pipeline { stages: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Append a caller-supplied stage
    pub fn stage(mut self, stage: impl Stage<T> + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Append a stage transforming every value
    pub fn map(self, f: impl FnMut(T) -> T + Send + 'static) -> Self {
        self.stage(Map(f))
    }

    /// Append a fallible transforming stage
    ///
    /// An error from `f` closes the channel and fails the put that offered the value.
    pub fn try_map(self, f: impl FnMut(T) -> anyhow::Result<T> + Send + 'static) -> Self {
        self.stage(TryMap(f))
    }

    /// Append a stage suppressing values that fail the predicate
    pub fn filter(self, pred: impl FnMut(&T) -> bool + Send + 'static) -> Self {
        self.stage(Filter(pred))
    }

    /// Append a stage passing values until the predicate first fails, then closing the
    /// channel
    pub fn take_while(self, pred: impl FnMut(&T) -> bool + Send + 'static) -> Self {
        self.stage(TakeWhile(pred))
    }

    /// Append a stage suppressing consecutive duplicate values
    pub fn dedupe(self) -> Self
    where
        T: PartialEq + Clone + Send + 'static,
    {
        self.stage(Dedupe { last: None })
    }

    // run a value through every stage in order.
    pub(crate) fn offer(&mut self, mut value: T) -> Result<Step<T>, StageError> {
        for stage in &mut self.stages {
            match stage.apply(value).map_err(StageError::from)? {
                Step::Pass(next) => value = next,
                Step::Skip => return Ok(Step::Skip),
                Step::Halt => return Ok(Step::Halt),
            }
        }
        Ok(Step::Pass(value))
    }
}

impl<T> Default for Pipeline<T> {
    fn default() -> Self {
        Pipeline::new()
    }
}


struct Map<F>(F);

impl<T, F: FnMut(T) -> T + Send> Stage<T> for Map<F> {
    fn apply(&mut self, value: T) -> anyhow::Result<Step<T>> {
        Ok(Step::Pass((self.0)(value)))
    }
}

struct TryMap<F>(F);

impl<T, F: FnMut(T) -> anyhow::Result<T> + Send> Stage<T> for TryMap<F> {
    fn apply(&mut self, value: T) -> anyhow::Result<Step<T>> {
        Ok(Step::Pass((self.0)(value)?))
    }
}

struct Filter<F>(F);

impl<T, F: FnMut(&T) -> bool + Send> Stage<T> for Filter<F> {
    fn apply(&mut self, value: T) -> anyhow::Result<Step<T>> {
        Ok(if (self.0)(&value) { Step::Pass(value) } else { Step::Skip })
    }
}

struct TakeWhile<F>(F);

impl<T, F: FnMut(&T) -> bool + Send> Stage<T> for TakeWhile<F> {
    fn apply(&mut self, value: T) -> anyhow::Result<Step<T>> {
        Ok(if (self.0)(&value) { Step::Pass(value) } else { Step::Halt })
    }
}

struct Dedupe<T> {
    last: Option<T>,
}

impl<T: PartialEq + Clone + Send> Stage<T> for Dedupe<T> {
    fn apply(&mut self, value: T) -> anyhow::Result<Step<T>> {
        if self.last.as_ref() == Some(&value) {
            Ok(Step::Skip)
        } else {
            self.last = Some(value.clone());
            Ok(Step::Pass(value))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn run(pipeline: &mut Pipeline<i32>, values: impl IntoIterator<Item = i32>) -> Vec<i32> {
        let mut out = Vec::new();
        for value in values {
            match pipeline.offer(value) {
                Ok(Step::Pass(value)) => out.push(value),
                Ok(Step::Skip) | Ok(Step::Halt) => (),
                Err(e) => panic!("unexpected stage failure: {}", e),
            }
        }
        out
    }

    #[test]
    fn stages_run_in_declaration_order() {
        let mut p = Pipeline::new().map(|n| n + 1).filter(|n| n % 2 == 0);
        assert_eq!(run(&mut p, [1, 2, 3, 4]), vec![2, 4]);
    }

    #[test]
    fn dedupe_suppresses_consecutive_repeats() {
        let mut p = Pipeline::new().dedupe();
        assert_eq!(run(&mut p, [1, 1, 2, 2, 2, 1]), vec![1, 2, 1]);
    }

    #[test]
    fn take_while_halts_at_first_failure() {
        let mut p = Pipeline::new().take_while(|n| *n < 3);
        assert!(matches!(p.offer(1), Ok(Step::Pass(1))));
        assert!(matches!(p.offer(3), Ok(Step::Halt)));
    }

    #[test]
    fn try_map_error_surfaces() {
        let mut p = Pipeline::new().try_map(|n| {
            if n == 13 {
                Err(anyhow!("unlucky"))
            } else {
                Ok(n)
            }
        });
        assert!(matches!(p.offer(12), Ok(Step::Pass(12))));
        assert!(p.offer(13).is_err());
    }
}
