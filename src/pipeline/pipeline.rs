//! Pipeline structure and configuration-time surgery

use super::Step;
use crate::errors::{BusError, BusResult};
use std::sync::Arc;

/// Where to insert a step relative to the existing chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPosition {
    /// Ahead of every existing step
    First,
    /// Behind every existing step
    Last,
    /// Immediately before the named step
    Before(&'static str),
    /// Immediately after the named step
    After(&'static str),
}

/// The ordered incoming and outgoing step chains.
///
/// Mutable only during configuration; the invoker materializes the chains
/// once at bus construction and they are immutable afterwards.
#[derive(Default)]
pub struct Pipeline {
    incoming: Vec<Arc<dyn Step>>,
    outgoing: Vec<Arc<dyn Step>>,
}

impl Pipeline {
    /// Creates an empty pipeline
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a receive step at the given position
    pub fn insert_incoming(&mut self, step: Arc<dyn Step>, position: StepPosition) -> BusResult<()> {
        Self::insert(&mut self.incoming, step, position)
    }

    /// Inserts a send step at the given position
    pub fn insert_outgoing(&mut self, step: Arc<dyn Step>, position: StepPosition) -> BusResult<()> {
        Self::insert(&mut self.outgoing, step, position)
    }

    /// Removes every receive step matching the predicate, returning how
    /// many were removed
    pub fn remove_incoming(&mut self, predicate: impl Fn(&dyn Step) -> bool) -> usize {
        Self::remove(&mut self.incoming, predicate)
    }

    /// Removes every send step matching the predicate
    pub fn remove_outgoing(&mut self, predicate: impl Fn(&dyn Step) -> bool) -> usize {
        Self::remove(&mut self.outgoing, predicate)
    }

    /// Names of the receive steps, in order
    pub fn incoming_names(&self) -> Vec<&'static str> {
        self.incoming.iter().map(|step| step.name()).collect()
    }

    /// Names of the send steps, in order
    pub fn outgoing_names(&self) -> Vec<&'static str> {
        self.outgoing.iter().map(|step| step.name()).collect()
    }

    pub(crate) fn into_chains(self) -> (Arc<[Arc<dyn Step>]>, Arc<[Arc<dyn Step>]>) {
        (self.incoming.into(), self.outgoing.into())
    }

    fn insert(
        steps: &mut Vec<Arc<dyn Step>>,
        step: Arc<dyn Step>,
        position: StepPosition,
    ) -> BusResult<()> {
        let index = match position {
            StepPosition::First => 0,
            StepPosition::Last => steps.len(),
            StepPosition::Before(anchor) => Self::index_of(steps, anchor)?,
            StepPosition::After(anchor) => Self::index_of(steps, anchor)? + 1,
        };
        steps.insert(index, step);
        Ok(())
    }

    fn remove(steps: &mut Vec<Arc<dyn Step>>, predicate: impl Fn(&dyn Step) -> bool) -> usize {
        let before = steps.len();
        steps.retain(|step| !predicate(step.as_ref()));
        before - steps.len()
    }

    fn index_of(steps: &[Arc<dyn Step>], anchor: &'static str) -> BusResult<usize> {
        steps
            .iter()
            .position(|step| step.name() == anchor)
            .ok_or_else(|| {
                BusError::configuration(format!("pipeline has no step named {anchor}"))
            })
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("incoming", &self.incoming_names())
            .field("outgoing", &self.outgoing_names())
            .finish()
    }
}
