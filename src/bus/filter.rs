//! Bus filter chain.
//!
//! Filters run after schema validation and before dispatcher resolution,
//! in registration order. Each filter may pass the signal on, answer it
//! with an ack, or drop it silently.

use std::sync::Arc;

use crate::signal::{Ack, Envelope};

/// What a filter decided about a signal.
pub enum FilterOutcome {
    /// Hand the signal to the next filter (or to dispatch).
    Pass,
    /// Short-circuit: answer the caller with this ack, do not dispatch.
    Ack(Ack),
    /// Short-circuit: drop without dispatching; the caller sees a plain
    /// positive ack.
    Drop,
}

/// One link of the filter chain.
pub trait BusFilter: Send + Sync {
    fn accept(&self, envelope: &Envelope<'_>) -> FilterOutcome;
}

/// An ordered chain of filters applied before dispatch.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn BusFilter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn BusFilter>>) -> Self {
        FilterChain { filters }
    }

    pub fn push(&mut self, filter: Arc<dyn BusFilter>) {
        self.filters.push(filter);
    }

    /// Run the chain. `None` means every filter passed.
    pub fn apply(&self, envelope: &Envelope<'_>) -> Option<FilterOutcome> {
        for filter in &self.filters {
            match filter.accept(envelope) {
                FilterOutcome::Pass => continue,
                outcome => return Some(outcome),
            }
        }
        None
    }
}
