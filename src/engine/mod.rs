//! The boundary between the control loops and a recurrent language model.
//!
//! Controllers only ever talk to a model through [`RecurrentModel`]. The model
//! owns its live recurrent state; callers can take snapshots of it through
//! [`ForwardOutput::state`] and put them back with
//! [`RecurrentModel::set_state`], but never look inside.

pub mod accessor;

pub use accessor::{ModelAccessor, ModelFactory};

use crate::error::Result;

/// One `forward` request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForwardRequest<'a> {
    /// Strings that end the step loop early once they appear in the output.
    pub stop_strings: &'a [String],
    pub temperature: f32,
    pub top_p: f32,
    /// Added to the end-of-text logit before sampling.
    pub end_adjustment: f32,
    /// Upper bound on the tokens produced by this call.
    pub number: usize,
}

/// Text produced by a `forward` call and the state it left behind.
#[derive(Debug, Clone)]
pub struct ForwardOutput<S> {
    pub output: String,
    pub state: S,
}

/// A stateful recurrent language model.
pub trait RecurrentModel {
    /// Opaque snapshot of the recurrent state.
    type State: Clone;

    /// Clears the live state back to its initial value.
    fn reset_state(&mut self);

    /// The value [`reset_state`](Self::reset_state) resets to.
    fn empty_state(&self) -> Self::State;

    /// Advances the live state over `text` without producing output.
    fn load_context(&mut self, text: &str) -> Result<()>;

    /// Generates up to `request.number` tokens from the live state.
    fn forward(&mut self, request: &ForwardRequest<'_>) -> Result<ForwardOutput<Self::State>>;

    /// Replaces the live state with a snapshot.
    fn set_state(&mut self, state: &Self::State);
}
