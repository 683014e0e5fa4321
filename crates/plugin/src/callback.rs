//! Single-use completion callbacks.
//!
//! Both traits take `self: Box<Self>`, so a callback can fire at most once.

use crate::{Failure, Payload, StateSnapshot};

/// Completion of a load, execute or unload call.
pub trait PluginCallback: Send + 'static {
    /// The call succeeded. Load and unload report an empty payload.
    fn on_success(self: Box<Self>, output: Payload);

    /// The call failed.
    fn on_failure(self: Box<Self>, failure: Failure);
}

impl<F> PluginCallback for F
where
    F: FnOnce(Result<Payload, Failure>) + Send + 'static,
{
    fn on_success(self: Box<Self>, output: Payload) {
        (*self)(Ok(output));
    }

    fn on_failure(self: Box<Self>, failure: Failure) {
        (*self)(Err(failure));
    }
}

/// Completion of a state query.
pub trait StateCallback: Send + 'static {
    /// The observed state.
    fn on_state(self: Box<Self>, snapshot: StateSnapshot);
}

impl<F> StateCallback for F
where
    F: FnOnce(StateSnapshot) + Send + 'static,
{
    fn on_state(self: Box<Self>, snapshot: StateSnapshot) {
        (*self)(snapshot);
    }
}
