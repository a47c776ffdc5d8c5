use std::sync::Arc;

use crate::environment::Shared;
use crate::topology::CommState;

/// A communicator handle: the communicator's state plus the runtime it belongs to.
///
/// The handle itself has no drop semantics. Whether dropping the owning value destroys the
/// communicator is decided by the public wrapper type (`SystemCommunicator` never does,
/// `UserCommunicator` does).
pub struct CommHandle {
    pub(crate) state: Arc<CommState>,
    pub(crate) shared: Arc<Shared>,
}

impl CommHandle {
    pub(crate) fn new(state: Arc<CommState>, shared: Arc<Shared>) -> Self {
        CommHandle { state, shared }
    }
}

impl Clone for CommHandle {
    fn clone(&self) -> Self {
        CommHandle {
            state: Arc::clone(&self.state),
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Get a handle from a communicator. This trait is used internally to treat different
/// communicator types uniformly and allow borrowing handles from trait-object communicators.
pub trait AsHandle {
    fn as_handle(&self) -> &CommHandle;
}
