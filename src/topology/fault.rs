//! Reaction to failed processes
//!
//! When processes fail, any-source receipt is disabled on every live communicator that can
//! reach one of them, so that wildcard receives cannot hang waiting for a dead peer.

use crate::environment::Shared;
use crate::error::Result;
use crate::topology::{CommRef, Role};
use crate::transport::Endpoint;

/// Whether `comm` can communicate with any of `failed`.
///
/// The world communicator and its internal duplicate contain every process, so the answer is
/// `true` for them without consulting their tables.
pub(crate) fn nonempty_intersection(comm: &CommRef, failed: &[Endpoint]) -> bool {
    if matches!(comm.state().role, Role::World | Role::InternalWorld) {
        return true;
    }
    comm.state()
        .remote_view()
        .map_or(false, |table| failed.iter().any(|ep| table.contains(ep)))
}

/// Disable any-source receipt on every live communicator that still has it enabled and
/// intersects `failed`, then wake blocked waiters. Returns the number of communicators affected.
pub(crate) fn handle_failed_procs(shared: &Shared, failed: &[Endpoint]) -> Result<usize> {
    let mut disabled = 0;
    {
        let reg = shared.registry()?;
        for comm in reg.live.iter() {
            if !comm.is_anysource_enabled() {
                continue;
            }
            if nonempty_intersection(comm, failed) {
                comm.set_anysource_enabled(false);
                disabled += 1;
                tracing::debug!(context_id = %comm.context_id(), "any-source receipt disabled");
            }
        }
    }
    tracing::info!(failed = failed.len(), disabled, "handled failed processes");
    shared.progress.signal_completion();
    Ok(disabled)
}
