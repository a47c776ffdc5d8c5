//! Error handling
//!
//! Every fallible operation in this crate returns [`Result`]. Errors pass unchanged through the
//! collective front-end, the algorithm selector and the schedule engine; none of these layers
//! formats user-facing MPI error strings.
//!
//! Internal consistency failures (a selection table without a matching entry, a mapper whose
//! direction contradicts the communicator kinds) are not represented here. They indicate a bug
//! in the runtime's own tables and abort via `panic!`.

use crate::topology::ContextId;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Recoverable error conditions.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An allocation for a table, scratch buffer or hook entry could not be satisfied.
    #[error("out of memory allocating {what} ({bytes} bytes)")]
    NoMem { what: &'static str, bytes: usize },

    /// A communicator create or destroy hook reported failure.
    #[error("{hook} hook failed on communicator {context_id}: {reason}")]
    Hook {
        hook: String,
        context_id: ContextId,
        reason: String,
    },

    /// A message arrived that does not fit the region posted to receive it.
    #[error("message truncated: {received} bytes received into a {capacity} byte region")]
    Truncate { received: usize, capacity: usize },

    /// A buffer is too small for the region a collective needs to address.
    #[error("buffer too small: {needed} bytes required, {actual} available")]
    BufferTooSmall { needed: usize, actual: usize },

    /// A collective needed a buffer that was not supplied on this process.
    #[error("{operation} requires a {which} buffer on this process")]
    MissingBuffer {
        operation: &'static str,
        which: &'static str,
    },

    /// The transport failed to deliver or match a message.
    #[error("transport error: {0}")]
    Transport(String),

    /// A device-layer collective failed.
    #[error("device collective failed: {0}")]
    Device(String),

    /// A forced algorithm cannot run on this call and the fallback policy is `error`.
    #[error("algorithm {algorithm} cannot be applied: {reason}")]
    NotApplicable {
        algorithm: &'static str,
        reason: String,
    },

    /// A tunable carried a value outside its recognized set.
    #[error("invalid value {value:?} for {name}")]
    Config { name: &'static str, value: String },

    /// A lock guarding runtime state was poisoned by a panicking thread.
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),

    /// The universe owning this object has been finalized.
    #[error("runtime already finalized")]
    Finalized,
}

impl Error {
    /// Create a `Hook` error for a hook named `hook` failing on communicator `context_id`.
    pub fn hook(hook: impl Into<String>, context_id: ContextId, reason: impl Into<String>) -> Self {
        Error::Hook {
            hook: hook.into(),
            context_id,
            reason: reason.into(),
        }
    }

    /// Create a `Transport` error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Create a `Device` error.
    pub fn device(msg: impl Into<String>) -> Self {
        Error::Device(msg.into())
    }

    /// Whether this error reports resource exhaustion.
    pub fn is_no_mem(&self) -> bool {
        matches!(self, Error::NoMem { .. })
    }
}

/// Reserve exactly `additional` slots in `vec`, reporting failure as `Error::NoMem`.
pub(crate) fn try_reserve<T>(vec: &mut Vec<T>, additional: usize, what: &'static str) -> Result<()> {
    vec.try_reserve_exact(additional).map_err(|_| Error::NoMem {
        what,
        bytes: additional.saturating_mul(std::mem::size_of::<T>()),
    })
}

/// Allocate a zeroed byte buffer of `len` bytes, reporting failure as `Error::NoMem`.
pub(crate) fn try_alloc_bytes(len: usize, what: &'static str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    try_reserve(&mut buf, len, what)?;
    buf.resize(len, 0);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_error_display() {
        let e = Error::hook("anysource", ContextId::from_raw(8), "boom");
        assert_eq!(
            e.to_string(),
            "anysource hook failed on communicator 8: boom"
        );
    }

    #[test]
    fn truncate_display() {
        let e = Error::Truncate {
            received: 16,
            capacity: 8,
        };
        assert_eq!(
            e.to_string(),
            "message truncated: 16 bytes received into a 8 byte region"
        );
    }

    #[test]
    fn absurd_reservation_is_no_mem() {
        let mut v: Vec<u64> = Vec::new();
        let err = try_reserve(&mut v, usize::MAX / 2, "test table").unwrap_err();
        assert!(err.is_no_mem());
    }

    #[test]
    fn alloc_bytes_is_zeroed() {
        let buf = try_alloc_bytes(32, "scratch").unwrap();
        assert_eq!(buf.len(), 32);
        assert!(buf.iter().all(|&b| b == 0));
    }
}
