//! Point-to-point transport
//!
//! Byte delivery is the transport's concern, not the runtime core's. The core addresses peers by
//! `Endpoint` (resolved through a communicator's virtual connection table) and matches messages
//! on the full `Envelope`. Sends are eager: once `send` returns, the payload has been copied and
//! the caller's buffer may be reused. Messages with an identical envelope are delivered in the
//! order they were sent.
//!
//! `LocalFabric` is an in-process implementation shared by several `Universe`s, one per rank.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::topology::ContextId;
use crate::Tag;

/// A communication endpoint: one process of one process group.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pg: u32,
    rank: u32,
}

impl Endpoint {
    /// The endpoint of process `rank` in process group `pg`.
    pub const fn new(pg: u32, rank: u32) -> Self {
        Endpoint { pg, rank }
    }

    /// Process group this endpoint belongs to.
    pub fn process_group(&self) -> u32 {
        self.pg
    }

    /// Rank of the process inside its process group.
    pub fn pg_rank(&self) -> u32 {
        self.rank
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pg{}:{}", self.pg, self.rank)
    }
}

/// Everything a receive matches on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Envelope {
    /// Sending endpoint
    pub src: Endpoint,
    /// Receiving endpoint
    pub dst: Endpoint,
    /// Communication context
    pub context_id: ContextId,
    /// Message tag
    pub tag: Tag,
}

/// Transport collaborator used by schedules and transport-level algorithms.
pub trait Transport: Send + Sync {
    /// Deliver `payload` to `envelope.dst`. Returns once the payload has been copied.
    fn send(&self, envelope: &Envelope, payload: &[u8]) -> Result<()>;

    /// Try to match a message for `envelope` and copy it into `buf`.
    ///
    /// Returns the number of bytes received, or `None` if no matching message has arrived yet.
    /// A message larger than `buf` is consumed and reported as `Error::Truncate`.
    fn try_recv(&self, envelope: &Envelope, buf: &mut [u8]) -> Result<Option<usize>>;

    /// Close the connection to `endpoint`. Called when the last table referencing a
    /// disconnected communicator's endpoints is released.
    fn disconnect(&self, _endpoint: Endpoint) {}
}

/// An in-memory transport connecting the ranks of one process.
#[derive(Debug, Default)]
pub struct LocalFabric {
    queues: Mutex<HashMap<Envelope, VecDeque<Vec<u8>>>>,
    disconnected: Mutex<HashSet<Endpoint>>,
    delivered: AtomicU64,
}

impl LocalFabric {
    /// An empty fabric.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages sent but not yet received.
    pub fn pending(&self) -> usize {
        self.queues
            .lock()
            .map(|q| q.values().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    /// Number of messages received so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Whether `endpoint` has been disconnected.
    pub fn is_disconnected(&self, endpoint: Endpoint) -> bool {
        self.disconnected
            .lock()
            .map(|d| d.contains(&endpoint))
            .unwrap_or(false)
    }
}

impl Transport for LocalFabric {
    fn send(&self, envelope: &Envelope, payload: &[u8]) -> Result<()> {
        let mut queues = self
            .queues
            .lock()
            .map_err(|_| Error::LockPoisoned("local fabric queues"))?;
        queues
            .entry(*envelope)
            .or_default()
            .push_back(payload.to_vec());
        Ok(())
    }

    fn try_recv(&self, envelope: &Envelope, buf: &mut [u8]) -> Result<Option<usize>> {
        let mut queues = self
            .queues
            .lock()
            .map_err(|_| Error::LockPoisoned("local fabric queues"))?;
        let msg = match queues.get_mut(envelope).and_then(VecDeque::pop_front) {
            Some(msg) => msg,
            None => return Ok(None),
        };
        if queues.get(envelope).map_or(false, VecDeque::is_empty) {
            queues.remove(envelope);
        }
        drop(queues);

        self.delivered.fetch_add(1, Ordering::Relaxed);
        if msg.len() > buf.len() {
            return Err(Error::Truncate {
                received: msg.len(),
                capacity: buf.len(),
            });
        }
        buf[..msg.len()].copy_from_slice(&msg);
        Ok(Some(msg.len()))
    }

    fn disconnect(&self, endpoint: Endpoint) {
        if let Ok(mut d) = self.disconnected.lock() {
            d.insert(endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(src: u32, dst: u32, tag: Tag) -> Envelope {
        Envelope {
            src: Endpoint::new(0, src),
            dst: Endpoint::new(0, dst),
            context_id: ContextId::from_raw(1),
            tag,
        }
    }

    #[test]
    fn messages_match_on_full_envelope() {
        let fabric = LocalFabric::new();
        fabric.send(&env(0, 1, 5), b"hello").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(fabric.try_recv(&env(0, 1, 6), &mut buf).unwrap(), None);
        assert_eq!(fabric.try_recv(&env(2, 1, 5), &mut buf).unwrap(), None);
        assert_eq!(fabric.try_recv(&env(0, 1, 5), &mut buf).unwrap(), Some(5));
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(fabric.pending(), 0);
        assert_eq!(fabric.delivered(), 1);
    }

    #[test]
    fn same_envelope_is_fifo() {
        let fabric = LocalFabric::new();
        fabric.send(&env(0, 1, 0), &[1]).unwrap();
        fabric.send(&env(0, 1, 0), &[2]).unwrap();
        let mut buf = [0u8; 1];
        fabric.try_recv(&env(0, 1, 0), &mut buf).unwrap();
        assert_eq!(buf, [1]);
        fabric.try_recv(&env(0, 1, 0), &mut buf).unwrap();
        assert_eq!(buf, [2]);
    }

    #[test]
    fn oversized_message_truncates() {
        let fabric = LocalFabric::new();
        fabric.send(&env(0, 1, 0), &[0; 16]).unwrap();
        let mut buf = [0u8; 4];
        match fabric.try_recv(&env(0, 1, 0), &mut buf) {
            Err(Error::Truncate { received, capacity }) => {
                assert_eq!((received, capacity), (16, 4));
            }
            other => panic!("expected truncation, got {other:?}"),
        }
        assert_eq!(fabric.pending(), 0);
    }
}
