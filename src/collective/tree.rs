//! Transport-level k-nomial tree gather
//!
//! Unlike the scheduled algorithms this one talks to the transport directly and tracks its own
//! completion: a rank posts nothing up front, receives its children's subtrees as they arrive,
//! then forwards its whole subtree to its parent in one message. With `k = 2` the tree is the
//! binomial tree.

use smallvec::SmallVec;

use crate::collective::{GatherArgs, GatherRoot, SendBuf};
use crate::error::{try_alloc_bytes, Error, Result};
use crate::topology::vcrt::VcView;
use crate::topology::{CommRef, ContextId};
use crate::transport::{Endpoint, Envelope, Transport};
use crate::Tag;

#[derive(Debug)]
struct Child {
    rank: usize,
    offset: usize,
    len: usize,
    received: bool,
}

enum Accumulator<'a> {
    /// Leaves forward their own block.
    Leaf(&'a [u8]),
    /// The root at rank 0 gathers straight into the receive buffer.
    Direct(&'a mut [u8]),
    /// Everyone else gathers in relative rank order; a root other than rank 0 rotates the
    /// result into the receive buffer at the end.
    Scratch {
        buf: Vec<u8>,
        rotate_into: Option<&'a mut [u8]>,
    },
}

/// An in-flight k-nomial gather.
pub struct TreeGather<'a> {
    me: Endpoint,
    peers: VcView,
    context_id: ContextId,
    tag: Tag,
    k: usize,
    root: usize,
    size: usize,
    nbytes: usize,
    parent: Option<usize>,
    subtree: usize,
    children: SmallVec<[Child; 8]>,
    acc: Accumulator<'a>,
    finished: bool,
}

impl<'a> TreeGather<'a> {
    /// Lay out the tree for the caller and copy its own block into place.
    pub(crate) fn start(comm: &CommRef, args: GatherArgs<'a>, k: usize, tag: Tag) -> Result<Self> {
        assert!(k >= 2, "k-nomial tree needs arity of at least 2, got {}", k);
        let state = comm.state();
        let size = state.local_size;
        let rank = state.rank;
        let root = match args.root {
            GatherRoot::Rank(r) => usize::try_from(r)
                .ok()
                .filter(|&r| r < size)
                .unwrap_or_else(|| panic!("gather root {} outside communicator of size {}", r, size)),
            other => panic!("{:?} is only meaningful on inter-communicators", other),
        };
        let peers = state.remote_view().ok_or(Error::Finalized)?;
        let me = peers.get(rank).ok_or(Error::Finalized)?;

        let is_root = rank == root;
        let nbytes = if is_root {
            args.recv_block()
        } else {
            args.send_block()
        };
        let rel = (rank + size - root) % size;

        let mut parent = None;
        let mut children = SmallVec::new();
        let mut mask = 1usize;
        while mask < size {
            let span = mask.saturating_mul(k);
            if rel % span != 0 {
                parent = Some((rel - rel % span + root) % size);
                break;
            }
            for j in 1..k {
                let child = rel + j * mask;
                if child >= size {
                    break;
                }
                children.push(Child {
                    rank: (child + root) % size,
                    offset: (child - rel) * nbytes,
                    len: mask.min(size - child) * nbytes,
                    received: false,
                });
            }
            mask = span;
        }
        let subtree = mask.min(size - rel);

        let own: Option<&'a [u8]> = match args.send {
            SendBuf::Bytes(b) => {
                if b.len() < nbytes {
                    return Err(Error::BufferTooSmall {
                        needed: nbytes,
                        actual: b.len(),
                    });
                }
                Some(&b[..nbytes])
            }
            SendBuf::InPlace if is_root => None,
            _ => {
                return Err(Error::MissingBuffer {
                    operation: "gather",
                    which: "send",
                })
            }
        };

        let acc = if is_root {
            let recv = args.recv.ok_or(Error::MissingBuffer {
                operation: "gather",
                which: "receive",
            })?;
            if recv.len() < size * nbytes {
                return Err(Error::BufferTooSmall {
                    needed: size * nbytes,
                    actual: recv.len(),
                });
            }
            if root == 0 {
                if let Some(own) = own {
                    recv[..nbytes].copy_from_slice(own);
                }
                Accumulator::Direct(recv)
            } else {
                let mut buf = try_alloc_bytes(size * nbytes, "tree gather scratch")?;
                let mine = own.unwrap_or(&recv[root * nbytes..(root + 1) * nbytes]);
                buf[..nbytes].copy_from_slice(mine);
                Accumulator::Scratch {
                    buf,
                    rotate_into: Some(recv),
                }
            }
        } else if children.is_empty() {
            Accumulator::Leaf(own.ok_or(Error::MissingBuffer {
                operation: "gather",
                which: "send",
            })?)
        } else {
            let mut buf = try_alloc_bytes(subtree * nbytes, "tree gather scratch")?;
            if let Some(own) = own {
                buf[..nbytes].copy_from_slice(own);
            }
            Accumulator::Scratch {
                buf,
                rotate_into: None,
            }
        };

        tracing::trace!(
            context_id = %state.context_id,
            k,
            rank,
            ?parent,
            children = children.len(),
            "tree gather started"
        );
        Ok(TreeGather {
            me,
            peers,
            context_id: state.context_id.collective(),
            tag,
            k,
            root,
            size,
            nbytes,
            parent,
            subtree,
            children,
            acc,
            finished: false,
        })
    }

    /// Tree arity.
    pub fn arity(&self) -> usize {
        self.k
    }

    /// Parent rank, `None` at the root.
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// Ranks of the direct children, in receive order.
    pub fn children(&self) -> impl Iterator<Item = usize> + '_ {
        self.children.iter().map(|c| c.rank)
    }

    /// Whether this rank's part of the gather has finished.
    pub fn is_complete(&self) -> bool {
        self.finished
    }

    fn envelope(&self, src: Endpoint, dst: Endpoint) -> Envelope {
        Envelope {
            src,
            dst,
            context_id: self.context_id,
            tag: self.tag,
        }
    }

    /// Receive whatever children's data has arrived; once all of it is in, forward to the
    /// parent or finish the root's layout. Returns whether this rank is done.
    pub fn poll(&mut self, transport: &dyn Transport) -> Result<bool> {
        if self.finished {
            return Ok(true);
        }

        let mut pending = false;
        for i in 0..self.children.len() {
            if self.children[i].received {
                continue;
            }
            let (rank, offset, len) = {
                let c = &self.children[i];
                (c.rank, c.offset, c.len)
            };
            let src = self
                .peers
                .get(rank)
                .expect("tree children are ranks of the communicator");
            let envelope = self.envelope(src, self.me);
            let area = match &mut self.acc {
                Accumulator::Direct(recv) => &mut recv[offset..offset + len],
                Accumulator::Scratch { buf, .. } => &mut buf[offset..offset + len],
                Accumulator::Leaf(_) => unreachable!("leaves have no children"),
            };
            if transport.try_recv(&envelope, area)?.is_some() {
                self.children[i].received = true;
            } else {
                pending = true;
            }
        }
        if pending {
            return Ok(false);
        }

        if let Some(parent) = self.parent {
            let dst = self
                .peers
                .get(parent)
                .expect("tree parent is a rank of the communicator");
            let envelope = self.envelope(self.me, dst);
            let payload: &[u8] = match &self.acc {
                Accumulator::Leaf(own) => *own,
                Accumulator::Scratch { buf, .. } => &buf[..self.subtree * self.nbytes],
                Accumulator::Direct(_) => unreachable!("only the root gathers in place"),
            };
            transport.send(&envelope, payload)?;
        } else if let Accumulator::Scratch {
            buf,
            rotate_into: Some(recv),
        } = &mut self.acc
        {
            let head = (self.size - self.root) * self.nbytes;
            recv[self.root * self.nbytes..self.size * self.nbytes].copy_from_slice(&buf[..head]);
            recv[..self.root * self.nbytes].copy_from_slice(&buf[head..self.size * self.nbytes]);
        }

        self.finished = true;
        tracing::trace!(context_id = %self.context_id, tag = self.tag, "tree gather complete");
        Ok(true)
    }
}

impl std::fmt::Debug for TreeGather<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeGather")
            .field("k", &self.k)
            .field("root", &self.root)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::datatype::Datatype;
    use crate::environment::Universe;
    use crate::topology::traits::*;

    fn tree(rank: usize, size: u32, root: i32, k: usize) -> (Vec<usize>, Option<usize>) {
        let universes = Universe::local_world(size, Config::default()).unwrap();
        let comm = universes[rank].world().comm_ref();
        let send = [0u8; 1];
        let mut recv = vec![0u8; size as usize];
        let args = if rank as i32 == root {
            GatherArgs::at_root(root, &send[..], &mut recv[..])
        } else {
            GatherArgs::contribute(GatherRoot::Rank(root), &send[..])
        };
        let t = TreeGather::start(&comm, args, k, 0).unwrap();
        (t.children().collect(), t.parent())
    }

    #[test]
    fn ternary_tree_shape() {
        assert_eq!(tree(0, 9, 0, 3), (vec![1, 2, 3, 6], None));
        assert_eq!(tree(3, 9, 0, 3), (vec![4, 5], Some(0)));
        assert_eq!(tree(7, 9, 0, 3), (vec![], Some(6)));
    }

    #[test]
    fn binary_tree_matches_binomial() {
        assert_eq!(tree(0, 8, 0, 2), (vec![1, 2, 4], None));
        assert_eq!(tree(6, 8, 0, 2), (vec![7], Some(4)));
    }

    #[test]
    fn rotated_root() {
        assert_eq!(tree(2, 5, 2, 4), (vec![3, 4, 0, 1], None));
        assert_eq!(tree(1, 5, 2, 4), (vec![], Some(2)));
    }

    #[test]
    fn non_root_without_send_buffer_fails() {
        let universes = Universe::local_world(2, Config::default()).unwrap();
        let comm = universes[1].world().comm_ref();
        let args = GatherArgs::new(
            SendBuf::None,
            1,
            Datatype::Byte,
            None,
            0,
            Datatype::Byte,
            GatherRoot::Rank(0),
        );
        let err = TreeGather::start(&comm, args, 2, 0).unwrap_err();
        assert!(matches!(err, Error::MissingBuffer { .. }));
    }
}
