//! Schedule-based gather algorithms
//!
//! Blocks are laid out in rank order in the root's receive buffer. Intermediate ranks of the
//! binomial tree accumulate their subtree in a scratch buffer in relative rank order, so a
//! subtree always occupies one contiguous range and is forwarded with a single send.

use crate::collective::{GatherArgs, GatherRoot};
use crate::error::{Error, Result};
use crate::schedule::{BufferId, ChannelId, Region, Schedule, StepOrder};
use crate::topology::sealed::CommHandle;
use crate::topology::CommRef;
use crate::Tag;

fn missing_send() -> Error {
    Error::MissingBuffer {
        operation: "gather",
        which: "send",
    }
}

fn missing_recv() -> Error {
    Error::MissingBuffer {
        operation: "gather",
        which: "receive",
    }
}

/// Emit a binomial gather of `nbytes`-byte blocks over `size` ranks reachable through
/// `channel`, toward `root`.
///
/// `own` is the caller's block, `None` meaning it already sits in place in the root's result
/// buffer. `target` is the buffer receiving all `size` blocks at the root; it is ignored
/// elsewhere.
pub(crate) fn binomial(
    s: &mut Schedule<'_>,
    channel: ChannelId,
    rank: usize,
    size: usize,
    root: usize,
    nbytes: usize,
    own: Option<Region>,
    target: Option<BufferId>,
) -> Result<()> {
    let rel = (rank + size - root) % size;
    let abs = |r: usize| (r + root) % size;
    let subtree = if rel == 0 {
        size
    } else {
        (rel & rel.wrapping_neg()).min(size - rel)
    };

    let acc = if rel == 0 {
        let target = target.ok_or_else(missing_recv)?;
        if root == 0 {
            if let Some(own) = own {
                s.copy(own, Region::new(target, 0, nbytes), StepOrder::Independent)?;
            }
            Some(target)
        } else {
            let tmp = s.scratch(size * nbytes)?;
            let own = own.unwrap_or_else(|| Region::new(target, root * nbytes, nbytes));
            s.copy(own, Region::new(tmp, 0, nbytes), StepOrder::Independent)?;
            Some(tmp)
        }
    } else if subtree > 1 {
        let own = own.ok_or_else(missing_send)?;
        let tmp = s.scratch(subtree * nbytes)?;
        s.copy(own, Region::new(tmp, 0, nbytes), StepOrder::Independent)?;
        Some(tmp)
    } else {
        None
    };

    let mut mask = 1;
    while mask < size {
        if rel & mask != 0 {
            let region = match acc {
                Some(buf) => Region::new(buf, 0, subtree * nbytes),
                None => own.ok_or_else(missing_send)?,
            };
            s.send(channel, abs(rel & !mask), region, StepOrder::Ordered)?;
            break;
        }
        let child = rel | mask;
        if child < size {
            if let Some(buf) = acc {
                let blocks = mask.min(size - child);
                s.recv(
                    channel,
                    abs(child),
                    Region::new(buf, mask * nbytes, blocks * nbytes),
                    StepOrder::Independent,
                )?;
            }
        }
        mask <<= 1;
    }

    if rel == 0 && root != 0 {
        if let (Some(tmp), Some(target)) = (acc, target) {
            let head = (size - root) * nbytes;
            s.copy(
                Region::new(tmp, 0, head),
                Region::new(target, root * nbytes, head),
                StepOrder::Ordered,
            )?;
            s.copy(
                Region::new(tmp, head, root * nbytes),
                Region::new(target, 0, root * nbytes),
                StepOrder::Independent,
            )?;
        }
    }
    Ok(())
}

fn intra_root(root: GatherRoot, size: usize) -> usize {
    match root {
        GatherRoot::Rank(r) => usize::try_from(r)
            .ok()
            .filter(|&r| r < size)
            .unwrap_or_else(|| panic!("gather root {} outside communicator of size {}", r, size)),
        other => panic!("{:?} is only meaningful on inter-communicators", other),
    }
}

/// Binomial tree gather on an intra-communicator.
pub(crate) fn intra_binomial<'a>(comm: &CommRef, args: GatherArgs<'a>, tag: Tag) -> Result<Schedule<'a>> {
    let state = comm.state();
    let size = state.local_size;
    let root = intra_root(args.root, size);
    let nbytes = if state.rank == root {
        args.recv_block()
    } else {
        args.send_block()
    };

    let (mut s, own) = args.into_schedule(tag);
    let channel = s.channel(comm)?;
    binomial(
        &mut s,
        channel,
        state.rank,
        size,
        root,
        nbytes,
        own,
        Some(BufferId::Recv),
    )?;
    Ok(s)
}

/// Inter-communicator gather where every remote rank sends straight to the root.
pub(crate) fn inter_short<'a>(comm: &CommRef, args: GatherArgs<'a>, tag: Tag) -> Result<Schedule<'a>> {
    let state = comm.state();
    let root = args.root;
    let recv_block = args.recv_block();
    let (mut s, own) = args.into_schedule(tag);
    match root {
        GatherRoot::ProcNull => {}
        GatherRoot::Root => {
            let channel = s.channel(comm)?;
            for peer in 0..state.remote_size {
                s.recv(
                    channel,
                    peer,
                    Region::new(BufferId::Recv, peer * recv_block, recv_block),
                    StepOrder::Independent,
                )?;
            }
        }
        GatherRoot::Rank(r) => {
            let channel = s.channel(comm)?;
            let own = own.ok_or_else(missing_send)?;
            s.send(channel, remote_root(r, state.remote_size), own, StepOrder::Independent)?;
        }
    }
    Ok(s)
}

/// Inter-communicator gather in two phases: the remote group gathers to its rank 0 over the
/// local companion communicator, which then forwards everything to the root in one message.
pub(crate) fn inter_long<'a>(comm: &CommHandle, args: GatherArgs<'a>, tag: Tag) -> Result<Schedule<'a>> {
    let state = &comm.state;
    let root = args.root;
    let recv_block = args.recv_block();
    let send_block = args.send_block();
    let (mut s, own) = args.into_schedule(tag);
    match root {
        GatherRoot::ProcNull => {}
        GatherRoot::Root => {
            let channel = s.channel(&CommRef(state.clone()))?;
            s.recv(
                channel,
                0,
                Region::new(BufferId::Recv, 0, state.remote_size * recv_block),
                StepOrder::Independent,
            )?;
        }
        GatherRoot::Rank(r) => {
            let dest = remote_root(r, state.remote_size);
            let local = CommRef(state.local_comm(&comm.shared)?);
            let outer = s.channel(&CommRef(state.clone()))?;
            let inner = s.channel(&local)?;
            let size = state.local_size;
            let tmp = if state.rank == 0 {
                Some(s.scratch(size * send_block)?)
            } else {
                None
            };
            let own = own.ok_or_else(missing_send)?;
            binomial(&mut s, inner, state.rank, size, 0, send_block, Some(own), tmp)?;
            if let Some(tmp) = tmp {
                s.send(
                    outer,
                    dest,
                    Region::new(tmp, 0, size * send_block),
                    StepOrder::Ordered,
                )?;
            }
        }
    }
    Ok(s)
}

fn remote_root(r: crate::Rank, remote_size: usize) -> usize {
    usize::try_from(r)
        .ok()
        .filter(|&r| r < remote_size)
        .unwrap_or_else(|| panic!("gather root {} outside remote group of size {}", r, remote_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Step;
    use crate::transport::LocalFabric;

    fn sends(s: &Schedule<'_>) -> Vec<usize> {
        s.steps()
            .iter()
            .filter_map(|st| match st {
                Step::Send { dest, .. } => Some(*dest),
                _ => None,
            })
            .collect()
    }

    fn recvs(s: &Schedule<'_>) -> Vec<(usize, usize, usize)> {
        s.steps()
            .iter()
            .filter_map(|st| match st {
                Step::Recv { src, region, .. } => Some((*src, region.offset, region.len)),
                _ => None,
            })
            .collect()
    }

    fn shape(rank: usize, size: usize, root: usize) -> Schedule<'static> {
        use crate::config::Config;
        use crate::environment::Universe;
        use crate::topology::traits::*;

        let universes = Universe::local_world(size as u32, Config::default()).unwrap();
        let comm = universes[rank].world().comm_ref();
        let own: &'static [u8] = Box::leak(vec![rank as u8; 2].into_boxed_slice());
        let recv: &'static mut [u8] = Box::leak(vec![0u8; 2 * size].into_boxed_slice());
        let mut s = Schedule::new(0, Some(own), Some(recv));
        let ch = s.channel(&comm).unwrap();
        binomial(
            &mut s,
            ch,
            rank,
            size,
            root,
            2,
            Some(Region::new(BufferId::Send, 0, 2)),
            Some(BufferId::Recv),
        )
        .unwrap();
        s
    }

    #[test]
    fn binomial_root_receives_log_n_subtrees() {
        let s = shape(0, 8, 0);
        assert_eq!(recvs(&s), vec![(1, 2, 2), (2, 4, 4), (4, 8, 8)]);
        assert!(sends(&s).is_empty());
    }

    #[test]
    fn binomial_leaf_sends_once() {
        let s = shape(5, 8, 0);
        assert_eq!(sends(&s), vec![4]);
        assert!(recvs(&s).is_empty());
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn binomial_relay_forwards_subtree() {
        let s = shape(4, 8, 0);
        assert_eq!(recvs(&s), vec![(5, 2, 2), (6, 4, 4)]);
        assert_eq!(sends(&s), vec![0]);
        assert!(s.steps().contains(&Step::Barrier));
    }

    #[test]
    fn binomial_ragged_and_rotated() {
        let s = shape(3, 6, 3);
        assert_eq!(recvs(&s), vec![(4, 2, 2), (5, 4, 4), (1, 8, 4)]);
        let s = shape(1, 6, 3);
        assert_eq!(recvs(&s), vec![(2, 2, 2)]);
        assert_eq!(sends(&s), vec![3]);
    }

    #[test]
    fn single_rank_copies_locally() {
        let mut s = shape(0, 1, 0);
        assert!(s.advance(&LocalFabric::new()).unwrap());
    }
}
