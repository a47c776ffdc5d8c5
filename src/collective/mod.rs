//! Collective communication
//!
//! The non-blocking gather `igather` is the entry point: it picks one algorithm per call (see
//! [`select`](select/index.html)), emits it, and hands back a [`Request`] that completes as the
//! caller drives it with `test` or `wait`. The blocking `gather` is `igather` followed by
//! `wait`.
//!
//! On an intra-communicator every rank calls with the same root rank and the root receives the
//! blocks of all ranks, in rank order. On an inter-communicator the group holding the root calls
//! with `GatherRoot::Root` at the root and `GatherRoot::ProcNull` everywhere else, while every
//! rank of the other group calls with the root's rank in their remote group.
//!
//! # Unfinished features
//!
//! - Varying counts gather
//! - Every collective other than gather

use std::sync::Arc;

use crate::datatype::traits::*;
use crate::datatype::{as_bytes, as_bytes_mut, Datatype};
use crate::error::Result;
use crate::request::Request;
use crate::schedule::{BufferId, Region, Schedule};
use crate::topology::sealed::{AsHandle, CommHandle};
use crate::topology::traits::*;
use crate::topology::CommRef;
use crate::{Rank, Tag};

use self::select::{CallSignature, Choice, GatherAlgorithm};
use self::tree::TreeGather;

pub(crate) mod gather;
pub mod op;
pub mod select;
pub mod tree;

/// Collective traits
pub mod traits {
    pub use super::{CommunicatorCollectives, Root};
}

/// Who receives the gathered data.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum GatherRoot {
    /// On an intra-communicator, the root's rank. On an inter-communicator, passed by the
    /// sending group: the root's rank in the remote group.
    Rank(Rank),
    /// Passed by the root itself on an inter-communicator.
    Root,
    /// Passed by the non-root members of the root's group on an inter-communicator. They take
    /// no part in the exchange.
    ProcNull,
}

/// The send side of a gather.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SendBuf<'a> {
    /// No contribution, for callers that only receive or take no part.
    None,
    /// The caller's block.
    Bytes(&'a [u8]),
    /// The root's block already sits at its slot in the receive buffer.
    InPlace,
}

/// The arguments of one gather call.
#[derive(Debug)]
pub struct GatherArgs<'a> {
    pub(crate) send: SendBuf<'a>,
    pub(crate) sendcount: usize,
    pub(crate) sendtype: Datatype,
    pub(crate) recv: Option<&'a mut [u8]>,
    pub(crate) recvcount: usize,
    pub(crate) recvtype: Datatype,
    pub(crate) root: GatherRoot,
}

impl<'a> GatherArgs<'a> {
    /// Arguments in their raw form. `recvcount` counts elements received from each process.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        send: SendBuf<'a>,
        sendcount: usize,
        sendtype: Datatype,
        recv: Option<&'a mut [u8]>,
        recvcount: usize,
        recvtype: Datatype,
        root: GatherRoot,
    ) -> Self {
        GatherArgs {
            send,
            sendcount,
            sendtype,
            recv,
            recvcount,
            recvtype,
            root,
        }
    }

    /// Contribute `send` toward `root` without receiving anything.
    pub fn contribute<T: Equivalence>(root: GatherRoot, send: &'a [T]) -> Self {
        GatherArgs::new(
            SendBuf::Bytes(as_bytes(send)),
            send.len(),
            T::equivalent_datatype(),
            None,
            0,
            T::equivalent_datatype(),
            root,
        )
    }

    /// The root of an intra-communicator gather: contributes `send` and receives one block of
    /// `send.len()` elements per rank into `recv`.
    pub fn at_root<T: Equivalence>(root: Rank, send: &'a [T], recv: &'a mut [T]) -> Self {
        GatherArgs::new(
            SendBuf::Bytes(as_bytes(send)),
            send.len(),
            T::equivalent_datatype(),
            Some(as_bytes_mut(recv)),
            send.len(),
            T::equivalent_datatype(),
            GatherRoot::Rank(root),
        )
    }

    /// The root of an intra-communicator gather whose own block of `count` elements is
    /// already in place in `recv`.
    pub fn in_place<T: Equivalence>(root: Rank, recv: &'a mut [T], count: usize) -> Self {
        GatherArgs::new(
            SendBuf::InPlace,
            count,
            T::equivalent_datatype(),
            Some(as_bytes_mut(recv)),
            count,
            T::equivalent_datatype(),
            GatherRoot::Rank(root),
        )
    }

    /// The root of an inter-communicator gather, receiving `count` elements from each remote
    /// process.
    pub fn inter_root<T: Equivalence>(recv: &'a mut [T], count: usize) -> Self {
        GatherArgs::new(
            SendBuf::None,
            0,
            T::equivalent_datatype(),
            Some(as_bytes_mut(recv)),
            count,
            T::equivalent_datatype(),
            GatherRoot::Root,
        )
    }

    /// A member of the root's group of an inter-communicator, other than the root.
    pub fn proc_null() -> GatherArgs<'static> {
        GatherArgs::new(
            SendBuf::None,
            0,
            Datatype::Byte,
            None,
            0,
            Datatype::Byte,
            GatherRoot::ProcNull,
        )
    }

    /// Root of the call
    pub fn root(&self) -> GatherRoot {
        self.root
    }

    /// Elements sent
    pub fn sendcount(&self) -> usize {
        self.sendcount
    }

    /// Elements received per process
    pub fn recvcount(&self) -> usize {
        self.recvcount
    }

    pub(crate) fn send_block(&self) -> usize {
        self.sendtype.extent_of(self.sendcount)
    }

    pub(crate) fn recv_block(&self) -> usize {
        self.recvtype.extent_of(self.recvcount)
    }

    /// An empty schedule over the call's buffers, plus the region of the caller's own block
    /// when it has one outside the receive buffer.
    pub(crate) fn into_schedule(self, tag: Tag) -> (Schedule<'a>, Option<Region>) {
        let own = self.send_block();
        match self.send {
            SendBuf::Bytes(b) => (
                Schedule::new(tag, Some(b), self.recv),
                Some(Region::new(BufferId::Send, 0, own)),
            ),
            SendBuf::None | SendBuf::InPlace => (Schedule::new(tag, None, self.recv), None),
        }
    }
}

/// Start a non-blocking gather on `comm`.
///
/// Every call selects exactly one algorithm. When a device is installed and the configuration
/// routes gathers to it, the device's request is returned as is.
///
/// # Panics
///
/// If the root is not a valid rank for the communicator kind, or the selection table has no
/// entry for the call.
pub fn igather<'a>(comm: &dyn Communicator, args: GatherArgs<'a>) -> Result<Request<'a>> {
    let handle = comm.as_handle();
    let shared = &handle.shared;
    let sig = CallSignature::igather(&handle.state, &args);
    match select::select(
        &shared.config,
        shared.device.is_some(),
        &*shared.cost_model,
        &sig,
    )? {
        Choice::Device => {
            let device = shared
                .device
                .as_ref()
                .expect("device chosen only when one is installed");
            device.igather(comm, args)
        }
        Choice::Algorithm(algorithm) => start(handle, algorithm, args),
    }
}

/// Start a non-blocking gather with the runtime's own algorithms, never consulting the device.
///
/// Devices call this for the cases they do not handle themselves.
pub fn igather_runtime<'a>(comm: &dyn Communicator, args: GatherArgs<'a>) -> Result<Request<'a>> {
    let handle = comm.as_handle();
    let shared = &handle.shared;
    let sig = CallSignature::igather(&handle.state, &args);
    let algorithm = select::select_algorithm(&shared.config, &*shared.cost_model, &sig)?;
    start(handle, algorithm, args)
}

/// Blocking gather: `igather` followed by `wait`.
pub fn gather(comm: &dyn Communicator, args: GatherArgs<'_>) -> Result<()> {
    igather(comm, args)?.wait()
}

fn start<'a>(
    handle: &CommHandle,
    algorithm: GatherAlgorithm,
    args: GatherArgs<'a>,
) -> Result<Request<'a>> {
    let state = &handle.state;
    let tag = state.next_tag();
    let comm = CommRef(Arc::clone(state));
    let transport = Arc::clone(&handle.shared.transport);
    let progress = Arc::clone(&handle.shared.progress);
    tracing::trace!(context_id = %state.context_id, tag, %algorithm, "starting gather");
    match algorithm {
        GatherAlgorithm::IntraBinomial => {
            let s = gather::intra_binomial(&comm, args, tag)?;
            Request::from_schedule(s, transport, progress)
        }
        GatherAlgorithm::InterShort => {
            let s = gather::inter_short(&comm, args, tag)?;
            Request::from_schedule(s, transport, progress)
        }
        GatherAlgorithm::InterLong => {
            let s = gather::inter_long(handle, args, tag)?;
            Request::from_schedule(s, transport, progress)
        }
        GatherAlgorithm::IntraTree { k } => {
            let t = TreeGather::start(&comm, args, k, tag)?;
            Request::from_tree(t, transport, progress)
        }
    }
}

/// Collective communication patterns defined on `Communicator`s
pub trait CommunicatorCollectives: Communicator + Sized {
    /// Initiate a non-blocking gather with explicit arguments.
    ///
    /// # Examples
    ///
    /// See `tests/gather.rs`
    fn immediate_gather<'a>(&self, args: GatherArgs<'a>) -> Result<Request<'a>> {
        igather(self, args)
    }

    /// Gather with explicit arguments, blocking until this process's part is done.
    fn gather(&self, args: GatherArgs<'_>) -> Result<()> {
        gather(self, args)
    }

    /// The process at `rank`, to be used as the root of a collective.
    ///
    /// On an inter-communicator `rank` addresses the remote group.
    fn process_at_rank(&self, rank: Rank) -> Process<'_, Self> {
        let bound = if self.is_inter() {
            self.remote_size()
        } else {
            self.size()
        };
        assert!(
            0 <= rank && rank < bound,
            "rank {} outside group of size {}",
            rank,
            bound
        );
        Process { comm: self, rank }
    }

    /// Initiate a non-blocking gather into `recvbuf` as the root of an inter-communicator.
    ///
    /// `recvbuf` is split evenly among the remote processes.
    ///
    /// # Panics
    ///
    /// On an intra-communicator.
    fn immediate_gather_as_root<'a, T: Equivalence>(&self, recvbuf: &'a mut [T]) -> Result<Request<'a>> {
        assert!(self.is_inter(), "inter-communicator root on an intra-communicator");
        let count = recvbuf.len() / self.remote_size() as usize;
        igather(self, GatherArgs::inter_root(recvbuf, count))
    }

    /// Take part in an inter-communicator gather as a non-root member of the root's group.
    ///
    /// # Panics
    ///
    /// On an intra-communicator.
    fn immediate_gather_idle(&self) -> Result<Request<'static>> {
        assert!(self.is_inter(), "idle gather member on an intra-communicator");
        igather(self, GatherArgs::proc_null())
    }
}

impl<C: Communicator> CommunicatorCollectives for C {}

/// A process of a communicator, identified by its rank
pub struct Process<'c, C> {
    comm: &'c C,
    rank: Rank,
}

impl<'c, C: Communicator> Process<'c, C> {
    /// The communicator this process belongs to
    pub fn communicator(&self) -> &'c C {
        self.comm
    }

    /// Rank of the process
    pub fn rank(&self) -> Rank {
        self.rank
    }

    fn is_self(&self) -> bool {
        !self.comm.is_inter() && self.comm.rank() == self.rank
    }
}

/// Something that can take the role of 'root' in a collective operation.
///
/// Many collective operations define a 'root' process that takes a special role in the
/// communication. These collective operations are implemented as default methods of this trait.
pub trait Root {
    /// The communicator of the root
    type Comm: Communicator;

    /// The communicator of the root
    fn as_comm(&self) -> &Self::Comm;

    /// Rank of the root process
    fn root_rank(&self) -> Rank;

    /// Initiate non-blocking gather of the contents of all `sendbuf`s on `Root` `&self`.
    ///
    /// This function must be called on all non-root processes, and on every process of the
    /// group sending to the root of an inter-communicator.
    fn immediate_gather_into<'a, T: Equivalence>(&self, sendbuf: &'a [T]) -> Result<Request<'a>> {
        let comm = self.as_comm();
        if !comm.is_inter() {
            assert_ne!(comm.rank(), self.root_rank());
        }
        igather(comm, GatherArgs::contribute(GatherRoot::Rank(self.root_rank()), sendbuf))
    }

    /// Initiate non-blocking gather of the contents of all `sendbuf`s on `Root` `&self`.
    ///
    /// This function must be called on the root process. `recvbuf` is split evenly among the
    /// processes of the communicator.
    fn immediate_gather_into_root<'a, T: Equivalence>(
        &self,
        sendbuf: &'a [T],
        recvbuf: &'a mut [T],
    ) -> Result<Request<'a>> {
        let comm = self.as_comm();
        assert_eq!(comm.rank(), self.root_rank());
        let recvcount = recvbuf.len() / comm.size() as usize;
        igather(
            comm,
            GatherArgs::new(
                SendBuf::Bytes(as_bytes(sendbuf)),
                sendbuf.len(),
                T::equivalent_datatype(),
                Some(as_bytes_mut(recvbuf)),
                recvcount,
                T::equivalent_datatype(),
                GatherRoot::Rank(self.root_rank()),
            ),
        )
    }

    /// Gather contents of buffers on `Root`.
    ///
    /// After the call completes, the contents of the `sendbuf`s on all ranks will be
    /// concatenated into the `recvbuf` on `Root`.
    ///
    /// This function must be called on all non-root processes.
    fn gather_into<T: Equivalence>(&self, sendbuf: &[T]) -> Result<()> {
        self.immediate_gather_into(sendbuf)?.wait()
    }

    /// Gather contents of buffers on `Root`.
    ///
    /// This function must be called on the root process.
    fn gather_into_root<T: Equivalence>(&self, sendbuf: &[T], recvbuf: &mut [T]) -> Result<()> {
        self.immediate_gather_into_root(sendbuf, recvbuf)?.wait()
    }

    /// Gather on `Root` where the root's own block already sits at its slot in `recvbuf`.
    ///
    /// This function must be called on the root process.
    fn gather_in_place_root<T: Equivalence>(&self, recvbuf: &mut [T]) -> Result<()> {
        let comm = self.as_comm();
        assert_eq!(comm.rank(), self.root_rank());
        let count = recvbuf.len() / comm.size() as usize;
        igather(comm, GatherArgs::in_place(self.root_rank(), recvbuf, count))?.wait()
    }
}

impl<'c, C: Communicator> Root for Process<'c, C> {
    type Comm = C;

    fn as_comm(&self) -> &C {
        self.comm
    }

    fn root_rank(&self) -> Rank {
        self.rank
    }
}

impl<'c, C: Communicator> std::fmt::Debug for Process<'c, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("context_id", &self.comm.context_id())
            .field("rank", &self.rank)
            .field("is_self", &self.is_self())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, IntraAlgorithm};
    use crate::environment::Universe;
    use crate::request::wait_all;

    #[test]
    fn block_sizes_follow_counts_and_types() {
        let send = [0u32; 3];
        let args = GatherArgs::contribute(GatherRoot::Rank(0), &send[..]);
        assert_eq!(args.send_block(), 12);
        assert_eq!(args.recv_block(), 0);

        let mut recv = [0u16; 8];
        let args = GatherArgs::in_place(1, &mut recv[..], 2);
        assert_eq!(args.recv_block(), 4);
        let (s, own) = args.into_schedule(0);
        assert!(own.is_none());
        assert!(s.is_empty());
    }

    fn gather_all(size: u32, root: Rank, config: Config) -> Vec<u64> {
        let universes = Universe::local_world(size, config).unwrap();
        let worlds: Vec<_> = universes.iter().map(Universe::world).collect();
        let sends: Vec<[u64; 2]> = (0..size as u64).map(|r| [r * 10, r * 10 + 1]).collect();
        let mut result = vec![0u64; 2 * size as usize];

        let mut requests = Vec::new();
        let mut recv = Some(&mut result[..]);
        for (rank, world) in worlds.iter().enumerate() {
            let root_proc = world.process_at_rank(root);
            let req = if rank as Rank == root {
                let recv = recv.take().unwrap();
                root_proc.immediate_gather_into_root(&sends[rank][..], recv)
            } else {
                root_proc.immediate_gather_into(&sends[rank][..])
            };
            requests.push(req.unwrap());
        }
        wait_all(requests).unwrap();
        result
    }

    fn expected(size: u64) -> Vec<u64> {
        (0..size).flat_map(|r| [r * 10, r * 10 + 1]).collect()
    }

    #[test]
    fn binomial_gather_collects_in_rank_order() {
        assert_eq!(gather_all(7, 0, Config::default()), expected(7));
        assert_eq!(gather_all(7, 5, Config::default()), expected(7));
    }

    #[test]
    fn tree_gather_collects_in_rank_order() {
        let mut cfg = Config::default();
        cfg.igather_intra_algorithm = IntraAlgorithm::GenericTree;
        cfg.igather_tree_kval = 3;
        assert_eq!(gather_all(10, 0, cfg.clone()), expected(10));
        assert_eq!(gather_all(10, 4, cfg), expected(10));
    }

    #[test]
    fn single_process_gather_is_immediate() {
        let universes = Universe::local_world(1, Config::default()).unwrap();
        let world = universes[0].world();
        let send = [1, 2, 3];
        let mut recv = [0i32; 3];
        let req = world
            .process_at_rank(0)
            .immediate_gather_into_root(&send[..], &mut recv[..])
            .unwrap();
        assert!(req.is_complete());
        req.wait().unwrap();
        assert_eq!(recv, [1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "outside group")]
    fn root_outside_group_panics() {
        let universes = Universe::local_world(2, Config::default()).unwrap();
        let _ = universes[0].world().process_at_rank(2);
    }
}
