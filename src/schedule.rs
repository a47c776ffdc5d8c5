//! Schedule engine
//!
//! A `Schedule` is the execution plan of one non-blocking collective call: a list of elementary
//! steps over the caller's buffers and schedule-owned scratch buffers. Steps are grouped into
//! phases separated by barriers. Steps of a phase are independent and complete in any order; a
//! phase starts only once every step of the previous phase has completed. Appending a step with
//! `StepOrder::Ordered` closes the current phase first.
//!
//! Schedules reference the caller's buffers for their whole lifetime and never copy them. All
//! regions are checked against the buffer sizes when a step is appended, so a schedule that
//! could be built runs without bounds failures.
//!
//! Progress is made only by `advance`, called from `Request::test` or `Request::wait`.

use std::fmt;

use smallvec::SmallVec;

use crate::collective::op::SystemOperation;
use crate::datatype::Datatype;
use crate::error::{try_alloc_bytes, try_reserve, Error, Result};
use crate::topology::vcrt::VcView;
use crate::topology::{CommRef, ContextId};
use crate::transport::{Endpoint, Envelope, Transport};
use crate::Tag;

/// A buffer addressed by schedule steps.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferId {
    /// The caller's send buffer.
    Send,
    /// The caller's receive buffer.
    Recv,
    /// A scratch buffer owned by the schedule.
    Scratch(usize),
}

/// A byte range of one buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Region {
    /// The buffer
    pub buf: BufferId,
    /// Offset in bytes
    pub offset: usize,
    /// Length in bytes
    pub len: usize,
}

impl Region {
    /// `len` bytes of `buf` starting at `offset`.
    pub fn new(buf: BufferId, offset: usize, len: usize) -> Self {
        Region { buf, offset, len }
    }

    fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Identifies a communicator a schedule routes messages over.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelId(usize);

/// An elementary step.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Step {
    /// Send `region` to `dest`.
    Send {
        channel: ChannelId,
        dest: usize,
        region: Region,
    },
    /// Receive a message from `src` into `region`.
    Recv {
        channel: ChannelId,
        src: usize,
        region: Region,
    },
    /// Copy `src` into `dst`.
    Copy { src: Region, dst: Region },
    /// Combine `src` into `dst` with `op`.
    Reduce {
        op: SystemOperation,
        datatype: Datatype,
        src: Region,
        dst: Region,
    },
    /// Wait for every earlier step.
    Barrier,
}

/// How a step relates to the steps appended before it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StepOrder {
    /// May complete in any order with the other steps of the current phase.
    Independent,
    /// Starts only after every earlier step has completed.
    Ordered,
}

struct Route {
    me: Endpoint,
    peers: VcView,
    context_id: ContextId,
}

/// The execution plan of one collective call.
pub struct Schedule<'a> {
    tag: Tag,
    sendbuf: Option<&'a [u8]>,
    recvbuf: Option<&'a mut [u8]>,
    scratch: Vec<Vec<u8>>,
    channels: SmallVec<[Route; 2]>,
    steps: Vec<Step>,
    done: Vec<bool>,
    cursor: usize,
    remaining: usize,
}

impl<'a> Schedule<'a> {
    /// An empty schedule over the caller's buffers. Messages carry `tag`.
    pub fn new(tag: Tag, sendbuf: Option<&'a [u8]>, recvbuf: Option<&'a mut [u8]>) -> Self {
        Schedule {
            tag,
            sendbuf,
            recvbuf,
            scratch: Vec::new(),
            channels: SmallVec::new(),
            steps: Vec::new(),
            done: Vec::new(),
            cursor: 0,
            remaining: 0,
        }
    }

    /// Tag carried by every message of this schedule.
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Route messages over the collective context of `comm`. Ranks in steps on the returned
    /// channel are ranks of `comm`'s addressed group.
    pub fn channel(&mut self, comm: &CommRef) -> Result<ChannelId> {
        let state = comm.state();
        let peers = state.remote_view().ok_or(Error::Finalized)?;
        let me = state
            .with_table(true, |t| t.get(state.rank))
            .flatten()
            .ok_or(Error::Finalized)?;
        self.channels.push(Route {
            me,
            peers,
            context_id: state.context_id.collective(),
        });
        Ok(ChannelId(self.channels.len() - 1))
    }

    /// Allocate a zeroed scratch buffer of `len` bytes.
    pub fn scratch(&mut self, len: usize) -> Result<BufferId> {
        try_reserve(&mut self.scratch, 1, "schedule scratch list")?;
        self.scratch.push(try_alloc_bytes(len, "schedule scratch buffer")?);
        Ok(BufferId::Scratch(self.scratch.len() - 1))
    }

    fn buffer_len(&self, buf: BufferId) -> Result<usize> {
        match buf {
            BufferId::Send => self.sendbuf.map(<[u8]>::len).ok_or(Error::MissingBuffer {
                operation: "schedule",
                which: "send",
            }),
            BufferId::Recv => self
                .recvbuf
                .as_deref()
                .map(<[u8]>::len)
                .ok_or(Error::MissingBuffer {
                    operation: "schedule",
                    which: "receive",
                }),
            BufferId::Scratch(i) => Ok(self.scratch.get(i).map_or(0, Vec::len)),
        }
    }

    fn check_region(&self, region: &Region) -> Result<()> {
        let actual = self.buffer_len(region.buf)?;
        if region.end() > actual {
            return Err(Error::BufferTooSmall {
                needed: region.end(),
                actual,
            });
        }
        Ok(())
    }

    fn check_peer(&self, channel: ChannelId, rank: usize) {
        let route = &self.channels[channel.0];
        assert!(
            rank < route.peers.len(),
            "peer {} outside group of size {} on context {}",
            rank,
            route.peers.len(),
            route.context_id
        );
    }

    /// Append `step`. Its regions are validated against the buffers now.
    pub fn append(&mut self, step: Step, order: StepOrder) -> Result<()> {
        match &step {
            Step::Send {
                channel,
                dest,
                region,
            } => {
                self.check_peer(*channel, *dest);
                self.check_region(region)?;
            }
            Step::Recv {
                channel,
                src,
                region,
            } => {
                self.check_peer(*channel, *src);
                self.check_region(region)?;
            }
            Step::Copy { src, dst } => {
                self.check_region(src)?;
                self.check_region(dst)?;
                if src.len != dst.len {
                    return Err(Error::BufferTooSmall {
                        needed: src.len,
                        actual: dst.len,
                    });
                }
            }
            Step::Reduce {
                op,
                datatype,
                src,
                dst,
            } => {
                self.check_region(src)?;
                self.check_region(dst)?;
                if !op.supports(*datatype) {
                    return Err(Error::NotApplicable {
                        algorithm: "local reduce",
                        reason: format!("{:?} is not defined on {:?}", op, datatype),
                    });
                }
            }
            Step::Barrier => {}
        }

        if order == StepOrder::Ordered && !matches!(self.steps.last(), None | Some(Step::Barrier)) {
            self.push(Step::Barrier)?;
        }
        self.push(step)
    }

    fn push(&mut self, step: Step) -> Result<()> {
        try_reserve(&mut self.steps, 1, "schedule step")?;
        try_reserve(&mut self.done, 1, "schedule step")?;
        self.steps.push(step);
        self.done.push(false);
        self.remaining += 1;
        Ok(())
    }

    /// Append a send of `region` to `dest`.
    pub fn send(&mut self, channel: ChannelId, dest: usize, region: Region, order: StepOrder) -> Result<()> {
        self.append(
            Step::Send {
                channel,
                dest,
                region,
            },
            order,
        )
    }

    /// Append a receive from `src` into `region`.
    pub fn recv(&mut self, channel: ChannelId, src: usize, region: Region, order: StepOrder) -> Result<()> {
        self.append(
            Step::Recv {
                channel,
                src,
                region,
            },
            order,
        )
    }

    /// Append a local copy.
    pub fn copy(&mut self, src: Region, dst: Region, order: StepOrder) -> Result<()> {
        self.append(Step::Copy { src, dst }, order)
    }

    /// Append a local reduction of `src` into `dst`.
    pub fn reduce(
        &mut self,
        op: SystemOperation,
        datatype: Datatype,
        src: Region,
        dst: Region,
        order: StepOrder,
    ) -> Result<()> {
        self.append(
            Step::Reduce {
                op,
                datatype,
                src,
                dst,
            },
            order,
        )
    }

    /// Close the current phase.
    pub fn barrier(&mut self) -> Result<()> {
        self.append(Step::Barrier, StepOrder::Independent)
    }

    /// The steps in append order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no step was appended.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of steps not yet completed.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Whether every step has completed.
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    /// Read access to a completed schedule's scratch buffer.
    pub fn scratch_buffer(&self, id: BufferId) -> Option<&[u8]> {
        match id {
            BufferId::Scratch(i) => self.scratch.get(i).map(Vec::as_slice),
            _ => None,
        }
    }

    /// Try to complete the steps of the current phase, moving on to later phases as they
    /// become ready. Returns whether the schedule is complete. Calling this on a complete
    /// schedule does nothing.
    pub fn advance(&mut self, transport: &dyn Transport) -> Result<bool> {
        while self.cursor < self.steps.len() {
            let end = self.steps[self.cursor..]
                .iter()
                .position(|s| matches!(s, Step::Barrier))
                .map_or(self.steps.len(), |p| self.cursor + p);

            let mut phase_done = true;
            for i in self.cursor..end {
                if self.done[i] {
                    continue;
                }
                if self.execute(self.steps[i], transport)? {
                    self.done[i] = true;
                    self.remaining -= 1;
                    tracing::trace!(tag = self.tag, step = i, remaining = self.remaining, "step complete");
                } else {
                    phase_done = false;
                }
            }
            if !phase_done {
                return Ok(false);
            }

            if end < self.steps.len() {
                self.done[end] = true;
                self.remaining -= 1;
                self.cursor = end + 1;
            } else {
                self.cursor = end;
            }
        }
        Ok(true)
    }

    fn envelope(&self, channel: ChannelId, peer: usize, outgoing: bool) -> Envelope {
        let route = &self.channels[channel.0];
        let other = route
            .peers
            .get(peer)
            .expect("peer ranks are validated when steps are appended");
        let (src, dst) = if outgoing {
            (route.me, other)
        } else {
            (other, route.me)
        };
        Envelope {
            src,
            dst,
            context_id: route.context_id,
            tag: self.tag,
        }
    }

    fn execute(&mut self, step: Step, transport: &dyn Transport) -> Result<bool> {
        match step {
            Step::Send {
                channel,
                dest,
                region,
            } => {
                let envelope = self.envelope(channel, dest, true);
                transport.send(&envelope, self.read(&region)?)?;
                Ok(true)
            }
            Step::Recv {
                channel,
                src,
                region,
            } => {
                let envelope = self.envelope(channel, src, false);
                Ok(transport.try_recv(&envelope, self.write(&region)?)?.is_some())
            }
            Step::Copy { src, dst } => {
                let data = self.read(&src)?.to_vec();
                self.write(&dst)?.copy_from_slice(&data);
                Ok(true)
            }
            Step::Reduce {
                op,
                datatype,
                src,
                dst,
            } => {
                let data = self.read(&src)?.to_vec();
                op.apply(datatype, &data, self.write(&dst)?)?;
                Ok(true)
            }
            Step::Barrier => Ok(true),
        }
    }

    fn read(&self, region: &Region) -> Result<&[u8]> {
        let buf: &[u8] = match region.buf {
            BufferId::Send => self.sendbuf.ok_or(Error::MissingBuffer {
                operation: "schedule",
                which: "send",
            })?,
            BufferId::Recv => self.recvbuf.as_deref().ok_or(Error::MissingBuffer {
                operation: "schedule",
                which: "receive",
            })?,
            BufferId::Scratch(i) => self.scratch.get(i).map(Vec::as_slice).ok_or(Error::BufferTooSmall {
                needed: region.end(),
                actual: 0,
            })?,
        };
        buf.get(region.offset..region.end())
            .ok_or(Error::BufferTooSmall {
                needed: region.end(),
                actual: buf.len(),
            })
    }

    fn write(&mut self, region: &Region) -> Result<&mut [u8]> {
        let buf: &mut [u8] = match region.buf {
            BufferId::Send => {
                return Err(Error::MissingBuffer {
                    operation: "schedule",
                    which: "writable send",
                })
            }
            BufferId::Recv => self.recvbuf.as_deref_mut().ok_or(Error::MissingBuffer {
                operation: "schedule",
                which: "receive",
            })?,
            BufferId::Scratch(i) => self
                .scratch
                .get_mut(i)
                .map(Vec::as_mut_slice)
                .ok_or(Error::BufferTooSmall {
                    needed: region.end(),
                    actual: 0,
                })?,
        };
        let actual = buf.len();
        buf.get_mut(region.offset..region.end())
            .ok_or(Error::BufferTooSmall {
                needed: region.end(),
                actual,
            })
    }
}

impl fmt::Debug for Schedule<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field("tag", &self.tag)
            .field("steps", &self.steps)
            .field("remaining", &self.remaining)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::environment::Universe;
    use crate::topology::traits::*;
    use crate::transport::LocalFabric;
    use std::sync::Arc;

    #[test]
    fn empty_schedule_is_complete() {
        let fabric = LocalFabric::new();
        let mut s = Schedule::new(0, None, None);
        assert!(s.is_empty());
        assert!(s.is_complete());
        assert!(s.advance(&fabric).unwrap());
        assert!(s.advance(&fabric).unwrap());
    }

    #[test]
    fn regions_are_checked_on_append() {
        let send = [0u8; 4];
        let mut s = Schedule::new(0, Some(&send), None);
        let tmp = s.scratch(2).unwrap();
        let err = s
            .copy(Region::new(BufferId::Send, 0, 4), Region::new(tmp, 0, 4), StepOrder::Independent)
            .unwrap_err();
        assert!(matches!(err, Error::BufferTooSmall { needed: 4, actual: 2 }));
        let err = s
            .copy(Region::new(BufferId::Recv, 0, 1), Region::new(tmp, 0, 1), StepOrder::Independent)
            .unwrap_err();
        assert!(matches!(err, Error::MissingBuffer { .. }));
        assert!(s.is_empty());
    }

    #[test]
    fn ordered_step_closes_phase() {
        let send = [7u8; 2];
        let mut recv = [0u8; 2];
        let mut s = Schedule::new(0, Some(&send), Some(&mut recv));
        let tmp = s.scratch(2).unwrap();
        s.copy(Region::new(BufferId::Send, 0, 2), Region::new(tmp, 0, 2), StepOrder::Independent)
            .unwrap();
        s.copy(Region::new(tmp, 0, 2), Region::new(BufferId::Recv, 0, 2), StepOrder::Ordered)
            .unwrap();
        assert_eq!(s.len(), 3);
        assert_eq!(s.steps()[1], Step::Barrier);
        assert!(s.advance(&LocalFabric::new()).unwrap());
        drop(s);
        assert_eq!(recv, [7, 7]);
    }

    #[test]
    fn local_reduce_step() {
        let send = 5u32.to_ne_bytes();
        let mut recv = 7u32.to_ne_bytes();
        let mut s = Schedule::new(0, Some(&send), Some(&mut recv));
        s.reduce(
            SystemOperation::Sum,
            Datatype::U32,
            Region::new(BufferId::Send, 0, 4),
            Region::new(BufferId::Recv, 0, 4),
            StepOrder::Independent,
        )
        .unwrap();
        assert!(s.advance(&LocalFabric::new()).unwrap());
        drop(s);
        assert_eq!(u32::from_ne_bytes(recv), 12);
    }

    #[test]
    fn receive_waits_for_message_then_phase_continues() {
        let fabric = Arc::new(LocalFabric::new());
        let mut universes = Universe::local_world_on(Arc::clone(&fabric), 2, Config::default())
            .unwrap()
            .into_iter();
        let u0 = universes.next().unwrap();
        let u1 = universes.next().unwrap();

        let mut recv = [0u8; 3];
        let mut s0 = Schedule::new(9, None, Some(&mut recv));
        let ch0 = s0.channel(&u0.world().comm_ref()).unwrap();
        s0.recv(ch0, 1, Region::new(BufferId::Recv, 0, 3), StepOrder::Independent)
            .unwrap();
        let tmp = s0.scratch(3).unwrap();
        s0.copy(Region::new(BufferId::Recv, 0, 3), Region::new(tmp, 0, 3), StepOrder::Ordered)
            .unwrap();

        assert!(!s0.advance(&*fabric).unwrap());
        assert!(!s0.advance(&*fabric).unwrap());
        assert_eq!(s0.remaining(), 3);

        let send = [1u8, 2, 3];
        let mut s1 = Schedule::new(9, Some(&send), None);
        let ch1 = s1.channel(&u1.world().comm_ref()).unwrap();
        s1.send(ch1, 0, Region::new(BufferId::Send, 0, 3), StepOrder::Independent)
            .unwrap();
        assert!(s1.advance(&*fabric).unwrap());

        assert!(s0.advance(&*fabric).unwrap());
        assert_eq!(s0.scratch_buffer(tmp).unwrap(), &[1, 2, 3]);
        assert!(s0.advance(&*fabric).unwrap());
    }

    #[test]
    #[should_panic(expected = "outside group")]
    fn peer_outside_group_panics() {
        let universes = Universe::local_world(1, Config::default()).unwrap();
        let send = [0u8];
        let mut s = Schedule::new(0, Some(&send), None);
        let ch = s.channel(&universes[0].world().comm_ref()).unwrap();
        let _ = s.send(ch, 3, Region::new(BufferId::Send, 0, 1), StepOrder::Independent);
    }
}
