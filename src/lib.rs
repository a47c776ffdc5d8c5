//! A message-passing runtime core for Rust
//!
//! This crate implements the parts of a [Message Passing Interface][MPI] (MPI) runtime that sit
//! between the user-facing calls and the wire: communicator management, collective algorithm
//! selection, schedule execution and non-blocking requests. Message delivery is delegated to a
//! pluggable `Transport`; an in-process `LocalFabric` is provided for running several processes
//! as threads of one program.
//!
//! [MPI]: http://www.mpi-forum.org
//!
//! # Usage
//!
//! ```no_run
//! use mpi_runtime::traits::*;
//! use mpi_runtime::{config::Config, Universe};
//!
//! let universes = Universe::local_world(4, Config::default()).unwrap();
//! let handles: Vec<_> = universes
//!     .into_iter()
//!     .map(|universe| {
//!         std::thread::spawn(move || {
//!             let world = universe.world();
//!             let rank = world.rank();
//!             let root = world.process_at_rank(0);
//!             if rank == 0 {
//!                 let mut all = vec![0i32; 4];
//!                 root.gather_into_root(&[rank][..], &mut all[..]).unwrap();
//!                 assert_eq!(all, [0, 1, 2, 3]);
//!             } else {
//!                 root.gather_into(&[rank][..]).unwrap();
//!             }
//!         })
//!     })
//!     .collect();
//! for h in handles {
//!     h.join().unwrap();
//! }
//! ```
//!
//! # Features
//!
//! - **Groups, Contexts, Communicators**:
//!   - built-in world, self and internal world communicators
//!   - duplication, subgroups and inter-communicators, sharing process tables where possible
//!   - creation and destruction hooks over a registry of live communicators
//!   - any-source receipt disabled on communicators that lose a process
//! - **Collective communication**:
//!   - non-blocking and blocking gather, intra- and inter-communicator
//!   - binomial, k-nomial tree, short and long algorithms, chosen per call
//!   - device override of the runtime's own algorithms
//!
//! Not supported (yet):
//!
//! - Point to point communication outside of collectives
//! - Every collective other than gather
//! - Dynamic process management
//!
//! The sub-modules contain a more detailed description of which features are and are not
//! supported.

pub mod collective;
pub mod config;
pub mod datatype;
pub mod device;
pub mod environment;
pub mod error;
pub mod progress;
pub mod request;
pub mod schedule;
pub mod topology;
pub mod transport;

/// Re-exports all traits.
pub mod traits {
    pub use crate::collective::traits::*;
    pub use crate::datatype::traits::*;
    pub use crate::device::{DeviceCollectives, DeviceRequest};
    pub use crate::topology::traits::*;
}

pub use crate::environment::Universe;
pub use crate::error::{Error, Result};

/// Identifies a process within a group.
pub type Rank = i32;
/// Can be used to tag messages on the sender side and match on the receiver side.
pub type Tag = i32;
