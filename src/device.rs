//! Device-level collectives
//!
//! A device may take over collectives it can do better than the runtime's own schedules, e.g.
//! through shared memory or a network offload. When a device is installed with
//! `UniverseBuilder::device` and the configuration routes a collective to it, the runtime hands
//! the call over before any algorithm is selected and returns the device's request unchanged.

use crate::collective::GatherArgs;
use crate::error::Result;
use crate::request::Request;
use crate::topology::traits::*;

/// An in-flight device operation.
pub trait DeviceRequest {
    /// Attempt progress and report whether the operation has completed.
    fn test(&mut self) -> Result<bool>;
}

/// Collectives implemented by a device.
pub trait DeviceCollectives: Send + Sync {
    /// Start a non-blocking gather.
    ///
    /// Devices that only handle some calls pass the rest to `collective::igather_runtime`.
    fn igather<'a>(&self, comm: &dyn Communicator, args: GatherArgs<'a>) -> Result<Request<'a>>;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::collective::{self, GatherRoot};
    use crate::config::{Config, DeviceCollectives as Policy};
    use crate::environment::{ProcessGroup, Universe};
    use crate::request::Backend;
    use crate::transport::LocalFabric;

    #[derive(Default)]
    struct Offload {
        calls: AtomicUsize,
    }

    impl DeviceCollectives for Offload {
        fn igather<'a>(&self, comm: &dyn Communicator, args: GatherArgs<'a>) -> Result<Request<'a>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if comm.size() == 1 {
                return Ok(Request::null());
            }
            collective::igather_runtime(comm, args)
        }
    }

    fn universe(config: Config, device: Arc<Offload>) -> Universe {
        Universe::builder(ProcessGroup::uniform(0, 1, 0), Arc::new(LocalFabric::new()))
            .config(config)
            .device(device)
            .initialize()
            .unwrap()
    }

    #[test]
    fn installed_device_takes_the_call() {
        let device = Arc::new(Offload::default());
        let universe = universe(Config::default(), Arc::clone(&device));
        let send = [7u8];
        let mut recv = [0u8];
        let req = collective::igather(
            &universe.world(),
            GatherArgs::at_root(0, &send[..], &mut recv[..]),
        )
        .unwrap();
        assert!(req.is_null());
        req.wait().unwrap();
        assert_eq!(device.calls.load(Ordering::Relaxed), 1);
        assert_eq!(recv, [0]);
    }

    #[test]
    fn policy_can_bypass_device() {
        let device = Arc::new(Offload::default());
        let mut config = Config::default();
        config.device_collectives = Policy::None;
        let universe = universe(config, Arc::clone(&device));
        let send = [7u8];
        let mut recv = [0u8];
        let req = collective::igather(
            &universe.world(),
            GatherArgs::new(
                collective::SendBuf::Bytes(&send[..]),
                1,
                crate::datatype::Datatype::Byte,
                Some(&mut recv[..]),
                1,
                crate::datatype::Datatype::Byte,
                GatherRoot::Rank(0),
            ),
        )
        .unwrap();
        assert_eq!(req.backend(), Backend::Schedule);
        req.wait().unwrap();
        assert_eq!(device.calls.load(Ordering::Relaxed), 0);
        assert_eq!(recv, [7]);
    }
}
