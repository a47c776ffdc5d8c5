//! Request objects for non-blocking operations
//!
//! Non-blocking operations such as `immediate_gather()` return request objects that borrow any
//! buffers involved in the operation so as to ensure proper access restrictions. In order to
//! release the borrowed buffers from the request objects, a completion operation such as
//! [`wait()`](struct.Request.html#method.wait) or [`test()`](struct.Request.html#method.test) must
//! be used on the request object.
//!
//! Nothing progresses in the background: a request only moves forward while its owner calls
//! `test` or `wait` on it.
//!
//! **Note:** Dropping a request that has not completed abandons the operation. The peers of an
//! abandoned collective may block forever.

use std::fmt;
use std::sync::Arc;
use std::thread;

use crate::collective::tree::TreeGather;
use crate::device::DeviceRequest;
use crate::error::Result;
use crate::progress::{ProgressEngine, PARK_INTERVAL};
use crate::schedule::Schedule;
use crate::transport::Transport;

/// Request traits
pub mod traits {
    pub use crate::device::DeviceRequest;
}

/// What drives a request to completion.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Nothing, the request was complete on creation.
    Null,
    /// A schedule advanced by the runtime.
    Schedule,
    /// A transport-level tree algorithm.
    Tree,
    /// A device-provided request.
    Device,
}

enum Work<'a> {
    Null,
    Schedule(Schedule<'a>),
    Tree(TreeGather<'a>),
    Device(Box<dyn DeviceRequest + 'a>),
}

struct Engine {
    transport: Arc<dyn Transport>,
    progress: Arc<ProgressEngine>,
}

/// A request object for a non-blocking operation borrowing buffers for lifetime `'a`
///
/// # Examples
///
/// See `tests/gather.rs`
#[must_use]
pub struct Request<'a> {
    work: Work<'a>,
    engine: Option<Engine>,
    complete: bool,
}

impl<'a> Request<'a> {
    /// A request that is already complete.
    pub fn null() -> Request<'static> {
        Request {
            work: Work::Null,
            engine: None,
            complete: true,
        }
    }

    fn posted(work: Work<'a>, transport: Arc<dyn Transport>, progress: Arc<ProgressEngine>) -> Self {
        progress.post();
        Request {
            work,
            engine: Some(Engine {
                transport,
                progress,
            }),
            complete: false,
        }
    }

    /// Wrap a schedule and make a first progress attempt on it. A schedule with nothing left
    /// to wait for comes back complete.
    pub(crate) fn from_schedule(
        schedule: Schedule<'a>,
        transport: Arc<dyn Transport>,
        progress: Arc<ProgressEngine>,
    ) -> Result<Self> {
        let mut req = Request::posted(Work::Schedule(schedule), transport, progress);
        req.test()?;
        Ok(req)
    }

    pub(crate) fn from_tree(
        tree: TreeGather<'a>,
        transport: Arc<dyn Transport>,
        progress: Arc<ProgressEngine>,
    ) -> Result<Self> {
        let mut req = Request::posted(Work::Tree(tree), transport, progress);
        req.test()?;
        Ok(req)
    }

    /// Wrap a request provided by a device. It is driven through `DeviceRequest::test`.
    pub fn from_device(request: Box<dyn DeviceRequest + 'a>) -> Self {
        Request {
            work: Work::Device(request),
            engine: None,
            complete: false,
        }
    }

    /// Whether this is the null request.
    pub fn is_null(&self) -> bool {
        matches!(self.work, Work::Null)
    }

    /// Whether the operation has completed. Does not attempt progress.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// What drives this request.
    pub fn backend(&self) -> Backend {
        match self.work {
            Work::Null => Backend::Null,
            Work::Schedule(_) => Backend::Schedule,
            Work::Tree(_) => Backend::Tree,
            Work::Device(_) => Backend::Device,
        }
    }

    /// The schedule behind the request, if it is schedule-driven.
    pub fn schedule(&self) -> Option<&Schedule<'a>> {
        match &self.work {
            Work::Schedule(s) => Some(s),
            _ => None,
        }
    }

    fn poll(&mut self) -> Result<bool> {
        match (&mut self.work, &self.engine) {
            (Work::Null, _) => Ok(true),
            (Work::Device(d), _) => d.test(),
            (Work::Schedule(s), Some(e)) => s.advance(&*e.transport),
            (Work::Tree(t), Some(e)) => t.poll(&*e.transport),
            (_, None) => unreachable!("runtime requests carry their engine"),
        }
    }

    fn finish(&mut self) {
        self.complete = true;
        if let Some(e) = &self.engine {
            e.progress.retire();
        }
    }

    /// Attempt progress and report whether the operation has completed.
    ///
    /// A request that fails counts as complete: the error is returned once and the request
    /// will not be progressed again.
    pub fn test(&mut self) -> Result<bool> {
        if self.complete {
            return Ok(true);
        }
        match self.poll() {
            Ok(true) => {
                self.finish();
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                tracing::debug!(error = %e, "request failed");
                self.finish();
                Err(e)
            }
        }
    }

    fn park(&self, seen: Option<u64>) {
        match (&self.engine, seen) {
            (Some(e), Some(seen)) => e.progress.park(seen, PARK_INTERVAL),
            _ => thread::yield_now(),
        }
    }

    fn generation(&self) -> Option<u64> {
        self.engine.as_ref().map(|e| e.progress.generation())
    }

    /// Wait for the operation to finish.
    ///
    /// Will block execution of the calling thread until the associated operation has finished,
    /// releasing the borrowed buffers.
    pub fn wait(mut self) -> Result<()> {
        loop {
            let seen = self.generation();
            if self.test()? {
                return Ok(());
            }
            self.park(seen);
        }
    }
}

impl<'a> DeviceRequest for Request<'a> {
    fn test(&mut self) -> Result<bool> {
        Request::test(self)
    }
}

impl<'a> Drop for Request<'a> {
    fn drop(&mut self) {
        if !self.complete {
            tracing::warn!(backend = ?self.backend(), "request dropped before completion");
            self.finish();
        }
    }
}

impl<'a> fmt::Debug for Request<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("backend", &self.backend())
            .field("complete", &self.complete)
            .finish()
    }
}

/// Wait for all `requests` to finish, progressing them round-robin.
///
/// Stops at the first failing request and returns its error.
pub fn wait_all(requests: Vec<Request<'_>>) -> Result<()> {
    let mut pending = requests;
    while !pending.is_empty() {
        let seen = pending[0].generation();
        let mut i = 0;
        while i < pending.len() {
            if pending[i].test()? {
                pending.swap_remove(i).wait()?;
            } else {
                i += 1;
            }
        }
        if let Some(first) = pending.first() {
            first.park(seen);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::transport::LocalFabric;
    use std::cell::Cell;

    struct Countdown<'c>(&'c Cell<u32>);

    impl DeviceRequest for Countdown<'_> {
        fn test(&mut self) -> Result<bool> {
            let left = self.0.get();
            if left == 0 {
                return Ok(true);
            }
            self.0.set(left - 1);
            Ok(left == 1)
        }
    }

    #[test]
    fn null_request_is_complete() {
        let req = Request::null();
        assert!(req.is_null());
        assert!(req.is_complete());
        req.wait().unwrap();
    }

    #[test]
    fn device_request_is_polled_until_done() {
        let left = Cell::new(3);
        let mut req = Request::from_device(Box::new(Countdown(&left)));
        assert_eq!(req.backend(), Backend::Device);
        assert!(!req.test().unwrap());
        req.wait().unwrap();
        assert_eq!(left.get(), 0);
    }

    #[test]
    fn empty_schedule_completes_on_creation() {
        let progress = Arc::new(ProgressEngine::new());
        let req = Request::from_schedule(
            Schedule::new(0, None, None),
            Arc::new(LocalFabric::new()),
            Arc::clone(&progress),
        )
        .unwrap();
        assert!(req.is_complete());
        assert_eq!(progress.active(), 0);
        req.wait().unwrap();
    }

    #[test]
    fn failure_is_reported_once() {
        struct Broken;
        impl DeviceRequest for Broken {
            fn test(&mut self) -> Result<bool> {
                Err(Error::device("link down"))
            }
        }
        let mut req = Request::from_device(Box::new(Broken));
        assert!(matches!(req.test(), Err(Error::Device(_))));
        assert!(req.test().unwrap());
    }

    #[test]
    fn wait_all_drains_every_request() {
        let a = Cell::new(2);
        let b = Cell::new(5);
        let reqs = vec![
            Request::from_device(Box::new(Countdown(&a))),
            Request::from_device(Box::new(Countdown(&b))),
            Request::null(),
        ];
        wait_all(reqs).unwrap();
        assert_eq!((a.get(), b.get()), (0, 0));
    }
}
