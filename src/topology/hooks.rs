//! Communicator lifecycle hooks and the live-communicator registry
//!
//! Hooks run inside the runtime's critical section whenever a communicator is committed or
//! destroyed. They receive the communicator and the registry of live communicators and may
//! mutate both. A hook must not call back into communicator creation or destruction.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::error::{try_reserve, Result};
use crate::topology::{CommRef, ContextId};

/// Signature of a communicator lifecycle hook.
pub type CommHookFn = dyn Fn(&CommRef, &mut LiveComms) -> Result<()> + Send + Sync;

/// When a hook runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HookKind {
    /// After the virtual connection tables of a new communicator are built.
    Create,
    /// Before the tables of a communicator are released.
    Destroy,
}

#[derive(Clone)]
struct HookEntry {
    name: Cow<'static, str>,
    hook: Arc<CommHookFn>,
}

/// Ordered lists of create and destroy hooks. Hooks run in registration order.
#[derive(Default)]
pub(crate) struct HookList {
    create: Vec<HookEntry>,
    destroy: Vec<HookEntry>,
}

impl HookList {
    fn list_mut(&mut self, kind: HookKind) -> &mut Vec<HookEntry> {
        match kind {
            HookKind::Create => &mut self.create,
            HookKind::Destroy => &mut self.destroy,
        }
    }

    fn list(&self, kind: HookKind) -> &[HookEntry] {
        match kind {
            HookKind::Create => &self.create,
            HookKind::Destroy => &self.destroy,
        }
    }

    pub(crate) fn register(
        &mut self,
        kind: HookKind,
        name: Cow<'static, str>,
        hook: Arc<CommHookFn>,
    ) -> Result<()> {
        let list = self.list_mut(kind);
        try_reserve(list, 1, "communicator hook entry")?;
        tracing::debug!(hook = %name, ?kind, position = list.len(), "registering hook");
        list.push(HookEntry { name, hook });
        Ok(())
    }

    /// Run every hook of `kind` on `comm`, stopping at the first failure.
    pub(crate) fn run(&self, kind: HookKind, comm: &CommRef, live: &mut LiveComms) -> Result<()> {
        for entry in self.list(kind) {
            if let Err(e) = (entry.hook)(comm, live) {
                tracing::warn!(
                    hook = %entry.name,
                    ?kind,
                    context_id = %comm.context_id(),
                    error = %e,
                    "communicator hook failed"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) fn len(&self, kind: HookKind) -> usize {
        self.list(kind).len()
    }

    pub(crate) fn clear(&mut self) {
        self.create.clear();
        self.destroy.clear();
    }
}

impl fmt::Debug for HookList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |l: &[HookEntry]| l.iter().map(|e| e.name.clone()).collect::<Vec<_>>();
        f.debug_struct("HookList")
            .field("create", &names(&self.create))
            .field("destroy", &names(&self.destroy))
            .finish()
    }
}

/// The set of communicators that are committed and not yet destroyed.
#[derive(Default)]
pub struct LiveComms {
    comms: Vec<CommRef>,
}

impl LiveComms {
    /// Add `comm`. Inserting a communicator already present does nothing.
    pub fn insert(&mut self, comm: CommRef) {
        if !self.contains(&comm) {
            self.comms.push(comm);
        }
    }

    /// Remove `comm`, returning whether it was present.
    pub fn remove(&mut self, comm: &CommRef) -> bool {
        match self.comms.iter().position(|c| c.ptr_eq(comm)) {
            Some(i) => {
                self.comms.remove(i);
                true
            }
            None => false,
        }
    }

    /// Whether `comm` is registered.
    pub fn contains(&self, comm: &CommRef) -> bool {
        self.comms.iter().any(|c| c.ptr_eq(comm))
    }

    /// Number of live communicators.
    pub fn len(&self) -> usize {
        self.comms.len()
    }

    /// Whether no communicator is live.
    pub fn is_empty(&self) -> bool {
        self.comms.is_empty()
    }

    /// Iterate over the live communicators.
    pub fn iter(&self) -> impl Iterator<Item = &CommRef> {
        self.comms.iter()
    }

    /// Find the communicator owning `context_id`, either as its point-to-point or its collective
    /// context.
    pub fn find_by_context(&self, context_id: ContextId) -> Option<&CommRef> {
        self.comms.iter().find(|c| {
            let base = c.context_id();
            base == context_id || base.collective() == context_id
        })
    }
}

impl fmt::Debug for LiveComms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.comms.iter().map(|c| c.context_id()))
            .finish()
    }
}

/// State guarded by the runtime's critical section.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    pub(crate) hooks: HookList,
    pub(crate) live: LiveComms,
    pub(crate) finalized: bool,
}

impl Registry {
    /// A registry with the built-in any-source bookkeeping hooks installed.
    pub(crate) fn with_builtin_hooks() -> Result<Self> {
        let mut reg = Registry::default();
        reg.hooks
            .register(HookKind::Create, Cow::Borrowed("comm_created"), Arc::new(comm_created))?;
        reg.hooks.register(
            HookKind::Destroy,
            Cow::Borrowed("comm_destroyed"),
            Arc::new(comm_destroyed),
        )?;
        Ok(reg)
    }

    /// Run the create hooks. On failure the communicator is taken back out of the live set.
    pub(crate) fn run_create(&mut self, comm: &CommRef) -> Result<()> {
        let Registry { hooks, live, .. } = self;
        let result = hooks.run(HookKind::Create, comm, live);
        if result.is_err() {
            live.remove(comm);
        }
        result
    }

    pub(crate) fn run_destroy(&mut self, comm: &CommRef) -> Result<()> {
        let Registry { hooks, live, .. } = self;
        hooks.run(HookKind::Destroy, comm, live)
    }
}

/// Built-in create hook: enable any-source receipt, normalize hints and register the
/// communicator as live.
pub(crate) fn comm_created(comm: &CommRef, live: &mut LiveComms) -> Result<()> {
    comm.set_anysource_enabled(true);
    if comm.eager_threshold() == 0 {
        comm.set_eager_threshold(-1);
    }
    comm.set_last_ack_rank(-1);
    live.insert(comm.clone());
    tracing::trace!(context_id = %comm.context_id(), live = live.len(), "communicator live");
    Ok(())
}

/// Built-in destroy hook: drop the communicator from the live set.
pub(crate) fn comm_destroyed(comm: &CommRef, live: &mut LiveComms) -> Result<()> {
    live.remove(comm);
    tracing::trace!(context_id = %comm.context_id(), live = live.len(), "communicator retired");
    Ok(())
}
