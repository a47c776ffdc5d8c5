//! Environmental management
//!
//! A `Universe` is the runtime of one process. It owns the process group description, the
//! transport, the configuration, the registry of live communicators with its lifecycle hooks,
//! and the three built-in communicators. Dropping a `Universe` finalizes it.
//!
//! Several universes sharing one `LocalFabric` model the ranks of a parallel job inside a single
//! process, see `Universe::local_world`.

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use conv::ConvUtil;

use crate::collective::select::{CostModel, SelectionTable};
use crate::config::Config;
use crate::device::DeviceCollectives;
use crate::error::{try_reserve, Error, Result};
use crate::progress::ProgressEngine;
use crate::topology::fault;
use crate::topology::hooks::{CommHookFn, HookKind, Registry};
use crate::topology::sealed::CommHandle;
use crate::topology::{
    commit_state, destroy, CommKind, CommRef, CommState, ContextId, Hints, LiveComms, Role,
    SystemCommunicator, Tables, VcTable,
};
use crate::transport::{Endpoint, LocalFabric, Transport};
use crate::Rank;

/// The processes started together, and the endpoint of each.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessGroup {
    id: u32,
    rank: usize,
    table: Vec<Endpoint>,
}

impl ProcessGroup {
    /// A process group with an explicit endpoint table, seen from process `rank`.
    ///
    /// # Panics
    ///
    /// If `rank` is not an index into `table`.
    pub fn new(id: u32, rank: Rank, table: Vec<Endpoint>) -> Self {
        let rank = rank
            .value_as::<usize>()
            .ok()
            .filter(|&r| r < table.len())
            .unwrap_or_else(|| panic!("rank {} outside process group of size {}", rank, table.len()));
        ProcessGroup { id, rank, table }
    }

    /// A process group of `size` processes whose endpoints are `(id, 0..size)`.
    pub fn uniform(id: u32, size: u32, rank: Rank) -> Self {
        Self::new(id, rank, (0..size).map(|r| Endpoint::new(id, r)).collect())
    }

    /// Process group identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of processes.
    pub fn size(&self) -> usize {
        self.table.len()
    }

    /// Rank of the calling process.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Endpoint of process `rank`.
    pub fn endpoint(&self, rank: usize) -> Option<Endpoint> {
        self.table.get(rank).copied()
    }
}

/// Runtime state shared by every communicator handle of one universe.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) pg: ProcessGroup,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) progress: Arc<ProgressEngine>,
    pub(crate) device: Option<Arc<dyn DeviceCollectives>>,
    pub(crate) cost_model: Arc<dyn CostModel>,
    registry: Mutex<Registry>,
    next_context: AtomicU32,
}

impl Shared {
    /// Enter the critical section guarding communicator construction and destruction.
    pub(crate) fn registry(&self) -> Result<MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|_| Error::LockPoisoned("communicator registry"))
    }

    /// Allocate the next context id. Processes constructing communicators in the same order
    /// allocate the same ids.
    pub(crate) fn allocate_context(&self) -> ContextId {
        ContextId::from_raw(self.next_context.fetch_add(ContextId::STRIDE, Ordering::Relaxed))
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("pg", &self.pg.id)
            .field("rank", &self.pg.rank)
            .field("device", &self.device.is_some())
            .finish()
    }
}

/// Configure a `Universe` before initializing it.
pub struct UniverseBuilder {
    pg: ProcessGroup,
    transport: Arc<dyn Transport>,
    config: Option<Config>,
    device: Option<Arc<dyn DeviceCollectives>>,
    cost_model: Option<Arc<dyn CostModel>>,
}

impl UniverseBuilder {
    /// Use `config` instead of `Config::global()`.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Install a device layer that may take over collectives.
    pub fn device(mut self, device: Arc<dyn DeviceCollectives>) -> Self {
        self.device = Some(device);
        self
    }

    /// Replace the default algorithm selection table.
    pub fn cost_model(mut self, model: Arc<dyn CostModel>) -> Self {
        self.cost_model = Some(model);
        self
    }

    /// Commit the built-in communicators and return the running universe.
    pub fn initialize(self) -> Result<Universe> {
        let shared = Arc::new(Shared {
            config: self.config.unwrap_or_else(|| Config::global().clone()),
            pg: self.pg,
            transport: self.transport,
            progress: Arc::new(ProgressEngine::new()),
            device: self.device,
            cost_model: self
                .cost_model
                .unwrap_or_else(|| Arc::new(SelectionTable::default())),
            registry: Mutex::new(Registry::with_builtin_hooks()?),
            next_context: AtomicU32::new(ContextId::FIRST_USER),
        });

        let (world, self_comm, internal_world) = {
            let mut reg = shared.registry()?;
            let pg = &shared.pg;

            let mut entries = Vec::new();
            try_reserve(&mut entries, pg.size(), "virtual connection table")?;
            entries.extend_from_slice(&pg.table);
            let world_table = VcTable::new(entries);
            let internal_table = world_table.retain();
            let self_table = VcTable::new(vec![pg.table[pg.rank]]);

            let intra = |context_id, role, rank, table| {
                CommState::new(
                    context_id,
                    CommKind::Intra,
                    role,
                    rank,
                    Tables {
                        vcrt: Some(table),
                        local_vcrt: None,
                    },
                    Hints::default(),
                )
            };
            let world = commit_state(&mut reg, intra(ContextId::WORLD, Role::World, pg.rank, world_table))?;
            let self_comm = commit_state(&mut reg, intra(ContextId::SELF, Role::SelfComm, 0, self_table))?;
            let internal_world = commit_state(
                &mut reg,
                intra(ContextId::INTERNAL_WORLD, Role::InternalWorld, pg.rank, internal_table),
            )?;
            (world, self_comm, internal_world)
        };

        tracing::info!(
            pg = shared.pg.id,
            rank = shared.pg.rank,
            size = shared.pg.size(),
            device = shared.device.is_some(),
            "universe initialized"
        );
        Ok(Universe {
            shared,
            world,
            self_comm,
            internal_world,
            finalized: false,
        })
    }
}

/// Global context
pub struct Universe {
    shared: Arc<Shared>,
    world: Arc<CommState>,
    self_comm: Arc<CommState>,
    internal_world: Arc<CommState>,
    finalized: bool,
}

impl Universe {
    /// Start configuring the universe of process `pg.rank()` communicating through `transport`.
    pub fn builder(pg: ProcessGroup, transport: Arc<dyn Transport>) -> UniverseBuilder {
        UniverseBuilder {
            pg,
            transport,
            config: None,
            device: None,
            cost_model: None,
        }
    }

    /// Initialize with the process-wide configuration and default selection table.
    pub fn initialize(pg: ProcessGroup, transport: Arc<dyn Transport>) -> Result<Universe> {
        Self::builder(pg, transport).initialize()
    }

    /// One universe per rank of a `size`-process job, connected through a fresh `LocalFabric`.
    pub fn local_world(size: u32, config: Config) -> Result<Vec<Universe>> {
        Self::local_world_on(Arc::new(LocalFabric::new()), size, config)
    }

    /// Like `local_world`, over an existing fabric.
    pub fn local_world_on(fabric: Arc<LocalFabric>, size: u32, config: Config) -> Result<Vec<Universe>> {
        (0..size)
            .map(|rank| {
                let pg = ProcessGroup::uniform(0, size, rank.value_as().expect("rank fits in Rank"));
                Self::builder(pg, fabric.clone())
                    .config(config.clone())
                    .initialize()
            })
            .collect()
    }

    fn system(&self, state: &Arc<CommState>) -> SystemCommunicator {
        SystemCommunicator::new(CommHandle::new(Arc::clone(state), Arc::clone(&self.shared)))
    }

    /// The 'world communicator'
    ///
    /// Contains all processes initially partaking in the computation.
    pub fn world(&self) -> SystemCommunicator {
        self.system(&self.world)
    }

    /// The communicator containing only the calling process.
    pub fn self_comm(&self) -> SystemCommunicator {
        self.system(&self.self_comm)
    }

    /// The runtime's internal duplicate of the world communicator. It shares the world's table.
    pub fn internal_world(&self) -> SystemCommunicator {
        self.system(&self.internal_world)
    }

    /// Configuration in effect.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// The process group this universe belongs to.
    pub fn process_group(&self) -> &ProcessGroup {
        &self.shared.pg
    }

    /// The completion signalling shared by this universe's requests.
    pub fn progress(&self) -> &ProgressEngine {
        &self.shared.progress
    }

    /// Register a hook run after every communicator commit, after those already registered.
    pub fn register_create_hook<F>(&self, name: impl Into<Cow<'static, str>>, hook: F) -> Result<()>
    where
        F: Fn(&CommRef, &mut LiveComms) -> Result<()> + Send + Sync + 'static,
    {
        self.register_hook(HookKind::Create, name.into(), Arc::new(hook))
    }

    /// Register a hook run before every communicator destruction, after those already
    /// registered.
    pub fn register_destroy_hook<F>(&self, name: impl Into<Cow<'static, str>>, hook: F) -> Result<()>
    where
        F: Fn(&CommRef, &mut LiveComms) -> Result<()> + Send + Sync + 'static,
    {
        self.register_hook(HookKind::Destroy, name.into(), Arc::new(hook))
    }

    fn register_hook(&self, kind: HookKind, name: Cow<'static, str>, hook: Arc<CommHookFn>) -> Result<()> {
        let mut reg = self.shared.registry()?;
        if reg.finalized {
            return Err(Error::Finalized);
        }
        reg.hooks.register(kind, name, hook)
    }

    /// Number of hooks of `kind`, including the built-in ones.
    pub fn hook_count(&self, kind: HookKind) -> Result<usize> {
        Ok(self.shared.registry()?.hooks.len(kind))
    }

    /// Snapshot of the live communicators.
    pub fn live_communicators(&self) -> Result<Vec<CommRef>> {
        Ok(self.shared.registry()?.live.iter().cloned().collect())
    }

    /// The live communicator owning `context_id`.
    pub fn find_comm(&self, context_id: ContextId) -> Result<Option<CommRef>> {
        Ok(self.shared.registry()?.live.find_by_context(context_id).cloned())
    }

    /// Disable any-source receipt on every live communicator containing one of the world ranks
    /// in `failed`. Returns the number of communicators affected.
    ///
    /// # Panics
    ///
    /// If a rank is not a rank of the world communicator.
    pub fn handle_failed_procs(&self, failed: &[Rank]) -> Result<usize> {
        let pg = &self.shared.pg;
        let endpoints: Vec<Endpoint> = failed
            .iter()
            .map(|&r| {
                r.value_as::<usize>()
                    .ok()
                    .and_then(|r| pg.endpoint(r))
                    .unwrap_or_else(|| panic!("failed rank {} outside the world communicator", r))
            })
            .collect();
        fault::handle_failed_procs(&self.shared, &endpoints)
    }

    /// Destroy the built-in communicators and drop every registered hook.
    pub fn finalize(mut self) -> Result<()> {
        self.finalize_inner()
    }

    fn finalize_inner(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        let mut result = Ok(());
        for state in [&self.internal_world, &self.self_comm, &self.world] {
            let r = destroy(state, &self.shared);
            if result.is_ok() {
                result = r;
            }
        }

        let mut reg = self.shared.registry()?;
        reg.hooks.clear();
        reg.finalized = true;
        if !reg.live.is_empty() {
            tracing::warn!(live = reg.live.len(), "finalized with live communicators");
        }
        drop(reg);

        tracing::info!(rank = self.shared.pg.rank, "universe finalized");
        result
    }
}

impl Drop for Universe {
    fn drop(&mut self) {
        if let Err(e) = self.finalize_inner() {
            tracing::warn!(error = %e, "error while finalizing universe");
        }
    }
}

impl fmt::Debug for Universe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Universe")
            .field("shared", &self.shared)
            .field("finalized", &self.finalized)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::traits::*;

    #[test]
    fn bootstrap_communicators_are_live() {
        let universes = Universe::local_world(3, Config::default()).unwrap();
        let u = &universes[1];
        let live = u.live_communicators().unwrap();
        assert_eq!(live.len(), 3);
        assert_eq!(u.world().size(), 3);
        assert_eq!(u.world().rank(), 1);
        assert_eq!(u.self_comm().size(), 1);
        assert_eq!(u.self_comm().rank(), 0);

        let world = u.world().comm_ref().vcrt_stats().unwrap();
        let internal = u.internal_world().comm_ref().vcrt_stats().unwrap();
        assert_eq!(world.id, internal.id);
        assert_eq!(world.ref_count, 2);
    }

    #[test]
    fn find_comm_matches_collective_context() {
        let universes = Universe::local_world(1, Config::default()).unwrap();
        let u = &universes[0];
        let found = u.find_comm(ContextId::WORLD.collective()).unwrap().unwrap();
        assert_eq!(found.context_id(), ContextId::WORLD);
        assert!(u.find_comm(ContextId::from_raw(400)).unwrap().is_none());
    }

    #[test]
    fn finalize_empties_registry() {
        let mut universes = Universe::local_world(1, Config::default()).unwrap();
        let u = universes.pop().unwrap();
        let shared = Arc::clone(&u.shared);
        let world = u.world().comm_ref();
        u.finalize().unwrap();
        let reg = shared.registry().unwrap();
        assert!(reg.live.is_empty());
        assert_eq!(reg.hooks.len(HookKind::Create), 0);
        assert!(world.vcrt_stats().is_none());
    }

    #[test]
    fn commit_after_finalize_fails() {
        let mut universes = Universe::local_world(1, Config::default()).unwrap();
        let u = universes.pop().unwrap();
        let dup = u.world().duplicate().unwrap();
        u.finalize().unwrap();
        assert!(matches!(dup.duplicate(), Err(Error::Finalized)));
    }
}
