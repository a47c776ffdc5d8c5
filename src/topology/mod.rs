//! Organizing processes as groups and communicators
//!
//! Upon initialization of a `Universe` three communicators are committed: the world
//! communicator containing every process of the process group, the self communicator containing
//! only the calling process, and an internal duplicate of the world communicator reserved for
//! runtime traffic. Further communicators are derived from existing ones, either through the
//! convenience methods of `Communicator` (`duplicate`, `create_subgroup`, `intercomm_create`) or
//! by describing their groups with `Mapper`s on a `CommBuilder`.
//!
//! Every communicator owns one or two virtual connection tables mapping its ranks to transport
//! endpoints. An intra-communicator has one table. An inter-communicator has a table for the
//! remote group, used to address peers, and one for its local group.
//!
//! Committing and destroying communicators happens inside the runtime's critical section and
//! runs the registered lifecycle hooks, see `hooks`.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use conv::ConvUtil;
use once_cell::sync::OnceCell;

use crate::environment::Shared;
use crate::error::{Error, Result};
use crate::transport::{Endpoint, Transport};
use crate::{Rank, Tag};

pub(crate) mod fault;
pub mod hooks;
pub mod mapper;
pub(crate) mod sealed;
pub mod vcrt;

pub use self::hooks::{CommHookFn, HookKind, LiveComms};
pub use self::mapper::{MapDir, MapKind, Mapper};
pub use self::vcrt::{TableStats, VcTable};

use self::hooks::Registry;
use self::mapper::Pass;
use self::sealed::{AsHandle, CommHandle};

/// Communicator traits
pub mod traits {
    pub use super::Communicator;
}

/// Tags handed out for collective operations are masked into this range.
const TAG_MASK: Tag = 0x3fff_ffff;

/// Identifies the communication context of a communicator.
///
/// Context ids are allocated in strides of four: the base id carries point-to-point traffic,
/// `collective()` carries collective traffic, and `local_companion()` is reserved for the
/// local-group companion of an inter-communicator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u32);

impl ContextId {
    /// Context of the world communicator.
    pub const WORLD: ContextId = ContextId(0);
    /// Context of the self communicator.
    pub const SELF: ContextId = ContextId(4);
    /// Context of the internal duplicate of the world communicator.
    pub const INTERNAL_WORLD: ContextId = ContextId(8);

    pub(crate) const FIRST_USER: u32 = 12;
    pub(crate) const STRIDE: u32 = 4;
    const COLL_OFFSET: u32 = 1;
    const LOCAL_OFFSET: u32 = 2;

    /// Wrap a raw context id.
    pub const fn from_raw(raw: u32) -> Self {
        ContextId(raw)
    }

    /// The raw value.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// The context used by collective operations on the same communicator.
    pub fn collective(self) -> Self {
        ContextId(self.0 + Self::COLL_OFFSET)
    }

    /// The base context of an inter-communicator's local-group companion.
    pub fn local_companion(self) -> Self {
        ContextId(self.0 + Self::LOCAL_OFFSET)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a communicator connects one group or two.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CommKind {
    /// Ranks address members of the same group.
    Intra,
    /// Ranks address members of the remote group.
    Inter,
}

/// Communicator creation hints.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Hints {
    /// Message size up to which sends are eager. `0` means unset and becomes `-1` (transport
    /// default) when the communicator is committed.
    pub eager_threshold: i64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    World,
    SelfComm,
    InternalWorld,
    User,
    LocalCompanion,
}

pub(crate) struct Tables {
    pub(crate) vcrt: Option<VcTable>,
    pub(crate) local_vcrt: Option<VcTable>,
}

/// Runtime state of one committed communicator.
pub(crate) struct CommState {
    pub(crate) context_id: ContextId,
    pub(crate) kind: CommKind,
    pub(crate) role: Role,
    pub(crate) rank: usize,
    pub(crate) local_size: usize,
    pub(crate) remote_size: usize,
    tables: Mutex<Tables>,
    eager_threshold: AtomicI64,
    anysource_enabled: AtomicBool,
    last_ack_rank: AtomicI32,
    disconnected: AtomicBool,
    destroyed: AtomicBool,
    next_tag: AtomicI32,
    local_comm: OnceCell<Arc<CommState>>,
}

impl CommState {
    /// Wrap freshly built tables. Sizes are taken from the tables.
    ///
    /// # Panics
    ///
    /// If the tables do not fit `kind`, or `rank` is not a rank of the local group.
    pub(crate) fn new(
        context_id: ContextId,
        kind: CommKind,
        role: Role,
        rank: usize,
        tables: Tables,
        hints: Hints,
    ) -> Self {
        let vcrt_len = tables.vcrt.as_ref().map_or(0, VcTable::len);
        let (local_size, remote_size) = match kind {
            CommKind::Intra => {
                assert!(tables.local_vcrt.is_none(), "intra-communicator with a local table");
                (vcrt_len, vcrt_len)
            }
            CommKind::Inter => {
                let local = tables
                    .local_vcrt
                    .as_ref()
                    .expect("inter-communicator without a local table");
                (local.len(), vcrt_len)
            }
        };
        assert!(
            rank < local_size,
            "rank {} outside local group of size {}",
            rank,
            local_size
        );
        CommState {
            context_id,
            kind,
            role,
            rank,
            local_size,
            remote_size,
            tables: Mutex::new(tables),
            eager_threshold: AtomicI64::new(hints.eager_threshold),
            anysource_enabled: AtomicBool::new(false),
            last_ack_rank: AtomicI32::new(-1),
            disconnected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            next_tag: AtomicI32::new(0),
            local_comm: OnceCell::new(),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the table of the local group (`local`) or of the addressed group.
    ///
    /// For an intra-communicator both are the same table. Returns `None` after destruction.
    pub(crate) fn with_table<R>(&self, local: bool, f: impl FnOnce(&VcTable) -> R) -> Option<R> {
        let tables = self.tables();
        let table = match (self.kind, local) {
            (CommKind::Inter, true) => tables.local_vcrt.as_ref(),
            _ => tables.vcrt.as_ref(),
        };
        table.map(f)
    }

    /// Uncounted view of the table used to address peers.
    pub(crate) fn remote_view(&self) -> Option<vcrt::VcView> {
        self.with_table(false, VcTable::view)
    }

    pub(crate) fn hints(&self) -> Hints {
        Hints {
            eager_threshold: self.eager_threshold.load(Ordering::Acquire),
        }
    }

    pub(crate) fn next_tag(&self) -> Tag {
        self.next_tag.fetch_add(1, Ordering::Relaxed) & TAG_MASK
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Give back both tables, disconnecting their endpoints through `disconnect` when this was
    /// the last reference.
    pub(crate) fn release_tables(&self, disconnect: Option<&dyn Transport>) {
        let (vcrt, local_vcrt) = {
            let mut tables = self.tables();
            (tables.vcrt.take(), tables.local_vcrt.take())
        };
        for table in vcrt.into_iter().chain(local_vcrt) {
            let id = table.id();
            if table.release(disconnect) {
                tracing::trace!(context_id = %self.context_id, table = id, "released last table reference");
            }
        }
    }

    /// The intra-communicator over the local group of this inter-communicator, created on
    /// first use. It shares the local table and lives as long as its parent.
    pub(crate) fn local_comm(&self, shared: &Shared) -> Result<Arc<CommState>> {
        assert_eq!(
            self.kind,
            CommKind::Inter,
            "local companion requested for intra-communicator {}",
            self.context_id
        );
        if let Some(comm) = self.local_comm.get() {
            return Ok(Arc::clone(comm));
        }

        let mut reg = shared.registry()?;
        if let Some(comm) = self.local_comm.get() {
            return Ok(Arc::clone(comm));
        }
        if reg.finalized || self.is_destroyed() {
            return Err(Error::Finalized);
        }
        let table = self
            .with_table(true, VcTable::retain)
            .expect("live inter-communicator has a local table");
        let companion = CommState::new(
            self.context_id.local_companion(),
            CommKind::Intra,
            Role::LocalCompanion,
            self.rank,
            Tables {
                vcrt: Some(table),
                local_vcrt: None,
            },
            self.hints(),
        );
        let companion = commit_state(&mut reg, companion)?;
        let _ = self.local_comm.set(Arc::clone(&companion));
        tracing::debug!(
            parent = %self.context_id,
            context_id = %companion.context_id,
            "created local companion"
        );
        Ok(companion)
    }
}

/// Run the create hooks on a freshly built communicator. On failure its tables are released.
pub(crate) fn commit_state(reg: &mut Registry, state: CommState) -> Result<Arc<CommState>> {
    let state = Arc::new(state);
    let comm = CommRef(Arc::clone(&state));
    if let Err(e) = reg.run_create(&comm) {
        state.destroyed.store(true, Ordering::Release);
        state.release_tables(None);
        return Err(e);
    }
    Ok(state)
}

/// Destroy a communicator: its local companion first, then the destroy hooks, then its tables.
///
/// Destroying twice is a no-op. The tables are released even when a hook fails; the first
/// failure is returned.
pub(crate) fn destroy(state: &Arc<CommState>, shared: &Shared) -> Result<()> {
    if state.destroyed.swap(true, Ordering::AcqRel) {
        return Ok(());
    }

    let companion = match state.local_comm.get() {
        Some(local) => destroy(local, shared),
        None => Ok(()),
    };

    let comm = CommRef(Arc::clone(state));
    let hooks = match shared.registry() {
        Ok(mut reg) => {
            let result = reg.run_destroy(&comm);
            let disconnect = state.disconnected.load(Ordering::Acquire);
            state.release_tables(disconnect.then(|| &*shared.transport as &dyn Transport));
            result
        }
        Err(e) => {
            state.release_tables(None);
            Err(e)
        }
    };
    tracing::debug!(context_id = %state.context_id, ok = hooks.is_ok(), "communicator destroyed");
    companion.and(hooks)
}

/// A shared, read-only view of a committed communicator.
///
/// Handed to lifecycle hooks and returned by registry queries. Holding a `CommRef` does not
/// keep the communicator alive: once destroyed, its table queries return `None`.
#[derive(Clone)]
pub struct CommRef(pub(crate) Arc<CommState>);

impl CommRef {
    pub(crate) fn state(&self) -> &CommState {
        &self.0
    }

    /// Context id of the communicator.
    pub fn context_id(&self) -> ContextId {
        self.0.context_id
    }

    /// Intra or inter.
    pub fn kind(&self) -> CommKind {
        self.0.kind
    }

    /// Rank of the calling process in the local group.
    pub fn rank(&self) -> Rank {
        as_rank(self.0.rank)
    }

    /// Size of the local group.
    pub fn size(&self) -> Rank {
        as_rank(self.0.local_size)
    }

    /// Size of the remote group, equal to `size()` for intra-communicators.
    pub fn remote_size(&self) -> Rank {
        as_rank(self.0.remote_size)
    }

    /// Whether receives from any source are currently permitted.
    pub fn is_anysource_enabled(&self) -> bool {
        self.0.anysource_enabled.load(Ordering::Acquire)
    }

    /// Enable or disable receives from any source.
    pub fn set_anysource_enabled(&self, enabled: bool) {
        self.0.anysource_enabled.store(enabled, Ordering::Release);
    }

    /// Eager threshold hint.
    pub fn eager_threshold(&self) -> i64 {
        self.0.eager_threshold.load(Ordering::Acquire)
    }

    /// Set the eager threshold hint.
    pub fn set_eager_threshold(&self, threshold: i64) {
        self.0.eager_threshold.store(threshold, Ordering::Release);
    }

    /// Rank of the last peer that acknowledged a failure notification, `-1` if none.
    pub fn last_ack_rank(&self) -> Rank {
        self.0.last_ack_rank.load(Ordering::Acquire)
    }

    /// Record the last acknowledging peer.
    pub fn set_last_ack_rank(&self, rank: Rank) {
        self.0.last_ack_rank.store(rank, Ordering::Release);
    }

    /// Whether the communicator was freed through `disconnect`.
    pub fn is_disconnected(&self) -> bool {
        self.0.disconnected.load(Ordering::Acquire)
    }

    /// Whether the communicator has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.0.is_destroyed()
    }

    /// Endpoint of `rank` in the addressed group.
    pub fn endpoint(&self, rank: Rank) -> Option<Endpoint> {
        let rank = rank.value_as::<usize>().ok()?;
        self.0.with_table(false, |t| t.get(rank)).flatten()
    }

    /// Statistics of the table used to address peers.
    pub fn vcrt_stats(&self) -> Option<TableStats> {
        self.0.with_table(false, VcTable::stats)
    }

    /// Statistics of the local-group table of an inter-communicator.
    pub fn local_vcrt_stats(&self) -> Option<TableStats> {
        match self.0.kind {
            CommKind::Inter => self.0.with_table(true, VcTable::stats),
            CommKind::Intra => None,
        }
    }

    /// The local-group companion, if it has been created.
    pub fn local_companion(&self) -> Option<CommRef> {
        self.0.local_comm.get().map(|c| CommRef(Arc::clone(c)))
    }

    /// Whether both refer to the same communicator.
    pub fn ptr_eq(&self, other: &CommRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for CommRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommRef")
            .field("context_id", &self.0.context_id)
            .field("kind", &self.0.kind)
            .field("rank", &self.0.rank)
            .field("local_size", &self.0.local_size)
            .field("remote_size", &self.0.remote_size)
            .finish()
    }
}

pub(crate) fn as_rank(n: usize) -> Rank {
    n.value_as()
        .expect("communicator size cannot be expressed as a Rank")
}

/// Assemble a new communicator from mappers.
///
/// The builder is the uncommitted state of a communicator; `commit` builds its tables, runs the
/// create hooks and returns the live communicator. Every member of the new communicator must
/// commit a builder with the same mappers, in the same order relative to other communicator
/// constructions, so that all agree on the context id.
pub struct CommBuilder {
    shared: Arc<Shared>,
    kind: CommKind,
    rank: Rank,
    context: Option<ContextId>,
    mappers: Vec<Mapper>,
    hints: Hints,
}

impl CommBuilder {
    /// Start a communicator of `kind` in which the caller has local rank `rank`. `parent`
    /// determines the runtime the communicator belongs to.
    pub fn new<C: Communicator + ?Sized>(parent: &C, kind: CommKind, rank: Rank) -> Self {
        CommBuilder {
            shared: Arc::clone(&parent.as_handle().shared),
            kind,
            rank,
            context: None,
            mappers: Vec::new(),
            hints: Hints::default(),
        }
    }

    /// Append a segment to one of the groups.
    pub fn map(mut self, mapper: Mapper) -> Self {
        self.mappers.push(mapper);
        self
    }

    /// Creation hints.
    pub fn hints(mut self, hints: Hints) -> Self {
        self.hints = hints;
        self
    }

    pub(crate) fn context(mut self, context_id: ContextId) -> Self {
        self.context = Some(context_id);
        self
    }

    /// Build the tables and commit the communicator.
    ///
    /// # Panics
    ///
    /// If a mapper's direction contradicts the source or destination kind, if the local group
    /// is empty, or if an inter-communicator has no remote group.
    pub fn commit(self) -> Result<UserCommunicator> {
        let CommBuilder {
            shared,
            kind,
            rank,
            context,
            mappers,
            hints,
        } = self;
        let context_id = context.unwrap_or_else(|| shared.allocate_context());
        for mapper in &mappers {
            mapper.check(kind);
        }

        let mut reg = shared.registry()?;
        if reg.finalized {
            return Err(Error::Finalized);
        }

        let local = mapper::build_table(&mappers, Pass::Local)?
            .unwrap_or_else(|| panic!("communicator {} has no local group", context_id));
        let tables = match kind {
            CommKind::Intra => Tables {
                vcrt: Some(local),
                local_vcrt: None,
            },
            CommKind::Inter => {
                let remote = mapper::build_table(&mappers, Pass::Remote)?.unwrap_or_else(|| {
                    panic!("inter-communicator {} has no remote group", context_id)
                });
                Tables {
                    vcrt: Some(remote),
                    local_vcrt: Some(local),
                }
            }
        };
        drop(mappers);

        let rank = rank
            .value_as::<usize>()
            .unwrap_or_else(|_| panic!("negative rank {} for communicator {}", rank, context_id));
        let state = CommState::new(context_id, kind, Role::User, rank, tables, hints);
        let state = commit_state(&mut reg, state)?;
        drop(reg);

        tracing::debug!(
            %context_id,
            ?kind,
            rank = state.rank,
            local_size = state.local_size,
            remote_size = state.remote_size,
            "communicator committed"
        );
        Ok(UserCommunicator::new(CommHandle::new(state, shared)))
    }
}

fn check_group(ranks: &[Rank], size: usize, what: &str) {
    let mut seen = HashSet::with_capacity(ranks.len());
    for &r in ranks {
        assert!(
            r.value_as::<usize>().map_or(false, |r| r < size),
            "{} rank {} outside communicator of size {}",
            what,
            r,
            size
        );
        assert!(seen.insert(r), "{} rank {} listed twice", what, r);
    }
}

/// Standard operations on communicators
pub trait Communicator: AsHandle {
    /// Number of processes in the local group
    fn size(&self) -> Rank {
        as_rank(self.as_handle().state.local_size)
    }

    /// The rank that identifies the calling process within the local group
    fn rank(&self) -> Rank {
        as_rank(self.as_handle().state.rank)
    }

    /// Number of processes in the remote group, equal to `size()` on intra-communicators
    fn remote_size(&self) -> Rank {
        as_rank(self.as_handle().state.remote_size)
    }

    /// Intra or inter
    fn kind(&self) -> CommKind {
        self.as_handle().state.kind
    }

    /// Whether this is an inter-communicator
    fn is_inter(&self) -> bool {
        self.kind() == CommKind::Inter
    }

    /// Context id
    fn context_id(&self) -> ContextId {
        self.as_handle().state.context_id
    }

    /// A read-only view of the communicator's runtime state
    fn comm_ref(&self) -> CommRef {
        CommRef(Arc::clone(&self.as_handle().state))
    }

    /// The intra-communicator over the local group of this inter-communicator, created on first
    /// use and destroyed together with this communicator.
    ///
    /// # Panics
    ///
    /// On an intra-communicator.
    fn local_companion(&self) -> Result<CommRef> {
        let handle = self.as_handle();
        handle.state.local_comm(&handle.shared).map(CommRef)
    }

    /// Duplicate the communicator. The duplicate shares the tables of the original.
    fn duplicate(&self) -> Result<UserCommunicator> {
        let handle = self.as_handle();
        let state = &handle.state;
        let mut builder = CommBuilder::new(self, state.kind, as_rank(state.rank))
            .map(Mapper::dup_state(state, MapDir::L2L))
            .hints(state.hints());
        if state.kind == CommKind::Inter {
            builder = builder.map(Mapper::dup_state(state, MapDir::R2R));
        }
        builder.commit()
    }

    /// Create an intra-communicator over `ranks` of this intra-communicator, ordered as listed.
    ///
    /// Every process of this communicator must call this with the same `ranks`. Processes not
    /// listed get `None`.
    ///
    /// # Panics
    ///
    /// On an inter-communicator, or if `ranks` holds an invalid or repeated rank.
    fn create_subgroup(&self, ranks: &[Rank]) -> Result<Option<UserCommunicator>> {
        let handle = self.as_handle();
        let state = &handle.state;
        assert_eq!(state.kind, CommKind::Intra, "subgroup of an inter-communicator");
        check_group(ranks, state.local_size, "subgroup");

        let context_id = handle.shared.allocate_context();
        let me = self.rank();
        let new_rank = match ranks.iter().position(|&r| r == me) {
            Some(i) => as_rank(i),
            None => return Ok(None),
        };
        CommBuilder::new(self, CommKind::Intra, new_rank)
            .context(context_id)
            .map(Mapper::irregular_state(state, MapDir::L2L, ranks.to_vec()))
            .commit()
            .map(Some)
    }

    /// Create an inter-communicator connecting `local_group` and `remote_group`, two disjoint
    /// sets of ranks of this intra-communicator. Members of `remote_group` see the groups
    /// swapped.
    ///
    /// Every process of this communicator must call this with the same arguments. Processes in
    /// neither group get `None`.
    ///
    /// # Panics
    ///
    /// On an inter-communicator, if a group holds an invalid or repeated rank, or if the groups
    /// overlap.
    fn intercomm_create(
        &self,
        local_group: &[Rank],
        remote_group: &[Rank],
    ) -> Result<Option<UserCommunicator>> {
        let handle = self.as_handle();
        let state = &handle.state;
        assert_eq!(state.kind, CommKind::Intra, "inter-communicator from an inter-communicator");
        check_group(local_group, state.local_size, "local group");
        check_group(remote_group, state.local_size, "remote group");
        assert!(
            local_group.iter().all(|r| !remote_group.contains(r)),
            "inter-communicator groups overlap"
        );

        let context_id = handle.shared.allocate_context();
        let me = self.rank();
        let (mine, theirs, new_rank) = if let Some(i) = local_group.iter().position(|&r| r == me) {
            (local_group, remote_group, i)
        } else if let Some(i) = remote_group.iter().position(|&r| r == me) {
            (remote_group, local_group, i)
        } else {
            return Ok(None);
        };
        CommBuilder::new(self, CommKind::Inter, as_rank(new_rank))
            .context(context_id)
            .map(Mapper::irregular_state(state, MapDir::L2L, mine.to_vec()))
            .map(Mapper::irregular_state(state, MapDir::L2R, theirs.to_vec()))
            .commit()
            .map(Some)
    }
}

/// A built-in communicator, e.g. the world communicator
///
/// Built-in communicators are destroyed when their `Universe` is finalized, never by dropping
/// this handle.
#[derive(Clone)]
pub struct SystemCommunicator(CommHandle);

impl SystemCommunicator {
    pub(crate) fn new(handle: CommHandle) -> Self {
        SystemCommunicator(handle)
    }
}

impl AsHandle for SystemCommunicator {
    fn as_handle(&self) -> &CommHandle {
        &self.0
    }
}

impl Communicator for SystemCommunicator {}

impl fmt::Debug for SystemCommunicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SystemCommunicator")
            .field(&self.0.state.context_id)
            .finish()
    }
}

/// A user-defined communicator
///
/// Destroyed when dropped. Use `free` or `disconnect` to observe errors raised by destroy
/// hooks.
pub struct UserCommunicator {
    handle: CommHandle,
    freed: bool,
}

impl UserCommunicator {
    pub(crate) fn new(handle: CommHandle) -> Self {
        UserCommunicator {
            handle,
            freed: false,
        }
    }

    /// Destroy the communicator, running the destroy hooks and releasing its tables.
    pub fn free(mut self) -> Result<()> {
        self.freed = true;
        destroy(&self.handle.state, &self.handle.shared)
    }

    /// Destroy the communicator and close the transport connections to its endpoints once no
    /// other communicator references them.
    pub fn disconnect(self) -> Result<()> {
        self.handle.state.disconnected.store(true, Ordering::Release);
        self.free()
    }
}

impl AsHandle for UserCommunicator {
    fn as_handle(&self) -> &CommHandle {
        &self.handle
    }
}

impl Communicator for UserCommunicator {}

impl Drop for UserCommunicator {
    fn drop(&mut self) {
        if self.freed {
            return;
        }
        if let Err(e) = destroy(&self.handle.state, &self.handle.shared) {
            tracing::warn!(
                context_id = %self.handle.state.context_id,
                error = %e,
                "error while destroying dropped communicator"
            );
        }
    }
}

impl fmt::Debug for UserCommunicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserCommunicator")
            .field("context_id", &self.handle.state.context_id)
            .field("kind", &self.handle.state.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::environment::Universe;

    fn single() -> Universe {
        Universe::local_world(1, Config::default())
            .unwrap()
            .pop()
            .unwrap()
    }

    #[test]
    fn context_offsets_stay_inside_stride() {
        let id = ContextId::from_raw(ContextId::FIRST_USER);
        assert_eq!(id.collective().raw(), 13);
        assert_eq!(id.local_companion().raw(), 14);
        assert_eq!(id.local_companion().collective().raw(), 15);
        assert_eq!(ContextId::from_raw(16).to_string(), "16");
    }

    #[test]
    fn dup_shares_table() {
        let universe = single();
        let world = universe.world();
        let before = world.comm_ref().vcrt_stats().unwrap();
        let dup = world.duplicate().unwrap();
        let after = dup.comm_ref().vcrt_stats().unwrap();
        assert_eq!(before.id, after.id);
        assert_eq!(after.ref_count, before.ref_count + 1);
        assert_eq!(dup.comm_ref().eager_threshold(), -1);
        assert!(dup.comm_ref().is_anysource_enabled());
        dup.free().unwrap();
        assert_eq!(world.comm_ref().vcrt_stats().unwrap().ref_count, before.ref_count);
    }

    #[test]
    fn explicit_hints_survive_commit() {
        let universe = single();
        let world = universe.world();
        let comm = CommBuilder::new(&world, CommKind::Intra, 0)
            .map(Mapper::dup(&world, MapDir::L2L))
            .hints(Hints {
                eager_threshold: 4096,
            })
            .commit()
            .unwrap();
        assert_eq!(comm.comm_ref().eager_threshold(), 4096);
        assert_eq!(comm.comm_ref().last_ack_rank(), -1);
    }

    #[test]
    fn destroyed_ref_has_no_tables() {
        let universe = single();
        let dup = universe.world().duplicate().unwrap();
        let r = dup.comm_ref();
        dup.free().unwrap();
        assert!(r.is_destroyed());
        assert!(r.vcrt_stats().is_none());
        assert!(r.endpoint(0).is_none());
    }

    #[test]
    #[should_panic(expected = "remote group of intra-communicator")]
    fn remote_read_of_intra_source_panics() {
        let universe = single();
        let world = universe.world();
        let _ = CommBuilder::new(&world, CommKind::Inter, 0)
            .map(Mapper::dup(&world, MapDir::L2L))
            .map(Mapper::dup(&world, MapDir::R2R))
            .commit();
    }

    #[test]
    #[should_panic(expected = "remote group of an intra-communicator")]
    fn remote_write_into_intra_dest_panics() {
        let universe = single();
        let world = universe.world();
        let _ = CommBuilder::new(&world, CommKind::Intra, 0)
            .map(Mapper::dup(&world, MapDir::L2R))
            .commit();
    }
}
