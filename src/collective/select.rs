//! Algorithm selection
//!
//! Exactly one decision is made per call, before anything is emitted. Resolution order:
//!
//! 1. device override, when a device is installed and the device policy covers the operation
//! 2. an algorithm forced through `Config`
//! 3. for `auto`, a lookup in the `CostModel` keyed on the `CallSignature`
//! 4. for `sched_auto` (forced, or returned by the cost model), the built-in heuristic: binomial
//!    on intra-communicators, the short/long byte threshold on inter-communicators

use std::fmt;

use crate::collective::{GatherArgs, GatherRoot};
use crate::config::{CollectiveFallback, Config, InterAlgorithm, IntraAlgorithm};
use crate::datatype::Datatype;
use crate::error::{Error, Result};
use crate::topology::{CommKind, CommState};

/// A collective operation kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CollectiveKind {
    /// Non-blocking gather
    Igather,
}

/// The key used to look up an algorithm for one call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CallSignature {
    /// Operation
    pub kind: CollectiveKind,
    /// Communicator kind
    pub comm_kind: CommKind,
    /// Caller's rank in the local group
    pub rank: usize,
    /// Size of the local group
    pub comm_size: usize,
    /// Size of the remote group, equal to `comm_size` on intra-communicators
    pub remote_size: usize,
    /// Elements sent per process
    pub sendcount: usize,
    /// Send element type
    pub sendtype: Datatype,
    /// Elements received per process
    pub recvcount: usize,
    /// Receive element type
    pub recvtype: Datatype,
    /// Root
    pub root: GatherRoot,
}

impl CallSignature {
    pub(crate) fn igather(comm: &CommState, args: &GatherArgs<'_>) -> Self {
        CallSignature {
            kind: CollectiveKind::Igather,
            comm_kind: comm.kind,
            rank: comm.rank,
            comm_size: comm.local_size,
            remote_size: comm.remote_size,
            sendcount: args.sendcount,
            sendtype: args.sendtype,
            recvcount: args.recvcount,
            recvtype: args.recvtype,
            root: args.root,
        }
    }

    /// Whether the caller receives the gathered data.
    pub fn is_receiver(&self) -> bool {
        match (self.comm_kind, self.root) {
            (_, GatherRoot::Root) => true,
            (CommKind::Intra, GatherRoot::Rank(r)) => {
                usize::try_from(r).map_or(false, |r| r == self.rank)
            }
            _ => false,
        }
    }

    /// Total bytes moved as seen from the caller: the whole receive buffer on the receiving
    /// side, the send contribution times the local group size elsewhere.
    pub fn nbytes(&self) -> usize {
        if self.is_receiver() {
            self.recvtype
                .size()
                .saturating_mul(self.recvcount)
                .saturating_mul(self.remote_size)
        } else {
            self.sendtype
                .size()
                .saturating_mul(self.sendcount)
                .saturating_mul(self.comm_size)
        }
    }
}

/// The concrete gather algorithms.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum GatherAlgorithm {
    /// Binomial tree schedule on an intra-communicator.
    IntraBinomial,
    /// Transport-level k-nomial tree on an intra-communicator.
    IntraTree {
        /// Tree arity
        k: usize,
    },
    /// Every remote rank sends straight to the root.
    InterShort,
    /// Remote ranks gather locally, then rank 0 of the remote group forwards to the root.
    InterLong,
}

impl GatherAlgorithm {
    /// Configuration-style name.
    pub fn name(&self) -> &'static str {
        match self {
            GatherAlgorithm::IntraBinomial => "sched_binomial",
            GatherAlgorithm::IntraTree { .. } => "generic_tree",
            GatherAlgorithm::InterShort => "sched_short",
            GatherAlgorithm::InterLong => "sched_long",
        }
    }

    /// Whether the algorithm runs as a schedule.
    pub fn is_scheduled(&self) -> bool {
        !matches!(self, GatherAlgorithm::IntraTree { .. })
    }
}

impl fmt::Display for GatherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatherAlgorithm::IntraTree { k } => write!(f, "{}(k={})", self.name(), k),
            _ => f.write_str(self.name()),
        }
    }
}

/// Outcome of selection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Choice {
    /// Hand the call to the device layer.
    Device,
    /// Run one of the runtime's algorithms.
    Algorithm(GatherAlgorithm),
}

/// What a cost model returns: one algorithm with its tuning parameters, or the built-in
/// heuristic tier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Container {
    /// Intra-communicator heuristic.
    IntraSchedAuto,
    /// Intra-communicator binomial schedule.
    IntraSchedBinomial,
    /// Intra-communicator k-nomial tree.
    IntraTree {
        /// Tree arity
        k: usize,
    },
    /// Inter-communicator byte-threshold heuristic.
    InterSchedAuto,
    /// Inter-communicator direct schedule.
    InterSchedShort,
    /// Inter-communicator two-phase schedule.
    InterSchedLong,
}

impl Container {
    fn comm_kind(&self) -> CommKind {
        match self {
            Container::IntraSchedAuto | Container::IntraSchedBinomial | Container::IntraTree { .. } => {
                CommKind::Intra
            }
            Container::InterSchedAuto | Container::InterSchedShort | Container::InterSchedLong => {
                CommKind::Inter
            }
        }
    }
}

/// A lookup table from call signatures to algorithms.
pub trait CostModel: Send + Sync {
    /// The container for `sig`, or `None` if the table has no matching entry.
    fn search(&self, sig: &CallSignature) -> Option<Container>;
}

/// One entry of a `SelectionTable`. Unset conditions match everything.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    comm_kind: Option<CommKind>,
    min_comm_size: usize,
    max_nbytes: Option<usize>,
    container: Container,
}

impl Rule {
    /// A rule selecting `container`.
    pub fn new(container: Container) -> Self {
        Rule {
            comm_kind: None,
            min_comm_size: 0,
            max_nbytes: None,
            container,
        }
    }

    /// Only match calls on communicators of `kind`.
    pub fn comm_kind(mut self, kind: CommKind) -> Self {
        self.comm_kind = Some(kind);
        self
    }

    /// Only match calls whose local group has at least `size` ranks.
    pub fn min_comm_size(mut self, size: usize) -> Self {
        self.min_comm_size = size;
        self
    }

    /// Only match calls moving fewer than `nbytes` bytes.
    pub fn max_nbytes(mut self, nbytes: usize) -> Self {
        self.max_nbytes = Some(nbytes);
        self
    }

    fn matches(&self, sig: &CallSignature) -> bool {
        self.comm_kind.map_or(true, |k| k == sig.comm_kind)
            && sig.comm_size >= self.min_comm_size
            && self.max_nbytes.map_or(true, |max| sig.nbytes() < max)
    }
}

/// A first-match list of rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectionTable {
    rules: Vec<Rule>,
}

impl SelectionTable {
    /// A table with the given rules, searched in order.
    pub fn new(rules: Vec<Rule>) -> Self {
        SelectionTable { rules }
    }

    /// The rules, in search order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

impl Default for SelectionTable {
    fn default() -> Self {
        SelectionTable::new(vec![
            Rule::new(Container::InterSchedAuto).comm_kind(CommKind::Inter),
            Rule::new(Container::IntraTree { k: 4 })
                .comm_kind(CommKind::Intra)
                .min_comm_size(256),
            Rule::new(Container::IntraSchedAuto).comm_kind(CommKind::Intra),
        ])
    }
}

impl CostModel for SelectionTable {
    fn search(&self, sig: &CallSignature) -> Option<Container> {
        self.rules
            .iter()
            .find(|r| r.matches(sig))
            .map(|r| r.container)
    }
}

/// Full selection for one call, including the device override.
pub fn select(
    config: &Config,
    device_installed: bool,
    model: &dyn CostModel,
    sig: &CallSignature,
) -> Result<Choice> {
    if device_installed && config.igather_uses_device() {
        tracing::debug!(?sig.kind, "collective handed to device");
        return Ok(Choice::Device);
    }
    select_algorithm(config, model, sig).map(Choice::Algorithm)
}

/// Selection among the runtime's own algorithms.
///
/// # Panics
///
/// If the cost model has no entry for `sig`, or returns a container for the wrong
/// communicator kind.
pub fn select_algorithm(
    config: &Config,
    model: &dyn CostModel,
    sig: &CallSignature,
) -> Result<GatherAlgorithm> {
    let algorithm = match sig.comm_kind {
        CommKind::Intra => match config.igather_intra_algorithm {
            IntraAlgorithm::Auto => from_container(config, lookup(model, sig), sig)?,
            IntraAlgorithm::SchedAuto => sched_auto(config, sig),
            IntraAlgorithm::SchedBinomial => GatherAlgorithm::IntraBinomial,
            IntraAlgorithm::GenericTree => tree(config, config.igather_tree_kval)?,
        },
        CommKind::Inter => match config.igather_inter_algorithm {
            InterAlgorithm::Auto => from_container(config, lookup(model, sig), sig)?,
            InterAlgorithm::SchedAuto => sched_auto(config, sig),
            InterAlgorithm::SchedShort => GatherAlgorithm::InterShort,
            InterAlgorithm::SchedLong => GatherAlgorithm::InterLong,
        },
    };
    tracing::debug!(
        comm_kind = ?sig.comm_kind,
        comm_size = sig.comm_size,
        nbytes = sig.nbytes(),
        %algorithm,
        "selected gather algorithm"
    );
    Ok(algorithm)
}

fn lookup(model: &dyn CostModel, sig: &CallSignature) -> Container {
    let container = model
        .search(sig)
        .unwrap_or_else(|| panic!("selection table has no entry for {:?}", sig));
    assert_eq!(
        container.comm_kind(),
        sig.comm_kind,
        "selection table returned {:?} for a {:?} call",
        container,
        sig.comm_kind
    );
    container
}

fn from_container(config: &Config, container: Container, sig: &CallSignature) -> Result<GatherAlgorithm> {
    Ok(match container {
        Container::IntraSchedAuto | Container::InterSchedAuto => sched_auto(config, sig),
        Container::IntraSchedBinomial => GatherAlgorithm::IntraBinomial,
        Container::IntraTree { k } => tree(config, k)?,
        Container::InterSchedShort => GatherAlgorithm::InterShort,
        Container::InterSchedLong => GatherAlgorithm::InterLong,
    })
}

/// The built-in heuristic.
pub fn sched_auto(config: &Config, sig: &CallSignature) -> GatherAlgorithm {
    match sig.comm_kind {
        CommKind::Intra => GatherAlgorithm::IntraBinomial,
        CommKind::Inter => {
            if sig.nbytes() < config.gather_inter_short_msg_size {
                GatherAlgorithm::InterShort
            } else {
                GatherAlgorithm::InterLong
            }
        }
    }
}

fn tree(config: &Config, k: usize) -> Result<GatherAlgorithm> {
    if k >= 2 {
        return Ok(GatherAlgorithm::IntraTree { k });
    }
    match config.collective_fallback {
        CollectiveFallback::Error => Err(Error::NotApplicable {
            algorithm: "generic_tree",
            reason: format!("tree arity {} is below 2", k),
        }),
        CollectiveFallback::Print => {
            tracing::warn!(k, "generic_tree needs arity of at least 2, using sched_binomial");
            Ok(GatherAlgorithm::IntraBinomial)
        }
        CollectiveFallback::Silent => Ok(GatherAlgorithm::IntraBinomial),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inter(root: GatherRoot, count: usize) -> CallSignature {
        CallSignature {
            kind: CollectiveKind::Igather,
            comm_kind: CommKind::Inter,
            rank: 0,
            comm_size: 1,
            remote_size: 4,
            sendcount: count,
            sendtype: Datatype::Byte,
            recvcount: count,
            recvtype: Datatype::Byte,
            root,
        }
    }

    fn intra(size: usize) -> CallSignature {
        CallSignature {
            kind: CollectiveKind::Igather,
            comm_kind: CommKind::Intra,
            rank: 1,
            comm_size: size,
            remote_size: size,
            sendcount: 1,
            sendtype: Datatype::I32,
            recvcount: 1,
            recvtype: Datatype::I32,
            root: GatherRoot::Rank(0),
        }
    }

    #[test]
    fn nbytes_per_side() {
        assert_eq!(inter(GatherRoot::Root, 1000).nbytes(), 4000);
        let mut remote = inter(GatherRoot::Rank(0), 1000);
        remote.comm_size = 4;
        remote.remote_size = 1;
        assert_eq!(remote.nbytes(), 4000);
        assert_eq!(intra(8).nbytes(), 32);
    }

    #[test]
    fn nbytes_saturates() {
        let mut huge = intra(4);
        huge.sendcount = usize::MAX / 2;
        assert_eq!(huge.nbytes(), usize::MAX);
        assert_eq!(inter(GatherRoot::Root, usize::MAX).nbytes(), usize::MAX);
    }

    #[test]
    fn threshold_equality_selects_long() {
        let mut cfg = Config::default();
        cfg.gather_inter_short_msg_size = 400;
        assert_eq!(sched_auto(&cfg, &inter(GatherRoot::Root, 99)), GatherAlgorithm::InterShort);
        assert_eq!(sched_auto(&cfg, &inter(GatherRoot::Root, 100)), GatherAlgorithm::InterLong);
        assert_eq!(sched_auto(&cfg, &inter(GatherRoot::Root, 101)), GatherAlgorithm::InterLong);
    }

    #[test]
    fn forced_algorithm_ignores_cost_model() {
        struct Empty;
        impl CostModel for Empty {
            fn search(&self, _: &CallSignature) -> Option<Container> {
                None
            }
        }
        let mut cfg = Config::default();
        cfg.igather_inter_algorithm = InterAlgorithm::SchedShort;
        let alg = select_algorithm(&cfg, &Empty, &inter(GatherRoot::Root, 1 << 20)).unwrap();
        assert_eq!(alg, GatherAlgorithm::InterShort);
    }

    #[test]
    #[should_panic(expected = "no entry")]
    fn cost_model_miss_panics() {
        let table = SelectionTable::new(vec![Rule::new(Container::InterSchedLong).comm_kind(CommKind::Inter)]);
        let _ = select_algorithm(&Config::default(), &table, &intra(4));
    }

    #[test]
    fn default_table() {
        let table = SelectionTable::default();
        let cfg = Config::default();
        assert_eq!(
            select_algorithm(&cfg, &table, &intra(8)).unwrap(),
            GatherAlgorithm::IntraBinomial
        );
        assert_eq!(
            select_algorithm(&cfg, &table, &intra(512)).unwrap(),
            GatherAlgorithm::IntraTree { k: 4 }
        );
    }

    #[test]
    fn tree_arity_fallback() {
        let mut cfg = Config::default();
        cfg.igather_intra_algorithm = IntraAlgorithm::GenericTree;
        cfg.igather_tree_kval = 1;
        let table = SelectionTable::default();
        assert_eq!(
            select_algorithm(&cfg, &table, &intra(4)).unwrap(),
            GatherAlgorithm::IntraBinomial
        );
        cfg.collective_fallback = CollectiveFallback::Error;
        assert!(matches!(
            select_algorithm(&cfg, &table, &intra(4)),
            Err(Error::NotApplicable { .. })
        ));
        cfg.igather_tree_kval = 3;
        assert_eq!(
            select_algorithm(&cfg, &table, &intra(4)).unwrap(),
            GatherAlgorithm::IntraTree { k: 3 }
        );
    }

    #[test]
    fn device_short_circuits() {
        let cfg = Config::default();
        let table = SelectionTable::default();
        assert_eq!(select(&cfg, true, &table, &intra(4)).unwrap(), Choice::Device);
        assert_eq!(
            select(&cfg, false, &table, &intra(4)).unwrap(),
            Choice::Algorithm(GatherAlgorithm::IntraBinomial)
        );
    }
}
