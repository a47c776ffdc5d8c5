//! Runtime tunables for collective algorithm selection.
//!
//! All values have defaults that map to automatic selection. Override them by constructing a
//! custom `Config` or through environment variables prefixed `MPI_RUNTIME_`.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;

use crate::error::Error;

static GLOBAL: Lazy<Config> = Lazy::new(Config::from_env);

/// Algorithm used by non-blocking gather on intra-communicators.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum IntraAlgorithm {
    /// Consult the selection table.
    #[default]
    Auto,
    /// Built-in heuristic restricted to schedule-based algorithms.
    SchedAuto,
    /// Force the binomial tree schedule.
    SchedBinomial,
    /// Force the transport-level k-nomial tree.
    GenericTree,
}

/// Algorithm used by non-blocking gather on inter-communicators.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum InterAlgorithm {
    /// Consult the selection table.
    #[default]
    Auto,
    /// Built-in short/long byte threshold heuristic.
    SchedAuto,
    /// Force the two-phase (local gather, then forward) schedule.
    SchedLong,
    /// Force the direct remote-to-root schedule.
    SchedShort,
}

/// Whether the device layer may replace the runtime's own collective algorithms.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum DeviceCollectives {
    /// Every collective goes to the device.
    All,
    /// The device never overrides.
    None,
    /// Each operation decides through its own opt-in flag.
    #[default]
    PerColl,
}

/// What to do when a forced algorithm cannot be applied to a call.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum CollectiveFallback {
    /// Fail the call with `Error::NotApplicable`.
    Error,
    /// Log a warning and fall back to the default schedule.
    Print,
    /// Fall back to the default schedule without notice.
    #[default]
    Silent,
}

macro_rules! tunable_enum {
    ($ty:ident, $name:expr, { $($text:expr => $variant:ident),* $(,)? }) => {
        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($ty::$variant),)*
                    _ => Err(Error::Config { name: $name, value: s.to_owned() }),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let text = match self {
                    $($ty::$variant => $text,)*
                };
                f.write_str(text)
            }
        }
    };
}

tunable_enum!(IntraAlgorithm, "igather intra algorithm", {
    "auto" => Auto,
    "sched_auto" => SchedAuto,
    "sched_binomial" => SchedBinomial,
    "generic_tree" => GenericTree,
});

tunable_enum!(InterAlgorithm, "igather inter algorithm", {
    "auto" => Auto,
    "sched_auto" => SchedAuto,
    "sched_long" => SchedLong,
    "sched_short" => SchedShort,
});

tunable_enum!(DeviceCollectives, "device collectives", {
    "all" => All,
    "none" => None,
    "percoll" => PerColl,
});

tunable_enum!(CollectiveFallback, "collective fallback", {
    "error" => Error,
    "print" => Print,
    "silent" => Silent,
});

/// Tunable parameters consumed by the collective front-end and algorithm selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Algorithm for non-blocking gather on intra-communicators.
    pub igather_intra_algorithm: IntraAlgorithm,

    /// Algorithm for non-blocking gather on inter-communicators.
    pub igather_inter_algorithm: InterAlgorithm,

    /// Arity of the generic tree algorithm when it is forced by configuration.
    pub igather_tree_kval: usize,

    /// Global device-override policy.
    pub device_collectives: DeviceCollectives,

    /// Per-operation device opt-in, consulted when the policy is `PerColl`.
    pub igather_device_collective: bool,

    /// Inter-communicator gathers moving fewer bytes than this use the short algorithm.
    pub gather_inter_short_msg_size: usize,

    /// Behavior when a forced algorithm cannot be applied.
    pub collective_fallback: CollectiveFallback,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            igather_intra_algorithm: IntraAlgorithm::Auto,
            igather_inter_algorithm: InterAlgorithm::Auto,
            igather_tree_kval: 2,
            device_collectives: DeviceCollectives::PerColl,
            igather_device_collective: true,
            gather_inter_short_msg_size: 2048,
            collective_fallback: CollectiveFallback::Silent,
        }
    }
}

impl Config {
    /// Process-wide configuration, read from the environment on first use.
    pub fn global() -> &'static Config {
        &GLOBAL
    }

    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `MPI_RUNTIME_IGATHER_INTRA_ALGORITHM`
    /// - `MPI_RUNTIME_IGATHER_INTER_ALGORITHM`
    /// - `MPI_RUNTIME_IGATHER_TREE_KVAL`
    /// - `MPI_RUNTIME_DEVICE_COLLECTIVES`
    /// - `MPI_RUNTIME_IGATHER_DEVICE_COLLECTIVE`
    /// - `MPI_RUNTIME_GATHER_INTER_SHORT_MSG_SIZE`
    /// - `MPI_RUNTIME_COLLECTIVE_FALLBACK`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load config from an arbitrary key/value source, falling back to defaults.
    ///
    /// Values that fail to parse leave the default in place and are reported as warnings.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        apply(&lookup, "MPI_RUNTIME_IGATHER_INTRA_ALGORITHM", &mut cfg.igather_intra_algorithm);
        apply(&lookup, "MPI_RUNTIME_IGATHER_INTER_ALGORITHM", &mut cfg.igather_inter_algorithm);
        apply(&lookup, "MPI_RUNTIME_IGATHER_TREE_KVAL", &mut cfg.igather_tree_kval);
        apply(&lookup, "MPI_RUNTIME_DEVICE_COLLECTIVES", &mut cfg.device_collectives);
        apply(&lookup, "MPI_RUNTIME_GATHER_INTER_SHORT_MSG_SIZE", &mut cfg.gather_inter_short_msg_size);
        apply(&lookup, "MPI_RUNTIME_COLLECTIVE_FALLBACK", &mut cfg.collective_fallback);

        if let Some(v) = lookup("MPI_RUNTIME_IGATHER_DEVICE_COLLECTIVE") {
            match parse_bool(&v) {
                Some(b) => cfg.igather_device_collective = b,
                None => tracing::warn!(
                    value = %v,
                    "ignoring unparsable MPI_RUNTIME_IGATHER_DEVICE_COLLECTIVE"
                ),
            }
        }

        cfg
    }

    /// Whether the device layer should take over non-blocking gather.
    pub fn igather_uses_device(&self) -> bool {
        match self.device_collectives {
            DeviceCollectives::All => true,
            DeviceCollectives::None => false,
            DeviceCollectives::PerColl => self.igather_device_collective,
        }
    }
}

fn apply<F, T>(lookup: &F, key: &'static str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(v) = lookup(key) {
        match v.trim().parse::<T>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(value = %v, "ignoring unparsable {key}"),
        }
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
