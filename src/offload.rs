// vim: tw=80
//! Checksum-offload policy
//!
//! Whether a write's checksum computation moves to a worker is policy, not
//! mechanism, so it hides behind a trait.  The stock policy mirrors the
//! heuristics that matter in practice: never stall a sync-class writer on a
//! queue, and don't bother deferring metadata when the device demands
//! ordered submission or the algorithm is already cheap.

#[cfg(test)] use mockall::automock;

/// The facts about a write that the deferral decision may consult.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WriteProfile {
    /// The caller wants synchronous durability (fsync-class).
    pub sync: bool,
    pub metadata: bool,
    /// The target requires strictly ordered submission (e.g. a
    /// sequential-write-only zone).
    pub ordered: bool,
}

/// Decides whether a write's checksum computation is deferred to a worker.
#[cfg_attr(test, automock)]
pub trait DeferPolicy: Send + Sync {
    /// `csum_is_fast` reports the checksum engine's own assessment of its
    /// cost.
    fn should_defer(&self, profile: &WriteProfile, csum_is_fast: bool)
        -> bool;
}

/// The stock deferral heuristic.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultDeferPolicy;

impl DeferPolicy for DefaultDeferPolicy {
    fn should_defer(&self, profile: &WriteProfile, csum_is_fast: bool)
        -> bool
    {
        if profile.sync {
            return false;
        }
        if profile.metadata && (profile.ordered || csum_is_fast) {
            return false;
        }
        true
    }
}

// LCOV_EXCL_STOP
