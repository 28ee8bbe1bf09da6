//! The admission gate: the pre-spawn go/wait decision
//!
//! Called by the recipe runner immediately before it would fork.  The
//! gate never blocks and never errors; `Wait` means "poll me again in a
//! little while" (100 ms is a reasonable cadence).  The jobserver's token
//! budget is a separate, orthogonal constraint; the gate neither consults
//! nor replaces it.

use crate::internal_prelude::*;

/// The gate's answer
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[must_use]
#[non_exhaustive]
pub enum Admission {
    /// Spawn now; any needed reservation has been recorded.
    Go,
    /// Memory is spoken for; retry later.
    Wait,
}

/// Decide whether a spawn classified to `required` MiB fits right now.
///
/// Pure arithmetic, separated out for the tests: free memory minus
/// imminent memory, saturating, compared against the requirement.  A zero
/// requirement ("we know nothing about this spawn") always fits; so does
/// anything when free memory is unknowable.
fn fits(required: Mib, host: Option<HostMemory>, totals: Totals) -> bool {
    if required == Mib::ZERO {
        return true;
    }
    let Some(host) = host else {
        // No probe, no reasoning: admit.
        return true;
    };
    let effective_free = host.avail.saturating_sub(totals.imminent());
    required <= effective_free
}

/// The full pre-spawn operation.
///
/// Classifies `argv`, predicts the child's peak from the profile store,
/// and decides.  On `Go` with a nonzero prediction, a reservation for the
/// predicted peak is recorded under `caller` -- the process about to
/// fork -- to be handed back when the walker first observes the child (or
/// when the caller's post-exit hook runs).
pub(crate) fn may_spawn<'t, I>(
    argv: I,
    caller: Pid,
    rules: &ClassifyRules,
    profiles: &ProfileStore,
    region: &AccountingRegion,
    probe: &dyn SystemProbe,
) -> Admission
where
    I: IntoIterator<Item = &'t str>,
{
    let required = rules
        .classify(argv)
        .and_then(|path| profiles.lookup(&path))
        .map(|(_id, peak, _last_used)| peak)
        .unwrap_or(Mib::ZERO);

    if !fits(required, probe.host_memory(), region.totals()) {
        return Admission::Wait;
    }

    if required > Mib::ZERO && !region.reserve(caller, required) {
        // Full table is a shortfall, not a stop: the monitor still sees
        // the child once it exists.
        error!("reservation table full; admitting {required} for pid {caller} unreserved");
    }
    Admission::Go
}
