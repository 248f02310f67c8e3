//! Shared skeleton steps for the per-kind workers.
//!
//! The flow each operation follows:
//!
//! 1. read the resource (kind-specific)
//! 2. guard: silent abort when the live state is not the trigger
//! 3. [`begin`]: partial-update to the in-progress state; abort without
//!    side effects when that update fails
//! 4. remote work (kind-specific)
//! 5. [`finish`] / kind-specific success update, or unresource + notify

use serde_json::Value;
use tracing::{error, warn};

use iaas::state::{transition_in, ResourceKind, State, Transition};
use iaas::Client;

/// Outcome of the state guard + in-progress update.
pub enum Begin {
    Proceed(&'static Transition),
    /// The live state is not the expected trigger; the job was already
    /// handled elsewhere. Silent abort, no metric.
    WrongState,
    /// The trigger→in-progress update failed; abort with no side effects.
    UpdateFailed,
}

/// Check the live state against the kind's table and move the resource into
/// the operation's in-progress state.
pub async fn begin(
    api: &Client,
    service: &'static str,
    kind: ResourceKind,
    id: i64,
    live: State,
    expected: State,
) -> Begin {
    let Some(transition) = transition_in(kind, expected) else {
        warn!(%live, %expected, "no transition defined for expected trigger");
        return Begin::WrongState;
    };
    if live != expected {
        warn!(
            %live,
            %expected,
            "cancelling {kind} job, resource was picked up elsewhere",
        );
        return Begin::WrongState;
    }
    match api.set_state(service, id, transition.in_progress).await {
        Ok(()) => Begin::Proceed(transition),
        Err(err) => {
            error!(
                error = %err,
                target_state = %transition.in_progress,
                failed_reason = "could_not_update_state",
                "could not move {kind} #{id} to in-progress",
            );
            Begin::UpdateFailed
        }
    }
}

/// The update operation has two triggers; pick whichever matches the live
/// state, or None when the resource was handled elsewhere.
pub fn update_trigger(live: State) -> Option<State> {
    match live {
        State::RunningUpdate | State::QuiescedUpdate => Some(live),
        _ => None,
    }
}

/// Record the success state. A failed success-update is logged but the work
/// itself already happened, so the worker still reports success.
pub async fn finish(api: &Client, service: &'static str, id: i64, success: State) {
    if let Err(err) = api.set_state(service, id, success).await {
        error!(error = %err, target_state = %success, "could not record success state");
    }
}

/// Record the success state along with extra fields (`time_valid` for
/// backups).
pub async fn finish_with(
    api: &Client,
    service: &'static str,
    id: i64,
    mut extra: serde_json::Map<String, Value>,
    success: State,
) {
    extra.insert("state".to_string(), Value::from(success.code()));
    if let Err(err) = api.partial_update(service, id, &Value::Object(extra)).await {
        error!(error = %err, target_state = %success, "could not record success state");
    }
}

/// Quarantine the resource. State goes to UNRESOURCED before any failure
/// notification fires.
pub async fn unresource(api: &Client, service: &'static str, id: i64) {
    if let Err(err) = api.set_state(service, id, State::Unresourced).await {
        error!(error = %err, "could not move resource to UNRESOURCED");
    }
}

// ─── Gates ─────────────────────────────────────────────────────────────────

/// What a VM build should do given its project router's live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmBuildGate {
    Proceed,
    /// Router not yet RUNNING; try again shortly, no state change.
    Reschedule,
    /// Router is quarantined, so the VM is too.
    Unresource,
}

pub fn vm_build_gate(router_state: State) -> VmBuildGate {
    match router_state {
        State::Running => VmBuildGate::Proceed,
        State::Unresourced => VmBuildGate::Unresource,
        _ => VmBuildGate::Reschedule,
    }
}

/// A virtual router scrub may only proceed once every VM in the project is
/// CLOSED.
pub fn vr_scrub_blocked(project_vm_states: &[State]) -> bool {
    project_vm_states.iter().any(|state| *state != State::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_build_gate_decisions() {
        assert_eq!(vm_build_gate(State::Running), VmBuildGate::Proceed);
        assert_eq!(vm_build_gate(State::Unresourced), VmBuildGate::Unresource);
        assert_eq!(vm_build_gate(State::Building), VmBuildGate::Reschedule);
        assert_eq!(vm_build_gate(State::Requested), VmBuildGate::Reschedule);
        // Update in flight also postpones the build
        assert_eq!(vm_build_gate(State::RunningUpdating), VmBuildGate::Reschedule);
    }

    #[test]
    fn vr_scrub_blocked_by_any_live_vm() {
        assert!(!vr_scrub_blocked(&[]));
        assert!(!vr_scrub_blocked(&[State::Closed, State::Closed]));
        assert!(vr_scrub_blocked(&[State::Closed, State::Running]));
        assert!(vr_scrub_blocked(&[State::Unresourced]));
    }

    #[test]
    fn update_trigger_accepts_both_update_states() {
        assert_eq!(update_trigger(State::RunningUpdate), Some(State::RunningUpdate));
        assert_eq!(update_trigger(State::QuiescedUpdate), Some(State::QuiescedUpdate));
        assert_eq!(update_trigger(State::Running), None);
        assert_eq!(update_trigger(State::RunningUpdating), None);
    }
}
