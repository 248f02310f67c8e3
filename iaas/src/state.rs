//! Canonical resource states and the allowed life-cycle transitions.
//!
//! States travel over the wire as integers. Every operation has exactly
//! three states: the trigger the API sets, the in-progress state the agent
//! sets before touching hardware, and the success state. Failure of any
//! operation routes to [`State::Unresourced`].

use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Requested,
    Building,
    Unresourced,
    Running,
    Quiesce,
    Quiesced,
    Restart,
    Scrub,
    Closed,
    RunningUpdate,
    RunningUpdating,
    Quiescing,
    Restarting,
    ScrubPrep,
    Scrubbing,
    QuiescedUpdate,
    QuiescedUpdating,
    ScrubQueue,
}

impl State {
    pub fn code(self) -> i64 {
        match self {
            State::Requested => 1,
            State::Building => 2,
            State::Unresourced => 3,
            State::Running => 4,
            State::Quiesce => 5,
            State::Quiesced => 6,
            State::Restart => 7,
            State::Scrub => 8,
            State::Closed => 9,
            State::RunningUpdate => 10,
            State::RunningUpdating => 11,
            State::Quiescing => 12,
            State::Restarting => 13,
            State::ScrubPrep => 14,
            State::Scrubbing => 15,
            State::QuiescedUpdate => 16,
            State::QuiescedUpdating => 17,
            State::ScrubQueue => 18,
        }
    }

    pub fn from_code(code: i64) -> Option<State> {
        let state = match code {
            1 => State::Requested,
            2 => State::Building,
            3 => State::Unresourced,
            4 => State::Running,
            5 => State::Quiesce,
            6 => State::Quiesced,
            7 => State::Restart,
            8 => State::Scrub,
            9 => State::Closed,
            10 => State::RunningUpdate,
            11 => State::RunningUpdating,
            12 => State::Quiescing,
            13 => State::Restarting,
            14 => State::ScrubPrep,
            15 => State::Scrubbing,
            16 => State::QuiescedUpdate,
            17 => State::QuiescedUpdating,
            18 => State::ScrubQueue,
            _ => return None,
        };
        Some(state)
    }

    /// CLOSED is the only terminal state.
    pub fn is_terminal(self) -> bool {
        self == State::Closed
    }

    /// UNRESOURCED requires operator action in the API to leave.
    pub fn is_quarantine(self) -> bool {
        self == State::Unresourced
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Requested => "REQUESTED",
            State::Building => "BUILDING",
            State::Unresourced => "UNRESOURCED",
            State::Running => "RUNNING",
            State::Quiesce => "QUIESCE",
            State::Quiesced => "QUIESCED",
            State::Restart => "RESTART",
            State::Scrub => "SCRUB",
            State::Closed => "CLOSED",
            State::RunningUpdate => "RUNNING_UPDATE",
            State::RunningUpdating => "RUNNING_UPDATING",
            State::Quiescing => "QUIESCING",
            State::Restarting => "RESTARTING",
            State::ScrubPrep => "SCRUB_PREP",
            State::Scrubbing => "SCRUBBING",
            State::QuiescedUpdate => "QUIESCED_UPDATE",
            State::QuiescedUpdating => "QUIESCED_UPDATING",
            State::ScrubQueue => "SCRUB_QUEUE",
        };
        f.write_str(name)
    }
}

impl Serialize for State {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for State {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i64::deserialize(deserializer)?;
        State::from_code(code)
            .ok_or_else(|| de::Error::custom(format!("unknown state code {code}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Build,
    Update,
    Quiesce,
    Restart,
    Scrub,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Build => "build",
            Operation::Update => "update",
            Operation::Quiesce => "quiesce",
            Operation::Restart => "restart",
            Operation::Scrub => "scrub",
        };
        f.write_str(name)
    }
}

/// One row of the life-cycle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub trigger: State,
    pub operation: Operation,
    pub in_progress: State,
    pub success: State,
}

/// The resource kinds the agent reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Backup,
    Snapshot,
    VirtualRouter,
    Vm,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Backup => "backup",
            ResourceKind::Snapshot => "snapshot",
            ResourceKind::VirtualRouter => "virtual_router",
            ResourceKind::Vm => "vm",
        };
        f.write_str(name)
    }
}

/// The complete transition table for kinds with a quiesce operation (VMs
/// and virtual routers). Nothing outside this table is a legal observable
/// transition, apart from the failure edge to UNRESOURCED.
pub const TRANSITIONS: &[Transition] = &[
    Transition {
        trigger: State::Requested,
        operation: Operation::Build,
        in_progress: State::Building,
        success: State::Running,
    },
    Transition {
        trigger: State::RunningUpdate,
        operation: Operation::Update,
        in_progress: State::RunningUpdating,
        success: State::Running,
    },
    Transition {
        trigger: State::QuiescedUpdate,
        operation: Operation::Update,
        in_progress: State::QuiescedUpdating,
        success: State::Quiesced,
    },
    Transition {
        trigger: State::Quiesce,
        operation: Operation::Quiesce,
        in_progress: State::Quiescing,
        success: State::Quiesced,
    },
    // Pre-scrub quiesce: SCRUB resources are quiesced first, landing in the
    // scrub queue for the midnight sweep.
    Transition {
        trigger: State::Scrub,
        operation: Operation::Quiesce,
        in_progress: State::ScrubPrep,
        success: State::ScrubQueue,
    },
    Transition {
        trigger: State::ScrubQueue,
        operation: Operation::Scrub,
        in_progress: State::Scrubbing,
        success: State::Closed,
    },
    Transition {
        trigger: State::Restart,
        operation: Operation::Restart,
        in_progress: State::Restarting,
        success: State::Running,
    },
];

/// Transition table for snapshots and backups. They have no quiesce
/// operation, so a SCRUB trigger goes straight to work instead of passing
/// through the scrub queue.
pub const LEAF_TRANSITIONS: &[Transition] = &[
    Transition {
        trigger: State::Requested,
        operation: Operation::Build,
        in_progress: State::Building,
        success: State::Running,
    },
    Transition {
        trigger: State::RunningUpdate,
        operation: Operation::Update,
        in_progress: State::RunningUpdating,
        success: State::Running,
    },
    Transition {
        trigger: State::QuiescedUpdate,
        operation: Operation::Update,
        in_progress: State::QuiescedUpdating,
        success: State::Quiesced,
    },
    Transition {
        trigger: State::Scrub,
        operation: Operation::Scrub,
        in_progress: State::Scrubbing,
        success: State::Closed,
    },
];

/// The transition table for the given resource kind.
pub fn table(kind: ResourceKind) -> &'static [Transition] {
    match kind {
        ResourceKind::Vm | ResourceKind::VirtualRouter => TRANSITIONS,
        ResourceKind::Backup | ResourceKind::Snapshot => LEAF_TRANSITIONS,
    }
}

/// Look up the transition whose trigger is `state`.
pub fn transition_for(state: State) -> Option<&'static Transition> {
    TRANSITIONS.iter().find(|t| t.trigger == state)
}

/// Look up the transition for `state` in the given kind's table.
pub fn transition_in(kind: ResourceKind, state: State) -> Option<&'static Transition> {
    table(kind).iter().find(|t| t.trigger == state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in 1..=18 {
            let state = State::from_code(code).expect("code in range");
            assert_eq!(state.code(), code);
        }
        assert!(State::from_code(0).is_none());
        assert!(State::from_code(19).is_none());
    }

    #[test]
    fn serde_encodes_as_integer() {
        let json = serde_json::to_string(&State::ScrubQueue).unwrap();
        assert_eq!(json, "18");
        let state: State = serde_json::from_str("4").unwrap();
        assert_eq!(state, State::Running);
        assert!(serde_json::from_str::<State>("99").is_err());
    }

    #[test]
    fn every_trigger_has_one_row() {
        for t in TRANSITIONS {
            assert_eq!(transition_for(t.trigger), Some(t));
        }
        // In-progress and success states are never triggers
        assert!(transition_for(State::Building).is_none());
        assert!(transition_for(State::Running).is_none());
        assert!(transition_for(State::Closed).is_none());
        assert!(transition_for(State::Unresourced).is_none());
    }

    #[test]
    fn scrub_path_goes_through_the_queue() {
        let prep = transition_for(State::Scrub).unwrap();
        assert_eq!(prep.operation, Operation::Quiesce);
        assert_eq!(prep.in_progress, State::ScrubPrep);
        assert_eq!(prep.success, State::ScrubQueue);

        let scrub = transition_for(State::ScrubQueue).unwrap();
        assert_eq!(scrub.operation, Operation::Scrub);
        assert_eq!(scrub.in_progress, State::Scrubbing);
        assert_eq!(scrub.success, State::Closed);
        assert!(scrub.success.is_terminal());
    }

    #[test]
    fn quarantine_is_not_terminal() {
        assert!(State::Unresourced.is_quarantine());
        assert!(!State::Unresourced.is_terminal());
    }

    #[test]
    fn leaf_kinds_scrub_directly() {
        let scrub = transition_in(ResourceKind::Backup, State::Scrub).unwrap();
        assert_eq!(scrub.operation, Operation::Scrub);
        assert_eq!(scrub.in_progress, State::Scrubbing);
        assert_eq!(scrub.success, State::Closed);
        // and they never see the queue
        assert!(transition_in(ResourceKind::Snapshot, State::ScrubQueue).is_none());
        assert!(transition_in(ResourceKind::Snapshot, State::Quiesce).is_none());
    }

    #[test]
    fn vm_scrub_goes_through_the_queue() {
        let prep = transition_in(ResourceKind::Vm, State::Scrub).unwrap();
        assert_eq!(prep.operation, Operation::Quiesce);
        let scrub = transition_in(ResourceKind::Vm, State::ScrubQueue).unwrap();
        assert_eq!(scrub.operation, Operation::Scrub);
    }
}
