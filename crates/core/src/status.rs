//! Unit lifecycle and its transition table.
//!
//! A unit moves forward along
//! `Unknown -> Loading -> Loaded -> Building -> Built -> Pushed`.
//! Two absorbing states sit beside that line: `DoNotBuild`, reachable only
//! from `Unknown` (the inclusion filter runs before any work starts), and
//! `Failed`, reachable from every non-terminal state.
//!
//! Every status change goes through [`transition`] so that an illegal move
//! surfaces as an error instead of overwriting the status.

use std::fmt;

use serde::Serialize;

/// Lifecycle status of a single work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Unknown,
    Loading,
    Loaded,
    Building,
    Built,
    Pushed,
    DoNotBuild,
    Failed,
}

impl Status {
    /// Every status value, in lifecycle order followed by the absorbing states.
    pub const ALL: [Status; 8] = [
        Status::Unknown,
        Status::Loading,
        Status::Loaded,
        Status::Building,
        Status::Built,
        Status::Pushed,
        Status::DoNotBuild,
        Status::Failed,
    ];

    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Pushed | Status::DoNotBuild | Status::Failed)
    }

    fn as_str(self) -> &'static str {
        match self {
            Status::Unknown => "unknown",
            Status::Loading => "loading",
            Status::Loaded => "loaded",
            Status::Building => "building",
            Status::Built => "built",
            Status::Pushed => "pushed",
            Status::DoNotBuild => "do-not-build",
            Status::Failed => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened to a unit, as reported by the phase handling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitEvent {
    /// The inclusion filter left this unit out.
    Excluded,
    /// Prebuild configuration started.
    PrebuildStarted,
    /// Prebuild configuration finished.
    PrebuildFinished,
    /// The image engine started building the unit.
    BuildStarted,
    /// The image engine produced the unit's image.
    BuildFinished,
    /// The image reached the registry.
    PushFinished,
    /// Any phase hit an error for this unit.
    Failed,
}

impl fmt::Display for UnitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitEvent::Excluded => "excluded",
            UnitEvent::PrebuildStarted => "prebuild-started",
            UnitEvent::PrebuildFinished => "prebuild-finished",
            UnitEvent::BuildStarted => "build-started",
            UnitEvent::BuildFinished => "build-finished",
            UnitEvent::PushFinished => "push-finished",
            UnitEvent::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Apply `event` to a unit currently in `from`.
///
/// Returns `None` when the move is not in the transition table.
pub fn transition(from: Status, event: UnitEvent) -> Option<Status> {
    use Status::*;

    match (from, event) {
        (Unknown, UnitEvent::Excluded) => Some(DoNotBuild),
        (Unknown, UnitEvent::PrebuildStarted) => Some(Loading),
        (Loading, UnitEvent::PrebuildFinished) => Some(Loaded),
        (Loaded, UnitEvent::BuildStarted) => Some(Building),
        (Building, UnitEvent::BuildFinished) => Some(Built),
        (Built, UnitEvent::PushFinished) => Some(Pushed),
        (current, UnitEvent::Failed) if !current.is_terminal() => Some(Failed),
        _ => None,
    }
}

/// Check whether `event` is accepted in status `from`.
pub fn can_apply(from: Status, event: UnitEvent) -> bool {
    transition(from, event).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENTS: [UnitEvent; 7] = [
        UnitEvent::Excluded,
        UnitEvent::PrebuildStarted,
        UnitEvent::PrebuildFinished,
        UnitEvent::BuildStarted,
        UnitEvent::BuildFinished,
        UnitEvent::PushFinished,
        UnitEvent::Failed,
    ];

    // -----------------------------------------------------------------------
    // Forward path
    // -----------------------------------------------------------------------

    #[test]
    fn full_forward_path_reaches_pushed() {
        let mut status = Status::Unknown;
        for event in [
            UnitEvent::PrebuildStarted,
            UnitEvent::PrebuildFinished,
            UnitEvent::BuildStarted,
            UnitEvent::BuildFinished,
            UnitEvent::PushFinished,
        ] {
            status = transition(status, event).expect("forward move is legal");
        }
        assert_eq!(status, Status::Pushed);
    }

    #[test]
    fn unknown_to_do_not_build() {
        assert_eq!(
            transition(Status::Unknown, UnitEvent::Excluded),
            Some(Status::DoNotBuild)
        );
    }

    #[test]
    fn exclusion_only_from_unknown() {
        for status in Status::ALL {
            if status != Status::Unknown {
                assert!(!can_apply(status, UnitEvent::Excluded), "{status}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Failure
    // -----------------------------------------------------------------------

    #[test]
    fn every_non_terminal_status_can_fail() {
        for status in Status::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert_eq!(
                transition(status, UnitEvent::Failed),
                Some(Status::Failed),
                "{status}"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Illegal moves
    // -----------------------------------------------------------------------

    #[test]
    fn pushed_to_loading_is_illegal() {
        assert_eq!(transition(Status::Pushed, UnitEvent::PrebuildStarted), None);
    }

    #[test]
    fn skipping_a_step_is_illegal() {
        assert_eq!(transition(Status::Loaded, UnitEvent::BuildFinished), None);
        assert_eq!(transition(Status::Unknown, UnitEvent::BuildStarted), None);
    }

    #[test]
    fn terminal_statuses_accept_no_event() {
        for status in Status::ALL.into_iter().filter(|s| s.is_terminal()) {
            for event in EVENTS {
                assert!(!can_apply(status, event), "{status} on {event}");
            }
        }
    }

    #[test]
    fn transitions_never_move_backwards() {
        let rank = |s: Status| Status::ALL.iter().position(|x| *x == s).unwrap();
        for status in Status::ALL {
            for event in EVENTS {
                if let Some(next) = transition(status, event) {
                    assert!(rank(next) > rank(status), "{status} -> {next}");
                }
            }
        }
    }

    #[test]
    fn display_names() {
        assert_eq!(Status::DoNotBuild.to_string(), "do-not-build");
        assert_eq!(UnitEvent::PushFinished.to_string(), "push-finished");
    }
}
