//! The workload state machine's allowed-transitions relation.
//!
//! Centralizing this as a pure function lets `Store` implementations enforce
//! it inside their write transaction without callers having to precompute
//! validity themselves (per the state machine's centralization requirement).

use super::workload::WorkloadStatus;
use crate::error::VulcanError;

/// Validate that `current -> next` is a legal transition.
///
/// ```text
/// pending  -> running | failed | killed
/// running  -> completed | failed | killed
/// (terminal: completed, failed, killed; no outgoing transitions)
/// ```
///
/// # Errors
///
/// Returns `VulcanError::InvalidTransition` when the pair is not in the
/// relation above.
pub fn validate_transition(
    current: WorkloadStatus,
    next: WorkloadStatus,
) -> Result<(), VulcanError> {
    use WorkloadStatus::{Completed, Failed, Killed, Pending, Running};

    let allowed = matches!(
        (current, next),
        (Pending, Running) | (Pending, Failed) | (Pending, Killed)
            | (Running, Completed) | (Running, Failed) | (Running, Killed)
    );

    if allowed {
        Ok(())
    } else {
        Err(VulcanError::InvalidTransition {
            from: current.as_str(),
            to: next.as_str(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkloadStatus::{Completed, Failed, Killed, Pending, Running};

    #[test]
    fn pending_can_advance_to_running_failed_or_killed() {
        assert!(validate_transition(Pending, Running).is_ok());
        assert!(validate_transition(Pending, Failed).is_ok());
        assert!(validate_transition(Pending, Killed).is_ok());
    }

    #[test]
    fn running_can_advance_to_any_terminal_status() {
        assert!(validate_transition(Running, Completed).is_ok());
        assert!(validate_transition(Running, Failed).is_ok());
        assert!(validate_transition(Running, Killed).is_ok());
    }

    #[test]
    fn terminal_statuses_have_no_outgoing_transitions() {
        for terminal in [Completed, Failed, Killed] {
            for next in [Pending, Running, Completed, Failed, Killed] {
                assert!(validate_transition(terminal, next).is_err());
            }
        }
    }

    #[test]
    fn pending_cannot_jump_straight_to_completed() {
        assert!(validate_transition(Pending, Completed).is_err());
    }

    #[test]
    fn self_transitions_are_rejected() {
        assert!(validate_transition(Pending, Pending).is_err());
        assert!(validate_transition(Running, Running).is_err());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn any_status() -> impl Strategy<Value = WorkloadStatus> {
        prop_oneof![
            Just(WorkloadStatus::Pending),
            Just(WorkloadStatus::Running),
            Just(WorkloadStatus::Completed),
            Just(WorkloadStatus::Failed),
            Just(WorkloadStatus::Killed),
        ]
    }

    proptest! {
        /// Exhaustive membership check: validity exactly matches the documented relation.
        #[test]
        fn matches_documented_relation(current in any_status(), next in any_status()) {
            use WorkloadStatus::{Completed, Failed, Killed, Pending, Running};
            let expected = matches!(
                (current, next),
                (Pending, Running) | (Pending, Failed) | (Pending, Killed)
                    | (Running, Completed) | (Running, Failed) | (Running, Killed)
            );
            prop_assert_eq!(validate_transition(current, next).is_ok(), expected);
        }

        /// An invalid transition never returns Ok.
        #[test]
        fn invalid_transitions_never_mutate(current in any_status(), next in any_status()) {
            if validate_transition(current, next).is_err() {
                prop_assert!(current.is_terminal() || current == next || matches!(
                    (current, next),
                    (WorkloadStatus::Pending, WorkloadStatus::Completed)
                ));
            }
        }
    }
}
