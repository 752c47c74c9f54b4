use super::{
    errors::{StateMachineError, StateMachineResult},
    events::JobEvent,
    states::JobStatus,
};

/// Transition table for job lifecycle management.
///
/// Jobs live in the shared store, so the machine holds no state of its own: callers
/// pass the stored status in and persist the returned target.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobStateMachine;

impl JobStateMachine {
    /// Resolve the target state for `event`, rejecting anything out of a terminal state
    pub fn determine_target_state(
        current_state: JobStatus,
        event: &JobEvent,
    ) -> StateMachineResult<JobStatus> {
        let target = match (current_state, event) {
            // Linking and progress keep the job running
            (JobStatus::Submitted | JobStatus::InProgress, JobEvent::Link) => JobStatus::InProgress,
            (JobStatus::Submitted | JobStatus::InProgress, JobEvent::Progress) => {
                JobStatus::InProgress
            }

            // Completion may arrive without an intermediate link
            (JobStatus::Submitted | JobStatus::InProgress, JobEvent::Complete) => {
                JobStatus::Succeeded
            }

            (JobStatus::Submitted | JobStatus::InProgress, JobEvent::Fail(_)) => JobStatus::Failed,

            (from_state, _) if from_state.is_terminal() => {
                return Err(StateMachineError::AlreadyTerminal {
                    state: from_state,
                    event: event.event_type().to_string(),
                })
            }

            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from_state,
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    /// Whether `event` would move a job out of `current_state`
    pub fn can_apply(current_state: JobStatus, event: &JobEvent) -> bool {
        Self::determine_target_state(current_state, event).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_forward_transitions() {
        assert_eq!(
            JobStateMachine::determine_target_state(JobStatus::Submitted, &JobEvent::Link),
            Ok(JobStatus::InProgress)
        );
        assert_eq!(
            JobStateMachine::determine_target_state(JobStatus::InProgress, &JobEvent::Progress),
            Ok(JobStatus::InProgress)
        );
        assert_eq!(
            JobStateMachine::determine_target_state(JobStatus::Submitted, &JobEvent::Complete),
            Ok(JobStatus::Succeeded)
        );
        assert_eq!(
            JobStateMachine::determine_target_state(
                JobStatus::InProgress,
                &JobEvent::fail_with_reason("moderated")
            ),
            Ok(JobStatus::Failed)
        );
    }

    #[test]
    fn test_terminal_states_reject_events() {
        let err = JobStateMachine::determine_target_state(JobStatus::Succeeded, &JobEvent::Progress)
            .unwrap_err();
        assert!(matches!(err, StateMachineError::AlreadyTerminal { .. }));
        assert!(!JobStateMachine::can_apply(JobStatus::Failed, &JobEvent::Complete));
    }

    fn any_status() -> impl Strategy<Value = JobStatus> {
        prop_oneof![
            Just(JobStatus::Submitted),
            Just(JobStatus::InProgress),
            Just(JobStatus::Succeeded),
            Just(JobStatus::Failed),
        ]
    }

    fn any_event() -> impl Strategy<Value = JobEvent> {
        prop_oneof![
            Just(JobEvent::Link),
            Just(JobEvent::Progress),
            Just(JobEvent::Complete),
            "[a-z ]{0,12}".prop_map(JobEvent::Fail),
        ]
    }

    proptest! {
        #[test]
        fn prop_status_never_leaves_terminal(
            start in any_status(),
            events in proptest::collection::vec(any_event(), 0..20),
        ) {
            let mut status = start;
            let mut seen_terminal = status.is_terminal();
            let first_terminal = if seen_terminal { Some(status) } else { None };
            let mut locked = first_terminal;

            for event in &events {
                if let Ok(next) = JobStateMachine::determine_target_state(status, event) {
                    status = next;
                }
                if status.is_terminal() && !seen_terminal {
                    seen_terminal = true;
                    locked = Some(status);
                }
                if let Some(terminal) = locked {
                    prop_assert_eq!(status, terminal);
                }
            }
        }
    }
}
