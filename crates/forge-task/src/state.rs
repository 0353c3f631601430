use forge_core::ForgeError;

use crate::model::TaskStatus;

/// Allowed transitions per state. `failed` is terminal for the iteration.
pub fn allowed_transitions(current: TaskStatus) -> &'static [TaskStatus] {
    use TaskStatus::*;
    match current {
        Pending => &[Cloning, Failed],
        Cloning => &[Running, Failed],
        Running => &[Completed, Failed],
        Completed => &[AwaitingInstruction, CreatingPr],
        Failed => &[],
        AwaitingInstruction => &[Running, Failed],
        CreatingPr => &[PrCreated, Failed],
        PrCreated => &[AwaitingInstruction, Completed],
    }
}

/// Validates a transition, failing with a conflict-mapped error otherwise.
pub fn validate_transition(current: TaskStatus, next: TaskStatus) -> Result<(), ForgeError> {
    if allowed_transitions(current).contains(&next) {
        return Ok(());
    }
    Err(ForgeError::InvalidTransition {
        from: current.as_str().to_string(),
        to: next.as_str().to_string(),
    })
}

/// True when no further transitions exist for this iteration.
pub fn is_terminal(status: TaskStatus) -> bool {
    status == TaskStatus::Failed
}

/// True when the task has reached a completion state; finished states receive
/// their TTLs.
pub fn is_finished(status: TaskStatus) -> bool {
    matches!(
        status,
        TaskStatus::Completed | TaskStatus::Failed | TaskStatus::PrCreated
    )
}

#[cfg(test)]
mod tests {
    use super::{allowed_transitions, is_finished, is_terminal, validate_transition};
    use crate::model::TaskStatus::{self, *};

    const ALL: [TaskStatus; 8] = [
        Pending,
        Cloning,
        Running,
        Completed,
        Failed,
        AwaitingInstruction,
        CreatingPr,
        PrCreated,
    ];

    #[test]
    fn unit_happy_path_transitions_are_allowed() {
        for (from, to) in [
            (Pending, Cloning),
            (Cloning, Running),
            (Running, Completed),
            (Completed, AwaitingInstruction),
            (AwaitingInstruction, Running),
            (Completed, CreatingPr),
            (CreatingPr, PrCreated),
            (PrCreated, AwaitingInstruction),
            (PrCreated, Completed),
        ] {
            validate_transition(from, to)
                .unwrap_or_else(|_| panic!("{from} -> {to} should be allowed"));
        }
    }

    #[test]
    fn unit_error_path_reaches_failed_from_every_active_state() {
        for from in [Pending, Cloning, Running, AwaitingInstruction, CreatingPr] {
            validate_transition(from, Failed)
                .unwrap_or_else(|_| panic!("{from} -> failed should be allowed"));
        }
    }

    #[test]
    fn unit_failed_is_strictly_terminal() {
        assert!(is_terminal(Failed));
        assert!(allowed_transitions(Failed).is_empty());
        for to in ALL {
            if to != Failed {
                assert!(validate_transition(Failed, to).is_err());
            }
        }
    }

    #[test]
    fn regression_every_disallowed_pair_is_rejected() {
        let mut rejected = 0;
        for from in ALL {
            for to in ALL {
                if !allowed_transitions(from).contains(&to) {
                    let error = validate_transition(from, to)
                        .expect_err("transition outside the table must fail");
                    assert_eq!(error.http_status(), 409);
                    rejected += 1;
                }
            }
        }
        // 8x8 pairs minus the 14 allowed edges.
        assert_eq!(rejected, 64 - 14);
    }

    #[test]
    fn unit_finished_states_receive_ttls() {
        assert!(is_finished(Completed));
        assert!(is_finished(Failed));
        assert!(is_finished(PrCreated));
        for status in [Pending, Cloning, Running, AwaitingInstruction, CreatingPr] {
            assert!(!is_finished(status));
        }
    }
}
