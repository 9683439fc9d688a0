//! Estimator state machine.

use std::fmt;

use crate::fsm::Machine;

/// States of the change-detection estimator.
///
/// The estimator bootstraps a baseline, tests the upper control limit, and
/// after an upper trip can be pointed at the lower limit to detect the shift
/// correcting itself. `Reset` is reachable from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EstimatorState {
    /// Restart from a steady, non-alarmed condition.
    Reset,
    /// Collecting baseline observations before testing the upper limit.
    UclInitial,
    /// Testing against the upper control limit.
    TestingUcl,
    /// The statistic exceeded the upper control limit.
    UclTrip,
    /// Collecting baseline observations before testing the lower limit.
    LclInitial,
    /// Testing against the lower control limit.
    TestingLcl,
    /// The statistic fell below the lower control limit.
    LclTrip,
}

impl fmt::Display for EstimatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reset => "reset",
            Self::UclInitial => "ucl_initial",
            Self::TestingUcl => "testing_ucl",
            Self::UclTrip => "ucl_trip",
            Self::LclInitial => "lcl_initial",
            Self::TestingLcl => "testing_lcl",
            Self::LclTrip => "lcl_trip",
        };
        write!(f, "{name}")
    }
}

/// The estimator transition graph, starting in bootstrap.
pub(crate) fn new_machine() -> Machine<EstimatorState> {
    use EstimatorState as S;
    Machine::builder(S::UclInitial)
        .transition(S::Reset, [S::UclInitial, S::LclInitial])
        .transition(S::UclInitial, [S::TestingUcl, S::Reset])
        .transition(S::TestingUcl, [S::UclTrip, S::Reset])
        .transition(S::UclTrip, [S::LclInitial, S::Reset])
        .transition(S::LclInitial, [S::TestingLcl, S::Reset])
        .transition(S::TestingLcl, [S::LclTrip, S::Reset])
        .transition(S::LclTrip, [S::Reset])
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_reachable_from_every_state() {
        use EstimatorState as S;
        let machine = new_machine();
        for state in [
            S::UclInitial,
            S::TestingUcl,
            S::UclTrip,
            S::LclInitial,
            S::TestingLcl,
            S::LclTrip,
        ] {
            assert!(machine.allowable(state, S::Reset), "{state} -> reset");
        }
    }

    #[test]
    fn test_forward_path() {
        use EstimatorState as S;
        let mut machine = new_machine();
        machine.transition(S::TestingUcl).unwrap();
        machine.transition(S::UclTrip).unwrap();
        machine.transition(S::LclInitial).unwrap();
        machine.transition(S::TestingLcl).unwrap();
        machine.transition(S::LclTrip).unwrap();
        machine.transition(S::Reset).unwrap();
        machine.transition(S::UclInitial).unwrap();
    }

    #[test]
    fn test_no_shortcut_to_trip() {
        use EstimatorState as S;
        let mut machine = new_machine();
        assert!(machine.transition(S::UclTrip).is_err());
    }
}
