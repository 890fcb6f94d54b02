// Cook-state classification: which engine states may expose output geometry.

/// Engine cook states, in native order. States up to `MAX_READY` are terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CookState {
    Ready,
    ReadyWithFatalErrors,
    ReadyWithCookErrors,
    StartingCook,
    Cooking,
    StartingLoad,
    Loading,
    Unknown(i32),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Readiness {
    Ready,
    ReadyWithWarning,
    NotReady,
}

impl Readiness {
    /// Output may be read for both clean and degraded terminal states.
    pub fn allows_output(self) -> bool {
        !matches!(self, Readiness::NotReady)
    }
}

impl CookState {
    pub const MAX_READY: i32 = 2;

    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => CookState::Ready,
            1 => CookState::ReadyWithFatalErrors,
            2 => CookState::ReadyWithCookErrors,
            3 => CookState::StartingCook,
            4 => CookState::Cooking,
            5 => CookState::StartingLoad,
            6 => CookState::Loading,
            other => CookState::Unknown(other),
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            CookState::Ready => 0,
            CookState::ReadyWithFatalErrors => 1,
            CookState::ReadyWithCookErrors => 2,
            CookState::StartingCook => 3,
            CookState::Cooking => 4,
            CookState::StartingLoad => 5,
            CookState::Loading => 6,
            CookState::Unknown(raw) => raw,
        }
    }

    pub fn readiness(self) -> Readiness {
        match self {
            CookState::Ready => Readiness::Ready,
            CookState::ReadyWithFatalErrors | CookState::ReadyWithCookErrors => {
                Readiness::ReadyWithWarning
            }
            // Negative codes are not defined states; they never count as ready.
            CookState::StartingCook
            | CookState::Cooking
            | CookState::StartingLoad
            | CookState::Loading
            | CookState::Unknown(_) => Readiness::NotReady,
        }
    }

    pub fn warning(self) -> Option<&'static str> {
        match self {
            CookState::ReadyWithFatalErrors => Some("cook terminated with fatal errors"),
            CookState::ReadyWithCookErrors => Some("cook terminated with cook errors"),
            _ => None,
        }
    }
}

/// Result of one cook request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CookOutcome {
    pub state: CookState,
}

impl CookOutcome {
    pub fn readiness(&self) -> Readiness {
        self.state.readiness()
    }

    pub fn is_ready(&self) -> bool {
        self.readiness().allows_output()
    }
}

#[cfg(test)]
mod tests {
    use super::{CookOutcome, CookState, Readiness};

    #[test]
    fn every_defined_state_maps_to_one_class() {
        let cases = [
            (0, Readiness::Ready),
            (1, Readiness::ReadyWithWarning),
            (2, Readiness::ReadyWithWarning),
            (3, Readiness::NotReady),
            (4, Readiness::NotReady),
            (5, Readiness::NotReady),
            (6, Readiness::NotReady),
        ];
        for (raw, expected) in cases {
            let state = CookState::from_raw(raw);
            assert_eq!(state.raw(), raw);
            assert_eq!(state.readiness(), expected, "state {raw}");
            assert_eq!(state.readiness(), CookState::from_raw(raw).readiness());
        }
    }

    #[test]
    fn warnings_still_allow_output() {
        let outcome = CookOutcome {
            state: CookState::ReadyWithCookErrors,
        };
        assert!(outcome.is_ready());
        assert!(CookState::ReadyWithFatalErrors.warning().is_some());
        assert!(CookState::Ready.warning().is_none());
    }

    #[test]
    fn states_above_threshold_and_unknown_are_not_ready() {
        assert!(CookState::MAX_READY < CookState::StartingCook.raw());
        assert!(!CookOutcome { state: CookState::Loading }.is_ready());
        assert!(!CookOutcome { state: CookState::from_raw(99) }.is_ready());
        assert!(!CookOutcome { state: CookState::from_raw(-1) }.is_ready());
    }
}
