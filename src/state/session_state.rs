/// Session state definitions for the polling loop
///
/// A session is either idle or running; every other condition (sleeping,
/// fetching, committing) is a phase of the running loop, not a state.
use std::fmt;

/// Represents the current state of a polling session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// No loop is active for this session
    #[default]
    Idle,

    /// The polling loop is active
    Running,
}

impl SessionState {
    /// Returns true if the polling loop is active
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if moving from `self` to `next` is a legal transition
    ///
    /// Stopping an idle session is a no-op, so Idle -> Idle is legal.
    /// Starting a running session is not.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        match (self, next) {
            (Self::Idle, Self::Running) => true,
            (Self::Running, Self::Idle) => true,
            (Self::Idle, Self::Idle) => true,
            (Self::Running, Self::Running) => false,
        }
    }

    /// Converts the session state to its string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_idle() {
        assert_eq!(SessionState::default(), SessionState::Idle);
        assert!(!SessionState::Idle.is_running());
        assert!(SessionState::Running.is_running());
    }

    #[test]
    fn test_transitions() {
        assert!(SessionState::Idle.can_transition_to(SessionState::Running));
        assert!(SessionState::Running.can_transition_to(SessionState::Idle));
        assert!(SessionState::Idle.can_transition_to(SessionState::Idle));
        assert!(!SessionState::Running.can_transition_to(SessionState::Running));
    }

    #[test]
    fn test_display() {
        assert_eq!(SessionState::Idle.to_string(), "idle");
        assert_eq!(SessionState::Running.to_string(), "running");
    }
}
