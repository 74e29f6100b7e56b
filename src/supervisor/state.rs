use std::fmt;

/// Lifecycle of a `ConnectionSupervisor`.
///
/// `Unstarted → TryingWireBroker → TryingRemoteBroker → TryingEmbeddedBroker
/// → Connected → Stopped`. A failed `Trying*` stage advances to the next one;
/// once `Connected`, the only way out is `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Unstarted,
    TryingWireBroker,
    TryingRemoteBroker,
    TryingEmbeddedBroker,
    Connected,
    Stopped,
}

impl SupervisorState {
    pub fn is_trying(self) -> bool {
        matches!(
            self,
            Self::TryingWireBroker | Self::TryingRemoteBroker | Self::TryingEmbeddedBroker
        )
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        match (self, next) {
            (Unstarted | Stopped, TryingWireBroker) => true,
            (TryingWireBroker, TryingRemoteBroker) => true,
            (TryingRemoteBroker, TryingEmbeddedBroker) => true,
            (s, Connected) if s.is_trying() => true,
            (TryingEmbeddedBroker | Connected | Unstarted, Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
