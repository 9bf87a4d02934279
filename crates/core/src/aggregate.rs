//! Aggregate contracts for event-sourced domain models.

/// Aggregate root marker + minimal interface.
///
/// Intentionally small so domain crates can decide how they model state
/// transitions without bringing in any infrastructure concerns.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Monotonically increasing version of the aggregate's state.
    ///
    /// For event-sourced aggregates this corresponds to the number of events
    /// applied (the stream revision).
    fn version(&self) -> u64;
}

/// Event-sourced aggregate: pure decision function + event application.
///
/// `handle` validates a command against current state and emits events
/// without mutating state. `apply` folds a single event into state and is
/// the only place state changes. Replay is `apply` over the stream in
/// version order.
pub trait Aggregate: AggregateRoot {
    type Command;
    type Event;
    type Error;

    /// Fold one event into state. Must be deterministic and total for every
    /// event this aggregate can emit.
    fn apply(&mut self, event: &Self::Event);

    /// Decide: validate preconditions, emit zero or more events.
    ///
    /// Must not mutate `self`; callers apply the returned events themselves
    /// so that later commands in the same unit of work observe the new state.
    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;
}

/// Expected stream version for optimistic concurrency on append.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No check; append at whatever the current version is.
    Any,
    /// The stream must not exist yet (version 0).
    NoStream,
    /// The stream must be at exactly this version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Whether an observed stream version satisfies this expectation.
    pub fn matches(&self, current: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => current == 0,
            ExpectedVersion::Exact(v) => *v == current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_version_matching() {
        assert!(ExpectedVersion::Any.matches(0));
        assert!(ExpectedVersion::Any.matches(42));
        assert!(ExpectedVersion::NoStream.matches(0));
        assert!(!ExpectedVersion::NoStream.matches(1));
        assert!(ExpectedVersion::Exact(3).matches(3));
        assert!(!ExpectedVersion::Exact(3).matches(4));
    }
}
