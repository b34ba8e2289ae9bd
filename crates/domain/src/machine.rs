//! The transition gate shared by every saga status type.

use chrono::{DateTime, Duration, Utc};

use crate::error::{DomainError, Result};

/// A fixed, explicit directed graph of statuses.
pub trait StateGraph: Copy + Eq + std::fmt::Debug + std::fmt::Display + 'static {
    /// Returns true if no edge leaves this status.
    fn is_terminal(&self) -> bool;

    /// Returns the statuses directly reachable from this one.
    fn successors(&self) -> &'static [Self];
}

/// Returns true iff `(current, target)` is a declared edge.
///
/// Always false when `current` is terminal or equal to `target`.
pub fn can_transition<S: StateGraph>(current: S, target: S) -> bool {
    !current.is_terminal() && current != target && current.successors().contains(&target)
}

/// A record whose status is governed by a [`StateGraph`].
pub trait Transitionable {
    type State: StateGraph;

    fn status(&self) -> Self::State;

    /// Writes the new status and timestamp. Only [`transition`] calls this.
    fn apply_transition(&mut self, target: Self::State, at: DateTime<Utc>);

    fn updated_at(&self) -> DateTime<Utc>;
}

/// Moves `record` to `target` if the edge exists, advancing `updated_at`.
pub fn transition<R: Transitionable>(record: &mut R, target: R::State) -> Result<()> {
    let current = record.status();
    if !can_transition(current, target) {
        return Err(DomainError::StateConflict {
            from: current.to_string(),
            to: target.to_string(),
        });
    }
    let at = next_timestamp(record.updated_at());
    record.apply_transition(target, at);
    Ok(())
}

/// Returns a timestamp strictly after `previous`.
///
/// Uses the wall clock when it has moved forward, otherwise bumps by one
/// microsecond.
pub fn next_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}
