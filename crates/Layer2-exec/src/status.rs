//! Executor lifecycle state machine
//!
//! Statuses are totally ordered: `Unknown < Unstarted < Running < Exited <
//! Closed`. Backends gate every operation on comparisons against this order
//! and only ever move forward through it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Lifecycle state of an executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Status {
    Unknown,
    Unstarted,
    Running,
    Exited,
    Closed,
}

impl Default for Status {
    fn default() -> Self {
        Self::Unknown
    }
}

impl Status {
    /// Strictly earlier than `other`
    pub fn before(self, other: Status) -> bool {
        self < other
    }

    /// Strictly later than `other`
    pub fn after(self, other: Status) -> bool {
        self > other
    }

    /// Strictly between `lower` and `upper`
    pub fn between(self, lower: Status, upper: Status) -> bool {
        lower < self && self < upper
    }

    /// Between `lower` and `upper`, bounds included
    pub fn between_inclusive(self, lower: Status, upper: Status) -> bool {
        lower <= self && self <= upper
    }

    pub fn is_terminal(self) -> bool {
        self == Status::Closed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Unknown => "unknown",
            Status::Unstarted => "unstarted",
            Status::Running => "running",
            Status::Exited => "exited",
            Status::Closed => "closed",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-executor status holder that never moves backwards.
#[derive(Debug)]
pub struct StatusCell {
    inner: RwLock<Status>,
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new(Status::Unstarted)
    }
}

impl StatusCell {
    pub fn new(initial: Status) -> Self {
        Self {
            inner: RwLock::new(initial),
        }
    }

    pub fn get(&self) -> Status {
        *self.inner.read()
    }

    /// Move to `next` unless that would lower the status.
    ///
    /// Returns whether the write happened.
    pub fn set(&self, next: Status) -> bool {
        let mut current = self.inner.write();
        if next < *current {
            return false;
        }
        *current = next;
        true
    }

    /// Atomically move from exactly `from` to `to`.
    pub fn transition(&self, from: Status, to: Status) -> bool {
        let mut current = self.inner.write();
        if *current != from || to < from {
            return false;
        }
        *current = to;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(Status::Unknown < Status::Unstarted);
        assert!(Status::Unstarted < Status::Running);
        assert!(Status::Running < Status::Exited);
        assert!(Status::Exited < Status::Closed);
    }

    #[test]
    fn test_comparison_helpers() {
        assert!(Status::Unstarted.before(Status::Running));
        assert!(!Status::Running.before(Status::Running));
        assert!(Status::Exited.after(Status::Running));
        assert!(Status::Running.between(Status::Unstarted, Status::Exited));
        assert!(!Status::Exited.between(Status::Unstarted, Status::Exited));
        assert!(Status::Exited.between_inclusive(Status::Running, Status::Exited));
        assert!(!Status::Closed.between_inclusive(Status::Running, Status::Exited));
    }

    #[test]
    fn test_cell_is_monotonic() {
        let cell = StatusCell::default();
        assert!(cell.set(Status::Running));
        assert!(!cell.set(Status::Unstarted));
        assert!(!cell.set(Status::Unknown));
        assert_eq!(cell.get(), Status::Running);
        assert!(cell.set(Status::Closed));
        assert!(!cell.set(Status::Exited));
        assert_eq!(cell.get(), Status::Closed);
    }

    #[test]
    fn test_cell_transition_requires_exact_state() {
        let cell = StatusCell::default();
        assert!(!cell.transition(Status::Running, Status::Exited));
        assert!(cell.transition(Status::Unstarted, Status::Running));
        assert!(!cell.transition(Status::Unstarted, Status::Running));
        assert_eq!(cell.get(), Status::Running);
    }

    #[test]
    fn test_display() {
        assert_eq!(Status::Running.to_string(), "running");
        assert!(Status::Closed.is_terminal());
    }
}
