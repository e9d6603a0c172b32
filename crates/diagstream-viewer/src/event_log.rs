//! [`EventLog`] – bounded, newest-first event retention.
//!
//! Every [`EventLog::push`] prepends the event and drops whatever falls past
//! the capacity, so memory stays bounded however long the feed runs. Readers
//! get [`Snapshot`]s: immutable, cheaply clonable views that later pushes
//! never change.

use std::ops::Deref;
use std::sync::Arc;

use diagstream_types::Event;

/// Number of events retained when no capacity is given.
pub const DEFAULT_LOG_CAPACITY: usize = 200;

/// Immutable newest-first view of an [`EventLog`].
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot(Arc<[Event]>);

impl Snapshot {
    pub fn empty() -> Self {
        Self(Arc::from(Vec::new()))
    }

    /// Most recent event, if any.
    pub fn latest(&self) -> Option<&Event> {
        self.0.first()
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl Deref for Snapshot {
    type Target = [Event];

    fn deref(&self) -> &[Event] {
        &self.0
    }
}

/// Fixed-capacity, newest-first event log.
///
/// # Example
///
/// ```
/// use diagstream_types::Event;
/// use diagstream_viewer::EventLog;
///
/// let mut log = EventLog::with_capacity(2);
/// log.push(Event::new("a"));
/// log.push(Event::new("b"));
/// let snap = log.push(Event::new("c"));
///
/// let kinds: Vec<_> = snap.iter().map(|e| e.kind.as_str()).collect();
/// assert_eq!(kinds, ["c", "b"]);
/// ```
#[derive(Debug, Clone)]
pub struct EventLog {
    capacity: usize,
    current: Snapshot,
}

impl EventLog {
    /// Create an empty log retaining at most `capacity` events.
    ///
    /// A capacity of zero is honoured: every push is discarded.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            current: Snapshot::empty(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Prepend `event`, truncate to capacity, and return the new snapshot.
    ///
    /// Never fails and never looks inside `event`.
    pub fn push(&mut self, event: Event) -> Snapshot {
        if self.capacity == 0 {
            return self.current.clone();
        }
        let keep = self.current.len().min(self.capacity - 1);
        let mut next = Vec::with_capacity(keep + 1);
        next.push(event);
        next.extend_from_slice(&self.current[..keep]);
        self.current = Snapshot(Arc::from(next));
        self.current.clone()
    }

    /// Current contents, newest first.
    pub fn snapshot(&self) -> Snapshot {
        self.current.clone()
    }

    /// Drop every retained event.
    pub fn reset(&mut self) {
        self.current = Snapshot::empty();
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}
