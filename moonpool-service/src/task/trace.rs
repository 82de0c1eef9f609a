//! Suspension-point history attached to task faults.

use std::fmt;
use std::panic::Location;

/// Keep the most recent suspension points only.
const MAX_TRACE_DEPTH: usize = 32;

/// Source locations at which a task suspended, oldest first.
///
/// Rendered into [`ServiceError::TaskFault`](crate::ServiceError::TaskFault)
/// so a fault can be followed back through the awaits that led to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuspendTrace {
    points: Vec<&'static Location<'static>>,
    dropped: usize,
}

impl SuspendTrace {
    /// Create an empty trace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one suspension point.
    pub fn push(&mut self, location: &'static Location<'static>) {
        if self.points.len() == MAX_TRACE_DEPTH {
            self.points.remove(0);
            self.dropped += 1;
        }
        self.points.push(location);
    }

    /// Recorded locations, oldest first.
    pub fn points(&self) -> &[&'static Location<'static>] {
        &self.points
    }

    /// Number of recorded points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.points.clear();
        self.dropped = 0;
    }
}

impl fmt::Display for SuspendTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dropped > 0 {
            write!(f, "\n    ... {} earlier suspension points", self.dropped)?;
        }
        for location in &self.points {
            write!(
                f,
                "\n    suspended at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            )?;
        }
        Ok(())
    }
}
