//! Bounded ring of recent child stderr lines.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Fixed-capacity, thread-safe tail of log lines.
///
/// `push` is O(1); `snapshot` returns the retained lines in chronological
/// order. Used to attach a bounded stderr tail to exit diagnostics.
#[derive(Debug)]
pub struct LineRing {
    inner: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LineRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut inner = self.inner.lock();
        if inner.len() == self.capacity {
            inner.pop_front();
        }
        inner.push_back(line.into());
    }

    /// Chronological copy of the retained lines.
    pub fn snapshot(&self) -> Vec<String> {
        self.inner.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_tail() {
        let ring = LineRing::new(3);
        for i in 0..5 {
            ring.push(format!("line {i}"));
        }

        assert_eq!(ring.snapshot(), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn snapshot_is_chronological_under_wraparound() {
        let ring = LineRing::new(2);
        ring.push("a");
        ring.push("b");
        ring.push("c");
        assert_eq!(ring.snapshot(), vec!["b", "c"]);
    }

    #[test]
    fn empty_ring() {
        let ring = LineRing::new(4);
        assert!(ring.is_empty());
        assert!(ring.snapshot().is_empty());
    }
}
