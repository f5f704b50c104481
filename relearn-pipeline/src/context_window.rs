use std::collections::VecDeque;

use relearn_types::Context;

/// Sliding buffer of the most recent contexts.
///
/// Holds at most `capacity` entries, evicting the oldest on overflow. A
/// deep-copy snapshot is returned whenever an insert leaves the window
/// exactly full; the snapshot owns its data and is unaffected by later
/// mutation of the window.
pub struct ContextWindow {
    capacity: usize,
    window: VecDeque<Context>,
}

impl ContextWindow {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            capacity,
            window: VecDeque::with_capacity(capacity + 1),
        }
    }

    /// Append a context, returning a snapshot iff the window is now full.
    pub fn push(&mut self, ctx: Context) -> Option<Vec<Context>> {
        self.window.push_back(ctx);
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }
        if self.window.len() == self.capacity {
            Some(self.window.iter().cloned().collect())
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}
