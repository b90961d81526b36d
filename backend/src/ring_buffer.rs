use std::collections::VecDeque;

/// Fixed-capacity buffer kept sorted by a key; the smallest key is evicted
/// first once full. An item older than everything retained is dropped.
pub struct RingBuffer<T> {
    max: usize,
    buf: VecDeque<T>,
}

impl<T> RingBuffer<T> {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            buf: VecDeque::with_capacity(max.min(4096)),
        }
    }

    /// Inserts `item` after every element whose key is `<=` its own.
    ///
    /// Telemetry mostly arrives in order, so the scan starts from the back.
    pub fn insert_by_key<K, F>(&mut self, item: T, key: F)
    where
        K: Ord,
        F: Fn(&T) -> K,
    {
        let k = key(&item);
        if self.buf.len() == self.max {
            if self.buf.front().is_some_and(|oldest| k < key(oldest)) {
                return;
            }
            self.buf.pop_front();
        }
        let pos = self
            .buf
            .iter()
            .rposition(|existing| key(existing) <= k)
            .map_or(0, |idx| idx + 1);
        self.buf.insert(pos, item);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buf.iter()
    }
}
