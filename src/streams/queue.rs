//! Controller queues.
//!
//! [`SegmentedQueue`] is a FIFO built from fixed-capacity segments so that
//! shifting from the front never moves the remaining elements. Only the head
//! segment carries a cursor; a segment is dropped once the cursor walks off
//! its end. [`SizedQueue`] layers the `(value, size)` bookkeeping the
//! controllers use for backpressure on top of it.

use super::error::{StreamError, StreamResult};
use std::collections::VecDeque;

/// Number of slots per segment.
pub const SEGMENT_CAPACITY: usize = 16384;

pub struct SegmentedQueue<T> {
    segments: VecDeque<Vec<Option<T>>>,
    cursor: usize,
    len: usize,
}

impl<T> SegmentedQueue<T> {
    pub fn new() -> Self {
        Self {
            segments: VecDeque::new(),
            cursor: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, value: T) {
        let needs_segment = self
            .segments
            .back()
            .map_or(true, |segment| segment.len() == SEGMENT_CAPACITY);
        if needs_segment {
            // Grows on demand up to SEGMENT_CAPACITY
            self.segments.push_back(Vec::new());
        }
        if let Some(back) = self.segments.back_mut() {
            back.push(Some(value));
            self.len += 1;
        }
    }

    pub fn shift(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let front = self.segments.front_mut()?;
        let value = front.get_mut(self.cursor).and_then(Option::take);
        self.cursor += 1;
        self.len -= 1;

        if self.cursor == SEGMENT_CAPACITY {
            self.segments.pop_front();
            self.cursor = 0;
        } else if self.len == 0 {
            // Reuse the single remaining segment from the start
            if let Some(front) = self.segments.front_mut() {
                front.clear();
            }
            self.cursor = 0;
        }
        value
    }

    pub fn peek(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        self.segments
            .front()
            .and_then(|segment| segment.get(self.cursor))
            .and_then(Option::as_ref)
    }

    pub fn peek_mut(&mut self) -> Option<&mut T> {
        if self.len == 0 {
            return None;
        }
        let cursor = self.cursor;
        self.segments
            .front_mut()
            .and_then(|segment| segment.get_mut(cursor))
            .and_then(Option::as_mut)
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.cursor = 0;
        self.len = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let cursor = self.cursor;
        self.segments
            .iter()
            .enumerate()
            .flat_map(move |(index, segment)| {
                let start = if index == 0 { cursor } else { 0 };
                segment[start..].iter()
            })
            .filter_map(Option::as_ref)
    }
}

impl<T> Default for SegmentedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SizedEntry<T> {
    pub value: T,
    pub size: f64,
}

/// FIFO of `(value, size)` pairs with a running total.
pub struct SizedQueue<T> {
    entries: SegmentedQueue<SizedEntry<T>>,
    total_size: f64,
}

impl<T> SizedQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: SegmentedQueue::new(),
            total_size: 0.0,
        }
    }

    pub fn enqueue(&mut self, value: T, size: f64) -> StreamResult<()> {
        if !size.is_finite() || size < 0.0 {
            return Err(StreamError::range_error(
                "Size must be a finite, non-NaN, non-negative number.",
            ));
        }
        self.entries.push(SizedEntry { value, size });
        self.total_size += size;
        Ok(())
    }

    pub fn dequeue(&mut self) -> Option<T> {
        let entry = self.entries.shift()?;
        self.total_size -= entry.size;
        if self.total_size < 0.0 {
            self.total_size = 0.0;
        }
        Some(entry.value)
    }

    pub fn peek(&self) -> Option<&T> {
        self.entries.peek().map(|entry| &entry.value)
    }

    pub fn peek_mut(&mut self) -> Option<&mut T> {
        self.entries.peek_mut().map(|entry| &mut entry.value)
    }

    /// Consumes `amount` of the head entry's size without removing it.
    ///
    /// The byte controller uses this when a read takes only part of the
    /// oldest chunk.
    pub fn consume_head(&mut self, amount: f64) {
        if let Some(entry) = self.entries.peek_mut() {
            let taken = amount.min(entry.size);
            entry.size -= taken;
            self.total_size -= taken;
            if self.total_size < 0.0 {
                self.total_size = 0.0;
            }
        }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.total_size = 0.0;
    }

    pub fn total_size(&self) -> f64 {
        self.total_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    fn sizes(&self) -> impl Iterator<Item = f64> + '_ {
        self.entries.iter().map(|entry| entry.size)
    }
}

impl<T> Default for SizedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn shifts_in_push_order_across_segments() {
        let mut queue = SegmentedQueue::new();
        let count = SEGMENT_CAPACITY * 2 + 17;
        for i in 0..count {
            queue.push(i);
        }
        assert_eq!(queue.len(), count);
        assert_eq!(queue.peek(), Some(&0));

        for i in 0..count {
            assert_eq!(queue.shift(), Some(i));
        }
        assert!(queue.is_empty());
        assert_eq!(queue.shift(), None);
        assert_eq!(queue.peek(), None);
    }

    #[test]
    fn interleaved_push_and_shift_keep_fifo_order() {
        let mut queue = SegmentedQueue::new();
        let mut next_in = 0usize;
        let mut next_out = 0usize;
        for round in 0..(SEGMENT_CAPACITY / 512 + 4) {
            for _ in 0..(700 + round) {
                queue.push(next_in);
                next_in += 1;
            }
            for _ in 0..500 {
                assert_eq!(queue.shift(), Some(next_out));
                next_out += 1;
            }
        }
        let rest: Vec<_> = queue.iter().copied().collect();
        assert_eq!(rest, (next_out..next_in).collect::<Vec<_>>());
    }

    #[test]
    fn peek_mut_edits_the_head_in_place() {
        let mut queue = SegmentedQueue::new();
        queue.push(String::from("a"));
        queue.push(String::from("b"));
        if let Some(head) = queue.peek_mut() {
            head.push('!');
        }
        assert_eq!(queue.shift().as_deref(), Some("a!"));
        assert_eq!(queue.peek().map(String::as_str), Some("b"));
    }

    #[test]
    fn rejects_invalid_sizes() {
        let mut queue = SizedQueue::new();
        assert!(matches!(queue.enqueue(1, -1.0), Err(StreamError::Range(_))));
        assert!(matches!(queue.enqueue(1, f64::NAN), Err(StreamError::Range(_))));
        assert!(matches!(
            queue.enqueue(1, f64::INFINITY),
            Err(StreamError::Range(_))
        ));
        assert!(queue.is_empty());
        assert_eq!(queue.total_size(), 0.0);
    }

    #[test]
    fn total_is_clamped_against_float_drift() {
        let mut queue = SizedQueue::new();
        queue.enqueue("a", 0.1).unwrap();
        queue.enqueue("b", 0.2).unwrap();
        queue.dequeue();
        queue.dequeue();
        assert!(queue.total_size() >= 0.0);
        assert!(queue.total_size() < 1e-9);
    }

    #[test]
    fn total_matches_sum_of_entries_for_random_sequences() {
        for seed in [1u64, 7, 42, 0xdead_beef, 0x1234_5678_9abc] {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut queue = SizedQueue::new();
            for step in 0..5000 {
                if rng.gen_range(0..3) == 0 {
                    queue.dequeue();
                } else {
                    let size = rng.gen_range(0..1000) as f64 / 8.0;
                    queue.enqueue(step, size).unwrap();
                }
                let sum: f64 = queue.sizes().sum();
                assert!((queue.total_size() - sum).abs() < 1e-6);
                assert!(queue.total_size() >= 0.0);
            }
        }
    }

    #[test]
    fn consume_head_shrinks_only_the_oldest_entry() {
        let mut queue = SizedQueue::new();
        queue.enqueue("a", 10.0).unwrap();
        queue.enqueue("b", 5.0).unwrap();
        queue.consume_head(4.0);
        assert_eq!(queue.total_size(), 11.0);
        assert_eq!(queue.sizes().collect::<Vec<_>>(), vec![6.0, 5.0]);
        queue.dequeue();
        assert_eq!(queue.total_size(), 5.0);
    }

    #[test]
    fn reset_empties_the_queue() {
        let mut queue = SizedQueue::new();
        queue.enqueue(1, 3.0).unwrap();
        queue.enqueue(2, 4.0).unwrap();
        queue.reset();
        assert!(queue.is_empty());
        assert_eq!(queue.total_size(), 0.0);
        assert_eq!(queue.dequeue(), None);
    }
}
