use std::collections::VecDeque;
use std::fmt;

use super::BufferChunk;

/// The input-side FIFO of buffer chunks.
///
/// Consecutive chunks that are contiguous in memory coalesce logically, so
/// the caller can address the front of the accumulator as one run:
/// `front()` reports a chunk whose address is the head's address and whose
/// length is the sum of the contiguous lengths. Consuming past a chunk
/// boundary drops that chunk's pool reference, which is what triggers the
/// upstream external-return path.
#[derive(Default)]
pub struct BufferAccumulator {
    queue: VecDeque<BufferChunk>,
    total_bytes: usize,
}

impl BufferAccumulator {
    pub fn new() -> BufferAccumulator {
        BufferAccumulator::default()
    }

    /// Total buffered bytes, contiguous or not.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }

    pub fn push(&mut self, chunk: BufferChunk) {
        if chunk.length == 0 {
            return;
        }
        self.total_bytes += chunk.length;

        // extend the back chunk in place when the new one continues the
        // same managed window (successive pops of a re-used slice)
        if let Some(back) = self.queue.back_mut() {
            let same_window = match (back.managed(), chunk.managed()) {
                (Some(a), Some(b)) => super::ManagedBuffer::same(a, b),
                _ => false,
            };
            if same_window && back.end() == chunk.address {
                back.length += chunk.length;
                return;
            }
        }
        self.queue.push_back(chunk);
    }

    /// Bytes addressable as one contiguous run from the front.
    pub fn front_bytes(&self) -> usize {
        let mut iter = self.queue.iter();
        let front = match iter.next() {
            Some(front) => front,
            None => return 0,
        };
        let mut run = front.length;
        let mut end = front.end();
        for chunk in iter {
            if chunk.address != end {
                break;
            }
            run += chunk.length;
            end = chunk.end();
        }
        run
    }

    /// A view over the contiguous front run. The view shares the head
    /// chunk's references; the accumulator itself keeps the rest of the
    /// run alive.
    pub fn front(&self) -> BufferChunk {
        match self.queue.front() {
            Some(head) => {
                let mut view = head.clone();
                view.length = self.front_bytes();
                view
            }
            None => BufferChunk::null(),
        }
    }

    /// Advance the front by `num_bytes`, dropping fully consumed chunks.
    pub fn pop(&mut self, mut num_bytes: usize) {
        debug_assert!(num_bytes <= self.total_bytes);
        num_bytes = num_bytes.min(self.total_bytes);
        self.total_bytes -= num_bytes;

        while num_bytes > 0 {
            let front = match self.queue.front_mut() {
                Some(front) => front,
                None => return,
            };
            if num_bytes >= front.length {
                num_bytes -= front.length;
                self.queue.pop_front();
            } else {
                front.address += num_bytes;
                front.length -= num_bytes;
                return;
            }
        }
    }
}

impl fmt::Debug for BufferAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferAccumulator")
            .field("chunks", &self.queue.len())
            .field("total_bytes", &self.total_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::BufferAccumulator;
    use crate::{BufferChunk, Dtype, Scalar};

    fn chunk_with(values: &[u8]) -> BufferChunk {
        let mut chunk = BufferChunk::alloc(Dtype::new(Scalar::U8), values.len()).unwrap();
        chunk.as_mut_slice().copy_from_slice(values);
        chunk
    }

    #[test]
    fn accumulates_and_consumes() {
        let mut acc = BufferAccumulator::new();
        assert!(acc.is_empty());
        acc.push(chunk_with(&[1, 2, 3]));
        acc.push(chunk_with(&[4, 5]));
        assert_eq!(acc.total_bytes(), 5);

        // separate allocations rarely happen to be adjacent; the front run
        // covers at least the head chunk
        assert!(acc.front_bytes() >= 3);
        assert_eq!(acc.front().as_slice()[0], 1);

        acc.pop(2);
        assert_eq!(acc.total_bytes(), 3);
        assert_eq!(acc.front().as_slice()[0], 3);

        acc.pop(3);
        assert!(acc.is_empty());
        assert!(!acc.front().is_valid());
    }

    #[test]
    fn contiguous_windows_coalesce() {
        // carve two adjacent windows out of one chunk; they share the
        // underlying buffer and sit back to back in memory
        let parent = chunk_with(&[9, 8, 7, 6]);
        let a = parent.window(0, 2).unwrap();
        let b = parent.window(2, 2).unwrap();

        let mut acc = BufferAccumulator::new();
        acc.push(a);
        acc.push(b);
        assert_eq!(acc.front_bytes(), 4);
        assert_eq!(acc.front().as_slice(), &[9, 8, 7, 6]);
    }

    #[test]
    fn popping_a_boundary_drops_the_head() {
        let mut acc = BufferAccumulator::new();
        let head = chunk_with(&[1, 1]);
        let probe = head.clone();
        acc.push(head);
        acc.push(chunk_with(&[2, 2]));

        assert!(!probe.unique());
        acc.pop(2);
        assert!(probe.unique()); // accumulator released the head chunk
    }
}
