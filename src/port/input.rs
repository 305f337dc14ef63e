use std::fmt;

use super::PortTotals;
use crate::buffer::{BufferAccumulator, BufferChunk, ManagedBuffer};
use crate::util::RingDeque;
use crate::{Dtype, Label, Object};

/// Default bound on the async-message queue.
const DEFAULT_MESSAGE_CAPACITY: usize = 1024;

/// A label parked in the port, positioned by absolute byte index within
/// the port's stream.
#[derive(Debug)]
struct StoredLabel {
    byte_index: u64,
    label: Label,
}

/// The receiving endpoint of a flow.
///
/// Holds accumulated buffers (addressable as one contiguous run from the
/// front), parked labels in non-decreasing index order, and a bounded
/// async-message queue. All mutation happens inside the owning actor's
/// context.
pub struct InputPort {
    pub(crate) index: usize,
    pub(crate) name: String,
    pub(crate) dtype: Dtype,
    pub(crate) domain: String,
    pub(crate) is_slot: bool,
    reserve: usize,
    accumulator: BufferAccumulator,
    labels: Vec<StoredLabel>,
    messages: RingDeque<(Object, Option<ManagedBuffer>)>,
    drop_oldest: bool,
    /// Total bytes ever delivered to the accumulator.
    received_bytes: u64,
    /// Total bytes ever consumed.
    consumed_bytes: u64,
    /// Snapshot of `consumed_bytes` taken when the current work call began.
    pub(crate) work_consumed_base: u64,
    totals: PortTotals,
    /// Upstream endpoints, one entry per connected flow.
    pub(crate) upstreams: Vec<(usize, usize)>,
}

impl InputPort {
    pub(crate) fn new(index: usize, name: String, dtype: Dtype, domain: String) -> InputPort {
        InputPort {
            index,
            name,
            dtype,
            domain,
            is_slot: false,
            reserve: 0,
            accumulator: BufferAccumulator::new(),
            labels: Vec::new(),
            messages: RingDeque::new(DEFAULT_MESSAGE_CAPACITY),
            drop_oldest: true,
            received_bytes: 0,
            consumed_bytes: 0,
            work_consumed_base: 0,
            totals: PortTotals::default(),
            upstreams: Vec::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Elements addressable as one contiguous run from the front.
    pub fn elements(&self) -> usize {
        self.accumulator.front_bytes() / self.dtype.size()
    }

    /// A chunk view over the contiguous front run.
    pub fn buffer(&self) -> BufferChunk {
        let mut view = self.accumulator.front();
        view.set_dtype(self.dtype);
        // trim to whole elements
        view.length -= view.length % self.dtype.size();
        view
    }

    /// Advance the front by `num_elements`. Fully consumed interior chunks
    /// drop their pool references, triggering upstream returns.
    pub fn consume(&mut self, num_elements: usize) {
        let bytes = num_elements * self.dtype.size();
        debug_assert!(bytes <= self.accumulator.total_bytes());
        self.accumulator.pop(bytes);
        self.consumed_bytes += bytes as u64;
        self.totals.elements += num_elements as u64;
    }

    /// Minimum elements required before the scheduler considers this port
    /// ready for work.
    pub fn set_reserve(&mut self, num_elements: usize) {
        self.reserve = num_elements;
    }

    pub fn reserve(&self) -> usize {
        self.reserve
    }

    /// Bound the async-message queue; `drop_oldest` selects the overflow
    /// policy (drop oldest vs refuse newest).
    pub fn set_message_capacity(&mut self, capacity: usize, drop_oldest: bool) {
        self.messages = RingDeque::new(capacity);
        self.drop_oldest = drop_oldest;
    }

    pub fn has_message(&self) -> bool {
        !self.messages.is_empty()
    }

    /// Take the next async message. Dropping the returned envelope's
    /// back-pressure token frees one upstream message slot.
    pub fn pop_message(&mut self) -> Object {
        match self.messages.pop_front() {
            Some((object, _token)) => object,
            None => Object::null(),
        }
    }

    /// The labels whose position falls within the currently available
    /// bytes, ordered by index. Indexes are elements relative to the front
    /// of `buffer()`.
    pub fn labels(&self) -> Vec<Label> {
        let visible_end = self.consumed_bytes + self.accumulator.total_bytes() as u64;
        self.labels
            .iter()
            .filter(|stored| {
                stored.byte_index >= self.consumed_bytes && stored.byte_index < visible_end
            })
            .map(|stored| {
                let mut label = stored.label.clone();
                label.index = ((stored.byte_index - self.consumed_bytes) as usize)
                    / self.dtype.size();
                label
            })
            .collect()
    }

    /// Delete a label by identity (as returned from [`InputPort::labels`]).
    pub fn remove_label(&mut self, label: &Label) {
        let size = self.dtype.size();
        let consumed = self.consumed_bytes;
        if let Some(pos) = self.labels.iter().position(|stored| {
            stored.byte_index >= consumed
                && stored.label.id == label.id
                && Object::same(&stored.label.data, &label.data)
                && ((stored.byte_index - consumed) as usize) / size == label.index
        }) {
            self.labels.remove(pos);
        }
    }

    pub fn totals(&self) -> PortTotals {
        self.totals
    }

    /***************************************************************
     * runtime-side entry points (actor context only)
     **************************************************************/

    pub(crate) fn is_ready(&self) -> bool {
        if self.has_message() || self.has_visible_label() {
            return true;
        }
        self.elements() >= std::cmp::max(self.reserve, 1)
    }

    fn has_visible_label(&self) -> bool {
        let visible_end = self.consumed_bytes + self.accumulator.total_bytes() as u64;
        self.labels
            .iter()
            .any(|stored| stored.byte_index >= self.consumed_bytes && stored.byte_index < visible_end)
    }

    pub(crate) fn begin_work(&mut self) {
        self.work_consumed_base = self.consumed_bytes;
        self.totals.work_events += 1;
    }

    /// Bytes consumed by the work call in progress.
    pub(crate) fn consumed_this_work(&self) -> u64 {
        self.consumed_bytes - self.work_consumed_base
    }

    pub(crate) fn deliver_buffer(&mut self, mut chunk: BufferChunk) {
        chunk.set_dtype(self.dtype);
        self.received_bytes += chunk.length as u64;
        self.totals.buffers += 1;
        self.accumulator.push(chunk);
    }

    /// File a label `offset_bytes` past the data received so far. Labels
    /// are sent ahead of the buffer they annotate, so the resulting
    /// position is never behind the available window.
    pub(crate) fn deliver_label(&mut self, offset_bytes: usize, label: Label) {
        let byte_index = self.received_bytes + offset_bytes as u64;
        self.totals.labels += 1;
        // keep non-decreasing order; arrivals are nearly sorted already
        let pos = self
            .labels
            .iter()
            .rposition(|stored| stored.byte_index <= byte_index)
            .map(|p| p + 1)
            .unwrap_or(0);
        self.labels.insert(pos, StoredLabel { byte_index, label });
    }

    pub(crate) fn deliver_message(&mut self, object: Object, token: Option<ManagedBuffer>) {
        self.totals.messages += 1;
        if self.drop_oldest {
            if let Some(dropped) = self.messages.push_back_drop_front((object, token)) {
                log::warn!(
                    "input port {} overflowed; dropped oldest message {}",
                    self.name,
                    dropped.0
                );
            }
        } else if let Err(refused) = self.messages.push_back((object, token)) {
            log::warn!(
                "input port {} overflowed; refused message {}",
                self.name,
                refused.0
            );
        }
    }

    /// Remove and return the labels swept past by the work call that just
    /// ended, with indexes rebased to elements relative to the consumed
    /// region's start. These feed label propagation.
    pub(crate) fn take_consumed_labels(&mut self) -> Vec<Label> {
        let consumed_end = self.consumed_bytes;
        let base = self.work_consumed_base;
        if consumed_end == base {
            return Vec::new();
        }
        let size = self.dtype.size();
        let mut taken = Vec::new();
        self.labels.retain(|stored| {
            if stored.byte_index < consumed_end {
                let mut label = stored.label.clone();
                label.index = (stored.byte_index.saturating_sub(base) as usize) / size;
                taken.push(label);
                false
            } else {
                true
            }
        });
        taken
    }
}

impl fmt::Debug for InputPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputPort")
            .field("name", &self.name)
            .field("dtype", &self.dtype)
            .field("elements", &self.elements())
            .field("labels", &self.labels.len())
            .field("messages", &self.messages.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::InputPort;
    use crate::{BufferChunk, Dtype, Label, Object, Scalar};

    fn port() -> InputPort {
        InputPort::new(0, "0".into(), Dtype::new(Scalar::I32), String::new())
    }

    fn chunk(values: &[i32]) -> BufferChunk {
        let mut chunk = BufferChunk::alloc(Dtype::new(Scalar::I32), values.len()).unwrap();
        chunk.as_typed_mut::<i32>().copy_from_slice(values);
        chunk
    }

    #[test]
    fn accumulates_elements_and_consumes() {
        let mut port = port();
        port.deliver_buffer(chunk(&[1, 2, 3, 4]));
        assert_eq!(port.elements(), 4);
        assert_eq!(port.buffer().as_typed::<i32>(), &[1, 2, 3, 4]);

        port.consume(3);
        assert_eq!(port.elements(), 1);
        assert_eq!(port.totals().elements, 3);
    }

    #[test]
    fn reserve_gates_readiness() {
        let mut port = port();
        assert!(!port.is_ready());
        port.deliver_buffer(chunk(&[1, 2]));
        assert!(port.is_ready());
        port.set_reserve(4);
        assert!(!port.is_ready());
        port.deliver_buffer(chunk(&[3, 4]));
        // two chunks may not be contiguous; readiness needs a contiguous run
        if port.elements() >= 4 {
            assert!(port.is_ready());
        }
    }

    #[test]
    fn labels_hide_until_data_arrives() {
        let mut port = port();
        port.deliver_label(0, Label::new("now", Object::from(1u8), 0));
        port.deliver_label(8, Label::new("later", Object::from(2u8), 0));
        assert!(port.labels().is_empty()); // no data yet

        port.deliver_buffer(chunk(&[10]));
        let visible: Vec<String> = port.labels().iter().map(|l| l.id.clone()).collect();
        assert_eq!(visible, ["now"]);

        port.deliver_buffer(chunk(&[11, 12]));
        let visible = port.labels();
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[1].id, "later");
        assert_eq!(visible[1].index, 2); // 8 bytes = 2 int32 elements
    }

    #[test]
    fn remove_label_by_identity() {
        let mut port = port();
        port.deliver_buffer(chunk(&[5, 6]));
        port.deliver_label(0, Label::new("a", Object::from(1u8), 0));
        let visible = port.labels();
        port.remove_label(&visible[0]);
        assert!(port.labels().is_empty());
    }

    #[test]
    fn consumed_labels_are_swept_for_propagation() {
        let mut port = port();
        port.deliver_label(0, Label::new("head", Object::from(1u8), 0));
        port.deliver_label(4, Label::new("tail", Object::from(2u8), 0));
        port.deliver_buffer(chunk(&[1, 2, 3]));

        port.begin_work();
        port.consume(1);
        let swept = port.take_consumed_labels();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, "head");
        assert_eq!(swept[0].index, 0);

        port.begin_work();
        port.consume(2);
        let swept = port.take_consumed_labels();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, "tail");
        assert_eq!(swept[0].index, 0); // 4 bytes past the new work base
    }

    #[test]
    fn message_queue_drops_oldest() {
        let mut port = port();
        port.set_message_capacity(2, true);
        port.deliver_message(Object::from(1i32), None);
        port.deliver_message(Object::from(2i32), None);
        port.deliver_message(Object::from(3i32), None);
        assert_eq!(port.pop_message().as_i64().unwrap(), 2);
        assert_eq!(port.pop_message().as_i64().unwrap(), 3);
        assert!(!port.has_message());
        assert!(port.pop_message().is_null());
        assert_eq!(port.totals().messages, 3);
    }
}
