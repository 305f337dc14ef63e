use std::collections::VecDeque;
use std::fmt;

use super::PortTotals;
use crate::buffer::{BufferChunk, BufferManager};
use crate::{Dtype, Label, Object};

/// The producing endpoint of a flow.
///
/// `produce()` only accumulates a pending count; the commit point is the
/// exit from `work()`, when the owning actor pops the produced bytes from
/// the buffer manager and forwards buffers, labels, and messages to every
/// subscriber. Messages are metered by a sibling token manager so at most
/// K envelopes are un-acknowledged per channel.
pub struct OutputPort {
    pub(crate) index: usize,
    pub(crate) name: String,
    pub(crate) dtype: Dtype,
    pub(crate) domain: String,
    pub(crate) is_signal: bool,
    pub(crate) manager: Option<Box<dyn BufferManager>>,
    pub(crate) token_manager: Option<Box<dyn BufferManager>>,
    pub(crate) pending_elements: usize,
    pub(crate) posted_buffers: VecDeque<BufferChunk>,
    /// Posted labels as (byte offset relative to this work's region, label).
    pub(crate) posted_labels: Vec<(usize, Label)>,
    pub(crate) posted_messages: VecDeque<Object>,
    /// Input port whose buffers this output prefers to reuse in place.
    pub(crate) read_before_write: Option<usize>,
    /// In-place buffer staged from the read-before-write input.
    pub(crate) rbw_staged: Option<BufferChunk>,
    pub(crate) totals: PortTotals,
    /// (actor uid, input index) per connected downstream, mirrored by the
    /// actor's subscriber links.
    pub(crate) downstream_ids: Vec<(usize, usize)>,
}

impl OutputPort {
    pub(crate) fn new(index: usize, name: String, dtype: Dtype, domain: String) -> OutputPort {
        OutputPort {
            index,
            name,
            dtype,
            domain,
            is_signal: false,
            manager: None,
            token_manager: None,
            pending_elements: 0,
            posted_buffers: VecDeque::new(),
            posted_labels: Vec::new(),
            posted_messages: VecDeque::new(),
            read_before_write: None,
            rbw_staged: None,
            totals: PortTotals::default(),
            downstream_ids: Vec::new(),
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

    /// Elements of writable capacity in the current buffer.
    pub fn elements(&self) -> usize {
        self.writable_len() / self.dtype.size()
    }

    fn writable_len(&self) -> usize {
        if let Some(staged) = &self.rbw_staged {
            return staged.length;
        }
        match &self.manager {
            Some(manager) => manager.front().map(|chunk| chunk.length).unwrap_or(0),
            None => 0,
        }
    }

    /// The writable buffer for this work call.
    pub fn buffer(&self) -> BufferChunk {
        if let Some(staged) = &self.rbw_staged {
            return staged.clone();
        }
        match &self.manager {
            Some(manager) => match manager.front() {
                Some(front) => {
                    let mut chunk = front.clone();
                    chunk.set_dtype(self.dtype);
                    chunk
                }
                None => BufferChunk::null(),
            },
            None => BufferChunk::null(),
        }
    }

    /// Declare `num_elements` written into `buffer()`. Not the commit
    /// point: the buffer moves downstream when `work()` exits.
    pub fn produce(&mut self, num_elements: usize) {
        self.pending_elements += num_elements;
    }

    /// Queue a foreign chunk for zero-copy forwarding downstream.
    pub fn post_buffer(&mut self, mut chunk: BufferChunk) {
        chunk.set_dtype(self.dtype);
        self.posted_buffers.push_back(chunk);
    }

    /// Queue a label; `label.index` is in elements relative to the front
    /// of the current output buffer and is normalized to bytes here.
    pub fn post_label(&mut self, label: Label) {
        let offset = label.index * self.dtype.size();
        self.posted_labels.push((offset, label));
    }

    /// Queue an async message, delivered at work exit subject to token
    /// back-pressure.
    pub fn post_message(&mut self, message: Object) {
        self.posted_messages.push_back(message);
    }

    /// Ask the commit path to reuse buffers returning from the given input
    /// port when element sizes match (in-place operation).
    pub fn set_read_before_write(&mut self, input_index: usize) {
        self.read_before_write = Some(input_index);
    }

    pub fn is_signal(&self) -> bool {
        self.is_signal
    }

    pub fn totals(&self) -> PortTotals {
        self.totals
    }

    /***************************************************************
     * runtime-side entry points (actor context only)
     **************************************************************/

    /// An output gates work only when it owns a manager with nothing to
    /// hand out; signal-only and forward-only outputs are always ready.
    pub(crate) fn is_ready(&self) -> bool {
        if self.is_signal || self.rbw_staged.is_some() {
            return true;
        }
        match &self.manager {
            Some(manager) => !manager.empty(),
            None => true,
        }
    }

    pub(crate) fn begin_work(&mut self) {
        self.totals.work_events += 1;
    }
}

impl fmt::Debug for OutputPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputPort")
            .field("name", &self.name)
            .field("dtype", &self.dtype)
            .field("is_signal", &self.is_signal)
            .field("pending_elements", &self.pending_elements)
            .field("subscribers", &self.downstream_ids.len())
            .finish()
    }
}
