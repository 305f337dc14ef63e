use std::fmt;
use std::sync::Arc;

use super::managed::{HookCell, MintTag, ReturnHook};
use super::{BufferChunk, ManagedBuffer, Returned, SharedBuffer};
use crate::util::OrderedQueue;
use crate::{Error, Result};

/// Construction arguments common to every buffer manager.
#[derive(Clone, Debug)]
pub struct BufferManagerArgs {
    /// How many managed buffers the manager mints. A small number suffices:
    /// buffers only need to cover the window between hand-out and return.
    pub num_buffers: usize,
    /// Bytes per managed buffer.
    pub buffer_size: usize,
    /// NUMA node hint for the backing allocation (best effort).
    pub node_affinity: Option<usize>,
}

impl Default for BufferManagerArgs {
    fn default() -> BufferManagerArgs {
        BufferManagerArgs {
            num_buffers: 4,
            buffer_size: 8192,
            node_affinity: None,
        }
    }
}

/// A bounded pool of managed buffers with a queue-like interface.
///
/// `front()` exposes the next writable window without dequeuing; `pop()`
/// commits bytes out of it; `push()` accepts a returned buffer. Managers
/// are owned by a single actor and never mutated off-context — returns
/// from foreign threads arrive through the callback installed with
/// `set_callback`, which routes them back into the owning context.
pub trait BufferManager: Send {
    /// Initialize pools and mint the managed buffers. Idempotent: a second
    /// call is a no-op.
    fn init(&mut self, args: &BufferManagerArgs) -> Result<()>;

    /// True when no buffer is available at the front.
    fn empty(&self) -> bool;

    /// The buffer at the queue head, or `None` when empty.
    fn front(&self) -> Option<&BufferChunk>;

    /// Remove `num_bytes` from the front buffer. Calling with no buffer at
    /// the front is a caller bug (check `empty()` first); `pop(0)` is a
    /// no-op.
    fn pop(&mut self, num_bytes: usize);

    /// Return a buffer to the pool. Fails with a push error when the
    /// buffer was minted by a different manager.
    fn push(&mut self, returned: Returned) -> Result<()>;

    /// Install (or clear) the thread-safe external-return callback.
    fn set_callback(&mut self, hook: Option<ReturnHook>);

    /// Number of buffers minted at init.
    fn capacity(&self) -> usize;
}

impl fmt::Debug for dyn BufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferManager")
            .field("capacity", &self.capacity())
            .field("empty", &self.empty())
            .finish()
    }
}

/// The generic slab manager: `num_buffers` independent slices of one
/// shared allocation.
///
/// Small consumes reuse the front slice (the slice is retired only once a
/// pop takes at least half of what remains); returns pass through an
/// ordered queue so slices become available at `front()` in the order they
/// were originally issued, however pushes arrive.
pub struct SlabBufferManager {
    hook: Arc<HookCell>,
    mint: MintTag,
    buffer_size: usize,
    slots: Vec<SharedBuffer>,
    ready: OrderedQueue<usize>,
    front: Option<BufferChunk>,
    initialized: bool,
}

impl Default for SlabBufferManager {
    fn default() -> SlabBufferManager {
        SlabBufferManager::new()
    }
}

impl SlabBufferManager {
    pub fn new() -> SlabBufferManager {
        SlabBufferManager {
            hook: Arc::new(HookCell::default()),
            mint: MintTag::next(),
            buffer_size: 0,
            slots: Vec::new(),
            ready: OrderedQueue::new(0),
            front: None,
            initialized: false,
        }
    }

    fn refresh_front(&mut self) {
        if self.front.is_some() {
            return;
        }
        if let Some(&index) = self.ready.front() {
            let managed = ManagedBuffer::mint(
                Arc::clone(&self.hook),
                self.mint,
                index,
                self.slots[index].clone(),
            );
            self.front = Some(BufferChunk::from_managed(managed, Default::default()));
        }
    }
}

impl BufferManager for SlabBufferManager {
    fn init(&mut self, args: &BufferManagerArgs) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        if args.num_buffers == 0 || args.buffer_size == 0 {
            return Err(Error::invalid_argument(
                "buffer manager needs nonzero buffer count and size",
            ));
        }
        let slab = SharedBuffer::make(args.num_buffers * args.buffer_size, args.node_affinity)?;
        self.buffer_size = args.buffer_size;
        self.slots = (0..args.num_buffers)
            .map(|i| slab.slice(slab.address() + i * args.buffer_size, args.buffer_size))
            .collect::<Result<Vec<_>>>()?;
        self.ready = OrderedQueue::new(args.num_buffers);
        for i in 0..args.num_buffers {
            self.ready.push(i, i);
        }
        self.refresh_front();
        self.initialized = true;
        Ok(())
    }

    fn empty(&self) -> bool {
        self.front.is_none()
    }

    fn front(&self) -> Option<&BufferChunk> {
        self.front.as_ref()
    }

    fn pop(&mut self, num_bytes: usize) {
        if num_bytes == 0 {
            return;
        }
        let front = match self.front.as_mut() {
            Some(front) => front,
            None => {
                log::error!("pop({}) on an empty slab manager", num_bytes);
                return;
            }
        };

        // re-use the slice for small consumes
        if front.length >= num_bytes * 2 {
            front.address += num_bytes;
            front.length -= num_bytes;
            return;
        }

        self.front = None;
        self.ready.pop();
        self.refresh_front();
    }

    fn push(&mut self, returned: Returned) -> Result<()> {
        if returned.mint != self.mint {
            return Err(Error::BufferPush(
                "buffer was not minted by this manager".into(),
            ));
        }
        self.ready.push(returned.slab_index, returned.slab_index);
        self.refresh_front();
        Ok(())
    }

    fn set_callback(&mut self, hook: Option<ReturnHook>) {
        self.hook.set(hook);
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl fmt::Debug for SlabBufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabBufferManager")
            .field("buffer_size", &self.buffer_size)
            .field("capacity", &self.slots.len())
            .field("empty", &self.empty())
            .finish()
    }
}
