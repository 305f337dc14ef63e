use std::fmt;
use std::sync::Arc;

use super::managed::{HookCell, MintTag, ReturnHook};
use super::{BufferChunk, BufferManager, BufferManagerArgs, ManagedBuffer, Returned, SharedBuffer};
use crate::util::OrderedQueue;
use crate::{Error, Result};

/// A buffer manager over one circularly-aliased allocation of
/// `buffer_size · num_buffers` bytes.
///
/// `front()` exposes a contiguous `buffer_size` window at a moving front
/// address; because the pages are mapped twice back to back, a window that
/// straddles the end still reads and writes as linear memory. Pops
/// accumulate into a pending-byte counter and the front address advances
/// (wrapping) only when the current window retires.
pub struct CircularBufferManager {
    hook: Arc<HookCell>,
    mint: MintTag,
    circ: Option<SharedBuffer>,
    buffer_size: usize,
    front_address: usize,
    bytes_to_pop: usize,
    ready: OrderedQueue<usize>,
    front: Option<BufferChunk>,
    initialized: bool,
}

impl Default for CircularBufferManager {
    fn default() -> CircularBufferManager {
        CircularBufferManager::new()
    }
}

impl CircularBufferManager {
    pub fn new() -> CircularBufferManager {
        CircularBufferManager {
            hook: Arc::new(HookCell::default()),
            mint: MintTag::next(),
            circ: None,
            buffer_size: 0,
            front_address: 0,
            bytes_to_pop: 0,
            ready: OrderedQueue::new(0),
            front: None,
            initialized: false,
        }
    }

    fn refresh_front(&mut self) -> Result<()> {
        if self.front.is_some() {
            return Ok(());
        }
        let circ = match &self.circ {
            Some(circ) => circ,
            None => return Ok(()),
        };
        if let Some(&index) = self.ready.front() {
            let window = circ.slice_circular(self.front_address, self.buffer_size)?;
            let managed = ManagedBuffer::mint(Arc::clone(&self.hook), self.mint, index, window);
            self.front = Some(BufferChunk::from_managed(managed, Default::default()));
        }
        Ok(())
    }
}

impl BufferManager for CircularBufferManager {
    fn init(&mut self, args: &BufferManagerArgs) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        if args.num_buffers == 0 || args.buffer_size == 0 {
            return Err(Error::invalid_argument(
                "buffer manager needs nonzero buffer count and size",
            ));
        }
        let circ =
            SharedBuffer::make_circ(args.buffer_size * args.num_buffers, args.node_affinity)?;
        self.front_address = circ.address();
        // the mapping may have been rounded up to whole pages; spread the
        // extra across the window size so the ring tiles exactly
        self.buffer_size = circ.length() / args.num_buffers;
        self.circ = Some(circ);
        self.ready = OrderedQueue::new(args.num_buffers);
        for i in 0..args.num_buffers {
            self.ready.push(i, i);
        }
        self.refresh_front()?;
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
        let circ = match &self.circ {
            Some(circ) => circ.clone(),
            None => return,
        };
        let front = match self.front.as_mut() {
            Some(front) => front,
            None => {
                log::error!("pop({}) on an empty circular manager", num_bytes);
                return;
            }
        };
        self.bytes_to_pop += num_bytes;

        // re-use the window for small consumes
        if front.length >= num_bytes * 2 {
            front.address += num_bytes;
            front.length -= num_bytes;
            return;
        }

        self.front = None;
        self.ready.pop();

        // advance the front address and adjust for aliasing
        debug_assert!(self.buffer_size >= self.bytes_to_pop);
        self.front_address += self.bytes_to_pop;
        self.bytes_to_pop = 0;
        if self.front_address >= circ.address() + circ.length() {
            self.front_address -= circ.length();
        }

        if let Err(e) = self.refresh_front() {
            log::error!("circular manager failed to rebuild its front window: {}", e);
        }
    }

    fn push(&mut self, returned: Returned) -> Result<()> {
        if returned.mint != self.mint {
            return Err(Error::BufferPush(
                "buffer was not minted by this manager".into(),
            ));
        }
        self.ready.push(returned.slab_index, returned.slab_index);
        self.refresh_front()
    }

    fn set_callback(&mut self, hook: Option<ReturnHook>) {
        self.hook.set(hook);
    }

    fn capacity(&self) -> usize {
        self.ready.capacity()
    }
}

impl fmt::Debug for CircularBufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircularBufferManager")
            .field("buffer_size", &self.buffer_size)
            .field("front_address", &format_args!("{:#x}", self.front_address))
            .field("empty", &self.empty())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::{BufferManager, BufferManagerArgs, CircularBufferManager};
    use crate::Returned;

    fn init_manager(num_buffers: usize) -> CircularBufferManager {
        let mut mgr = CircularBufferManager::new();
        mgr.init(&BufferManagerArgs {
            num_buffers,
            buffer_size: 4096,
            node_affinity: None,
        })
        .unwrap();
        mgr
    }

    fn returned_from(mgr: &CircularBufferManager) -> Returned {
        let managed = mgr.front().unwrap().managed().unwrap();
        Returned {
            slab_index: managed.slab_index(),
            buffer: managed.buffer().clone(),
            mint: managed.mint_tag(),
        }
    }

    #[test]
    fn windows_advance_and_wrap() {
        let mut mgr = init_manager(2);
        let window = mgr.front().unwrap().length;
        let base = mgr.front().unwrap().address;

        // walk a full ring of windows; the front address must land back at
        // the base after num_buffers retirements
        for _ in 0..2 {
            let ret = returned_from(&mgr);
            mgr.pop(window);
            mgr.push(ret).unwrap();
        }
        assert_eq!(mgr.front().unwrap().address, base);
    }

    #[test]
    fn pending_pops_accumulate_until_retirement() {
        let mut mgr = init_manager(2);
        let base = mgr.front().unwrap().address;
        let window = mgr.front().unwrap().length;

        mgr.pop(16); // small: window shrinks in place
        assert_eq!(mgr.front().unwrap().address, base + 16);

        let ret = returned_from(&mgr);
        mgr.pop(window - 16); // retires, advancing by all accumulated bytes
        mgr.push(ret).unwrap();
        assert_eq!(mgr.front().unwrap().address, base + window);
    }

    #[test]
    fn writes_past_the_end_are_visible_at_the_start() {
        let mgr = init_manager(2);
        let circ = mgr.circ.as_ref().unwrap();
        unsafe {
            let p = circ.as_ptr();
            *p.add(circ.length()) = 0x5a; // write through the alias
            assert_eq!(*p, 0x5a);
        }
    }
}
