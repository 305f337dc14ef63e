use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::SharedBuffer;

/// Callback installed by the owning actor to receive buffers released from
/// foreign threads. Invoked from whatever thread drops the last clone.
pub type ReturnHook = Arc<dyn Fn(Returned) + Send + Sync>;

/// Record describing a managed buffer on its way back to the pool.
#[derive(Clone)]
pub struct Returned {
    pub slab_index: usize,
    pub buffer: SharedBuffer,
    pub(crate) mint: MintTag,
}

impl fmt::Debug for Returned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Returned")
            .field("slab_index", &self.slab_index)
            .finish()
    }
}

/// Identifies which manager minted a buffer, so foreign returns can be
/// rejected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MintTag(usize);

impl MintTag {
    pub(crate) fn next() -> MintTag {
        static COUNTER: AtomicUsize = AtomicUsize::new(1);
        MintTag(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// The shared slot between a manager and the buffers it minted: the
/// external-return callback lives here so in-flight buffers observe hook
/// changes and survive manager teardown.
#[derive(Default)]
pub(crate) struct HookCell {
    callback: Mutex<Option<ReturnHook>>,
}

impl HookCell {
    pub(crate) fn set(&self, hook: Option<ReturnHook>) {
        *self.callback.lock().unwrap_or_else(|e| e.into_inner()) = hook;
    }

    fn fire(&self, returned: Returned) -> Option<Returned> {
        let guard = self.callback.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(hook) => {
                hook(returned);
                None
            }
            None => Some(returned),
        }
    }
}

/// A buffer window owned by a pool.
///
/// While any clone is alive the pool slot stays reserved; when the last
/// clone drops, the minting manager is notified through its external-return
/// hook, which may run on any thread. The manager itself is only ever
/// mutated from its owning actor context — the hook routes the return
/// there.
#[derive(Clone)]
pub struct ManagedBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    slab_index: usize,
    buffer: SharedBuffer,
    mint: MintTag,
    hook: Arc<HookCell>,
}

impl ManagedBuffer {
    pub(crate) fn mint(
        hook: Arc<HookCell>,
        mint: MintTag,
        slab_index: usize,
        buffer: SharedBuffer,
    ) -> ManagedBuffer {
        ManagedBuffer {
            inner: Arc::new(Inner {
                slab_index,
                buffer,
                mint,
                hook,
            }),
        }
    }

    /// Slot index, unique within the minting manager.
    pub fn slab_index(&self) -> usize {
        self.inner.slab_index
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.inner.buffer
    }

    pub(crate) fn mint_tag(&self) -> MintTag {
        self.inner.mint
    }

    /// Number of live clones.
    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Two handles over the same pool slot checkout.
    pub fn same(a: &ManagedBuffer, b: &ManagedBuffer) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for ManagedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedBuffer")
            .field("slab_index", &self.inner.slab_index)
            .field("use_count", &self.use_count())
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let returned = Returned {
            slab_index: self.slab_index,
            buffer: self.buffer.clone(),
            mint: self.mint,
        };
        if self.hook.fire(returned).is_some() {
            // No hook installed: the pool is gone or still initializing;
            // the memory is released with the SharedBuffer refcount.
            log::trace!("managed buffer slot {} dropped without a pool", self.slab_index);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{HookCell, ManagedBuffer, MintTag};
    use crate::SharedBuffer;

    #[test]
    fn last_drop_fires_the_hook_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hook_hits = Arc::clone(&hits);
        let cell = Arc::new(HookCell::default());
        cell.set(Some(Arc::new(move |ret| {
            assert_eq!(ret.slab_index, 3);
            hook_hits.fetch_add(1, Ordering::SeqCst);
        })));

        let shared = SharedBuffer::make(128, None).unwrap();
        let buffer = ManagedBuffer::mint(Arc::clone(&cell), MintTag::next(), 3, shared);
        let copy = buffer.clone();
        assert_eq!(buffer.use_count(), 2);

        drop(buffer);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        drop(copy);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_without_hook_is_silent() {
        let cell = Arc::new(HookCell::default());
        let shared = SharedBuffer::make(64, None).unwrap();
        let buffer = ManagedBuffer::mint(cell, MintTag::next(), 0, shared);
        drop(buffer);
    }
}
