use std::fmt;
use std::slice;

use super::{convert, ManagedBuffer, SharedBuffer};
use crate::{Dtype, Error, Result};

/// A cheap value handle over buffer memory: address, length in bytes, an
/// element-type tag, and a reference into the managed/shared layers.
///
/// Chunks share memory through the inner refcounts; cloning a chunk never
/// copies payload bytes. A chunk derived from a [`ManagedBuffer`] keeps the
/// pool slot reserved until every clone drops.
#[derive(Clone, Default)]
pub struct BufferChunk {
    pub address: usize,
    pub length: usize,
    dtype: Dtype,
    buffer: Option<SharedBuffer>,
    managed: Option<ManagedBuffer>,
}

impl BufferChunk {
    pub fn null() -> BufferChunk {
        BufferChunk::default()
    }

    /// Allocate a fresh heap-backed chunk able to hold `elements` elements.
    pub fn alloc(dtype: Dtype, elements: usize) -> Result<BufferChunk> {
        let shared = SharedBuffer::make(elements * dtype.size(), None)?;
        Ok(BufferChunk::from_shared(shared, dtype))
    }

    pub fn from_shared(buffer: SharedBuffer, dtype: Dtype) -> BufferChunk {
        BufferChunk {
            address: buffer.address(),
            length: buffer.length(),
            dtype,
            buffer: Some(buffer),
            managed: None,
        }
    }

    pub fn from_managed(managed: ManagedBuffer, dtype: Dtype) -> BufferChunk {
        let buffer = managed.buffer().clone();
        BufferChunk {
            address: buffer.address(),
            length: buffer.length(),
            dtype,
            buffer: Some(buffer),
            managed: Some(managed),
        }
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn set_dtype(&mut self, dtype: Dtype) {
        self.dtype = dtype;
    }

    /// Number of whole elements in the chunk.
    #[inline]
    pub fn elements(&self) -> usize {
        self.length / self.dtype.size()
    }

    /// End address (non-inclusive).
    #[inline]
    pub fn end(&self) -> usize {
        self.address + self.length
    }

    /// The alias of `address`, nonzero only for circular parents.
    pub fn alias(&self) -> usize {
        match &self.buffer {
            Some(buffer) if buffer.alias() != 0 => {
                self.address + (buffer.alias() - buffer.address())
            }
            _ => 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.address != 0 || self.buffer.is_some()
    }

    pub fn shared(&self) -> Option<&SharedBuffer> {
        self.buffer.as_ref()
    }

    pub fn managed(&self) -> Option<&ManagedBuffer> {
        self.managed.as_ref()
    }

    /// True when no other user copy references this memory. The pool's own
    /// bookkeeping copy is not counted.
    pub fn unique(&self) -> bool {
        match (&self.managed, &self.buffer) {
            (Some(managed), _) => managed.use_count() == 1,
            (None, Some(buffer)) => buffer.use_count() == 1,
            (None, None) => true,
        }
    }

    /// The payload bytes. Empty for the null chunk.
    pub fn as_slice(&self) -> &[u8] {
        if self.address == 0 || self.length == 0 {
            return &[];
        }
        unsafe { slice::from_raw_parts(self.address as *const u8, self.length) }
    }

    /// Writable payload bytes. The runtime only hands writable chunks to
    /// the single producer that checked them out of a manager.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.address == 0 || self.length == 0 {
            return &mut [];
        }
        unsafe { slice::from_raw_parts_mut(self.address as *mut u8, self.length) }
    }

    /// View the payload as `T` elements. The address must be aligned for
    /// `T`, which holds for any chunk advanced in whole elements.
    pub fn as_typed<T: Copy>(&self) -> &[T] {
        let count = self.length / std::mem::size_of::<T>();
        if self.address == 0 || count == 0 {
            return &[];
        }
        debug_assert_eq!(self.address % std::mem::align_of::<T>(), 0);
        unsafe { slice::from_raw_parts(self.address as *const T, count) }
    }

    pub fn as_typed_mut<T: Copy>(&mut self) -> &mut [T] {
        let count = self.length / std::mem::size_of::<T>();
        if self.address == 0 || count == 0 {
            return &mut [];
        }
        debug_assert_eq!(self.address % std::mem::align_of::<T>(), 0);
        unsafe { slice::from_raw_parts_mut(self.address as *mut T, count) }
    }

    /// A fresh chunk of `elements` values converted to `dtype`.
    pub fn convert(&self, dtype: Dtype, elements: usize) -> Result<BufferChunk> {
        convert::convert(self, dtype, elements)
    }

    /// Split into (re, im) chunks of the requested scalar type.
    pub fn convert_complex(&self, dtype: Dtype, elements: usize) -> Result<(BufferChunk, BufferChunk)> {
        convert::convert_complex(self, dtype, elements)
    }

    /// A sub-window of this chunk. Fails outside the chunk's range.
    pub fn window(&self, offset_bytes: usize, length: usize) -> Result<BufferChunk> {
        if offset_bytes + length > self.length {
            return Err(Error::SharedBuffer(format!(
                "window +{}..+{} outside chunk of {} bytes",
                offset_bytes,
                offset_bytes + length,
                self.length
            )));
        }
        let mut out = self.clone();
        out.address += offset_bytes;
        out.length = length;
        Ok(out)
    }
}

impl fmt::Debug for BufferChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferChunk")
            .field("address", &format_args!("{:#x}", self.address))
            .field("length", &self.length)
            .field("dtype", &self.dtype)
            .field("managed", &self.managed.is_some())
            .finish()
    }
}
