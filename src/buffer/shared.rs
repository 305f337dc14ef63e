use std::alloc::{self, Layout};
use std::fmt;
use std::sync::Arc;

use crate::{Error, Result};

/// A reference-counted allocation of raw memory.
///
/// A `SharedBuffer` is either the whole allocation or a slice of one; all
/// copies and slices share the owner's refcount and the memory is released
/// when the last copy drops. Circular buffers map their pages twice at
/// consecutive addresses so a reader can walk linearly past the end; the
/// second mapping is exposed through [`SharedBuffer::alias`].
#[derive(Clone)]
pub struct SharedBuffer {
    owner: Arc<Owner>,
    address: usize,
    length: usize,
}

struct Owner {
    base: usize,
    length: usize,
    alias: usize,
    alloc: Alloc,
}

enum Alloc {
    Empty,
    Heap(Layout),
    #[cfg(unix)]
    Mapped {
        total: usize,
    },
}

// The raw addresses are plain memory owned by this process; access
// discipline is the callers' responsibility, as with any allocator.
unsafe impl Send for Owner {}
unsafe impl Sync for Owner {}

const HEAP_ALIGN: usize = 64;

impl SharedBuffer {
    /// Allocate `size` bytes of page-aligned heap memory (alignment is at
    /// least 16). The NUMA `node_affinity` hint is best effort; failing to
    /// honor it is never an error. Zero-size allocations succeed and yield
    /// a valid empty buffer.
    pub fn make(size: usize, node_affinity: Option<usize>) -> Result<SharedBuffer> {
        if let Some(node) = node_affinity {
            log::debug!("shared buffer affinity hint node={} (best effort)", node);
        }
        if size == 0 {
            return Ok(SharedBuffer::empty());
        }
        let layout = Layout::from_size_align(size, HEAP_ALIGN)
            .map_err(|e| Error::SharedBuffer(e.to_string()))?;
        let ptr = unsafe { alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(Error::SharedBuffer(format!(
                "allocation of {} bytes failed",
                size
            )));
        }
        Ok(SharedBuffer::from_owner(Owner {
            base: ptr as usize,
            length: size,
            alias: 0,
            alloc: Alloc::Heap(layout),
        }))
    }

    /// Allocate at least `size` bytes of circularly-aliased memory: the
    /// backing pages appear twice at consecutive virtual addresses, so
    /// `alias() == address() + length()` reads the same bytes as
    /// `address()`. The length is rounded up to a whole number of pages.
    #[cfg(unix)]
    pub fn make_circ(size: usize, node_affinity: Option<usize>) -> Result<SharedBuffer> {
        if let Some(node) = node_affinity {
            log::debug!("circular buffer affinity hint node={} (best effort)", node);
        }
        if size == 0 {
            return Ok(SharedBuffer::empty());
        }
        let page = page_size();
        let length = (size + page - 1) / page * page;
        let owner = unsafe { map_circular(length) }?;
        Ok(SharedBuffer::from_owner(owner))
    }

    #[cfg(not(unix))]
    pub fn make_circ(_size: usize, _node_affinity: Option<usize>) -> Result<SharedBuffer> {
        Err(Error::SharedBuffer(
            "circular buffers require memory mapping support".into(),
        ))
    }

    /// Map an entire file. Writes reach the file iff `writable && shared`.
    #[cfg(unix)]
    pub fn make_from_file(path: &std::path::Path, writable: bool, shared: bool) -> Result<SharedBuffer> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;
        let length = file.metadata()?.len() as usize;
        if length == 0 {
            return Ok(SharedBuffer::empty());
        }

        let prot = libc::PROT_READ | if writable { libc::PROT_WRITE } else { 0 };
        let flags = if shared {
            libc::MAP_SHARED
        } else {
            libc::MAP_PRIVATE
        };
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                length,
                prot,
                flags,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(SharedBuffer::from_owner(Owner {
            base: ptr as usize,
            length,
            alias: 0,
            alloc: Alloc::Mapped { total: length },
        }))
    }

    #[cfg(not(unix))]
    pub fn make_from_file(
        _path: &std::path::Path,
        _writable: bool,
        _shared: bool,
    ) -> Result<SharedBuffer> {
        Err(Error::SharedBuffer(
            "file buffers require memory mapping support".into(),
        ))
    }

    /// A slice sharing this buffer's refcount. Fails when the requested
    /// range is not contained in `self`.
    pub fn slice(&self, address: usize, length: usize) -> Result<SharedBuffer> {
        if address < self.address || address + length > self.address + self.length {
            return Err(Error::SharedBuffer(format!(
                "slice [{:#x}, +{}) outside parent [{:#x}, +{})",
                address, length, self.address, self.length
            )));
        }
        Ok(SharedBuffer {
            owner: Arc::clone(&self.owner),
            address,
            length,
        })
    }

    /// A slice that may extend past the end of a circular parent, into the
    /// alias mapping. Bounded by twice the parent length.
    pub(crate) fn slice_circular(&self, address: usize, length: usize) -> Result<SharedBuffer> {
        if self.owner.alias == 0 {
            return self.slice(address, length);
        }
        let base = self.owner.base;
        let total = self.owner.length;
        if address < base || address + length > base + 2 * total {
            return Err(Error::SharedBuffer(format!(
                "circular slice [{:#x}, +{}) outside doubly-mapped [{:#x}, +{})",
                address,
                length,
                base,
                2 * total
            )));
        }
        Ok(SharedBuffer {
            owner: Arc::clone(&self.owner),
            address,
            length,
        })
    }

    fn empty() -> SharedBuffer {
        SharedBuffer::from_owner(Owner {
            base: 0,
            length: 0,
            alias: 0,
            alloc: Alloc::Empty,
        })
    }

    fn from_owner(owner: Owner) -> SharedBuffer {
        let address = owner.base;
        let length = owner.length;
        SharedBuffer {
            owner: Arc::new(owner),
            address,
            length,
        }
    }

    #[inline]
    pub fn address(&self) -> usize {
        self.address
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    /// End address (non-inclusive).
    #[inline]
    pub fn end(&self) -> usize {
        self.address + self.length
    }

    /// The second-mapping address of `address()`, or 0 for non-circular
    /// buffers.
    pub fn alias(&self) -> usize {
        if self.owner.alias == 0 {
            0
        } else {
            self.address + (self.owner.alias - self.owner.base)
        }
    }

    /// Number of live copies (slices included).
    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.owner)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.address as *mut u8
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("address", &format_args!("{:#x}", self.address))
            .field("length", &self.length)
            .field("alias", &format_args!("{:#x}", self.alias()))
            .finish()
    }
}

impl Drop for Owner {
    fn drop(&mut self) {
        match self.alloc {
            Alloc::Empty => {}
            Alloc::Heap(layout) => unsafe {
                alloc::dealloc(self.base as *mut u8, layout);
            },
            #[cfg(unix)]
            Alloc::Mapped { total } => unsafe {
                libc::munmap(self.base as *mut libc::c_void, total);
            },
        }
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Create the double mapping: reserve 2×`length` of address space, then
/// map the same file pages into both halves.
#[cfg(unix)]
unsafe fn map_circular(length: usize) -> Result<Owner> {
    let fd = circular_fd(length)?;

    let total = length * 2;
    let base = libc::mmap(
        std::ptr::null_mut(),
        total,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if base == libc::MAP_FAILED {
        libc::close(fd);
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_SHARED | libc::MAP_FIXED;
    let first = libc::mmap(base, length, prot, flags, fd, 0);
    let second = libc::mmap(
        (base as usize + length) as *mut libc::c_void,
        length,
        prot,
        flags,
        fd,
        0,
    );
    libc::close(fd);
    if first == libc::MAP_FAILED || second == libc::MAP_FAILED {
        libc::munmap(base, total);
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    Ok(Owner {
        base: base as usize,
        length,
        alias: base as usize + length,
        alloc: Alloc::Mapped { total },
    })
}

/// An anonymous file descriptor of `length` bytes to back both mappings.
#[cfg(target_os = "linux")]
unsafe fn circular_fd(length: usize) -> Result<libc::c_int> {
    let name = b"runnel-circ\0";
    let fd = libc::memfd_create(name.as_ptr() as *const libc::c_char, 0);
    if fd < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    if libc::ftruncate(fd, length as libc::off_t) != 0 {
        let err = std::io::Error::last_os_error();
        libc::close(fd);
        return Err(Error::Io(err));
    }
    Ok(fd)
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn circular_fd(length: usize) -> Result<libc::c_int> {
    let mut template = *b"/tmp/runnel-circ-XXXXXX\0";
    let fd = libc::mkstemp(template.as_mut_ptr() as *mut libc::c_char);
    if fd < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    libc::unlink(template.as_ptr() as *const libc::c_char);
    if libc::ftruncate(fd, length as libc::off_t) != 0 {
        let err = std::io::Error::last_os_error();
        libc::close(fd);
        return Err(Error::Io(err));
    }
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::SharedBuffer;

    #[test]
    fn generic_allocation() {
        let b0 = SharedBuffer::make(1024, None).unwrap();
        assert_ne!(b0.address(), 0);
        assert_eq!(b0.address() & 0xf, 0); // has alignment
        assert_eq!(b0.length(), 1024);
        assert_eq!(b0.alias(), 0);

        unsafe {
            for i in 0..b0.length() {
                *b0.as_ptr().add(i) = (i & 0xff) as u8;
            }
            assert_eq!(*b0.as_ptr().add(1023), 0xff);
        }
    }

    #[test]
    fn zero_size_allocation_succeeds() {
        let b = SharedBuffer::make(0, None).unwrap();
        assert_eq!(b.length(), 0);
    }

    #[test]
    fn slice_shares_and_checks_range() {
        let parent = SharedBuffer::make(2048, Some(0)).unwrap();
        assert!(parent.slice(parent.address() + 512, parent.length()).is_err());
        let child = parent
            .slice(parent.address() + 512, parent.length() - 512)
            .unwrap();
        assert_eq!(child.end(), parent.end());
        assert_eq!(parent.use_count(), 2);
        drop(child);
        assert_eq!(parent.use_count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn circular_alias_reads_identically() {
        let b0 = SharedBuffer::make_circ(1024, None).unwrap();
        assert_ne!(b0.address(), 0);
        assert!(b0.length() >= 1024);
        assert_eq!(b0.alias(), b0.address() + b0.length());

        unsafe {
            let p = b0.as_ptr();
            let alias = b0.alias() as *mut u8;
            for i in 0..b0.length() {
                *p.add(i) = (i % 251) as u8;
            }
            for i in 0..b0.length() {
                assert_eq!(*p.add(i), *alias.add(i));
            }
        }
    }

    #[cfg(unix)]
    #[test]
    fn file_mapping_round_trip() {
        use std::io::Write;

        let dir = std::env::temp_dir();
        let path = dir.join(format!("runnel-mmap-test-{}", std::process::id()));
        {
            let mut file = std::fs::File::create(&path).unwrap();
            file.write_all(&[7u8; 64]).unwrap();
        }

        {
            let map = SharedBuffer::make_from_file(&path, true, true).unwrap();
            assert_eq!(map.length(), 64);
            unsafe {
                assert_eq!(*map.as_ptr(), 7);
                *map.as_ptr() = 9; // visible in the file: writable && shared
            }
        }

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes[0], 9);
        assert_eq!(bytes[1], 7);
        std::fs::remove_file(&path).unwrap();
    }
}
