// This module owns the executable memory behind the code buffers. ExecMemory abstracts a fixed
// size region with page granular protection changes: MmapMemory maps anonymous memory with libc
// and flips pages between read+write and read+execute with mprotect, while SimulatedMemory keeps
// the bytes in a vector and models the page permission table in software, recording every write
// that lands on a page that is not currently writable. The simulated region lets the whole JIT run
// in tests on any host without executing generated code, and makes the write-xor-execute rule
// observable. A page is only ever in one of the two states, so it can never be writable and
// executable at once.

//! Executable memory regions and page protection.

use crate::core::error::{JitError, JitResult};
use parking_lot::Mutex;

/// Protection state of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadWrite,
    ReadExec,
}

/// A fixed size memory region that generated code is written into.
pub trait ExecMemory: Send + Sync {
    /// Address of the first byte of the region.
    fn base_addr(&self) -> usize;

    /// Size of the region in bytes.
    fn size(&self) -> usize;

    fn page_size(&self) -> usize;

    /// Change the protection of `[offset, offset + len)`. Both ends must be page aligned.
    fn protect(&self, offset: usize, len: usize, prot: Protection) -> JitResult<()>;

    /// Store one byte. The containing page must be writable.
    fn write_byte(&self, offset: usize, byte: u8);

    fn read_byte(&self, offset: usize) -> u8;

    fn fill(&self, offset: usize, len: usize, byte: u8) {
        for i in offset..offset + len {
            self.write_byte(i, byte);
        }
    }

    fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        (offset..offset + len).map(|i| self.read_byte(i)).collect()
    }
}

/// Round `size` up to a multiple of `page_size`.
pub fn page_align_up(size: usize, page_size: usize) -> usize {
    size.div_ceil(page_size) * page_size
}

/// Anonymous memory mapping from the operating system.
pub struct MmapMemory {
    ptr: std::ptr::NonNull<u8>,
    size: usize,
    page_size: usize,
}

// The mapping is only mutated through the code buffers, which the JIT lock serializes.
unsafe impl Send for MmapMemory {}
unsafe impl Sync for MmapMemory {}

impl MmapMemory {
    /// Map `size` bytes (rounded up to whole pages), initially read+execute.
    #[cfg(unix)]
    pub fn new(size: usize) -> JitResult<Self> {
        let page_size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 => n as usize,
            _ => 4096,
        };
        let size = page_align_up(size.max(2 * page_size), page_size);

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(JitError::OutOfMemory {
                requested: size,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }

        let ptr = std::ptr::NonNull::new(addr as *mut u8).ok_or(JitError::OutOfMemory {
            requested: size,
            reason: "mmap returned null".to_string(),
        })?;

        log::debug!("Mapped {} bytes of executable memory at {:p}", size, addr);

        Ok(Self {
            ptr,
            size,
            page_size,
        })
    }

    #[cfg(not(unix))]
    pub fn new(size: usize) -> JitResult<Self> {
        Err(JitError::OutOfMemory {
            requested: size,
            reason: "executable mappings are only supported on unix".to_string(),
        })
    }
}

impl ExecMemory for MmapMemory {
    fn base_addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    fn size(&self) -> usize {
        self.size
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    #[cfg(unix)]
    fn protect(&self, offset: usize, len: usize, prot: Protection) -> JitResult<()> {
        let flags = match prot {
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadExec => libc::PROT_READ | libc::PROT_EXEC,
        };

        debug_assert!(offset + len <= self.size);
        let page = unsafe { self.ptr.as_ptr().add(offset) };
        let ret = unsafe { libc::mprotect(page as *mut libc::c_void, len, flags) };
        if ret != 0 {
            return Err(JitError::Protection {
                op: match prot {
                    Protection::ReadWrite => "make writable",
                    Protection::ReadExec => "make executable",
                },
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn protect(&self, _offset: usize, _len: usize, _prot: Protection) -> JitResult<()> {
        Err(JitError::Protection {
            op: "mprotect",
            reason: "unsupported platform".to_string(),
        })
    }

    fn write_byte(&self, offset: usize, byte: u8) {
        assert!(offset < self.size, "write past the end of the mapping");
        unsafe { self.ptr.as_ptr().add(offset).write(byte) }
    }

    fn read_byte(&self, offset: usize) -> u8 {
        assert!(offset < self.size, "read past the end of the mapping");
        unsafe { self.ptr.as_ptr().add(offset).read() }
    }

    fn fill(&self, offset: usize, len: usize, byte: u8) {
        assert!(offset + len <= self.size, "fill past the end of the mapping");
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr().add(offset), byte, len) }
    }
}

impl Drop for MmapMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

/// A write that hit a page which was not writable at the time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteViolation {
    pub offset: usize,
    pub page: usize,
    pub protection: Protection,
}

struct SimState {
    bytes: Vec<u8>,
    pages: Vec<Protection>,
    violations: Vec<WriteViolation>,
    protect_calls: usize,
}

/// Software model of an executable region with a page permission table.
pub struct SimulatedMemory {
    base: usize,
    page_size: usize,
    state: Mutex<SimState>,
}

impl SimulatedMemory {
    pub const DEFAULT_BASE: usize = 0x1000_0000;
    pub const PAGE_SIZE: usize = 4096;

    pub fn new(size: usize) -> Self {
        Self::with_base(Self::DEFAULT_BASE, size)
    }

    pub fn with_base(base: usize, size: usize) -> Self {
        let size = page_align_up(size.max(2 * Self::PAGE_SIZE), Self::PAGE_SIZE);
        let num_pages = size / Self::PAGE_SIZE;
        Self {
            base,
            page_size: Self::PAGE_SIZE,
            state: Mutex::new(SimState {
                bytes: vec![0; size],
                pages: vec![Protection::ReadExec; num_pages],
                violations: Vec::new(),
                protect_calls: 0,
            }),
        }
    }

    /// Writes that happened while their page was not writable.
    pub fn violations(&self) -> Vec<WriteViolation> {
        self.state.lock().violations.clone()
    }

    /// Number of protection changes requested so far.
    pub fn protect_calls(&self) -> usize {
        self.state.lock().protect_calls
    }

    pub fn page_protection(&self, page: usize) -> Protection {
        self.state.lock().pages[page]
    }

    pub fn page_of(&self, offset: usize) -> usize {
        offset / self.page_size
    }
}

impl ExecMemory for SimulatedMemory {
    fn base_addr(&self) -> usize {
        self.base
    }

    fn size(&self) -> usize {
        self.state.lock().bytes.len()
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn protect(&self, offset: usize, len: usize, prot: Protection) -> JitResult<()> {
        let mut state = self.state.lock();
        if offset % self.page_size != 0 || offset + len > state.bytes.len() {
            return Err(JitError::Protection {
                op: "protect",
                reason: format!("range [{offset:#x}, {:#x}) is not page aligned or in bounds", offset + len),
            });
        }

        let first = offset / self.page_size;
        let last = (offset + len).div_ceil(self.page_size);
        for page in &mut state.pages[first..last] {
            *page = prot;
        }
        state.protect_calls += 1;
        Ok(())
    }

    fn write_byte(&self, offset: usize, byte: u8) {
        let mut state = self.state.lock();
        let page = offset / self.page_size;
        let protection = state.pages[page];
        if protection != Protection::ReadWrite {
            state.violations.push(WriteViolation {
                offset,
                page,
                protection,
            });
            return;
        }
        state.bytes[offset] = byte;
    }

    fn read_byte(&self, offset: usize) -> u8 {
        self.state.lock().bytes[offset]
    }

    fn fill(&self, offset: usize, len: usize, byte: u8) {
        let mut state = self.state.lock();
        let page_size = self.page_size;
        for i in offset..offset + len {
            let page = i / page_size;
            let protection = state.pages[page];
            if protection != Protection::ReadWrite {
                state.violations.push(WriteViolation {
                    offset: i,
                    page,
                    protection,
                });
                continue;
            }
            state.bytes[i] = byte;
        }
    }

    fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        self.state.lock().bytes[offset..offset + len].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_write_requires_writable_page() {
        let mem = SimulatedMemory::new(3 * SimulatedMemory::PAGE_SIZE);
        mem.write_byte(10, 0xAA);
        assert_eq!(mem.violations().len(), 1);
        assert_eq!(mem.read_byte(10), 0);

        mem.protect(0, SimulatedMemory::PAGE_SIZE, Protection::ReadWrite)
            .unwrap();
        mem.write_byte(10, 0xAA);
        assert_eq!(mem.read_byte(10), 0xAA);
        assert_eq!(mem.violations().len(), 1);

        // Second page is still executable
        mem.write_byte(SimulatedMemory::PAGE_SIZE + 1, 1);
        let v = mem.violations();
        assert_eq!(v.len(), 2);
        assert_eq!(v[1].page, 1);
        assert_eq!(v[1].protection, Protection::ReadExec);
    }

    #[test]
    fn test_simulated_protect_rejects_unaligned() {
        let mem = SimulatedMemory::new(2 * SimulatedMemory::PAGE_SIZE);
        assert!(mem.protect(3, 16, Protection::ReadWrite).is_err());
        assert_eq!(mem.protect_calls(), 0);
    }

    #[test]
    fn test_page_align_up() {
        assert_eq!(page_align_up(1, 4096), 4096);
        assert_eq!(page_align_up(4096, 4096), 4096);
        assert_eq!(page_align_up(4097, 4096), 8192);
    }

    #[cfg(unix)]
    #[test]
    fn test_mmap_region_round_trip() {
        let mem = MmapMemory::new(64 * 1024).unwrap();
        assert_eq!(mem.size() % mem.page_size(), 0);
        mem.protect(0, mem.page_size(), Protection::ReadWrite).unwrap();
        mem.write_byte(0, 0xC3);
        assert_eq!(mem.read_byte(0), 0xC3);
        mem.protect(0, mem.page_size(), Protection::ReadExec).unwrap();
        assert_eq!(mem.read_byte(0), 0xC3);
    }
}
