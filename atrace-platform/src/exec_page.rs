//! Executable memory for generated stubs.
//!
//! spec.md §9 ("Generated code as data") requires writable-executable memory
//! plus an explicit instruction-cache flush after the final address patch.
//! Without the `posix` feature this falls back to a plain heap buffer (there
//! is no m68k/AmigaOS code to actually execute in a hosted Rust build — see
//! DESIGN.md's Open Question resolution #3); with `posix` it is a real
//! `mmap`'d RWX mapping, grounded on
//! `cognitod::runtime::sequencer::advise_hugepages`'s style of a raw `libc`
//! call with logged success/failure.

enum Owner {
    Heap(Box<[u8]>),
    #[cfg(feature = "posix")]
    Mmap,
}

pub struct ExecPage {
    ptr: *mut u8,
    len: usize,
    owner: Owner,
}

// SAFETY: the buffer this points into is either a heap allocation owned by
// this struct or a private anonymous mmap owned by this struct; neither is
// shared with another thread without synchronization external to this type.
unsafe impl Send for ExecPage {}

impl ExecPage {
    pub(crate) fn from_heap(mut buf: Box<[u8]>) -> Self {
        let ptr = buf.as_mut_ptr();
        let len = buf.len();
        Self {
            ptr,
            len,
            owner: Owner::Heap(buf),
        }
    }

    #[cfg(feature = "posix")]
    pub(crate) unsafe fn from_mmap(ptr: *mut u8, len: usize) -> Self {
        Self {
            ptr,
            len,
            owner: Owner::Mmap,
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for ExecPage {
    fn drop(&mut self) {
        #[cfg(feature = "posix")]
        if matches!(self.owner, Owner::Mmap) {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.len);
            }
        }
    }
}

/// Allocate `len` bytes of writable (and, with `posix`, executable) memory.
#[cfg(not(feature = "posix"))]
pub fn alloc_executable(len: usize) -> std::io::Result<ExecPage> {
    Ok(ExecPage::from_heap(vec![0u8; len].into_boxed_slice()))
}

#[cfg(feature = "posix")]
pub fn alloc_executable(len: usize) -> std::io::Result<ExecPage> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        let err = std::io::Error::last_os_error();
        log::error!("mmap(PROT_EXEC) failed for {len} bytes: {err}");
        return Err(err);
    }
    log::debug!("mapped {len} executable bytes at {ptr:p}");
    Ok(unsafe { ExecPage::from_mmap(ptr as *mut u8, len) })
}

/// Flush the instruction cache after patching generated code in place. On
/// x86_64 self-modifying code is cache-coherent and this is a no-op; other
/// architectures would need an explicit cache-line flush here.
pub fn flush_icache(_ptr: *const u8, _len: usize) {
    #[cfg(all(feature = "posix", target_arch = "x86_64"))]
    {
        // x86_64 instruction fetch is coherent with data stores; nothing to do.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_backed_page_is_readable_and_writable() {
        let mut page = alloc_executable(64).unwrap();
        page.as_mut_slice()[0] = 0x90;
        assert_eq!(page.as_slice()[0], 0x90);
        assert_eq!(page.len(), 64);
    }
}
