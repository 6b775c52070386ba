//! Executable memory for generated code.
//!
//! W^X discipline: pages come back writable from [`ExecutableMemory::allocate`],
//! the backend copies code and constant-pool data in, then
//! [`ExecutableMemory::make_executable`] flips them to read+execute. The
//! mapping is released when the owning program impl drops. Unix-only;
//! other platforms report `JitFailed`.

use crate::error::{Error, Result};

#[cfg(unix)]
mod imp {
    use super::*;
    use std::ptr::NonNull;

    pub struct ExecutableMemory {
        ptr: NonNull<u8>,
        len: usize,
    }

    // The mapping is immutable after `make_executable`; the raw pointer
    // is only written during single-threaded compilation.
    unsafe impl Send for ExecutableMemory {}
    unsafe impl Sync for ExecutableMemory {}

    impl ExecutableMemory {
        /// Maps at least `size` bytes of zeroed read-write memory.
        pub fn allocate(size: usize) -> Result<ExecutableMemory> {
            if size == 0 {
                return Err(Error::InvalidArgument("empty code buffer"));
            }
            let len = round_to_pages(size);
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(Error::NoMemory);
            }
            Ok(ExecutableMemory {
                ptr: NonNull::new(ptr as *mut u8).ok_or(Error::NoMemory)?,
                len,
            })
        }

        pub fn addr(&self) -> u64 {
            self.ptr.as_ptr() as u64
        }

        pub fn len(&self) -> usize {
            self.len
        }

        pub fn is_empty(&self) -> bool {
            self.len == 0
        }

        /// Writable view, valid until `make_executable`.
        pub fn as_mut_slice(&mut self) -> &mut [u8] {
            unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
        }

        /// Flips the mapping to read+execute.
        pub fn make_executable(&mut self) -> Result<()> {
            let rc = unsafe {
                libc::mprotect(
                    self.ptr.as_ptr() as *mut libc::c_void,
                    self.len,
                    libc::PROT_READ | libc::PROT_EXEC,
                )
            };
            if rc != 0 {
                return Err(Error::JitFailed("mprotect"));
            }
            Ok(())
        }

        /// Entry point of the generated function.
        pub fn entry(&self) -> *const u8 {
            self.ptr.as_ptr()
        }
    }

    impl Drop for ExecutableMemory {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
            }
        }
    }

    fn round_to_pages(size: usize) -> usize {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let page = page.max(4096);
        size.div_ceil(page) * page
    }
}

#[cfg(not(unix))]
mod imp {
    use super::*;

    pub struct ExecutableMemory;

    impl ExecutableMemory {
        pub fn allocate(_size: usize) -> Result<ExecutableMemory> {
            Err(Error::JitFailed("executable memory unsupported on this platform"))
        }

        pub fn addr(&self) -> u64 {
            0
        }

        pub fn len(&self) -> usize {
            0
        }

        pub fn is_empty(&self) -> bool {
            true
        }

        pub fn as_mut_slice(&mut self) -> &mut [u8] {
            &mut []
        }

        pub fn make_executable(&mut self) -> Result<()> {
            Err(Error::JitFailed("executable memory unsupported on this platform"))
        }

        pub fn entry(&self) -> *const u8 {
            std::ptr::null()
        }
    }
}

pub use imp::ExecutableMemory;

#[cfg(all(test, unix, target_arch = "x86_64"))]
mod tests {
    use super::*;

    #[test]
    fn allocate_write_execute() {
        // mov eax, 42; ret
        let code: [u8; 6] = [0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3];
        let mut mem = ExecutableMemory::allocate(code.len()).unwrap();
        mem.as_mut_slice()[..code.len()].copy_from_slice(&code);
        mem.make_executable().unwrap();

        let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(mem.entry()) };
        assert_eq!(f(), 42);
    }

    #[test]
    fn zero_size_rejected() {
        assert!(ExecutableMemory::allocate(0).is_err());
    }

    #[test]
    fn release_on_drop() {
        // Nothing to observe directly; exercising the drop path under
        // miri/asan is what this is for.
        let mem = ExecutableMemory::allocate(64).unwrap();
        assert!(mem.len() >= 64);
        drop(mem);
    }
}
