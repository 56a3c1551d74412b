//! 可执行内存映射
//!
//! 映射以可读、可写、可执行的权限创建：同一块中的其他桩可能已在运行时，
//! 新桩仍会追加写入，因此不能逐次切换保护属性。分配器发放的区域互不重叠，
//! 这是 [`ExecutableMemory::write`] 安全的前提。

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub struct ExecutableMemory {
            ptr: *mut u8,
            size: usize,
        }

        impl ExecutableMemory {
            pub fn new(size: usize) -> Option<Self> {
                if size == 0 {
                    return None;
                }

                #[cfg(target_os = "macos")]
                let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_JIT;
                #[cfg(not(target_os = "macos"))]
                let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

                // SAFETY: anonymous private mapping, no file descriptor involved.
                let ptr = unsafe {
                    libc::mmap(
                        std::ptr::null_mut(),
                        size,
                        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                        flags,
                        -1,
                        0,
                    )
                };

                if ptr == libc::MAP_FAILED {
                    return None;
                }

                Some(ExecutableMemory { ptr: ptr as *mut u8, size })
            }
        }

        impl Drop for ExecutableMemory {
            fn drop(&mut self) {
                // SAFETY: ptr/size come from the successful mmap in `new`.
                unsafe {
                    libc::munmap(self.ptr as *mut libc::c_void, self.size);
                }
            }
        }
    } else if #[cfg(target_os = "windows")] {
        use windows_sys::Win32::System::Memory::{
            VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
        };

        pub struct ExecutableMemory {
            ptr: *mut u8,
            size: usize,
        }

        impl ExecutableMemory {
            pub fn new(size: usize) -> Option<Self> {
                if size == 0 {
                    return None;
                }

                // SAFETY: fresh reservation, no existing memory is touched.
                let ptr = unsafe {
                    VirtualAlloc(
                        std::ptr::null(),
                        size,
                        MEM_COMMIT | MEM_RESERVE,
                        PAGE_EXECUTE_READWRITE,
                    )
                };

                if ptr.is_null() {
                    return None;
                }

                Some(ExecutableMemory { ptr: ptr as *mut u8, size })
            }
        }

        impl Drop for ExecutableMemory {
            fn drop(&mut self) {
                // SAFETY: ptr comes from the successful VirtualAlloc in `new`.
                unsafe {
                    VirtualFree(self.ptr as *mut _, 0, MEM_RELEASE);
                }
            }
        }
    } else {
        compile_error!("Unsupported platform for executable memory");
    }
}

impl std::fmt::Debug for ExecutableMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableMemory")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .finish()
    }
}

impl ExecutableMemory {
    pub fn base(&self) -> usize {
        self.ptr as usize
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.base() + self.size
    }

    /// Copies `bytes` to `offset` and makes them visible to instruction fetch.
    ///
    /// # Safety
    ///
    /// The caller must own `[offset, offset + bytes.len())` exclusively: no
    /// other writer and no thread executing inside that range.
    pub unsafe fn write(&self, offset: usize, bytes: &[u8]) {
        assert!(
            offset + bytes.len() <= self.size,
            "write of {} bytes at offset {} overruns mapping of {} bytes",
            bytes.len(),
            offset,
            self.size
        );
        // SAFETY: bounds checked above; exclusivity is the caller's contract.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
        self.invalidate_icache(offset, bytes.len());
    }

    /// # Safety
    ///
    /// No writer may be active on the range while the slice is alive.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.size);
        // SAFETY: bounds checked; the mapping lives as long as `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) }
    }

    fn invalidate_icache(&self, offset: usize, len: usize) {
        #[cfg(target_arch = "aarch64")]
        {
            use std::arch::asm;
            let cache_line_size = 64;
            let start = (self.ptr as usize + offset) & !(cache_line_size - 1);
            let end = self.ptr as usize + offset + len;
            let mut addr = start;
            // SAFETY: cache maintenance on addresses inside our own mapping.
            unsafe {
                while addr < end {
                    asm!("dc cvau, {0}", in(reg) addr, options(nostack));
                    asm!("ic ivau, {0}", in(reg) addr, options(nostack));
                    addr += cache_line_size;
                }
                asm!("dsb ish", options(nostack));
                asm!("isb", options(nostack));
            }
        }
        #[cfg(target_arch = "riscv64")]
        {
            use std::arch::asm;
            let _ = (offset, len);
            // SAFETY: fence.i has no memory operands.
            unsafe {
                asm!("fence.i", options(nostack));
            }
        }
        // x86 keeps instruction fetch coherent with stores.
        #[cfg(not(any(target_arch = "aarch64", target_arch = "riscv64")))]
        let _ = (offset, len);
    }
}

// SAFETY: the mapping is plain memory; concurrent access is mediated by the
// allocator handing out disjoint regions.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_size_is_rejected() {
        assert!(ExecutableMemory::new(0).is_none());
    }

    #[test]
    fn test_write_then_read_back() {
        let mem = ExecutableMemory::new(4096).unwrap();
        assert_eq!(mem.len(), 4096);
        unsafe {
            mem.write(16, &[0xC3, 0x90, 0x90]);
            assert_eq!(mem.slice(16, 3), &[0xC3, 0x90, 0x90]);
        }
        assert!(mem.contains(mem.base() + 4095));
        assert!(!mem.contains(mem.base() + 4096));
    }
}
