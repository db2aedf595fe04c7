//! Production implementations of `leakspector_core`'s external-collaborator
//! traits: pages backed by `mmap`/`mprotect`, stack frames backed by a raw
//! stack-pointer probe, and symbols resolved with `backtrace`.

use std::ffi::c_void;

use leakspector_core::{Access, Frame, PageProvider, ResolvedSymbol, StackWalker, SymbolResolver};

/// `mmap`-backed page provider. Every allocation is its own anonymous
/// mapping rather than carved out of a shared arena — wasteful compared to
/// a real allocator, but it is what lets [`PageProvider::protect_pages`]
/// toggle access on exactly the bytes the engine owns without disturbing
/// anything a non-instrumented allocator handed out.
pub struct OsPageProvider {
    page_size: usize,
}

impl OsPageProvider {
    #[must_use]
    pub fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            page_size: if page_size > 0 { page_size as usize } else { 4096 },
        }
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn round_up(&self, size: usize) -> usize {
        let mask = self.page_size - 1;
        (size + mask) & !mask
    }
}

impl Default for OsPageProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn access_to_prot(access: Access) -> libc::c_int {
    match access {
        Access::NoAccess => libc::PROT_NONE,
        Access::ReadOnly => libc::PROT_READ,
        Access::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    }
}

impl PageProvider for OsPageProvider {
    fn alloc_pages(&self, size: usize, alignment: usize) -> Option<usize> {
        let rounded = self.round_up(size.max(1));
        // Overallocate by the alignment so the returned base can be bumped
        // up to the requested alignment without a second mapping.
        let map_len = if alignment > self.page_size {
            rounded + alignment
        } else {
            rounded
        };

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return None;
        }

        let raw = addr as usize;
        let aligned = if alignment > self.page_size {
            (raw + alignment - 1) & !(alignment - 1)
        } else {
            raw
        };
        Some(aligned)
    }

    fn free_pages(&self, base: usize, size: usize) {
        let rounded = self.round_up(size.max(1));
        unsafe {
            libc::munmap(base as *mut c_void, rounded);
        }
    }

    fn protect_pages(&self, base: usize, size: usize, access: Access) -> bool {
        let page_mask = self.page_size - 1;
        let page_base = base & !page_mask;
        let page_len = self.round_up((base - page_base) + size);
        let rc = unsafe { libc::mprotect(page_base as *mut c_void, page_len, access_to_prot(access)) };
        rc == 0
    }

    fn compare_pattern(&self, base: usize, size: usize, pattern: u8) -> Option<usize> {
        let slice = unsafe { std::slice::from_raw_parts(base as *const u8, size) };
        slice.iter().position(|&b| b != pattern)
    }

    fn copy_bytes(&self, dst: usize, src: usize, n: usize) {
        unsafe {
            std::ptr::copy(src as *const u8, dst as *mut u8, n);
        }
    }

    fn fill_bytes(&self, dst: usize, byte: u8, n: usize) {
        unsafe {
            std::ptr::write_bytes(dst as *mut u8, byte, n);
        }
    }

    fn read_bytes(&self, base: usize, size: usize) -> Vec<u8> {
        let slice = unsafe { std::slice::from_raw_parts(base as *const u8, size) };
        slice.to_vec()
    }
}

/// Captures one raw stack-pointer-like address per scope-bounded
/// allocation instead of walking the full call stack with `backtrace`:
/// comparing two addresses is all `Engine::unwind_scopes` ever needs, and a
/// full unwind on every `alloca`-style call would be needless cost on a hot
/// path.
///
/// Relies on the call stack growing downward, true of every mainstream
/// target this crate ships on (x86_64, aarch64): a function nested deeper
/// than its caller has a numerically smaller stack address. A scope record
/// is therefore superseded once the current frame's address is the same as
/// or greater than the address captured when the record was pushed.
pub struct OsStackWalker;

impl StackWalker for OsStackWalker {
    fn new_frame(&self) -> Frame {
        let probe: u8 = 0;
        std::ptr::addr_of!(probe) as usize
    }

    fn next_frame(&self, state: Frame) -> Option<Frame> {
        // Single-frame probes have no "next" frame to walk to.
        let _ = state;
        None
    }

    fn is_same_or_older(&self, a: Frame, b: Frame) -> bool {
        a <= b
    }
}

/// Resolves return addresses to symbolic information for diagnostic
/// printing, using `backtrace`'s own symbol database. Kept separate from
/// [`OsStackWalker`] since symbolication is comparatively expensive and is
/// only ever needed when actually formatting a report.
pub struct OsSymbolResolver;

impl SymbolResolver for OsSymbolResolver {
    fn resolve(&self, address: Frame) -> ResolvedSymbol {
        let mut resolved = ResolvedSymbol::default();
        backtrace::resolve(address as *mut c_void, |symbol| {
            if resolved.function.is_none() {
                resolved.function = symbol.name().map(|n| n.to_string());
                resolved.file = symbol.filename().map(|p| p.to_string_lossy().into_owned());
                resolved.line = symbol.lineno();
            }
        });
        resolved
    }
}
