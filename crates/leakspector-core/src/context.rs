//! External collaborators (spec.md §6): the page provider, stack walker, and
//! symbol resolver the engine is generic over, plus the call-context value
//! shims build on every entry.

/// Access rights the engine can request on a range of pages it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    NoAccess,
    ReadOnly,
    ReadWrite,
}

/// A single opaque return address captured by the stack walker.
pub type Frame = usize;

/// Function name, file, source line, stack trace, and (for typed-new) type
/// info supplied by a shim at every entry point (spec.md §6).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: u32,
    pub stack: Vec<Frame>,
    pub type_name: Option<String>,
    pub type_size: Option<usize>,
    pub thread_id: u64,
}

impl CallContext {
    /// A context with no symbolic information beyond a thread id, for
    /// internal (engine-originated) allocations.
    #[must_use]
    pub fn internal(thread_id: u64) -> Self {
        Self {
            thread_id,
            ..Self::default()
        }
    }
}

/// The low-level page allocator: obtains/releases/protects OS pages and
/// performs bulk fill/compare/copy, per spec.md §6's page-provider interface.
///
/// Implementations are not required to be thread-safe on their own; the
/// engine serialises all access under its single critical section (§5).
pub trait PageProvider {
    /// Reserve a fresh region of at least `size` bytes aligned to `alignment`.
    /// Returns `None` on allocation failure (never panics for exhaustion).
    fn alloc_pages(&self, size: usize, alignment: usize) -> Option<usize>;

    /// Release a region previously returned by [`PageProvider::alloc_pages`].
    fn free_pages(&self, base: usize, size: usize);

    /// Change the access rights of `[base, base+size)`. Returns `false` if
    /// the platform refused (e.g. misaligned request).
    fn protect_pages(&self, base: usize, size: usize, access: Access) -> bool;

    /// Scan `[base, base+size)` for the first byte that isn't `pattern`.
    /// Returns the offset of the mismatch, or `None` if the whole range
    /// matches.
    fn compare_pattern(&self, base: usize, size: usize, pattern: u8) -> Option<usize>;

    /// Copy `n` bytes from `src` to `dst`, tolerating overlap.
    fn copy_bytes(&self, dst: usize, src: usize, n: usize);

    /// Fill `n` bytes at `dst` with `byte`.
    fn fill_bytes(&self, dst: usize, byte: u8, n: usize);

    /// Read `size` bytes starting at `base`, for diagnostic sampling of a
    /// corrupted region. Implementations that cannot safely read back (e.g.
    /// a no-access page-guard region) may return fewer bytes than asked.
    fn read_bytes(&self, base: usize, size: usize) -> Vec<u8>;
}

/// Iterates the calling stack, producing an ordered sequence of frames.
///
/// `Frame` values are opaque beyond equality and the ordering implied by the
/// platform's stack-growth direction; they are used only to detect whether a
/// scope-bounded allocation's frame has unwound.
pub trait StackWalker {
    /// Begin walking from the immediate caller.
    fn new_frame(&self) -> Frame;

    /// Advance to the next-outer frame, or `None` at the top of the stack.
    fn next_frame(&self, state: Frame) -> Option<Frame>;

    /// Whether frame `a` is the same as or older (further unwound) than `b`,
    /// per the platform's stack-growth direction. Used to decide which scope
    /// records have been superseded.
    fn is_same_or_older(&self, a: Frame, b: Frame) -> bool;
}

/// Resolves a return address to a function name, file, and line, for
/// diagnostic printing only.
pub trait SymbolResolver {
    fn resolve(&self, address: Frame) -> ResolvedSymbol;
}

/// Best-effort symbolic information for one return address.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSymbol {
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// An in-memory [`PageProvider`] backed by a `Vec<u8>` arena, used by unit
    /// tests throughout this crate. Addresses are offsets into the arena
    /// starting at `BASE` so that `0` can keep meaning "no pointer".
    pub struct FakePageProvider {
        pub(crate) arena: RefCell<Vec<u8>>,
        pub(crate) regions: RefCell<HashMap<usize, (usize, Access)>>,
    }

    pub const BASE: usize = 0x1_0000;

    impl FakePageProvider {
        pub fn new() -> Self {
            Self {
                arena: RefCell::new(Vec::new()),
                regions: RefCell::new(HashMap::new()),
            }
        }

        fn ensure_len(&self, end: usize) {
            let mut arena = self.arena.borrow_mut();
            if arena.len() < end {
                arena.resize(end, 0);
            }
        }

        pub fn read(&self, base: usize, size: usize) -> Vec<u8> {
            let offset = base - BASE;
            self.arena.borrow()[offset..offset + size].to_vec()
        }

        pub fn write_at(&self, base: usize, data: &[u8]) {
            let offset = base - BASE;
            self.ensure_len(offset + data.len());
            self.arena.borrow_mut()[offset..offset + data.len()].copy_from_slice(data);
        }
    }

    impl PageProvider for FakePageProvider {
        fn alloc_pages(&self, size: usize, alignment: usize) -> Option<usize> {
            let mut arena = self.arena.borrow_mut();
            let unaligned = BASE + arena.len();
            let aligned = (unaligned + alignment - 1) / alignment * alignment;
            let pad = aligned - unaligned;
            arena.resize(arena.len() + pad + size, 0);
            self.regions
                .borrow_mut()
                .insert(aligned, (size, Access::ReadWrite));
            Some(aligned)
        }

        fn free_pages(&self, base: usize, _size: usize) {
            self.regions.borrow_mut().remove(&base);
        }

        fn protect_pages(&self, base: usize, size: usize, access: Access) -> bool {
            if let Some(entry) = self.regions.borrow_mut().get_mut(&base) {
                entry.1 = access;
                entry.0 == size || true
            } else {
                false
            }
        }

        fn compare_pattern(&self, base: usize, size: usize, pattern: u8) -> Option<usize> {
            let bytes = self.read(base, size);
            bytes.iter().position(|&b| b != pattern)
        }

        fn copy_bytes(&self, dst: usize, src: usize, n: usize) {
            let data = self.read(src, n);
            self.write_at(dst, &data);
        }

        fn fill_bytes(&self, dst: usize, byte: u8, n: usize) {
            self.write_at(dst, &vec![byte; n]);
        }

        fn read_bytes(&self, base: usize, size: usize) -> Vec<u8> {
            self.read(base, size)
        }
    }

    pub struct FakeStackWalker {
        pub depth: RefCell<usize>,
    }

    impl FakeStackWalker {
        pub fn new() -> Self {
            Self {
                depth: RefCell::new(1000),
            }
        }

        pub fn unwind_to(&self, depth: usize) {
            *self.depth.borrow_mut() = depth;
        }
    }

    impl StackWalker for FakeStackWalker {
        fn new_frame(&self) -> Frame {
            *self.depth.borrow()
        }

        fn next_frame(&self, state: Frame) -> Option<Frame> {
            if state == 0 {
                None
            } else {
                Some(state - 1)
            }
        }

        fn is_same_or_older(&self, a: Frame, b: Frame) -> bool {
            // Stack grows down in this fake: a smaller frame value means a
            // deeper (older / more-unwound) frame.
            a <= b
        }
    }

    pub struct FakeSymbolResolver;

    impl SymbolResolver for FakeSymbolResolver {
        fn resolve(&self, _address: Frame) -> ResolvedSymbol {
            ResolvedSymbol::default()
        }
    }
}
