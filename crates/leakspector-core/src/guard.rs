//! Writes, verifies, and locates corruption in overflow, allocation, and
//! free-pattern bytes (spec.md §4.3).

use crate::config::GuardMode;
use crate::context::PageProvider;
use crate::kind::AllocKind;

/// Outcome of verifying the guard regions around one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardViolation {
    /// The overflow pattern before the user region was corrupted; offset is
    /// relative to the start of the guard region.
    Before(usize),
    /// The overflow pattern after the user region was corrupted; offset is
    /// relative to the start of the user region's end.
    After(usize),
}

/// The three byte constants and the strategy chosen at initialisation
/// (spec.md §4.3). Operates purely in terms of addresses handed to it by
/// [`PageProvider`] calls; holds no memory of its own.
#[derive(Debug, Clone, Copy)]
pub struct GuardEngine {
    pub mode: GuardMode,
    pub oflow: usize,
    pub alloc_byte: u8,
    pub free_byte: u8,
    pub overflow_byte: u8,
}

impl GuardEngine {
    #[must_use]
    pub fn new(mode: GuardMode, oflow: usize, alloc_byte: u8, free_byte: u8, overflow_byte: u8) -> Self {
        Self {
            mode,
            oflow,
            alloc_byte,
            free_byte,
            overflow_byte,
        }
    }

    /// Bytes of overflow pattern carried on each side of the user region in
    /// byte-guard mode; zero in page-guard mode (the adjacent guard page is
    /// verified by the OS, not byte-compared here).
    #[must_use]
    pub fn guard_width(&self) -> usize {
        match self.mode {
            GuardMode::Byte => self.oflow,
            GuardMode::Page => 0,
        }
    }

    /// Total bytes the underlying heap must provide for a `user_size`
    /// request: guard bands on both sides in byte-guard mode, or exactly
    /// `user_size` in page-guard mode (the page provider itself adds the
    /// adjacent no-access pages).
    #[must_use]
    pub fn total_size(&self, user_size: usize) -> usize {
        user_size + 2 * self.guard_width()
    }

    /// Offset of the user region within the block the provider returned.
    #[must_use]
    pub fn user_offset(&self) -> usize {
        self.guard_width()
    }

    /// Write the overflow pattern into the guard bands around a fresh
    /// block and fill the user region per `kind` (zero for zero-filling
    /// kinds, the alloc-byte pattern otherwise). `block_base` is the
    /// address the provider returned; `user_size` excludes guards.
    pub fn initialize(
        &self,
        provider: &dyn PageProvider,
        block_base: usize,
        user_size: usize,
        kind: AllocKind,
    ) {
        let width = self.guard_width();
        if width > 0 {
            provider.fill_bytes(block_base, self.overflow_byte, width);
            provider.fill_bytes(block_base + width + user_size, self.overflow_byte, width);
        }
        let user_base = block_base + width;
        let fill = if kind.zero_fills() { 0 } else { self.alloc_byte };
        provider.fill_bytes(user_base, fill, user_size);
    }

    /// Fill the newly added tail `[old_size, new_size)` of a grown block
    /// with zero (for zero-filling kinds) or the alloc-byte pattern, and
    /// rewrite the trailing guard band at its new position.
    pub fn fill_grown_tail(
        &self,
        provider: &dyn PageProvider,
        user_base: usize,
        old_size: usize,
        new_size: usize,
        kind: AllocKind,
    ) {
        debug_assert!(new_size >= old_size);
        let fill = if kind.zero_fills() { 0 } else { self.alloc_byte };
        provider.fill_bytes(user_base + old_size, fill, new_size - old_size);
        let width = self.guard_width();
        if width > 0 {
            provider.fill_bytes(user_base + new_size, self.overflow_byte, width);
        }
    }

    /// Verify the guard bands around a live block still carry the overflow
    /// pattern. Always `None` in page-guard mode (that check belongs to the
    /// page provider).
    #[must_use]
    pub fn verify(
        &self,
        provider: &dyn PageProvider,
        user_base: usize,
        user_size: usize,
    ) -> Option<GuardViolation> {
        let width = self.guard_width();
        if width == 0 {
            return None;
        }
        if let Some(offset) = provider.compare_pattern(user_base - width, width, self.overflow_byte) {
            return Some(GuardViolation::Before(offset));
        }
        if let Some(offset) =
            provider.compare_pattern(user_base + user_size, width, self.overflow_byte)
        {
            return Some(GuardViolation::After(offset));
        }
        None
    }

    /// Rewrite a block's user region with the free-byte pattern, unless
    /// `preserve_contents` is configured.
    pub fn mark_freed(
        &self,
        provider: &dyn PageProvider,
        user_base: usize,
        user_size: usize,
        preserve_contents: bool,
    ) {
        if !preserve_contents {
            provider.fill_bytes(user_base, self.free_byte, user_size);
        }
    }

    /// Verify a retained-freed block's user region still carries the
    /// free-byte pattern (meaningless, and skipped by the caller, when
    /// `preserve_contents` was configured at free time).
    #[must_use]
    pub fn verify_freed_body(
        &self,
        provider: &dyn PageProvider,
        user_base: usize,
        user_size: usize,
    ) -> Option<usize> {
        provider.compare_pattern(user_base, user_size, self.free_byte)
    }

    /// At most 256 bytes of the region starting at `address`, for error
    /// reporting (spec.md §4.3's "reporting at most 256 bytes").
    #[must_use]
    pub fn sample(&self, provider: &dyn PageProvider, address: usize, size: usize) -> Vec<u8> {
        provider.read_bytes(address, size.min(256))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::FakePageProvider;

    fn byte_engine() -> GuardEngine {
        GuardEngine::new(GuardMode::Byte, 16, 0xA1, 0x55, 0xD0)
    }

    #[test]
    fn initialize_writes_guards_and_fill_pattern() {
        let provider = FakePageProvider::new();
        let engine = byte_engine();
        let total = engine.total_size(32);
        let block = provider.alloc_pages(total, 8).unwrap();
        engine.initialize(&provider, block, 32, AllocKind::General);

        let user_base = block + engine.user_offset();
        assert_eq!(provider.read(block, 16), vec![0xD0; 16]);
        assert_eq!(provider.read(user_base, 32), vec![0xA1; 32]);
        assert_eq!(provider.read(user_base + 32, 16), vec![0xD0; 16]);
        assert!(engine.verify(&provider, user_base, 32).is_none());
    }

    #[test]
    fn zero_init_kind_fills_zero_not_alloc_byte() {
        let provider = FakePageProvider::new();
        let engine = byte_engine();
        let total = engine.total_size(8);
        let block = provider.alloc_pages(total, 8).unwrap();
        engine.initialize(&provider, block, 8, AllocKind::ZeroInit);
        let user_base = block + engine.user_offset();
        assert_eq!(provider.read(user_base, 8), vec![0u8; 8]);
    }

    #[test]
    fn verify_detects_overflow_after() {
        let provider = FakePageProvider::new();
        let engine = byte_engine();
        let total = engine.total_size(16);
        let block = provider.alloc_pages(total, 8).unwrap();
        engine.initialize(&provider, block, 16, AllocKind::General);
        let user_base = block + engine.user_offset();

        // Simulate a one-byte overflow write.
        provider.write_at(user_base + 16, &[0x00]);
        match engine.verify(&provider, user_base, 16) {
            Some(GuardViolation::After(0)) => {}
            other => panic!("expected overflow-after at offset 0, got {other:?}"),
        }
    }

    #[test]
    fn page_guard_mode_has_zero_width_and_skips_byte_verify() {
        let provider = FakePageProvider::new();
        let engine = GuardEngine::new(GuardMode::Page, 16, 0xA1, 0x55, 0xD0);
        assert_eq!(engine.total_size(32), 32);
        let block = provider.alloc_pages(32, 4096).unwrap();
        engine.initialize(&provider, block, 32, AllocKind::General);
        assert!(engine.verify(&provider, block, 32).is_none());
    }

    #[test]
    fn mark_freed_overwrites_with_free_byte_unless_preserved() {
        let provider = FakePageProvider::new();
        let engine = byte_engine();
        let total = engine.total_size(8);
        let block = provider.alloc_pages(total, 8).unwrap();
        engine.initialize(&provider, block, 8, AllocKind::General);
        let user_base = block + engine.user_offset();

        engine.mark_freed(&provider, user_base, 8, false);
        assert!(engine.verify_freed_body(&provider, user_base, 8).is_none());

        engine.initialize(&provider, block, 8, AllocKind::General);
        engine.mark_freed(&provider, user_base, 8, true);
        assert!(engine.verify_freed_body(&provider, user_base, 8).is_some());
    }
}
