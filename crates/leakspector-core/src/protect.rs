//! Toggles access rights on the engine's own metadata pages between
//! read-only and read-write around each mutating operation (spec.md §4.5).

use crate::context::{Access, PageProvider};

/// Chains the engine's own page chunks (slot-table pages, index-node pages,
/// profile/trace/symbol metadata) and brackets mutating operations with
/// unprotect/reprotect calls. The current protection state is cached so
/// repeated no-op transitions are skipped, and nested calls are serialised
/// by a recursion counter: only the outermost frame actually toggles pages.
pub struct ProtectionManager {
    chunks: Vec<(usize, usize)>,
    current: Access,
    depth: u32,
    /// When set (the `no-protect` runtime flag), toggling is a no-op and
    /// metadata always reads as read-write.
    pub disabled: bool,
}

impl ProtectionManager {
    #[must_use]
    pub fn new(disabled: bool) -> Self {
        Self {
            chunks: Vec::new(),
            current: Access::ReadWrite,
            depth: 0,
            disabled,
        }
    }

    /// Track another chunk of engine-owned memory. Idempotent for the same
    /// `(base, size)` pair.
    pub fn register_chunk(&mut self, base: usize, size: usize) {
        if !self.chunks.iter().any(|&(b, s)| b == base && s == size) {
            self.chunks.push((base, size));
        }
    }

    #[must_use]
    pub fn current_access(&self) -> Access {
        self.current
    }

    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Enter a mutating operation. If this is the outermost frame and
    /// metadata is not already read-write, unprotects every registered
    /// chunk.
    pub fn enter(&mut self, provider: &dyn PageProvider) {
        self.depth += 1;
        if self.disabled {
            return;
        }
        if self.depth == 1 && self.current != Access::ReadWrite {
            for &(base, size) in &self.chunks {
                provider.protect_pages(base, size, Access::ReadWrite);
            }
            self.current = Access::ReadWrite;
        }
    }

    /// Leave a mutating operation. If this was the outermost frame,
    /// reprotects metadata to read-only (or no-access, at the caller's
    /// choice via `target`).
    pub fn exit(&mut self, provider: &dyn PageProvider, target: Access) {
        debug_assert!(self.depth > 0, "protection exit without matching enter");
        self.depth = self.depth.saturating_sub(1);
        if self.disabled {
            return;
        }
        if self.depth == 0 && self.current != target {
            for &(base, size) in &self.chunks {
                provider.protect_pages(base, size, target);
            }
            self.current = target;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::FakePageProvider;

    #[test]
    fn only_outermost_frame_toggles_protection() {
        let provider = FakePageProvider::new();
        let mut manager = ProtectionManager::new(false);
        manager.register_chunk(0x1000, 64);

        manager.enter(&provider);
        assert_eq!(manager.depth(), 1);
        assert_eq!(manager.current_access(), Access::ReadWrite);

        manager.enter(&provider);
        assert_eq!(manager.depth(), 2);

        manager.exit(&provider, Access::ReadOnly);
        assert_eq!(manager.depth(), 1);
        // Still read-write: inner exit must not reprotect yet.
        assert_eq!(manager.current_access(), Access::ReadWrite);

        manager.exit(&provider, Access::ReadOnly);
        assert_eq!(manager.depth(), 0);
        assert_eq!(manager.current_access(), Access::ReadOnly);
    }

    #[test]
    fn no_protect_flag_skips_all_toggling() {
        let provider = FakePageProvider::new();
        let mut manager = ProtectionManager::new(true);
        manager.register_chunk(0x1000, 64);
        manager.enter(&provider);
        assert_eq!(manager.current_access(), Access::ReadWrite);
        manager.exit(&provider, Access::ReadOnly);
        assert_eq!(manager.current_access(), Access::ReadWrite);
    }

    #[test]
    fn repeated_same_state_transition_is_a_no_op() {
        let provider = FakePageProvider::new();
        let mut manager = ProtectionManager::new(false);
        manager.register_chunk(0x1000, 64);
        manager.enter(&provider);
        manager.exit(&provider, Access::ReadWrite);
        // current was already ReadWrite going in and target is ReadWrite:
        // no transition should have been recorded as "changed".
        assert_eq!(manager.current_access(), Access::ReadWrite);
    }
}
