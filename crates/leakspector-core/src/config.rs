//! Runtime configuration (spec.md §6's "runtime configuration" list).
//!
//! This struct is the parsed, validated result; `leakspector-shim::config`
//! owns turning environment variables into one of these and caches the
//! result behind an atomic state machine so repeated construction during
//! re-entrant calls never blocks.

/// The two overflow-detection strategies (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardMode {
    /// `oflow` bytes of overflow pattern immediately before and after the
    /// user region.
    Byte,
    /// Blocks sit at a page boundary with adjacent guard pages marked
    /// no-access; byte patterns are only checked on the partial page.
    Page,
}

/// An inclusive-exclusive ordinal range used by `check-range` and similar
/// fields: `[lower, upper)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrdinalRange {
    pub lower: u64,
    pub upper: u64,
}

impl OrdinalRange {
    #[must_use]
    pub fn contains(self, ordinal: u64) -> bool {
        ordinal >= self.lower && ordinal < self.upper
    }
}

/// Boolean policy flags from spec.md §6's flag list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    pub check_allocs: bool,
    pub check_reallocs: bool,
    pub check_frees: bool,
    pub check_memory: bool,
    pub log_allocs: bool,
    pub log_reallocs: bool,
    pub log_frees: bool,
    pub log_memory: bool,
    pub show_free: bool,
    pub show_freed: bool,
    pub show_unfreed: bool,
    pub show_map: bool,
    pub show_symbols: bool,
    pub allow_overflow: bool,
    pub safe_signals: bool,
    pub no_protect: bool,
    pub no_free: bool,
    pub page_alloc: bool,
    pub alloc_upper: bool,
    pub preserve: bool,
    pub oflow_watch: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            check_allocs: true,
            check_reallocs: true,
            check_frees: true,
            check_memory: true,
            log_allocs: false,
            log_reallocs: false,
            log_frees: false,
            log_memory: false,
            show_free: false,
            show_freed: true,
            show_unfreed: true,
            show_map: false,
            show_symbols: true,
            allow_overflow: false,
            safe_signals: true,
            no_protect: false,
            no_free: false,
            page_alloc: false,
            alloc_upper: false,
            preserve: false,
            oflow_watch: false,
        }
    }
}

/// The full set of engine-wide configuration knobs, resolved once at
/// startup from the environment (spec.md §6).
#[derive(Debug, Clone)]
pub struct Config {
    pub log_path: Option<String>,
    pub byte_limit: Option<usize>,
    pub allocation_stop: Option<u64>,
    pub reallocation_stop: Option<u64>,
    pub free_stop: Option<u64>,
    pub unfreed_abort_minimum: Option<u64>,
    pub check_range: Option<OrdinalRange>,
    pub check_frequency: Option<u64>,
    pub fault_frequency: Option<u64>,
    pub fault_seed: u64,
    /// Platform page size, measured by the shim and passed in rather than
    /// assumed.
    pub page_size: usize,
    pub guard_mode: GuardMode,
    pub oflow: usize,
    pub alloc_byte: u8,
    pub free_byte: u8,
    pub overflow_byte: u8,
    pub flags: Flags,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_path: None,
            byte_limit: None,
            allocation_stop: None,
            reallocation_stop: None,
            free_stop: None,
            unfreed_abort_minimum: None,
            check_range: None,
            check_frequency: None,
            fault_frequency: None,
            fault_seed: 0,
            page_size: 4096,
            guard_mode: GuardMode::Byte,
            oflow: 16,
            alloc_byte: 0xAA,
            free_byte: 0x55,
            overflow_byte: 0xD0,
            flags: Flags::default(),
        }
    }
}

impl Config {
    /// The minimal page size the guard-fill engine rounds page-guard
    /// allocations to. Not configurable: it is measured from the page
    /// provider at startup in the shim and passed in here.
    #[must_use]
    pub fn with_oflow(mut self, oflow: usize) -> Self {
        self.oflow = oflow;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinal_range_is_half_open() {
        let range = OrdinalRange { lower: 2, upper: 5 };
        assert!(!range.contains(1));
        assert!(range.contains(2));
        assert!(range.contains(4));
        assert!(!range.contains(5));
    }

    #[test]
    fn default_flags_check_everything_by_default() {
        let flags = Flags::default();
        assert!(flags.check_allocs);
        assert!(flags.check_frees);
        assert!(!flags.no_protect);
        assert!(!flags.preserve);
    }
}
