//! Resolves `leakspector_core::Config` from `LKSPCTR_*` environment
//! variables, once per process, cached behind a non-blocking atomic state
//! machine.
//!
//! `std::env::var` allocates internally, so naively calling it from inside
//! `malloc` the first time that entry point runs can recurse straight back
//! into `malloc` before the config is resolved. A `std::sync::OnceLock`
//! would handle that reentrant call by blocking it on the same thread that
//! is still inside the initializer — a deadlock. Instead this uses the same
//! unresolved/resolving/resolved state machine the teacher's
//! `frankenlibc-membrane::config::safety_level` uses for its single mode
//! enum, generalized to cache a whole leaked `Config`.

use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use leakspector_core::{Config, Flags, GuardMode, OrdinalRange};

const STATE_UNRESOLVED: u8 = 0;
const STATE_RESOLVING: u8 = 1;
const STATE_RESOLVED: u8 = 2;

static CONFIG_STATE: AtomicU8 = AtomicU8::new(STATE_UNRESOLVED);
static CONFIG_PTR: AtomicPtr<Config> = AtomicPtr::new(std::ptr::null_mut());

/// The resolved, process-wide configuration.
///
/// Returns the cached `Config` once resolution has completed. A reentrant
/// call that arrives while resolution is still in flight on this same
/// thread (triggered by `std::env::var`'s own allocations) gets
/// `Config::default()` rather than blocking — safe because the real
/// resolution a few frames up the stack will shortly replace the cache for
/// every call after it.
#[must_use]
pub fn resolved() -> Config {
    let state = CONFIG_STATE.load(Ordering::Acquire);
    if state == STATE_RESOLVED {
        // SAFETY-equivalent: resolved state is only set after a valid leak.
        return unsafe { (*CONFIG_PTR.load(Ordering::Acquire)).clone() };
    }
    if state == STATE_RESOLVING {
        return Config::default();
    }

    if CONFIG_STATE
        .compare_exchange(
            STATE_UNRESOLVED,
            STATE_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let state = CONFIG_STATE.load(Ordering::Acquire);
        if state == STATE_RESOLVED {
            return unsafe { (*CONFIG_PTR.load(Ordering::Acquire)).clone() };
        }
        return Config::default();
    }

    let config = from_environment();
    let leaked = Box::into_raw(Box::new(config.clone()));
    CONFIG_PTR.store(leaked, Ordering::Release);
    CONFIG_STATE.store(STATE_RESOLVED, Ordering::Release);
    config
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    env_str(name).and_then(|s| s.parse().ok())
}

fn env_usize(name: &str) -> Option<usize> {
    env_str(name).and_then(|s| s.parse().ok())
}

fn env_byte(name: &str) -> Option<u8> {
    env_str(name).and_then(|s| {
        let s = s.trim();
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u8::from_str_radix(hex, 16).ok()
        } else {
            s.parse().ok()
        }
    })
}

fn env_range(name: &str) -> Option<OrdinalRange> {
    let raw = env_str(name)?;
    let (lower, upper) = raw.split_once('-')?;
    Some(OrdinalRange {
        lower: lower.trim().parse().ok()?,
        upper: upper.trim().parse().ok()?,
    })
}

fn env_guard_mode(name: &str) -> Option<GuardMode> {
    match env_str(name)?.to_ascii_lowercase().as_str() {
        "page" | "pages" => Some(GuardMode::Page),
        "byte" | "bytes" => Some(GuardMode::Byte),
        _ => None,
    }
}

/// Applies `LKSPCTR_FLAGS`, a comma-separated list of flag names from
/// spec's flag set, each optionally prefixed with `no-` to clear it rather
/// than set it (e.g. `LKSPCTR_FLAGS=log-allocs,no-check-frees,preserve`).
/// Mirrors mpatrol's own `MPATROL_OPTIONS` single-string-of-options
/// convention rather than one environment variable per boolean.
fn apply_flags(flags: &mut Flags, raw: &str) {
    for token in raw.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let (name, value) = match token.strip_prefix("no-") {
            Some(rest) => (rest, false),
            None => (token, true),
        };
        let slot = match name {
            "check-allocs" => &mut flags.check_allocs,
            "check-reallocs" => &mut flags.check_reallocs,
            "check-frees" => &mut flags.check_frees,
            "check-memory" => &mut flags.check_memory,
            "log-allocs" => &mut flags.log_allocs,
            "log-reallocs" => &mut flags.log_reallocs,
            "log-frees" => &mut flags.log_frees,
            "log-memory" => &mut flags.log_memory,
            "show-free" => &mut flags.show_free,
            "show-freed" => &mut flags.show_freed,
            "show-unfreed" => &mut flags.show_unfreed,
            "show-map" => &mut flags.show_map,
            "show-symbols" => &mut flags.show_symbols,
            "allow-overflow" => &mut flags.allow_overflow,
            "safe-signals" => &mut flags.safe_signals,
            "no-protect" => &mut flags.no_protect,
            "no-free" => &mut flags.no_free,
            "page-alloc" => &mut flags.page_alloc,
            "alloc-upper" => &mut flags.alloc_upper,
            "preserve" => &mut flags.preserve,
            "oflow-watch" => &mut flags.oflow_watch,
            _ => continue,
        };
        *slot = value;
    }
}

fn from_environment() -> Config {
    let mut config = Config::default();

    if let Some(path) = env_str("LKSPCTR_LOG_PATH") {
        config.log_path = Some(path);
    }
    if let Some(limit) = env_usize("LKSPCTR_BYTE_LIMIT") {
        config.byte_limit = Some(limit);
    }
    if let Some(stop) = env_u64("LKSPCTR_ALLOC_STOP") {
        config.allocation_stop = Some(stop);
    }
    if let Some(stop) = env_u64("LKSPCTR_REALLOC_STOP") {
        config.reallocation_stop = Some(stop);
    }
    if let Some(stop) = env_u64("LKSPCTR_FREE_STOP") {
        config.free_stop = Some(stop);
    }
    if let Some(min) = env_u64("LKSPCTR_UNFREED_ABORT_MIN") {
        config.unfreed_abort_minimum = Some(min);
    }
    if let Some(range) = env_range("LKSPCTR_CHECK_RANGE") {
        config.check_range = Some(range);
    }
    if let Some(freq) = env_u64("LKSPCTR_CHECK_FREQUENCY") {
        config.check_frequency = Some(freq);
    }
    if let Some(freq) = env_u64("LKSPCTR_FAULT_FREQUENCY") {
        config.fault_frequency = Some(freq);
    }
    if let Some(seed) = env_u64("LKSPCTR_FAULT_SEED") {
        config.fault_seed = seed;
    }
    if let Some(mode) = env_guard_mode("LKSPCTR_GUARD_MODE") {
        config.guard_mode = mode;
    }
    if let Some(oflow) = env_usize("LKSPCTR_OFLOW") {
        config.oflow = oflow;
    }
    if let Some(byte) = env_byte("LKSPCTR_ALLOC_BYTE") {
        config.alloc_byte = byte;
    }
    if let Some(byte) = env_byte("LKSPCTR_FREE_BYTE") {
        config.free_byte = byte;
    }
    if let Some(byte) = env_byte("LKSPCTR_OVERFLOW_BYTE") {
        config.overflow_byte = byte;
    }
    if let Some(raw) = env_str("LKSPCTR_FLAGS") {
        apply_flags(&mut config.flags, &raw);
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_parses_lower_upper() {
        assert_eq!(
            env_range_from_str("2-5"),
            Some(OrdinalRange { lower: 2, upper: 5 })
        );
        assert_eq!(env_range_from_str("garbage"), None);
    }

    fn env_range_from_str(raw: &str) -> Option<OrdinalRange> {
        let (lower, upper) = raw.split_once('-')?;
        Some(OrdinalRange {
            lower: lower.trim().parse().ok()?,
            upper: upper.trim().parse().ok()?,
        })
    }

    #[test]
    fn flags_accept_no_prefix_to_clear() {
        let mut flags = Flags::default();
        assert!(flags.check_frees);
        apply_flags(&mut flags, "no-check-frees,preserve");
        assert!(!flags.check_frees);
        assert!(flags.preserve);
    }

    #[test]
    fn flags_ignore_unknown_tokens() {
        let mut flags = Flags::default();
        apply_flags(&mut flags, "bogus-flag,log-allocs");
        assert!(flags.log_allocs);
    }

    #[test]
    fn byte_parses_hex_and_decimal() {
        assert_eq!(env_byte_from_str("0xAA"), Some(0xAA));
        assert_eq!(env_byte_from_str("170"), Some(170));
    }

    fn env_byte_from_str(s: &str) -> Option<u8> {
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u8::from_str_radix(hex, 16).ok()
        } else {
            s.parse().ok()
        }
    }
}
