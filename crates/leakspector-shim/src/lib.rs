// All exported extern "C" functions accept raw pointers from C callers;
// the engine validates at runtime, so per-function safety docs would be
// redundant boilerplate.
#![allow(clippy::missing_safety_doc)]
//! # leakspector-shim
//!
//! The `extern "C"` ABI boundary for the leakspector allocation-information
//! engine. This crate produces a `cdylib` meant to be `LD_PRELOAD`ed ahead
//! of the system allocator: it exports `malloc`/`free`/`realloc` and
//! friends, the bulk-memory functions, and C++'s `operator new`/`delete`,
//! each passing through [`leakspector_core::Engine`] before falling back to
//! the real libc/libstdc++ symbol.
//!
//! # Architecture
//!
//! ```text
//! caller -> ABI entry (this crate) -> Engine (leakspector-core) -> OS pages
//!                                  -> native libc (reentrant/uninitialized fallback)
//! ```
//!
//! [`config`] resolves the engine's runtime configuration from `LKSPCTR_*`
//! environment variables once per process; [`engine_state`] owns the
//! process-wide engine instance and the re-entrancy guard every entry point
//! takes before touching it; [`providers`] supplies the OS-backed
//! implementations of `leakspector-core`'s page-provider, stack-walker, and
//! symbol-resolver traits; [`call_context`] builds the call-site
//! information every entry point hands the engine; [`logging`] supplies
//! the concrete text-log/binary-trace/profile sinks `engine_state` wires
//! into the engine at construction time.

pub mod call_context;
pub mod config;
pub mod engine_state;
pub mod logging;
pub mod providers;

// Export modules are gated behind cfg(not(test)) because they define
// #[no_mangle]/#[export_name] symbols (malloc, free, memcpy, ...) that
// would shadow the system allocator in the test binary itself, causing
// infinite recursion.
#[cfg(not(test))]
pub mod malloc_abi;
#[cfg(not(test))]
pub mod mem_abi;
#[cfg(not(test))]
pub mod new_delete_abi;
#[cfg(not(test))]
pub mod scope_abi;
#[cfg(not(test))]
pub mod string_dup_abi;
