//! # leakspector-core
//!
//! The allocation-information engine: a safe, provider-agnostic model of a
//! debugging memory allocator in the mpatrol/dmalloc tradition. This crate
//! owns no raw memory and performs no syscalls itself — it drives guard
//! fills, bookkeeping, fault injection, and policy decisions purely through
//! the [`context::PageProvider`], [`context::StackWalker`], and
//! [`context::SymbolResolver`] traits, so it stays entirely safe code while
//! `leakspector-shim` supplies the real OS-backed implementations of those
//! traits and the `extern "C"` ABI surface callers actually link against.
//!
//! No `unsafe` code is permitted at the crate level.

#![deny(unsafe_code)]

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod guard;
pub mod index;
pub mod kind;
pub mod protect;
pub mod recorder;
pub mod rng;
pub mod scope;
pub mod slot_table;

pub use config::{Config, Flags, GuardMode, OrdinalRange};
pub use context::{Access, CallContext, Frame, PageProvider, ResolvedSymbol, StackWalker, SymbolResolver};
pub use engine::Engine;
pub use error::{EngineError, Severity};
pub use index::{AllocationIndex, AllocationRecord};
pub use kind::AllocKind;
pub use recorder::{Counters, EventKind, EventRecorder, LogSink, ProfileSink, TraceSink};
pub use scope::{ScopeRecord, ScopeStack};
