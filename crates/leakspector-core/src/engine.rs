//! The engine ("info head"): owns everything else in this crate and
//! implements the eight user-visible operations, enforcing policy,
//! injecting faults, and driving shutdown reporting (spec.md §4.7).

use crate::config::Config;
use crate::context::{Access, CallContext, PageProvider, StackWalker, SymbolResolver};
use crate::error::EngineError;
use crate::guard::GuardEngine;
use crate::index::{AllocationIndex, AllocationRecord};
use crate::kind::AllocKind;
use crate::protect::ProtectionManager;
use crate::recorder::{Counters, EventKind, EventRecorder};
use crate::rng::FaultRng;
use crate::scope::ScopeStack;
use std::collections::HashMap;

/// Bound on the nested-operator-delete attribution stack (spec.md §9
/// supplement, mirrors the original's `MP_MAXDELSTACK`).
const MAX_DELETE_STACK: usize = 16;

/// Reprotect target used for engine metadata between mutating operations.
/// Always read-only: spec.md §4.5 allows no-access "where supported", but
/// the diagnostic requirement that metadata stay host-readable (§5's
/// "readable by the host at all times") is the stronger of the two and
/// this engine picks it unconditionally.
const METADATA_REST_ACCESS: Access = Access::ReadOnly;

/// The allocation-information engine. A single instance is created once at
/// load time and destroyed once at unload (spec.md §3's "Lifecycle").
pub struct Engine {
    config: Config,
    page_provider: Box<dyn PageProvider>,
    stack_walker: Box<dyn StackWalker>,
    symbol_resolver: Box<dyn SymbolResolver>,
    guard: GuardEngine,
    index: AllocationIndex,
    scope_stack: ScopeStack,
    protection: ProtectionManager,
    recorder: EventRecorder,
    rng: FaultRng,
    next_alloc_ordinal: u64,
    counters: Counters,
    delete_stack: Vec<CallContext>,
    low_memory_hook: Option<Box<dyn FnMut() + Send>>,
    abort_hook: Option<Box<dyn Fn(&str) -> ! + Send>>,
    finalising: bool,
    /// Bases reclaimed outside retain mode, kept only so a later free can
    /// still be told "previously freed" instead of "not allocated" once the
    /// full record is gone from `index` (mirrors the teacher's
    /// `recently_freed` bookkeeping, adapted to carry the freeing call site
    /// since the previously-freed error needs one).
    recently_freed: HashMap<usize, CallContext>,
}

impl Engine {
    #[must_use]
    pub fn new(
        config: Config,
        page_provider: Box<dyn PageProvider>,
        stack_walker: Box<dyn StackWalker>,
        symbol_resolver: Box<dyn SymbolResolver>,
    ) -> Self {
        let guard = GuardEngine::new(
            config.guard_mode,
            config.oflow,
            config.alloc_byte,
            config.free_byte,
            config.overflow_byte,
        );
        let protection = ProtectionManager::new(config.flags.no_protect);
        let rng = FaultRng::new(config.fault_seed);
        Self {
            config,
            page_provider,
            stack_walker,
            symbol_resolver,
            guard,
            index: AllocationIndex::new(),
            scope_stack: ScopeStack::new(),
            protection,
            recorder: EventRecorder::new(),
            rng,
            next_alloc_ordinal: 1,
            counters: Counters::default(),
            delete_stack: Vec::new(),
            low_memory_hook: None,
            abort_hook: None,
            finalising: false,
            recently_freed: HashMap::new(),
        }
    }

    #[must_use]
    pub fn recorder_mut(&mut self) -> &mut EventRecorder {
        &mut self.recorder
    }

    /// Overrides what `trap` calls after flushing the event recorder.
    /// Defaults to [`std::process::abort`]; a caller embedding the engine
    /// in a test harness can install `|summary| panic!("{summary}")`
    /// instead, so a single bad fixture unwinds that one test rather than
    /// taking down the whole test binary.
    pub fn set_abort_hook(&mut self, hook: Box<dyn Fn(&str) -> ! + Send>) {
        self.abort_hook = Some(hook);
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn counters(&self) -> Counters {
        self.counters
    }

    #[must_use]
    pub fn symbol_resolver(&self) -> &dyn SymbolResolver {
        self.symbol_resolver.as_ref()
    }

    /// Total bytes the engine itself has claimed from the page provider for
    /// its own metadata (slot-table chunks for records and scope records),
    /// tracked separately from user allocations (spec.md §9 supplement).
    #[must_use]
    pub fn internal_bytes(&self) -> usize {
        self.index.internal_bytes() + self.scope_stack.internal_bytes()
    }

    pub fn set_low_memory_hook(&mut self, hook: Box<dyn FnMut() + Send>) {
        self.low_memory_hook = Some(hook);
    }

    fn is_outermost(&self) -> bool {
        self.protection.depth() == 0
    }

    fn warn(&mut self, err: EngineError) {
        let context = err.context().clone();
        let counters = self.counters;
        self.recorder.record(EventKind::Warning(err), context, counters);
    }

    fn record_error(&mut self, err: &EngineError) {
        let context = err.context().clone();
        let counters = self.counters;
        self.recorder
            .record(EventKind::Error(err.clone()), context, counters);
    }

    /// Registers every chunk the index and scope stack have claimed from the
    /// page provider with the protection manager, so a chunk acquired by a
    /// slot table growing mid-operation is bracketed by the next
    /// enter/exit cycle just like the chunks claimed at startup.
    /// `register_chunk` is idempotent, so re-registering already-known
    /// chunks here is cheap and harmless.
    fn sync_protected_chunks(&mut self) {
        for chunk in self.index.internal_chunks() {
            self.protection.register_chunk(chunk.base, chunk.size);
        }
        for chunk in self.scope_stack.internal_chunks() {
            self.protection.register_chunk(chunk.base, chunk.size);
        }
    }

    fn update_peaks(&mut self) {
        self.counters.live_bytes = self.index.live_bytes();
        self.counters.live_count = self.index.live_count();
        self.counters.peak_live_bytes = self.counters.peak_live_bytes.max(self.counters.live_bytes);
        self.counters.peak_live_count = self.counters.peak_live_count.max(self.counters.live_count);
    }

    /// Print a summary and unconditionally abort the process. Called on
    /// every fatal path (spec.md §7's "Fatal errors print a summary report,
    /// flush sinks, and trap to abort").
    pub fn trap(&mut self, summary: &str) -> ! {
        self.finalising = true;
        let counters = self.counters;
        self.recorder.record(
            EventKind::Summary {
                message: summary.to_owned(),
            },
            CallContext::internal(0),
            counters,
        );
        self.recorder.flush_sinks();
        match self.abort_hook.as_deref() {
            Some(hook) => hook(summary),
            None => std::process::abort(),
        }
    }

    fn maybe_low_memory_hook(&mut self) {
        if let Some(hook) = self.low_memory_hook.as_mut() {
            hook();
        }
    }

    // ---- 4.7.1 get-memory -------------------------------------------------

    pub fn get_memory(
        &mut self,
        requested_size: usize,
        requested_alignment: usize,
        kind: AllocKind,
        context: CallContext,
    ) -> Result<usize, EngineError> {
        let outermost = self.is_outermost();
        let ordinal = self.next_alloc_ordinal;
        self.next_alloc_ordinal += 1;

        if self.config.allocation_stop == Some(ordinal) {
            self.trap(&format!("allocation-stop ordinal {ordinal} reached"));
        }

        let mut size = requested_size;
        let mut alignment = requested_alignment;

        if size == 0 && outermost && self.config.flags.check_allocs {
            self.warn(EngineError::AllocZero {
                context: context.clone(),
            });
        }

        if kind.page_aligned() {
            alignment = self.config.page_size;
            if kind.page_rounded() {
                size = round_up(size.max(1), self.config.page_size);
            }
        } else if matches!(kind, AllocKind::AlignConstrained) {
            if alignment == 0 {
                if outermost {
                    self.warn(EngineError::ZeroAlign {
                        context: context.clone(),
                    });
                }
                alignment = core::mem::size_of::<usize>();
            } else if !alignment.is_power_of_two() {
                let coerced = alignment.next_power_of_two();
                if outermost {
                    self.warn(EngineError::BadAlign {
                        context: context.clone(),
                        requested: alignment,
                        coerced,
                    });
                }
                alignment = coerced;
            }
            if alignment > self.config.page_size {
                let coerced = self.config.page_size;
                if outermost {
                    self.warn(EngineError::MaxAlign {
                        context: context.clone(),
                        requested: alignment,
                        coerced,
                    });
                }
                alignment = coerced;
            }
        } else if alignment == 0 {
            alignment = core::mem::size_of::<usize>();
        }

        if let Some(limit) = self.config.byte_limit {
            if self.index.live_bytes().saturating_add(size) > limit {
                self.maybe_low_memory_hook();
                let err = EngineError::OutOfMemory {
                    context: context.clone(),
                };
                self.record_error(&err);
                return Err(err);
            }
        }

        if outermost {
            if let Some(freq) = self.config.fault_frequency {
                if freq > 0 && self.rng.next_below(freq) == 0 {
                    self.maybe_low_memory_hook();
                    let err = EngineError::OutOfMemory {
                        context: context.clone(),
                    };
                    self.record_error(&err);
                    return Err(err);
                }
            }
        }

        self.protection.enter(self.page_provider.as_ref());

        let total = self.guard.total_size(size);
        let Some(block) = self.page_provider.alloc_pages(total, alignment) else {
            self.maybe_low_memory_hook();
            self.protection.exit(self.page_provider.as_ref(), METADATA_REST_ACCESS);
            let err = EngineError::OutOfMemory {
                context: context.clone(),
            };
            self.record_error(&err);
            return Err(err);
        };
        let user_base = block + self.guard.user_offset();

        self.guard.initialize(self.page_provider.as_ref(), block, size, kind);

        let profiled = outermost && self.recorder.profile_active();
        let traced = outermost && self.recorder.trace_active();
        let internal = self.protection.depth() > 1;

        let record = AllocationRecord {
            base: user_base,
            size,
            alignment,
            kind,
            in_place_resizes: 0,
            alloc_ordinal: ordinal,
            resize_ordinal: 0,
            context: context.clone(),
            freed: false,
            profiled,
            traced,
            internal,
        };

        if self.index.insert(self.page_provider.as_ref(), record).is_none() {
            self.page_provider.free_pages(block, total);
            self.protection.exit(self.page_provider.as_ref(), METADATA_REST_ACCESS);
            let err = EngineError::OutOfMemory {
                context: context.clone(),
            };
            self.record_error(&err);
            return Err(err);
        }
        self.recently_freed.remove(&user_base);

        if kind.is_scope_bounded() {
            let frame = self.stack_walker.new_frame();
            self.scope_stack.push(self.page_provider.as_ref(), user_base, frame);
        }
        self.sync_protected_chunks();

        if profiled {
            self.recorder.profile_allocation(&context, size);
        }
        if traced {
            self.recorder.trace_alloc(ordinal, user_base, size);
        }

        self.update_peaks();

        if outermost {
            let counters = self.counters;
            self.recorder
                .record(EventKind::LogAlloc { base: user_base, size, kind }, context, counters);
        }

        self.protection.exit(self.page_provider.as_ref(), METADATA_REST_ACCESS);

        Ok(user_base)
    }

    // ---- 4.7.2 resize-memory ----------------------------------------------

    pub fn resize_memory(
        &mut self,
        ptr: Option<usize>,
        new_size: usize,
        alignment: usize,
        kind: AllocKind,
        context: CallContext,
    ) -> Result<Option<usize>, EngineError> {
        let outermost = self.is_outermost();

        let Some(ptr) = ptr else {
            if outermost && self.config.flags.check_reallocs {
                self.warn(EngineError::ReallocNull {
                    context: context.clone(),
                });
            }
            return self.get_memory(new_size, alignment, kind, context).map(Some);
        };

        if let Some(freed) = self.index.find_freed(ptr) {
            let err = EngineError::PreviouslyFreed {
                context: context.clone(),
                freed_at: freed.context.clone(),
            };
            self.record_error(&err);
            return Err(err);
        }

        let Some(containing) = self.index.find_containing(ptr, 0) else {
            let err = self.not_allocated_or_previously_freed(ptr, &context);
            self.record_error(&err);
            return Err(err);
        };

        if containing.base != ptr {
            let err = EngineError::MismatchedFree {
                context: context.clone(),
                allocated_at: containing.context.clone(),
            };
            self.record_error(&err);
            return Err(err);
        }

        let record_kind = containing.kind;
        if record_kind.required_release().is_some() {
            let err = EngineError::IncompatibleRelease {
                context: context.clone(),
                allocated_at: containing.context.clone(),
                alloc_kind: record_kind,
                release_kind: kind,
            };
            self.record_error(&err);
            return Err(err);
        }

        if new_size == 0 {
            if outermost {
                self.warn(EngineError::ReallocZero {
                    context: context.clone(),
                });
            }
            self.free_memory(Some(ptr), AllocKind::Release, context)?;
            return Ok(None);
        }

        let old_size = containing.size;
        let old_alloc_ordinal = containing.alloc_ordinal;
        let old_resize_ordinal = containing.resize_ordinal;
        let old_alignment = containing.alignment;
        let effective_alignment = if alignment == 0 { old_alignment } else { alignment };

        if let Some(stop) = self.config.reallocation_stop {
            if old_resize_ordinal + 1 == stop {
                let matches_allocation_stop = self
                    .config
                    .allocation_stop
                    .is_none_or(|alloc_stop| old_alloc_ordinal == alloc_stop);
                if matches_allocation_stop {
                    self.trap(&format!("reallocation-stop ordinal {stop} reached"));
                }
            }
        }

        if new_size > old_size {
            if let Some(limit) = self.config.byte_limit {
                if self
                    .index
                    .live_bytes()
                    .saturating_sub(old_size)
                    .saturating_add(new_size)
                    > limit
                {
                    self.maybe_low_memory_hook();
                    let err = EngineError::OutOfMemory {
                        context: context.clone(),
                    };
                    self.record_error(&err);
                    return Err(err);
                }
            }
            if outermost {
                if let Some(freq) = self.config.fault_frequency {
                    if freq > 0 && self.rng.next_below(freq) == 0 {
                        self.maybe_low_memory_hook();
                        let err = EngineError::OutOfMemory {
                            context: context.clone(),
                        };
                        self.record_error(&err);
                        return Err(err);
                    }
                }
            }
        }

        if new_size == old_size {
            return Ok(Some(ptr));
        }

        let relocate = self.config.flags.no_free && !kind.in_place_only();

        self.protection.enter(self.page_provider.as_ref());

        let result = if relocate {
            self.relocate(ptr, old_size, new_size, effective_alignment, kind, old_alloc_ordinal, old_resize_ordinal, &context)
        } else if new_size <= old_size {
            self.shrink_in_place(ptr, old_size, new_size)
        } else if kind.in_place_only() {
            Err(EngineError::OutOfMemory {
                context: context.clone(),
            })
        } else if self.config.flags.alloc_upper || new_size > old_size {
            self.relocate(ptr, old_size, new_size, effective_alignment, kind, old_alloc_ordinal, old_resize_ordinal, &context)
        } else {
            Err(EngineError::OutOfMemory {
                context: context.clone(),
            })
        };

        if let Err(ref err) = result {
            self.record_error(err);
        }

        if outermost {
            if let Ok(Some(new_base)) = result {
                let counters = self.counters;
                self.recorder.record(
                    EventKind::LogRealloc {
                        old_base: ptr,
                        new_base,
                        old_size,
                        new_size,
                    },
                    context.clone(),
                    counters,
                );
                if self.recorder.trace_active() {
                    self.recorder.trace_free(old_alloc_ordinal);
                    self.recorder.trace_alloc(old_alloc_ordinal, new_base, new_size);
                }
            }
        }

        self.update_peaks();
        self.protection.exit(self.page_provider.as_ref(), METADATA_REST_ACCESS);

        result.map(Some)
    }

    fn shrink_in_place(&mut self, ptr: usize, _old_size: usize, new_size: usize) -> Result<usize, EngineError> {
        if let Some(record) = self.index.find_exact_mut(ptr) {
            record.size = new_size;
            record.in_place_resizes += 1;
            record.resize_ordinal += 1;
        }
        Ok(ptr)
    }

    #[allow(clippy::too_many_arguments)]
    fn relocate(
        &mut self,
        old_ptr: usize,
        old_size: usize,
        new_size: usize,
        alignment: usize,
        kind: AllocKind,
        alloc_ordinal: u64,
        old_resize_ordinal: u64,
        context: &CallContext,
    ) -> Result<usize, EngineError> {
        let total = self.guard.total_size(new_size);
        let Some(new_block) = self.page_provider.alloc_pages(total, alignment) else {
            self.maybe_low_memory_hook();
            return Err(EngineError::OutOfMemory {
                context: context.clone(),
            });
        };
        let new_base = new_block + self.guard.user_offset();

        self.guard.initialize(self.page_provider.as_ref(), new_block, new_size, kind);
        let copy_len = old_size.min(new_size);
        self.page_provider.copy_bytes(new_base, old_ptr, copy_len);
        if new_size > old_size {
            self.guard
                .fill_grown_tail(self.page_provider.as_ref(), new_base, old_size, new_size, kind);
        }

        let new_record = AllocationRecord {
            base: new_base,
            size: new_size,
            alignment,
            kind,
            in_place_resizes: 0,
            alloc_ordinal,
            resize_ordinal: old_resize_ordinal + 1,
            context: context.clone(),
            freed: false,
            profiled: self.recorder.profile_active(),
            traced: self.recorder.trace_active(),
            internal: self.protection.depth() > 1,
        };

        if self.config.flags.no_free {
            if let Some(old_record) = self.index.find_exact_mut(old_ptr) {
                old_record.freed = true;
                old_record.context = context.clone();
            }
            self.guard
                .mark_freed(self.page_provider.as_ref(), old_ptr, old_size, self.config.flags.preserve);
        } else if let Some(old_record) = self.index.erase(old_ptr) {
            self.guard
                .mark_freed(self.page_provider.as_ref(), old_ptr, old_size, false);
            let old_total = self.guard.total_size(old_record.size);
            let old_block = old_ptr - self.guard.user_offset();
            self.page_provider.free_pages(old_block, old_total);
            self.recently_freed.insert(old_ptr, context.clone());
        }

        self.index
            .insert(self.page_provider.as_ref(), new_record)
            .ok_or_else(|| EngineError::OutOfMemory {
                context: context.clone(),
            })?;
        self.recently_freed.remove(&new_base);
        self.sync_protected_chunks();

        Ok(new_base)
    }

    // ---- 4.7.3 free-memory -------------------------------------------------

    pub fn free_memory(
        &mut self,
        ptr: Option<usize>,
        kind: AllocKind,
        context: CallContext,
    ) -> Result<(), EngineError> {
        let outermost = self.is_outermost();

        let Some(ptr) = ptr else {
            if outermost && self.config.flags.check_frees {
                self.warn(EngineError::FreeNull {
                    context: context.clone(),
                });
            }
            return Ok(());
        };

        if matches!(kind, AllocKind::DeleteScalar | AllocKind::DeleteArray) {
            if self.delete_stack.len() < MAX_DELETE_STACK {
                self.delete_stack.push(context.clone());
            }
        }

        if let Some(freed) = self.index.find_freed(ptr) {
            let err = EngineError::PreviouslyFreed {
                context: context.clone(),
                freed_at: freed.context.clone(),
            };
            self.record_error(&err);
            self.pop_delete_stack(kind);
            return Err(err);
        }

        let Some(containing) = self.index.find_containing(ptr, 0) else {
            let err = self.not_allocated_or_previously_freed(ptr, &context);
            self.record_error(&err);
            self.pop_delete_stack(kind);
            return Err(err);
        };

        if containing.base != ptr {
            let err = EngineError::MismatchedFree {
                context: context.clone(),
                allocated_at: containing.context.clone(),
            };
            self.record_error(&err);
            self.pop_delete_stack(kind);
            return Err(err);
        }

        if !containing.kind.compatible_release(kind) {
            let err = EngineError::IncompatibleRelease {
                context: context.clone(),
                allocated_at: containing.context.clone(),
                alloc_kind: containing.kind,
                release_kind: kind,
            };
            self.record_error(&err);
            self.pop_delete_stack(kind);
            return Err(err);
        }

        if self.config.free_stop.is_some_and(|stop| stop == containing.alloc_ordinal) {
            self.trap(&format!(
                "free-stop ordinal {} reached",
                containing.alloc_ordinal
            ));
        }

        let alloc_ordinal = containing.alloc_ordinal;
        let size = containing.size;

        self.protection.enter(self.page_provider.as_ref());

        if kind.is_scope_bounded() || kind == AllocKind::ScopeRelease {
            self.scope_stack.remove(ptr);
        }

        if self.config.flags.no_free {
            if let Some(record) = self.index.find_exact_mut(ptr) {
                record.freed = true;
                record.context = context.clone();
            }
            self.guard
                .mark_freed(self.page_provider.as_ref(), ptr, size, self.config.flags.preserve);
        } else if let Some(record) = self.index.erase(ptr) {
            self.guard
                .mark_freed(self.page_provider.as_ref(), ptr, size, false);
            let total = self.guard.total_size(record.size);
            let block = ptr - self.guard.user_offset();
            self.page_provider.free_pages(block, total);
            self.recently_freed.insert(ptr, context.clone());
        }

        self.update_peaks();

        if outermost {
            let counters = self.counters;
            self.recorder
                .record(EventKind::LogFree { base: ptr, kind }, context.clone(), counters);
            if self.recorder.trace_active() {
                self.recorder.trace_free(alloc_ordinal);
            }
        }

        self.protection.exit(self.page_provider.as_ref(), METADATA_REST_ACCESS);
        self.pop_delete_stack(kind);

        Ok(())
    }

    /// `not-allocated` unless `ptr` is a base this engine reclaimed earlier
    /// and has since forgotten the full record for, in which case it is
    /// still a `previously-freed` double-free rather than a bogus pointer.
    fn not_allocated_or_previously_freed(&self, ptr: usize, context: &CallContext) -> EngineError {
        if let Some(freed_at) = self.recently_freed.get(&ptr) {
            EngineError::PreviouslyFreed {
                context: context.clone(),
                freed_at: freed_at.clone(),
            }
        } else {
            EngineError::NotAllocated {
                context: context.clone(),
            }
        }
    }

    fn pop_delete_stack(&mut self, kind: AllocKind) {
        if matches!(kind, AllocKind::DeleteScalar | AllocKind::DeleteArray) {
            self.delete_stack.pop();
        }
    }

    /// Release every scope record superseded by the caller's current
    /// frame, in LIFO order, via the ordinary free path. Called on entry to
    /// any engine operation per spec.md §4.4's "on any subsequent engine
    /// entry the engine may unwind".
    pub fn unwind_scopes(&mut self, context: &CallContext) {
        let current = self.stack_walker.new_frame();
        let released = self.scope_stack.unwind(current, self.stack_walker.as_ref());
        for record in released {
            let _ = self.free_memory(Some(record.block), AllocKind::ScopeRelease, context.clone());
        }
    }

    // ---- 4.7.4 bulk-memory operations --------------------------------------

    fn range_check(&mut self, address: usize, size: usize, context: &CallContext) -> Result<(), EngineError> {
        if address == 0 {
            if size == 0 && !self.config.flags.check_memory {
                return Ok(());
            }
            let err = EngineError::NullOperation {
                context: context.clone(),
            };
            self.record_error(&err);
            return Err(err);
        }

        if let Some(record) = self.index.find_containing(address, size) {
            if record.freed {
                let err = EngineError::FreedOperation {
                    context: context.clone(),
                };
                self.record_error(&err);
                return Err(err);
            }
            return Ok(());
        }

        if let Some(freed) = self.find_overlapping_freed(address, size) {
            let err = EngineError::FreedOperation {
                context: context.clone(),
            };
            let _ = freed;
            self.record_error(&err);
            return Err(err);
        }

        if let Some(ceiling) = self.index.find_ceiling(address) {
            if address.saturating_add(size) > ceiling.base && address < ceiling.base {
                let err = EngineError::RangeOverflow {
                    context: context.clone(),
                    base: address,
                    base_plus_len: address + size,
                };
                if self.config.flags.allow_overflow {
                    self.warn(err);
                    return Ok(());
                }
                self.record_error(&err);
                return Err(err);
            }
        }

        Ok(())
    }

    fn find_overlapping_freed(&self, address: usize, size: usize) -> Option<&AllocationRecord> {
        self.index
            .iter()
            .find(|r| r.freed && r.contains_range(address, size.max(1)))
    }

    pub fn set_memory(&mut self, dst: usize, byte: u8, size: usize, context: CallContext) -> Result<(), EngineError> {
        self.unwind_scopes(&context);
        self.range_check(dst, size, &context)?;
        self.page_provider.fill_bytes(dst, byte, size);
        self.counters.total_set += size as u64;
        if self.is_outermost() && self.config.flags.log_memory {
            let counters = self.counters;
            self.recorder
                .record(EventKind::LogMemSet { base: dst, size }, context, counters);
        }
        Ok(())
    }

    pub fn copy_memory(
        &mut self,
        dst: usize,
        src: usize,
        size: usize,
        overlapping_allowed: bool,
        context: CallContext,
    ) -> Result<(), EngineError> {
        self.unwind_scopes(&context);
        self.range_check(dst, size, &context)?;
        self.range_check(src, size, &context)?;

        if !overlapping_allowed && ranges_overlap(dst, src, size) {
            let err = EngineError::RangeOverlap {
                context: context.clone(),
                a_base: dst,
                a_end: dst + size,
                b_base: src,
                b_end: src + size,
            };
            self.warn(err);
        }

        self.page_provider.copy_bytes(dst, src, size);
        self.counters.total_copied += size as u64;
        if self.is_outermost() && self.config.flags.log_memory {
            let counters = self.counters;
            self.recorder
                .record(EventKind::LogMemCopy { dst, src, size }, context, counters);
        }
        Ok(())
    }

    pub fn compare_memory(
        &mut self,
        a: usize,
        b: usize,
        size: usize,
        context: CallContext,
    ) -> Result<Option<usize>, EngineError> {
        self.unwind_scopes(&context);
        self.range_check(a, size, &context)?;
        self.range_check(b, size, &context)?;
        self.counters.total_compared += size as u64;
        if self.is_outermost() && self.config.flags.log_memory {
            let counters = self.counters;
            self.recorder
                .record(EventKind::LogMemCompare { a, b, size }, context, counters);
        }
        Ok(byte_compare(self.page_provider.as_ref(), a, b, size))
    }

    pub fn locate_memory(
        &mut self,
        base: usize,
        size: usize,
        needle: u8,
        context: CallContext,
    ) -> Result<Option<usize>, EngineError> {
        self.unwind_scopes(&context);
        self.range_check(base, size, &context)?;
        self.counters.total_located += size as u64;
        if self.is_outermost() && self.config.flags.log_memory {
            let counters = self.counters;
            self.recorder
                .record(EventKind::LogMemLocate { base, size }, context, counters);
        }
        let bytes = self.page_provider.read_bytes(base, size);
        Ok(bytes.iter().position(|&b| b == needle).map(|off| base + off))
    }

    /// Validates `[base, base+size)` the same way every bulk-memory
    /// operation does, without performing any operation of its own. For ABI
    /// entry points that scan memory but don't map onto one of the other
    /// bulk-memory methods here (e.g. a substring search like `memmem`).
    pub fn check_range(&mut self, base: usize, size: usize, context: CallContext) -> Result<(), EngineError> {
        self.unwind_scopes(&context);
        self.range_check(base, size, &context)
    }

    /// Duplicate a NUL-terminated string (or a length-bounded prefix of
    /// one), scanning for the terminator with the same overrun detection
    /// bulk-memory operations use (spec.md §9 supplement).
    pub fn string_dup(
        &mut self,
        src: usize,
        bound: Option<usize>,
        context: CallContext,
    ) -> Result<usize, EngineError> {
        let kind = if bound.is_some() {
            AllocKind::StrNDup
        } else {
            AllocKind::StrDup
        };

        let scan_limit = bound.unwrap_or(usize::MAX);
        let mut len = 0usize;
        loop {
            if len >= scan_limit {
                break;
            }
            if let Some(ceiling) = self.index.find_ceiling(src) {
                if src + len >= ceiling.base && src < ceiling.base {
                    let err = EngineError::StringOverflow {
                        context: context.clone(),
                        base: src,
                    };
                    self.record_error(&err);
                    return Err(err);
                }
            }
            let byte = self.page_provider.read_bytes(src + len, 1);
            match byte.first() {
                Some(0) | None => break,
                Some(_) => len += 1,
            }
        }

        let new_ptr = self.get_memory(len + 1, 0, kind, context.clone())?;
        self.page_provider.copy_bytes(new_ptr, src, len);
        self.page_provider.fill_bytes(new_ptr + len, 0, 1);
        Ok(new_ptr)
    }

    // ---- 4.7.5 full-heap check ---------------------------------------------

    /// Walks every index entry, verifying guard patterns (byte-guard mode)
    /// and retained-freed bodies. Page-guard overflow verification is
    /// delegated to the OS and is not repeated here. On any mismatch traps
    /// after printing a summary with up to 256 bytes of context.
    pub fn full_heap_check(&mut self) {
        let entries: Vec<(usize, usize, bool, bool)> = self
            .index
            .iter()
            .map(|r| (r.base, r.size, r.freed, self.config.flags.preserve))
            .collect();

        for (base, size, freed, preserved) in entries {
            if !freed {
                if let Some(violation) = self.guard.verify(self.page_provider.as_ref(), base, size) {
                    let (address, context_err) = match violation {
                        crate::guard::GuardViolation::Before(offset) => (base - self.guard.guard_width() + offset, true),
                        crate::guard::GuardViolation::After(offset) => (base + size + offset, false),
                    };
                    let sample = self.guard.sample(self.page_provider.as_ref(), address, 256);
                    let allocated_at = self
                        .index
                        .find_exact(base)
                        .map(|r| r.context.clone())
                        .unwrap_or_default();
                    let err = EngineError::AllocOverflowCorruption {
                        context: CallContext::internal(0),
                        allocated_at,
                        address,
                        sample,
                    };
                    let _ = context_err;
                    self.record_error(&err);
                    self.trap("full-heap check found overflow corruption");
                }
            } else if !preserved {
                if let Some(offset) = self
                    .guard
                    .verify_freed_body(self.page_provider.as_ref(), base, size)
                {
                    let address = base + offset;
                    let sample = self.guard.sample(self.page_provider.as_ref(), address, 256);
                    let allocated_at = self
                        .index
                        .find_exact(base)
                        .map(|r| r.context.clone())
                        .unwrap_or_default();
                    let err = EngineError::FreedCorruption {
                        context: CallContext::internal(0),
                        allocated_at,
                        address,
                        sample,
                    };
                    self.record_error(&err);
                    self.trap("full-heap check found retained-freed corruption");
                }
            }
        }
    }

    /// Called at unload: if the configured minimum is exceeded by what's
    /// still live, traps; otherwise just emits a shutdown summary.
    pub fn shutdown_report(&mut self) {
        let live_bytes = self.index.live_bytes();
        let message = format!(
            "shutdown: {} live blocks, {} live bytes, {} internal bytes",
            self.index.live_count(),
            live_bytes,
            self.internal_bytes()
        );
        if let Some(minimum) = self.config.unfreed_abort_minimum {
            if live_bytes as u64 >= minimum {
                self.trap(&message);
            }
        }
        let counters = self.counters;
        self.recorder
            .record(EventKind::Summary { message }, CallContext::internal(0), counters);
        self.recorder.flush_sinks();
    }

    /// Flushes the trace and profile sinks without the shutdown
    /// bookkeeping `shutdown_report` also performs; exposed for callers
    /// (e.g. a signal handler) that want sinks durable on disk without
    /// tearing down the process.
    pub fn flush_sinks(&mut self) {
        self.recorder.flush_sinks();
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        return value;
    }
    value.div_ceil(multiple) * multiple
}

fn ranges_overlap(a_base: usize, b_base: usize, size: usize) -> bool {
    if size == 0 {
        return false;
    }
    let a_end = a_base + size;
    let b_end = b_base + size;
    a_base < b_end && b_base < a_end
}

fn byte_compare(provider: &dyn PageProvider, a: usize, b: usize, size: usize) -> Option<usize> {
    let a_bytes = provider.read_bytes(a, size);
    let b_bytes = provider.read_bytes(b, size);
    a_bytes
        .iter()
        .zip(b_bytes.iter())
        .position(|(x, y)| x != y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{FakePageProvider, FakeStackWalker, FakeSymbolResolver};

    fn engine_with(config: Config) -> Engine {
        Engine::new(
            config,
            Box::new(FakePageProvider::new()),
            Box::new(FakeStackWalker::new()),
            Box::new(FakeSymbolResolver),
        )
    }

    fn ctx() -> CallContext {
        CallContext {
            function: Some("test".into()),
            ..CallContext::default()
        }
    }

    #[test]
    fn scenario_double_free_reports_previously_freed() {
        let mut engine = engine_with(Config::default());
        let p = engine.get_memory(16, 0, AllocKind::General, ctx()).unwrap();
        engine.free_memory(Some(p), AllocKind::Release, ctx()).unwrap();
        let err = engine.free_memory(Some(p), AllocKind::Release, ctx()).unwrap_err();
        assert!(matches!(err, EngineError::PreviouslyFreed { .. }));
    }

    #[test]
    fn scenario_double_free_in_retain_mode_reports_previously_freed() {
        let mut config = Config::default();
        config.flags.no_free = true;
        let mut engine = engine_with(config);
        let p = engine.get_memory(16, 0, AllocKind::General, ctx()).unwrap();
        engine.free_memory(Some(p), AllocKind::Release, ctx()).unwrap();
        let err = engine.free_memory(Some(p), AllocKind::Release, ctx()).unwrap_err();
        assert!(matches!(err, EngineError::PreviouslyFreed { .. }));
    }

    #[test]
    fn scenario_array_new_deleted_with_scalar_delete_is_incompatible() {
        let mut engine = engine_with(Config::default());
        let p = engine.get_memory(32, 0, AllocKind::NewArray, ctx()).unwrap();
        let err = engine
            .free_memory(Some(p), AllocKind::DeleteScalar, ctx())
            .unwrap_err();
        assert!(matches!(err, EngineError::IncompatibleRelease { alloc_kind: AllocKind::NewArray, release_kind: AllocKind::DeleteScalar, .. }));
    }

    #[test]
    fn scenario_resize_grows_and_preserves_prefix() {
        let mut config = Config::default();
        config.alloc_byte = 0xA1;
        config.flags.alloc_upper = true;
        let mut engine = engine_with(config);
        let p = engine.get_memory(32, 0, AllocKind::General, ctx()).unwrap();
        let q = engine
            .resize_memory(Some(p), 64, 0, AllocKind::Resize, ctx())
            .unwrap()
            .unwrap();
        let record = engine.index.find_exact(q).unwrap();
        assert_eq!(record.size, 64);
        assert_eq!(record.alloc_ordinal, 1);
        assert_eq!(record.resize_ordinal, 1);
    }

    #[test]
    fn scenario_fault_injection_returns_out_of_memory_without_adding_record() {
        let mut config = Config::default();
        config.fault_frequency = Some(1);
        config.fault_seed = 42;
        let mut engine = engine_with(config);
        let err = engine.get_memory(8, 0, AllocKind::General, ctx()).unwrap_err();
        assert!(matches!(err, EngineError::OutOfMemory { .. }));
        assert_eq!(engine.index.len(), 0);
    }

    #[test]
    fn scenario_scope_allocations_auto_release_in_lifo_order() {
        use crate::context::Frame;
        use std::rc::Rc;

        struct SharedWalker(Rc<FakeStackWalker>);
        impl StackWalker for SharedWalker {
            fn new_frame(&self) -> Frame {
                self.0.new_frame()
            }
            fn next_frame(&self, state: Frame) -> Option<Frame> {
                self.0.next_frame(state)
            }
            fn is_same_or_older(&self, a: Frame, b: Frame) -> bool {
                self.0.is_same_or_older(a, b)
            }
        }

        let fake = Rc::new(FakeStackWalker::new());
        fake.unwind_to(5);

        let mut engine = Engine::new(
            Config::default(),
            Box::new(FakePageProvider::new()),
            Box::new(SharedWalker(fake.clone())),
            Box::new(FakeSymbolResolver),
        );

        let p = engine.get_memory(16, 0, AllocKind::ScopeBounded, ctx()).unwrap();
        let q = engine.get_memory(16, 0, AllocKind::ScopeBounded, ctx()).unwrap();
        assert_eq!(engine.scope_stack.len(), 2);

        // The caller's frame has since unwound past both scope allocations.
        fake.unwind_to(20);
        engine.unwind_scopes(&ctx());

        assert!(engine.scope_stack.is_empty());
        assert!(engine.index.find_exact(p).is_none());
        assert!(engine.index.find_exact(q).is_none());
    }

    #[test]
    fn live_byte_and_count_round_trip_after_alloc_then_free() {
        let mut engine = engine_with(Config::default());
        let before = engine.counters();
        let p = engine.get_memory(16, 0, AllocKind::General, ctx()).unwrap();
        engine.free_memory(Some(p), AllocKind::Release, ctx()).unwrap();
        let after = engine.counters();
        assert_eq!(before.live_bytes, after.live_bytes);
        assert_eq!(before.live_count, after.live_count);
        assert!(after.peak_live_bytes >= before.peak_live_bytes);
    }

    #[test]
    fn allocation_ordinals_are_strictly_increasing() {
        let mut engine = engine_with(Config::default());
        let mut last = 0u64;
        for _ in 0..10 {
            let p = engine.get_memory(8, 0, AllocKind::General, ctx()).unwrap();
            let ordinal = engine.index.find_exact(p).unwrap().alloc_ordinal;
            assert!(ordinal > last);
            last = ordinal;
        }
    }

    #[test]
    fn deterministic_trace_preserves_accounting_invariants() {
        let mut engine = engine_with(Config::default());
        let mut live: Vec<usize> = Vec::new();
        let mut lcg_state: u64 = 0xC0FFEE;
        let mut lcg = move || {
            lcg_state = lcg_state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            lcg_state
        };

        for _ in 0..200 {
            let action = lcg() % 3;
            if action == 0 || live.is_empty() {
                let size = 1 + (lcg() % 256) as usize;
                if let Ok(p) = engine.get_memory(size, 0, AllocKind::General, ctx()) {
                    live.push(p);
                }
            } else if action == 1 && !live.is_empty() {
                let idx = (lcg() as usize) % live.len();
                let p = live.remove(idx);
                engine.free_memory(Some(p), AllocKind::Release, ctx()).unwrap();
            } else if !live.is_empty() {
                let idx = (lcg() as usize) % live.len();
                let p = live[idx];
                let new_size = 1 + (lcg() % 256) as usize;
                if let Ok(Some(q)) = engine.resize_memory(Some(p), new_size, 0, AllocKind::Resize, ctx()) {
                    live[idx] = q;
                }
            }
            assert_eq!(engine.counters().live_count, engine.index.live_count());
            assert_eq!(engine.counters().live_bytes, engine.index.live_bytes());
            assert!(engine.counters().peak_live_bytes >= engine.counters().live_bytes);
        }
    }
}
