//! Executes [`FixtureCase`] scripts against a real engine instance (OS-backed
//! pages, real stack probing, real symbolication) and scores the result,
//! the same way a conformance runner replays a fixture against the system
//! under test and diffs the outcome.

use std::collections::HashMap;

use leakspector_core::{AllocKind, CallContext, Config, Engine};
use leakspector_shim::providers::{OsPageProvider, OsStackWalker, OsSymbolResolver};

use crate::fixtures::{FixtureCase, FixtureSet, Step};
use crate::report::{CaseOutcome, ScenarioReport};

/// Runs fixture sets against a fresh [`Engine`] per case, so one case's
/// leftover allocations never leak into the next case's live count.
pub struct TestRunner {
    campaign: String,
}

impl TestRunner {
    #[must_use]
    pub fn new(campaign: impl Into<String>) -> Self {
        Self { campaign: campaign.into() }
    }

    #[must_use]
    pub fn run(&self, fixture_set: &FixtureSet) -> ScenarioReport {
        let outcomes = fixture_set.cases.iter().map(|case| self.run_case(case)).collect();
        ScenarioReport::new(self.campaign.clone(), fixture_set.family.clone(), outcomes)
    }

    fn run_case(&self, case: &FixtureCase) -> CaseOutcome {
        // A case whose script hits a full-heap-check trap panics via the
        // abort hook installed in `fresh_engine`; catch that here so one
        // misbehaving fixture fails only its own case.
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run_steps(case)));
        match outcome {
            Ok(Ok((last_error, live_count))) => self.score(case, last_error, Some(live_count)),
            Ok(Err((index, step, error))) => {
                CaseOutcome::fail(case.name.clone(), format!("step {index} ({step:?}) failed unexpectedly: {error}"))
            }
            Err(panic) => {
                let message = panic_message(&panic);
                CaseOutcome::fail(case.name.clone(), format!("engine trapped: {message}"))
            }
        }
    }

    fn score(&self, case: &FixtureCase, last_error: Option<String>, live_count: Option<usize>) -> CaseOutcome {
        if last_error != case.expect.error {
            return CaseOutcome::fail(
                case.name.clone(),
                format!("expected error {:?}, final step produced {:?}", case.expect.error, last_error),
            );
        }
        if let (Some(expected), Some(actual)) = (case.expect.live_count, live_count) {
            if expected != actual {
                return CaseOutcome::fail(
                    case.name.clone(),
                    format!("expected {expected} live allocations, found {actual}"),
                );
            }
        }
        CaseOutcome::pass(case.name.clone())
    }
}

type StepFailure = (usize, Step, String);

/// Runs every step of a case against a fresh engine, stopping at the first
/// failing non-final step. On success, returns both the final step's error
/// (if the last step was expected to fail, e.g. a deliberate double free)
/// and the resulting live count, so the caller can score both against
/// `case.expect`.
fn run_steps(case: &FixtureCase) -> Result<(Option<String>, usize), StepFailure> {
    let mut engine = fresh_engine();
    let mut labels: HashMap<String, usize> = HashMap::new();
    let mut last_error: Option<String> = None;

    for (index, step) in case.steps.iter().enumerate() {
        let is_last = index + 1 == case.steps.len();
        match execute_step(&mut engine, &mut labels, step) {
            Ok(()) => last_error = None,
            Err(name) => {
                if !is_last {
                    return Err((index, step.clone(), name));
                }
                last_error = Some(name);
            }
        }
    }

    Ok((last_error, engine.counters().live_count))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn fresh_engine() -> Engine {
    let mut engine = Engine::new(
        Config::default(),
        Box::new(OsPageProvider::new()),
        Box::new(OsStackWalker),
        Box::new(OsSymbolResolver),
    );
    // A fixture exercising full-heap corruption or an abort-ordinal should
    // fail that one case, not tear down the whole harness process.
    engine.set_abort_hook(Box::new(|summary| panic!("engine trapped: {summary}")));
    engine
}

/// Maps a fixture's kind string onto the closed `AllocKind` set via its
/// stable [`AllocKind::name`] table, the reverse of how the engine's own
/// logs and reports name kinds.
fn kind_from_str(name: &str) -> AllocKind {
    match name {
        "malloc" => AllocKind::General,
        "calloc" => AllocKind::ZeroInit,
        "valloc" => AllocKind::PageAligned,
        "pvalloc" => AllocKind::PageRounded,
        "memalign" => AllocKind::AlignConstrained,
        "strdup" => AllocKind::StrDup,
        "strndup" => AllocKind::StrNDup,
        "alloca" => AllocKind::ScopeBounded,
        "realloc" => AllocKind::Resize,
        "reallocf" => AllocKind::ResizeZeroFill,
        "recalloc" => AllocKind::Recalloc,
        "expand" => AllocKind::ResizeInPlace,
        "new[]" => AllocKind::NewArray,
        "new" => AllocKind::NewScalar,
        "free" => AllocKind::Release,
        "dealloca" => AllocKind::ScopeRelease,
        "delete" => AllocKind::DeleteScalar,
        "delete[]" => AllocKind::DeleteArray,
        other => panic!("fixture names unknown alloc kind {other:?}"),
    }
}

fn execute_step(engine: &mut Engine, labels: &mut HashMap<String, usize>, step: &Step) -> Result<(), String> {
    match step {
        Step::Alloc { label, size, align, kind } => {
            let base = engine
                .get_memory(*size, *align, kind_from_str(kind), CallContext::internal(0))
                .map_err(error_name)?;
            labels.insert(label.clone(), base);
            Ok(())
        }
        Step::Realloc { label, target, size, kind } => {
            let base = *labels.get(target).unwrap_or_else(|| panic!("fixture refers to unknown label {target:?}"));
            let result = engine
                .resize_memory(Some(base), *size, 0, kind_from_str(kind), CallContext::internal(0))
                .map_err(error_name)?;
            if let Some(new_base) = result {
                labels.insert(label.clone(), new_base);
            }
            Ok(())
        }
        Step::Free { target, kind } => {
            let base = *labels.get(target).unwrap_or_else(|| panic!("fixture refers to unknown label {target:?}"));
            engine.free_memory(Some(base), kind_from_str(kind), CallContext::internal(0)).map_err(error_name)
        }
        Step::StrDup { label, target, bound } => {
            let base = *labels.get(target).unwrap_or_else(|| panic!("fixture refers to unknown label {target:?}"));
            let new_base = engine.string_dup(base, *bound, CallContext::internal(0)).map_err(error_name)?;
            labels.insert(label.clone(), new_base);
            Ok(())
        }
        Step::Set { target, byte, len } => {
            let base = *labels.get(target).unwrap_or_else(|| panic!("fixture refers to unknown label {target:?}"));
            engine.set_memory(base, *byte, *len, CallContext::internal(0)).map_err(error_name)
        }
        Step::UnwindScopes => {
            engine.unwind_scopes(&CallContext::internal(0));
            Ok(())
        }
        Step::FullHeapCheck => {
            engine.full_heap_check();
            Ok(())
        }
    }
}

/// The `thiserror`-derived variant name, e.g. `"PreviouslyFreed"`, used as
/// the engine-error identity a fixture's expectation compares against
/// without pulling in a full `Debug`-format string match.
fn error_name(err: leakspector_core::EngineError) -> String {
    let debug = format!("{err:?}");
    debug.split(|c: char| c == ' ' || c == '{').next().unwrap_or(&debug).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::builtin;

    #[test]
    fn builtin_fixtures_all_pass() {
        let runner = TestRunner::new("builtin");
        let report = runner.run(&builtin());
        for outcome in &report.outcomes {
            assert!(outcome.passed, "{}: {:?}", outcome.name, outcome.detail);
        }
    }
}
