//! Scenario fixtures: small, serializable scripts of engine operations plus
//! the outcome they're expected to produce. Structurally modeled on a
//! conformance harness's fixture/fixture-set split, adapted from
//! input/output POSIX-call records to sequences of allocator operations,
//! since that's the shape of thing this engine actually does.

use serde::{Deserialize, Serialize};

/// One allocator operation in a [`FixtureCase`]'s script.
///
/// `label`s are scoped to the case: a step that allocates gives its result a
/// label, and later steps (`Realloc`, `Free`, `StrDup`) refer back to it by
/// name rather than by raw address, since the real address is only known
/// once the step actually runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Allocate via one of the engine's allocating `AllocKind`s, naming the
    /// kind by its [`leakspector_core::AllocKind::name`] string (`"malloc"`,
    /// `"calloc"`, `"alloca"`, ...).
    Alloc { label: String, size: usize, align: usize, kind: String },
    /// Resize a previous allocation, naming the resizing kind
    /// (`"realloc"`, `"reallocf"`, `"recalloc"`, `"expand"`).
    Realloc { label: String, target: String, size: usize, kind: String },
    /// Release a previous allocation, naming the releasing kind
    /// (`"free"`, `"delete"`, `"delete[]"`, `"dealloca"`).
    Free { target: String, kind: String },
    /// Duplicate a NUL-terminated string, or a bounded prefix of one, that
    /// lives at a previous allocation.
    StrDup { label: String, target: String, bound: Option<usize> },
    /// Write `byte` across `[target, target+len)`.
    Set { target: String, byte: u8, len: usize },
    /// Simulate a function return: releases every scope-bounded allocation
    /// taken since the last call at the same or a deeper stack depth.
    UnwindScopes,
    /// Run the full-heap guard-pattern sweep.
    FullHeapCheck,
}

/// What a case's script is expected to produce.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Expectation {
    /// The `EngineError` variant name the *last* step is expected to fail
    /// with (e.g. `"PreviouslyFreed"`), or `None` if the last step is
    /// expected to succeed.
    #[serde(default)]
    pub error: Option<String>,
    /// The engine's live allocation count after the script runs, if the
    /// case cares to assert it.
    #[serde(default)]
    pub live_count: Option<usize>,
}

/// A single named scenario: a script plus the outcome it should produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureCase {
    pub name: String,
    pub description: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub expect: Expectation,
}

/// A versioned bundle of cases, mirroring the `(version, family,
/// captured_at, cases)` envelope conformance fixture files use so cases can
/// be shipped, diffed, and replayed independently of the binary that
/// produced them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureSet {
    pub version: String,
    pub family: String,
    pub captured_at: String,
    pub cases: Vec<FixtureCase>,
}

impl FixtureSet {
    #[must_use]
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_file(path: &std::path::Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// The scenarios built into the binary, run when no `--fixtures` file is
/// given. Each one exercises an invariant called out by name in the
/// engine's own design: a second free always reports previously-freed, a
/// scope's allocations release in the order the stack unwinds, and so on.
#[must_use]
pub fn builtin() -> FixtureSet {
    FixtureSet {
        version: "1".to_string(),
        family: "leakspector-core".to_string(),
        captured_at: "builtin".to_string(),
        cases: vec![
            FixtureCase {
                name: "malloc_then_free_clears_live_count".to_string(),
                description: "a freed allocation no longer counts as live".to_string(),
                steps: vec![
                    Step::Alloc { label: "a".to_string(), size: 32, align: 0, kind: "malloc".to_string() },
                    Step::Free { target: "a".to_string(), kind: "free".to_string() },
                ],
                expect: Expectation { error: None, live_count: Some(0) },
            },
            FixtureCase {
                name: "double_free_is_previously_freed".to_string(),
                description: "freeing the same pointer twice reports PreviouslyFreed, not a crash".to_string(),
                steps: vec![
                    Step::Alloc { label: "a".to_string(), size: 32, align: 0, kind: "malloc".to_string() },
                    Step::Free { target: "a".to_string(), kind: "free".to_string() },
                    Step::Free { target: "a".to_string(), kind: "free".to_string() },
                ],
                expect: Expectation { error: Some("PreviouslyFreed".to_string()), live_count: None },
            },
            FixtureCase {
                name: "mismatched_release_kind_is_incompatible".to_string(),
                description: "releasing a scalar `new` allocation with `delete[]` is rejected".to_string(),
                steps: vec![
                    Step::Alloc { label: "a".to_string(), size: 32, align: 0, kind: "new".to_string() },
                    Step::Free { target: "a".to_string(), kind: "delete[]".to_string() },
                ],
                expect: Expectation { error: Some("IncompatibleRelease".to_string()), live_count: None },
            },
            FixtureCase {
                name: "realloc_preserves_live_count".to_string(),
                description: "resizing a live block keeps the index at one live entry".to_string(),
                steps: vec![
                    Step::Alloc { label: "a".to_string(), size: 32, align: 0, kind: "malloc".to_string() },
                    Step::Realloc { label: "a".to_string(), target: "a".to_string(), size: 128, kind: "realloc".to_string() },
                ],
                expect: Expectation { error: None, live_count: Some(1) },
            },
            FixtureCase {
                name: "scope_allocations_unwind_on_return".to_string(),
                description: "alloca-style allocations release once the owning frame unwinds".to_string(),
                steps: vec![
                    Step::Alloc { label: "a".to_string(), size: 16, align: 0, kind: "alloca".to_string() },
                    Step::UnwindScopes,
                ],
                expect: Expectation { error: None, live_count: Some(0) },
            },
            FixtureCase {
                name: "strdup_copies_into_a_fresh_allocation".to_string(),
                description: "strdup's result is independently tracked and frees cleanly".to_string(),
                steps: vec![
                    Step::Alloc { label: "src".to_string(), size: 6, align: 0, kind: "malloc".to_string() },
                    Step::Set { target: "src".to_string(), byte: 0, len: 6 },
                    Step::StrDup { label: "dup".to_string(), target: "src".to_string(), bound: None },
                    Step::Free { target: "src".to_string(), kind: "free".to_string() },
                    Step::Free { target: "dup".to_string(), kind: "free".to_string() },
                ],
                expect: Expectation { error: None, live_count: Some(0) },
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let set = builtin();
        let text = set.to_json().expect("serializes");
        let parsed = FixtureSet::from_json(&text).expect("parses");
        assert_eq!(parsed.cases.len(), set.cases.len());
    }
}
