//! The pass/fail report a [`crate::runner::TestRunner`] produces, and its
//! rendering for the `harness` binary's terminal output.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct CaseOutcome {
    pub name: String,
    pub passed: bool,
    pub detail: Option<String>,
}

impl CaseOutcome {
    #[must_use]
    pub fn pass(name: String) -> Self {
        Self { name, passed: true, detail: None }
    }

    #[must_use]
    pub fn fail(name: String, detail: String) -> Self {
        Self { name, passed: false, detail: Some(detail) }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub campaign: String,
    pub family: String,
    pub outcomes: Vec<CaseOutcome>,
}

impl ScenarioReport {
    #[must_use]
    pub fn new(campaign: String, family: String, outcomes: Vec<CaseOutcome>) -> Self {
        Self { campaign, family, outcomes }
    }

    #[must_use]
    pub fn passed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed).count()
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.passed_count()
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed_count() == 0
    }

    /// One line per case, `ok`/`FAIL` prefixed, for terminal output.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = format!(
            "{} / {} ({}): {} passed, {} failed\n",
            self.campaign,
            self.family,
            self.outcomes.len(),
            self.passed_count(),
            self.failed_count()
        );
        for outcome in &self.outcomes {
            if outcome.passed {
                out.push_str(&format!("  ok    {}\n", outcome.name));
            } else {
                out.push_str(&format!(
                    "  FAIL  {} -- {}\n",
                    outcome.name,
                    outcome.detail.as_deref().unwrap_or("no detail")
                ));
            }
        }
        out
    }
}
