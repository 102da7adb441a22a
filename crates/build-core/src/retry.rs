//! Retry policy.
//!
//! Decides where a run goes after a stage finishes. The policy is pure: it
//! reads the run's counters and never stores anything itself.
//!
//! Routing:
//! - a clean stage advances, and a clean Checking succeeds
//! - any failure in Planning is fatal (upstream failure)
//! - failures in Building, Validating or Checking return to Building with
//!   only the failing reports, while budgets remain
//! - a category already at its cap, or a run at the global cap, fails the run

use std::collections::BTreeMap;

use crate::config::Config;
use crate::types::{ErrorCategory, ErrorReport, Run, Stage};

/// Why a run ended in failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    /// The reasoning backend failed or produced unusable output.
    UpstreamFailure { detail: String },
    /// A retry budget ran out. `category` is `None` for the global cap.
    BudgetExhausted {
        category: Option<ErrorCategory>,
        cap: u32,
    },
}

impl FailReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpstreamFailure { .. } => "upstream_failure",
            Self::BudgetExhausted { .. } => "budget_exhausted",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::UpstreamFailure { detail } => format!("upstream failure: {detail}"),
            Self::BudgetExhausted {
                category: Some(category),
                cap,
            } => format!("retry budget exhausted for {category} (cap {cap})"),
            Self::BudgetExhausted { category: None, cap } => {
                format!("global retry budget exhausted (cap {cap})")
            }
        }
    }
}

/// Next step for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    /// Move on to the given stage.
    Advance(Stage),
    /// Go back to `target` with only the failing reports as context.
    Retry {
        target: Stage,
        scoped_errors: Vec<ErrorReport>,
    },
    /// Checking passed.
    Succeed,
    /// Terminal failure. `unresolved` holds the reports that caused it.
    Fail {
        reason: FailReason,
        unresolved: Vec<ErrorReport>,
    },
}

impl NextAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Advance(_) => "advance",
            Self::Retry { .. } => "retry",
            Self::Succeed => "succeed",
            Self::Fail { .. } => "fail",
        }
    }
}

/// Retry caps and category priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub per_category_cap: u32,
    pub global_cap: u32,
    /// Evaluation order, highest priority first. Must list every category.
    pub priority: Vec<ErrorCategory>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            per_category_cap: config.per_category_retry_cap,
            global_cap: config.global_retry_cap,
            priority: config.category_priority.clone(),
        }
    }

    /// Position of a category in the priority order. Unlisted categories sort last.
    pub fn rank(&self, category: ErrorCategory) -> usize {
        self.priority
            .iter()
            .position(|c| *c == category)
            .unwrap_or(self.priority.len())
    }

    /// Decide the next action after `stage` produced `reports`.
    pub fn decide(
        &self,
        stage: Stage,
        reports: &[ErrorReport],
        retry_counts: &BTreeMap<ErrorCategory, u32>,
        total_retries: u32,
    ) -> NextAction {
        if reports.is_empty() {
            return match stage.next() {
                Some(next) => NextAction::Advance(next),
                None => NextAction::Succeed,
            };
        }

        let mut scoped = reports.to_vec();
        scoped.sort_by_key(|r| self.rank(r.category));

        if stage == Stage::Planning {
            let detail = scoped
                .iter()
                .map(|r| r.detail.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            // Upstream failures carry no categories, whatever the cause.
            return NextAction::Fail {
                reason: FailReason::UpstreamFailure { detail },
                unresolved: Vec::new(),
            };
        }

        for category in self.present_categories(&scoped) {
            let used = retry_counts.get(&category).copied().unwrap_or(0);
            if used >= self.per_category_cap {
                return NextAction::Fail {
                    reason: FailReason::BudgetExhausted {
                        category: Some(category),
                        cap: self.per_category_cap,
                    },
                    unresolved: scoped,
                };
            }
        }

        if total_retries >= self.global_cap {
            return NextAction::Fail {
                reason: FailReason::BudgetExhausted {
                    category: None,
                    cap: self.global_cap,
                },
                unresolved: scoped,
            };
        }

        NextAction::Retry {
            target: Stage::Building,
            scoped_errors: scoped,
        }
    }

    /// Distinct categories in priority order.
    pub fn present_categories(&self, reports: &[ErrorReport]) -> Vec<ErrorCategory> {
        let mut categories: Vec<ErrorCategory> = Vec::new();
        for report in reports {
            if !categories.contains(&report.category) {
                categories.push(report.category);
            }
        }
        categories.sort_by_key(|c| self.rank(*c));
        categories
    }

    /// Charge one retry to the run: every failing category and the global counter.
    pub fn record_retry(&self, run: &mut Run, scoped_errors: &[ErrorReport]) {
        for category in self.present_categories(scoped_errors) {
            *run.retry_counts.entry(category).or_insert(0) += 1;
        }
        run.total_retries += 1;
    }
}
