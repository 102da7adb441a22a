//! Error classification.
//!
//! Maps free-form failure text into categorized `ErrorReport`s. Matching is
//! line-based and case-insensitive. Each line is tested against the pattern
//! tables in a fixed order (import, validation, runtime), so the same text
//! always yields the same categories. Text with no recognized line becomes a
//! single runtime report.

use std::collections::BTreeMap;

use crate::types::{ErrorCategory, ErrorReport, Stage};

/// Maximum matched lines kept in one report's detail.
const MAX_DETAIL_LINES: usize = 20;

const IMPORT_PATTERNS: &[&str] = &[
    "module not found",
    "cannot find module",
    "cannot resolve import",
    "failed to resolve import",
    "could not resolve",
    "unresolved import",
    "does not provide an export named",
    "is not exported by",
    "no matching export",
    "modulenotfounderror",
    "importerror",
];

const VALIDATION_PATTERNS: &[&str] = &[
    "unexpected token",
    "syntaxerror",
    "syntax error",
    "parse error",
    "failed to parse",
    "transform failed",
    "unterminated",
    "unexpected end of",
    "adjacent jsx elements",
];

const RUNTIME_PATTERNS: &[&str] = &[
    "missing required file",
    "entry point absent",
    "no such file or directory",
    "enoent",
    "referenceerror",
    "typeerror",
    "is not defined",
    "timed out",
    "session expired",
];

fn patterns_for(category: ErrorCategory) -> &'static [&'static str] {
    match category {
        ErrorCategory::Import => IMPORT_PATTERNS,
        ErrorCategory::Validation => VALIDATION_PATTERNS,
        ErrorCategory::Runtime => RUNTIME_PATTERNS,
    }
}

/// Category of a single line, if any pattern matches.
pub fn classify_line(line: &str) -> Option<ErrorCategory> {
    let lower = line.to_lowercase();
    ErrorCategory::ALL
        .into_iter()
        .find(|category| patterns_for(*category).iter().any(|p| lower.contains(p)))
}

/// Classify one failure payload. The result is never empty.
pub fn classify(stage: Stage, text: &str) -> Vec<ErrorReport> {
    classify_batch(stage, &[text])
}

/// Classify a batch of failure payloads into one report per category.
///
/// Payloads without any recognized line contribute a runtime report carrying
/// their trimmed text. The result is never empty and is ordered by category.
pub fn classify_batch<S: AsRef<str>>(stage: Stage, payloads: &[S]) -> Vec<ErrorReport> {
    let mut matched: BTreeMap<ErrorCategory, Vec<String>> = BTreeMap::new();

    for payload in payloads {
        let text = payload.as_ref();
        let mut recognized = false;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(category) = classify_line(line) {
                recognized = true;
                matched.entry(category).or_default().push(line.to_string());
            }
        }
        if !recognized {
            let detail = text.trim();
            let detail = if detail.is_empty() {
                "unrecognized failure".to_string()
            } else {
                tail_lines(detail, MAX_DETAIL_LINES)
            };
            matched
                .entry(ErrorCategory::Runtime)
                .or_default()
                .push(detail);
        }
    }

    if matched.is_empty() {
        matched.insert(
            ErrorCategory::Runtime,
            vec!["unrecognized failure".to_string()],
        );
    }

    matched
        .into_iter()
        .map(|(category, lines)| {
            let keep = lines.len().min(MAX_DETAIL_LINES);
            ErrorReport::new(category, lines[..keep].join("\n"), stage)
        })
        .collect()
}

/// Count reports per category.
pub fn category_counts(reports: &[ErrorReport]) -> BTreeMap<ErrorCategory, usize> {
    let mut counts = BTreeMap::new();
    for report in reports {
        *counts.entry(report.category).or_insert(0) += 1;
    }
    counts
}

fn tail_lines(text: &str, max: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categories(reports: &[ErrorReport]) -> Vec<ErrorCategory> {
        reports.iter().map(|r| r.category).collect()
    }

    #[test]
    fn recognizes_each_category() {
        let import = classify(
            Stage::Validating,
            "[vite]: Rollup failed to resolve import \"react-icons\" from \"src/App.jsx\"",
        );
        assert_eq!(categories(&import), vec![ErrorCategory::Import]);

        let validation = classify(Stage::Validating, "src/App.jsx:12:4: ERROR: Unexpected token");
        assert_eq!(categories(&validation), vec![ErrorCategory::Validation]);

        let runtime = classify(Stage::Checking, "missing required file: src/main.jsx");
        assert_eq!(categories(&runtime), vec![ErrorCategory::Runtime]);
        assert_eq!(runtime[0].source_stage, Stage::Checking);
    }

    #[test]
    fn unrecognized_text_defaults_to_runtime() {
        let reports = classify(Stage::Validating, "exit status 137");
        assert_eq!(categories(&reports), vec![ErrorCategory::Runtime]);
        assert_eq!(reports[0].detail, "exit status 137");
    }

    #[test]
    fn empty_input_is_never_empty_output() {
        let reports = classify(Stage::Building, "   \n");
        assert_eq!(categories(&reports), vec![ErrorCategory::Runtime]);
        assert_eq!(reports[0].detail, "unrecognized failure");

        let reports = classify_batch::<&str>(Stage::Building, &[]);
        assert_eq!(reports.len(), 1);
    }

    #[test]
    fn noise_lines_do_not_add_runtime_when_something_matched() {
        let output = "vite v5.0.0 building for production...\n\
                      transforming...\n\
                      error: Cannot find module './Counter'\n\
                      build failed in 312ms";
        let reports = classify(Stage::Validating, output);
        assert_eq!(categories(&reports), vec![ErrorCategory::Import]);
        assert_eq!(reports[0].detail, "error: Cannot find module './Counter'");
    }

    #[test]
    fn mixed_output_groups_one_report_per_category() {
        let output = "SyntaxError: Unexpected token '<'\n\
                      Module not found: ./Missing\n\
                      ReferenceError: useState is not defined\n\
                      Module not found: ./Other";
        let reports = classify(Stage::Validating, output);
        assert_eq!(
            categories(&reports),
            vec![
                ErrorCategory::Import,
                ErrorCategory::Validation,
                ErrorCategory::Runtime
            ]
        );
        assert_eq!(
            reports[0].detail,
            "Module not found: ./Missing\nModule not found: ./Other"
        );
    }

    #[test]
    fn classification_is_deterministic() {
        let output = "unexpected token\ncannot resolve import x\nsomething else";
        let first = classify(Stage::Validating, output);
        for _ in 0..10 {
            assert_eq!(classify(Stage::Validating, output), first);
        }
    }

    #[test]
    fn first_matching_table_wins_for_a_line() {
        // Matches both an import and a runtime pattern.
        assert_eq!(
            classify_line("ENOENT: cannot find module 'x'"),
            Some(ErrorCategory::Import)
        );
        assert_eq!(classify_line("all good"), None);
    }

    #[test]
    fn batch_merges_payloads() {
        let reports = classify_batch(
            Stage::Building,
            &["module not found: a", "disk quota exceeded"],
        );
        assert_eq!(
            categories(&reports),
            vec![ErrorCategory::Import, ErrorCategory::Runtime]
        );
        assert_eq!(reports[1].detail, "disk quota exceeded");
    }

    #[test]
    fn long_unrecognized_output_keeps_the_tail() {
        let text: Vec<String> = (0..50).map(|i| format!("line {i}")).collect();
        let reports = classify(Stage::Validating, &text.join("\n"));
        assert!(reports[0].detail.starts_with("line 30"));
        assert!(reports[0].detail.ends_with("line 49"));
    }

    #[test]
    fn counts_reports_per_category() {
        let reports = vec![
            ErrorReport::new(ErrorCategory::Import, "a", Stage::Validating),
            ErrorReport::new(ErrorCategory::Import, "b", Stage::Validating),
            ErrorReport::runtime("c", Stage::Checking),
        ];
        let counts = category_counts(&reports);
        assert_eq!(counts.get(&ErrorCategory::Import), Some(&2));
        assert_eq!(counts.get(&ErrorCategory::Runtime), Some(&1));
        assert_eq!(counts.get(&ErrorCategory::Validation), None);
    }
}
