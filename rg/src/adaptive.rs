//! Task complexity classification and adaptive timeout calculation.
//!
//! Complexity is a keyword heuristic over the task title and acceptance
//! criteria; the adaptive timeout scales a mode's base timeout by the
//! complexity multiplier and an exponential failure backoff, clamped to
//! configured bounds.

use prdtrack::SelectedTask;

use crate::config::AdaptiveTimeoutConfig;

/// Complexity levels for timeout allocation, in bump order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ComplexityLevel {
    Simple,
    Medium,
    Complex,
    UiHeavy,
}

impl ComplexityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
            Self::UiHeavy => "ui_heavy",
        }
    }

    fn bump(self) -> Self {
        match self {
            Self::Simple => Self::Medium,
            Self::Medium => Self::Complex,
            Self::Complex | Self::UiHeavy => Self::UiHeavy,
        }
    }
}

/// A complexity classification with its timeout parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskComplexity {
    pub level: ComplexityLevel,
    pub base_timeout_seconds: u64,
    pub multiplier: f64,
    pub description: &'static str,
}

struct ComplexityRow {
    complexity: TaskComplexity,
    keywords: &'static [&'static str],
}

/// Classification matrix. Tie-breaks favor earlier rows.
const MATRIX: [ComplexityRow; 4] = [
    ComplexityRow {
        complexity: TaskComplexity {
            level: ComplexityLevel::Simple,
            base_timeout_seconds: 60,
            multiplier: 1.0,
            description: "Simple fixes, updates, refactors",
        },
        keywords: &[
            "fix", "update", "refactor", "rename", "remove", "delete", "add", "change", "replace",
            "correct", "adjust", "simplify",
        ],
    },
    ComplexityRow {
        complexity: TaskComplexity {
            level: ComplexityLevel::Medium,
            base_timeout_seconds: 180,
            multiplier: 1.5,
            description: "Tests, mocks, simple implementations",
        },
        keywords: &[
            "test", "mock", "fixture", "stub", "implement", "basic", "simple", "straightforward",
            "add test", "create test",
        ],
    },
    ComplexityRow {
        complexity: TaskComplexity {
            level: ComplexityLevel::Complex,
            base_timeout_seconds: 300,
            multiplier: 2.0,
            description: "CLI, parsers, complex logic, multi-file",
        },
        keywords: &[
            "cli", "command", "parser", "parsing", "serializer", "complex", "intricate",
            "integration", "middleware",
        ],
    },
    ComplexityRow {
        complexity: TaskComplexity {
            level: ComplexityLevel::UiHeavy,
            base_timeout_seconds: 600,
            multiplier: 3.0,
            description: "UI views, charts, dashboards",
        },
        keywords: &[
            "ui", "view", "chart", "dashboard", "widget", "component", "interface", "screen",
            "navigation", "tab", "list", "grid", "form", "button", "layout", "rendering",
        ],
    },
];

fn complexity_for(level: ComplexityLevel) -> TaskComplexity {
    MATRIX
        .iter()
        .find(|row| row.complexity.level == level)
        .map(|row| row.complexity)
        .expect("every level has a matrix row")
}

/// Classify a task by keyword hits against title + acceptance criteria.
/// More than 5 acceptance criteria bump the result up one level.
pub fn estimate_task_complexity(task: &SelectedTask) -> TaskComplexity {
    let mut searchable = task.title.to_lowercase();
    if !task.acceptance.is_empty() {
        searchable.push(' ');
        searchable.push_str(&task.acceptance.join(" ").to_lowercase());
    }

    let mut best = ComplexityLevel::Simple;
    let mut best_score = 0usize;
    for row in &MATRIX {
        let score = row
            .keywords
            .iter()
            .filter(|kw| searchable.contains(**kw))
            .count();
        // Strictly-greater keeps the tie order of the matrix.
        if score > best_score {
            best = row.complexity.level;
            best_score = score;
        }
    }

    if task.acceptance.len() > 5 {
        best = best.bump();
    }

    complexity_for(best)
}

/// Calculate the timeout for a task attempt:
///
/// ```text
/// base    = mode_timeout or config.default_mode_timeout
/// scale   = complexity.multiplier (if enabled)
///         * failure_multiplier ^ previous_failures (if enabled)
/// timeout = clamp(base * scale, min_timeout, max_timeout)
/// ```
///
/// When the module is disabled, returns `base` unclamped.
pub fn calculate_adaptive_timeout(
    task: &SelectedTask,
    previous_failures: u32,
    config: &AdaptiveTimeoutConfig,
    mode_timeout: Option<u64>,
) -> u64 {
    let base = mode_timeout.unwrap_or(config.default_mode_timeout);
    if !config.enabled {
        return base;
    }

    let mut timeout = base as f64;
    if config.enable_complexity_scaling {
        timeout *= estimate_task_complexity(task).multiplier;
    }
    if config.enable_failure_scaling && previous_failures > 0 {
        timeout *= config
            .timeout_multiplier_per_failure
            .powi(previous_failures as i32);
    }

    (timeout as u64).clamp(config.min_timeout, config.max_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use prdtrack::PrdKind;

    fn task(title: &str, acceptance: &[&str]) -> SelectedTask {
        let mut t = SelectedTask::new("1", title, PrdKind::Markdown);
        t.acceptance = acceptance.iter().map(|s| s.to_string()).collect();
        t
    }

    #[test]
    fn test_keyword_classification() {
        assert_eq!(
            estimate_task_complexity(&task("Fix typo in readme", &[])).level,
            ComplexityLevel::Simple
        );
        assert_eq!(
            estimate_task_complexity(&task("Write test and mock for store", &[])).level,
            ComplexityLevel::Medium
        );
        assert_eq!(
            estimate_task_complexity(&task("Build CLI parser with integration", &[])).level,
            ComplexityLevel::Complex
        );
        assert_eq!(
            estimate_task_complexity(&task("Dashboard view with chart component", &[])).level,
            ComplexityLevel::UiHeavy
        );
    }

    #[test]
    fn test_acceptance_criteria_searched() {
        let t = task("Do the thing", &["renders the dashboard chart", "adds a ui view"]);
        assert_eq!(estimate_task_complexity(&t).level, ComplexityLevel::UiHeavy);
    }

    #[test]
    fn test_many_criteria_bump_level() {
        let criteria = ["a", "b", "c", "d", "e", "f"];
        let t = task("Fix the handler", &criteria);
        // Simple keywords, but 6 criteria bump to medium.
        assert_eq!(estimate_task_complexity(&t).level, ComplexityLevel::Medium);

        let t = task("Dashboard ui chart view", &criteria);
        // Already at the top; the bump caps at UiHeavy.
        assert_eq!(estimate_task_complexity(&t).level, ComplexityLevel::UiHeavy);
    }

    #[test]
    fn test_no_keywords_defaults_simple() {
        assert_eq!(
            estimate_task_complexity(&task("zzz qqq", &[])).level,
            ComplexityLevel::Simple
        );
    }

    #[test]
    fn test_disabled_returns_base() {
        let config = AdaptiveTimeoutConfig {
            enabled: false,
            ..Default::default()
        };
        let t = task("dashboard ui chart", &[]);
        assert_eq!(calculate_adaptive_timeout(&t, 5, &config, Some(42)), 42);
        assert_eq!(
            calculate_adaptive_timeout(&t, 0, &config, None),
            config.default_mode_timeout
        );
    }

    #[test]
    fn test_complexity_and_failure_scaling() {
        let config = AdaptiveTimeoutConfig {
            enabled: true,
            default_mode_timeout: 100,
            min_timeout: 10,
            max_timeout: 10_000,
            enable_complexity_scaling: true,
            enable_failure_scaling: true,
            timeout_multiplier_per_failure: 2.0,
        };
        let t = task("write test for store", &[]);
        // 100 * 1.5 (medium) = 150
        assert_eq!(calculate_adaptive_timeout(&t, 0, &config, None), 150);
        // 100 * 1.5 * 2^2 = 600
        assert_eq!(calculate_adaptive_timeout(&t, 2, &config, None), 600);
    }

    #[test]
    fn test_clamped_to_bounds() {
        let config = AdaptiveTimeoutConfig {
            enabled: true,
            default_mode_timeout: 100,
            min_timeout: 200,
            max_timeout: 400,
            enable_complexity_scaling: true,
            enable_failure_scaling: true,
            timeout_multiplier_per_failure: 3.0,
        };
        let simple = task("fix typo", &[]);
        assert_eq!(calculate_adaptive_timeout(&simple, 0, &config, None), 200);
        let heavy = task("dashboard ui chart view", &[]);
        assert_eq!(calculate_adaptive_timeout(&heavy, 8, &config, None), 400);
    }

    proptest::proptest! {
        /// Classification is deterministic and the adaptive timeout always
        /// lands inside [min_timeout, max_timeout] when enabled.
        #[test]
        fn test_deterministic_and_bounded(
            title in "[a-z ]{0,60}",
            failures in 0u32..12,
            base in 1u64..5000,
        ) {
            let t = task(&title, &[]);
            let first = estimate_task_complexity(&t);
            let second = estimate_task_complexity(&t);
            proptest::prop_assert_eq!(first.level, second.level);

            let config = AdaptiveTimeoutConfig {
                enabled: true,
                default_mode_timeout: base,
                min_timeout: 60,
                max_timeout: 3600,
                ..Default::default()
            };
            let timeout = calculate_adaptive_timeout(&t, failures, &config, None);
            proptest::prop_assert!(timeout >= config.min_timeout);
            proptest::prop_assert!(timeout <= config.max_timeout);
        }
    }
}
