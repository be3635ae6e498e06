use std::fmt;
use std::time::Duration;
use chrono::{DateTime, Local};
use crate::checker::CheckResult;
use crate::config::Thresholds;
use crate::session::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    FullyOperational,
    MostlyOperational,
    NeedsAttention,
}

impl Verdict {
    pub fn from_rate(success_rate: f64, thresholds: &Thresholds) -> Self {
        if success_rate >= thresholds.operational {
            Verdict::FullyOperational
        } else if success_rate >= thresholds.degraded {
            Verdict::MostlyOperational
        } else {
            Verdict::NeedsAttention
        }
    }

    pub fn is_passing(&self) -> bool {
        *self != Verdict::NeedsAttention
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verdict::FullyOperational => "FULLY OPERATIONAL",
            Verdict::MostlyOperational => "MOSTLY OPERATIONAL",
            Verdict::NeedsAttention => "NEEDS ATTENTION",
        };
        f.write_str(name)
    }
}

/// Rounded to one decimal; 0 when nothing ran.
pub fn success_rate(passed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let rate = passed.min(total) as f64 / total as f64 * 100.0;
    (rate * 10.0).round() / 10.0
}

#[derive(Debug)]
pub struct RunReport {
    pub title: String,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
    pub results: Vec<CheckResult>,
    /// Labels of checks that never ran because they needed a token nobody produced.
    pub skipped: Vec<String>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub verdict: Verdict,
}

impl RunReport {
    /// Tallies `results` directly, for callers that did not track a session.
    pub fn new(title: &str, started_at: DateTime<Local>, elapsed: Duration, results: Vec<CheckResult>, skipped: Vec<String>, thresholds: &Thresholds) -> Self {
        let mut tally = SessionState::new();
        for result in &results {
            tally.count(result.passed());
        }
        Self::from_session(title, started_at, elapsed, results, skipped, &tally, thresholds)
    }

    /// Takes the counts kept by `session` while the checks ran.
    pub fn from_session(title: &str, started_at: DateTime<Local>, elapsed: Duration, results: Vec<CheckResult>, skipped: Vec<String>, session: &SessionState, thresholds: &Thresholds) -> Self {
        debug_assert_eq!(session.total, results.len());
        let total = session.total;
        let passed = session.passed.min(total);
        let rate = success_rate(passed, total);
        Self {
            title: title.to_string(),
            started_at,
            elapsed,
            results,
            skipped,
            total,
            passed,
            failed: total - passed,
            success_rate: rate,
            verdict: Verdict::from_rate(rate, thresholds),
        }
    }
}
