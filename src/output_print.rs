use chrono::{DateTime, Local};
use colored::{Color, Colorize};
use crate::checker::{CheckDescriptor, CheckResult, Outcome};
use crate::output::Outputs;
use crate::report::{RunReport, Verdict};

const WIDE_RULE: usize = 80;
const NARROW_RULE: usize = 60;
const LABEL_WIDTH: usize = 40;
const TOKEN_PREVIEW: usize = 20;

/// Human readable report on stdout.
pub struct PrintOutput {
    remediation: Vec<String>,
}

impl PrintOutput {
    pub fn new(remediation: Vec<String>) -> Self {
        Self { remediation }
    }
}

impl Outputs for PrintOutput {
    fn run_started(&mut self, title: &str, target: &str, started_at: &DateTime<Local>) {
        println!("{}", render_header(title, target, started_at));
    }

    fn suite_started(&mut self, suite: &str) {
        println!("{}", render_suite(suite));
    }

    fn check_finished(&mut self, result: &CheckResult) {
        println!("{}", render_result(result));
    }

    fn check_skipped(&mut self, descriptor: &CheckDescriptor) {
        println!("{}", render_skipped(descriptor));
    }

    fn token_obtained(&mut self, token: &str) {
        println!("{}", render_token(token));
    }

    fn run_finished(&mut self, report: &RunReport) {
        println!("{}", render_summary(report, &self.remediation));
    }
}

fn outcome_style(outcome: Outcome) -> (&'static str, Color) {
    match outcome {
        Outcome::Success => ("✅", Color::Green),
        Outcome::Timeout => ("⏱️", Color::Yellow),
        Outcome::Failed | Outcome::ConnectionError | Outcome::Error => ("❌", Color::Red),
    }
}

pub fn render_header(title: &str, target: &str, started_at: &DateTime<Local>) -> String {
    let rule = "=".repeat(WIDE_RULE);
    format!(
        "{}\n{}\n{}\nServer: {}\nTest Time: {}\n",
        rule.cyan().bold(),
        title.cyan().bold(),
        rule.cyan().bold(),
        target,
        started_at.format("%Y-%m-%d %H:%M:%S")
    )
}

pub fn render_suite(suite: &str) -> String {
    format!("{}\n{}", format!("📋 {suite}").blue().bold(), "-".repeat(NARROW_RULE))
}

pub fn render_result(result: &CheckResult) -> String {
    let (icon, color) = outcome_style(result.outcome);
    let mut lines = vec![format!(
        "{} {} {}",
        icon,
        format!("{:<width$}", result.label, width = LABEL_WIDTH).color(color),
        result.outcome
    )];
    if let Some(code) = result.status_code {
        lines.push(format!("   Status Code: {code}"));
    }
    if let Some(ms) = result.latency_ms {
        lines.push(format!("   Response Time: {ms}ms"));
    }
    if let Some(message) = &result.error_message {
        lines.push(format!("   Message: {message}"));
    }
    if let Some(excerpt) = &result.output_excerpt {
        lines.push(format!("   Response: {excerpt}"));
    }
    lines.push(String::new());
    lines.join("\n")
}

pub fn render_skipped(descriptor: &CheckDescriptor) -> String {
    format!(
        "⏭️  {} SKIPPED (no auth token)\n",
        format!("{:<width$}", descriptor.label, width = LABEL_WIDTH).dimmed()
    )
}

pub fn render_token(token: &str) -> String {
    let preview: String = token.chars().take(TOKEN_PREVIEW).collect();
    format!("   🔑 Auth token obtained: {preview}...")
}

pub fn render_summary(report: &RunReport, remediation: &[String]) -> String {
    let rule = "=".repeat(WIDE_RULE);
    let verdict_color = match report.verdict {
        Verdict::FullyOperational => Color::Green,
        Verdict::MostlyOperational => Color::Yellow,
        Verdict::NeedsAttention => Color::Red,
    };
    let mut lines = vec![
        rule.cyan().bold().to_string(),
        "📊 VERIFICATION SUMMARY".cyan().bold().to_string(),
        rule.cyan().bold().to_string(),
        format!("Total Tests: {}", report.total),
        format!("Passed: {}", report.passed.to_string().green()),
        format!("Failed: {}", report.failed.to_string().red()),
    ];
    if !report.skipped.is_empty() {
        lines.push(format!("Skipped: {}", report.skipped.len().to_string().yellow()));
    }
    lines.push(format!(
        "Success Rate: {}",
        format!("{:.1}%", report.success_rate).color(verdict_color)
    ));
    lines.push(format!("Duration: {:.1}s", report.elapsed.as_secs_f64()));
    lines.push(String::new());
    lines.push(format!("DEPLOYMENT STATUS: {}", report.verdict).color(verdict_color).bold().to_string());
    if !remediation.is_empty() {
        lines.push(String::new());
        lines.push("RECOMMENDED ACTIONS".bold().to_string());
        for (i, hint) in remediation.iter().enumerate() {
            lines.push(format!("{}. {}", i + 1, hint));
        }
    }
    lines.join("\n")
}
