use chrono::{DateTime, Local};
use crate::checker::{CheckDescriptor, CheckResult};
use crate::report::RunReport;

/// Receives harness events as the run progresses.
pub trait Outputs {
    fn run_started(&mut self, _title: &str, _target: &str, _started_at: &DateTime<Local>) {}
    fn suite_started(&mut self, _suite: &str) {}
    fn check_finished(&mut self, result: &CheckResult);
    fn check_skipped(&mut self, _descriptor: &CheckDescriptor) {}
    fn token_obtained(&mut self, _token: &str) {}
    fn run_finished(&mut self, report: &RunReport);
}

/// Discards everything.
pub struct NullOutput;

impl Outputs for NullOutput {
    fn check_finished(&mut self, _result: &CheckResult) {}
    fn run_finished(&mut self, _report: &RunReport) {}
}
