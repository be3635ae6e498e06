use log::{debug, info, warn};
use std::time::Instant;
use chrono::Local;
use crate::checker::{CheckDescriptor, CheckKind, Checker, Execution};
use crate::config::{HarnessConfig, UnauthenticatedPolicy};
use crate::http_request::HttpChecker;
use crate::output::{NullOutput, Outputs};
use crate::pinger::IcmpChecker;
use crate::remote_command::RemoteCommandChecker;
use crate::report::RunReport;
use crate::session::{extract_token, SessionState};
use crate::tcp_connect::TcpConnectChecker;

pub const DEFAULT_TITLE: &str = "SERVICE VERIFICATION";

/// Runs checks one after another and aggregates their results.
pub struct Harness {
    config: HarnessConfig,
    pinger: IcmpChecker,
    ports: TcpConnectChecker,
    remote: RemoteCommandChecker,
    http: HttpChecker,
    session: SessionState,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            pinger: IcmpChecker::new(&config),
            ports: TcpConnectChecker::new(&config),
            remote: RemoteCommandChecker::new(&config),
            http: HttpChecker::new(&config),
            session: SessionState::new(),
            config,
        }
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    fn checker_for(&self, kind: &CheckKind) -> &dyn Checker {
        match kind {
            CheckKind::Ping { .. } => &self.pinger,
            CheckKind::Port { .. } => &self.ports,
            CheckKind::RemoteCommand { .. } => &self.remote,
            CheckKind::HttpRequest(_) => &self.http,
        }
    }

    fn target(&self) -> &str {
        if self.config.base_url.is_empty() {
            &self.config.remote.host
        } else {
            &self.config.base_url
        }
    }

    pub fn run(&mut self, title: &str, descriptors: &[CheckDescriptor], output: &mut dyn Outputs) -> RunReport {
        self.session = SessionState::new();
        let started_at = Local::now();
        let start = Instant::now();
        output.run_started(title, self.target(), &started_at);
        info!("Running {} checks against {}", descriptors.len(), self.target());

        let mut results = Vec::with_capacity(descriptors.len());
        let mut skipped = Vec::new();
        let mut current_suite: Option<&str> = None;
        for (index, descriptor) in descriptors.iter().enumerate() {
            if !descriptor.suite.is_empty() && current_suite != Some(descriptor.suite.as_str()) {
                output.suite_started(&descriptor.suite);
                current_suite = Some(descriptor.suite.as_str());
            }

            let token = match (descriptor.expected_auth, self.session.token()) {
                (false, _) => None,
                (true, Some(token)) => Some(token.to_string()),
                (true, None) => match self.config.unauthenticated {
                    UnauthenticatedPolicy::Skip => {
                        warn!("Skipping `{}`: no auth token", descriptor.label);
                        output.check_skipped(descriptor);
                        skipped.push(descriptor.label.clone());
                        continue;
                    }
                    UnauthenticatedPolicy::Anonymous => None,
                },
            };

            debug!("Starting {} check `{}`", descriptor.kind.name(), descriptor.label);
            let mut execution = self.execute(descriptor, token.as_deref());
            execution.result.index = index;
            debug!("`{}` finished: {}", descriptor.label, execution.result.outcome);
            if descriptor.is_login() && execution.result.passed() {
                self.capture_token(descriptor, &execution, output);
            }
            self.session.count(execution.result.passed());
            output.check_finished(&execution.result);
            results.push(execution.result);
        }

        let report = RunReport::from_session(
            title,
            started_at,
            start.elapsed(),
            results,
            skipped,
            &self.session,
            &self.config.thresholds,
        );
        info!(
            "{}/{} checks passed ({:.1}%): {}",
            report.passed, report.total, report.success_rate, report.verdict
        );
        output.run_finished(&report);
        report
    }

    /// One attempt plus up to `retries` more while the check keeps failing.
    fn execute(&self, descriptor: &CheckDescriptor, token: Option<&str>) -> Execution {
        let checker = self.checker_for(&descriptor.kind);
        let mut execution = checker.check(descriptor, token);
        for attempt in 1..=self.config.retries {
            if execution.result.passed() {
                break;
            }
            debug!("Retrying `{}` (attempt {})", descriptor.label, attempt + 1);
            execution = checker.check(descriptor, token);
        }
        execution
    }

    fn capture_token(&mut self, descriptor: &CheckDescriptor, execution: &Execution, output: &mut dyn Outputs) {
        let CheckKind::HttpRequest(target) = &descriptor.kind else {
            return;
        };
        let body = execution.body.as_deref().unwrap_or_default();
        match extract_token(body, &target.token_path) {
            Ok(token) => {
                if self.session.auth_token.is_none() {
                    output.token_obtained(&token);
                }
                self.session.record_token(token);
            }
            Err(err) => warn!("`{}` succeeded but no token was extracted: {}", descriptor.label, err),
        }
    }
}

/// Runs `descriptors` with `config` and no console output.
pub fn run(descriptors: &[CheckDescriptor], config: &HarnessConfig) -> RunReport {
    Harness::new(config.clone()).run(DEFAULT_TITLE, descriptors, &mut NullOutput)
}
