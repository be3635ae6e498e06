use std::fmt;
use std::time::Duration;
use regex::Regex;
use serde_json::Value;
use crate::error::ProbeError;

pub const DEFAULT_TOKEN_PATH: &str = "data.token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

impl Method {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpTarget {
    pub method: Method,
    pub path: String,
    pub payload: Option<Value>,
    /// Marks the check whose response carries the bearer token.
    pub login: bool,
    pub token_path: String,
    /// Acceptable status codes. Empty means "anything below 400".
    pub expect_status: Vec<u16>,
    pub repeat: u32,
    pub min_passes: u32,
}

impl HttpTarget {
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            payload: None,
            login: false,
            token_path: String::from(DEFAULT_TOKEN_PATH),
            expect_status: Vec::new(),
            repeat: 1,
            min_passes: 1,
        }
    }

    pub fn status_passes(&self, status: u16) -> bool {
        if self.expect_status.is_empty() {
            status < 400
        } else {
            self.expect_status.contains(&status)
        }
    }
}

#[derive(Debug, Clone)]
pub enum CheckKind {
    Ping { host: String, count: u16 },
    Port { host: String, port: u16 },
    RemoteCommand { command: String },
    HttpRequest(HttpTarget),
}

impl CheckKind {
    pub fn name(&self) -> &'static str {
        match self {
            CheckKind::Ping { .. } => "ping",
            CheckKind::Port { .. } => "port",
            CheckKind::RemoteCommand { .. } => "remote_command",
            CheckKind::HttpRequest(_) => "http",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckDescriptor {
    pub label: String,
    pub suite: String,
    pub kind: CheckKind,
    /// Needs the bearer token produced by an earlier login check.
    pub expected_auth: bool,
    pub expect_output: Option<Regex>,
    pub timeout: Option<Duration>,
}

impl CheckDescriptor {
    pub fn new(label: &str, kind: CheckKind) -> Self {
        Self {
            label: label.to_string(),
            suite: String::new(),
            kind,
            expected_auth: false,
            expect_output: None,
            timeout: None,
        }
    }

    pub fn is_login(&self) -> bool {
        matches!(&self.kind, CheckKind::HttpRequest(target) if target.login)
    }

    /// Returns a failure message when `expect_output` is set and `output` does not match it.
    pub fn output_mismatch(&self, output: &str) -> Option<String> {
        match &self.expect_output {
            Some(re) if !re.is_match(output) => {
                Some(format!("output did not match /{}/", re.as_str()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed,
    Timeout,
    ConnectionError,
    Error,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::Success => "SUCCESS",
            Outcome::Failed => "FAILED",
            Outcome::Timeout => "TIMEOUT",
            Outcome::ConnectionError => "CONNECTION_ERROR",
            Outcome::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    /// Position of the check in the plan, so repeated labels stay distinct.
    pub index: usize,
    pub label: String,
    pub suite: String,
    pub kind: &'static str,
    pub outcome: Outcome,
    pub status_code: Option<u16>,
    pub latency_ms: Option<f64>,
    pub output_excerpt: Option<String>,
    pub error_message: Option<String>,
}

impl CheckResult {
    fn with_outcome(descriptor: &CheckDescriptor, outcome: Outcome) -> Self {
        Self {
            index: 0,
            label: descriptor.label.clone(),
            suite: descriptor.suite.clone(),
            kind: descriptor.kind.name(),
            outcome,
            status_code: None,
            latency_ms: None,
            output_excerpt: None,
            error_message: None,
        }
    }

    pub fn success(descriptor: &CheckDescriptor) -> Self {
        Self::with_outcome(descriptor, Outcome::Success)
    }

    pub fn failed(descriptor: &CheckDescriptor, message: impl Into<String>) -> Self {
        Self::with_outcome(descriptor, Outcome::Failed).message(message)
    }

    pub fn from_error(descriptor: &CheckDescriptor, err: &ProbeError) -> Self {
        Self::with_outcome(descriptor, err.outcome()).message(err.to_string())
    }

    pub fn status(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn latency(mut self, elapsed: Duration) -> Self {
        self.latency_ms = Some(round_ms(elapsed.as_secs_f64() * 1000.0));
        self
    }

    pub fn latency_ms(mut self, ms: f64) -> Self {
        self.latency_ms = Some(round_ms(ms));
        self
    }

    pub fn excerpt(mut self, text: &str, max_len: usize) -> Self {
        if !text.is_empty() {
            self.output_excerpt = Some(excerpt(text, max_len));
        }
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// What a checker hands back: the result plus the untruncated body, if any.
#[derive(Debug)]
pub struct Execution {
    pub result: CheckResult,
    pub body: Option<String>,
}

impl From<CheckResult> for Execution {
    fn from(result: CheckResult) -> Self {
        Execution { result, body: None }
    }
}

pub trait Checker {
    fn check(&self, descriptor: &CheckDescriptor, token: Option<&str>) -> Execution;
}

pub fn excerpt(text: &str, max_len: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_len {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(max_len).collect();
    cut.push_str("...");
    cut
}

fn round_ms(ms: f64) -> f64 {
    (ms * 100.0).round() / 100.0
}
