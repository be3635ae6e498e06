use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::checker::Outcome;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] yaml_rust::ScanError),
    #[error("config file is empty")]
    Empty,
    #[error("{context}: missing `{field}`")]
    Missing { context: String, field: String },
    #[error("{context}: invalid `{field}`: {reason}")]
    Invalid {
        context: String,
        field: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn missing(context: &str, field: &str) -> Self {
        ConfigError::Missing {
            context: context.to_string(),
            field: field.to_string(),
        }
    }

    pub fn invalid(context: &str, field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            context: context.to_string(),
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Why a single check did not pass. Never escapes the check that raised it.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("command exited with code {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },
    #[error("{0}")]
    Other(String),
}

impl ProbeError {
    pub fn outcome(&self) -> Outcome {
        match self {
            ProbeError::Timeout(_) => Outcome::Timeout,
            ProbeError::Connection(_) => Outcome::ConnectionError,
            ProbeError::Unreachable(_) | ProbeError::CommandFailed { .. } => Outcome::Failed,
            ProbeError::Other(_) => Outcome::Error,
        }
    }

    /// Classifies a socket error raised while connecting or talking to `target`.
    pub fn from_io(err: &io::Error, target: &str, timeout: Duration) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ProbeError::Timeout(timeout),
            io::ErrorKind::ConnectionRefused => {
                ProbeError::Connection(format!("{target}: connection refused"))
            }
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => {
                ProbeError::Connection(format!("{target}: {err}"))
            }
            _ => ProbeError::Unreachable(format!("{target}: {err}")),
        }
    }
}

/// Failure to pull a bearer token out of a login response.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("response is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("no string token at `{0}`")]
    Missing(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_outcomes() {
        let timeout = Duration::from_secs(5);
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        let other = io::Error::new(io::ErrorKind::Other, "no route to host");
        assert_eq!(ProbeError::from_io(&refused, "h:1", timeout).outcome(), Outcome::ConnectionError);
        assert_eq!(ProbeError::from_io(&timed_out, "h:1", timeout).outcome(), Outcome::Timeout);
        assert_eq!(ProbeError::from_io(&other, "h:1", timeout).outcome(), Outcome::Failed);
    }

    #[test]
    fn dropped_connections_are_connection_errors() {
        let timeout = Duration::from_secs(5);
        for kind in [io::ErrorKind::ConnectionReset, io::ErrorKind::BrokenPipe, io::ErrorKind::UnexpectedEof] {
            let err = io::Error::from(kind);
            assert_eq!(ProbeError::from_io(&err, "h:1", timeout).outcome(), Outcome::ConnectionError);
        }
    }

    #[test]
    fn command_failure_is_failed_not_error() {
        let err = ProbeError::CommandFailed { code: 3, stderr: String::from("inactive") };
        assert_eq!(err.outcome(), Outcome::Failed);
        assert_eq!(err.to_string(), "command exited with code 3: inactive");
    }
}
