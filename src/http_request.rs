use log::debug;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use std::error::Error as StdError;
use std::io;
use std::time::{Duration, Instant};
use crate::checker::{CheckDescriptor, CheckKind, CheckResult, Checker, Execution, HttpTarget, Method};
use crate::config::HarnessConfig;
use crate::error::ProbeError;

const TIMESTAMP_PLACEHOLDER: &str = "{timestamp}";

pub struct HttpChecker {
    base_url: String,
    timeout: Duration,
    excerpt_len: usize,
}

struct Reply {
    status: u16,
    body: String,
    elapsed: Duration,
}

impl HttpChecker {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            timeout: config.timeouts.http,
            excerpt_len: config.excerpt_len,
        }
    }

    fn exchange(&self, client: &Client, target: &HttpTarget, token: Option<&str>, timeout: Duration) -> Result<Reply, ProbeError> {
        let url = format!("{}{}", self.base_url, target.path);
        let mut request = client
            .request(to_reqwest(target.method), &url)
            .header(CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(payload) = &target.payload {
            request = request.json(&stamp(payload, &chrono::Utc::now().timestamp().to_string()));
        }
        debug!("{} {}", target.method.as_str(), url);
        let start = Instant::now();
        let response = request
            .send()
            .map_err(|e| classify_error(&e, &url, timeout))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| classify_error(&e, &url, timeout))?;
        Ok(Reply { status, body, elapsed: start.elapsed() })
    }

    fn single(&self, descriptor: &CheckDescriptor, client: &Client, target: &HttpTarget, token: Option<&str>, timeout: Duration) -> Execution {
        let reply = match self.exchange(client, target, token, timeout) {
            Ok(reply) => reply,
            Err(err) => return CheckResult::from_error(descriptor, &err).into(),
        };
        let result = if !target.status_passes(reply.status) {
            CheckResult::failed(descriptor, format!("unexpected HTTP status {}", reply.status))
        } else if let Some(mismatch) = descriptor.output_mismatch(&reply.body) {
            CheckResult::failed(descriptor, mismatch)
        } else {
            CheckResult::success(descriptor)
        };
        Execution {
            result: result
                .status(reply.status)
                .latency(reply.elapsed)
                .excerpt(&reply.body, self.excerpt_len),
            body: Some(reply.body),
        }
    }

    /// Fires `repeat` requests back to back and passes when at least `min_passes` of them do.
    fn burst(&self, descriptor: &CheckDescriptor, client: &Client, target: &HttpTarget, token: Option<&str>, timeout: Duration) -> Execution {
        let mut passes = 0;
        let mut latencies = Vec::new();
        let mut last_status = None;
        let mut last_error = None;
        for _ in 0..target.repeat {
            match self.exchange(client, target, token, timeout) {
                Ok(reply) => {
                    if target.status_passes(reply.status) && descriptor.output_mismatch(&reply.body).is_none() {
                        passes += 1;
                    }
                    latencies.push(reply.elapsed.as_secs_f64() * 1000.0);
                    last_status = Some(reply.status);
                }
                Err(err) => last_error = Some(err),
            }
        }
        let status = match (last_status, last_error) {
            (Some(status), _) => status,
            (None, Some(err)) => return CheckResult::from_error(descriptor, &err).into(),
            (None, None) => return CheckResult::failed(descriptor, "no requests sent").into(),
        };
        let summary = format!("{}/{} requests passed", passes, target.repeat);
        let result = if passes >= target.min_passes {
            CheckResult::success(descriptor)
        } else {
            CheckResult::failed(descriptor, summary.clone())
        };
        let mean = latencies.iter().sum::<f64>() / latencies.len() as f64;
        result
            .status(status)
            .latency_ms(mean)
            .excerpt(&summary, self.excerpt_len)
            .into()
    }
}

impl Checker for HttpChecker {
    fn check(&self, descriptor: &CheckDescriptor, token: Option<&str>) -> Execution {
        let CheckKind::HttpRequest(target) = &descriptor.kind else {
            return CheckResult::from_error(descriptor, &ProbeError::Other(String::from("not an HTTP check"))).into();
        };
        let timeout = descriptor.timeout.unwrap_or(self.timeout);
        let client = match Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(e) => {
                return CheckResult::from_error(descriptor, &ProbeError::Other(format!("failed to build HTTP client: {e}"))).into()
            }
        };
        if target.repeat > 1 {
            self.burst(descriptor, &client, target, token, timeout)
        } else {
            self.single(descriptor, &client, target, token, timeout)
        }
    }
}

fn to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
    }
}

fn classify_error(err: &reqwest::Error, url: &str, timeout: Duration) -> ProbeError {
    if err.is_timeout() {
        return ProbeError::Timeout(timeout);
    }
    if let Some(io_err) = io_source(err) {
        return ProbeError::from_io(io_err, url, timeout);
    }
    if err.is_connect() {
        ProbeError::Connection(format!("unable to connect to {url}"))
    } else if err.is_request() {
        // transport failed after connecting, e.g. the peer closed before answering
        ProbeError::Connection(format!("{url}: {}", root_cause(err)))
    } else {
        ProbeError::Other(err.to_string())
    }
}

fn io_source(err: &reqwest::Error) -> Option<&io::Error> {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            return Some(io_err);
        }
        source = inner.source();
    }
    None
}

fn root_cause(err: &reqwest::Error) -> String {
    let mut cause: &dyn StdError = err;
    while let Some(inner) = cause.source() {
        cause = inner;
    }
    cause.to_string()
}

/// Replaces `{timestamp}` in every string of the payload.
fn stamp(payload: &Value, now: &str) -> Value {
    match payload {
        Value::String(s) if s.contains(TIMESTAMP_PLACEHOLDER) => {
            Value::String(s.replace(TIMESTAMP_PLACEHOLDER, now))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| stamp(v, now)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), stamp(v, now)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::Outcome;
    use crate::mock_server::MockServer;
    use serde_json::json;

    fn checker(base_url: String) -> HttpChecker {
        let mut config = HarnessConfig::default();
        config.base_url = base_url;
        config.timeouts.http = Duration::from_secs(5);
        HttpChecker::new(&config)
    }

    fn descriptor(method: Method, path: &str) -> CheckDescriptor {
        CheckDescriptor::new(path, CheckKind::HttpRequest(HttpTarget::new(method, path)))
    }

    fn contact_form(website: &str) -> CheckDescriptor {
        let mut target = HttpTarget::new(Method::Post, "/api/v1/public/contact");
        target.payload = Some(json!({
            "name": "Test User",
            "email": "test.user.{timestamp}@example.com",
            "phone": "+1234567890",
            "subject": "API Test Submission",
            "message": "This is a test contact submission.",
            "source": "api_test",
            "website": website,
        }));
        CheckDescriptor::new("Contact Submission", CheckKind::HttpRequest(target))
    }

    fn contact_service() -> MockServer {
        MockServer::start(|req| {
            let body: Value = serde_json::from_str(&req.body).unwrap_or(Value::Null);
            let website = body["website"].as_str().unwrap_or_default();
            if !website.is_empty() {
                (400, String::from(r#"{"success":false,"error":"spam detected"}"#))
            } else {
                (201, String::from(r#"{"success":true,"data":{"contact_id":7}}"#))
            }
        })
    }

    #[test]
    fn status_below_400_is_success() {
        let server = MockServer::start(|_| (200, String::from(r#"{"status":"healthy"}"#)));
        let execution = checker(server.base_url()).check(&descriptor(Method::Get, "/health"), None);
        assert_eq!(execution.result.outcome, Outcome::Success);
        assert_eq!(execution.result.status_code, Some(200));
        assert!(execution.result.latency_ms.is_some());
        assert_eq!(execution.result.output_excerpt.as_deref(), Some(r#"{"status":"healthy"}"#));
        assert_eq!(execution.body.as_deref(), Some(r#"{"status":"healthy"}"#));
    }

    #[test]
    fn service_unavailable_is_failed_with_503() {
        let server = MockServer::start(|_| (503, String::from("maintenance")));
        let execution = checker(server.base_url()).check(&descriptor(Method::Get, "/ready"), None);
        assert_eq!(execution.result.outcome, Outcome::Failed);
        assert_eq!(execution.result.status_code, Some(503));
    }

    #[test]
    fn honeypot_submission_is_rejected_with_400() {
        let server = contact_service();
        let execution = checker(server.base_url()).check(&contact_form("http://spam-site.com"), None);
        assert_eq!(execution.result.outcome, Outcome::Failed);
        assert_eq!(execution.result.status_code, Some(400));
    }

    #[test]
    fn clean_submission_is_accepted() {
        let server = contact_service();
        let execution = checker(server.base_url()).check(&contact_form(""), None);
        assert_eq!(execution.result.outcome, Outcome::Success);
        assert!(matches!(execution.result.status_code, Some(200) | Some(201)));

        let sent: Value = serde_json::from_str(&server.requests()[0].body).unwrap();
        let email = sent["email"].as_str().unwrap();
        assert!(!email.contains("{timestamp}"), "{email}");
        assert_eq!(server.requests()[0].method, "POST");
    }

    #[test]
    fn expected_status_turns_rejection_into_success() {
        let server = contact_service();
        let mut spam = contact_form("http://spam-site.com");
        if let CheckKind::HttpRequest(target) = &mut spam.kind {
            target.expect_status = vec![400];
        }
        let execution = checker(server.base_url()).check(&spam, None);
        assert_eq!(execution.result.outcome, Outcome::Success);
        assert_eq!(execution.result.status_code, Some(400));
    }

    #[test]
    fn bearer_token_is_sent_when_given() {
        let server = MockServer::start(|_| (200, String::from("{}")));
        let http = checker(server.base_url());
        http.check(&descriptor(Method::Get, "/api/v1/auth/profile"), Some("abc123"));
        http.check(&descriptor(Method::Get, "/api/v1/test"), None);
        let requests = server.requests();
        assert_eq!(requests[0].authorization.as_deref(), Some("Bearer abc123"));
        assert_eq!(requests[1].authorization, None);
    }

    #[test]
    fn refused_connection_is_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let execution = checker(format!("http://{addr}")).check(&descriptor(Method::Get, "/health"), None);
        assert_eq!(execution.result.outcome, Outcome::ConnectionError);
        assert_eq!(execution.result.status_code, None);
    }

    #[test]
    fn peer_hanging_up_is_connection_error() {
        let server = MockServer::hang_up();
        let execution = checker(server.base_url()).check(&descriptor(Method::Get, "/health"), None);
        assert_eq!(execution.result.outcome, Outcome::ConnectionError);
        assert_eq!(execution.result.status_code, None);
        assert!(execution.result.error_message.is_some());
    }

    #[test]
    fn silent_server_times_out() {
        let server = MockServer::silent();
        let mut check = descriptor(Method::Get, "/health");
        check.timeout = Some(Duration::from_millis(300));
        let start = Instant::now();
        let execution = checker(server.base_url()).check(&check, None);
        assert_eq!(execution.result.outcome, Outcome::Timeout);
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn burst_counts_passing_requests() {
        let server = MockServer::start(|_| (200, String::from("ok")));
        let mut target = HttpTarget::new(Method::Get, "/health");
        target.repeat = 5;
        target.min_passes = 4;
        let check = CheckDescriptor::new("Rapid Requests", CheckKind::HttpRequest(target));
        let execution = checker(server.base_url()).check(&check, None);
        assert_eq!(execution.result.outcome, Outcome::Success);
        assert_eq!(execution.result.output_excerpt.as_deref(), Some("5/5 requests passed"));
        assert_eq!(server.requests().len(), 5);
    }

    #[test]
    fn body_mismatch_fails_the_check() {
        let server = MockServer::start(|_| (200, String::from(r#"{"status":"degraded"}"#)));
        let mut check = descriptor(Method::Get, "/health/deep");
        check.expect_output = Some(regex::Regex::new("healthy").unwrap());
        let execution = checker(server.base_url()).check(&check, None);
        assert_eq!(execution.result.outcome, Outcome::Failed);
        assert_eq!(execution.result.status_code, Some(200));
    }
}
