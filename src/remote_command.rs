use log::debug;
use ssh2::{ErrorCode, HashType, Session};
use std::io::{self, Read};
use std::thread;
use std::time::{Duration, Instant};
use crate::checker::{CheckDescriptor, CheckKind, CheckResult, Checker, Execution};
use crate::config::{HarnessConfig, RemoteConfig, RemoteCredential};
use crate::error::ProbeError;
use crate::tcp_connect::tcp_connect;

// libssh2 LIBSSH2_ERROR_TIMEOUT
const SSH_ERROR_TIMEOUT: i32 = -9;
const READ_CHUNK: usize = 8192;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

pub struct RemoteCommandChecker {
    remote: RemoteConfig,
    timeout: Duration,
    excerpt_len: usize,
}

impl RemoteCommandChecker {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            remote: config.remote.clone(),
            timeout: config.timeouts.remote_command,
            excerpt_len: config.excerpt_len,
        }
    }

    fn connect(&self, timeout: Duration) -> Result<Session, ProbeError> {
        let (stream, _) = tcp_connect(&self.remote.host, self.remote.port, timeout)?;
        stream
            .set_read_timeout(Some(timeout))
            .and_then(|_| stream.set_write_timeout(Some(timeout)))
            .map_err(|e| ProbeError::Other(format!("failed to configure socket: {e}")))?;

        let mut session = Session::new()
            .map_err(|e| ProbeError::Other(format!("failed to initialize SSH session: {e}")))?;
        session.set_tcp_stream(stream);
        session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        session
            .handshake()
            .map_err(|e| ssh_error(e, "SSH handshake failed", timeout))?;
        if let Some(hash) = session.host_key_hash(HashType::Sha256) {
            let hex: String = hash.iter().map(|b| format!("{b:02x}")).collect();
            debug!("{} host key sha256:{}", self.remote.host, hex);
        }

        let user = self.remote.user.as_str();
        let auth = match &self.remote.credential {
            RemoteCredential::KeyFile { path, passphrase } => {
                if !path.exists() {
                    return Err(ProbeError::Other(format!(
                        "private key file does not exist: {}",
                        path.display()
                    )));
                }
                session.userauth_pubkey_file(user, None, path, passphrase.as_deref())
            }
            RemoteCredential::Password(password) => session.userauth_password(user, password),
            RemoteCredential::Agent => session.userauth_agent(user),
        };
        auth.map_err(|e| ssh_error(e, "SSH authentication failed", timeout))?;
        if !session.authenticated() {
            return Err(ProbeError::Other(String::from("SSH authentication was rejected by the server")));
        }
        Ok(session)
    }

    /// Runs one literal command over a fresh session and collects its output.
    /// The whole exchange, connect included, is bounded by `timeout`.
    pub fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ProbeError> {
        let deadline = Instant::now() + timeout;
        let session = self.connect(timeout)?;
        let mut channel = session
            .channel_session()
            .map_err(|e| ssh_error(e, "failed to open SSH channel", timeout))?;
        channel
            .exec(command)
            .map_err(|e| ssh_error(e, "failed to execute remote command", timeout))?;

        session.set_blocking(false);
        let drained = drain(channel.stream(0), channel.stderr(), deadline, timeout);
        session.set_blocking(true);
        let (stdout, stderr) = match drained {
            Ok(streams) => streams,
            Err(err) => {
                debug!("Abandoning `{}` on {}: {}", command, self.remote.host, err);
                let _ = channel.close();
                return Err(err);
            }
        };
        channel
            .wait_close()
            .map_err(|e| ssh_error(e, "failed waiting for command to finish", timeout))?;
        let exit_status = channel
            .exit_status()
            .map_err(|e| ssh_error(e, "failed to obtain exit status", timeout))?;
        Ok(CommandOutput { stdout, stderr, exit_status })
    }
}

/// Reads stdout and stderr side by side until both reach EOF.
/// Fails with a timeout once `deadline` passes, even if data keeps arriving.
pub fn drain<O: Read, E: Read>(mut stdout: O, mut stderr: E, deadline: Instant, timeout: Duration) -> Result<(String, String), ProbeError> {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut out_open = true;
    let mut err_open = true;
    let mut buf = [0u8; READ_CHUNK];
    while out_open || err_open {
        if Instant::now() >= deadline {
            return Err(ProbeError::Timeout(timeout));
        }
        let mut progressed = false;
        if out_open {
            match pump(&mut stdout, &mut buf, &mut out, "stdout", timeout)? {
                Some(0) => out_open = false,
                Some(_) => progressed = true,
                None => {}
            }
        }
        if err_open {
            match pump(&mut stderr, &mut buf, &mut err, "stderr", timeout)? {
                Some(0) => err_open = false,
                Some(_) => progressed = true,
                None => {}
            }
        }
        if !progressed {
            thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
    Ok((
        String::from_utf8_lossy(&out).into_owned(),
        String::from_utf8_lossy(&err).into_owned(),
    ))
}

/// One read into `sink`. `None` means nothing was ready yet.
fn pump(reader: &mut impl Read, buf: &mut [u8], sink: &mut Vec<u8>, stream: &str, timeout: Duration) -> Result<Option<usize>, ProbeError> {
    match reader.read(buf) {
        Ok(n) => {
            sink.extend_from_slice(&buf[..n]);
            Ok(Some(n))
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(None),
        Err(e) => Err(read_error(&e, stream, timeout)),
    }
}

impl Checker for RemoteCommandChecker {
    fn check(&self, descriptor: &CheckDescriptor, _token: Option<&str>) -> Execution {
        let CheckKind::RemoteCommand { command } = &descriptor.kind else {
            return CheckResult::from_error(descriptor, &ProbeError::Other(String::from("not a remote command"))).into();
        };
        let timeout = descriptor.timeout.unwrap_or(self.timeout);
        let start = Instant::now();
        debug!("ssh {}@{}: {}", self.remote.user, self.remote.host, command);
        let output = match self.run(command, timeout) {
            Ok(output) => output,
            Err(err) => return CheckResult::from_error(descriptor, &err).latency(start.elapsed()).into(),
        };
        let elapsed = start.elapsed();
        let result = classify(descriptor, &output, elapsed, timeout);
        Execution {
            result: result
                .latency(elapsed)
                .excerpt(&output.stdout, self.excerpt_len),
            body: Some(output.stdout),
        }
    }
}

pub fn classify(descriptor: &CheckDescriptor, output: &CommandOutput, elapsed: Duration, timeout: Duration) -> CheckResult {
    if elapsed > timeout {
        return CheckResult::from_error(descriptor, &ProbeError::Timeout(timeout));
    }
    if output.exit_status != 0 {
        let err = ProbeError::CommandFailed {
            code: output.exit_status,
            stderr: output.stderr.trim().to_string(),
        };
        return CheckResult::from_error(descriptor, &err);
    }
    match descriptor.output_mismatch(&output.stdout) {
        Some(mismatch) => CheckResult::failed(descriptor, mismatch),
        None => CheckResult::success(descriptor),
    }
}

fn ssh_error(err: ssh2::Error, context: &str, timeout: Duration) -> ProbeError {
    match err.code() {
        ErrorCode::Session(SSH_ERROR_TIMEOUT) => ProbeError::Timeout(timeout),
        _ => ProbeError::Other(format!("{context}: {err}")),
    }
}

fn read_error(err: &io::Error, stream: &str, timeout: Duration) -> ProbeError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ProbeError::Timeout(timeout),
        _ => ProbeError::Other(format!("failed to read SSH {stream}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::Outcome;
    use regex::Regex;
    use std::cell::Cell;
    use std::net::TcpListener;
    use std::path::PathBuf;
    use std::rc::Rc;

    /// A command that prints forever, like `tail -f`.
    struct Endless;

    impl Read for Endless {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(5));
            buf[0] = b'.';
            Ok(1)
        }
    }

    /// Emits `remaining` bytes of stderr in small chunks, then flags `done`.
    struct Noisy {
        remaining: usize,
        done: Rc<Cell<bool>>,
    }

    impl Read for Noisy {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                self.done.set(true);
                return Ok(0);
            }
            let n = self.remaining.min(4096).min(buf.len());
            buf[..n].fill(b'e');
            self.remaining -= n;
            Ok(n)
        }
    }

    /// Stdout that stays blocked until stderr has been drained, the way a
    /// remote process stalls on a full stderr window.
    struct Stalled {
        done: Rc<Cell<bool>>,
        sent: bool,
    }

    impl Read for Stalled {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.done.get() {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            if self.sent {
                return Ok(0);
            }
            self.sent = true;
            buf[..4].copy_from_slice(b"done");
            Ok(4)
        }
    }

    fn uptime() -> CheckDescriptor {
        CheckDescriptor::new("System Uptime", CheckKind::RemoteCommand { command: String::from("uptime") })
    }

    fn output(stdout: &str, stderr: &str, exit_status: i32) -> CommandOutput {
        CommandOutput { stdout: stdout.to_string(), stderr: stderr.to_string(), exit_status }
    }

    #[test]
    fn zero_exit_is_success() {
        let result = classify(&uptime(), &output(" 10:00 up 3 days", "", 0), Duration::from_secs(1), Duration::from_secs(15));
        assert_eq!(result.outcome, Outcome::Success);
    }

    #[test]
    fn non_zero_exit_carries_stderr() {
        let result = classify(&uptime(), &output("", "command not found\n", 127), Duration::from_secs(1), Duration::from_secs(15));
        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.error_message.as_deref(), Some("command exited with code 127: command not found"));
    }

    #[test]
    fn slow_command_is_timeout() {
        let result = classify(&uptime(), &output("", "", 0), Duration::from_secs(20), Duration::from_secs(15));
        assert_eq!(result.outcome, Outcome::Timeout);
    }

    #[test]
    fn unexpected_output_is_failed() {
        let mut check = uptime();
        check.expect_output = Some(Regex::new("SSH_SUCCESS").unwrap());
        let result = classify(&check, &output("hello", "", 0), Duration::from_secs(1), Duration::from_secs(15));
        assert_eq!(result.outcome, Outcome::Failed);
    }

    #[test]
    fn refused_ssh_port_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut config = HarnessConfig::default();
        config.remote = RemoteConfig {
            host: String::from("127.0.0.1"),
            port,
            user: String::from("ubuntu"),
            credential: RemoteCredential::KeyFile { path: PathBuf::from("/nonexistent.pem"), passphrase: None },
        };
        config.timeouts.remote_command = Duration::from_secs(2);
        let result = RemoteCommandChecker::new(&config).check(&uptime(), None).result;
        assert_eq!(result.outcome, Outcome::ConnectionError);
    }

    #[test]
    fn endless_output_stops_at_the_deadline() {
        let timeout = Duration::from_millis(200);
        let start = Instant::now();
        let result = drain(Endless, io::empty(), start + timeout, timeout);
        assert!(matches!(result, Err(ProbeError::Timeout(_))));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn streams_are_read_side_by_side() {
        let done = Rc::new(Cell::new(false));
        let stdout = Stalled { done: Rc::clone(&done), sent: false };
        let stderr = Noisy { remaining: 64 * 1024, done };
        let timeout = Duration::from_secs(5);
        let (out, err) = drain(stdout, stderr, Instant::now() + timeout, timeout).unwrap();
        assert_eq!(out, "done");
        assert_eq!(err.len(), 64 * 1024);
    }

    #[test]
    fn finished_command_is_drained_before_the_deadline() {
        let timeout = Duration::from_secs(5);
        let (out, err) = drain(&b" 10:00 up 3 days"[..], io::empty(), Instant::now() + timeout, timeout).unwrap();
        assert_eq!(out, " 10:00 up 3 days");
        assert!(err.is_empty());
    }
}
