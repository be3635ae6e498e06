use log::debug;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use crate::checker::{CheckDescriptor, CheckKind, CheckResult, Checker, Execution};
use crate::config::HarnessConfig;
use crate::error::ProbeError;

pub struct TcpConnectChecker {
    timeout: Duration,
}

impl TcpConnectChecker {
    pub fn new(config: &HarnessConfig) -> Self {
        Self { timeout: config.timeouts.port }
    }
}

pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, ProbeError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| ProbeError::Other(format!("failed to resolve {host}: {e}")))?
        .next()
        .ok_or_else(|| ProbeError::Other(format!("no address for {host}")))
}

/// Opens a TCP connection to `host:port` and returns how long the handshake took.
pub fn tcp_connect(host: &str, port: u16, timeout: Duration) -> Result<(TcpStream, Duration), ProbeError> {
    let addr = resolve(host, port)?;
    let start = Instant::now();
    let stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| ProbeError::from_io(&e, &format!("{host}:{port}"), timeout))?;
    Ok((stream, start.elapsed()))
}

impl Checker for TcpConnectChecker {
    fn check(&self, descriptor: &CheckDescriptor, _token: Option<&str>) -> Execution {
        let CheckKind::Port { host, port } = &descriptor.kind else {
            return CheckResult::from_error(descriptor, &ProbeError::Other(String::from("not a port check"))).into();
        };
        let timeout = descriptor.timeout.unwrap_or(self.timeout);
        match tcp_connect(host, *port, timeout) {
            Ok((stream, rtt)) => {
                debug!("{}:{} open after {:?}", host, port, rtt);
                let _ = stream.shutdown(Shutdown::Both);
                CheckResult::success(descriptor)
                    .latency(rtt)
                    .excerpt(&format!("port {port} open"), usize::MAX)
                    .into()
            }
            Err(err) => CheckResult::from_error(descriptor, &err).into(),
        }
    }
}
