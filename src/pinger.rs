extern crate pnet;

use log::debug;
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use rand::random;
use regex::Regex;
use wait_timeout::ChildExt;
use pnet::transport::{transport_channel, icmp_packet_iter, TransportReceiver, TransportSender};
use pnet::transport::TransportChannelType::Layer4;
use pnet::transport::TransportProtocol::Ipv4;
use pnet::packet::Packet;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::icmp::{IcmpPacket, IcmpTypes, echo_request};
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::util::checksum;
use crate::checker::{CheckDescriptor, CheckKind, CheckResult, Checker, Execution};
use crate::config::HarnessConfig;
use crate::error::ProbeError;

const PAYLOAD_SIZE: usize = 32;

pub struct IcmpChecker {
    timeout: Duration,
    excerpt_len: usize,
}

#[derive(Debug, Default)]
struct PingSummary {
    sent: u16,
    answered: bool,
    rtts: Vec<f64>,
}

impl PingSummary {
    fn mean_rtt(&self) -> Option<f64> {
        if self.rtts.is_empty() {
            None
        } else {
            Some(self.rtts.iter().sum::<f64>() / self.rtts.len() as f64)
        }
    }
}

impl IcmpChecker {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            timeout: config.timeouts.ping,
            excerpt_len: config.excerpt_len,
        }
    }
}

impl Checker for IcmpChecker {
    fn check(&self, descriptor: &CheckDescriptor, _token: Option<&str>) -> Execution {
        let CheckKind::Ping { host, count } = &descriptor.kind else {
            return CheckResult::from_error(descriptor, &ProbeError::Other(String::from("not a ping check"))).into();
        };
        let timeout = descriptor.timeout.unwrap_or(self.timeout);
        let addr = match resolve_v4(host) {
            Ok(addr) => addr,
            Err(err) => return CheckResult::from_error(descriptor, &err).into(),
        };
        let summary = match transport_channel(4096, Layer4(Ipv4(IpNextHeaderProtocols::Icmp))) {
            Ok((mut tx, mut rx)) => icmp_ping(&mut tx, &mut rx, addr, *count, timeout),
            Err(e) => {
                debug!("Raw ICMP socket unavailable ({}), falling back to system ping", e);
                system_ping(addr, *count, timeout)
            }
        };
        let summary = match summary {
            Ok(summary) => summary,
            Err(err) => return CheckResult::from_error(descriptor, &err).into(),
        };
        let replies = format!("{}/{} replies", summary.rtts.len(), summary.sent);
        let result = if summary.answered {
            CheckResult::success(descriptor)
        } else {
            CheckResult::failed(descriptor, format!("no echo reply from {host}"))
        };
        let result = match summary.mean_rtt() {
            Some(rtt) => result.latency_ms(rtt),
            None => result,
        };
        result.excerpt(&replies, self.excerpt_len).into()
    }
}

fn resolve_v4(host: &str) -> Result<Ipv4Addr, ProbeError> {
    (host, 0)
        .to_socket_addrs()
        .map_err(|e| ProbeError::Other(format!("failed to resolve {host}: {e}")))?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| ProbeError::Other(format!("no IPv4 address for {host}")))
}

pub fn build_echo_request(identifier: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut buffer = vec![0; echo_request::MutableEchoRequestPacket::minimum_packet_size() + payload.len()];
    if let Some(mut icmp) = echo_request::MutableEchoRequestPacket::new(&mut buffer[..]) {
        icmp.set_icmp_type(IcmpTypes::EchoRequest);
        icmp.set_identifier(identifier);
        icmp.set_sequence_number(seq);
        icmp.set_payload(payload);
        let sum = checksum(icmp.packet(), 1);
        icmp.set_checksum(sum);
    }
    buffer
}

/// Sends `count` echo requests, giving each an equal share of `timeout` to be answered.
fn icmp_ping(tx: &mut TransportSender, rx: &mut TransportReceiver, addr: Ipv4Addr, count: u16, timeout: Duration) -> Result<PingSummary, ProbeError> {
    let per_probe = timeout / u32::from(count.max(1));
    let identifier = random::<u16>();
    let payload = [0u8; PAYLOAD_SIZE];
    let mut summary = PingSummary::default();
    let mut iter = icmp_packet_iter(rx);
    for seq in 0..count {
        let buffer = build_echo_request(identifier, seq, &payload);
        let packet = IcmpPacket::new(&buffer)
            .ok_or_else(|| ProbeError::Other(String::from("failed to build echo request")))?;
        let sent = Instant::now();
        tx.send_to(packet, IpAddr::V4(addr))
            .map_err(|e| ProbeError::Unreachable(format!("{addr}: {e}")))?;
        summary.sent += 1;
        loop {
            let elapsed = sent.elapsed();
            if elapsed >= per_probe {
                debug!("icmp seq {} to {} lost", seq, addr);
                break;
            }
            match iter.next_with_timeout(per_probe - elapsed) {
                Ok(Some((packet, source))) => {
                    if source != IpAddr::V4(addr) || packet.get_icmp_type() != IcmpTypes::EchoReply {
                        continue;
                    }
                    match EchoReplyPacket::new(packet.packet()) {
                        Some(reply) if reply.get_identifier() == identifier && reply.get_sequence_number() == seq => {
                            summary.rtts.push(sent.elapsed().as_secs_f64() * 1000.0);
                            summary.answered = true;
                            break;
                        }
                        _ => {}
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(ProbeError::Other(format!("failed to read ICMP reply: {e}"))),
            }
        }
    }
    Ok(summary)
}

/// Runs the platform `ping` binary, bounded by `timeout`.
fn system_ping(addr: Ipv4Addr, count: u16, timeout: Duration) -> Result<PingSummary, ProbeError> {
    let count_flag = if cfg!(windows) { "-n" } else { "-c" };
    let mut child = Command::new("ping")
        .arg(count_flag)
        .arg(count.to_string())
        .arg(addr.to_string())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| ProbeError::Other(format!("failed to run ping: {e}")))?;
    let status = child
        .wait_timeout(timeout)
        .map_err(|e| ProbeError::Other(format!("failed to wait for ping: {e}")))?;
    let Some(status) = status else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(ProbeError::Timeout(timeout));
    };
    let mut output = String::new();
    if let Some(mut stdout) = child.stdout.take() {
        let _ = stdout.read_to_string(&mut output);
    }
    if let Some(last) = output.lines().rev().find(|l| !l.trim().is_empty()) {
        debug!("ping {}: {}", addr, last.trim());
    }
    // ping exits 0 once any reply arrived
    let answered = status.success();
    Ok(PingSummary {
        sent: count,
        answered,
        rtts: if answered { parse_rtts(&output) } else { Vec::new() },
    })
}

fn parse_rtts(output: &str) -> Vec<f64> {
    let Ok(re) = Regex::new(r"time[=<]([0-9.]+)\s*ms") else {
        return Vec::new();
    };
    re.captures_iter(output)
        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse::<f64>().ok()))
        .collect()
}
