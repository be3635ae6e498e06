use log::warn;
use clap::{Arg, ArgAction, ArgMatches, Command};
use regex::Regex;
use serde_json::{Map, Number, Value};
use yaml_rust::{YamlLoader, Yaml};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use crate::checker::{CheckDescriptor, CheckKind, HttpTarget, Method};
use crate::error::ConfigError;

pub const DEFAULT_PING_COUNT: u16 = 3;
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_EXCERPT_LEN: usize = 200;

pub struct CmdOptions {
    pub verbose: bool,
    pub config: String,
    pub suites: Vec<String>,
    pub overrides: Overrides,
}

/// Command line values that replace what the plan file says.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub host: Option<String>,
    pub base_url: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Timeouts {
    pub ping: Duration,
    pub port: Duration,
    pub remote_command: Duration,
    pub http: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ping: Duration::from_secs(10),
            port: Duration::from_secs(5),
            remote_command: Duration::from_secs(15),
            http: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    pub operational: f64,
    pub degraded: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { operational: 90.0, degraded: 70.0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCredential {
    KeyFile { path: PathBuf, passphrase: Option<String> },
    Password(String),
    Agent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credential: RemoteCredential,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_SSH_PORT,
            user: String::new(),
            credential: RemoteCredential::Agent,
        }
    }
}

/// What happens to an `auth` check when no login produced a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnauthenticatedPolicy {
    Skip,
    Anonymous,
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub base_url: String,
    pub remote: RemoteConfig,
    pub timeouts: Timeouts,
    pub retries: u32,
    pub thresholds: Thresholds,
    pub excerpt_len: usize,
    pub unauthenticated: UnauthenticatedPolicy,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            remote: RemoteConfig::default(),
            timeouts: Timeouts::default(),
            retries: 0,
            thresholds: Thresholds::default(),
            excerpt_len: DEFAULT_EXCERPT_LEN,
            unauthenticated: UnauthenticatedPolicy::Skip,
        }
    }
}

/// A loaded plan file: harness settings plus the ordered checks.
pub struct Plan {
    pub title: String,
    pub config: HarnessConfig,
    pub checks: Vec<CheckDescriptor>,
    pub remediation: Vec<String>,
}

pub fn cli() -> Command {
    Command::new("contact-checker")
        .about("Smoke tests and diagnostics for the contact management service")
        .arg(Arg::new("config")
            .short('c')
            .long("config")
            .value_name("FILE")
            .required(true)
            .help("Plan file"))
        .arg(Arg::new("verbose")
            .short('v')
            .action(ArgAction::SetTrue)
            .help("Be verbose"))
        .arg(Arg::new("suite")
            .short('s')
            .long("suite")
            .action(ArgAction::Append)
            .help("Only run the named suite (repeatable)"))
        .arg(Arg::new("base_url")
            .long("base-url")
            .help("Override target.base_url"))
        .arg(Arg::new("host")
            .long("host")
            .help("Override target.host"))
        .arg(Arg::new("key")
            .long("key")
            .value_name("PATH")
            .help("Override remote.key"))
}

impl CmdOptions {
    pub fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            verbose: matches.get_flag("verbose"),
            config: matches.get_one::<String>("config").cloned().unwrap_or_default(),
            suites: matches
                .get_many::<String>("suite")
                .map(|values| values.cloned().collect())
                .unwrap_or_default(),
            overrides: Overrides {
                host: matches.get_one::<String>("host").cloned(),
                base_url: matches.get_one::<String>("base_url").cloned(),
                key: matches.get_one::<String>("key").cloned(),
            },
        }
    }
}

pub fn parse_args() -> CmdOptions {
    CmdOptions::from_matches(&cli().get_matches())
}

pub fn load_plan(opts: &CmdOptions) -> Result<Plan, ConfigError> {
    let text_config = fs::read_to_string(&opts.config).map_err(|source| ConfigError::Read {
        path: opts.config.clone(),
        source,
    })?;
    let mut plan = Plan::parse(&text_config, &opts.overrides)?;
    if !opts.suites.is_empty() {
        plan.retain_suites(&opts.suites)?;
    }
    Ok(plan)
}

impl Plan {
    pub fn from_yaml_str(text: &str) -> Result<Plan, ConfigError> {
        Plan::parse(text, &Overrides::default())
    }

    pub fn parse(text: &str, overrides: &Overrides) -> Result<Plan, ConfigError> {
        let docs = YamlLoader::load_from_str(text)?;
        let doc = docs.into_iter().next().ok_or(ConfigError::Empty)?;
        let target = &doc["target"];

        let host = overrides
            .host
            .clone()
            .or_else(|| string_field(target, "host"));
        let mut config = HarnessConfig::default();
        config.base_url = overrides
            .base_url
            .clone()
            .or_else(|| string_field(target, "base_url"))
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string();
        config.remote = parse_remote(&doc["remote"], host.as_deref(), overrides)?;
        config.timeouts = parse_timeouts(&doc["timeouts"])?;
        config.thresholds = parse_thresholds(&doc["thresholds"])?;
        if let Some(retries) = integer_field(&doc, "retries", "config")? {
            config.retries = to_count(retries, "config", "retries")?;
        }
        if let Some(len) = integer_field(&doc, "excerpt_len", "config")? {
            config.excerpt_len = usize::try_from(len)
                .map_err(|_| ConfigError::invalid("config", "excerpt_len", format!("{len} is not a length")))?;
        }
        config.unauthenticated = match doc["unauthenticated"].as_str() {
            None | Some("skip") => UnauthenticatedPolicy::Skip,
            Some("anonymous") => UnauthenticatedPolicy::Anonymous,
            Some(other) => {
                return Err(ConfigError::invalid(
                    "config",
                    "unauthenticated",
                    format!("expected `skip` or `anonymous`, got `{other}`"),
                ))
            }
        };

        let suites = doc["suites"]
            .as_vec()
            .ok_or_else(|| ConfigError::missing("config", "suites"))?;
        let mut checks = Vec::new();
        for (suite_idx, suite) in suites.iter().enumerate() {
            let suite_name = string_field(suite, "name")
                .unwrap_or_else(|| format!("SUITE {}", suite_idx + 1));
            let suite_checks = suite["checks"].as_vec().ok_or_else(|| {
                ConfigError::missing(&format!("suite `{suite_name}`"), "checks")
            })?;
            for (check_idx, value) in suite_checks.iter().enumerate() {
                let context = format!("suite `{}` check #{}", suite_name, check_idx + 1);
                let mut descriptor = parse_check(value, &context, host.as_deref())?;
                descriptor.suite = suite_name.clone();
                checks.push(descriptor);
            }
        }

        let plan = Plan {
            title: string_field(&doc, "title")
                .unwrap_or_else(|| String::from("SERVICE VERIFICATION")),
            config,
            checks,
            remediation: string_list(&doc["remediation"]),
        };
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let needs_http = self
            .checks
            .iter()
            .any(|c| matches!(c.kind, CheckKind::HttpRequest(_)));
        if needs_http && self.config.base_url.is_empty() {
            return Err(ConfigError::missing("target", "base_url"));
        }
        let needs_ssh = self
            .checks
            .iter()
            .any(|c| matches!(c.kind, CheckKind::RemoteCommand { .. }));
        if needs_ssh {
            if self.config.remote.host.is_empty() {
                return Err(ConfigError::missing("remote", "host"));
            }
            if self.config.remote.user.is_empty() {
                return Err(ConfigError::missing("remote", "user"));
            }
        }
        let mut seen_login = false;
        for check in &self.checks {
            if check.is_login() {
                seen_login = true;
            } else if check.expected_auth && !seen_login {
                warn!("`{}` needs auth but no login check runs before it", check.label);
            }
        }
        Ok(())
    }

    /// Keeps only checks from suites whose name matches one of `names` (case-insensitive).
    pub fn retain_suites(&mut self, names: &[String]) -> Result<(), ConfigError> {
        self.checks
            .retain(|c| names.iter().any(|n| n.eq_ignore_ascii_case(&c.suite)));
        if self.checks.is_empty() {
            return Err(ConfigError::invalid(
                "command line",
                "suite",
                format!("no suite named {}", names.join(", ")),
            ));
        }
        Ok(())
    }
}

fn parse_remote(node: &Yaml, host: Option<&str>, overrides: &Overrides) -> Result<RemoteConfig, ConfigError> {
    let mut remote = RemoteConfig::default();
    remote.host = string_field(node, "host")
        .or_else(|| host.map(str::to_string))
        .unwrap_or_default();
    if let Some(host) = &overrides.host {
        remote.host = host.clone();
    }
    remote.user = string_field(node, "user").unwrap_or_default();
    if let Some(port) = integer_field(node, "port", "remote")? {
        remote.port = to_port(port, "remote")?;
    }
    let key = overrides.key.clone().or_else(|| string_field(node, "key"));
    remote.credential = if let Some(path) = key {
        RemoteCredential::KeyFile {
            path: PathBuf::from(path),
            passphrase: string_field(node, "passphrase"),
        }
    } else if let Some(password) = string_field(node, "password") {
        RemoteCredential::Password(password)
    } else {
        RemoteCredential::Agent
    };
    Ok(remote)
}

fn parse_timeouts(node: &Yaml) -> Result<Timeouts, ConfigError> {
    let mut timeouts = Timeouts::default();
    if let Some(d) = seconds(&node["ping"], "timeouts", "ping")? {
        timeouts.ping = d;
    }
    if let Some(d) = seconds(&node["port"], "timeouts", "port")? {
        timeouts.port = d;
    }
    if let Some(d) = seconds(&node["remote_command"], "timeouts", "remote_command")? {
        timeouts.remote_command = d;
    }
    if let Some(d) = seconds(&node["http"], "timeouts", "http")? {
        timeouts.http = d;
    }
    Ok(timeouts)
}

fn parse_thresholds(node: &Yaml) -> Result<Thresholds, ConfigError> {
    let mut thresholds = Thresholds::default();
    if let Some(v) = number(&node["operational"], "thresholds", "operational")? {
        thresholds.operational = v;
    }
    if let Some(v) = number(&node["degraded"], "thresholds", "degraded")? {
        thresholds.degraded = v;
    }
    if thresholds.degraded > thresholds.operational {
        return Err(ConfigError::invalid(
            "thresholds",
            "degraded",
            "must not exceed `operational`",
        ));
    }
    Ok(thresholds)
}

fn parse_check(value: &Yaml, context: &str, default_host: Option<&str>) -> Result<CheckDescriptor, ConfigError> {
    let check_type = string_field(value, "check").ok_or_else(|| ConfigError::missing(context, "check"))?;
    let label = string_field(value, "label").ok_or_else(|| ConfigError::missing(context, "label"))?;
    let host = || {
        string_field(value, "host")
            .or_else(|| default_host.map(str::to_string))
            .ok_or_else(|| ConfigError::missing(context, "host"))
    };
    let kind = match check_type.as_str() {
        "ping" => CheckKind::Ping {
            host: host()?,
            count: match integer_field(value, "count", context)? {
                Some(c) if (1..=u16::MAX as i64).contains(&c) => c as u16,
                Some(_) => return Err(ConfigError::invalid(context, "count", "must be at least 1")),
                None => DEFAULT_PING_COUNT,
            },
        },
        "port" => CheckKind::Port {
            host: host()?,
            port: match integer_field(value, "port", context)? {
                Some(p) => to_port(p, context)?,
                None => return Err(ConfigError::missing(context, "port")),
            },
        },
        "remote_command" => CheckKind::RemoteCommand {
            command: string_field(value, "command")
                .ok_or_else(|| ConfigError::missing(context, "command"))?,
        },
        "http" => CheckKind::HttpRequest(parse_http(value, context)?),
        other => {
            return Err(ConfigError::invalid(context, "check", format!("unknown check type `{other}`")))
        }
    };
    let mut descriptor = CheckDescriptor::new(&label, kind);
    descriptor.expected_auth = value["auth"].as_bool().unwrap_or(false);
    descriptor.timeout = seconds(&value["timeout"], context, "timeout")?;
    if let Some(pattern) = string_field(value, "expect_output") {
        let re = Regex::new(&pattern)
            .map_err(|e| ConfigError::invalid(context, "expect_output", e.to_string()))?;
        descriptor.expect_output = Some(re);
    }
    Ok(descriptor)
}

fn parse_http(value: &Yaml, context: &str) -> Result<HttpTarget, ConfigError> {
    let method = match string_field(value, "method") {
        Some(name) => Method::parse(&name)
            .ok_or_else(|| ConfigError::invalid(context, "method", format!("unsupported method `{name}`")))?,
        None => Method::Get,
    };
    let path = string_field(value, "path").ok_or_else(|| ConfigError::missing(context, "path"))?;
    let mut target = HttpTarget::new(method, &path);
    if !value["payload"].is_badvalue() {
        target.payload = Some(yaml_to_json(&value["payload"]));
    }
    target.login = value["login"].as_bool().unwrap_or(false);
    if let Some(token_path) = string_field(value, "token_path") {
        target.token_path = token_path;
    }
    target.expect_status = match &value["expect_status"] {
        Yaml::BadValue => Vec::new(),
        Yaml::Integer(code) => vec![to_status(*code, context)?],
        Yaml::Array(codes) => {
            let mut parsed = Vec::new();
            for code in codes {
                match code.as_i64() {
                    Some(c) => parsed.push(to_status(c, context)?),
                    None => return Err(ConfigError::invalid(context, "expect_status", "codes must be integers")),
                }
            }
            parsed
        }
        _ => return Err(ConfigError::invalid(context, "expect_status", "expected a code or a list of codes")),
    };
    if let Some(repeat) = integer_field(value, "repeat", context)? {
        target.repeat = to_count(repeat, context, "repeat")?;
        if target.repeat < 1 {
            return Err(ConfigError::invalid(context, "repeat", "must be at least 1"));
        }
    }
    target.min_passes = match integer_field(value, "min_passes", context)? {
        Some(m) => match u32::try_from(m) {
            Ok(m) if m >= 1 && m <= target.repeat => m,
            _ => return Err(ConfigError::invalid(context, "min_passes", "must be between 1 and `repeat`")),
        },
        None => target.repeat,
    };
    Ok(target)
}

fn string_field(node: &Yaml, key: &str) -> Option<String> {
    match &node[key] {
        Yaml::String(s) => Some(s.clone()),
        Yaml::Integer(i) => Some(i.to_string()),
        Yaml::Real(r) => Some(r.clone()),
        _ => None,
    }
}

fn string_list(node: &Yaml) -> Vec<String> {
    node.as_vec()
        .map(|items| items.iter().filter_map(|i| i.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn integer_field(node: &Yaml, key: &str, context: &str) -> Result<Option<i64>, ConfigError> {
    match &node[key] {
        Yaml::BadValue => Ok(None),
        Yaml::Integer(i) if *i >= 0 => Ok(Some(*i)),
        _ => Err(ConfigError::invalid(context, key, "expected a non-negative integer")),
    }
}

fn number(node: &Yaml, context: &str, field: &str) -> Result<Option<f64>, ConfigError> {
    match node {
        Yaml::BadValue => Ok(None),
        Yaml::Integer(i) => Ok(Some(*i as f64)),
        Yaml::Real(_) => node
            .as_f64()
            .map(Some)
            .ok_or_else(|| ConfigError::invalid(context, field, "not a number")),
        _ => Err(ConfigError::invalid(context, field, "expected a number")),
    }
}

fn seconds(node: &Yaml, context: &str, field: &str) -> Result<Option<Duration>, ConfigError> {
    match number(node, context, field)? {
        Some(secs) if secs > 0.0 => Ok(Some(Duration::from_secs_f64(secs))),
        Some(_) => Err(ConfigError::invalid(context, field, "must be positive")),
        None => Ok(None),
    }
}

fn to_port(value: i64, context: &str) -> Result<u16, ConfigError> {
    u16::try_from(value)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ConfigError::invalid(context, "port", format!("{value} is not a TCP port")))
}

fn to_count(value: i64, context: &str, field: &str) -> Result<u32, ConfigError> {
    u32::try_from(value)
        .map_err(|_| ConfigError::invalid(context, field, format!("{value} is out of range")))
}

fn to_status(value: i64, context: &str) -> Result<u16, ConfigError> {
    match u16::try_from(value) {
        Ok(code) if (100..=599).contains(&code) => Ok(code),
        _ => Err(ConfigError::invalid(context, "expect_status", format!("{value} is not an HTTP status"))),
    }
}

/// Converts a YAML payload into the JSON body sent on the wire.
pub fn yaml_to_json(node: &Yaml) -> Value {
    match node {
        Yaml::String(s) => Value::String(s.clone()),
        Yaml::Integer(i) => Value::from(*i),
        Yaml::Real(_) => node
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Yaml::Boolean(b) => Value::Bool(*b),
        Yaml::Array(items) => Value::Array(items.iter().map(yaml_to_json).collect()),
        Yaml::Hash(h) => {
            let mut map = Map::new();
            for (key, value) in h {
                let key = match key {
                    Yaml::String(s) => s.clone(),
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Real(r) => r.clone(),
                    _ => continue,
                };
                map.insert(key, yaml_to_json(value));
            }
            Value::Object(map)
        }
        Yaml::Null | Yaml::Alias(_) | Yaml::BadValue => Value::Null,
    }
}
