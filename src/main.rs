pub mod config;
pub mod checker;
pub mod error;
pub mod session;
pub mod pinger;
pub mod tcp_connect;
pub mod remote_command;
pub mod http_request;
pub mod harness;
pub mod report;
pub mod output;
pub mod output_print;
#[cfg(test)]
mod mock_server;

use log::{info, error};
use std::io::IsTerminal;
use std::process;
use crate::config::{load_plan, parse_args};
use crate::harness::Harness;
use crate::output_print::PrintOutput;

fn main() {
    let opts = parse_args();
    let level = if opts.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let plan = match load_plan(&opts) {
        Ok(plan) => plan,
        Err(e) => {
            error!("Failed to load config {}: {}", opts.config, e);
            process::exit(1);
        }
    };
    if !std::io::stdout().is_terminal() {
        colored::control::set_override(false);
    }
    info!("Loaded {} checks from {}", plan.checks.len(), opts.config);

    let mut output = PrintOutput::new(plan.remediation);
    let mut harness = Harness::new(plan.config);
    let report = harness.run(&plan.title, &plan.checks, &mut output);
    if !report.verdict.is_passing() {
        process::exit(1);
    }
}
