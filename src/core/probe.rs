//! Readiness probe runner.
//!
//! Runs a probe command repeatedly until it has passed `success_threshold`
//! times or failed `failure_threshold` times (`-1` disables either), sleeping
//! `period_seconds` between runs. The loop starts after the initial delay.
//! `timeout_seconds` is counted from launch, so it covers the delay too.

use super::error::Result;
use super::types::ReadinessProbe;
use crate::transport::exec_capture;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready { successes: u32, failures: u32 },
    Failed { successes: u32, failures: u32 },
    TimedOut,
}

impl ProbeOutcome {
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Run the probe described by `probe` with `shell`.
pub async fn run_probe(probe: &ReadinessProbe, shell: &str) -> Result<ProbeOutcome> {
    let delayed = async {
        if probe.initial_delay_seconds > 0 {
            tokio::time::sleep(Duration::from_secs(probe.initial_delay_seconds)).await;
        }
        probe_loop(probe, shell).await
    };
    let limit = Duration::from_secs(probe.timeout_seconds);
    match tokio::time::timeout(limit, delayed).await {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::error!(command = %probe.command, timeout = probe.timeout_seconds, "probe timed out");
            Ok(ProbeOutcome::TimedOut)
        }
    }
}

async fn probe_loop(probe: &ReadinessProbe, shell: &str) -> Result<ProbeOutcome> {
    let script = probe_script(&probe.command);
    let mut successes: u32 = 0;
    let mut failures: u32 = 0;
    loop {
        match exec_capture(shell, &script).await {
            Ok(out) => {
                for line in out.stdout.lines() {
                    tracing::info!("{}", line);
                }
                for line in out.stderr.lines() {
                    tracing::warn!("{}", line);
                }
                if out.success() {
                    successes += 1;
                } else {
                    failures += 1;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "probe command did not start");
                failures += 1;
            }
        }

        if threshold_reached(failures, probe.failure_threshold) {
            tracing::info!(successes, failures, "probe exiting at failure");
            return Ok(ProbeOutcome::Failed { successes, failures });
        }
        if threshold_reached(successes, probe.success_threshold) {
            tracing::info!(successes, failures, "probe ready");
            return Ok(ProbeOutcome::Ready { successes, failures });
        }
        tracing::debug!(successes, failures, "probe not settled");
        tokio::time::sleep(Duration::from_secs(probe.period_seconds)).await;
    }
}

fn threshold_reached(count: u32, threshold: i64) -> bool {
    threshold != -1 && i64::from(count) >= threshold
}

/// A command naming an existing file is run as a script file.
fn probe_script(command: &str) -> String {
    if Path::new(command).is_file() {
        format!("bash {}", command)
    } else {
        command.to_string()
    }
}
