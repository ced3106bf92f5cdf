//! Firewall command execution
//!
//! Applies validated rules by invoking the firewall tool directly with an
//! argument vector:
//! - Optional non-interactive elevation prefix (`sudo -n`)
//! - Check-then-append so a rule already present is not added twice
//! - Hard timeout, the child is killed when it expires
//! - Captured output trimmed into the result detail

use crate::config::FirewallConfig;
use crate::validator::ValidatedCommand;
use bastion_protocol::{CommandResult, FailureReason};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("terminated by signal")]
    Signalled,
}

impl ExecutionError {
    pub fn reason(&self) -> FailureReason {
        match self {
            ExecutionError::Spawn { .. } => FailureReason::SpawnFailed,
            ExecutionError::Timeout(_) => FailureReason::Timeout,
            ExecutionError::Signalled => FailureReason::ExecutionFailed,
        }
    }
}

/// Exit code plus whatever the tool printed
#[derive(Debug)]
struct ProcessOutput {
    exit_code: i32,
    output: String,
}

/// Runs firewall rules through the configured binary
#[derive(Debug, Clone)]
pub struct FirewallExecutor {
    binary: String,
    elevate: Vec<String>,
    timeout: Duration,
    check_first: bool,
}

impl FirewallExecutor {
    pub fn new(binary: impl Into<String>, elevate: Vec<String>, timeout: Duration, check_first: bool) -> Self {
        Self {
            binary: binary.into(),
            elevate,
            timeout,
            check_first,
        }
    }

    pub fn from_config(config: &FirewallConfig) -> Self {
        Self::new(
            config.binary.clone(),
            config.elevate_with.clone(),
            config.timeout(),
            config.check_before_append,
        )
    }

    /// Apply one rule and describe what happened
    pub async fn apply(&self, command: &ValidatedCommand) -> CommandResult {
        let rule = command.rule();
        let start_time = Instant::now();

        if self.check_first {
            match self.run(rule.check_args()).await {
                Ok(out) if out.exit_code == 0 => {
                    debug!("Rule already present: {}", rule.render());
                    return CommandResult::ok(0, "already present");
                }
                Ok(_) => {}
                Err(e) => return failure(e),
            }
        }

        let result = match self.run(rule.append_args()).await {
            Ok(out) if out.exit_code == 0 => {
                let detail = if out.output.is_empty() { "applied".to_string() } else { out.output };
                CommandResult::ok(0, detail)
            }
            Ok(out) => CommandResult::error(FailureReason::ExecutionFailed, Some(out.exit_code), out.output),
            Err(e) => failure(e),
        };
        info!(
            "Applied {} -> {:?} in {}ms",
            rule.render(),
            result.status,
            start_time.elapsed().as_millis()
        );
        result
    }

    async fn run(&self, args: Vec<String>) -> Result<ProcessOutput, ExecutionError> {
        let mut argv = self.elevate.iter().cloned().chain(std::iter::once(self.binary.clone())).chain(args);
        // argv always holds at least the binary
        let program = argv.next().unwrap_or_else(|| self.binary.clone());
        let rest: Vec<String> = argv.collect();
        debug!("Running {} {}", program, rest.join(" "));

        let child = AsyncCommand::new(&program)
            .args(&rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutionError::Spawn { program: program.clone(), source })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(ExecutionError::Spawn { program, source }),
            Err(_) => return Err(ExecutionError::Timeout(self.timeout)),
        };

        let exit_code = output.status.code().ok_or(ExecutionError::Signalled)?;
        let mut text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stderr);
        }
        Ok(ProcessOutput { exit_code, output: text })
    }
}

fn failure(e: ExecutionError) -> CommandResult {
    warn!("Firewall command failed: {}", e);
    CommandResult::error(e.reason(), None, e.to_string())
}
