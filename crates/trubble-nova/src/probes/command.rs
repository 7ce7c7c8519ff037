//! Command probes - process exit status/output and kernel parameters

use super::Params;
use crate::executor::{Probe, Verdict};
use serde_yaml::Mapping;
use std::fs;
use std::process::Command;
use trubble_core::{AttributeSnapshot, Error, Result};

/// Runs a command and checks its exit code and/or output
pub struct CommandProbe;

impl Probe for CommandProbe {
    fn kind(&self) -> &str {
        "command"
    }

    fn evaluate(&self, params: &Mapping, _snapshot: &AttributeSnapshot) -> Result<Verdict> {
        let params = Params::new(self.kind(), params);
        let command = params.str("command")?;
        let expected_output = params.opt_string("expected_output")?;
        let expected_exit_code = params.opt_i32("expected_exit_code")?;

        // without explicit args the command line is split on whitespace
        let (program, args) = match params.string_list("args")? {
            Some(args) => (command.to_string(), args),
            None => {
                let mut words = command.split_whitespace().map(str::to_string);
                let program = words
                    .next()
                    .ok_or_else(|| Error::probe(self.kind(), "empty command"))?;
                (program, words.collect())
            }
        };

        let output = Command::new(&program).args(&args).output().map_err(|e| {
            Error::probe(self.kind(), format!("failed to run {}: {}", program, e))
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let exit_code = output.status.code().unwrap_or(-1);

        if let Some(expected) = expected_exit_code {
            if exit_code != expected {
                return Ok(Verdict::fail(
                    format!("exit code {}", exit_code),
                    format!("exit code {}", expected),
                ));
            }
        }

        match expected_output {
            Some(expected) if stdout.contains(expected.as_str()) => {
                Ok(Verdict::pass(stdout.trim()))
            }
            Some(expected) => Ok(Verdict::fail(stdout.trim(), expected)),
            None if expected_exit_code.is_some() || exit_code == 0 => {
                Ok(Verdict::pass(format!("exit code {}", exit_code)))
            }
            None => Ok(Verdict::fail(format!("exit code {}", exit_code), "exit code 0")),
        }
    }
}

/// Kernel parameter from `/proc/sys`, falling back to `sysctl -n`
pub struct SysctlProbe;

impl Probe for SysctlProbe {
    fn kind(&self) -> &str {
        "sysctl"
    }

    fn evaluate(&self, params: &Mapping, _snapshot: &AttributeSnapshot) -> Result<Verdict> {
        let params = Params::new(self.kind(), params);
        let key = params.str("key")?;
        let expected = params.string("expected")?;

        let proc_path = format!("/proc/sys/{}", key.replace('.', "/"));
        let actual = match fs::read_to_string(&proc_path) {
            Ok(value) => value.trim().to_string(),
            Err(_) => match Command::new("sysctl").args(["-n", key]).output() {
                Ok(output) if output.status.success() => {
                    String::from_utf8_lossy(&output.stdout).trim().to_string()
                }
                _ => {
                    return Err(Error::probe(
                        self.kind(),
                        format!("cannot read sysctl key: {}", key),
                    ))
                }
            },
        };

        // multi-value keys like net.ipv4.ip_local_port_range are tab separated
        let normalized = actual.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized == expected {
            Ok(Verdict::pass(actual))
        } else {
            Ok(Verdict::fail(actual, expected)
                .with_details(format!("remediate with: sysctl -w {}=<value>", key)))
        }
    }
}
