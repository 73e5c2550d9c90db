//! Script capability
//!
//! Runs an external command per invocation. The invocation is written to the
//! child's stdin as JSON; stdout is either a JSON object
//! `{"output": ..., "mutations": [...]}` or plain text used as the output.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use super::discovery::CapabilityDescriptor;
use super::{Capability, CapabilityKind, CapabilityOutput};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::orchestrator::session::Session;

const DEFAULT_TIMEOUT_SECS: u64 = 60;

pub struct ScriptCapability {
    name: String,
    version: String,
    description: String,
    labels: Vec<String>,
    command: String,
    args: Vec<String>,
    working_dir: PathBuf,
    timeout: Duration,
}

impl ScriptCapability {
    pub fn from_descriptor(descriptor: &CapabilityDescriptor) -> Result<Self> {
        let Some(command) = descriptor.config_str("command") else {
            bail!("{}: script needs config.command", descriptor.name);
        };
        let args = match descriptor.config_value("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            Some(_) => bail!("{}: config.args must be a list", descriptor.name),
        };
        let timeout_secs = descriptor
            .config_value("timeout_secs")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Ok(Self {
            name: descriptor.name.clone(),
            version: descriptor.version.clone(),
            description: descriptor.description.clone(),
            labels: descriptor.capabilities.clone(),
            command: command.to_string(),
            args,
            working_dir: descriptor.source_dir.clone(),
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    fn parse_stdout(stdout: &str) -> OrchestratorResult<CapabilityOutput> {
        let trimmed = stdout.trim();
        if trimmed.starts_with('{') {
            if let Ok(parsed) = serde_json::from_str::<CapabilityOutput>(trimmed) {
                return Ok(parsed);
            }
        }
        Ok(CapabilityOutput::text(trimmed))
    }
}

#[async_trait]
impl Capability for ScriptCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Tool
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn labels(&self) -> Vec<String> {
        self.labels.clone()
    }

    async fn invoke(&self, session: &Session, input: Option<&str>) -> OrchestratorResult<CapabilityOutput> {
        let request = json!({
            "session_id": session.id,
            "node": session.current_node,
            "input": input,
            "variables": session.variables,
            "turns": session.turns,
        });
        let payload = serde_json::to_vec(&request)?;

        debug!("Executing script capability {} using {}", self.name, self.command);

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OrchestratorError::capability(&self.name, format!("failed to spawn {}: {}", self.command, e)))?;

        // Feed stdin while waiting so neither side can stall on a full pipe,
        // and keep both under the deadline.
        let stdin = child.stdin.take();
        let name = &self.name;
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // Scripts that ignore stdin may close it early.
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!("{}: stdin closed early: {}", name, e);
                }
            }
        };
        let run = async move {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = match timeout(self.timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(OrchestratorError::capability(&self.name, format!("failed to run script: {}", e))),
            Err(_) => {
                warn!("Script capability {} timed out after {:?}", self.name, self.timeout);
                return Err(OrchestratorError::capability(
                    &self.name,
                    format!("timed out after {}s", self.timeout.as_secs()),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(OrchestratorError::capability(
                &self.name,
                format!("exit code {}: {}", exit_code, stderr.trim()),
            ));
        }
        Self::parse_stdout(&stdout)
    }
}
