//! Command agent - runs each stage as a shell command

use crate::agent::{
    AgentError, AgentExecutor, AgentRequest, AgentResponse, ChildProcessHandle, ProgressCallback,
};
use crate::execution::AbortController;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// How one stage is run by the command agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Shell command template (`{{ name }}` placeholders are rendered)
    pub command: String,

    /// Regex stdout must match for the stage to count as successful
    pub success_pattern: Option<String>,

    /// Extra environment variables
    pub env: HashMap<String, String>,
}

/// Agent that runs `sh -c <command>` per stage
#[derive(Debug, Clone)]
pub struct CommandAgent {
    specs: HashMap<String, CommandSpec>,
    shell: String,
}

impl CommandAgent {
    pub fn new(specs: HashMap<String, CommandSpec>) -> Self {
        Self {
            specs,
            shell: "sh".to_string(),
        }
    }

    /// Use a different shell (must accept `-c <command>`)
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn spec(&self, stage: &str) -> Option<&CommandSpec> {
        self.specs.get(stage)
    }

    fn build_command(&self, spec: &CommandSpec, request: &AgentRequest) -> Command {
        let rendered = request.context.render(&spec.command);
        debug!("Stage {} command: {}", request.stage_name, rendered);

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(rendered)
            .envs(&spec.env)
            .env("STAGE_NAME", &request.stage_name)
            .env("STAGE_ATTEMPT", request.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        command
    }
}

/// Read stdout line by line, forwarding each non-empty line as progress
async fn collect_lines<R>(reader: R, progress: Option<&dyn ProgressCallback>) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut collected = String::new();

    while let Some(line) = lines.next_line().await? {
        if let Some(cb) = progress {
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                cb.on_progress(trimmed);
            }
        }
        collected.push_str(&line);
        collected.push('\n');
    }

    Ok(collected)
}

async fn collect_all<R>(reader: Option<R>) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = String::new();
    if let Some(mut reader) = reader {
        reader.read_to_string(&mut buffer).await?;
    }
    Ok(buffer)
}

/// Parse stdout as JSON when it is a single JSON document
fn parse_structured(output: &str) -> Option<serde_json::Value> {
    let trimmed = output.trim();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

#[async_trait]
impl AgentExecutor for CommandAgent {
    async fn execute(
        &self,
        request: &AgentRequest,
        abort: &AbortController,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<AgentResponse, AgentError> {
        let spec = self
            .specs
            .get(&request.stage_name)
            .ok_or_else(|| AgentError::UnknownStage(request.stage_name.clone()))?;

        if abort.is_aborted() {
            return Err(AgentError::Cancelled);
        }

        let mut child = self
            .build_command(spec, request)
            .spawn()
            .map_err(AgentError::Spawn)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let handle = Arc::new(ChildProcessHandle::watch_group(child));
        let process_id = abort.register_process(handle.clone());

        let stdout_task = async {
            match stdout {
                Some(out) => collect_lines(out, progress).await,
                None => Ok(String::new()),
            }
        };

        let (stdout, stderr, status) = tokio::join!(stdout_task, collect_all(stderr), handle.wait());
        abort.unregister_process(process_id);

        let stdout = stdout?;
        let stderr = stderr?;
        let status = status?;

        if abort.is_aborted() {
            debug!("Stage {} exited after abort ({})", request.stage_name, status);
            return Err(AgentError::Cancelled);
        }

        if !status.success() {
            let exit_code = status.code().unwrap_or(-1);
            warn!(
                "Stage {} exited with code {}: {}",
                request.stage_name,
                exit_code,
                stderr.trim()
            );
            let mut message = format!("command exited with code {}", exit_code);
            if !stderr.trim().is_empty() {
                message.push_str(&format!(": {}", stderr.trim()));
            }
            return Ok(AgentResponse::failure(message).with_output(stdout));
        }

        if let Some(pattern) = &spec.success_pattern {
            let regex = Regex::new(pattern)
                .map_err(|e| AgentError::Internal(format!("invalid success_pattern: {}", e)))?;
            if !regex.is_match(&stdout) {
                return Ok(AgentResponse::failure(format!(
                    "output did not match success pattern '{}'",
                    pattern
                ))
                .with_output(stdout));
            }
        }

        let mut response = AgentResponse::success(stdout);
        if let Some(data) = parse_structured(&response.output) {
            response = response.with_structured_data(data);
        }

        Ok(response)
    }
}
