//! Adapter that runs an external capture program.

use super::adapter::{DiagnosticToolAdapter, ToolOutput};
use crate::config::ToolCommandConfig;
use crate::error::{Error, Result};
use crate::types::{DiagnosticTool, LogFile};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

/// Runs `command args...` and reports every file it leaves in the scratch dir.
#[derive(Debug, Clone)]
pub struct CommandToolAdapter {
    tool: DiagnosticTool,
    command: String,
    args: Vec<String>,
}

impl CommandToolAdapter {
    pub fn new(tool: DiagnosticTool, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            tool,
            command: command.into(),
            args,
        }
    }

    pub fn from_config(tool: DiagnosticTool, config: &ToolCommandConfig) -> Self {
        Self::new(tool, config.command.clone(), config.args.clone())
    }

    fn render_args(&self, params: &str, scratch_dir: &Path, instance: &str) -> Vec<String> {
        let output_dir = scratch_dir.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{params}", params)
                    .replace("{output_dir}", &output_dir)
                    .replace("{instance}", instance)
            })
            .collect()
    }
}

#[async_trait]
impl DiagnosticToolAdapter for CommandToolAdapter {
    fn tool(&self) -> DiagnosticTool {
        self.tool
    }

    async fn invoke(
        &self,
        params: &str,
        scratch_dir: &Path,
        instance_short_id: &str,
    ) -> Result<ToolOutput> {
        let args = self.render_args(params, scratch_dir, instance_short_id);
        tracing::info!(
            tool = %self.tool,
            command = %self.command,
            args = ?args,
            "Starting capture"
        );

        // kill_on_drop: a cancelled capture must not leave the tool running
        let output = Command::new(&self.command)
            .args(&args)
            .current_dir(scratch_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Tool(format!("failed to start {}: {}", self.command, e)))?;

        let mut result = ToolOutput::default();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            result.errors.push(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            ));
        }

        result.logs = collect_artifacts(scratch_dir).await?;
        Ok(result)
    }
}

/// Regular files directly under `dir`, sorted by path.
async fn collect_artifacts(dir: &Path) -> Result<Vec<LogFile>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut logs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            logs.push(LogFile::new(entry.path()));
        }
    }
    logs.sort_by(|a, b| a.full_path.cmp(&b.full_path));
    Ok(logs)
}
