//! Shell 运行器：白名单命令，禁止危险子串
//!
//! 仅允许配置中的命令名（首词，如 kubectl、git、tofu）；禁止 rm -rf、mkfs 等子串；
//! 执行通过 sh -c / cmd /C，带超时。默认列入高风险集合，执行前需要审批。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use crate::tools::Tool;

/// 即使命令名在白名单中也不允许出现的子串
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    "chmod 777",
    "curl | sh",
    ":(){ :|:& };:",
];

/// 输出超过此长度时截断，避免撑爆上下文
const MAX_OUTPUT_CHARS: usize = 8000;

#[derive(Debug, Deserialize, JsonSchema)]
struct ShellArgs {
    /// 要执行的命令（首词必须在白名单中）
    command: String,
}

/// Shell 工具
pub struct ShellTool {
    allowed_commands: HashSet<String>,
    timeout: Duration,
}

impl ShellTool {
    pub const NAME: &'static str = "run_shell_command";

    pub fn new(allowed_commands: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            allowed_commands: allowed_commands.into_iter().map(|s| s.to_lowercase()).collect(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    fn check(&self, raw: &str) -> Result<(), String> {
        let lower = raw.to_lowercase();
        if let Some(bad) = FORBIDDEN_SUBSTR.iter().find(|f| lower.contains(*f)) {
            return Err(format!("Forbidden pattern: {}", bad));
        }
        let name = lower.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if self.allowed_commands.contains(name) {
            Ok(())
        } else {
            Err(format!("Command '{}' not in allowlist", name))
        }
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() > MAX_OUTPUT_CHARS {
        format!("{}... (truncated)", s.chars().take(MAX_OUTPUT_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Run an allow-listed shell command on the operator host (e.g. kubectl, git, tofu plan). State-changing; requires approval."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(ShellArgs)).unwrap_or_default()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: ShellArgs =
            serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {}", e))?;
        let command = args.command.trim();
        self.check(command)?;

        tracing::info!(command = %command, "shell tool execute");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| format!("Command timed out after {}s", self.timeout.as_secs()))?
            .map_err(|e| format!("Execution failed: {}", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(format!("Exit {:?}\nstderr: {}", output.status.code(), truncate(stderr.trim())));
        }
        Ok(if stderr.trim().is_empty() {
            truncate(&stdout)
        } else {
            truncate(&format!("{}\nstderr: {}", stdout.trim(), stderr.trim()))
        })
    }
}
