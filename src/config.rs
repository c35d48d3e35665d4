//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AIDE__*` 覆盖（双下划线表示嵌套，如 `AIDE__TOOLS__TOOL_TIMEOUT_SECS=10`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::tools::DEFAULT_HIGH_RISK_TOOLS;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub approval: ApprovalSection,
    pub checkpoint: CheckpointSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 命令行前端使用的线程 ID
    pub default_thread_id: String,
    /// 单轮内最多推理步数，防止死循环
    pub max_steps: usize,
    /// 覆盖内置 system prompt 的文件
    pub system_prompt_path: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "AIDE".to_string(),
            default_thread_id: "devops-thread-main".to_string(),
            max_steps: 20,
            system_prompt_path: None,
        }
    }
}

/// [llm] 段：后端选择、超时与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / mock；openai 缺少 API Key 时回退到 mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 单次推理超时（秒）
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            request_timeout_secs: 60,
            max_retries: 3,
            retry_base_delay_ms: 500,
        }
    }
}

/// [tools] 段：工具超时、并发、风险集合、Shell 白名单
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 同一批次最多并发执行的调用数
    pub max_parallel: usize,
    /// 高风险工具集合（整体替换内置集合）
    pub high_risk: Vec<String>,
    /// 在 high_risk 基础上追加
    pub extra_high_risk: Vec<String>,
    pub shell: ShellSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            max_parallel: 4,
            high_risk: DEFAULT_HIGH_RISK_TOOLS.iter().map(|s| s.to_string()).collect(),
            extra_high_risk: Vec::new(),
            shell: ShellSection::default(),
        }
    }
}

/// [tools.shell] 段：允许执行的命令名（仅首词）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    pub enabled: bool,
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_commands: vec![
                "kubectl".into(),
                "git".into(),
                "tofu".into(),
                "helm".into(),
                "ls".into(),
                "cat".into(),
                "grep".into(),
            ],
        }
    }
}

/// [approval] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ApprovalSection {
    /// 等待审批的超时（秒）；未设置则无限等待，到期视为拒绝
    pub timeout_secs: Option<u64>,
}

/// [checkpoint] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    /// memory / file / sqlite
    pub backend: String,
    /// file 后端为目录，sqlite 后端为数据库文件
    pub path: PathBuf,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            path: PathBuf::from("data/checkpoints"),
        }
    }
}

/// 从 config 目录加载配置，环境变量 AIDE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AIDE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AIDE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("tools.high_risk")
            .with_list_parse_key("tools.extra_high_risk")
            .with_list_parse_key("tools.shell.allowed_commands")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.max_steps, 20);
        assert!(cfg.tools.high_risk.contains(&"merge_pull_request".to_string()));
        assert_eq!(cfg.approval.timeout_secs, None);
        assert_eq!(cfg.checkpoint.backend, "file");
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aide.toml");
        std::fs::write(
            &path,
            r#"
[tools]
tool_timeout_secs = 7
extra_high_risk = ["drain_node"]

[approval]
timeout_secs = 300

[checkpoint]
backend = "memory"
"#,
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.tools.tool_timeout_secs, 7);
        assert_eq!(cfg.tools.extra_high_risk, vec!["drain_node".to_string()]);
        assert_eq!(cfg.approval.timeout_secs, Some(300));
        assert_eq!(cfg.checkpoint.backend, "memory");
        // 未写的键保持默认
        assert_eq!(cfg.tools.max_parallel, 4);
    }
}
