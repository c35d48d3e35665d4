//! 编排器构建：从 AppConfig 组装模型、工具、风险分类与检查点存储
//!
//! CLI 与测试共用同一套组装逻辑；任一组件都可以显式注入替换。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::checkpoint::{create_checkpoint_store, CheckpointStore};
use crate::config::{load_config, AppConfig};
use crate::core::{AgentEvent, ApprovalGate, Approver, Orchestrator};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient, RetryConfig, RetryingLlmClient};
use crate::react::{Planner, DEFAULT_SYSTEM_PROMPT};
use crate::tools::{EchoTool, RiskClassifier, ShellTool, Tool, ToolExecutor, ToolRegistry};

/// 根据配置与环境变量选择模型后端（OpenAI 兼容 / Mock），并包上重试
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var("OPENAI_API_KEY").ok();

    let inner: Arc<dyn LlmClient> = match (provider.as_str(), api_key) {
        ("mock", _) => {
            tracing::info!("Using Mock LLM");
            Arc::new(MockLlmClient)
        }
        (_, Some(key)) => {
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                Some(&key),
            ))
        }
        (_, None) => {
            tracing::warn!("No API key set or provider unknown, using Mock LLM");
            Arc::new(MockLlmClient)
        }
    };

    Arc::new(RetryingLlmClient::new(
        inner,
        RetryConfig {
            max_retries: cfg.llm.max_retries,
            base_delay: Duration::from_millis(cfg.llm.retry_base_delay_ms),
            ..RetryConfig::default()
        },
    ))
}

/// 编排器构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    registry: Option<ToolRegistry>,
    extra_tools: Vec<Arc<dyn Tool>>,
    store: Option<Arc<dyn CheckpointStore>>,
    system_prompt: Option<String>,
    event_tx: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            registry: None,
            extra_tools: Vec::new(),
            store: None,
            system_prompt: None,
            event_tx: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 替换内置工具注册表
    pub fn with_tool_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// 在注册表之外追加一个工具
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.extra_tools.push(tool);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 内置工具：echo，以及按配置启用的 run_shell_command
    pub fn build_tool_registry(&self) -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        if self.config.tools.shell.enabled {
            tools.register(ShellTool::new(
                self.config.tools.shell.allowed_commands.clone(),
                self.config.tools.tool_timeout_secs,
            ));
        }
        tools
    }

    pub fn build_classifier(&self) -> RiskClassifier {
        RiskClassifier::new(self.config.tools.high_risk.iter().cloned())
            .extend(self.config.tools.extra_high_risk.iter().cloned())
    }

    /// 配置了审批超时时，返回带超时的闸门
    pub fn approval_gate(&self, approver: Arc<dyn Approver>) -> ApprovalGate {
        ApprovalGate::new(approver).with_timeout(self.config.approval.timeout_secs.map(Duration::from_secs))
    }

    fn resolve_system_prompt(&self) -> String {
        if let Some(prompt) = &self.system_prompt {
            return prompt.clone();
        }
        self.config
            .app
            .system_prompt_path
            .as_ref()
            .and_then(|p| match std::fs::read_to_string(p) {
                Ok(text) => Some(text),
                Err(e) => {
                    tracing::warn!("System prompt {} unreadable ({}), using built-in", p.display(), e);
                    None
                }
            })
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
    }

    pub async fn build(mut self) -> Orchestrator {
        let mut registry = match self.registry.take() {
            Some(registry) => registry,
            None => self.build_tool_registry(),
        };
        for tool in &self.extra_tools {
            registry.register_arc(tool.clone());
        }

        let llm = self
            .llm
            .clone()
            .unwrap_or_else(|| create_llm_from_config(&self.config));
        let store = match self.store.clone() {
            Some(store) => store,
            None => create_checkpoint_store(&self.config.checkpoint).await,
        };

        let planner = Planner::new(
            llm,
            self.resolve_system_prompt(),
            Duration::from_secs(self.config.llm.request_timeout_secs),
        );
        let executor = ToolExecutor::with_parallelism(
            Arc::new(registry),
            self.config.tools.tool_timeout_secs,
            self.config.tools.max_parallel,
        );
        let classifier = Arc::new(self.build_classifier());
        tracing::info!(
            tools = ?executor.registry().tool_names(),
            high_risk = classifier.high_risk_tools().len(),
            "orchestrator ready"
        );

        let mut orchestrator = Orchestrator::new(planner, executor, classifier, store)
            .with_max_steps(self.config.app.max_steps);
        if let Some(tx) = self.event_tx {
            orchestrator = orchestrator.with_events(tx);
        }
        orchestrator
    }
}

/// 加载配置（失败时回退默认值）并构建编排器
pub async fn create_orchestrator(config_path: Option<PathBuf>) -> (Orchestrator, AppConfig) {
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let orchestrator = OrchestratorBuilder::new(cfg.clone()).build().await;
    (orchestrator, cfg)
}
