//! 风险分级
//!
//! 按工具名查表：在高风险集合中的为 HighRisk，其余一律 Standard。集合由配置注入，
//! 新增高风险工具只需改配置或调用 extend，不涉及状态机逻辑。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::memory::ToolCallRequest;

/// 合并代码、写仓库、变更基础设施、扩缩容/删除线上负载、触发部署或回滚
pub const DEFAULT_HIGH_RISK_TOOLS: &[&str] = &[
    "merge_pull_request",
    "create_pull_request",
    "create_or_update_file",
    "trigger_workflow",
    "cancel_workflow_run",
    "create_deployment",
    "scale_k8s_deployment",
    "delete_k8s_pod",
    "create_k8s_namespace",
    "jenkins_trigger_build",
    "jenkins_emergency_deploy",
    "jenkins_rollback",
    "powershell_tofu_apply",
    "run_shell_command",
];

/// 风险级别
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RiskTier {
    Standard,
    HighRisk,
}

/// 风险分级器：纯查表，无内部状态变化
#[derive(Clone, Debug)]
pub struct RiskClassifier {
    high_risk: HashSet<String>,
}

impl RiskClassifier {
    pub fn new<I, S>(high_risk: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            high_risk: high_risk.into_iter().map(Into::into).collect(),
        }
    }

    /// 使用内置的高风险集合
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_HIGH_RISK_TOOLS.iter().copied())
    }

    /// 追加高风险工具
    pub fn extend<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.high_risk.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn classify(&self, tool_name: &str) -> RiskTier {
        if self.high_risk.contains(tool_name) {
            RiskTier::HighRisk
        } else {
            RiskTier::Standard
        }
    }

    /// 批次中任一调用为高风险则整批需要审批
    pub fn requires_approval(&self, calls: &[ToolCallRequest]) -> bool {
        calls
            .iter()
            .any(|c| self.classify(&c.tool_name) == RiskTier::HighRisk)
    }

    pub fn high_risk_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.high_risk.iter().cloned().collect();
        names.sort();
        names
    }
}

impl Default for RiskClassifier {
    fn default() -> Self {
        Self::with_defaults()
    }
}
