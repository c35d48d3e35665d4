//! AIDE - 故障响应助手的编排核心
//!
//! 模块划分：
//! - **checkpoint**: 会话检查点存储（内存 / 文件 / SQLite）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 状态机编排、审批闸门、会话监管、事件
//! - **llm**: 模型客户端抽象与实现（OpenAI 兼容 / Mock / 脚本化）与重试
//! - **memory**: 消息与只追加的对话记录
//! - **observability**: 日志初始化
//! - **react**: Planner 推理步骤与模型输出解析
//! - **tools**: 工具抽象、注册表、风险分级与执行器

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;
