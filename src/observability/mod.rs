//! 可观测性：tracing 订阅者初始化
//!
//! 默认 info，可通过 RUST_LOG 覆盖（如 `RUST_LOG=aide=debug`）。工具审计记录带 `event=tool_audit` 字段，
//! 可用 `RUST_LOG=aide::tools=info` 单独筛出。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 测试或嵌入场景下可能已有全局订阅者，忽略重复初始化
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}
