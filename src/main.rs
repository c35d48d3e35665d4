//! AIDE 命令行入口
//!
//! 交互式控制台：输入问题，遇到高风险批次时打印待审批调用并询问 yes/no。
//! 用法：`aide [--config <path>] [--thread <thread_id>]`，输入 exit / quit 退出，
//! `/continue` 继续一个停在中途的回合（例如模型在工具结果之后失败）。

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use aide::config::{load_config, AppConfig};
use aide::core::{
    AgentError, AgentEvent, ApprovalDecision, ApprovalGate, ApprovalRequest, Approver,
    Orchestrator, OrchestratorBuilder, Phase, SessionState,
};
use aide::memory::Role;
use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::mpsc;

/// 从标准输入读一行（阻塞读放到 blocking 线程池）
async fn read_line(prompt: &str) -> anyhow::Result<Option<String>> {
    let prompt = prompt.to_string();
    let line = tokio::task::spawn_blocking(move || {
        print!("{}", prompt);
        std::io::stdout().flush()?;
        let mut line = String::new();
        let n = std::io::stdin().read_line(&mut line)?;
        Ok::<_, std::io::Error>(if n == 0 { None } else { Some(line.trim().to_string()) })
    })
    .await
    .context("stdin reader panicked")??;
    Ok(line)
}

/// 控制台审批：打印整批调用，询问 yes/no
struct ConsoleApprover;

#[async_trait]
impl Approver for ConsoleApprover {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalDecision {
        println!("\n⚠️  Approval required (thread {}, batch {})", request.thread_id, request.batch_id);
        let rendered = serde_json::to_string_pretty(&request.pending_calls)
            .unwrap_or_else(|_| format!("{:?}", request.pending_calls));
        println!("{}", rendered);

        loop {
            match read_line("Approve this batch? (yes/no): ").await {
                Ok(Some(answer)) => match answer.to_lowercase().as_str() {
                    "y" | "yes" => return ApprovalDecision::approve(),
                    "n" | "no" => {
                        let reason = read_line("Reason (optional): ").await.ok().flatten().unwrap_or_default();
                        return if reason.is_empty() {
                            ApprovalDecision {
                                approved: false,
                                reason: None,
                            }
                        } else {
                            ApprovalDecision::reject(reason)
                        };
                    }
                    _ => println!("Please answer yes or no."),
                },
                Ok(None) | Err(_) => return ApprovalDecision::reject("operator input closed"),
            }
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "aide", about = "Approval-gated incident response assistant")]
struct Args {
    /// 配置文件路径（默认 config/default.toml）
    #[arg(long, env = "AIDE_CONFIG")]
    config: Option<PathBuf>,
    /// 会话线程 id（默认取配置 app.default_thread_id）
    #[arg(long, env = "AIDE_THREAD")]
    thread: Option<String>,
}

/// 模型失败后，本次输入是否已经随更早的推理结果落盘
fn input_recorded(state: &SessionState, input: &str) -> bool {
    state.phase == Phase::Reasoning
        && state
            .messages()
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .is_some_and(|m| m.content == input)
}

/// 继续停在中途的回合，审批挂起交给闸门
async fn resume(orchestrator: &Orchestrator, thread_id: &str, gate: &ApprovalGate) {
    let resumed = match orchestrator.continue_turn(thread_id).await {
        Ok(outcome) => orchestrator.settle(thread_id, outcome, gate).await,
        Err(e) => Err(e),
    };
    match resumed {
        Ok(reply) => println!("\n🤖 {}\n", reply.content),
        Err(e) => eprintln!("Error: {}", e),
    }
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::ToolCall { tool, args, .. } => println!("  🔧 {} {}", tool, args),
        AgentEvent::Observation { tool, preview, .. } => println!("  👁  {}: {}", tool, preview),
        AgentEvent::ToolFailure { tool, reason, .. } => println!("  ❌ {}: {}", tool, reason),
        _ => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    aide::observability::init();
    let args = Args::parse();

    let cfg = load_config(args.config).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let thread_id = args.thread.unwrap_or_else(|| cfg.app.default_thread_id.clone());

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(&event);
        }
    });

    let builder = OrchestratorBuilder::new(cfg.clone()).with_events(event_tx);
    let gate = builder.approval_gate(Arc::new(ConsoleApprover));
    let orchestrator = builder.build().await;

    println!("🤖 {} ready (thread {}). Type 'exit' or 'quit' to leave.", cfg.app.name, thread_id);

    // 重启后线程停在审批点或执行中途时先续上：重新展示同一批次，或把中断的调用记为 interrupted
    if let Ok(state) = orchestrator.state(&thread_id).await {
        if matches!(state.phase, Phase::AwaitingApproval | Phase::ExecutingTools) {
            println!("Resuming thread {} from {}", thread_id, state.phase);
            resume(&orchestrator, &thread_id, &gate).await;
        }
    }

    loop {
        let Some(input) = read_line("👤 > ").await? else {
            break;
        };
        if input.is_empty() {
            continue;
        }
        if matches!(input.to_lowercase().as_str(), "exit" | "quit") {
            println!("Goodbye.");
            break;
        }
        if input == "/continue" {
            resume(&orchestrator, &thread_id, &gate).await;
            continue;
        }

        match orchestrator.run_turn(&thread_id, &input, &gate).await {
            Ok(reply) => println!("\n🤖 {}\n", reply.content),
            Err(e @ AgentError::Model { .. }) => {
                eprintln!("Model error: {}", e);
                // 失败发生在工具结果之后时，消息和结果都已落盘，重发会重复追加
                match orchestrator.state(&thread_id).await {
                    Ok(state) if input_recorded(&state, &input) => {
                        eprintln!("Your message and the tool results so far are saved; type /continue to retry the failed step.")
                    }
                    _ => eprintln!("Your message was not recorded; resend it to retry."),
                }
            }
            Err(e) => eprintln!("Error: {}", e),
        }
    }

    Ok(())
}
