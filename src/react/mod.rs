//! 推理层：Planner（推理步骤）与模型输出解析

pub mod planner;

pub use planner::{parse_llm_output, Planner, PlannerOutput, DEFAULT_SYSTEM_PROMPT};
