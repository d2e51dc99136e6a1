//! Agent - 自主编码 Agent
//!
//! 职责：
//! - CoreAgent: plan → act → observe 循环
//! - AgentContext: 父子 Agent 共享的工作区资源
//! - SubAgentDelegator: delegate_task 的子 Agent 工厂

pub mod context;
pub mod core_agent;
pub mod delegation;

#[cfg(test)]
mod e2e_tests;

use octo_core::ConfigError;
use octo_persistence::PersistenceError;
use thiserror::Error;

pub use context::AgentContext;
pub use core_agent::{CoreAgent, IndexReport, InterventionHandle};
pub use delegation::SubAgentDelegator;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Delegation depth {depth} exceeds maximum {max}")]
    DelegationDepthExceeded { depth: u32, max: u32 },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}
