//! Orchestration engine: the agent loop, approval gate, directive parser,
//! and configuration.

pub mod agent;
pub mod approval;
pub mod config;
pub mod directive;

pub use agent::{
    Agent, AgentEvent, AgentOptions, EngineError, HttpProvider, ProviderClient, ProviderFut,
};
pub use approval::{
    ApprovalDecision, ApprovalGate, ApprovalRequest, PendingApproval, REJECTION_MESSAGE,
};
pub use config::Config;
pub use directive::{parse_directives, ToolDirective};
