//! Planner → scheduler → aggregator pipeline for one chat turn.

pub mod aggregator;
pub mod planner;
pub mod scheduler;

use std::collections::HashMap;

use crate::models::{AgentName, AgentResult, ChatMessage, ExecutionPlan, MemorySnippet, TaskState};

/// Per-turn state, exclusively owned by the scheduler loop and dropped after
/// aggregation.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    pub messages: Vec<ChatMessage>,
    pub user_id: String,
    pub tenant_id: String,
    pub conversation_id: String,
    pub plan: Option<ExecutionPlan>,
    pub task_status: HashMap<String, TaskState>,
    pub agent_results: HashMap<AgentName, AgentResult>,
    pub memory_context: Vec<MemorySnippet>,
    pub final_response: String,
}
