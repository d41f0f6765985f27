//! Specialist agents and their shared task runtime.
//!
//! Each node collects its ready tasks (agent match, deps completed, still
//! pending), merges their queries into one composite request, and returns a
//! partial state update covering every task it claimed. A node that throws
//! marks its tasks failed; the turn continues.

pub mod advisor;
pub mod fundamentals;
pub mod macro_econ;
pub mod market_data;
pub mod sentiment;
pub mod technical;

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::models::{
    AgentName, AgentResult, AgentTask, AgentUpdate, ChatMessage, ExecutionPlan, StreamEvent,
    TaskState,
};
use crate::state::AppDeps;

// ── Event sink ────────────────────────────────────────────

/// Clonable handle for pushing stream events from inside agent nodes.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<StreamEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn none() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: StreamEvent) {
        if let Some(ref tx) = self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn tool_start(&self, tool: &str) {
        self.emit(StreamEvent::ToolStart { tool: tool.to_string() });
    }

    pub fn tool_end(&self, tool: &str) {
        self.emit(StreamEvent::ToolEnd { tool: tool.to_string() });
    }
}

/// Read-only view of the turn handed to a specialist dispatch.
pub struct AgentContext<'a> {
    pub deps: &'a AppDeps,
    pub plan: &'a ExecutionPlan,
    pub task_status: &'a HashMap<String, TaskState>,
    pub agent_results: &'a HashMap<AgentName, AgentResult>,
    pub messages: &'a [ChatMessage],
    pub events: EventSink,
}

// ── Task runtime ──────────────────────────────────────────

pub fn deps_satisfied(task: &AgentTask, status: &HashMap<String, TaskState>) -> bool {
    task.depends_on
        .iter()
        .all(|dep| status.get(dep).copied() == Some(TaskState::Completed))
}

/// Tasks this agent can run right now: pending, agent match, deps completed.
pub fn ready_tasks_for_agent(
    plan: &ExecutionPlan,
    status: &HashMap<String, TaskState>,
    agent: AgentName,
) -> Vec<AgentTask> {
    plan.steps
        .iter()
        .filter(|step| step.agent == agent)
        .filter(|step| status.get(&step.task_id).copied().unwrap_or(TaskState::Pending) == TaskState::Pending)
        .filter(|step| deps_satisfied(step, status))
        .cloned()
        .collect()
}

/// Merge several task queries into one composite prompt.
pub fn merge_queries(tasks: &[AgentTask], prefix: &str) -> String {
    let queries: Vec<&str> = tasks
        .iter()
        .map(|t| t.query.trim())
        .filter(|q| !q.is_empty())
        .collect();
    match queries.len() {
        0 => String::new(),
        1 => queries[0].to_string(),
        _ => {
            let header = if prefix.is_empty() {
                "Execute these requests together"
            } else {
                prefix
            };
            let mut out = format!("{header}:");
            for q in queries {
                out.push_str(&format!("\n- {q}"));
            }
            out
        }
    }
}

pub fn latest_user_message(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

/// Query for a node: merged ready-task queries, falling back to the latest
/// user message when the plan carried no text.
pub fn agent_query(ctx: &AgentContext<'_>, tasks: &[AgentTask], prefix: &str) -> String {
    let merged = merge_queries(tasks, prefix);
    if !merged.is_empty() {
        return merged;
    }
    latest_user_message(ctx.messages)
}

pub fn truncate_text(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{}...", cut.trim_end())
}

// ── Canonical symbol extraction ───────────────────────────

lazy_static! {
    static ref DOLLAR_TICKER: Regex = Regex::new(r"\$([A-Z]{1,5})\b").unwrap();
    static ref BARE_TICKER: Regex = Regex::new(r"\b([A-Z]{1,5})\b").unwrap();
}

/// Common words and financial acronyms that look like tickers but aren't.
const SYMBOL_STOP_WORDS: [&str; 45] = [
    "THE", "AND", "FOR", "ARE", "BUT", "NOT", "YOU", "ALL", "CAN", "WAS", "ONE", "OUR", "OUT",
    "HAS", "HOW", "ITS", "MAY", "NEW", "NOW", "OLD", "GET", "GOT", "SHOW", "NEWS", "WHAT", "FROM",
    "WITH", "THIS", "THAT", "WILL", "HAVE", "BEEN", "THEY", "WERE", "SEC", "EPS", "PE", "DCF",
    "RSI", "MACD", "ETF", "USD", "CEO", "CFO", "IPO",
];

/// Extract ticker symbols: `$TICKER` first (highest confidence), then bare
/// all-caps words not in the stop list. Order-preserving, deduplicated.
pub fn extract_symbols(text: &str, max_symbols: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for cap in DOLLAR_TICKER.captures_iter(text) {
        let sym = cap[1].to_string();
        if seen.insert(sym.clone()) {
            out.push(sym);
        }
        if out.len() >= max_symbols {
            return out;
        }
    }
    for cap in BARE_TICKER.captures_iter(text) {
        let sym = cap[1].to_string();
        if SYMBOL_STOP_WORDS.contains(&sym.as_str()) {
            continue;
        }
        if seen.insert(sym.clone()) {
            out.push(sym);
        }
        if out.len() >= max_symbols {
            break;
        }
    }
    out
}

/// Company-name aliases resolved to tickers when no explicit symbol appears.
pub fn alias_symbol(text: &str) -> Option<&'static str> {
    let lowered = text.to_lowercase();
    [
        ("rivian", "RIVN"),
        ("apple", "AAPL"),
        ("microsoft", "MSFT"),
        ("tesla", "TSLA"),
        ("nvidia", "NVDA"),
        ("amazon", "AMZN"),
        ("meta", "META"),
        ("google", "GOOGL"),
        ("alphabet", "GOOGL"),
    ]
    .iter()
    .find(|(name, _)| lowered.contains(name))
    .map(|(_, ticker)| *ticker)
}

// ── Dispatch ──────────────────────────────────────────────

/// Run one specialist. Exceptions inside a node mark its ready tasks failed
/// and store the error string; the scheduler keeps going.
pub async fn run_agent(agent: AgentName, ctx: &AgentContext<'_>) -> AgentUpdate {
    let ready = ready_tasks_for_agent(ctx.plan, ctx.task_status, agent);
    let outcome = match agent {
        AgentName::MarketData => market_data::run(ctx, &ready).await,
        AgentName::Fundamentals => fundamentals::run(ctx, &ready).await,
        AgentName::Sentiment => sentiment::run(ctx, &ready).await,
        AgentName::Macro => macro_econ::run(ctx, &ready).await,
        AgentName::TechnicalAnalysis => technical::run(ctx, &ready).await,
        AgentName::Advisor => advisor::run(ctx, &ready).await,
    };
    match outcome {
        Ok(update) => update,
        Err(e) => {
            warn!(agent = agent.as_str(), error = %e, "agent execution failed");
            let mut update = AgentUpdate::default();
            update.agent_results.insert(
                agent,
                AgentResult {
                    agent,
                    content: format!("Error in {} analysis: {e}", agent.as_str()),
                    symbols: Vec::new(),
                    data: None,
                    error: Some(e.to_string()),
                },
            );
            for task in ready {
                update.task_status.insert(task.task_id, TaskState::Failed);
            }
            update
        }
    }
}

/// Apply a uniform terminal state to every claimed task.
pub fn status_for_all(tasks: &[AgentTask], state: TaskState) -> HashMap<String, TaskState> {
    tasks
        .iter()
        .map(|t| (t.task_id.clone(), state))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, agent: AgentName, deps: &[&str]) -> AgentTask {
        AgentTask {
            task_id: id.to_string(),
            agent,
            query: format!("query for {id}"),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn plan(steps: Vec<AgentTask>) -> ExecutionPlan {
        ExecutionPlan {
            reasoning: "test".into(),
            steps,
            parallel_groups: Vec::new(),
        }
    }

    #[test]
    fn deps_satisfied_requires_completed() {
        let t = task("t2", AgentName::TechnicalAnalysis, &["t1"]);
        let mut status = HashMap::new();
        assert!(!deps_satisfied(&t, &status));
        status.insert("t1".to_string(), TaskState::Pending);
        assert!(!deps_satisfied(&t, &status));
        status.insert("t1".to_string(), TaskState::Failed);
        assert!(!deps_satisfied(&t, &status));
        status.insert("t1".to_string(), TaskState::Completed);
        assert!(deps_satisfied(&t, &status));
    }

    #[test]
    fn ready_tasks_filter_by_agent_state_and_deps() {
        let p = plan(vec![
            task("t1", AgentName::MarketData, &[]),
            task("t2", AgentName::TechnicalAnalysis, &["t1"]),
            task("t3", AgentName::MarketData, &[]),
        ]);
        let mut status = HashMap::new();
        status.insert("t3".to_string(), TaskState::Completed);

        let ready = ready_tasks_for_agent(&p, &status, AgentName::MarketData);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].task_id, "t1");

        // Technical task is blocked until t1 completes.
        assert!(ready_tasks_for_agent(&p, &status, AgentName::TechnicalAnalysis).is_empty());
        status.insert("t1".to_string(), TaskState::Completed);
        assert_eq!(
            ready_tasks_for_agent(&p, &status, AgentName::TechnicalAnalysis).len(),
            1
        );
    }

    #[test]
    fn merge_queries_formats() {
        let single = vec![task("t1", AgentName::MarketData, &[])];
        assert_eq!(merge_queries(&single, "Run"), "query for t1");

        let multiple = vec![
            task("t1", AgentName::MarketData, &[]),
            task("t2", AgentName::MarketData, &[]),
        ];
        let merged = merge_queries(&multiple, "Execute these requests together");
        assert!(merged.starts_with("Execute these requests together:"));
        assert!(merged.contains("- query for t1"));
        assert!(merged.contains("- query for t2"));

        assert_eq!(merge_queries(&[], "Run"), "");
    }

    #[test]
    fn symbol_extraction_precedence() {
        let symbols = extract_symbols("Compare $AAPL vs MSFT and the RSI of NVDA", 5);
        assert_eq!(symbols[0], "AAPL");
        assert!(symbols.contains(&"MSFT".to_string()));
        assert!(symbols.contains(&"NVDA".to_string()));
        assert!(!symbols.contains(&"RSI".to_string()));
    }

    #[test]
    fn alias_lookup() {
        assert_eq!(alias_symbol("why did rivian drop"), Some("RIVN"));
        assert_eq!(alias_symbol("thoughts on Nvidia?"), Some("NVDA"));
        assert_eq!(alias_symbol("nothing here"), None);
    }
}
