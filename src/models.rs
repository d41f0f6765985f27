//! Shared domain models: agent identities, plan/task records, normalized
//! market-data shapes, and the SSE wire events.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of specialist agents.
///
/// Aliases coming out of planner JSON ("technicals", "portfolio", ...) are
/// canonicalized at the normalization boundary; nothing downstream ever sees
/// an alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentName {
    MarketData,
    Fundamentals,
    Sentiment,
    Macro,
    TechnicalAnalysis,
    Advisor,
}

impl AgentName {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentName::MarketData => "market_data",
            AgentName::Fundamentals => "fundamentals",
            AgentName::Sentiment => "sentiment",
            AgentName::Macro => "macro",
            AgentName::TechnicalAnalysis => "technical_analysis",
            AgentName::Advisor => "advisor",
        }
    }

    /// Section label used by the aggregator's multi-agent summary.
    pub fn label(&self) -> &'static str {
        match self {
            AgentName::MarketData => "Market Data",
            AgentName::Fundamentals => "Fundamentals",
            AgentName::Sentiment => "Sentiment",
            AgentName::Macro => "Macro",
            AgentName::TechnicalAnalysis => "Technical Analysis",
            AgentName::Advisor => "Advisor",
        }
    }

    /// Resolve a raw agent token, applying the alias map.
    pub fn parse_canonical(raw: &str) -> Option<AgentName> {
        match raw.trim().to_lowercase().as_str() {
            "market_data" => Some(AgentName::MarketData),
            "fundamentals" => Some(AgentName::Fundamentals),
            "sentiment" => Some(AgentName::Sentiment),
            "macro" => Some(AgentName::Macro),
            "technical_analysis" | "technicals" | "technicals_analysis" => {
                Some(AgentName::TechnicalAnalysis)
            }
            "advisor" | "portfolio" => Some(AgentName::Advisor),
            _ => None,
        }
    }

    /// Tier 1: independent data producers dispatched in parallel.
    pub fn is_research(&self) -> bool {
        matches!(
            self,
            AgentName::MarketData | AgentName::Fundamentals | AgentName::Sentiment | AgentName::Macro
        )
    }

    /// Tier 2: consumers that only run once research has settled.
    pub fn is_synthesis(&self) -> bool {
        !self.is_research()
    }
}

/// Lifecycle of a planned task. Terminal states never transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Completed,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Pending)
    }
}

/// A single unit of scheduling inside an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub task_id: String,
    pub agent: AgentName,
    pub query: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Normalized plan produced by the planner. Never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub reasoning: String,
    pub steps: Vec<AgentTask>,
    #[serde(default)]
    pub parallel_groups: Vec<Vec<AgentName>>,
}

/// One result per specialist per turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent: AgentName,
    pub content: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Partial state update returned by a specialist dispatch.
#[derive(Debug, Clone, Default)]
pub struct AgentUpdate {
    pub agent_results: HashMap<AgentName, AgentResult>,
    pub task_status: HashMap<String, TaskState>,
}

// ── Normalized market data shapes ─────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: Option<f64>,
    pub change: Option<f64>,
    pub percent_change: Option<f64>,
    pub volume: Option<i64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub open: Option<f64>,
    pub close: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub week_52_high: Option<f64>,
    pub week_52_low: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub dividend_yield: Option<f64>,
    pub timestamp: Option<String>,
    pub provider: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRow {
    pub symbol: String,
    pub date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mover {
    pub symbol: String,
    pub description: Option<String>,
    pub last_price: Option<f64>,
    pub change: Option<f64>,
    pub direction: String,
    pub volume: Option<i64>,
    pub total_volume: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoversReport {
    pub index: String,
    pub sort: String,
    pub movers: Vec<Mover>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketHoursRow {
    pub market: String,
    pub product: String,
    pub is_open: Option<bool>,
    pub date: Option<String>,
    pub session_hours: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsArticle {
    pub headline: Option<String>,
    pub summary: Option<String>,
    pub source: Option<String>,
    pub url: Option<String>,
    pub timestamp: Option<String>,
    #[serde(default)]
    pub symbols: Vec<String>,
}

// ── Chat endpoint ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportFollowupRef {
    pub report_type: String,
    pub thread_id: String,
    #[serde(default)]
    pub refresh_data: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub report_followup: Option<ReportFollowupRef>,
}

/// Compact step view carried by the `decision` event.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionStep {
    pub task_id: String,
    pub agent: String,
    pub query: String,
    pub depends_on: Vec<String>,
}

/// JSON events on the SSE stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    AgentStart {
        agent: String,
    },
    AgentEnd {
        agent: String,
    },
    Decision {
        reasoning: String,
        steps: Vec<DecisionStep>,
    },
    TaskUpdate {
        task_id: String,
        status: String,
    },
    ToolStart {
        tool: String,
    },
    ToolEnd {
        tool: String,
    },
    Token {
        content: String,
    },
    Final {
        content: String,
    },
    Error {
        message: String,
    },
    TraceRun {
        provider: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    TraceLink {
        url: String,
    },
    ReportMetadata {
        thread_id: String,
        report_type: String,
    },
}

/// Memory snippet surfaced to the planner prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnippet {
    pub content: String,
    pub metadata: serde_json::Value,
}

/// Strip client-side prefixes like `conv-<uuid>` and validate the remainder.
/// Returns `None` when no valid UUID can be recovered.
pub fn sanitize_uuid(raw: Option<&str>) -> Option<String> {
    let value = raw?.trim();
    if value.is_empty() {
        return None;
    }
    if value.len() == 36 && Uuid::parse_str(value).is_ok() {
        return Some(value.to_string());
    }
    if value.len() > 36 {
        // Drop one leading `prefix-` segment and retry.
        if let Some((_, rest)) = value.split_once('-') {
            if rest.len() == 36 && Uuid::parse_str(rest).is_ok() {
                return Some(rest.to_string());
            }
        }
    }
    None
}

pub fn now_iso() -> String {
    let now: DateTime<Utc> = Utc::now();
    now.to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_resolution() {
        assert_eq!(
            AgentName::parse_canonical("technicals"),
            Some(AgentName::TechnicalAnalysis)
        );
        assert_eq!(
            AgentName::parse_canonical("technicals_analysis"),
            Some(AgentName::TechnicalAnalysis)
        );
        assert_eq!(AgentName::parse_canonical("portfolio"), Some(AgentName::Advisor));
        assert_eq!(AgentName::parse_canonical("  market_data  "), Some(AgentName::MarketData));
        assert_eq!(AgentName::parse_canonical("unknown"), None);
    }

    #[test]
    fn tiers_are_disjoint_and_complete() {
        let all = [
            AgentName::MarketData,
            AgentName::Fundamentals,
            AgentName::Sentiment,
            AgentName::Macro,
            AgentName::TechnicalAnalysis,
            AgentName::Advisor,
        ];
        for agent in all {
            assert_ne!(agent.is_research(), agent.is_synthesis());
        }
        assert!(AgentName::MarketData.is_research());
        assert!(AgentName::Advisor.is_synthesis());
        assert!(AgentName::TechnicalAnalysis.is_synthesis());
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Skipped.is_terminal());
    }

    #[test]
    fn sanitize_uuid_handles_prefixes() {
        let id = "123e4567-e89b-12d3-a456-426614174000";
        assert_eq!(sanitize_uuid(Some(id)).as_deref(), Some(id));
        let prefixed = format!("conv-{id}");
        assert_eq!(sanitize_uuid(Some(&prefixed)).as_deref(), Some(id));
        assert_eq!(sanitize_uuid(Some("not-a-uuid")), None);
        assert_eq!(sanitize_uuid(None), None);
    }

    #[test]
    fn stream_event_wire_format() {
        let ev = StreamEvent::TaskUpdate {
            task_id: "t1_market_data".into(),
            status: "completed".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "task_update");
        assert_eq!(json["task_id"], "t1_market_data");
        assert_eq!(json["status"], "completed");
    }
}
