//! Planner: turns the latest user turn into a normalized execution plan.
//!
//! Follow-up resolution and plan normalization are deterministic and LLM-free
//! so they unit-test without a provider; only the plan proposal itself asks
//! the model, and any failure there falls back to a rule-based plan.

use std::collections::{HashMap, HashSet};

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::agents::latest_user_message;
use crate::llm;
use crate::models::{AgentName, AgentTask, ChatMessage, ExecutionPlan, MemorySnippet, TaskState};
use crate::state::AppDeps;
use crate::supervisor::ConversationState;

const PLANNER_PROMPT: &str = "You are a financial AI planner. Analyze the user's query and create an execution plan.\n\n\
Available specialist agents:\n\
- market_data: Real-time quotes, price history, market movers.\n\
- fundamentals: Company overview, analyst ratings, insider trades, SEC filings.\n\
- technicals: RSI, MACD, moving averages, support/resistance.\n\
- sentiment: Reddit sentiment, news sentiment, congressional trades.\n\
- macro: Economic indicators (FRED), Treasury yields, Federal funds rate, sector rotation.\n\
- advisor: Comprehensive investment advice combining multiple data sources.\n\n\
Rules:\n\
1. Identify the DATA CATEGORIES needed:\n\
   - Specific Stocks/Prices -> market_data\n\
   - Financials/Ratings/Insiders -> fundamentals\n\
   - Technical Indicators (RSI, etc) -> technical_analysis (Note: depends on market_data for history)\n\
   - Social Sentiment/News -> sentiment\n\
   - Macro/Yields/Rates/FRED -> macro\n\
   - Cross-domain summary/Advice -> advisor\n\
2. For simple single-category queries, use ONE agent.\n\
3. MANDATORY SPLITTING: If a query contains multiple data categories, you MUST create SEPARATE steps for each category.\n\
4. CRITICAL: If a user asks for technical analysis (RSI, moving averages, etc.), you MUST first fetch price history using `market_data`.\n\n\
Respond with valid JSON matching this schema:\n\
{\n\
    \"reasoning\": \"Brief explanation of your plan\",\n\
    \"steps\": [\n\
        {\n\
            \"agent\": \"agent_name\",\n\
            \"query\": \"specific sub-query\",\n\
            \"depends_on\": []\n\
        }\n\
    ],\n\
    \"parallel_groups\": [[\"agent1\", \"agent2\"]]\n\
}";

lazy_static! {
    static ref OUTER_JSON: Regex = Regex::new(r"(?s)\{.*\}").unwrap();
    static ref PRIMARY_DOLLAR: Regex = Regex::new(r"\$([A-Z]{1,5})\b").unwrap();
    static ref PRIMARY_BARE: Regex = Regex::new(r"\b([A-Z]{2,5})\b").unwrap();
}

const ADVISOR_TRIGGERS: [&str; 22] = [
    "why ",
    "why did",
    "what caused",
    "what drove",
    "explain",
    "compare",
    " vs ",
    "versus",
    "brief",
    "memo",
    "valuation",
    "dcf",
    "portfolio",
    "dividend",
    "risk",
    "report card",
    "catalyst",
    "trade plan",
    "entry zone",
    "should i",
    "recommend",
    "buy or sell",
];

const FUNDAMENTALS_TRIGGERS: [&str; 11] = [
    "fundamental",
    "valuation",
    "dcf",
    "earnings",
    "dividend",
    "compare",
    "versus",
    " vs ",
    "sector",
    "portfolio",
    "risk",
];

pub fn requires_advisor(user_message: &str) -> bool {
    let text = user_message.trim().to_lowercase();
    !text.is_empty() && ADVISOR_TRIGGERS.iter().any(|t| text.contains(t))
}

pub fn needs_fundamentals(user_message: &str) -> bool {
    let text = user_message.trim().to_lowercase();
    !text.is_empty() && FUNDAMENTALS_TRIGGERS.iter().any(|t| text.contains(t))
}

// ── Follow-up context resolution ──────────────────────────

fn is_affirmative(text: &str) -> bool {
    matches!(
        text.trim().to_lowercase().as_str(),
        "yes" | "yeah" | "yep" | "sure" | "ok" | "okay" | "go ahead" | "do it" | "please do"
            | "sounds good"
    )
}

fn is_ambiguous(text: &str) -> bool {
    let value = text.trim().to_lowercase();
    if value.is_empty() {
        return false;
    }
    if value.split_whitespace().count() <= 4 {
        return true;
    }
    ["that", "this", "same", "continue", "go on", "more on that"]
        .iter()
        .any(|t| value.contains(t))
}

fn extract_primary_symbol(text: &str) -> String {
    if let Some(cap) = PRIMARY_DOLLAR.captures(text) {
        return cap[1].to_uppercase();
    }
    let stop_words = ["RSI", "MACD", "SMA", "EMA", "USD", "THE", "AND"];
    for cap in PRIMARY_BARE.captures_iter(text) {
        let token = cap[1].to_uppercase();
        if !stop_words.contains(&token.as_str()) {
            return token;
        }
    }
    crate::agents::alias_symbol(text).unwrap_or("").to_string()
}

fn previous_user_message(messages: &[ChatMessage], latest: &str) -> String {
    let mut seen_latest = false;
    for msg in messages.iter().rev() {
        if msg.role != "user" {
            continue;
        }
        if !seen_latest && msg.content.trim() == latest.trim() {
            seen_latest = true;
            continue;
        }
        if seen_latest && !msg.content.trim().is_empty() {
            return msg.content.trim().to_string();
        }
    }
    String::new()
}

fn latest_assistant_message(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "assistant")
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

/// Resolve short or affirmative follow-ups against prior turn context.
pub fn resolve_follow_up_context(messages: &[ChatMessage], user_message: &str) -> String {
    let current = user_message.trim();
    if current.is_empty() {
        return user_message.to_string();
    }
    let previous_user = previous_user_message(messages, current);
    if previous_user.is_empty() {
        return current.to_string();
    }
    let previous_assistant = latest_assistant_message(messages).to_lowercase();
    let primary_symbol = extract_primary_symbol(&previous_user);
    let symbol_hint = if primary_symbol.is_empty() {
        String::new()
    } else {
        format!(" ({primary_symbol})")
    };

    if is_affirmative(current) {
        if previous_assistant.contains("catalyst probability breakdown")
            && previous_assistant.contains("trade plan")
        {
            let for_symbol = if primary_symbol.is_empty() {
                String::new()
            } else {
                format!(" for {primary_symbol}")
            };
            return format!(
                "Provide a catalyst probability breakdown{for_symbol}, plus a trade plan \
                 (entry zone, invalidation, stop, and target). Continue the prior request context: \
                 {previous_user}"
            );
        }
        return format!(
            "User confirmed to continue. Refine and continue prior request: {previous_user}. \
             Keep same symbol/topic{symbol_hint} unless user explicitly changes it."
        );
    }

    if is_ambiguous(current) {
        return format!(
            "Follow-up in same thread: {current}. Continue and refine prior request: {previous_user}. \
             Keep same symbol/topic{symbol_hint} unless user explicitly changes it."
        );
    }

    current.to_string()
}

// ── Defensive JSON extraction ─────────────────────────────

pub fn extract_json_candidate(text: &str) -> String {
    let mut cleaned = text.trim().to_string();
    if let Some(idx) = cleaned.find("```json") {
        cleaned = cleaned[idx + 7..].to_string();
        if let Some(end) = cleaned.find("```") {
            cleaned = cleaned[..end].to_string();
        }
    } else if let Some(idx) = cleaned.find("```") {
        cleaned = cleaned[idx + 3..].to_string();
        if let Some(end) = cleaned.find("```") {
            cleaned = cleaned[..end].to_string();
        }
    }
    let cleaned = cleaned.trim().to_string();
    if cleaned.starts_with('{') && cleaned.ends_with('}') {
        return cleaned;
    }
    if let Some(m) = OUTER_JSON.find(&cleaned) {
        return m.as_str().to_string();
    }
    cleaned
}

// ── Plan normalization ────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawTask {
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    agent: String,
    #[serde(default)]
    query: String,
    #[serde(default)]
    depends_on: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    steps: Vec<RawTask>,
    #[serde(default)]
    parallel_groups: Vec<Vec<String>>,
}

/// Canonicalize agents, assign stable task ids, rewrite agent-name deps to
/// task ids, apply default dependencies, collapse duplicate advisor steps,
/// and force an advisor pass for advisory intent.
fn normalize_plan(raw: RawPlan, user_message: &str) -> ExecutionPlan {
    let mut steps: Vec<AgentTask> = Vec::new();
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut latest_task_by_agent: HashMap<AgentName, String> = HashMap::new();

    for (idx, step) in raw.steps.into_iter().enumerate() {
        let Some(agent) = AgentName::parse_canonical(&step.agent) else {
            warn!(agent = %step.agent, "dropping plan step with unknown agent");
            continue;
        };
        let mut task_id = step.task_id.trim().to_string();
        if task_id.is_empty() {
            task_id = format!("t{}_{}", idx + 1, agent.as_str());
        }
        if seen_ids.contains(&task_id) {
            task_id = format!("{}_{}", task_id, idx + 1);
        }

        let mut deps: Vec<String> = Vec::new();
        for dep in &step.depends_on {
            let token = dep.trim();
            if token.is_empty() {
                continue;
            }
            if seen_ids.contains(token) {
                deps.push(token.to_string());
                continue;
            }
            // An agent name instead of a task id: bind to that agent's
            // latest task observed earlier in the plan.
            if let Some(dep_agent) = AgentName::parse_canonical(token) {
                if let Some(dep_task) = latest_task_by_agent.get(&dep_agent) {
                    deps.push(dep_task.clone());
                }
            }
        }
        let mut deduped: Vec<String> = Vec::new();
        for dep in deps {
            if dep != task_id && !deduped.contains(&dep) {
                deduped.push(dep);
            }
        }

        seen_ids.insert(task_id.clone());
        latest_task_by_agent.insert(agent, task_id.clone());
        steps.push(AgentTask {
            task_id,
            agent,
            query: step.query,
            depends_on: deduped,
        });
    }

    // Default dependency upgrades.
    for idx in 0..steps.len() {
        if steps[idx].agent == AgentName::Advisor && steps[idx].depends_on.is_empty() {
            let prior: Vec<String> = steps[..idx].iter().map(|s| s.task_id.clone()).collect();
            if !prior.is_empty() {
                steps[idx].depends_on = prior;
            }
        }
        if steps[idx].agent == AgentName::TechnicalAnalysis && steps[idx].depends_on.is_empty() {
            let prior_market: Vec<String> = steps[..idx]
                .iter()
                .filter(|s| s.agent == AgentName::MarketData)
                .map(|s| s.task_id.clone())
                .collect();
            if !prior_market.is_empty() {
                steps[idx].depends_on = prior_market;
            }
        }
    }

    // Collapse repeated advisor steps to a single trailing one.
    let advisor_indices: Vec<usize> = steps
        .iter()
        .enumerate()
        .filter(|(_, s)| s.agent == AgentName::Advisor)
        .map(|(i, _)| i)
        .collect();
    if advisor_indices.len() > 1 {
        let keep = *advisor_indices.last().expect("non-empty");
        let kept_id = steps[keep].task_id.clone();
        steps = steps
            .into_iter()
            .enumerate()
            .filter(|(i, s)| s.agent != AgentName::Advisor || *i == keep)
            .map(|(_, s)| s)
            .collect();
        if let Some(pos) = steps.iter().position(|s| s.task_id == kept_id) {
            let prior: Vec<String> = steps[..pos].iter().map(|s| s.task_id.clone()).collect();
            steps[pos].depends_on = prior;
        }
    }

    // Intent upgrade: advisory phrasing always gets a synthesis pass.
    if requires_advisor(user_message) && !steps.iter().any(|s| s.agent == AgentName::Advisor) {
        let task_id = format!("t{}_advisor", steps.len() + 1);
        let depends_on: Vec<String> = steps.iter().map(|s| s.task_id.clone()).collect();
        let query = if user_message.is_empty() {
            "Synthesize prior findings into a direct answer.".to_string()
        } else {
            user_message.to_string()
        };
        steps.push(AgentTask {
            task_id,
            agent: AgentName::Advisor,
            query,
            depends_on,
        });
    }

    let parallel_groups = raw
        .parallel_groups
        .into_iter()
        .map(|group| {
            group
                .iter()
                .filter_map(|agent| AgentName::parse_canonical(agent))
                .collect()
        })
        .collect();

    ExecutionPlan {
        reasoning: raw.reasoning,
        steps,
        parallel_groups,
    }
}

/// Rule-based plan used when the LLM plan cannot be obtained or parsed.
pub fn fallback_plan(effective_message: &str) -> ExecutionPlan {
    let mut steps = vec![AgentTask {
        task_id: "t1_market_data".to_string(),
        agent: AgentName::MarketData,
        query: effective_message.to_string(),
        depends_on: Vec::new(),
    }];
    if needs_fundamentals(effective_message) {
        steps.push(AgentTask {
            task_id: "t2_fundamentals".to_string(),
            agent: AgentName::Fundamentals,
            query: effective_message.to_string(),
            depends_on: Vec::new(),
        });
    }
    if requires_advisor(effective_message) {
        let depends_on: Vec<String> = steps.iter().map(|s| s.task_id.clone()).collect();
        steps.push(AgentTask {
            task_id: format!("t{}_advisor", steps.len() + 1),
            agent: AgentName::Advisor,
            query: effective_message.to_string(),
            depends_on,
        });
    }
    ExecutionPlan {
        reasoning: "Fallback due to planning error".to_string(),
        steps,
        parallel_groups: Vec::new(),
    }
}

pub struct PlanOutcome {
    pub plan: ExecutionPlan,
    pub task_status: HashMap<String, TaskState>,
    pub memory_context: Vec<MemorySnippet>,
}

fn all_pending(plan: &ExecutionPlan) -> HashMap<String, TaskState> {
    plan.steps
        .iter()
        .map(|s| (s.task_id.clone(), TaskState::Pending))
        .collect()
}

/// Full planner node: follow-up resolution, memory recall, LLM plan,
/// defensive parsing, normalization, deterministic fallback.
pub async fn plan_turn(deps: &AppDeps, state: &ConversationState) -> PlanOutcome {
    let user_message = latest_user_message(&state.messages);
    let effective_message = resolve_follow_up_context(&state.messages, &user_message);

    let memory_context = deps
        .memory
        .get_relevant_context(
            &effective_message,
            4,
            Some(&state.tenant_id),
            Some(&state.user_id),
            Some(&state.conversation_id),
        )
        .await;

    let mut memory_text = String::new();
    if !memory_context.is_empty() {
        memory_text.push_str("\n\nRelevant past context:\n");
        for snippet in memory_context.iter().take(2) {
            let head: String = snippet.content.chars().take(220).collect();
            memory_text.push_str(&format!("- {head}\n"));
        }
    }

    let llm_plan = async {
        let response = deps
            .llm
            .create_message(
                &crate::config::SETTINGS.routing_model,
                PLANNER_PROMPT,
                &[llm::user_message(&format!("{effective_message}{memory_text}"))],
                None,
                1000,
            )
            .await?;
        let candidate = extract_json_candidate(&response.text());
        let raw: RawPlan = serde_json::from_str(&candidate)?;
        anyhow::Ok(normalize_plan(raw, &effective_message))
    }
    .await;

    let plan = match llm_plan {
        Ok(plan) if !plan.steps.is_empty() => plan,
        Ok(_) => {
            warn!("planner returned an empty plan, using fallback");
            fallback_plan(&effective_message)
        }
        Err(e) => {
            warn!(error = %e, "planner error, using fallback");
            fallback_plan(&effective_message)
        }
    };

    PlanOutcome {
        task_status: all_pending(&plan),
        plan,
        memory_context,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(steps: Vec<RawTask>) -> RawPlan {
        RawPlan {
            reasoning: "test".into(),
            steps,
            parallel_groups: Vec::new(),
        }
    }

    fn raw_task(id: &str, agent: &str, deps: &[&str]) -> RawTask {
        RawTask {
            task_id: id.to_string(),
            agent: agent.to_string(),
            query: "q".to_string(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn json_extraction_strips_fences() {
        let fenced = "Here is the plan:\n```json\n{\"steps\": []}\n```\nDone.";
        assert_eq!(extract_json_candidate(fenced), "{\"steps\": []}");
        let braces = "noise {\"reasoning\": \"x\", \"steps\": []} trailing";
        assert!(extract_json_candidate(braces).starts_with('{'));
        assert!(extract_json_candidate(braces).ends_with('}'));
    }

    #[test]
    fn normalize_assigns_ids_and_canonicalizes() {
        let plan = normalize_plan(
            raw(vec![
                raw_task("", "market_data", &[]),
                raw_task("", "technicals", &["market_data"]),
            ]),
            "",
        );
        assert_eq!(plan.steps[0].task_id, "t1_market_data");
        assert_eq!(plan.steps[1].agent, AgentName::TechnicalAnalysis);
        // Agent-name dependency rewritten to the market_data task id.
        assert_eq!(plan.steps[1].depends_on, vec!["t1_market_data"]);
    }

    #[test]
    fn normalize_drops_self_and_duplicate_deps() {
        let plan = normalize_plan(
            raw(vec![
                raw_task("t1", "market_data", &[]),
                raw_task("t2", "advisor", &["t1", "t1", "t2"]),
            ]),
            "",
        );
        assert_eq!(plan.steps[1].depends_on, vec!["t1"]);
    }

    #[test]
    fn normalize_applies_default_dependencies() {
        let plan = normalize_plan(
            raw(vec![
                raw_task("t1", "market_data", &[]),
                raw_task("t2", "sentiment", &[]),
                raw_task("t3", "advisor", &[]),
            ]),
            "",
        );
        assert_eq!(plan.steps[2].depends_on, vec!["t1", "t2"]);

        let plan = normalize_plan(
            raw(vec![
                raw_task("t1", "market_data", &[]),
                raw_task("t2", "technical_analysis", &[]),
            ]),
            "",
        );
        assert_eq!(plan.steps[1].depends_on, vec!["t1"]);
    }

    #[test]
    fn normalize_collapses_duplicate_advisors() {
        let plan = normalize_plan(
            raw(vec![
                raw_task("t1", "advisor", &[]),
                raw_task("t2", "market_data", &[]),
                raw_task("t3", "advisor", &[]),
            ]),
            "",
        );
        let advisors: Vec<&AgentTask> = plan
            .steps
            .iter()
            .filter(|s| s.agent == AgentName::Advisor)
            .collect();
        assert_eq!(advisors.len(), 1);
        assert_eq!(advisors[0].task_id, "t3");
        assert_eq!(advisors[0].depends_on, vec!["t2"]);
    }

    #[test]
    fn normalize_upgrades_advisory_intent() {
        let plan = normalize_plan(
            raw(vec![raw_task("t1", "market_data", &[])]),
            "why did TSLA drop this week?",
        );
        let last = plan.steps.last().unwrap();
        assert_eq!(last.agent, AgentName::Advisor);
        assert_eq!(last.depends_on, vec!["t1"]);
    }

    #[test]
    fn normalized_plans_are_acyclic_with_known_deps() {
        let plan = normalize_plan(
            raw(vec![
                raw_task("t1", "market_data", &[]),
                raw_task("t2", "fundamentals", &["bogus_task", "market_data"]),
                raw_task("t3", "advisor", &[]),
            ]),
            "recommend something",
        );
        let ids: HashSet<&str> = plan.steps.iter().map(|s| s.task_id.as_str()).collect();
        for (idx, step) in plan.steps.iter().enumerate() {
            for dep in &step.depends_on {
                assert!(ids.contains(dep.as_str()), "dep {dep} must exist");
                // Deps always point at earlier steps: acyclic by construction.
                let dep_idx = plan.steps.iter().position(|s| &s.task_id == dep).unwrap();
                assert!(dep_idx < idx);
            }
        }
    }

    #[test]
    fn unknown_agents_are_dropped() {
        let plan = normalize_plan(
            raw(vec![
                raw_task("t1", "quantum_oracle", &[]),
                raw_task("t2", "market_data", &[]),
            ]),
            "",
        );
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].agent, AgentName::MarketData);
    }

    #[test]
    fn fallback_plan_shapes() {
        let plan = fallback_plan("price of AAPL");
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].agent, AgentName::MarketData);

        let plan = fallback_plan("compare the valuation of AAPL vs MSFT");
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[1].agent, AgentName::Fundamentals);
        let advisor = &plan.steps[2];
        assert_eq!(advisor.agent, AgentName::Advisor);
        assert_eq!(advisor.depends_on, vec!["t1_market_data", "t2_fundamentals"]);
    }

    #[test]
    fn affirmative_follow_up_expands_catalyst_request() {
        let messages = vec![
            ChatMessage {
                role: "user".into(),
                content: "Why did TSLA drop this past week?".into(),
            },
            ChatMessage {
                role: "assistant".into(),
                content: "…**Next step:** Want a catalyst probability breakdown with a trade plan (entry, invalidation, stop)?".into(),
            },
            ChatMessage { role: "user".into(), content: "yes".into() },
        ];
        let resolved = resolve_follow_up_context(&messages, "yes");
        assert!(resolved.contains("catalyst probability breakdown"));
        assert!(resolved.contains("trade plan"));
        assert!(resolved.contains("TSLA"));
    }

    #[test]
    fn ambiguous_follow_up_keeps_prior_topic() {
        let messages = vec![
            ChatMessage { role: "user".into(), content: "Analyze NVDA fundamentals".into() },
            ChatMessage { role: "assistant".into(), content: "NVDA looks strong.".into() },
            ChatMessage { role: "user".into(), content: "more on that".into() },
        ];
        let resolved = resolve_follow_up_context(&messages, "more on that");
        assert!(resolved.contains("Continue and refine prior request"));
        assert!(resolved.contains("NVDA"));
    }

    #[test]
    fn specific_follow_up_passes_through() {
        let messages = vec![
            ChatMessage { role: "user".into(), content: "Analyze NVDA".into() },
            ChatMessage { role: "assistant".into(), content: "done".into() },
            ChatMessage {
                role: "user".into(),
                content: "Now give me a full breakdown of AMD's insider activity please".into(),
            },
        ];
        let resolved = resolve_follow_up_context(
            &messages,
            "Now give me a full breakdown of AMD's insider activity please",
        );
        assert!(resolved.starts_with("Now give me a full breakdown"));
    }

    #[test]
    fn advisory_lexicon() {
        assert!(requires_advisor("why did it drop"));
        assert!(requires_advisor("should i buy TSLA"));
        assert!(requires_advisor("run a dcf"));
        assert!(!requires_advisor("price of AAPL"));
        assert!(needs_fundamentals("compare earnings"));
        assert!(!needs_fundamentals("top movers today"));
    }
}
