//! Aggregator: produce the final response and persist the turn to memory.

use std::collections::HashMap;

use serde_json::json;
use tracing::warn;

use crate::agents::latest_user_message;
use crate::models::{AgentName, AgentResult};
use crate::state::AppDeps;
use crate::supervisor::ConversationState;

/// Advisor output wins outright when present; otherwise a fixed-order
/// multi-agent summary is composed.
pub fn compose_final(results: &HashMap<AgentName, AgentResult>) -> String {
    if results.is_empty() {
        return "No agents were executed.".to_string();
    }
    if let Some(advisor) = results.get(&AgentName::Advisor) {
        let text = advisor.content.trim();
        if !text.is_empty() {
            return text.to_string();
        }
    }
    compose_multi_agent_summary(results)
}

fn compose_multi_agent_summary(results: &HashMap<AgentName, AgentResult>) -> String {
    let ordered = [
        AgentName::MarketData,
        AgentName::Fundamentals,
        AgentName::TechnicalAnalysis,
        AgentName::Sentiment,
        AgentName::Macro,
        AgentName::Advisor,
    ];
    let mut sections = Vec::new();
    for agent in ordered {
        let Some(result) = results.get(&agent) else {
            continue;
        };
        let content = result.content.trim();
        if content.is_empty() {
            continue;
        }
        sections.push(format!("### {}\n{content}", agent.label()));
    }
    match sections.len() {
        0 => "No analysis content was generated.".to_string(),
        1 => sections[0].replacen("### ", "", 1),
        _ => format!("Here's what I found:\n\n{}", sections.join("\n\n")),
    }
}

/// Finalize the turn: compose the answer and persist the exchange. Memory
/// persistence is best-effort.
pub async fn aggregate(deps: &AppDeps, state: &mut ConversationState) {
    state.final_response = compose_final(&state.agent_results);

    let user_message = latest_user_message(&state.messages);
    if user_message.is_empty() {
        return;
    }
    let metadata = json!({
        "conversation_id": state.conversation_id,
        "user_id": state.user_id,
        "tenant_id": state.tenant_id,
    });
    // save_interaction logs its own failures; nothing propagates.
    deps.memory
        .save_interaction(&user_message, &state.final_response, &metadata)
        .await;
    if state.final_response.is_empty() {
        warn!("aggregator produced an empty final response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(agent: AgentName, content: &str) -> AgentResult {
        AgentResult {
            agent,
            content: content.to_string(),
            symbols: Vec::new(),
            data: None,
            error: None,
        }
    }

    #[test]
    fn advisor_content_wins() {
        let mut results = HashMap::new();
        results.insert(AgentName::MarketData, result(AgentName::MarketData, "Quote data"));
        results.insert(AgentName::Advisor, result(AgentName::Advisor, "**Direct answer:** hold."));
        assert_eq!(compose_final(&results), "**Direct answer:** hold.");
    }

    #[test]
    fn empty_advisor_falls_back_to_summary() {
        let mut results = HashMap::new();
        results.insert(AgentName::MarketData, result(AgentName::MarketData, "Quote data"));
        results.insert(AgentName::Sentiment, result(AgentName::Sentiment, "Bullish chatter"));
        results.insert(AgentName::Advisor, result(AgentName::Advisor, "  "));
        let out = compose_final(&results);
        assert!(out.starts_with("Here's what I found:"));
        // Fixed section order: market data before sentiment.
        let md = out.find("### Market Data").unwrap();
        let sent = out.find("### Sentiment").unwrap();
        assert!(md < sent);
    }

    #[test]
    fn single_section_is_unwrapped() {
        let mut results = HashMap::new();
        results.insert(AgentName::MarketData, result(AgentName::MarketData, "Only section"));
        let out = compose_final(&results);
        assert_eq!(out, "Market Data\nOnly section");
    }

    #[test]
    fn no_results_message() {
        assert_eq!(compose_final(&HashMap::new()), "No agents were executed.");
        let mut results = HashMap::new();
        results.insert(AgentName::MarketData, result(AgentName::MarketData, ""));
        assert_eq!(compose_final(&results), "No analysis content was generated.");
    }
}
