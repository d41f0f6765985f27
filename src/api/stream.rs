//! Streaming chat endpoint.
//!
//! Classifies the latest user turn (explicit report follow-up → implicit
//! report request → chat), drives the matching pipeline, and emits the JSON
//! event protocol over SSE. Exactly one `final` event per turn; a failed turn
//! adds an `error` event plus a short fallback `final`.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::stream::Stream;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::agents::EventSink;
use crate::models::{sanitize_uuid, ChatRequest, StreamEvent};
use crate::reports::orchestrator::{self, ReportRunOptions};
use crate::state::AppDeps;
use crate::supervisor::{scheduler, ConversationState};

pub fn router() -> Router<Arc<AppDeps>> {
    Router::new().route("/chat", post(chat_endpoint))
}

// ── Report request detection ──────────────────────────────

lazy_static! {
    static ref REPORT_PATTERNS: Vec<(&'static str, Vec<Regex>)> = {
        let compile = |patterns: &[&str]| {
            patterns
                .iter()
                .map(|p| Regex::new(p).expect("valid report pattern"))
                .collect::<Vec<_>>()
        };
        // Institution-specific patterns first, generic phrasing after; the
        // first match wins.
        vec![
            ("harvard_dividend", compile(&[
                r"harvard.*endowment",
                r"harvard.*dividend",
                r"endowment.*dividend.*strategy",
            ])),
            ("citadel_technical", compile(&[
                r"citadel.*technical",
                r"citadel.*style",
                r"technical analysis.*citadel",
                r"senior.*quantitative.*trader.*citadel",
            ])),
            ("morgan_dcf", compile(&[
                r"morgan.*stanley.*dcf",
                r"morgan.*dcf",
                r"morgan.*stanley.*equity.*research",
                r"morgan.*stanley.*valuation",
            ])),
            ("bridgewater_risk", compile(&[
                r"bridgewater.*risk",
                r"bridgewater.*portfolio",
            ])),
            ("goldman_screener", compile(&[
                r"goldman.*sachs.*screen",
                r"goldman.*screen",
                r"goldman.*sachs.*equity.*research",
            ])),
            ("jpm_earnings", compile(&[
                r"jpmorgan.*earnings?",
                r"jpm.*earnings?",
            ])),
            ("blackrock_builder", compile(&[
                r"blackrock.*portfolio",
                r"blackrock.*builder",
                r"blackrock.*asset.*allocation",
            ])),
            ("bain_competitive", compile(&[r"bain.*competitive"])),
            ("renaissance_pattern", compile(&[r"renaissance.*pattern"])),
            ("mckinsey_macro", compile(&[r"mckinsey.*macro"])),
            // Generic patterns mapped back to their base report types.
            ("citadel_technical", compile(&[
                r"technical analysis",
                r"rsi.*macd",
                r"support.*resistance",
                r"fibonacci.*retracement",
                r"bollinger bands?",
                r"chart patterns?",
            ])),
            ("goldman_screener", compile(&[
                r"stock screen",
                r"screen.*stocks?",
                r"growth.*stocks?.*screen",
            ])),
            ("morgan_dcf", compile(&[
                r"dcf.*valuation",
                r"discounted.*cash.*flow",
                r"intrinsic.*value",
            ])),
            ("jpm_earnings", compile(&[r"earnings?.*analysis", r"earnings?.*report"])),
            ("blackrock_builder", compile(&[
                r"portfolio.*builder?",
                r"build.*portfolio",
                r"asset.*allocation",
                r"moderate.*risk.*portfolio",
            ])),
            ("harvard_dividend", compile(&[
                r"dividend.*strategy",
                r"dividend.*income",
                r"income.*portfolio",
            ])),
            ("bain_competitive", compile(&[
                r"competitive.*analysis",
                r"industry.*analysis",
                r"sector.*analysis",
            ])),
            ("renaissance_pattern", compile(&[r"pattern.*finder?", r"quantitative.*patterns?"])),
            ("mckinsey_macro", compile(&[
                r"macro.*economic",
                r"economic.*impact",
                r"macro.*analysis",
            ])),
            ("bridgewater_risk", compile(&[
                r"risk.*assessment",
                r"portfolio.*risk",
                r"risk.*analysis",
            ])),
        ]
    };
    static ref BRACKET_TICKER: Regex = Regex::new(r"\[([A-Z]{1,5})\]").unwrap();
    static ref ANALYZE_TICKER: Regex =
        Regex::new(r"(?i)(?:analyze|stock|ticker|symbol):\s*\[?([A-Za-z]{1,5})\]?").unwrap();
    static ref STANDALONE_TICKER: Regex = Regex::new(r"\b([A-Z]{2,5})\b").unwrap();
}

/// Detect whether a user turn is an implicit report request, returning the
/// report type and its extracted payload.
pub fn detect_report_request(user_query: &str) -> Option<(String, Value)> {
    let query_lower = user_query.to_lowercase();
    for (report_type, patterns) in REPORT_PATTERNS.iter() {
        if !patterns.iter().any(|p| p.is_match(&query_lower)) {
            continue;
        }

        let mut payload = serde_json::Map::new();
        let ticker = BRACKET_TICKER
            .captures(user_query)
            .map(|c| c[1].to_string())
            .or_else(|| {
                ANALYZE_TICKER
                    .captures(user_query)
                    .map(|c| c[1].to_uppercase())
            })
            .or_else(|| {
                STANDALONE_TICKER
                    .captures_iter(user_query)
                    .last()
                    .map(|c| c[1].to_string())
            });
        if let Some(ticker) = ticker {
            payload.insert("ticker".to_string(), json!(ticker));
        }

        if *report_type == "bain_competitive" {
            for word in [
                "tech", "technology", "semiconductor", "finance", "healthcare", "energy", "retail",
            ] {
                if query_lower.contains(word) {
                    payload.insert("sector".to_string(), json!(word));
                    break;
                }
            }
        }
        return Some((report_type.to_string(), Value::Object(payload)));
    }
    None
}

// ── SSE plumbing ──────────────────────────────────────────

/// Abort the producer task when the client disconnects and the stream drops.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

fn sse_from_channel(rx: mpsc::UnboundedReceiver<StreamEvent>, handle: JoinHandle<()>) -> Sse<EventStream> {
    let guard = AbortOnDrop(handle);
    let stream = futures_util::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Some((Ok(Event::default().data(data)), (rx, guard)))
    });
    Sse::new(Box::pin(stream))
}

fn latest_user_query(request: &ChatRequest) -> String {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

// ── Endpoint ──────────────────────────────────────────────

async fn chat_endpoint(
    State(deps): State<Arc<AppDeps>>,
    Json(request): Json<ChatRequest>,
) -> Sse<EventStream> {
    let user_query = latest_user_query(&request);

    if request.report_followup.is_some() {
        return handle_report_followup(deps, request, user_query);
    }
    if let Some((report_type, payload)) = detect_report_request(&user_query) {
        return handle_report_request(deps, request, report_type, payload);
    }
    handle_chat_request(deps, request, user_query)
}

fn handle_report_request(
    deps: Arc<AppDeps>,
    request: ChatRequest,
    report_type: String,
    payload: Value,
) -> Sse<EventStream> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let conversation_id = sanitize_uuid(request.conversation_id.as_deref())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let user_id =
            sanitize_uuid(request.user_id.as_deref()).unwrap_or_else(|| Uuid::new_v4().to_string());
        let started = Instant::now();

        let _ = tx.send(StreamEvent::AgentStart {
            agent: "report_generator".to_string(),
        });
        let report_name = report_type
            .split('_')
            .map(|w| {
                let mut chars = w.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        let _ = tx.send(StreamEvent::Token {
            content: format!("Generating {report_name} report..."),
        });

        let options = ReportRunOptions {
            owner_key: Some(user_id),
            thread_id: Some(conversation_id),
            ..Default::default()
        };
        match orchestrator::orchestrate_report(&deps, &report_type, &payload, options).await {
            Ok(result) => {
                let markdown = result
                    .get("markdown")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                if markdown.is_empty() {
                    let _ = tx.send(StreamEvent::Error {
                        message: "Failed to generate report".to_string(),
                    });
                } else {
                    let _ = tx.send(StreamEvent::Final { content: markdown });
                }
                let _ = tx.send(StreamEvent::AgentEnd {
                    agent: "report_generator".to_string(),
                });
                if let Some(thread_id) = result.get("thread_id").and_then(|v| v.as_str()) {
                    let _ = tx.send(StreamEvent::ReportMetadata {
                        thread_id: thread_id.to_string(),
                        report_type: report_type.clone(),
                    });
                }
            }
            Err(e) => {
                let message = format!("Error generating report: {e}");
                let _ = tx.send(StreamEvent::Error {
                    message: message.clone(),
                });
                let _ = tx.send(StreamEvent::Final { content: message });
            }
        }
        let _ = tx.send(StreamEvent::TraceRun {
            provider: "report".to_string(),
            run_id: None,
            duration_ms: Some(started.elapsed().as_millis() as u64),
        });
    });
    sse_from_channel(rx, handle)
}

fn handle_report_followup(
    deps: Arc<AppDeps>,
    request: ChatRequest,
    user_query: String,
) -> Sse<EventStream> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let followup = request.report_followup.clone().expect("checked by caller");
        let owner_key =
            sanitize_uuid(request.user_id.as_deref()).unwrap_or_else(|| Uuid::new_v4().to_string());
        if followup.report_type.is_empty() || followup.thread_id.is_empty() {
            let _ = tx.send(StreamEvent::Error {
                message: "Missing report type or thread ID for follow-up".to_string(),
            });
            return;
        }
        let started = Instant::now();

        let _ = tx.send(StreamEvent::AgentStart {
            agent: "report_followup".to_string(),
        });
        let _ = tx.send(StreamEvent::Token {
            content: "Processing follow-up question...".to_string(),
        });

        match orchestrator::orchestrate_report_followup(
            &deps,
            &followup.report_type,
            &owner_key,
            &followup.thread_id,
            &user_query,
            followup.refresh_data,
        )
        .await
        {
            Ok(result) => {
                let markdown = result
                    .get("markdown")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                if markdown.is_empty() {
                    let _ = tx.send(StreamEvent::Error {
                        message: "Failed to generate follow-up response".to_string(),
                    });
                } else {
                    let _ = tx.send(StreamEvent::Final { content: markdown });
                }
                let _ = tx.send(StreamEvent::AgentEnd {
                    agent: "report_followup".to_string(),
                });
            }
            Err(e) => {
                let message = format!("Error processing follow-up: {e}");
                let _ = tx.send(StreamEvent::Error {
                    message: message.clone(),
                });
                let _ = tx.send(StreamEvent::Final { content: message });
            }
        }
        let _ = tx.send(StreamEvent::TraceRun {
            provider: "report_followup".to_string(),
            run_id: None,
            duration_ms: Some(started.elapsed().as_millis() as u64),
        });
    });
    sse_from_channel(rx, handle)
}

fn handle_chat_request(
    deps: Arc<AppDeps>,
    request: ChatRequest,
    user_query: String,
) -> Sse<EventStream> {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let conversation_id = sanitize_uuid(request.conversation_id.as_deref())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let user_id =
            sanitize_uuid(request.user_id.as_deref()).unwrap_or_else(|| Uuid::new_v4().to_string());
        let tenant_id = request
            .tenant_id
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| format!("tenant_{user_id}"));

        let state = ConversationState {
            messages: request.messages.clone(),
            user_id,
            tenant_id,
            conversation_id,
            ..Default::default()
        };

        let started = Instant::now();
        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel();
        let run_deps = deps.clone();
        let run = tokio::spawn(async move {
            scheduler::run_turn(&run_deps, state, EventSink::new(agent_tx)).await
        });

        // Forward agent events while recording them for the trace log.
        let mut recorded: Vec<Value> = Vec::new();
        let mut route_agents: Vec<String> = Vec::new();
        let mut error_message: Option<String> = None;
        while let Some(event) = agent_rx.recv().await {
            if let Ok(raw) = serde_json::to_value(&event) {
                recorded.push(raw);
            }
            if let StreamEvent::Decision { ref steps, .. } = event {
                route_agents = steps.iter().map(|s| s.agent.clone()).collect();
            }
            if let StreamEvent::Error { ref message } = event {
                error_message = Some(message.clone());
            }
            let _ = out_tx.send(event);
        }

        let final_text = match run.await {
            Ok(final_state) => final_state.final_response,
            Err(e) => {
                let message = format!("Internal scheduler failure: {e}");
                error_message = Some(message.clone());
                let _ = out_tx.send(StreamEvent::Error { message });
                "I hit an internal error while running this analysis.".to_string()
            }
        };
        let _ = out_tx.send(StreamEvent::Final {
            content: final_text.clone(),
        });

        let duration_ms = started.elapsed().as_millis() as u64;
        let status = if error_message.is_some() {
            "error"
        } else if final_text.is_empty() {
            "partial"
        } else {
            "ok"
        };
        let tracker_result = deps.tracker.log_chat_trace(
            &user_query,
            &final_text,
            &recorded,
            duration_ms,
            &route_agents,
            status,
            error_message.as_deref(),
        );
        if let Some(run_id) = tracker_result.run_id {
            let _ = out_tx.send(StreamEvent::TraceRun {
                provider: "tracker".to_string(),
                run_id: Some(run_id),
                duration_ms: Some(duration_ms),
            });
            let _ = out_tx.send(StreamEvent::TraceLink {
                url: deps.tracker.ui_url(),
            });
        }
    });
    sse_from_channel(out_rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_institution_report_detection() {
        let (report_type, payload) =
            detect_report_request("Citadel technical report for [PLTR]").unwrap();
        assert_eq!(report_type, "citadel_technical");
        assert_eq!(payload["ticker"], "PLTR");
    }

    #[test]
    fn analyze_prefix_ticker_extraction() {
        let (report_type, payload) =
            detect_report_request("morgan stanley dcf, analyze: nvda").unwrap();
        assert_eq!(report_type, "morgan_dcf");
        assert_eq!(payload["ticker"], "NVDA");
    }

    #[test]
    fn standalone_ticker_takes_last_uppercase_token() {
        let (report_type, payload) =
            detect_report_request("I want a goldman screen including AAPL and MSFT").unwrap();
        assert_eq!(report_type, "goldman_screener");
        assert_eq!(payload["ticker"], "MSFT");
    }

    #[test]
    fn generic_patterns_map_to_base_types() {
        let (report_type, _) = detect_report_request("run technical analysis on TSLA").unwrap();
        assert_eq!(report_type, "citadel_technical");
        let (report_type, _) = detect_report_request("discounted cash flow for AAPL").unwrap();
        assert_eq!(report_type, "morgan_dcf");
    }

    #[test]
    fn institution_patterns_win_over_generic() {
        // "citadel technical" also matches the generic technical-analysis
        // pattern; the institution-specific entry is ordered first.
        let (report_type, _) =
            detect_report_request("citadel style technical analysis of [AMD]").unwrap();
        assert_eq!(report_type, "citadel_technical");
    }

    #[test]
    fn sector_keyword_for_competitive_reports() {
        let (report_type, payload) =
            detect_report_request("bain competitive review of the semiconductor space").unwrap();
        assert_eq!(report_type, "bain_competitive");
        assert_eq!(payload["sector"], "semiconductor");
    }

    #[test]
    fn plain_chat_is_not_a_report() {
        assert!(detect_report_request("What's the price of AAPL today?").is_none());
        assert!(detect_report_request("why did TSLA drop this past week?").is_none());
    }
}
