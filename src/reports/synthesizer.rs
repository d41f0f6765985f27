//! Report synthesis: clean the builder markdown and append at most one
//! limitation note and one critical assumption.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};

lazy_static! {
    static ref OBJECT_ARTIFACT: Regex = Regex::new(r"(?i)\[object Object\]").unwrap();
    static ref EXCESS_NEWLINES: Regex = Regex::new(r"\n{3,}").unwrap();
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{}...", cut.trim_end())
}

fn clean_base_markdown(markdown: &str) -> String {
    let cleaned = OBJECT_ARTIFACT.replace_all(markdown, "");
    EXCESS_NEWLINES.replace_all(&cleaned, "\n\n").trim().to_string()
}

pub struct Synthesis {
    pub markdown: String,
    pub trace: Value,
}

pub fn synthesize_report_markdown(
    report: &Value,
    _effective_prompt: &str,
    follow_up_question: Option<&str>,
    _thread_messages: &[Value],
) -> Synthesis {
    let base_markdown = report.get("markdown").and_then(|v| v.as_str()).unwrap_or("");
    let assumptions: Vec<&str> = report
        .get("assumptions")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    let limitations: Vec<&str> = report
        .get("limitations")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    let mut parts: Vec<String> = Vec::new();
    if let Some(question) = follow_up_question.filter(|q| !q.trim().is_empty()) {
        parts.push(format!("**Follow-up Analysis:** {question}"));
        parts.push(String::new());
    }

    let clean_body = clean_base_markdown(base_markdown);
    if clean_body.is_empty() {
        parts.push("Report generated successfully.".to_string());
    } else {
        parts.push(clean_body);
    }

    // At most one Note (first limitation) and one critical Assumption.
    let mut caveats = Vec::new();
    if let Some(first) = limitations.first() {
        caveats.push(format!("**Note:** {}", truncate(first, 200)));
    }
    if let Some(critical) = assumptions.iter().find(|a| {
        let lower = a.to_lowercase();
        ["inferred", "estimated", "assumed"].iter().any(|w| lower.contains(w))
    }) {
        caveats.push(format!("**Assumption:** {}", truncate(critical, 200)));
    }
    if !caveats.is_empty() {
        parts.push(String::new());
        parts.push("---".to_string());
        parts.push(String::new());
        parts.extend(caveats);
    }

    Synthesis {
        markdown: parts.join("\n").trim().to_string(),
        trace: json!({
            "phase": "synthesis",
            "status": "ok",
            "details": {
                "follow_up": follow_up_question.is_some(),
                "simplified_output": true,
            },
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_body_is_preserved() {
        let report = json!({
            "markdown": "# Title\n- Item one\n- Item two",
            "sources_used": ["finviz"],
            "assumptions": ["A"],
            "limitations": ["L"],
        });
        let out = synthesize_report_markdown(&report, "You are a banker.", None, &[]);
        assert!(out.markdown.contains("# Title"));
        assert!(out.markdown.contains("Item one"));
        assert!(out.markdown.contains("Item two"));
    }

    #[test]
    fn limitation_note_appended_after_divider() {
        let report = json!({
            "markdown": "# Report\nSome content.",
            "limitations": ["This is a limitation."],
            "assumptions": [],
        });
        let out = synthesize_report_markdown(&report, "Prompt", None, &[]);
        assert!(out.markdown.contains("---"));
        assert!(out.markdown.contains("**Note:** This is a limitation."));
    }

    #[test]
    fn object_artifacts_are_stripped() {
        let report = json!({"markdown": "[object Object]"});
        let out = synthesize_report_markdown(&report, "Prompt", None, &[]);
        assert!(!out.markdown.contains("[object Object]"));
        assert!(out.markdown.contains("Report generated successfully."));
    }

    #[test]
    fn follow_up_label_leads() {
        let report = json!({"markdown": "# Report\nContent."});
        let out = synthesize_report_markdown(&report, "Prompt", Some("What is the P/E ratio?"), &[]);
        assert!(out.markdown.starts_with("**Follow-up Analysis:** What is the P/E ratio?"));
    }

    #[test]
    fn no_caveats_without_limitations() {
        let report = json!({
            "markdown": "# Clean Report\nAll good.",
            "limitations": [],
            "assumptions": ["everything is precise"],
        });
        let out = synthesize_report_markdown(&report, "Prompt", None, &[]);
        assert!(!out.markdown.contains("**Note:**"));
        // "precise" is not in the critical-word list, so no assumption either.
        assert!(!out.markdown.contains("**Assumption:**"));
    }

    #[test]
    fn critical_assumption_is_surfaced() {
        let report = json!({
            "markdown": "# R\nBody.",
            "assumptions": ["Growth rate is estimated from trailing sales."],
            "limitations": ["One limitation."],
        });
        let out = synthesize_report_markdown(&report, "Prompt", None, &[]);
        assert!(out.markdown.contains("**Assumption:** Growth rate is estimated"));
    }

    #[test]
    fn whitespace_is_normalized() {
        let report = json!({"markdown": "A\n\n\n\n\nB"});
        let out = synthesize_report_markdown(&report, "Prompt", None, &[]);
        assert!(out.markdown.contains("A\n\nB"));
    }
}
