//! Effective-prompt resolution and per-owner template overrides.
//!
//! Precedence: inline override > saved per-owner override > system default.

use anyhow::{bail, Result};
use serde_json::{json, Value};

use crate::db::{prompt_repo, Database};
use crate::reports::prompts::{get_template, PROMPT_TEMPLATES};

pub const MAX_PROMPT_TEMPLATE_LENGTH: usize = 24_000;

fn normalize_report_type(report_type: &str) -> Result<String> {
    let rt = report_type.trim().to_lowercase();
    if get_template(&rt).is_none() {
        bail!("Unknown report type '{report_type}'.");
    }
    Ok(rt)
}

fn validate_owner_key(owner_key: &str) -> Result<String> {
    let key = owner_key.trim();
    if key.is_empty() {
        bail!("owner_key is required.");
    }
    if key.len() > 256 {
        bail!("owner_key is too long.");
    }
    Ok(key.to_string())
}

fn validate_prompt_text(prompt_text: &str) -> Result<String> {
    let text = prompt_text.trim();
    if text.is_empty() {
        bail!("prompt_text is required.");
    }
    if text.len() > MAX_PROMPT_TEMPLATE_LENGTH {
        bail!("prompt_text exceeds max length {MAX_PROMPT_TEMPLATE_LENGTH}.");
    }
    Ok(text.to_string())
}

pub fn list_templates(db: &Database, owner_key: &str) -> Result<Vec<Value>> {
    let key = validate_owner_key(owner_key)?;
    let overrides = prompt_repo::get_overrides(db, &key)?;
    Ok(PROMPT_TEMPLATES
        .iter()
        .map(|template| {
            let override_text = overrides.get(template.id);
            json!({
                "id": template.id,
                "title": template.title,
                "default_prompt": template.prompt,
                "effective_prompt": override_text.cloned().unwrap_or_else(|| template.prompt.to_string()),
                "is_overridden": override_text.is_some(),
            })
        })
        .collect())
}

pub fn save_template_override(
    db: &Database,
    owner_key: &str,
    report_type: &str,
    prompt_text: &str,
) -> Result<Value> {
    let key = validate_owner_key(owner_key)?;
    let rt = normalize_report_type(report_type)?;
    let text = validate_prompt_text(prompt_text)?;
    let updated_at = prompt_repo::upsert_override(db, &key, &rt, &text)?;
    let template = get_template(&rt).expect("validated");
    Ok(json!({
        "owner_key": key,
        "id": rt,
        "title": template.title,
        "effective_prompt": text,
        "is_overridden": true,
        "updated_at": updated_at,
    }))
}

pub fn reset_template_override(db: &Database, owner_key: &str, report_type: &str) -> Result<Value> {
    let key = validate_owner_key(owner_key)?;
    let rt = normalize_report_type(report_type)?;
    let removed = prompt_repo::delete_override(db, &key, &rt)?;
    let template = get_template(&rt).expect("validated");
    Ok(json!({
        "owner_key": key,
        "id": rt,
        "title": template.title,
        "effective_prompt": template.prompt,
        "is_overridden": false,
        "removed": removed,
    }))
}

pub fn effective_prompt(
    db: &Database,
    report_type: &str,
    owner_key: Option<&str>,
    inline_override: Option<&str>,
) -> Result<String> {
    let rt = normalize_report_type(report_type)?;
    if let Some(inline) = inline_override.filter(|p| !p.trim().is_empty()) {
        return validate_prompt_text(inline);
    }
    if let Some(owner) = owner_key.filter(|o| !o.trim().is_empty()) {
        if let Some(saved) = prompt_repo::get_override(db, owner.trim(), &rt)? {
            if !saved.trim().is_empty() {
                return Ok(saved);
            }
        }
    }
    Ok(get_template(&rt).expect("validated").prompt.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_inline_over_saved_over_default() {
        let db = Database::open_in_memory().unwrap();
        let default = effective_prompt(&db, "morgan_dcf", Some("owner-1"), None).unwrap();
        assert!(default.contains("Morgan Stanley"));

        save_template_override(&db, "owner-1", "morgan_dcf", "Saved prompt").unwrap();
        let saved = effective_prompt(&db, "morgan_dcf", Some("owner-1"), None).unwrap();
        assert_eq!(saved, "Saved prompt");

        let inline = effective_prompt(&db, "morgan_dcf", Some("owner-1"), Some("Inline prompt")).unwrap();
        assert_eq!(inline, "Inline prompt");

        // Another owner still sees the default.
        let other = effective_prompt(&db, "morgan_dcf", Some("owner-2"), None).unwrap();
        assert!(other.contains("Morgan Stanley"));
    }

    #[test]
    fn validation_rules() {
        let db = Database::open_in_memory().unwrap();
        assert!(save_template_override(&db, "", "morgan_dcf", "p").is_err());
        assert!(save_template_override(&db, "o", "fake_type", "p").is_err());
        assert!(save_template_override(&db, "o", "morgan_dcf", "  ").is_err());
        let long = "x".repeat(MAX_PROMPT_TEMPLATE_LENGTH + 1);
        assert!(save_template_override(&db, "o", "morgan_dcf", &long).is_err());
    }

    #[test]
    fn listing_marks_overrides() {
        let db = Database::open_in_memory().unwrap();
        save_template_override(&db, "owner-1", "jpm_earnings", "Custom").unwrap();
        let templates = list_templates(&db, "owner-1").unwrap();
        assert_eq!(templates.len(), 10);
        let jpm = templates.iter().find(|t| t["id"] == "jpm_earnings").unwrap();
        assert_eq!(jpm["is_overridden"], true);
        assert_eq!(jpm["effective_prompt"], "Custom");
        let dcf = templates.iter().find(|t| t["id"] == "morgan_dcf").unwrap();
        assert_eq!(dcf["is_overridden"], false);
    }

    #[test]
    fn reset_restores_default() {
        let db = Database::open_in_memory().unwrap();
        save_template_override(&db, "owner-1", "citadel_technical", "Custom").unwrap();
        let reset = reset_template_override(&db, "owner-1", "citadel_technical").unwrap();
        assert_eq!(reset["removed"], true);
        assert_eq!(reset["is_overridden"], false);
        let again = reset_template_override(&db, "owner-1", "citadel_technical").unwrap();
        assert_eq!(again["removed"], false);
    }
}
