//! HITL and compliance gates for any live trade execution.
//!
//! Order submission stays disabled unless live trading is switched on, an
//! approval record is complete when HITL is required, and the shared-secret
//! header matches when one is configured. Every attempt is audited with a
//! redacted payload.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::SETTINGS;
use crate::db::{broker_repo, Database};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HitlApproval {
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub reviewer: String,
    #[serde(default)]
    pub ticket_id: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, PartialEq)]
pub enum TradeControlError {
    /// Live trading disabled entirely (403).
    Forbidden(String),
    /// HITL approval missing or incomplete (409).
    Conflict(String),
    /// Shared secret missing or wrong (401).
    Unauthorized(String),
}

impl TradeControlError {
    pub fn status(&self) -> u16 {
        match self {
            TradeControlError::Forbidden(_) => 403,
            TradeControlError::Conflict(_) => 409,
            TradeControlError::Unauthorized(_) => 401,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            TradeControlError::Forbidden(d)
            | TradeControlError::Conflict(d)
            | TradeControlError::Unauthorized(d) => d,
        }
    }
}

/// Keep only the order fields the audit trail is allowed to retain.
pub fn redact_order_payload(order: &Value) -> Value {
    const ALLOWED_KEYS: [&str; 7] = [
        "orderType",
        "session",
        "duration",
        "orderStrategyType",
        "price",
        "stopPrice",
        "orderLegCollection",
    ];
    let Some(obj) = order.as_object() else {
        return json!({});
    };
    let kept: serde_json::Map<String, Value> = obj
        .iter()
        .filter(|(k, _)| ALLOWED_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Value::Object(kept)
}

pub fn enforce_trade_submission_allowed(
    approval: Option<&HitlApproval>,
    hitl_shared_secret: Option<&str>,
) -> Result<(), TradeControlError> {
    enforce_with_settings(
        approval,
        hitl_shared_secret,
        SETTINGS.enable_live_trading,
        SETTINGS.require_hitl_for_trades,
        &SETTINGS.hitl_shared_secret,
    )
}

fn enforce_with_settings(
    approval: Option<&HitlApproval>,
    hitl_shared_secret: Option<&str>,
    enable_live_trading: bool,
    require_hitl: bool,
    configured_secret: &str,
) -> Result<(), TradeControlError> {
    if !enable_live_trading {
        return Err(TradeControlError::Forbidden(
            "Live order placement is disabled. Use preview endpoint only. \
             Set ENABLE_LIVE_TRADING=true only when you are ready for manual HITL execution."
                .to_string(),
        ));
    }
    if require_hitl {
        let Some(approval) = approval.filter(|a| a.approved) else {
            return Err(TradeControlError::Conflict(
                "HITL approval is required before any trade submission.".to_string(),
            ));
        };
        if approval.reviewer.is_empty() || approval.ticket_id.is_empty() || approval.reason.is_empty()
        {
            return Err(TradeControlError::Conflict(
                "HITL metadata is incomplete (reviewer, ticket_id, reason).".to_string(),
            ));
        }
    }
    if !configured_secret.is_empty() {
        match hitl_shared_secret {
            Some(provided) if provided == configured_secret => {}
            _ => {
                return Err(TradeControlError::Unauthorized(
                    "Missing or invalid HITL shared secret.".to_string(),
                ));
            }
        }
    }
    Ok(())
}

/// Audit persistence never breaks the calling workflow.
pub fn audit_trade_request(
    db: &Database,
    account_number: Option<&str>,
    action: &str,
    approval: Option<&HitlApproval>,
    payload: &Value,
) {
    let outcome = broker_repo::log_trade_hitl_event(
        db,
        account_number,
        action,
        approval.map(|a| a.approved).unwrap_or(false),
        approval.map(|a| a.reviewer.as_str()).filter(|r| !r.is_empty()),
        approval.map(|a| a.ticket_id.as_str()).filter(|t| !t.is_empty()),
        approval.map(|a| a.reason.as_str()).filter(|r| !r.is_empty()),
        &redact_order_payload(payload),
    );
    if outcome.is_err() {
        // Swallowed: read-only workflows must not crash on audit failure.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approval() -> HitlApproval {
        HitlApproval {
            approved: true,
            reviewer: "alice".into(),
            ticket_id: "OPS-12".into(),
            reason: "manual review complete".into(),
        }
    }

    #[test]
    fn live_trading_disabled_blocks_everything() {
        let err = enforce_with_settings(Some(&approval()), Some("s"), false, true, "s").unwrap_err();
        assert_eq!(err.status(), 403);
    }

    #[test]
    fn hitl_approval_must_be_complete() {
        let err = enforce_with_settings(None, None, true, true, "").unwrap_err();
        assert_eq!(err.status(), 409);

        let mut partial = approval();
        partial.ticket_id.clear();
        let err = enforce_with_settings(Some(&partial), None, true, true, "").unwrap_err();
        assert_eq!(err.status(), 409);
        assert!(err.detail().contains("incomplete"));

        let mut unapproved = approval();
        unapproved.approved = false;
        let err = enforce_with_settings(Some(&unapproved), None, true, true, "").unwrap_err();
        assert_eq!(err.status(), 409);
    }

    #[test]
    fn shared_secret_must_match_when_configured() {
        let err =
            enforce_with_settings(Some(&approval()), Some("wrong"), true, true, "right").unwrap_err();
        assert_eq!(err.status(), 401);
        let err = enforce_with_settings(Some(&approval()), None, true, true, "right").unwrap_err();
        assert_eq!(err.status(), 401);
        assert!(enforce_with_settings(Some(&approval()), Some("right"), true, true, "right").is_ok());
    }

    #[test]
    fn secret_not_required_when_unset() {
        assert!(enforce_with_settings(Some(&approval()), None, true, true, "").is_ok());
    }

    #[test]
    fn hitl_optional_when_not_required() {
        assert!(enforce_with_settings(None, None, true, false, "").is_ok());
    }

    #[test]
    fn redaction_keeps_only_allow_listed_fields() {
        let order = json!({
            "orderType": "LIMIT",
            "price": 212.5,
            "session": "NORMAL",
            "accountNumber": "secret-123",
            "clientNotes": "do not log",
            "orderLegCollection": [{"instruction": "BUY"}],
        });
        let redacted = redact_order_payload(&order);
        assert_eq!(redacted["orderType"], "LIMIT");
        assert_eq!(redacted["price"], 212.5);
        assert!(redacted.get("accountNumber").is_none());
        assert!(redacted.get("clientNotes").is_none());
        assert_eq!(redact_order_payload(&json!("not an object")), json!({}));
    }

    #[test]
    fn audit_never_panics() {
        let db = Database::open_in_memory().unwrap();
        audit_trade_request(&db, Some("123"), "preview", Some(&approval()), &json!({"orderType": "LIMIT"}));
        audit_trade_request(&db, None, "submit_attempt", None, &json!(null));
        let count: i64 = db
            .with_conn(|c| c.query_row("SELECT count(*) FROM trade_hitl_audit", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 2);
    }
}
