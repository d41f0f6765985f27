//! Broker API observability and HITL audit persistence.

use anyhow::Result;
use rusqlite::params;

use crate::db::Database;

#[allow(clippy::too_many_arguments)]
pub fn log_broker_event(
    db: &Database,
    provider: &str,
    app_type: &str,
    endpoint: &str,
    method: &str,
    status_code: Option<u16>,
    attempt: u32,
    latency_ms: Option<u64>,
    success: bool,
    error: Option<&str>,
    request_id: Option<&str>,
    metadata: &serde_json::Value,
) -> Result<()> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO broker_api_events (
                provider, app_type, endpoint, method, status_code, attempt,
                latency_ms, success, error, request_id, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                provider,
                app_type,
                endpoint,
                method,
                status_code.map(|s| s as i64),
                attempt as i64,
                latency_ms.map(|l| l as i64),
                success as i64,
                error,
                request_id,
                metadata.to_string(),
            ],
        )?;
        Ok(())
    })
}

pub fn log_trade_hitl_event(
    db: &Database,
    account_number: Option<&str>,
    action: &str,
    approved: bool,
    reviewer: Option<&str>,
    ticket_id: Option<&str>,
    reason: Option<&str>,
    payload: &serde_json::Value,
) -> Result<()> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO trade_hitl_audit (
                provider, account_number, action, approved, reviewer, ticket_id, reason, payload
            ) VALUES ('schwab', ?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                account_number,
                action,
                approved as i64,
                reviewer,
                ticket_id,
                reason,
                payload.to_string(),
            ],
        )?;
        Ok(())
    })
}

pub fn recent_broker_event_count(db: &Database) -> Result<i64> {
    db.with_conn(|conn| conn.query_row("SELECT count(*) FROM broker_api_events", [], |r| r.get(0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_event_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        log_broker_event(
            &db,
            "schwab",
            "market",
            "/quotes",
            "GET",
            Some(200),
            1,
            Some(87),
            true,
            None,
            Some("req-1"),
            &serde_json::json!({}),
        )
        .unwrap();
        assert_eq!(recent_broker_event_count(&db).unwrap(), 1);
    }

    #[test]
    fn hitl_audit_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        log_trade_hitl_event(
            &db,
            Some("123"),
            "submit_attempt",
            true,
            Some("alice"),
            Some("OPS-9"),
            Some("manual review"),
            &serde_json::json!({"orderType": "LIMIT"}),
        )
        .unwrap();
        let count: i64 = db
            .with_conn(|c| c.query_row("SELECT count(*) FROM trade_hitl_audit", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 1);
    }
}
