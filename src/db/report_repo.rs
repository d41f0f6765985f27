//! Report run persistence for reproducibility.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::db::Database;

pub fn save_report_run(
    db: &Database,
    report_type: &str,
    payload: &serde_json::Value,
    report: &serde_json::Value,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO report_runs (id, report_type, payload, report) VALUES (?1, ?2, ?3, ?4)",
            params![id, report_type, payload.to_string(), report.to_string()],
        )?;
        Ok(())
    })?;
    Ok(id)
}

pub fn get_report_run(db: &Database, run_id: &str) -> Result<Option<serde_json::Value>> {
    db.with_conn(|conn| {
        conn.query_row(
            "SELECT id, report_type, payload, report, generated_at FROM report_runs WHERE id = ?1",
            params![run_id],
            |row| {
                let payload: String = row.get(2)?;
                let report: String = row.get(3)?;
                Ok(serde_json::json!({
                    "id": row.get::<_, String>(0)?,
                    "report_type": row.get::<_, String>(1)?,
                    "payload": serde_json::from_str::<serde_json::Value>(&payload)
                        .unwrap_or(serde_json::Value::Null),
                    "report": serde_json::from_str::<serde_json::Value>(&report)
                        .unwrap_or(serde_json::Value::Null),
                    "generated_at": row.get::<_, String>(4)?,
                }))
            },
        )
        .optional()
    })
}

pub fn insert_trace_run(
    db: &Database,
    kind: &str,
    name: &str,
    params_json: &serde_json::Value,
    metrics_json: &serde_json::Value,
    artifacts_json: &serde_json::Value,
) -> Result<String> {
    let id = Uuid::new_v4().simple().to_string();
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO trace_runs (id, kind, name, params, metrics, artifacts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                kind,
                name,
                params_json.to_string(),
                metrics_json.to_string(),
                artifacts_json.to_string(),
            ],
        )?;
        Ok(())
    })?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_run_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let id = save_report_run(
            &db,
            "morgan_dcf",
            &serde_json::json!({"ticker": "AAPL"}),
            &serde_json::json!({"markdown": "# Memo"}),
        )
        .unwrap();
        let run = get_report_run(&db, &id).unwrap().unwrap();
        assert_eq!(run["report_type"], "morgan_dcf");
        assert_eq!(run["payload"]["ticker"], "AAPL");
        assert!(get_report_run(&db, "missing").unwrap().is_none());
    }

    #[test]
    fn trace_run_insert() {
        let db = Database::open_in_memory().unwrap();
        let id = insert_trace_run(
            &db,
            "report",
            "report:citadel_technical",
            &serde_json::json!({"report_type": "citadel_technical"}),
            &serde_json::json!({"quality_score": 0.9}),
            &serde_json::json!({}),
        )
        .unwrap();
        assert_eq!(id.len(), 32);
    }
}
