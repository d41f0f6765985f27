//! Report thread persistence for follow-up interactions.
//!
//! A thread pins its `report_type` and `base_payload` at creation; follow-ups
//! only ever append messages and replace `latest_report`.

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::Database;
use crate::models::sanitize_uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportThread {
    pub id: String,
    pub owner_key: String,
    pub report_type: String,
    pub base_payload: serde_json::Value,
    pub effective_prompt: String,
    pub latest_report: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub id: i64,
    pub thread_id: String,
    pub role: String,
    pub content: String,
    pub metadata: serde_json::Value,
    pub created_at: String,
}

fn parse_json(text: String) -> serde_json::Value {
    serde_json::from_str(&text).unwrap_or(serde_json::Value::Null)
}

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<ReportThread> {
    Ok(ReportThread {
        id: row.get(0)?,
        owner_key: row.get(1)?,
        report_type: row.get(2)?,
        base_payload: parse_json(row.get(3)?),
        effective_prompt: row.get(4)?,
        latest_report: parse_json(row.get(5)?),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

const THREAD_COLUMNS: &str =
    "id, owner_key, report_type, base_payload, effective_prompt, latest_report, created_at, updated_at";

pub fn create_thread(
    db: &Database,
    owner_key: &str,
    report_type: &str,
    base_payload: &serde_json::Value,
    effective_prompt: &str,
    latest_report: &serde_json::Value,
) -> Result<ReportThread> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO report_threads
                (id, owner_key, report_type, base_payload, effective_prompt, latest_report, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                id,
                owner_key,
                report_type,
                base_payload.to_string(),
                effective_prompt,
                latest_report.to_string(),
                now,
            ],
        )?;
        conn.query_row(
            &format!("SELECT {THREAD_COLUMNS} FROM report_threads WHERE id = ?1"),
            params![id],
            thread_from_row,
        )
    })
}

pub fn get_thread(db: &Database, thread_id: &str, owner_key: Option<&str>) -> Result<Option<ReportThread>> {
    let Some(clean_id) = sanitize_uuid(Some(thread_id)) else {
        return Ok(None);
    };
    db.with_conn(|conn| {
        if let Some(owner) = owner_key {
            conn.query_row(
                &format!("SELECT {THREAD_COLUMNS} FROM report_threads WHERE id = ?1 AND owner_key = ?2"),
                params![clean_id, owner],
                thread_from_row,
            )
            .optional()
        } else {
            conn.query_row(
                &format!("SELECT {THREAD_COLUMNS} FROM report_threads WHERE id = ?1"),
                params![clean_id],
                thread_from_row,
            )
            .optional()
        }
    })
}

pub fn update_thread_latest_report(
    db: &Database,
    thread_id: &str,
    latest_report: &serde_json::Value,
) -> Result<Option<ReportThread>> {
    let Some(clean_id) = sanitize_uuid(Some(thread_id)) else {
        return Ok(None);
    };
    let now = Utc::now().to_rfc3339();
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE report_threads SET latest_report = ?2, updated_at = ?3 WHERE id = ?1",
            params![clean_id, latest_report.to_string(), now],
        )?;
        conn.query_row(
            &format!("SELECT {THREAD_COLUMNS} FROM report_threads WHERE id = ?1"),
            params![clean_id],
            thread_from_row,
        )
        .optional()
    })
}

pub fn append_thread_message(
    db: &Database,
    thread_id: &str,
    role: &str,
    content: &str,
    metadata: &serde_json::Value,
) -> Result<ThreadMessage> {
    let clean_id = sanitize_uuid(Some(thread_id))
        .ok_or_else(|| anyhow::anyhow!("Invalid thread_id format: {thread_id}"))?;
    let now = Utc::now().to_rfc3339();
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO report_thread_messages (thread_id, role, content, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![clean_id, role, content, metadata.to_string(), now],
        )?;
        let row_id = conn.last_insert_rowid();
        conn.execute(
            "UPDATE report_threads SET updated_at = ?2 WHERE id = ?1",
            params![clean_id, now],
        )?;
        conn.query_row(
            "SELECT id, thread_id, role, content, metadata, created_at
             FROM report_thread_messages WHERE id = ?1",
            params![row_id],
            |row| {
                Ok(ThreadMessage {
                    id: row.get(0)?,
                    thread_id: row.get(1)?,
                    role: row.get(2)?,
                    content: row.get(3)?,
                    metadata: parse_json(row.get(4)?),
                    created_at: row.get(5)?,
                })
            },
        )
    })
}

pub fn list_thread_messages(db: &Database, thread_id: &str, limit: usize) -> Result<Vec<ThreadMessage>> {
    let Some(clean_id) = sanitize_uuid(Some(thread_id)) else {
        return Ok(Vec::new());
    };
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, thread_id, role, content, metadata, created_at
             FROM report_thread_messages
             WHERE thread_id = ?1
             ORDER BY created_at ASC, id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![clean_id, limit as i64], |row| {
            Ok(ThreadMessage {
                id: row.get(0)?,
                thread_id: row.get(1)?,
                role: row.get(2)?,
                content: row.get(3)?,
                metadata: parse_json(row.get(4)?),
                created_at: row.get(5)?,
            })
        })?;
        rows.collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_thread(db: &Database) -> ReportThread {
        create_thread(
            db,
            "owner-1",
            "goldman_screener",
            &serde_json::json!({"limit": 10}),
            "You are a research analyst.",
            &serde_json::json!({"markdown": "# Screen"}),
        )
        .unwrap()
    }

    #[test]
    fn create_and_get_scoped_by_owner() {
        let db = Database::open_in_memory().unwrap();
        let thread = seed_thread(&db);
        assert!(get_thread(&db, &thread.id, Some("owner-1")).unwrap().is_some());
        assert!(get_thread(&db, &thread.id, Some("someone-else")).unwrap().is_none());
        assert!(get_thread(&db, "garbage-id", Some("owner-1")).unwrap().is_none());
    }

    #[test]
    fn report_type_is_immutable_for_thread_lifetime() {
        let db = Database::open_in_memory().unwrap();
        let thread = seed_thread(&db);
        let updated = update_thread_latest_report(&db, &thread.id, &serde_json::json!({"markdown": "v2"}))
            .unwrap()
            .unwrap();
        assert_eq!(updated.report_type, "goldman_screener");
        assert_eq!(updated.latest_report["markdown"], "v2");
        assert_eq!(updated.base_payload, thread.base_payload);
    }

    #[test]
    fn messages_append_in_order() {
        let db = Database::open_in_memory().unwrap();
        let thread = seed_thread(&db);
        append_thread_message(&db, &thread.id, "user", "What changed?", &serde_json::json!({}))
            .unwrap();
        append_thread_message(&db, &thread.id, "assistant", "Updated picks.", &serde_json::json!({}))
            .unwrap();
        let messages = list_thread_messages(&db, &thread.id, 40).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
    }

    #[test]
    fn prefixed_thread_ids_are_sanitized() {
        let db = Database::open_in_memory().unwrap();
        let thread = seed_thread(&db);
        let prefixed = format!("conv-{}", thread.id);
        assert!(get_thread(&db, &prefixed, Some("owner-1")).unwrap().is_some());
    }
}
