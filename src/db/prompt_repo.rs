//! Per-owner report prompt override persistence.

use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::db::Database;

pub fn get_overrides(db: &Database, owner_key: &str) -> Result<HashMap<String, String>> {
    if owner_key.is_empty() {
        return Ok(HashMap::new());
    }
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT report_type, prompt_text FROM report_prompt_overrides WHERE owner_key = ?1",
        )?;
        let rows = stmt.query_map(params![owner_key], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        rows.collect()
    })
}

pub fn get_override(db: &Database, owner_key: &str, report_type: &str) -> Result<Option<String>> {
    if owner_key.is_empty() || report_type.is_empty() {
        return Ok(None);
    }
    db.with_conn(|conn| {
        conn.query_row(
            "SELECT prompt_text FROM report_prompt_overrides
             WHERE owner_key = ?1 AND report_type = ?2",
            params![owner_key, report_type],
            |row| row.get::<_, String>(0),
        )
        .optional()
    })
}

pub fn upsert_override(
    db: &Database,
    owner_key: &str,
    report_type: &str,
    prompt_text: &str,
) -> Result<String> {
    let now = Utc::now().to_rfc3339();
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO report_prompt_overrides (owner_key, report_type, prompt_text, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT (owner_key, report_type)
             DO UPDATE SET prompt_text = excluded.prompt_text, updated_at = excluded.updated_at",
            params![owner_key, report_type, prompt_text, now],
        )?;
        Ok(())
    })?;
    Ok(now)
}

pub fn delete_override(db: &Database, owner_key: &str, report_type: &str) -> Result<bool> {
    let changed = db.with_conn(|conn| {
        conn.execute(
            "DELETE FROM report_prompt_overrides WHERE owner_key = ?1 AND report_type = ?2",
            params![owner_key, report_type],
        )
    })?;
    Ok(changed == 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_then_read_then_delete() {
        let db = Database::open_in_memory().unwrap();
        upsert_override(&db, "owner-1", "morgan_dcf", "Prompt v1").unwrap();
        upsert_override(&db, "owner-1", "morgan_dcf", "Prompt v2").unwrap();
        assert_eq!(
            get_override(&db, "owner-1", "morgan_dcf").unwrap().as_deref(),
            Some("Prompt v2")
        );
        let all = get_overrides(&db, "owner-1").unwrap();
        assert_eq!(all.len(), 1);
        assert!(delete_override(&db, "owner-1", "morgan_dcf").unwrap());
        assert!(!delete_override(&db, "owner-1", "morgan_dcf").unwrap());
        assert!(get_override(&db, "owner-1", "morgan_dcf").unwrap().is_none());
    }

    #[test]
    fn overrides_are_scoped_per_owner() {
        let db = Database::open_in_memory().unwrap();
        upsert_override(&db, "owner-1", "jpm_earnings", "Mine").unwrap();
        assert!(get_override(&db, "owner-2", "jpm_earnings").unwrap().is_none());
        assert!(get_overrides(&db, "").unwrap().is_empty());
    }
}
