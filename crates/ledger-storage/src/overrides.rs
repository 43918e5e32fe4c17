use ledger_core::timestamp::{format_timestamp, now_utc};
use ledger_core::{new_id, NewOverride, Override, OverridePattern, TEMPORARY_MARKERS};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::decisions::{decision_at, DECISION_COLUMNS};
use crate::{
    mentions_any, qualified_columns, timestamp_column, LedgerStore, QueryContext, StorageError,
};

const OVERRIDE_COLUMNS: &str = "id, decision_id, session_id, rationale, created_at";

fn override_from_row(row: &Row<'_>) -> rusqlite::Result<Override> {
    Ok(Override {
        id: row.get(0)?,
        decision_id: row.get(1)?,
        session_id: row.get(2)?,
        rationale: row.get(3)?,
        created_at: timestamp_column(row, 4)?,
    })
}

/// Shared by plain creation and the override transition, which runs it
/// inside its own transaction.
pub(crate) fn insert_override(
    conn: &Connection,
    input: NewOverride,
) -> Result<Override, StorageError> {
    let recorded = Override {
        id: input.id.unwrap_or_else(new_id),
        decision_id: input.decision_id,
        session_id: input.session_id,
        rationale: input.rationale,
        created_at: now_utc(),
    };
    conn.execute(
        "
        INSERT INTO overrides (id, decision_id, session_id, rationale, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ",
        params![
            recorded.id,
            recorded.decision_id,
            recorded.session_id,
            recorded.rationale,
            format_timestamp(recorded.created_at),
        ],
    )
    .during("create override")?;
    Ok(recorded)
}

impl LedgerStore {
    /// Records an override row without touching the decision's status.
    /// Use [`LedgerStore::override_decision`] for the state transition.
    pub fn create_override(&self, input: NewOverride) -> Result<Override, StorageError> {
        insert_override(&*self.conn()?, input)
    }

    pub fn get_override(&self, id: &str) -> Result<Option<Override>, StorageError> {
        let recorded = self
            .conn()?
            .query_row(
                &format!("SELECT {OVERRIDE_COLUMNS} FROM overrides WHERE id = ?1"),
                [id],
                override_from_row,
            )
            .optional()
            .during("get override")?;
        Ok(recorded)
    }

    pub fn list_overrides_for_decision(
        &self,
        decision_id: &str,
    ) -> Result<Vec<Override>, StorageError> {
        let conn = self.conn()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {OVERRIDE_COLUMNS} FROM overrides WHERE decision_id = ?1 {}",
            crate::NEWEST_FIRST
        ))
        .during("list overrides")?;
        let rows = statement
            .query_map([decision_id], override_from_row)
            .during("list overrides")?;

        let mut overrides = Vec::new();
        for row in rows {
            overrides.push(row.during("list overrides")?);
        }
        Ok(overrides)
    }

    pub fn count_overrides_for_decision(&self, decision_id: &str) -> Result<u32, StorageError> {
        let count = self
            .conn()?
            .query_row(
                "SELECT COUNT(*) FROM overrides WHERE decision_id = ?1",
                [decision_id],
                |row| row.get(0),
            )
            .during("count overrides")?;
        Ok(count)
    }

    /// Decisions in the bound project overridden at least `min_overrides`
    /// times, most overridden first. Decisions never overridden are excluded
    /// whatever the threshold.
    pub fn override_patterns(
        &self,
        min_overrides: u32,
    ) -> Result<Vec<OverridePattern>, StorageError> {
        let conn = self.conn()?;
        let mut statement = conn.prepare(&format!(
            "
            SELECT {}, COUNT(o.id) AS override_count
            FROM decisions d
            INNER JOIN overrides o ON o.decision_id = d.id
            WHERE d.project_id = ?1
            GROUP BY d.id
            HAVING COUNT(o.id) >= ?2
            ORDER BY override_count DESC, d.created_at DESC, d.rowid DESC
            ",
            qualified_columns(DECISION_COLUMNS, "d")
        ))
        .during("find override patterns")?;
        let rows = statement
            .query_map(params![self.project_id, min_overrides], |row| {
                Ok(OverridePattern {
                    decision: decision_at(row, 0)?,
                    override_count: row.get(9)?,
                })
            })
            .during("find override patterns")?;

        let mut patterns = Vec::new();
        for row in rows {
            patterns.push(row.during("find override patterns")?);
        }
        Ok(patterns)
    }

    /// Overrides in the bound project whose rationale reads like a stopgap.
    /// Markers match ignoring case, folded in Rust so non-ASCII rationales
    /// compare correctly.
    pub fn find_temporary_patterns(&self) -> Result<Vec<Override>, StorageError> {
        let conn = self.conn()?;
        let mut statement = conn
            .prepare(&format!(
                "
                SELECT {}
                FROM overrides o
                INNER JOIN decisions d ON d.id = o.decision_id
                WHERE d.project_id = ?1
                ORDER BY o.created_at DESC, o.rowid DESC
                ",
                qualified_columns(OVERRIDE_COLUMNS, "o")
            ))
            .during("find temporary overrides")?;
        let rows = statement
            .query_map([&self.project_id], override_from_row)
            .during("find temporary overrides")?;

        let mut overrides = Vec::new();
        for row in rows {
            let recorded = row.during("find temporary overrides")?;
            if mentions_any(&recorded.rationale, &TEMPORARY_MARKERS) {
                overrides.push(recorded);
            }
        }
        Ok(overrides)
    }
}
