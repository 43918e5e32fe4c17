use ledger_core::timestamp::{format_timestamp, now_utc};
use ledger_core::{
    keyword_tokens, new_id, Decision, DecisionFilter, DecisionStatus, NewDecision, NewOverride,
    Override, KEYWORD_RESULT_LIMIT,
};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use tracing::debug;

use crate::overrides::insert_override;
use crate::{
    enum_column, like_pattern, mentions_any, rows_affected_or_not_found, timestamp_column,
    LedgerStore, QueryContext, StorageError, NEWEST_FIRST,
};

pub(crate) const DECISION_COLUMNS: &str = "id, project_id, session_id, category, decision, rationale, alternatives_rejected, status, created_at";

/// Maps a row selected with [`DECISION_COLUMNS`] starting at `base`.
pub(crate) fn decision_at(row: &Row<'_>, base: usize) -> rusqlite::Result<Decision> {
    let alternatives_idx = base + 6;
    let alternatives: Option<String> = row.get(alternatives_idx)?;
    let alternatives_rejected = alternatives
        .map(|raw| serde_json::from_str::<Vec<String>>(&raw))
        .transpose()
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(alternatives_idx, Type::Text, Box::new(err))
        })?;

    Ok(Decision {
        id: row.get(base)?,
        project_id: row.get(base + 1)?,
        session_id: row.get(base + 2)?,
        category: row.get(base + 3)?,
        decision: row.get(base + 4)?,
        rationale: row.get(base + 5)?,
        alternatives_rejected,
        status: enum_column(row, base + 7)?,
        created_at: timestamp_column(row, base + 8)?,
    })
}

fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<Decision> {
    decision_at(row, 0)
}

fn alternatives_json(alternatives: Option<&Vec<String>>) -> Result<Option<String>, StorageError> {
    alternatives
        .map(serde_json::to_string)
        .transpose()
        .map_err(|err| StorageError::Serialization(format!("alternatives_rejected: {err}")))
}

impl LedgerStore {
    pub fn create_decision(&self, input: NewDecision) -> Result<Decision, StorageError> {
        let decision = Decision {
            id: input.id.unwrap_or_else(new_id),
            project_id: input.project_id.unwrap_or_else(|| self.project_id.clone()),
            session_id: input.session_id,
            category: input.category,
            decision: input.decision,
            rationale: input.rationale,
            alternatives_rejected: input.alternatives_rejected,
            status: input.status.unwrap_or_default(),
            created_at: now_utc(),
        };

        self.conn()?.execute(
            "
            INSERT INTO decisions (
                id, project_id, session_id, category, decision, rationale,
                alternatives_rejected, status, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                decision.id,
                decision.project_id,
                decision.session_id,
                decision.category,
                decision.decision,
                decision.rationale,
                alternatives_json(decision.alternatives_rejected.as_ref())?,
                decision.status.as_str(),
                format_timestamp(decision.created_at),
            ],
        )
        .during("create decision")?;
        Ok(decision)
    }

    pub fn get_decision(&self, id: &str) -> Result<Option<Decision>, StorageError> {
        let decision = self
            .conn()?
            .query_row(
                &format!("SELECT {DECISION_COLUMNS} FROM decisions WHERE id = ?1"),
                [id],
                decision_from_row,
            )
            .optional()
            .during("get decision")?;
        Ok(decision)
    }

    /// Writes the mutable fields only; project and session links stay as created.
    pub fn update_decision(&self, decision: &Decision) -> Result<(), StorageError> {
        let changes = self.conn()?.execute(
            "
            UPDATE decisions
            SET category = ?1, decision = ?2, rationale = ?3,
                alternatives_rejected = ?4, status = ?5
            WHERE id = ?6
            ",
            params![
                decision.category,
                decision.decision,
                decision.rationale,
                alternatives_json(decision.alternatives_rejected.as_ref())?,
                decision.status.as_str(),
                decision.id,
            ],
        )
        .during("update decision")?;
        rows_affected_or_not_found(changes, "decision", &decision.id)
    }

    pub fn list_decisions(&self, filter: &DecisionFilter) -> Result<Vec<Decision>, StorageError> {
        let mut clauses = vec!["project_id = ?".to_string()];
        let mut values = vec![Value::Text(
            self.scope_project(filter.project_id.as_deref()).to_string(),
        )];

        if let Some(session_id) = &filter.session_id {
            clauses.push("session_id = ?".to_string());
            values.push(Value::Text(session_id.clone()));
        }
        if let Some(category) = &filter.category {
            clauses.push("category = ?".to_string());
            values.push(Value::Text(category.clone()));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?".to_string());
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
            clauses.push(r"(decision LIKE ? ESCAPE '\' OR rationale LIKE ? ESCAPE '\')".to_string());
            let pattern = like_pattern(search);
            values.push(Value::Text(pattern.clone()));
            values.push(Value::Text(pattern));
        }

        let mut sql = format!(
            "SELECT {DECISION_COLUMNS} FROM decisions WHERE {} {NEWEST_FIRST}",
            clauses.join(" AND ")
        );
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ? OFFSET ?");
            values.push(Value::Integer(i64::from(limit)));
            values.push(Value::Integer(i64::from(filter.offset.unwrap_or(0))));
        }

        let conn = self.conn()?;
        let mut statement = conn.prepare(&sql).during("list decisions")?;
        let rows = statement
            .query_map(params_from_iter(values.iter()), decision_from_row)
            .during("list decisions")?;

        let mut decisions = Vec::new();
        for row in rows {
            decisions.push(row.during("list decisions")?);
        }
        Ok(decisions)
    }

    pub fn list_active_decisions(&self) -> Result<Vec<Decision>, StorageError> {
        self.list_decisions(&DecisionFilter {
            status: Some(DecisionStatus::Active),
            ..DecisionFilter::default()
        })
    }

    /// Active decisions whose decision text or category contains any keyword
    /// of `query`, ignoring case. Both sides are lowercased in Rust, so
    /// non-ASCII text folds too. At most [`KEYWORD_RESULT_LIMIT`], newest first.
    pub fn find_relevant_decisions(&self, query: &str) -> Result<Vec<Decision>, StorageError> {
        let tokens = keyword_tokens(query);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let relevant = self
            .list_active_decisions()?
            .into_iter()
            .filter(|decision| {
                mentions_any(&decision.decision, &tokens)
                    || decision
                        .category
                        .as_deref()
                        .is_some_and(|category| mentions_any(category, &tokens))
            })
            .take(KEYWORD_RESULT_LIMIT as usize)
            .collect();
        Ok(relevant)
    }

    /// Archives from any status.
    pub fn archive_decision(&self, id: &str) -> Result<(), StorageError> {
        let changes = self.conn()?.execute(
            "UPDATE decisions SET status = ?1 WHERE id = ?2",
            params![DecisionStatus::Archived.as_str(), id],
        )
        .during("archive decision")?;
        rows_affected_or_not_found(changes, "decision", id)
    }

    /// Marks the decision overridden and records why, as one unit. A missing
    /// decision or a failed insert leaves both tables untouched.
    pub fn override_decision(
        &self,
        decision_id: &str,
        session_id: &str,
        rationale: &str,
    ) -> Result<Override, StorageError> {
        let recorded = self.transaction(|tx| {
            let changes = tx.execute(
                "UPDATE decisions SET status = ?1 WHERE id = ?2",
                params![DecisionStatus::Overridden.as_str(), decision_id],
            )
            .during("override decision")?;
            rows_affected_or_not_found(changes, "decision", decision_id)?;

            insert_override(
                tx,
                NewOverride {
                    decision_id: decision_id.to_string(),
                    session_id: session_id.to_string(),
                    rationale: rationale.to_string(),
                    ..NewOverride::default()
                },
            )
        })?;

        debug!(
            decision_id,
            session_id,
            override_id = %recorded.id,
            "decision overridden"
        );
        Ok(recorded)
    }

    /// Deletes the decision together with its overrides.
    pub fn delete_decision(&self, id: &str) -> Result<(), StorageError> {
        let changes = self
            .conn()?
            .execute("DELETE FROM decisions WHERE id = ?1", [id])
            .during("delete decision")?;
        rows_affected_or_not_found(changes, "decision", id)
    }

    pub fn decision_categories(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.conn()?;
        let mut statement = conn
            .prepare(
                "
                SELECT DISTINCT category FROM decisions
                WHERE project_id = ?1 AND category IS NOT NULL AND category != ''
                ORDER BY category ASC
                ",
            )
            .during("list decision categories")?;
        let rows = statement
            .query_map([&self.project_id], |row| row.get::<_, String>(0))
            .during("list decision categories")?;

        let mut categories = Vec::new();
        for row in rows {
            categories.push(row.during("list decision categories")?);
        }
        Ok(categories)
    }
}
