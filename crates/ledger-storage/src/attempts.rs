use std::collections::BTreeMap;

use ledger_core::timestamp::{format_timestamp, now_utc};
use ledger_core::validate::optional_text;
use ledger_core::{
    keyword_tokens, new_id, AiAttempt, AttemptFilter, AttemptOutcome, NewAttempt,
    RecurringFailure, KEYWORD_RESULT_LIMIT,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use tracing::debug;

use crate::{
    enum_column, like_pattern, mentions_any, rows_affected_or_not_found, timestamp_column,
    LedgerStore, QueryContext, StorageError, NEWEST_FIRST,
};

const ATTEMPT_COLUMNS: &str =
    "id, project_id, session_id, problem, suggestion, outcome, failure_reason, created_at";

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<AiAttempt> {
    Ok(AiAttempt {
        id: row.get(0)?,
        project_id: row.get(1)?,
        session_id: row.get(2)?,
        problem: row.get(3)?,
        suggestion: row.get(4)?,
        outcome: enum_column(row, 5)?,
        failure_reason: row.get(6)?,
        created_at: timestamp_column(row, 7)?,
    })
}

impl LedgerStore {
    fn query_attempts(&self, sql: &str, values: &[Value]) -> Result<Vec<AiAttempt>, StorageError> {
        let conn = self.conn()?;
        let mut statement = conn.prepare(sql).during("list attempts")?;
        let rows = statement
            .query_map(params_from_iter(values.iter()), attempt_from_row)
            .during("list attempts")?;

        let mut attempts = Vec::new();
        for row in rows {
            attempts.push(row.during("list attempts")?);
        }
        Ok(attempts)
    }

    pub fn create_attempt(&self, input: NewAttempt) -> Result<AiAttempt, StorageError> {
        let attempt = AiAttempt {
            id: input.id.unwrap_or_else(new_id),
            project_id: input.project_id.unwrap_or_else(|| self.project_id.clone()),
            session_id: input.session_id,
            problem: input.problem,
            suggestion: input.suggestion,
            outcome: input.outcome.unwrap_or_default(),
            failure_reason: input.failure_reason,
            created_at: now_utc(),
        };

        self.conn()?.execute(
            "
            INSERT INTO ai_attempts (
                id, project_id, session_id, problem, suggestion, outcome, failure_reason, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
            params![
                attempt.id,
                attempt.project_id,
                attempt.session_id,
                attempt.problem,
                attempt.suggestion,
                attempt.outcome.as_str(),
                attempt.failure_reason,
                format_timestamp(attempt.created_at),
            ],
        )
        .during("create attempt")?;
        Ok(attempt)
    }

    pub fn get_attempt(&self, id: &str) -> Result<Option<AiAttempt>, StorageError> {
        let attempt = self
            .conn()?
            .query_row(
                &format!("SELECT {ATTEMPT_COLUMNS} FROM ai_attempts WHERE id = ?1"),
                [id],
                attempt_from_row,
            )
            .optional()
            .during("get attempt")?;
        Ok(attempt)
    }

    /// Outcome and failure reason are written together; an absent or blank
    /// reason clears the stored one.
    pub fn update_attempt_outcome(
        &self,
        id: &str,
        outcome: AttemptOutcome,
        failure_reason: Option<&str>,
    ) -> Result<(), StorageError> {
        let changes = self.conn()?.execute(
            "UPDATE ai_attempts SET outcome = ?1, failure_reason = ?2 WHERE id = ?3",
            params![outcome.as_str(), optional_text(failure_reason), id],
        )
        .during("update attempt outcome")?;
        rows_affected_or_not_found(changes, "ai attempt", id)?;
        debug!(attempt_id = id, outcome = %outcome, "attempt outcome recorded");
        Ok(())
    }

    pub fn mark_attempt_worked(&self, id: &str) -> Result<(), StorageError> {
        self.update_attempt_outcome(id, AttemptOutcome::Worked, None)
    }

    pub fn mark_attempt_failed(&self, id: &str, reason: Option<&str>) -> Result<(), StorageError> {
        self.update_attempt_outcome(id, AttemptOutcome::Failed, reason)
    }

    pub fn mark_attempt_partial(&self, id: &str, reason: Option<&str>) -> Result<(), StorageError> {
        self.update_attempt_outcome(id, AttemptOutcome::Partial, reason)
    }

    pub fn list_attempts(&self, filter: &AttemptFilter) -> Result<Vec<AiAttempt>, StorageError> {
        let mut clauses = vec!["project_id = ?"];
        let mut values = vec![Value::Text(
            self.scope_project(filter.project_id.as_deref()).to_string(),
        )];

        if let Some(session_id) = &filter.session_id {
            clauses.push("session_id = ?");
            values.push(Value::Text(session_id.clone()));
        }
        if let Some(outcome) = filter.outcome {
            clauses.push("outcome = ?");
            values.push(Value::Text(outcome.as_str().to_string()));
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
            clauses.push(r"(problem LIKE ? ESCAPE '\' OR suggestion LIKE ? ESCAPE '\')");
            let pattern = like_pattern(search);
            values.push(Value::Text(pattern.clone()));
            values.push(Value::Text(pattern));
        }

        let mut sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM ai_attempts WHERE {} {NEWEST_FIRST}",
            clauses.join(" AND ")
        );
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ? OFFSET ?");
            values.push(Value::Integer(i64::from(limit)));
            values.push(Value::Integer(i64::from(filter.offset.unwrap_or(0))));
        }
        self.query_attempts(&sql, &values)
    }

    pub fn list_failed_attempts(&self) -> Result<Vec<AiAttempt>, StorageError> {
        self.list_attempts(&AttemptFilter {
            outcome: Some(AttemptOutcome::Failed),
            ..AttemptFilter::default()
        })
    }

    pub fn recent_attempts(&self, limit: u32) -> Result<Vec<AiAttempt>, StorageError> {
        self.list_attempts(&AttemptFilter {
            limit: Some(limit),
            ..AttemptFilter::default()
        })
    }

    /// Failed attempts whose problem mentions any keyword of `problem`,
    /// ignoring case. Folding happens in Rust, so non-ASCII problems match
    /// their other-case spellings. At most [`KEYWORD_RESULT_LIMIT`], newest first.
    pub fn find_similar_failed_attempts(
        &self,
        problem: &str,
    ) -> Result<Vec<AiAttempt>, StorageError> {
        let tokens = keyword_tokens(problem);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let similar = self
            .list_failed_attempts()?
            .into_iter()
            .filter(|attempt| mentions_any(&attempt.problem, &tokens))
            .take(KEYWORD_RESULT_LIMIT as usize)
            .collect();
        Ok(similar)
    }

    /// Occurrences of each outcome present in the bound project.
    pub fn attempt_stats(&self) -> Result<BTreeMap<AttemptOutcome, u32>, StorageError> {
        let conn = self.conn()?;
        let mut statement = conn
            .prepare(
                "SELECT outcome, COUNT(*) FROM ai_attempts WHERE project_id = ?1 GROUP BY outcome",
            )
            .during("count attempt outcomes")?;
        let rows = statement
            .query_map([&self.project_id], |row| {
                Ok((enum_column::<AttemptOutcome>(row, 0)?, row.get::<_, u32>(1)?))
            })
            .during("count attempt outcomes")?;

        let mut stats = BTreeMap::new();
        for row in rows {
            let (outcome, count) = row.during("count attempt outcomes")?;
            stats.insert(outcome, count);
        }
        Ok(stats)
    }

    /// Failed suggestions grouped by exact text, kept when they failed at
    /// least `min_failures` times. Most frequent first.
    pub fn recurring_failures(
        &self,
        min_failures: u32,
    ) -> Result<Vec<RecurringFailure>, StorageError> {
        let conn = self.conn()?;
        let mut statement = conn
            .prepare(
                "
                SELECT suggestion, COUNT(*) AS failure_count, MAX(created_at) AS last_failure
                FROM ai_attempts
                WHERE project_id = ?1 AND outcome = ?2
                GROUP BY suggestion
                HAVING COUNT(*) >= ?3
                ORDER BY failure_count DESC, last_failure DESC
                ",
            )
            .during("find recurring failures")?;
        let rows = statement
            .query_map(
                params![
                    self.project_id,
                    AttemptOutcome::Failed.as_str(),
                    min_failures
                ],
                |row| {
                    Ok(RecurringFailure {
                        suggestion: row.get(0)?,
                        failure_count: row.get(1)?,
                        last_failure: timestamp_column(row, 2)?,
                    })
                },
            )
            .during("find recurring failures")?;

        let mut failures = Vec::new();
        for row in rows {
            failures.push(row.during("find recurring failures")?);
        }
        Ok(failures)
    }

    pub fn delete_attempt(&self, id: &str) -> Result<(), StorageError> {
        let changes = self
            .conn()?
            .execute("DELETE FROM ai_attempts WHERE id = ?1", [id])
            .during("delete attempt")?;
        rows_affected_or_not_found(changes, "ai attempt", id)
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::open_store;
    use crate::{LedgerStore, StorageError};
    use ledger_core::{AiAttempt, AttemptFilter, AttemptOutcome, NewAttempt};

    fn attempt(store: &LedgerStore, session_id: &str, problem: &str, suggestion: &str) -> AiAttempt {
        store
            .create_attempt(NewAttempt {
                session_id: session_id.to_string(),
                problem: problem.to_string(),
                suggestion: suggestion.to_string(),
                ..NewAttempt::default()
            })
            .expect("create attempt")
    }

    #[test]
    fn create_defaults_to_pending() {
        let test = open_store("/work/attempts");
        let store = &test.store;
        let session = store.get_or_create_session("main").expect("session");
        let created = attempt(store, &session.id, "slow query", "add index");

        assert_eq!(created.outcome, AttemptOutcome::Pending);
        assert_eq!(created.failure_reason, None);
        assert_eq!(store.get_attempt(&created.id).expect("get"), Some(created));
        assert!(store.get_attempt("missing").expect("get").is_none());
    }

    #[test]
    fn outcome_updates_set_and_clear_failure_reason() {
        let test = open_store("/work/attempts");
        let store = &test.store;
        let session = store.get_or_create_session("main").expect("session");
        let created = attempt(store, &session.id, "slow query", "add index");

        store
            .mark_attempt_failed(&created.id, Some("index ignored"))
            .expect("fail");
        let failed = store.get_attempt(&created.id).expect("get").expect("exists");
        assert_eq!(failed.outcome, AttemptOutcome::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("index ignored"));

        store.mark_attempt_worked(&created.id).expect("worked");
        let worked = store.get_attempt(&created.id).expect("get").expect("exists");
        assert_eq!(worked.outcome, AttemptOutcome::Worked);
        assert_eq!(worked.failure_reason, None);

        store
            .mark_attempt_partial(&created.id, Some("   "))
            .expect("partial");
        let partial = store.get_attempt(&created.id).expect("get").expect("exists");
        assert_eq!(partial.outcome, AttemptOutcome::Partial);
        assert_eq!(partial.failure_reason, None);

        assert!(store
            .mark_attempt_worked("missing")
            .expect_err("missing")
            .is_not_found());
    }

    #[test]
    fn list_filters_and_recent() {
        let test = open_store("/work/attempts");
        let store = &test.store;
        let main = store.get_or_create_session("main").expect("session");
        let side = store.get_or_create_session("side").expect("session");
        let a = attempt(store, &main.id, "parser panics", "use nom");
        let b = attempt(store, &side.id, "parser slow", "use winnow");
        let c = attempt(store, &main.id, "flaky test", "add retry");
        store.mark_attempt_failed(&a.id, None).expect("fail");
        store.mark_attempt_failed(&c.id, None).expect("fail");

        let main_failed = store
            .list_attempts(&AttemptFilter {
                session_id: Some(main.id.clone()),
                outcome: Some(AttemptOutcome::Failed),
                ..AttemptFilter::default()
            })
            .expect("filtered");
        let ids: Vec<_> = main_failed.iter().map(|x| x.id.as_str()).collect();
        assert_eq!(ids, vec![c.id.as_str(), a.id.as_str()]);

        let searched = store
            .list_attempts(&AttemptFilter {
                search: Some("winnow".to_string()),
                ..AttemptFilter::default()
            })
            .expect("search");
        assert_eq!(searched.len(), 1);
        assert_eq!(searched[0].id, b.id);

        assert_eq!(store.list_failed_attempts().expect("failed").len(), 2);
        let recent = store.recent_attempts(2).expect("recent");
        let ids: Vec<_> = recent.iter().map(|x| x.id.as_str()).collect();
        assert_eq!(ids, vec![c.id.as_str(), b.id.as_str()]);
    }

    #[test]
    fn similar_failed_matches_problem_only() {
        let test = open_store("/work/attempts");
        let store = &test.store;
        let session = store.get_or_create_session("main").expect("session");
        let hit = attempt(store, &session.id, "Database LOCKED on write", "retry");
        let pending = attempt(store, &session.id, "database locked again", "retry");
        let wrong_field = attempt(store, &session.id, "slow", "database pool");
        store.mark_attempt_failed(&hit.id, None).expect("fail");
        store.mark_attempt_failed(&wrong_field.id, None).expect("fail");

        let found = store
            .find_similar_failed_attempts("the database is locked")
            .expect("similar");
        let ids: Vec<_> = found.iter().map(|x| x.id.as_str()).collect();
        assert_eq!(ids, vec![hit.id.as_str()]);
        assert_ne!(found[0].id, pending.id);

        assert!(store.find_similar_failed_attempts("is it").expect("short").is_empty());
    }

    #[test]
    fn similar_failed_folds_non_ascii_case() {
        let test = open_store("/work/attempts");
        let store = &test.store;
        let session = store.get_or_create_session("main").expect("session");
        let hit = attempt(store, &session.id, "ÉCRAN NOIR au démarrage", "reinstall driver");
        store.mark_attempt_failed(&hit.id, None).expect("fail");

        let found = store
            .find_similar_failed_attempts("écran figé")
            .expect("similar");
        let ids: Vec<_> = found.iter().map(|x| x.id.as_str()).collect();
        assert_eq!(ids, vec![hit.id.as_str()]);
    }

    #[test]
    fn create_error_names_the_operation() {
        let test = open_store("/work/attempts");
        let store = &test.store;
        let err = store
            .create_attempt(NewAttempt {
                session_id: "no-such-session".to_string(),
                problem: "p".to_string(),
                suggestion: "s".to_string(),
                ..NewAttempt::default()
            })
            .expect_err("missing session");

        assert!(matches!(
            err,
            StorageError::Query {
                operation: "create attempt",
                ..
            }
        ));
        let message = err.to_string();
        assert!(message.starts_with("failed to create attempt"), "{message}");
        assert!(message.contains("FOREIGN KEY"), "{message}");
    }

    #[test]
    fn stats_count_present_outcomes_only() {
        let test = open_store("/work/attempts");
        let store = &test.store;
        let session = store.get_or_create_session("main").expect("session");
        let a = attempt(store, &session.id, "p1", "s1");
        let b = attempt(store, &session.id, "p2", "s2");
        attempt(store, &session.id, "p3", "s3");
        store.mark_attempt_worked(&a.id).expect("worked");
        store.mark_attempt_worked(&b.id).expect("worked");

        let stats = store.attempt_stats().expect("stats");
        assert_eq!(stats.get(&AttemptOutcome::Worked), Some(&2));
        assert_eq!(stats.get(&AttemptOutcome::Pending), Some(&1));
        assert_eq!(stats.get(&AttemptOutcome::Failed), None);
        assert_eq!(stats.len(), 2);
    }

    #[test]
    fn recurring_failures_group_exact_suggestion_text() {
        let test = open_store("/work/attempts");
        let store = &test.store;
        let session = store.get_or_create_session("main").expect("session");

        let mut last = None;
        for suggestion in [
            "bump timeout",
            "bump timeout",
            "bump timeout",
            "Bump timeout",
            "clear cache",
            "clear cache",
        ] {
            let created = attempt(store, &session.id, "hang", suggestion);
            store.mark_attempt_failed(&created.id, None).expect("fail");
            if suggestion == "bump timeout" {
                last = Some(created.created_at);
            }
        }
        let worked = attempt(store, &session.id, "hang", "clear cache");
        store.mark_attempt_worked(&worked.id).expect("worked");

        let recurring = store.recurring_failures(2).expect("recurring");
        let summary: Vec<_> = recurring
            .iter()
            .map(|r| (r.suggestion.as_str(), r.failure_count))
            .collect();
        assert_eq!(summary, vec![("bump timeout", 3), ("clear cache", 2)]);
        assert_eq!(Some(recurring[0].last_failure), last);
    }

    #[test]
    fn delete_reports_missing_ids() {
        let test = open_store("/work/attempts");
        let store = &test.store;
        let session = store.get_or_create_session("main").expect("session");
        let created = attempt(store, &session.id, "p", "s");
        store.delete_attempt(&created.id).expect("delete");
        assert!(store.get_attempt(&created.id).expect("get").is_none());
        assert!(store.delete_attempt(&created.id).expect_err("gone").is_not_found());
    }
}
