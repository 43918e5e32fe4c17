use ledger_core::timestamp::{format_timestamp, now_utc};
use ledger_core::{new_id, NewSession, Session};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::{
    rows_affected_or_not_found, timestamp_column, LedgerStore, QueryContext, StorageError,
    NEWEST_FIRST,
};

const SESSION_COLUMNS: &str = "id, project_id, name, parent_session_id, created_at, updated_at";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        parent_session_id: row.get(3)?,
        created_at: timestamp_column(row, 4)?,
        updated_at: timestamp_column(row, 5)?,
    })
}

fn insert_session(conn: &Connection, session: &Session) -> Result<(), StorageError> {
    conn.execute(
        "
        INSERT INTO sessions (id, project_id, name, parent_session_id, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ",
        params![
            session.id,
            session.project_id,
            session.name,
            session.parent_session_id,
            format_timestamp(session.created_at),
            format_timestamp(session.updated_at),
        ],
    )
    .during("create session")?;
    Ok(())
}

impl LedgerStore {
    fn new_session(&self, input: NewSession) -> Session {
        let now = now_utc();
        Session {
            id: input.id.unwrap_or_else(new_id),
            project_id: input.project_id.unwrap_or_else(|| self.project_id.clone()),
            name: input.name,
            parent_session_id: input.parent_session_id,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn create_session(&self, input: NewSession) -> Result<Session, StorageError> {
        let session = self.new_session(input);
        insert_session(&*self.conn()?, &session)?;
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>, StorageError> {
        let session = self
            .conn()?
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                [id],
                session_from_row,
            )
            .optional()
            .during("get session")?;
        Ok(session)
    }

    /// Writes name and parent link; bumps `updated_at` on the passed value.
    pub fn update_session(&self, session: &mut Session) -> Result<(), StorageError> {
        let updated_at = now_utc();
        let changes = self.conn()?.execute(
            "UPDATE sessions SET name = ?1, parent_session_id = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                session.name,
                session.parent_session_id,
                format_timestamp(updated_at),
                session.id,
            ],
        )
        .during("update session")?;
        rows_affected_or_not_found(changes, "session", &session.id)?;
        session.updated_at = updated_at;
        Ok(())
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>, StorageError> {
        self.list_sessions_by_project(&self.project_id)
    }

    pub fn list_sessions_by_project(&self, project_id: &str) -> Result<Vec<Session>, StorageError> {
        let conn = self.conn()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE project_id = ?1 {NEWEST_FIRST}"
        ))
        .during("list sessions")?;
        let rows = statement
            .query_map([project_id], session_from_row)
            .during("list sessions")?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row.during("list sessions")?);
        }
        Ok(sessions)
    }

    /// Session names are unique per project through this call: the lookup
    /// and the insert share one transaction.
    pub fn get_or_create_session(&self, name: &str) -> Result<Session, StorageError> {
        self.transaction(|tx| {
            let existing = tx
                .query_row(
                    &format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions
                         WHERE project_id = ?1 AND name = ?2
                         ORDER BY created_at ASC, rowid ASC
                         LIMIT 1"
                    ),
                    params![self.project_id, name],
                    session_from_row,
                )
                .optional()
                .during("look up session by name")?;
            if let Some(session) = existing {
                return Ok(session);
            }

            let session = self.new_session(NewSession {
                name: name.to_string(),
                ..NewSession::default()
            });
            insert_session(tx, &session)?;
            Ok(session)
        })
    }

    /// Children of a deleted session keep existing with no parent.
    pub fn delete_session(&self, id: &str) -> Result<(), StorageError> {
        let changes = self
            .conn()?
            .execute("DELETE FROM sessions WHERE id = ?1", [id])
            .during("delete session")?;
        rows_affected_or_not_found(changes, "session", id)
    }

    /// New session in the parent's project pointing back at the parent.
    /// Nothing recorded under the parent is copied.
    pub fn fork_session(&self, parent_id: &str, name: &str) -> Result<Session, StorageError> {
        let parent = self
            .get_session(parent_id)?
            .ok_or_else(|| StorageError::not_found("parent session", parent_id))?;

        let forked = self.create_session(NewSession {
            project_id: Some(parent.project_id),
            name: name.to_string(),
            parent_session_id: Some(parent.id),
            ..NewSession::default()
        })?;
        debug!(parent_id, session_id = %forked.id, "session forked");
        Ok(forked)
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::open_store;
    use ledger_core::NewSession;

    #[test]
    fn create_and_reload_preserves_optional_parent() {
        let test = open_store("/a/sessions");
        let store = &test.store;
        let root = store
            .create_session(NewSession {
                name: "root".to_string(),
                ..NewSession::default()
            })
            .expect("create root");
        assert_eq!(root.project_id, store.project_id());
        assert_eq!(root.parent_session_id, None);

        let reloaded = store.get_session(&root.id).expect("get").expect("exists");
        assert_eq!(reloaded, root);
        assert!(store.get_session("missing").expect("get").is_none());
    }

    #[test]
    fn get_or_create_deduplicates_by_name() {
        let test = open_store("/a/sessions");
        let first = test.store.get_or_create_session("main").expect("create");
        let second = test.store.get_or_create_session("main").expect("reuse");
        let other = test.store.get_or_create_session("other").expect("create other");
        assert_eq!(first.id, second.id);
        assert_ne!(first.id, other.id);
        assert_eq!(test.store.list_sessions().expect("list").len(), 2);
    }

    #[test]
    fn fork_records_lineage_without_touching_parent() {
        let test = open_store("/a/sessions");
        let store = &test.store;
        let parent = store.get_or_create_session("main").expect("parent");
        let fork = store.fork_session(&parent.id, "explore-x").expect("fork");

        assert_eq!(fork.parent_session_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(fork.project_id, parent.project_id);
        assert_eq!(fork.name, "explore-x");
        assert_eq!(
            store.get_session(&parent.id).expect("get").expect("exists"),
            parent
        );
    }

    #[test]
    fn fork_of_missing_parent_is_not_found() {
        let test = open_store("/a/sessions");
        let err = test
            .store
            .fork_session("nope", "explore")
            .expect_err("missing parent");
        assert!(err.is_not_found());
        assert!(test.store.list_sessions().expect("list").is_empty());
    }

    #[test]
    fn deleting_parent_orphans_children() {
        let test = open_store("/a/sessions");
        let store = &test.store;
        let parent = store.get_or_create_session("main").expect("parent");
        let child = store.fork_session(&parent.id, "child").expect("fork");

        store.delete_session(&parent.id).expect("delete");
        let child = store.get_session(&child.id).expect("get").expect("survives");
        assert_eq!(child.parent_session_id, None);
        assert!(store.delete_session(&parent.id).expect_err("gone").is_not_found());
    }

    #[test]
    fn update_renames_and_bumps_timestamp() {
        let test = open_store("/a/sessions");
        let store = &test.store;
        let mut session = store.get_or_create_session("draft").expect("create");
        let before = session.updated_at;
        session.name = "final".to_string();
        store.update_session(&mut session).expect("update");
        assert!(session.updated_at >= before);

        let reloaded = store.get_session(&session.id).expect("get").expect("exists");
        assert_eq!(reloaded.name, "final");

        let mut ghost = session.clone();
        ghost.id = "ghost".to_string();
        assert!(store.update_session(&mut ghost).expect_err("missing").is_not_found());
    }
}
