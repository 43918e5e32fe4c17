use ledger_core::timestamp::{format_timestamp, now_utc};
use ledger_core::{new_id, NewNote, Note};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use crate::{
    rows_affected_or_not_found, timestamp_column, LedgerStore, QueryContext, StorageError,
    NEWEST_FIRST,
};

const NOTE_COLUMNS: &str = "id, project_id, session_id, content, created_at";

fn note_from_row(row: &Row<'_>) -> rusqlite::Result<Note> {
    Ok(Note {
        id: row.get(0)?,
        project_id: row.get(1)?,
        session_id: row.get(2)?,
        content: row.get(3)?,
        created_at: timestamp_column(row, 4)?,
    })
}

impl LedgerStore {
    fn query_notes(
        &self,
        filter: &str,
        mut values: Vec<Value>,
        limit: Option<u32>,
    ) -> Result<Vec<Note>, StorageError> {
        let mut sql = format!("SELECT {NOTE_COLUMNS} FROM notes WHERE {filter} {NEWEST_FIRST}");
        if let Some(limit) = limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(i64::from(limit)));
        }

        let conn = self.conn()?;
        let mut statement = conn.prepare(&sql).during("list notes")?;
        let rows = statement
            .query_map(params_from_iter(values.iter()), note_from_row)
            .during("list notes")?;

        let mut notes = Vec::new();
        for row in rows {
            notes.push(row.during("list notes")?);
        }
        Ok(notes)
    }

    pub fn create_note(&self, input: NewNote) -> Result<Note, StorageError> {
        let note = Note {
            id: input.id.unwrap_or_else(new_id),
            project_id: input.project_id.unwrap_or_else(|| self.project_id.clone()),
            session_id: input.session_id,
            content: input.content,
            created_at: now_utc(),
        };

        self.conn()?.execute(
            "
            INSERT INTO notes (id, project_id, session_id, content, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                note.id,
                note.project_id,
                note.session_id,
                note.content,
                format_timestamp(note.created_at),
            ],
        )
        .during("create note")?;
        Ok(note)
    }

    /// Note in the bound project, outside any session.
    pub fn quick_note(&self, content: &str) -> Result<Note, StorageError> {
        self.create_note(NewNote {
            content: content.to_string(),
            ..NewNote::default()
        })
    }

    pub fn get_note(&self, id: &str) -> Result<Option<Note>, StorageError> {
        let note = self
            .conn()?
            .query_row(
                &format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id = ?1"),
                [id],
                note_from_row,
            )
            .optional()
            .during("get note")?;
        Ok(note)
    }

    /// Only the content is mutable.
    pub fn update_note(&self, note: &Note) -> Result<(), StorageError> {
        let changes = self.conn()?.execute(
            "UPDATE notes SET content = ?1 WHERE id = ?2",
            params![note.content, note.id],
        )
        .during("update note")?;
        rows_affected_or_not_found(changes, "note", &note.id)
    }

    pub fn list_notes(&self) -> Result<Vec<Note>, StorageError> {
        self.list_notes_by_project(&self.project_id)
    }

    pub fn list_notes_by_project(&self, project_id: &str) -> Result<Vec<Note>, StorageError> {
        self.query_notes(
            "project_id = ?",
            vec![Value::Text(project_id.to_string())],
            None,
        )
    }

    pub fn list_notes_by_session(&self, session_id: &str) -> Result<Vec<Note>, StorageError> {
        self.query_notes(
            "session_id = ?",
            vec![Value::Text(session_id.to_string())],
            None,
        )
    }

    pub fn recent_notes(&self, limit: u32) -> Result<Vec<Note>, StorageError> {
        self.query_notes(
            "project_id = ?",
            vec![Value::Text(self.project_id.clone())],
            Some(limit),
        )
    }

    /// Case-sensitive substring match on content in the bound project.
    pub fn search_notes(&self, text: &str) -> Result<Vec<Note>, StorageError> {
        self.query_notes(
            "project_id = ? AND instr(content, ?) > 0",
            vec![
                Value::Text(self.project_id.clone()),
                Value::Text(text.to_string()),
            ],
            None,
        )
    }

    pub fn delete_note(&self, id: &str) -> Result<(), StorageError> {
        let changes = self
            .conn()?
            .execute("DELETE FROM notes WHERE id = ?1", [id])
            .during("delete note")?;
        rows_affected_or_not_found(changes, "note", id)
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::open_store;
    use ledger_core::NewNote;

    #[test]
    fn quick_note_has_no_session() {
        let test = open_store("/work/notes");
        let store = &test.store;
        let note = store.quick_note("check the WAL size").expect("quick note");
        assert_eq!(note.session_id, None);
        assert_eq!(note.project_id, store.project_id());
        assert_eq!(store.get_note(&note.id).expect("get"), Some(note));
        assert!(store.get_note("missing").expect("get").is_none());
    }

    #[test]
    fn search_is_case_sensitive_substring() {
        let test = open_store("/work/notes");
        let store = &test.store;
        let upper = store.quick_note("Remember WAL mode").expect("note");
        store.quick_note("remember wal mode").expect("note");
        let literal = store.quick_note("100% coverage").expect("note");

        let found = store.search_notes("WAL").expect("search");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, upper.id);

        let found = store.search_notes("0%").expect("search");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, literal.id);
        assert!(store.search_notes("nothing here").expect("search").is_empty());
    }

    #[test]
    fn session_listing_and_recent_order() {
        let test = open_store("/work/notes");
        let store = &test.store;
        let session = store.get_or_create_session("main").expect("session");
        let first = store
            .create_note(NewNote {
                session_id: Some(session.id.clone()),
                content: "first".to_string(),
                ..NewNote::default()
            })
            .expect("note");
        let second = store.quick_note("second").expect("note");
        let third = store
            .create_note(NewNote {
                session_id: Some(session.id.clone()),
                content: "third".to_string(),
                ..NewNote::default()
            })
            .expect("note");

        let in_session: Vec<_> = store
            .list_notes_by_session(&session.id)
            .expect("by session")
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(in_session, vec![third.id.clone(), first.id.clone()]);

        let recent: Vec<_> = store
            .recent_notes(2)
            .expect("recent")
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(recent, vec![third.id, second.id]);
        assert_eq!(store.list_notes().expect("all").len(), 3);
    }

    #[test]
    fn update_and_delete() {
        let test = open_store("/work/notes");
        let store = &test.store;
        let mut note = store.quick_note("draft").expect("note");
        note.content = "final".to_string();
        store.update_note(&note).expect("update");
        assert_eq!(
            store.get_note(&note.id).expect("get").expect("exists").content,
            "final"
        );

        store.delete_note(&note.id).expect("delete");
        assert!(store.delete_note(&note.id).expect_err("gone").is_not_found());
        assert!(store.update_note(&note).expect_err("gone").is_not_found());
    }
}
