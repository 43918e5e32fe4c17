use ledger_core::timestamp::{format_timestamp, now_utc};
use ledger_core::{new_id, NewProject, Project};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::{
    rows_affected_or_not_found, timestamp_column, LedgerStore, QueryContext, StorageError,
};

const PROJECT_COLUMNS: &str = "id, name, path, created_at, updated_at";

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        created_at: timestamp_column(row, 3)?,
        updated_at: timestamp_column(row, 4)?,
    })
}

fn project_by_name(conn: &Connection, name: &str) -> Result<Option<Project>, StorageError> {
    let project = conn
        .query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE name = ?1"),
            [name],
            project_from_row,
        )
        .optional()
        .during("look up project by name")?;
    Ok(project)
}

/// Upsert keyed on the unique project name; a changed path is refreshed.
pub(crate) fn ensure_project_on(
    conn: &Connection,
    name: &str,
    path: &str,
) -> Result<Project, StorageError> {
    let now = format_timestamp(now_utc());
    conn.execute(
        "
        INSERT INTO projects (id, name, path, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?4)
        ON CONFLICT(name) DO UPDATE SET
            path = excluded.path,
            updated_at = CASE
                WHEN projects.path = excluded.path THEN projects.updated_at
                ELSE excluded.updated_at
            END
        ",
        params![new_id(), name, path, now],
    )
    .during("ensure project")?;
    project_by_name(conn, name)?.ok_or_else(|| StorageError::not_found("project", name))
}

impl LedgerStore {
    pub fn create_project(&self, input: NewProject) -> Result<Project, StorageError> {
        let now = now_utc();
        let project = Project {
            id: input.id.unwrap_or_else(new_id),
            name: input.name,
            path: input.path,
            created_at: now,
            updated_at: now,
        };

        self.conn()?.execute(
            "
            INSERT INTO projects (id, name, path, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                project.id,
                project.name,
                project.path,
                format_timestamp(project.created_at),
                format_timestamp(project.updated_at),
            ],
        )
        .during("create project")?;
        Ok(project)
    }

    pub fn ensure_project(&self, name: &str, path: &str) -> Result<Project, StorageError> {
        ensure_project_on(&*self.conn()?, name, path)
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>, StorageError> {
        let project = self
            .conn()?
            .query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
                [id],
                project_from_row,
            )
            .optional()
            .during("get project")?;
        Ok(project)
    }

    pub fn get_project_by_name(&self, name: &str) -> Result<Option<Project>, StorageError> {
        project_by_name(&*self.conn()?, name)
    }

    /// Writes name and path; bumps `updated_at` on the passed value.
    pub fn update_project(&self, project: &mut Project) -> Result<(), StorageError> {
        let updated_at = now_utc();
        let changes = self.conn()?.execute(
            "UPDATE projects SET name = ?1, path = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                project.name,
                project.path,
                format_timestamp(updated_at),
                project.id
            ],
        )
        .during("update project")?;
        rows_affected_or_not_found(changes, "project", &project.id)?;
        project.updated_at = updated_at;
        Ok(())
    }

    pub fn list_projects(&self) -> Result<Vec<Project>, StorageError> {
        let conn = self.conn()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects {}",
            crate::NEWEST_FIRST
        ))
        .during("list projects")?;
        let rows = statement
            .query_map([], project_from_row)
            .during("list projects")?;

        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.during("list projects")?);
        }
        Ok(projects)
    }

    /// Deletes the project and, through foreign keys, everything it owns.
    pub fn delete_project(&self, id: &str) -> Result<(), StorageError> {
        let changes = self
            .conn()?
            .execute("DELETE FROM projects WHERE id = ?1", [id])
            .during("delete project")?;
        rows_affected_or_not_found(changes, "project", id)
    }
}
