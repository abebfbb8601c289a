use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE: &str = "absence.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS groups(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            stream TEXT,
            year TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS trainees(
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            trainee_no TEXT,
            absence_hours REAL NOT NULL DEFAULT 0,
            import_batch TEXT,
            sort_order INTEGER NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(group_id) REFERENCES groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_trainees_group ON trainees(group_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_trainees_group_sort ON trainees(group_id, sort_order)",
        [],
    )?;

    // Early workspaces predate batch-tagged imports. Add the column so
    // cancel-by-batch works against them too.
    ensure_trainees_import_batch(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_trainees_import_batch ON trainees(import_batch)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS absence_records(
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            teacher TEXT NOT NULL,
            date TEXT NOT NULL,
            starts_at TEXT NOT NULL,
            ends_at TEXT NOT NULL,
            FOREIGN KEY(group_id) REFERENCES groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_absence_records_group ON absence_records(group_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_absence_records_group_date ON absence_records(group_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS trainee_absences(
            id TEXT PRIMARY KEY,
            record_id TEXT NOT NULL,
            trainee_id TEXT NOT NULL,
            status TEXT NOT NULL,
            validated INTEGER NOT NULL DEFAULT 0,
            justified INTEGER NOT NULL DEFAULT 0,
            hours REAL NOT NULL DEFAULT 0,
            comment TEXT,
            FOREIGN KEY(record_id) REFERENCES absence_records(id),
            FOREIGN KEY(trainee_id) REFERENCES trainees(id),
            UNIQUE(record_id, trainee_id)
        )",
        [],
    )?;
    ensure_trainee_absences_comment(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_trainee_absences_record ON trainee_absences(record_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_trainee_absences_trainee ON trainee_absences(trainee_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_trainees_import_batch(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "trainees", "import_batch")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE trainees ADD COLUMN import_batch TEXT", [])?;
    Ok(())
}

fn ensure_trainee_absences_comment(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "trainee_absences", "comment")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE trainee_absences ADD COLUMN comment TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
