use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Transaction};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::import::{parse_roster, Denylist, ParsedRoster, SkipCounts};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};

/// Batch tags are what cancel operates on. The timestamp keeps them legible
/// in the table; the uuid prefix makes same-second imports collision-free.
fn new_batch_id() -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("import_{}_{}", stamp, &suffix[..8])
}

fn skipped_json(skipped: &SkipCounts) -> serde_json::Value {
    json!({
        "tooShort": skipped.too_short,
        "denylisted": skipped.denylisted,
        "missingFields": skipped.missing_fields,
        "total": skipped.total(),
    })
}

fn parse_params_roster(
    workspace: &Path,
    params: &serde_json::Value,
) -> Result<ParsedRoster, HandlerErr> {
    let Some(rows) = params.get("rows") else {
        return Err(HandlerErr::bad_params("missing rows"));
    };
    let denylist = Denylist::load(workspace);
    parse_roster(rows, &denylist).map_err(|e| HandlerErr::new("unreadable_grid", e.to_string()))
}

/// Group labels in the roster resolve to group rows, created on first use.
struct GroupResolver {
    by_label: HashMap<String, String>,
}

impl GroupResolver {
    fn new() -> Self {
        Self {
            by_label: HashMap::new(),
        }
    }

    fn resolve(&mut self, tx: &Transaction<'_>, label: &str) -> Result<String, HandlerErr> {
        if let Some(id) = self.by_label.get(label) {
            return Ok(id.clone());
        }
        let existing: Option<String> = tx
            .query_row("SELECT id FROM groups WHERE name = ?", [label], |r| {
                r.get(0)
            })
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        let id = match existing {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO groups(id, name, stream, year) VALUES(?, ?, NULL, NULL)",
                    (&id, label),
                )
                .map_err(|e| {
                    HandlerErr::with_details(
                        "db_insert_failed",
                        e.to_string(),
                        json!({ "table": "groups" }),
                    )
                })?;
                id
            }
        };
        self.by_label.insert(label.to_string(), id.clone());
        Ok(id)
    }
}

/// Insert every accepted candidate under one batch tag. Runs inside the
/// caller's transaction so a failing row aborts the whole batch.
fn insert_batch(
    tx: &Transaction<'_>,
    parsed: &ParsedRoster,
    batch_id: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut resolver = GroupResolver::new();
    let mut next_sort: HashMap<String, i64> = HashMap::new();
    let updated_at = Utc::now().to_rfc3339();
    let mut imported = Vec::with_capacity(parsed.accepted.len());

    for candidate in &parsed.accepted {
        let group_id = resolver.resolve(tx, &candidate.group_label)?;
        let sort_order = match next_sort.get(&group_id) {
            Some(n) => *n,
            None => tx
                .query_row(
                    "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM trainees WHERE group_id = ?",
                    [&group_id],
                    |r| r.get(0),
                )
                .map_err(|e| HandlerErr::db("db_query_failed", e))?,
        };
        next_sort.insert(group_id.clone(), sort_order + 1);

        let trainee_id = Uuid::new_v4().to_string();
        // Imported trainees always start at zero hours, whatever the source
        // workbook carried in its legacy column.
        tx.execute(
            "INSERT INTO trainees(id, group_id, last_name, first_name, trainee_no,
                                  absence_hours, import_batch, sort_order, updated_at)
             VALUES(?, ?, ?, ?, NULL, 0, ?, ?, ?)",
            (
                &trainee_id,
                &group_id,
                &candidate.last_name,
                &candidate.first_name,
                batch_id,
                sort_order,
                &updated_at,
            ),
        )
        .map_err(|e| {
            HandlerErr::with_details(
                "db_insert_failed",
                e.to_string(),
                json!({ "table": "trainees" }),
            )
        })?;

        imported.push(json!({
            "traineeId": trainee_id,
            "lastName": candidate.last_name,
            "firstName": candidate.first_name,
            "fullName": candidate.full_name(),
            "groupId": group_id,
            "groupLabel": candidate.group_label,
            "absenceHours": 0.0,
            "importBatch": batch_id,
        }));
    }

    Ok(imported)
}

fn import_preview(
    workspace: &Path,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let parsed = parse_params_roster(workspace, params)?;
    let candidates: Vec<serde_json::Value> = parsed
        .accepted
        .iter()
        .map(|c| {
            json!({
                "lastName": c.last_name,
                "firstName": c.first_name,
                "fullName": c.full_name(),
                "groupLabel": c.group_label,
                "absenceHours": 0.0,
            })
        })
        .collect();
    Ok(json!({
        "candidates": candidates,
        "acceptedCount": parsed.accepted.len(),
        "skipped": skipped_json(&parsed.skipped),
    }))
}

/// Additive flow: every accepted row lands tagged with a fresh batch id,
/// existing rows are untouched, and the batch can be cancelled later.
fn import_run(
    conn: &Connection,
    workspace: &Path,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let parsed = parse_params_roster(workspace, params)?;
    let batch_id = new_batch_id();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let imported = match insert_batch(&tx, &parsed, &batch_id) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return Err(e);
        }
    };
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    info!(
        batch = %batch_id,
        imported = imported.len(),
        skipped = parsed.skipped.total(),
        "roster import committed"
    );

    Ok(json!({
        "batchId": batch_id,
        "imported": imported,
        "importedCount": imported.len(),
        "skipped": skipped_json(&parsed.skipped),
    }))
}

/// Replace-everything flow: clears all trainees, their session outcomes and
/// the session headers, then imports the new roster. This flow destroys
/// batch history by construction; only the fresh batch remains cancellable.
fn import_replace_all(
    conn: &Connection,
    workspace: &Path,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let parsed = parse_params_roster(workspace, params)?;
    let batch_id = new_batch_id();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    let mut cleared = 0usize;
    for (table, sql) in [
        ("trainee_absences", "DELETE FROM trainee_absences"),
        ("absence_records", "DELETE FROM absence_records"),
        ("trainees", "DELETE FROM trainees"),
    ] {
        match tx.execute(sql, []) {
            Ok(n) if table == "trainees" => cleared = n,
            Ok(_) => {}
            Err(e) => {
                let _ = tx.rollback();
                return Err(HandlerErr::with_details(
                    "db_delete_failed",
                    e.to_string(),
                    json!({ "table": table }),
                ));
            }
        }
    }

    let imported = match insert_batch(&tx, &parsed, &batch_id) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return Err(e);
        }
    };
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    info!(
        batch = %batch_id,
        cleared,
        imported = imported.len(),
        "roster replaced"
    );

    Ok(json!({
        "batchId": batch_id,
        "clearedCount": cleared,
        "imported": imported,
        "importedCount": imported.len(),
        "skipped": skipped_json(&parsed.skipped),
    }))
}

/// Cancel deletes every trainee stamped with the batch tag. An unknown or
/// already-cancelled tag reports zero deletions, never an error.
fn import_cancel(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = params
        .get("batchId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params("missing batchId"))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    if let Err(e) = tx.execute(
        "DELETE FROM trainee_absences
         WHERE trainee_id IN (SELECT id FROM trainees WHERE import_batch = ?)",
        [&batch_id],
    ) {
        let _ = tx.rollback();
        return Err(HandlerErr::with_details(
            "db_delete_failed",
            e.to_string(),
            json!({ "table": "trainee_absences" }),
        ));
    }
    let deleted = match tx.execute("DELETE FROM trainees WHERE import_batch = ?", [&batch_id]) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return Err(HandlerErr::with_details(
                "db_delete_failed",
                e.to_string(),
                json!({ "table": "trainees" }),
            ));
        }
    };
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    info!(batch = %batch_id, deleted, "import batch cancelled");

    Ok(json!({ "batchId": batch_id, "deletedCount": deleted }))
}

fn with_workspace(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &Path, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let (Some(conn), Some(workspace)) = (state.db.as_ref(), state.workspace.as_ref()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, workspace, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "import.preview" => Some(with_workspace(state, req, |_, ws, p| import_preview(ws, p))),
        "import.run" => Some(with_workspace(state, req, import_run)),
        "import.replaceAll" => Some(with_workspace(state, req, import_replace_all)),
        "import.cancel" => Some(with_workspace(state, req, |conn, _, p| {
            import_cancel(conn, p)
        })),
        _ => None,
    }
}
