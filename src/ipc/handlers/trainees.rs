use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn group_exists(conn: &Connection, group_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM groups WHERE id = ?", [group_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn next_sort_order(conn: &Connection, group_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM trainees WHERE group_id = ?",
        [group_id],
        |r| r.get(0),
    )
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn trainee_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let last: String = r.get(3)?;
    let first: String = r.get(4)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "groupId": r.get::<_, String>(1)?,
        "groupName": r.get::<_, String>(2)?,
        "lastName": last.clone(),
        "firstName": first.clone(),
        "fullName": format!("{} {}", last, first),
        "traineeNo": r.get::<_, Option<String>>(5)?,
        "absenceHours": r.get::<_, f64>(6)?,
        "importBatch": r.get::<_, Option<String>>(7)?,
        "sortOrder": r.get::<_, i64>(8)?,
    }))
}

fn trainees_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let group_id = params
        .get("groupId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if let Some(gid) = group_id.as_deref() {
        if !group_exists(conn, gid)? {
            return Err(HandlerErr::not_found("group not found"));
        }
    }

    let sql = "SELECT t.id, t.group_id, g.name, t.last_name, t.first_name, t.trainee_no,
                      t.absence_hours, t.import_batch, t.sort_order
               FROM trainees t
               JOIN groups g ON g.id = t.group_id";

    let rows = if let Some(gid) = group_id {
        let mut stmt = conn
            .prepare(&format!(
                "{} WHERE t.group_id = ? ORDER BY t.sort_order",
                sql
            ))
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        stmt.query_map([gid], trainee_row_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| HandlerErr::db("db_query_failed", e))?
    } else {
        let mut stmt = conn
            .prepare(&format!("{} ORDER BY g.name, t.sort_order", sql))
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        stmt.query_map([], trainee_row_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| HandlerErr::db("db_query_failed", e))?
    };

    Ok(json!({ "trainees": rows }))
}

fn trainees_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let group_id = get_required_str(params, "groupId")?;
    let last_name = get_required_str(params, "lastName")?.trim().to_string();
    let first_name = get_required_str(params, "firstName")?.trim().to_string();
    let trainee_no = params
        .get("traineeNo")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());

    if last_name.is_empty() || first_name.is_empty() {
        return Err(HandlerErr::bad_params("lastName and firstName must not be empty"));
    }
    if !group_exists(conn, &group_id)? {
        return Err(HandlerErr::not_found("group not found"));
    }

    let trainee_id = Uuid::new_v4().to_string();
    let sort_order = next_sort_order(conn, &group_id)?;
    let updated_at = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO trainees(id, group_id, last_name, first_name, trainee_no,
                              absence_hours, import_batch, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, 0, NULL, ?, ?)",
        (
            &trainee_id,
            &group_id,
            &last_name,
            &first_name,
            &trainee_no,
            sort_order,
            &updated_at,
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "trainees" }))
    })?;

    Ok(json!({
        "traineeId": trainee_id,
        "fullName": format!("{} {}", last_name, first_name),
        "sortOrder": sort_order
    }))
}

fn trainees_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let trainee_id = get_required_str(params, "traineeId")?;

    let exists = conn
        .query_row("SELECT 1 FROM trainees WHERE id = ?", [&trainee_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .is_some();
    if !exists {
        return Err(HandlerErr::not_found("trainee not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute(
        "DELETE FROM trainee_absences WHERE trainee_id = ?",
        [&trainee_id],
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_delete_failed",
            e.to_string(),
            json!({ "table": "trainee_absences" }),
        )
    })?;
    tx.execute("DELETE FROM trainees WHERE id = ?", [&trainee_id])
        .map_err(|e| {
            HandlerErr::with_details(
                "db_delete_failed",
                e.to_string(),
                json!({ "table": "trainees" }),
            )
        })?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({ "ok": true }))
}

fn with_db(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "trainees.list" => Some(with_db(state, req, trainees_list)),
        "trainees.create" => Some(with_db(state, req, trainees_create)),
        "trainees.delete" => Some(with_db(state, req, trainees_delete)),
        _ => None,
    }
}
