use chrono::{NaiveDate, NaiveTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::calc;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn parse_time_param(params: &serde_json::Value, key: &str) -> Result<NaiveTime, HandlerErr> {
    let raw = get_required_str(params, key)?;
    calc::parse_session_time(&raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be HH:MM", key)))
}

fn stored_time(s: &str) -> Result<NaiveTime, HandlerErr> {
    calc::parse_session_time(s).ok_or_else(|| {
        HandlerErr::with_details(
            "invalid_session_window",
            "stored session time is unreadable",
            json!({ "value": s }),
        )
    })
}

struct SessionEntry {
    trainee_id: String,
    status: calc::AttendanceStatus,
    comment: Option<String>,
}

fn parse_entries(params: &serde_json::Value) -> Result<Vec<SessionEntry>, HandlerErr> {
    let Some(raw) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing entries"));
    };
    let mut entries = Vec::with_capacity(raw.len());
    for (i, item) in raw.iter().enumerate() {
        let trainee_id = item
            .get("traineeId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerErr::bad_params(format!("entries[{}] missing traineeId", i)))?;
        let status_raw = item
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerErr::bad_params(format!("entries[{}] missing status", i)))?;
        // The calculator is lenient about unknown statuses; the store is not.
        let status = calc::AttendanceStatus::parse(status_raw).ok_or_else(|| {
            HandlerErr::with_details(
                "bad_params",
                format!("entries[{}] has unknown status", i),
                json!({ "status": status_raw }),
            )
        })?;
        let comment = item
            .get("comment")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        entries.push(SessionEntry {
            trainee_id: trainee_id.to_string(),
            status,
            comment,
        });
    }
    Ok(entries)
}

fn sessions_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let group_id = get_required_str(params, "groupId")?;
    let teacher = get_required_str(params, "teacher")?.trim().to_string();
    if teacher.is_empty() {
        return Err(HandlerErr::bad_params("teacher must not be empty"));
    }
    let date_raw = get_required_str(params, "date")?;
    let date = NaiveDate::parse_from_str(date_raw.trim(), "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params("date must be YYYY-MM-DD"))?;
    let starts_at = parse_time_param(params, "startsAt")?;
    let ends_at = parse_time_param(params, "endsAt")?;
    if ends_at <= starts_at {
        return Err(HandlerErr::bad_params("session must end after it starts"));
    }
    let entries = parse_entries(params)?;

    let group_exists = conn
        .query_row("SELECT 1 FROM groups WHERE id = ?", [&group_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .is_some();
    if !group_exists {
        return Err(HandlerErr::not_found("group not found"));
    }

    let record_id = Uuid::new_v4().to_string();
    let date_text = date.format("%Y-%m-%d").to_string();
    let starts_text = starts_at.format("%H:%M").to_string();
    let ends_text = ends_at.format("%H:%M").to_string();
    let updated_at = Utc::now().to_rfc3339();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    let outcome = (|| -> Result<Vec<serde_json::Value>, HandlerErr> {
        tx.execute(
            "INSERT INTO absence_records(id, group_id, teacher, date, starts_at, ends_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                &record_id,
                &group_id,
                &teacher,
                &date_text,
                &starts_text,
                &ends_text,
            ),
        )
        .map_err(|e| {
            HandlerErr::with_details(
                "db_insert_failed",
                e.to_string(),
                json!({ "table": "absence_records" }),
            )
        })?;

        let mut rows = Vec::with_capacity(entries.len());
        for entry in &entries {
            let owner: Option<String> = tx
                .query_row(
                    "SELECT group_id FROM trainees WHERE id = ?",
                    [&entry.trainee_id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(|e| HandlerErr::db("db_query_failed", e))?;
            match owner {
                Some(g) if g == group_id => {}
                Some(_) => {
                    return Err(HandlerErr::with_details(
                        "bad_params",
                        "trainee belongs to another group",
                        json!({ "traineeId": entry.trainee_id }),
                    ))
                }
                None => {
                    return Err(HandlerErr::with_details(
                        "not_found",
                        "trainee not found",
                        json!({ "traineeId": entry.trainee_id }),
                    ))
                }
            }

            let hours = calc::absence_hours(entry.status.as_str(), false, starts_at, ends_at);
            let absence_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO trainee_absences(id, record_id, trainee_id, status,
                                              validated, justified, hours, comment)
                 VALUES(?, ?, ?, ?, 0, 0, ?, ?)",
                (
                    &absence_id,
                    &record_id,
                    &entry.trainee_id,
                    entry.status.as_str(),
                    hours,
                    &entry.comment,
                ),
            )
            .map_err(|e| {
                HandlerErr::with_details(
                    "db_insert_failed",
                    e.to_string(),
                    json!({ "table": "trainee_absences" }),
                )
            })?;

            if hours > 0.0 {
                tx.execute(
                    "UPDATE trainees SET absence_hours = absence_hours + ?, updated_at = ?
                     WHERE id = ?",
                    (hours, &updated_at, &entry.trainee_id),
                )
                .map_err(|e| {
                    HandlerErr::with_details(
                        "db_update_failed",
                        e.to_string(),
                        json!({ "table": "trainees" }),
                    )
                })?;
            }

            rows.push(json!({
                "absenceId": absence_id,
                "traineeId": entry.trainee_id,
                "status": entry.status.as_str(),
                "hours": hours,
            }));
        }
        Ok(rows)
    })();

    let rows = match outcome {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return Err(e);
        }
    };
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    debug!(record = %record_id, entries = rows.len(), "session recorded");

    Ok(json!({
        "recordId": record_id,
        "date": date_text,
        "startsAt": starts_text,
        "endsAt": ends_text,
        "entries": rows,
    }))
}

fn sessions_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let group_id = get_required_str(params, "groupId")?;
    let mut stmt = conn
        .prepare(
            "SELECT r.id, r.teacher, r.date, r.starts_at, r.ends_at,
                    (SELECT COUNT(*) FROM trainee_absences a WHERE a.record_id = r.id),
                    (SELECT COUNT(*) FROM trainee_absences a
                      WHERE a.record_id = r.id AND a.status = 'absent'),
                    (SELECT COUNT(*) FROM trainee_absences a
                      WHERE a.record_id = r.id AND a.status = 'late')
             FROM absence_records r
             WHERE r.group_id = ?
             ORDER BY r.date, r.starts_at",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let sessions = stmt
        .query_map([&group_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "teacher": r.get::<_, String>(1)?,
                "date": r.get::<_, String>(2)?,
                "startsAt": r.get::<_, String>(3)?,
                "endsAt": r.get::<_, String>(4)?,
                "entryCount": r.get::<_, i64>(5)?,
                "absentCount": r.get::<_, i64>(6)?,
                "lateCount": r.get::<_, i64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "sessions": sessions }))
}

fn absences_list_for_trainee(
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

    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.record_id, r.date, r.starts_at, r.ends_at, r.teacher,
                    a.status, a.validated, a.justified, a.hours, a.comment
             FROM trainee_absences a
             JOIN absence_records r ON r.id = a.record_id
             WHERE a.trainee_id = ?
             ORDER BY r.date, r.starts_at",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let entries = stmt
        .query_map([&trainee_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "recordId": r.get::<_, String>(1)?,
                "date": r.get::<_, String>(2)?,
                "startsAt": r.get::<_, String>(3)?,
                "endsAt": r.get::<_, String>(4)?,
                "teacher": r.get::<_, String>(5)?,
                "status": r.get::<_, String>(6)?,
                "validated": r.get::<_, i64>(7)? != 0,
                "justified": r.get::<_, i64>(8)? != 0,
                "hours": r.get::<_, f64>(9)?,
                "comment": r.get::<_, Option<String>>(10)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "entries": entries }))
}

fn absences_set_validated(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let absence_id = get_required_str(params, "absenceId")?;
    let validated = params
        .get("validated")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::bad_params("missing validated"))?;

    let changed = conn
        .execute(
            "UPDATE trainee_absences SET validated = ? WHERE id = ?",
            (validated as i64, &absence_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("absence entry not found"));
    }
    Ok(json!({ "absenceId": absence_id, "validated": validated }))
}

/// Justifying an absence zeroes its charged hours and the trainee's running
/// total; withdrawing the justification re-derives the charge from the
/// owning session's window.
fn absences_set_justified(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let absence_id = get_required_str(params, "absenceId")?;
    let justified = params
        .get("justified")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::bad_params("missing justified"))?;
    let comment = params
        .get("comment")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let row: Option<(String, String, bool, f64, String, String)> = conn
        .query_row(
            "SELECT a.trainee_id, a.status, a.justified, a.hours, r.starts_at, r.ends_at
             FROM trainee_absences a
             JOIN absence_records r ON r.id = a.record_id
             WHERE a.id = ?",
            [&absence_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get::<_, i64>(2)? != 0,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some((trainee_id, status, current, old_hours, starts_raw, ends_raw)) = row else {
        return Err(HandlerErr::not_found("absence entry not found"));
    };

    if current == justified {
        if let Some(c) = comment {
            conn.execute(
                "UPDATE trainee_absences SET comment = ? WHERE id = ?",
                (&c, &absence_id),
            )
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
        }
        return Ok(json!({
            "absenceId": absence_id,
            "justified": justified,
            "hours": old_hours,
        }));
    }

    let starts_at = stored_time(&starts_raw)?;
    let ends_at = stored_time(&ends_raw)?;
    let new_hours = calc::absence_hours(&status, justified, starts_at, ends_at);
    let delta = new_hours - old_hours;
    let updated_at = Utc::now().to_rfc3339();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let outcome = (|| -> Result<(), HandlerErr> {
        tx.execute(
            "UPDATE trainee_absences
             SET justified = ?, hours = ?, comment = COALESCE(?, comment)
             WHERE id = ?",
            (justified as i64, new_hours, &comment, &absence_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
        if delta != 0.0 {
            tx.execute(
                "UPDATE trainees SET absence_hours = absence_hours + ?, updated_at = ?
                 WHERE id = ?",
                (delta, &updated_at, &trainee_id),
            )
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
        }
        Ok(())
    })();
    if let Err(e) = outcome {
        let _ = tx.rollback();
        return Err(e);
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({
        "absenceId": absence_id,
        "justified": justified,
        "hours": new_hours,
    }))
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
        "sessions.create" => Some(with_db(state, req, sessions_create)),
        "sessions.list" => Some(with_db(state, req, sessions_list)),
        "absences.listForTrainee" => Some(with_db(state, req, absences_list_for_trainee)),
        "absences.setValidated" => Some(with_db(state, req, absences_set_validated)),
        "absences.setJustified" => Some(with_db(state, req, absences_set_justified)),
        _ => None,
    }
}
