use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

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

#[derive(Debug, Clone, Copy)]
struct AbsenceTotals {
    absence_hours: f64,
    late_count: i64,
    unjustified_count: i64,
    justified_count: i64,
}

/// Totals come from the stored entries, not the denormalized running total,
/// so a report is always consistent with the per-session data it cites.
fn trainee_totals(conn: &Connection, trainee_id: &str) -> Result<AbsenceTotals, HandlerErr> {
    conn.query_row(
        "SELECT
           COALESCE(SUM(CASE WHEN status = 'absent' AND justified = 0 THEN hours ELSE 0 END), 0),
           COALESCE(SUM(CASE WHEN status = 'late' THEN 1 ELSE 0 END), 0),
           COALESCE(SUM(CASE WHEN status = 'absent' AND justified = 0 THEN 1 ELSE 0 END), 0),
           COALESCE(SUM(CASE WHEN status = 'absent' AND justified = 1 THEN 1 ELSE 0 END), 0)
         FROM trainee_absences
         WHERE trainee_id = ?",
        [trainee_id],
        |r| {
            Ok(AbsenceTotals {
                absence_hours: r.get(0)?,
                late_count: r.get(1)?,
                unjustified_count: r.get(2)?,
                justified_count: r.get(3)?,
            })
        },
    )
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn totals_json(totals: &AbsenceTotals) -> serde_json::Value {
    json!({
        "absenceHours": totals.absence_hours,
        "lateCount": totals.late_count,
        "unjustifiedCount": totals.unjustified_count,
        "justifiedCount": totals.justified_count,
    })
}

fn trainee_summary(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let trainee_id = get_required_str(params, "traineeId")?;

    let head: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT t.last_name, t.first_name, t.group_id, g.name
             FROM trainees t
             JOIN groups g ON g.id = t.group_id
             WHERE t.id = ?",
            [&trainee_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some((last_name, first_name, group_id, group_name)) = head else {
        return Err(HandlerErr::not_found("trainee not found"));
    };

    let totals = trainee_totals(conn, &trainee_id)?;
    let discipline = calc::disciplinary_breakdown(totals.absence_hours, totals.late_count);

    Ok(json!({
        "trainee": {
            "id": trainee_id,
            "lastName": last_name,
            "firstName": first_name,
            "fullName": format!("{} {}", last_name, first_name),
            "groupId": group_id,
            "groupName": group_name,
        },
        "totals": totals_json(&totals),
        "discipline": discipline,
    }))
}

fn group_summary(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let group_id = get_required_str(params, "groupId")?;

    let group_name: Option<String> = conn
        .query_row("SELECT name FROM groups WHERE id = ?", [&group_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some(group_name) = group_name else {
        return Err(HandlerErr::not_found("group not found"));
    };

    let mut stmt = conn
        .prepare(
            "SELECT t.id, t.last_name, t.first_name,
               COALESCE((SELECT SUM(a.hours) FROM trainee_absences a
                          WHERE a.trainee_id = t.id AND a.status = 'absent' AND a.justified = 0), 0),
               (SELECT COUNT(*) FROM trainee_absences a
                 WHERE a.trainee_id = t.id AND a.status = 'late'),
               (SELECT COUNT(*) FROM trainee_absences a
                 WHERE a.trainee_id = t.id AND a.status = 'absent' AND a.justified = 0),
               (SELECT COUNT(*) FROM trainee_absences a
                 WHERE a.trainee_id = t.id AND a.status = 'absent' AND a.justified = 1)
             FROM trainees t
             WHERE t.group_id = ?
             ORDER BY t.sort_order",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let rows = stmt
        .query_map([&group_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            let totals = AbsenceTotals {
                absence_hours: r.get(3)?,
                late_count: r.get(4)?,
                unjustified_count: r.get(5)?,
                justified_count: r.get(6)?,
            };
            Ok((r.get::<_, String>(0)?, last, first, totals))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let trainees: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(id, last, first, totals)| {
            let discipline = calc::disciplinary_breakdown(totals.absence_hours, totals.late_count);
            json!({
                "id": id,
                "lastName": last,
                "firstName": first,
                "fullName": format!("{} {}", last, first),
                "totals": totals_json(&totals),
                "discipline": discipline,
            })
        })
        .collect();

    Ok(json!({
        "group": { "id": group_id, "name": group_name },
        "trainees": trainees,
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
        "reports.traineeSummary" => Some(with_db(state, req, trainee_summary)),
        "reports.groupSummary" => Some(with_db(state, req, group_summary)),
        _ => None,
    }
}
