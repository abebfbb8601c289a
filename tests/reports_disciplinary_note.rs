mod test_support;

use serde_json::json;
use test_support::{request_ok, spawn_sidecar, temp_dir};

#[test]
fn note_deducts_for_absence_hours_and_late_arrivals() {
    let workspace = temp_dir("absenced-reports-note");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let group_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "groups.create",
        json!({ "name": "2B" }),
    )
    .get("groupId")
    .and_then(|v| v.as_str())
    .expect("groupId")
    .to_string();

    let trainee_id = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "trainees.create",
        json!({ "groupId": group_id, "lastName": "Alaoui", "firstName": "Yassine" }),
    )
    .get("traineeId")
    .and_then(|v| v.as_str())
    .expect("traineeId")
    .to_string();

    // One 4h unjustified absence: 5 charged hours.
    let session = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "sessions.create",
        json!({
            "groupId": group_id,
            "teacher": "M. Tazi",
            "date": "2025-03-03",
            "startsAt": "08:00",
            "endsAt": "12:00",
            "entries": [{ "traineeId": trainee_id, "status": "absent" }]
        }),
    );
    let absence_id = session
        .pointer("/entries/0/absenceId")
        .and_then(|v| v.as_str())
        .expect("absenceId")
        .to_string();

    // Four late arrivals: one full point.
    for day in 4..8 {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("5-{}", day),
            "sessions.create",
            json!({
                "groupId": group_id,
                "teacher": "M. Tazi",
                "date": format!("2025-03-{:02}", day),
                "startsAt": "08:00",
                "endsAt": "10:00",
                "entries": [{ "traineeId": trainee_id, "status": "late" }]
            }),
        );
    }

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "reports.traineeSummary",
        json!({ "traineeId": trainee_id }),
    );
    assert_eq!(
        summary.pointer("/totals/absenceHours").and_then(|v| v.as_f64()),
        Some(5.0)
    );
    assert_eq!(
        summary.pointer("/totals/lateCount").and_then(|v| v.as_i64()),
        Some(4)
    );
    assert_eq!(
        summary.pointer("/totals/unjustifiedCount").and_then(|v| v.as_i64()),
        Some(1)
    );
    assert_eq!(
        summary.pointer("/discipline/absenceDeduction").and_then(|v| v.as_f64()),
        Some(1.0)
    );
    assert_eq!(
        summary.pointer("/discipline/latenessDeduction").and_then(|v| v.as_f64()),
        Some(1.0)
    );
    assert_eq!(
        summary.pointer("/discipline/note").and_then(|v| v.as_f64()),
        Some(18.0)
    );

    // Justifying the absence removes its deduction but keeps the lates.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "absences.setJustified",
        json!({ "absenceId": absence_id, "justified": true }),
    );
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "reports.traineeSummary",
        json!({ "traineeId": trainee_id }),
    );
    assert_eq!(
        summary.pointer("/totals/absenceHours").and_then(|v| v.as_f64()),
        Some(0.0)
    );
    assert_eq!(
        summary.pointer("/totals/justifiedCount").and_then(|v| v.as_i64()),
        Some(1)
    );
    assert_eq!(
        summary.pointer("/discipline/note").and_then(|v| v.as_f64()),
        Some(19.0)
    );

    let group = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "reports.groupSummary",
        json!({ "groupId": group_id }),
    );
    let rows = group.get("trainees").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].pointer("/discipline/note").and_then(|v| v.as_f64()),
        Some(19.0)
    );
}

#[test]
fn note_floors_at_zero_no_matter_the_backlog() {
    let workspace = temp_dir("absenced-reports-floor");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let group_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "groups.create",
        json!({ "name": "3C" }),
    )
    .get("groupId")
    .and_then(|v| v.as_str())
    .expect("groupId")
    .to_string();
    let trainee_id = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "trainees.create",
        json!({ "groupId": group_id, "lastName": "Benani", "firstName": "Sara" }),
    )
    .get("traineeId")
    .and_then(|v| v.as_str())
    .expect("traineeId")
    .to_string();

    // 25 full-day absences: 125 charged hours, far past the 100h that
    // would already zero the note.
    for i in 0..25 {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("4-{}", i),
            "sessions.create",
            json!({
                "groupId": group_id,
                "teacher": "Mme Idrissi",
                "date": format!("2025-{:02}-{:02}", 4 + i / 20, 1 + i % 20),
                "startsAt": "08:30",
                "endsAt": "16:30",
                "entries": [{ "traineeId": trainee_id, "status": "absent" }]
            }),
        );
    }

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "reports.traineeSummary",
        json!({ "traineeId": trainee_id }),
    );
    assert_eq!(
        summary.pointer("/totals/absenceHours").and_then(|v| v.as_f64()),
        Some(125.0)
    );
    assert_eq!(
        summary.pointer("/discipline/note").and_then(|v| v.as_f64()),
        Some(0.0)
    );
}
