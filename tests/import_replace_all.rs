mod test_support;

use serde_json::json;
use test_support::{request_ok, roster_row, spawn_sidecar, temp_dir};

#[test]
fn replace_all_clears_roster_and_session_history() {
    let workspace = temp_dir("absenced-import-replace");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let old_batch = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "import.run",
        json!({ "rows": [roster_row("Alaoui", "Yassine", "1A")] }),
    );
    let old_batch_id = old_batch
        .get("batchId")
        .and_then(|v| v.as_str())
        .expect("batchId")
        .to_string();
    let trainee_id = old_batch
        .pointer("/imported/0/traineeId")
        .and_then(|v| v.as_str())
        .expect("traineeId")
        .to_string();
    let group_id = old_batch
        .pointer("/imported/0/groupId")
        .and_then(|v| v.as_str())
        .expect("groupId")
        .to_string();

    // Some recorded history on the old roster.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "sessions.create",
        json!({
            "groupId": group_id,
            "teacher": "M. Tazi",
            "date": "2025-03-10",
            "startsAt": "08:00",
            "endsAt": "12:00",
            "entries": [{ "traineeId": trainee_id, "status": "absent" }]
        }),
    );

    let replaced = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "import.replaceAll",
        json!({ "rows": [
            roster_row("Benani", "Sara", "1A"),
            roster_row("Cherkaoui", "Omar", "2B"),
        ]}),
    );
    assert_eq!(replaced.get("clearedCount").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(replaced.get("importedCount").and_then(|v| v.as_u64()), Some(2));

    let listed = request_ok(&mut stdin, &mut reader, "5", "trainees.list", json!({}));
    let names: Vec<String> = listed
        .get("trainees")
        .and_then(|v| v.as_array())
        .expect("trainees")
        .iter()
        .filter_map(|t| t.get("fullName").and_then(|v| v.as_str()).map(|s| s.to_string()))
        .collect();
    assert_eq!(
        names,
        vec!["Benani Sara".to_string(), "Cherkaoui Omar".to_string()]
    );

    // Session history went with the old roster.
    let sessions = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "sessions.list",
        json!({ "groupId": group_id }),
    );
    assert_eq!(
        sessions.get("sessions").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    // The pre-replace batch tag is gone with its rows.
    let cancelled = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "import.cancel",
        json!({ "batchId": old_batch_id }),
    );
    assert_eq!(
        cancelled.get("deletedCount").and_then(|v| v.as_u64()),
        Some(0)
    );

    // The replacing batch stays cancellable like any other.
    let new_batch_id = replaced
        .get("batchId")
        .and_then(|v| v.as_str())
        .expect("batchId")
        .to_string();
    let cancelled = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "import.cancel",
        json!({ "batchId": new_batch_id }),
    );
    assert_eq!(
        cancelled.get("deletedCount").and_then(|v| v.as_u64()),
        Some(2)
    );
}
