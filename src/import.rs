use std::path::Path;

use anyhow::anyhow;
use tracing::warn;

/// Fixed column layout of the roster spreadsheet.
///
/// The positions are the contract: the importer reads by index, not by
/// header name, so reordering columns in the source workbook breaks it.
pub mod columns {
    pub const LAST_NAME: usize = 2;
    pub const FIRST_NAME: usize = 3;
    pub const GROUP: usize = 4;
    /// Legacy absence-hours field. The format still reserves the column but
    /// the importer ignores its value: imported trainees start at zero.
    pub const LEGACY_HOURS: usize = 14;
    pub const MIN_ROW_WIDTH: usize = LEGACY_HOURS + 1;
}

/// Placeholder strings that mark non-trainee rows in real workbooks:
/// repeated header lines and vacation filler rows.
const DEFAULT_DENYLIST: &[&str] = &[
    "Nom Prénom",
    "NOM PRENOM",
    "Vacances",
    "VACANCES",
    "Groupe",
    "GROUPE",
    "Classe",
];

const DENYLIST_FILE: &str = "import_denylist.json";

/// Exact-match exclusion list for full names and group labels.
///
/// Workspaces can override the built-in entries by dropping an
/// `import_denylist.json` (a JSON array of strings) next to the database.
#[derive(Debug, Clone)]
pub struct Denylist {
    entries: Vec<String>,
}

impl Denylist {
    pub fn default_entries() -> Self {
        Self {
            entries: DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[allow(dead_code)]
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    /// Best-effort load from the workspace; a missing or malformed override
    /// file falls back to the built-in entries.
    pub fn load(workspace: &Path) -> Self {
        let path = workspace.join(DENYLIST_FILE);
        let Ok(text) = std::fs::read_to_string(&path) else {
            return Self::default_entries();
        };
        match serde_json::from_str::<Vec<String>>(&text) {
            Ok(entries) => Self { entries },
            Err(e) => {
                warn!(file = %path.to_string_lossy(), error = %e, "ignoring malformed denylist override");
                Self::default_entries()
            }
        }
    }

    pub fn contains(&self, s: &str) -> bool {
        self.entries.iter().any(|e| e == s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterCandidate {
    pub last_name: String,
    pub first_name: String,
    pub group_label: String,
}

impl RosterCandidate {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.last_name, self.first_name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipCounts {
    pub too_short: usize,
    pub denylisted: usize,
    pub missing_fields: usize,
}

impl SkipCounts {
    pub fn total(&self) -> usize {
        self.too_short + self.denylisted + self.missing_fields
    }
}

#[derive(Debug, Clone)]
pub struct ParsedRoster {
    pub accepted: Vec<RosterCandidate>,
    pub skipped: SkipCounts,
}

/// Parse a decoded roster grid into trainee candidates.
///
/// The caller owns file decoding; this function only sees the 2-D grid of
/// cell values. Row-level problems (short rows, placeholder rows, missing
/// fields) are counted and skipped, never fatal. A value that is not a grid
/// at all is fatal: the whole import must abort without persisting anything.
pub fn parse_roster(grid: &serde_json::Value, denylist: &Denylist) -> anyhow::Result<ParsedRoster> {
    let Some(rows) = grid.as_array() else {
        return Err(anyhow!("roster grid must be an array of rows"));
    };

    let mut accepted: Vec<RosterCandidate> = Vec::new();
    let mut skipped = SkipCounts::default();

    for (row_idx, row) in rows.iter().enumerate() {
        let Some(cells) = row.as_array() else {
            return Err(anyhow!("roster row {} is not an array of cells", row_idx));
        };

        if cells.len() < columns::MIN_ROW_WIDTH {
            skipped.too_short += 1;
            continue;
        }

        let last_name = cell_text(cells.get(columns::LAST_NAME));
        let first_name = cell_text(cells.get(columns::FIRST_NAME));
        let group_label = cell_text(cells.get(columns::GROUP));

        let candidate = RosterCandidate {
            last_name,
            first_name,
            group_label,
        };

        if denylist.contains(&candidate.full_name()) || denylist.contains(&candidate.group_label) {
            skipped.denylisted += 1;
            continue;
        }

        if candidate.last_name.is_empty()
            || candidate.first_name.is_empty()
            || candidate.group_label.is_empty()
        {
            skipped.missing_fields += 1;
            continue;
        }

        accepted.push(candidate);
    }

    Ok(ParsedRoster { accepted, skipped })
}

/// Scalar cell coercion: strings are trimmed, numbers and booleans are
/// rendered, anything else (missing cells included) reads as empty.
fn cell_text(cell: Option<&serde_json::Value>) -> String {
    match cell {
        Some(serde_json::Value::String(s)) => s.trim().to_string(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(serde_json::Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(last: &str, first: &str, group: &str) -> serde_json::Value {
        // 15 cells with the three meaningful fields in place and a stale
        // value in the legacy hours column.
        let mut cells = vec![json!(""); columns::MIN_ROW_WIDTH];
        cells[columns::LAST_NAME] = json!(last);
        cells[columns::FIRST_NAME] = json!(first);
        cells[columns::GROUP] = json!(group);
        cells[columns::LEGACY_HOURS] = json!(12.5);
        json!(cells)
    }

    fn parse(rows: Vec<serde_json::Value>) -> ParsedRoster {
        parse_roster(&json!(rows), &Denylist::default_entries()).expect("parse")
    }

    #[test]
    fn accepts_well_formed_rows() {
        let parsed = parse(vec![row("Alaoui", "Yassine", "1A"), row("Benani", "Sara", "1A")]);
        assert_eq!(parsed.accepted.len(), 2);
        assert_eq!(parsed.skipped.total(), 0);
        assert_eq!(parsed.accepted[0].full_name(), "Alaoui Yassine");
        assert_eq!(parsed.accepted[0].group_label, "1A");
    }

    #[test]
    fn short_rows_are_skipped() {
        // 14 cells: one short of the reserved legacy column.
        let short = json!(vec![json!("x"); columns::MIN_ROW_WIDTH - 1]);
        let parsed = parse(vec![short, row("Benani", "Sara", "1A")]);
        assert_eq!(parsed.accepted.len(), 1);
        assert_eq!(parsed.skipped.too_short, 1);
    }

    #[test]
    fn denylisted_full_name_is_skipped() {
        let parsed = parse(vec![row("Nom", "Prénom", "1A")]);
        assert_eq!(parsed.accepted.len(), 0);
        assert_eq!(parsed.skipped.denylisted, 1);
    }

    #[test]
    fn denylisted_group_label_is_skipped() {
        let parsed = parse(vec![row("Alaoui", "Yassine", "Vacances")]);
        assert_eq!(parsed.accepted.len(), 0);
        assert_eq!(parsed.skipped.denylisted, 1);
    }

    #[test]
    fn missing_fields_are_skipped() {
        let parsed = parse(vec![
            row("", "Yassine", "1A"),
            row("Alaoui", "", "1A"),
            row("Alaoui", "Yassine", ""),
            row("  ", "Yassine", "1A"),
        ]);
        assert_eq!(parsed.accepted.len(), 0);
        assert_eq!(parsed.skipped.missing_fields, 4);
    }

    #[test]
    fn legacy_hours_column_is_ignored() {
        // The fixture row carries 12.5 in the legacy column; the candidate
        // model has no hours field at all, so nothing can leak through.
        let parsed = parse(vec![row("Alaoui", "Yassine", "1A")]);
        assert_eq!(parsed.accepted.len(), 1);
    }

    #[test]
    fn irregular_long_rows_are_fine() {
        let mut cells: Vec<serde_json::Value> = vec![json!(""); 40];
        cells[columns::LAST_NAME] = json!("Alaoui");
        cells[columns::FIRST_NAME] = json!("Yassine");
        cells[columns::GROUP] = json!("1A");
        let parsed = parse(vec![json!(cells)]);
        assert_eq!(parsed.accepted.len(), 1);
    }

    #[test]
    fn numeric_cells_are_rendered() {
        let mut cells = vec![json!(""); columns::MIN_ROW_WIDTH];
        cells[columns::LAST_NAME] = json!("Alaoui");
        cells[columns::FIRST_NAME] = json!("Yassine");
        cells[columns::GROUP] = json!(2024);
        let parsed = parse(vec![json!(cells)]);
        assert_eq!(parsed.accepted[0].group_label, "2024");
    }

    #[test]
    fn non_grid_input_is_fatal() {
        let denylist = Denylist::default_entries();
        assert!(parse_roster(&json!("not a grid"), &denylist).is_err());
        assert!(parse_roster(&json!([["ok"], "not a row"]), &denylist).is_err());
    }

    #[test]
    fn custom_denylist_overrides_defaults() {
        let denylist = Denylist::from_entries(["Alaoui Yassine"]);
        let parsed = parse_roster(&json!([row("Alaoui", "Yassine", "1A")]), &denylist)
            .expect("parse");
        assert_eq!(parsed.skipped.denylisted, 1);
        // And the built-in entries no longer apply.
        let parsed = parse_roster(&json!([row("Nom", "Prénom", "1A")]), &denylist).expect("parse");
        assert_eq!(parsed.accepted.len(), 1);
    }
}
