//! Bulk user import: row normalisation, natural-key resolution and the
//! per-row planning shared by the dry run and the commit.

mod normalize;
mod plan;
mod resolver;
mod spreadsheet;
mod username;

pub use normalize::{ImportRow, normalize_yes_no, parse_class_name};
pub use plan::{Prepared, Planner, PlannerSavepoint, RowPlan, prepare_batch, validate_rows};
pub use resolver::{Directory, NaturalKey, Resolved, Resolver};
pub use spreadsheet::{ParsedSheet, parse_import_csv, parse_import_xlsx};
pub use username::{UsernameAllocator, username_base};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{AdminType, SpecialRole};

/// A spreadsheet cell as it arrives from a client: JSON booleans, numbers,
/// strings or (for managed classes) lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Flag(bool),
    Number(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl Cell {
    pub fn text(&self) -> String {
        match self {
            Cell::Flag(b) => b.to_string(),
            Cell::Number(n) => n.to_string(),
            Cell::Float(x) if x.fract() == 0.0 => format!("{x:.0}"),
            Cell::Float(x) => x.to_string(),
            Cell::Text(s) => s.trim().to_string(),
            Cell::List(items) => items.join(","),
        }
    }

    pub fn flag(&self) -> bool {
        match self {
            Cell::Flag(b) => *b,
            Cell::Number(n) => *n == 1,
            Cell::Float(x) => *x == 1.0,
            Cell::Text(s) => normalize_yes_no(s),
            Cell::List(_) => false,
        }
    }

    /// Comma-separated text or a list; empty entries dropped.
    pub fn items(&self) -> Vec<String> {
        let raw: Vec<String> = match self {
            Cell::List(items) => items.clone(),
            other => other.text().split(',').map(str::to_string).collect(),
        };
        raw.into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// One raw import row. Field names accept the spreadsheet's Hungarian headers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowInput {
    #[serde(default, alias = "vezetekNev", skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, alias = "keresztNev", skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, alias = "e_mail", skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, alias = "telefonszam", alias = "telefon", skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, alias = "stab", skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(default, alias = "kezdesEve", alias = "starting_year", skip_serializing_if = "Option::is_none")]
    pub start_year: Option<Cell>,
    #[serde(default, alias = "tagozat", alias = "department", skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, alias = "radio", alias = "radio_stab", skip_serializing_if = "Option::is_none")]
    pub radio_code: Option<String>,
    #[serde(default, alias = "gyartasvezeto", skip_serializing_if = "Option::is_none")]
    pub production_leader: Option<Cell>,
    #[serde(default, alias = "mediatana", skip_serializing_if = "Option::is_none")]
    pub media_teacher: Option<Cell>,
    #[serde(default, alias = "osztalyfonok", skip_serializing_if = "Option::is_none")]
    pub class_teacher: Option<Cell>,
    #[serde(default, alias = "osztalyai", alias = "classes", skip_serializing_if = "Option::is_none")]
    pub managed_classes: Option<Cell>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowErrorKind {
    MissingField,
    InvalidEmail,
    DuplicateInBatch,
    EmailExists,
    TooLong,
    WriteFailed,
}

/// Why a row cannot be imported. `row` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    pub row: usize,
    pub field: Option<&'static str>,
    pub kind: RowErrorKind,
    pub message: String,
}

/// Something odd about a row that still imports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowWarning {
    pub row: usize,
    pub field: Option<&'static str>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersonPreview {
    pub row: usize,
    pub username: String,
    pub full_name: String,
    pub email: String,
    pub admin_type: AdminType,
    pub special_role: SpecialRole,
    pub class: Option<String>,
    pub team: Option<String>,
    pub radio_team: Option<String>,
    pub managed_classes: Vec<String>,
}

/// Display names of entities, per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityNames {
    pub classes: Vec<String>,
    pub teams: Vec<String>,
    pub radio_teams: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedPreview {
    pub persons: Vec<PersonPreview>,
    #[serde(flatten)]
    pub entities: EntityNames,
}

/// Dry-run outcome. Pure function of the rows and the directory state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub total_rows: usize,
    pub valid_rows: usize,
    pub invalid_rows: usize,
    pub created_preview: CreatedPreview,
    pub reused: EntityNames,
    pub errors: Vec<RowError>,
    pub warnings: Vec<RowWarning>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RowOutcome {
    Created {
        row: usize,
        person_id: Ulid,
        username: String,
    },
    Failed {
        row: usize,
        errors: Vec<RowError>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportResult {
    pub total_rows: usize,
    pub created_users: usize,
    pub failed_rows: usize,
    pub created: EntityNames,
    pub reused: EntityNames,
    pub rows: Vec<RowOutcome>,
    pub errors: Vec<RowError>,
    pub warnings: Vec<RowWarning>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_input_accepts_hungarian_keys_and_mixed_cells() {
        let row: RowInput = serde_json::from_value(serde_json::json!({
            "vezetekNev": "Kiss",
            "keresztNev": "Anna",
            "email": "anna@school.hu",
            "kezdesEve": 2024,
            "tagozat": "f",
            "gyartasvezeto": "Igen",
            "mediatana": false,
            "osztalyai": ["2023A", "2022B"],
        }))
        .unwrap();
        assert_eq!(row.last_name.as_deref(), Some("Kiss"));
        assert_eq!(row.start_year, Some(Cell::Number(2024)));
        assert!(row.production_leader.as_ref().unwrap().flag());
        assert!(!row.media_teacher.as_ref().unwrap().flag());
        assert_eq!(row.managed_classes.unwrap().items(), vec!["2023A", "2022B"]);
    }

    #[test]
    fn cell_items_split_text() {
        assert_eq!(Cell::Text(" 2023A, ,2022B ".into()).items(), vec!["2023A", "2022B"]);
        assert!(Cell::Text(String::new()).items().is_empty());
    }
}
