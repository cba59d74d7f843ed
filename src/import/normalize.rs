use crate::limits::{MAX_MANAGED_CLASSES, MAX_NAME_LEN};
use crate::model::{AdminType, SpecialRole, is_valid_email};

use super::{Cell, RowError, RowErrorKind, RowInput, RowWarning};

const MIN_START_YEAR: i32 = 1900;
const MAX_START_YEAR: i32 = 2200;

/// A validated import row: trimmed, case-normalised, flags resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRow {
    pub last_name: String,
    pub first_name: String,
    /// Lower-case.
    pub email: String,
    pub phone: Option<String>,
    pub team: Option<String>,
    pub start_year: Option<i32>,
    /// `(start_year, SECTION)`.
    pub class: Option<(i32, String)>,
    /// Upper-case; only kept when a start year is present.
    pub radio_code: Option<String>,
    pub production_leader: bool,
    pub media_teacher: bool,
    pub class_teacher: bool,
    /// Only kept for class teachers.
    pub managed_classes: Vec<(i32, String)>,
}

impl ImportRow {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.last_name, self.first_name)
    }

    pub fn admin_type(&self) -> AdminType {
        if self.media_teacher { AdminType::Teacher } else { AdminType::None }
    }

    pub fn special_role(&self) -> SpecialRole {
        if self.production_leader {
            SpecialRole::ProductionLeader
        } else {
            SpecialRole::None
        }
    }
}

/// `igen`, `yes`, `true` and `1` (any case) are true; everything else false.
pub fn normalize_yes_no(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "igen" | "yes" | "true" | "1"
    )
}

/// `"2023A"` → `(2023, "A")`. Four digits then letters; spaces ignored.
pub fn parse_class_name(value: &str) -> Option<(i32, String)> {
    let compact: String = value
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();
    if compact.len() < 5 || !compact.is_char_boundary(4) {
        return None;
    }
    let (year, section) = compact.split_at(4);
    if !year.chars().all(|c| c.is_ascii_digit())
        || !section.chars().all(|c| c.is_alphabetic())
    {
        return None;
    }
    Some((year.parse().ok()?, section.to_string()))
}

fn parse_start_year(cell: &Cell) -> Option<i32> {
    let text = cell.text();
    let year = text
        .parse::<i32>()
        .ok()
        .or_else(|| {
            text.parse::<f64>()
                .ok()
                .filter(|y| y.fract() == 0.0)
                .map(|y| y as i32)
        })?;
    (MIN_START_YEAR..=MAX_START_YEAR)
        .contains(&year)
        .then_some(year)
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Whether every field of the row is blank.
pub(crate) fn is_blank(input: &RowInput) -> bool {
    let texts = [
        &input.last_name,
        &input.first_name,
        &input.email,
        &input.phone,
        &input.team,
        &input.section,
        &input.radio_code,
    ];
    let cells = [
        &input.start_year,
        &input.production_leader,
        &input.media_teacher,
        &input.class_teacher,
        &input.managed_classes,
    ];
    texts.iter().all(|t| clean(t).is_none())
        && cells.iter().all(|c| match c {
            Some(cell) => cell.text().is_empty(),
            None => true,
        })
}

/// Normalise one row. Errors make the row invalid; warnings never do.
pub(crate) fn normalize_row(
    row: usize,
    input: &RowInput,
) -> (Result<ImportRow, Vec<RowError>>, Vec<RowWarning>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut warn = |field: &'static str, message: String| {
        warnings.push(RowWarning { row, field: Some(field), message });
    };

    let mut required = |field: &'static str, value: &Option<String>| -> String {
        match clean(value) {
            None => {
                errors.push(RowError {
                    row,
                    field: Some(field),
                    kind: RowErrorKind::MissingField,
                    message: format!("{field} is required"),
                });
                String::new()
            }
            Some(v) if v.len() > MAX_NAME_LEN => {
                errors.push(RowError {
                    row,
                    field: Some(field),
                    kind: RowErrorKind::TooLong,
                    message: format!("{field} is longer than {MAX_NAME_LEN} bytes"),
                });
                String::new()
            }
            Some(v) => v,
        }
    };
    let last_name = required("last_name", &input.last_name);
    let first_name = required("first_name", &input.first_name);
    let email = required("email", &input.email).to_lowercase();
    if !email.is_empty() && !is_valid_email(&email) {
        errors.push(RowError {
            row,
            field: Some("email"),
            kind: RowErrorKind::InvalidEmail,
            message: format!("not a valid email address: {email}"),
        });
    }

    let phone = clean(&input.phone);
    if phone.is_none() {
        warn("phone", "phone number missing".into());
    }

    let start_year = match &input.start_year {
        Some(cell) if !cell.text().is_empty() => {
            let parsed = parse_start_year(cell);
            if parsed.is_none() {
                warn("start_year", format!("unparsable start year: {}", cell.text()));
            }
            parsed
        }
        _ => None,
    };

    let section = clean(&input.section).map(|s| s.to_uppercase());
    let class = match (start_year, section) {
        (Some(year), Some(section)) => Some((year, section)),
        (None, Some(section)) => {
            warn("section", format!("section {section} ignored without a start year"));
            None
        }
        _ => None,
    };

    let radio_code = match (clean(&input.radio_code).map(|c| c.to_uppercase()), start_year) {
        (Some(code), Some(_)) => Some(code),
        (Some(code), None) => {
            warn("radio_code", format!("radio code {code} ignored without a start year"));
            None
        }
        (None, _) => None,
    };

    let flag = |cell: &Option<Cell>| cell.as_ref().is_some_and(Cell::flag);
    let class_teacher = flag(&input.class_teacher);

    let mut managed_classes = Vec::new();
    let listed = input
        .managed_classes
        .as_ref()
        .map(Cell::items)
        .unwrap_or_default();
    if !listed.is_empty() && !class_teacher {
        warn(
            "managed_classes",
            "managed classes ignored: row is not marked as class teacher".into(),
        );
    } else {
        for name in listed {
            match parse_class_name(&name) {
                Some(key) if !managed_classes.contains(&key) => managed_classes.push(key),
                Some(_) => {}
                None => warn("managed_classes", format!("unparsable class name: {name}")),
            }
        }
        if managed_classes.len() > MAX_MANAGED_CLASSES {
            warn("managed_classes", format!("only the first {MAX_MANAGED_CLASSES} managed classes are kept"));
            managed_classes.truncate(MAX_MANAGED_CLASSES);
        }
    }

    if !errors.is_empty() {
        return (Err(errors), warnings);
    }
    let normalized = ImportRow {
        last_name,
        first_name,
        email,
        phone,
        team: clean(&input.team),
        start_year,
        class,
        radio_code,
        production_leader: flag(&input.production_leader),
        media_teacher: flag(&input.media_teacher),
        class_teacher,
        managed_classes,
    };
    (Ok(normalized), warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> RowInput {
        RowInput {
            last_name: Some(" Kiss ".into()),
            first_name: Some("Anna".into()),
            email: Some("Anna.Kiss@School.hu".into()),
            phone: Some("+36 30 123 4567".into()),
            ..Default::default()
        }
    }

    #[test]
    fn yes_no_values() {
        for yes in ["igen", "IGEN", "Yes", "true", "1", " igen "] {
            assert!(normalize_yes_no(yes), "{yes}");
        }
        for no in ["nem", "no", "false", "0", "", "x"] {
            assert!(!normalize_yes_no(no), "{no}");
        }
    }

    #[test]
    fn class_names() {
        assert_eq!(parse_class_name("2023A"), Some((2023, "A".into())));
        assert_eq!(parse_class_name("2024 nyf"), Some((2024, "NYF".into())));
        assert_eq!(parse_class_name("23A"), None);
        assert_eq!(parse_class_name("2023"), None);
        assert_eq!(parse_class_name("A2023"), None);
        assert_eq!(parse_class_name("2023A1"), None);
    }

    #[test]
    fn minimal_row_normalizes_with_phone_present() {
        let (row, warnings) = normalize_row(1, &input());
        let row = row.unwrap();
        assert_eq!(row.last_name, "Kiss");
        assert_eq!(row.email, "anna.kiss@school.hu");
        assert_eq!(row.admin_type(), AdminType::None);
        assert!(warnings.is_empty());
    }

    #[test]
    fn missing_required_fields_are_all_reported() {
        let (row, _) = normalize_row(4, &RowInput::default());
        let errors = row.unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.unwrap()).collect();
        assert_eq!(fields, vec!["last_name", "first_name", "email"]);
        assert!(errors.iter().all(|e| e.row == 4 && e.kind == RowErrorKind::MissingField));
    }

    #[test]
    fn invalid_email_is_an_error() {
        let mut i = input();
        i.email = Some("anna at school".into());
        let (row, _) = normalize_row(1, &i);
        assert_eq!(row.unwrap_err()[0].kind, RowErrorKind::InvalidEmail);
    }

    #[test]
    fn class_team_radio_and_flags() {
        let mut i = input();
        i.start_year = Some(Cell::Text("2024".into()));
        i.section = Some("f".into());
        i.team = Some("  A stáb ".into());
        i.radio_code = Some("a1".into());
        i.media_teacher = Some(Cell::Text("igen".into()));
        i.production_leader = Some(Cell::Flag(true));
        let row = normalize_row(1, &i).0.unwrap();
        assert_eq!(row.class, Some((2024, "F".into())));
        assert_eq!(row.team.as_deref(), Some("A stáb"));
        assert_eq!(row.radio_code.as_deref(), Some("A1"));
        assert_eq!(row.admin_type(), AdminType::Teacher);
        assert_eq!(row.special_role(), SpecialRole::ProductionLeader);
    }

    #[test]
    fn soft_problems_are_warnings() {
        let mut i = input();
        i.phone = None;
        i.start_year = Some(Cell::Text("tavaly".into()));
        i.section = Some("B".into());
        i.radio_code = Some("B2".into());
        i.managed_classes = Some(Cell::Text("2023A".into()));
        let (row, warnings) = normalize_row(2, &i);
        let row = row.unwrap();
        assert_eq!(row.class, None);
        assert_eq!(row.radio_code, None);
        assert!(row.managed_classes.is_empty());
        let fields: Vec<_> = warnings.iter().map(|w| w.field.unwrap()).collect();
        assert_eq!(fields, vec!["phone", "start_year", "section", "radio_code", "managed_classes"]);
    }

    #[test]
    fn managed_classes_for_class_teacher() {
        let mut i = input();
        i.class_teacher = Some(Cell::Text("Igen".into()));
        i.managed_classes = Some(Cell::Text("2023A, 2022b, nonsense, 2023A".into()));
        let (row, warnings) = normalize_row(1, &i);
        let row = row.unwrap();
        assert_eq!(row.managed_classes, vec![(2023, "A".into()), (2022, "B".into())]);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("nonsense"));
    }

    #[test]
    fn spreadsheet_float_year_is_accepted() {
        let mut i = input();
        i.start_year = Some(Cell::Float(2024.0));
        i.section = Some("C".into());
        assert_eq!(normalize_row(1, &i).0.unwrap().class, Some((2024, "C".into())));
    }

    #[test]
    fn blank_detection() {
        assert!(is_blank(&RowInput::default()));
        assert!(is_blank(&RowInput {
            last_name: Some("   ".into()),
            class_teacher: Some(Cell::Text(String::new())),
            ..Default::default()
        }));
        assert!(!is_blank(&input()));
    }
}
