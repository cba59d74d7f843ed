use std::collections::HashMap;

use ulid::Ulid;

use crate::model::is_valid_email;

use super::normalize::{ImportRow, normalize_row};
use super::resolver::{Directory, NaturalKey, Resolved, Resolver, Savepoint};
use super::username::{UsernameAllocator, username_base};
use super::{
    CreatedPreview, EntityNames, ImportReport, PersonPreview, RowError, RowErrorKind, RowInput,
    RowWarning,
};

/// A row after normalisation and the batch-wide duplicate check.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub row: usize,
    pub outcome: Result<ImportRow, Vec<RowError>>,
    pub warnings: Vec<RowWarning>,
}

/// Normalise every row and flag all occurrences of an email that appears
/// more than once (case-insensitive). Rows are numbered from 1.
pub fn prepare_batch(rows: &[RowInput]) -> Vec<Prepared> {
    let emails: Vec<Option<String>> = rows
        .iter()
        .map(|r| {
            r.email
                .as_deref()
                .map(|e| e.trim().to_lowercase())
                .filter(|e| is_valid_email(e))
        })
        .collect();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for email in emails.iter().flatten() {
        *counts.entry(email.as_str()).or_default() += 1;
    }

    rows.iter()
        .zip(&emails)
        .enumerate()
        .map(|(i, (input, email))| {
            let row = i + 1;
            let (mut outcome, warnings) = normalize_row(row, input);
            if let Some(email) = email
                && counts.get(email.as_str()).copied().unwrap_or(0) > 1
            {
                let dup = RowError {
                    row,
                    field: Some("email"),
                    kind: RowErrorKind::DuplicateInBatch,
                    message: format!("{email} appears more than once in this import"),
                };
                outcome = match outcome {
                    Ok(_) => Err(vec![dup]),
                    Err(mut errors) => {
                        errors.push(dup);
                        Err(errors)
                    }
                };
            }
            Prepared { row, outcome, warnings }
        })
        .collect()
}

/// Everything one valid row resolves to before anything is written.
#[derive(Debug, Clone)]
pub struct RowPlan {
    pub row: usize,
    pub input: ImportRow,
    pub username: String,
    pub class: Option<Resolved>,
    pub team: Option<Resolved>,
    pub radio_team: Option<Resolved>,
    pub managed_classes: Vec<Resolved>,
}

impl RowPlan {
    /// Class, team, radio team, then managed classes.
    pub fn resolutions(&self) -> impl Iterator<Item = &Resolved> {
        self.class
            .iter()
            .chain(self.team.iter())
            .chain(self.radio_team.iter())
            .chain(self.managed_classes.iter())
    }

    pub fn preview(&self) -> PersonPreview {
        let name = |r: &Option<Resolved>| r.as_ref().map(|r| r.key.display_name());
        PersonPreview {
            row: self.row,
            username: self.username.clone(),
            full_name: self.input.full_name(),
            email: self.input.email.clone(),
            admin_type: self.input.admin_type(),
            special_role: self.input.special_role(),
            class: name(&self.class),
            team: name(&self.team),
            radio_team: name(&self.radio_team),
            managed_classes: self
                .managed_classes
                .iter()
                .map(|r| r.key.display_name())
                .collect(),
        }
    }
}

/// Row-by-row planner carrying the batch's resolver cache and issued usernames.
pub struct Planner<'a, D: Directory + ?Sized> {
    dir: &'a D,
    resolver: Resolver<'a, D>,
    usernames: UsernameAllocator<'a, D>,
}

#[derive(Debug, Clone, Copy)]
pub struct PlannerSavepoint {
    resolver: Savepoint,
    usernames: usize,
}

fn entity_names(entries: &[(NaturalKey, Ulid)]) -> EntityNames {
    let mut names = EntityNames::default();
    for (key, _) in entries {
        let list = match key {
            NaturalKey::Class { .. } => &mut names.classes,
            NaturalKey::Team(_) => &mut names.teams,
            NaturalKey::RadioTeam { .. } => &mut names.radio_teams,
        };
        list.push(key.display_name());
    }
    names
}

impl<'a, D: Directory + ?Sized> Planner<'a, D> {
    pub fn new(dir: &'a D) -> Self {
        Self {
            dir,
            resolver: Resolver::new(dir),
            usernames: UsernameAllocator::new(dir),
        }
    }

    pub fn plan_row(&mut self, row: usize, input: ImportRow) -> Result<RowPlan, Vec<RowError>> {
        if self.dir.email_taken(&input.email) {
            return Err(vec![RowError {
                row,
                field: Some("email"),
                kind: RowErrorKind::EmailExists,
                message: format!("a user with email {} already exists", input.email),
            }]);
        }
        let username = self.usernames.allocate(&username_base(&input.email));
        let class = input.class.clone().map(|(start_year, section)| {
            self.resolver
                .resolve(NaturalKey::Class { start_year, section })
        });
        let team = input
            .team
            .clone()
            .map(|name| self.resolver.resolve(NaturalKey::Team(name)));
        let radio_team = match (input.start_year, &input.radio_code) {
            (Some(start_year), Some(code)) => Some(self.resolver.resolve(NaturalKey::RadioTeam {
                start_year,
                code: code.clone(),
            })),
            _ => None,
        };
        let managed_classes = input
            .managed_classes
            .iter()
            .map(|(start_year, section)| {
                self.resolver.resolve(NaturalKey::Class {
                    start_year: *start_year,
                    section: section.clone(),
                })
            })
            .collect();
        Ok(RowPlan {
            row,
            input,
            username,
            class,
            team,
            radio_team,
            managed_classes,
        })
    }

    pub fn savepoint(&self) -> PlannerSavepoint {
        PlannerSavepoint {
            resolver: self.resolver.savepoint(),
            usernames: self.usernames.savepoint(),
        }
    }

    pub fn rollback(&mut self, sp: PlannerSavepoint) {
        self.resolver.rollback(sp.resolver);
        self.usernames.rollback(sp.usernames);
    }

    /// `(created, reused)` display names, first appearance order.
    pub fn entity_names(&self) -> (EntityNames, EntityNames) {
        (
            entity_names(self.resolver.created()),
            entity_names(self.resolver.reused()),
        )
    }
}

/// Dry run: the report a commit of `rows` would produce against `dir` now.
pub fn validate_rows<D: Directory + ?Sized>(dir: &D, rows: &[RowInput]) -> ImportReport {
    let mut planner = Planner::new(dir);
    let mut persons = Vec::new();
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for prepared in prepare_batch(rows) {
        let row = prepared.row;
        warnings.extend(prepared.warnings);
        match prepared
            .outcome
            .and_then(|input| planner.plan_row(row, input))
        {
            Ok(plan) => persons.push(plan.preview()),
            Err(row_errors) => errors.extend(row_errors),
        }
    }

    let (created, reused) = planner.entity_names();
    ImportReport {
        total_rows: rows.len(),
        valid_rows: persons.len(),
        invalid_rows: rows.len() - persons.len(),
        created_preview: CreatedPreview {
            persons,
            entities: created,
        },
        reused,
        errors,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::resolver::tests::FakeDirectory;

    fn row(last: &str, first: &str, email: &str) -> RowInput {
        RowInput {
            last_name: Some(last.into()),
            first_name: Some(first.into()),
            email: Some(email.into()),
            phone: Some("+36 1 234 5678".into()),
            ..Default::default()
        }
    }

    fn with_team(mut r: RowInput, team: &str) -> RowInput {
        r.team = Some(team.into());
        r
    }

    #[test]
    fn scenario_new_and_existing_entities() {
        let mut dir = FakeDirectory::default();
        dir.classes.insert((2024, "F".into()), Ulid::new());
        let mut r = row("Kiss", "Anna", "anna@x.hu");
        r.start_year = Some(crate::import::Cell::Number(2024));
        r.section = Some("F".into());
        r.team = Some("A".into());

        let report = validate_rows(&dir, &[r]);
        assert_eq!(report.valid_rows, 1);
        assert_eq!(report.created_preview.persons.len(), 1);
        assert_eq!(report.created_preview.persons[0].username, "anna");
        assert_eq!(report.created_preview.entities.teams, vec!["A"]);
        assert!(report.created_preview.entities.classes.is_empty());
        assert_eq!(report.reused.classes, vec!["2024F"]);
    }

    #[test]
    fn scenario_batch_duplicate_email_flags_every_occurrence() {
        let dir = FakeDirectory::default();
        let rows = vec![
            row("Kiss", "Anna", "a@x.hu"),
            row("Nagy", "Béla", "b@x.hu"),
            row("Kiss", "Anna", "A@x.hu"),
        ];
        let report = validate_rows(&dir, &rows);
        assert_eq!(report.valid_rows, 1);
        assert_eq!(report.invalid_rows, 2);
        let flagged: Vec<_> = report
            .errors
            .iter()
            .filter(|e| e.kind == RowErrorKind::DuplicateInBatch)
            .map(|e| e.row)
            .collect();
        assert_eq!(flagged, vec![1, 3]);
        assert!(report.created_preview.persons.iter().all(|p| p.email != "a@x.hu"));
    }

    #[test]
    fn persisted_email_is_a_row_error() {
        let mut dir = FakeDirectory::default();
        dir.emails.insert("b@x.hu".into());
        let rows = vec![row("A", "A", "a@x.hu"), row("B", "B", "B@x.hu"), row("C", "C", "c@x.hu")];
        let report = validate_rows(&dir, &rows);
        assert_eq!(report.valid_rows, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].row, 2);
        assert_eq!(report.errors[0].kind, RowErrorKind::EmailExists);
    }

    #[test]
    fn same_new_team_is_created_once() {
        let dir = FakeDirectory::default();
        let rows = vec![
            with_team(row("A", "A", "a@x.hu"), "Stáb 1"),
            with_team(row("B", "B", "b@x.hu"), "Stáb 1"),
        ];
        let report = validate_rows(&dir, &rows);
        assert_eq!(report.created_preview.entities.teams, vec!["Stáb 1"]);
        assert!(report
            .created_preview
            .persons
            .iter()
            .all(|p| p.team.as_deref() == Some("Stáb 1")));
    }

    #[test]
    fn usernames_collide_in_input_order_over_valid_rows() {
        let mut dir = FakeDirectory::default();
        dir.usernames.insert("anna".into());
        let rows = vec![
            row("A", "Anna", "anna@x.hu"),
            row("", "Anna", "anna@y.hu"),
            row("C", "Anna", "anna@z.hu"),
        ];
        let report = validate_rows(&dir, &rows);
        let names: Vec<_> = report
            .created_preview
            .persons
            .iter()
            .map(|p| p.username.as_str())
            .collect();
        assert_eq!(names, vec!["anna2", "anna3"]);
    }

    #[test]
    fn validation_is_idempotent() {
        let dir = FakeDirectory::default();
        let rows = vec![
            with_team(row("A", "A", "a@x.hu"), "T"),
            row("B", "B", "bad-email"),
        ];
        assert_eq!(validate_rows(&dir, &rows), validate_rows(&dir, &rows));
    }

    #[test]
    fn planner_rollback_releases_username_and_entities() {
        let dir = FakeDirectory::default();
        let mut planner = Planner::new(&dir);
        let first = prepare_batch(&[with_team(row("A", "A", "a@x.hu"), "T")]);
        let input = first[0].outcome.clone().unwrap();

        let sp = planner.savepoint();
        let plan = planner.plan_row(1, input.clone()).unwrap();
        assert!(plan.team.as_ref().unwrap().created);
        planner.rollback(sp);

        let again = planner.plan_row(1, input).unwrap();
        assert_eq!(again.username, "a");
        assert!(again.team.unwrap().created);
        assert_eq!(planner.entity_names().0.teams, vec!["T"]);
    }
}
