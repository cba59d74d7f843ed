use serde::Serialize;
use ulid::Ulid;

use crate::import::{
    ImportReport, ImportResult, NaturalKey, ParsedSheet, Planner, RowError, RowErrorKind, RowInput, RowOutcome,
    RowPlan, parse_import_csv, parse_import_xlsx, prepare_batch, validate_rows,
};
use crate::limits::MAX_IMPORT_ROWS;
use crate::model::*;
use crate::notification::{self, templates};
use crate::observability::IMPORT_ROWS_TOTAL;

use super::{Engine, EngineError};

/// Rows parsed from an uploaded file together with the dry-run report for them.
#[derive(Debug, Clone, Serialize)]
pub struct ImportPreview {
    pub rows: Vec<RowInput>,
    pub file_warnings: Vec<String>,
    pub report: ImportReport,
}

fn check_batch(rows: &[RowInput]) -> Result<(), EngineError> {
    if rows.len() > MAX_IMPORT_ROWS {
        return Err(EngineError::LimitExceeded("too many import rows"));
    }
    Ok(())
}

/// The person a planned row creates and the single atomic record that
/// writes it together with every entity the row mints.
fn row_event(plan: &RowPlan, school_year: i32) -> (Person, Event) {
    let mut events: Vec<Event> = plan
        .resolutions()
        .filter(|r| r.created)
        .map(|r| match &r.key {
            NaturalKey::Class { start_year, section } => Event::ClassCreated {
                class: SchoolClass {
                    id: r.id,
                    start_year: *start_year,
                    section: section.clone(),
                    school_year,
                    teachers: Vec::new(),
                },
            },
            NaturalKey::Team(name) => Event::TeamCreated {
                team: Team { id: r.id, name: name.clone() },
            },
            NaturalKey::RadioTeam { start_year, code } => Event::RadioTeamCreated {
                radio_team: RadioTeam {
                    id: r.id,
                    start_year: *start_year,
                    code: code.clone(),
                },
            },
        })
        .collect();

    let input = &plan.input;
    let person = Person {
        id: Ulid::new(),
        username: plan.username.clone(),
        email: input.email.clone(),
        first_name: input.first_name.clone(),
        last_name: input.last_name.clone(),
        phone: input.phone.clone(),
        admin_type: input.admin_type(),
        special_role: input.special_role(),
        active: true,
        class_id: plan.class.as_ref().map(|r| r.id),
        team_id: plan.team.as_ref().map(|r| r.id),
        radio_team_id: plan.radio_team.as_ref().map(|r| r.id),
    };
    events.push(Event::PersonCreated { person: person.clone() });

    let mut taught: Vec<Ulid> = plan.managed_classes.iter().map(|r| r.id).collect();
    if input.class_teacher
        && let Some(own) = &plan.class
        && !taught.contains(&own.id)
    {
        taught.push(own.id);
    }
    events.extend(taught.into_iter().map(|class_id| Event::ClassTeacherAdded {
        class_id,
        person_id: person.id,
    }));

    (person, Event::Atomic { events })
}

fn count_row(outcome: &'static str) {
    metrics::counter!(IMPORT_ROWS_TOTAL, "outcome" => outcome).increment(1);
}

impl Engine {
    /// Dry run against the current directory. Writes nothing.
    pub fn validate_import(&self, rows: &[RowInput]) -> Result<ImportReport, EngineError> {
        check_batch(rows)?;
        Ok(validate_rows(&self.directory, rows))
    }

    /// Import `rows` in order. Each valid row is written as one atomic WAL
    /// record; a failing row leaves no trace and does not stop the batch.
    pub async fn commit_import(
        &self,
        rows: &[RowInput],
        send_emails: bool,
    ) -> Result<ImportResult, EngineError> {
        check_batch(rows)?;
        let _directory = self.directory_lock.lock().await;
        let school_year = school_year_of(chrono::Local::now().date_naive());

        let mut planner = Planner::new(&self.directory);
        let mut outcomes = Vec::with_capacity(rows.len());
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut created_users = 0;

        for prepared in prepare_batch(rows) {
            let row = prepared.row;
            warnings.extend(prepared.warnings);

            let savepoint = planner.savepoint();
            let planned = prepared
                .outcome
                .and_then(|input| planner.plan_row(row, input));
            let plan = match planned {
                Ok(plan) => plan,
                Err(row_errors) => {
                    planner.rollback(savepoint);
                    count_row("failed");
                    errors.extend(row_errors.iter().cloned());
                    outcomes.push(RowOutcome::Failed { row, errors: row_errors });
                    continue;
                }
            };

            let (person, event) = row_event(&plan, school_year);
            if let Err(e) = self.commit(&mut [], &event).await {
                planner.rollback(savepoint);
                count_row("failed");
                tracing::warn!(row, email = %person.email, "import row not written: {e}");
                let error = RowError {
                    row,
                    field: None,
                    kind: RowErrorKind::WriteFailed,
                    message: e.to_string(),
                };
                errors.push(error.clone());
                outcomes.push(RowOutcome::Failed { row, errors: vec![error] });
                continue;
            }

            created_users += 1;
            count_row("created");
            if send_emails {
                let to = notification::recipients([&person]);
                self.outbox
                    .enqueue(templates::first_login(&person, &self.login_url, to));
            }
            outcomes.push(RowOutcome::Created {
                row,
                person_id: person.id,
                username: person.username,
            });
        }

        let (created, reused) = planner.entity_names();
        let failed_rows = rows.len() - created_users;
        tracing::info!(
            rows = rows.len(),
            created_users,
            failed_rows,
            classes = created.classes.len(),
            teams = created.teams.len(),
            radio_teams = created.radio_teams.len(),
            "import committed"
        );
        Ok(ImportResult {
            total_rows: rows.len(),
            created_users,
            failed_rows,
            created,
            reused,
            rows: outcomes,
            errors,
            warnings,
        })
    }

    /// Parse an uploaded CSV and dry-run it.
    pub fn preview_import_csv(&self, content: &str) -> Result<ImportPreview, EngineError> {
        self.preview(parse_import_csv(content)?)
    }

    /// Same as [`Engine::preview_import_csv`] for the first sheet of an XLSX workbook.
    pub fn preview_import_xlsx(&self, bytes: &[u8]) -> Result<ImportPreview, EngineError> {
        self.preview(parse_import_xlsx(bytes)?)
    }

    fn preview(&self, parsed: ParsedSheet) -> Result<ImportPreview, EngineError> {
        let report = self.validate_import(&parsed.rows)?;
        Ok(ImportPreview {
            rows: parsed.rows,
            file_warnings: parsed.warnings,
            report,
        })
    }
}
