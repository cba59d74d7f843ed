use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedRwLockWriteGuard, oneshot};
use ulid::Ulid;

use crate::import::{Directory, UsernameAllocator, username_base};
use crate::limits::*;
use crate::model::*;
use crate::notification::{self, templates};
use crate::observability::{ASSIGNMENT_TRANSITIONS_TOTAL, BOOKING_CONFLICTS_TOTAL};
use crate::transition::{TransitionKind, detect_transition, roster_change};

use super::conflict::{ConflictScope, check_no_conflict, checked_span};
use super::{Engine, EngineError, WalCommand};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPerson {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    /// Derived from the email when absent.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub admin_type: AdminType,
    #[serde(default)]
    pub special_role: SpecialRole,
    #[serde(default)]
    pub class_id: Option<Ulid>,
    #[serde(default)]
    pub team_id: Option<Ulid>,
    #[serde(default)]
    pub radio_team_id: Option<Ulid>,
    #[serde(default)]
    pub send_welcome: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewEquipment {
    pub nickname: String,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub equipment_type: Option<String>,
    #[serde(default = "default_true")]
    pub functional: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewFilmingSession {
    pub name: String,
    #[serde(with = "local_ms")]
    pub start: Ms,
    #[serde(with = "local_ms")]
    pub end: Ms,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub equipment: Vec<Ulid>,
    #[serde(default)]
    pub participants: Vec<Ulid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRadioSession {
    #[serde(default)]
    pub radio_team_id: Option<Ulid>,
    /// Defaults to "<radio team> radio session".
    #[serde(default)]
    pub label: Option<String>,
    #[serde(with = "local_ms")]
    pub start: Ms,
    #[serde(with = "local_ms")]
    pub end: Ms,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub participants: Vec<Ulid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SavedAssignment {
    pub assignment: Assignment,
    pub transition: TransitionKind,
}

fn required_text(field: &'static str, value: &str, max: usize) -> Result<String, EngineError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EngineError::validation(field, "must not be empty"));
    }
    if value.len() > max {
        return Err(EngineError::LimitExceeded("text field too long"));
    }
    Ok(value.to_string())
}

fn optional_text(value: Option<String>, max: usize) -> Result<Option<String>, EngineError> {
    let Some(value) = value else { return Ok(None) };
    let value = value.trim();
    if value.len() > max {
        return Err(EngineError::LimitExceeded("text field too long"));
    }
    Ok((!value.is_empty()).then(|| value.to_string()))
}

fn check_capacity(guard: &SubjectState) -> Result<(), EngineError> {
    if guard.intervals.len() >= MAX_INTERVALS_PER_SUBJECT {
        return Err(EngineError::LimitExceeded("too many bookings on subject"));
    }
    Ok(())
}

fn record_conflict(result: Result<(), EngineError>, category: &'static str) -> Result<(), EngineError> {
    if let Err(EngineError::Conflict { subject, booking }) = &result {
        metrics::counter!(BOOKING_CONFLICTS_TOTAL, "category" => category).increment(1);
        tracing::debug!(%subject, %booking, category, "booking rejected: overlap");
    }
    result
}

impl Engine {
    // ── Directory ────────────────────────────────────────────

    pub async fn create_person(&self, input: NewPerson) -> Result<Person, EngineError> {
        let first_name = required_text("first_name", &input.first_name, MAX_NAME_LEN)?;
        let last_name = required_text("last_name", &input.last_name, MAX_NAME_LEN)?;
        let email = required_text("email", &input.email, MAX_NAME_LEN)?.to_lowercase();
        if !is_valid_email(&email) {
            return Err(EngineError::validation("email", format!("not a valid address: {email}")));
        }
        let phone = optional_text(input.phone, MAX_NAME_LEN)?;
        let requested_username = optional_text(input.username, MAX_NAME_LEN)?;

        let _directory = self.directory_lock.lock().await;
        if self.directory.email_taken(&email) {
            return Err(EngineError::Duplicate { field: "email", value: email });
        }
        let username = match requested_username {
            Some(u) if self.directory.username_taken(&u) => {
                return Err(EngineError::Duplicate { field: "username", value: u });
            }
            Some(u) => u,
            None => UsernameAllocator::new(&self.directory).allocate(&username_base(&email)),
        };
        if let Some(id) = input.class_id
            && self.directory.get_class(&id).is_none()
        {
            return Err(EngineError::NotFound(id));
        }
        if let Some(id) = input.team_id
            && self.directory.get_team(&id).is_none()
        {
            return Err(EngineError::NotFound(id));
        }
        if let Some(id) = input.radio_team_id
            && self.directory.get_radio_team(&id).is_none()
        {
            return Err(EngineError::NotFound(id));
        }

        let person = Person {
            id: Ulid::new(),
            username,
            email,
            first_name,
            last_name,
            phone,
            admin_type: input.admin_type,
            special_role: input.special_role,
            active: true,
            class_id: input.class_id,
            team_id: input.team_id,
            radio_team_id: input.radio_team_id,
        };
        self.commit(&mut [], &Event::PersonCreated { person: person.clone() })
            .await?;
        tracing::info!(person = %person.id, username = %person.username, "person created");

        if input.send_welcome {
            let to = notification::recipients([&person]);
            self.outbox
                .enqueue(templates::first_login(&person, &self.login_url, to));
        }
        Ok(person)
    }

    pub async fn set_person_active(&self, id: Ulid, active: bool) -> Result<Person, EngineError> {
        let _directory = self.directory_lock.lock().await;
        if self.directory.get_person(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        self.commit(&mut [], &Event::PersonActiveSet { id, active })
            .await?;
        self.directory.get_person(&id).ok_or(EngineError::NotFound(id))
    }

    pub async fn create_equipment(&self, input: NewEquipment) -> Result<Equipment, EngineError> {
        let equipment = Equipment {
            id: Ulid::new(),
            nickname: required_text("nickname", &input.nickname, MAX_NAME_LEN)?,
            serial_number: optional_text(input.serial_number, MAX_NAME_LEN)?,
            equipment_type: optional_text(input.equipment_type, MAX_NAME_LEN)?,
            functional: input.functional,
        };
        self.commit(&mut [], &Event::EquipmentCreated { equipment: equipment.clone() })
            .await?;
        Ok(equipment)
    }

    pub async fn set_equipment_functional(
        &self,
        id: Ulid,
        functional: bool,
    ) -> Result<Equipment, EngineError> {
        let mut guards = self.lock_subjects(&[id]).await?;
        if guards[0].kind != SubjectKind::Equipment {
            return Err(EngineError::validation("id", "not an equipment"));
        }
        self.commit(&mut guards, &Event::EquipmentUpdated { id, functional })
            .await?;
        if !functional {
            tracing::info!(equipment = %id, "equipment marked out of service");
        }
        self.directory.get_equipment(&id).ok_or(EngineError::NotFound(id))
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn create_filming_session(
        &self,
        input: NewFilmingSession,
    ) -> Result<Booking, EngineError> {
        let span = checked_span(input.start, input.end)?;
        let detail = BookingDetail::Filming {
            name: required_text("name", &input.name, MAX_LABEL_LEN)?,
            location: optional_text(input.location, MAX_LABEL_LEN)?,
            contact: optional_text(input.contact, MAX_LABEL_LEN)?,
            description: optional_text(input.description, MAX_LABEL_LEN)?,
        };
        let equipment: HashSet<Ulid> = input.equipment.iter().copied().collect();
        if let Some(both) = input.participants.iter().find(|p| equipment.contains(p)) {
            return Err(EngineError::validation("participants", format!("{both} is listed as equipment")));
        }
        let mut subjects = input.equipment;
        subjects.extend(input.participants);
        let subjects = dedup_in_order(subjects);

        self.place_booking(span, subjects, detail, ConflictScope::All, |guard| {
            let expected = if equipment.contains(&guard.id) {
                SubjectKind::Equipment
            } else {
                SubjectKind::Person
            };
            if guard.kind != expected {
                let (field, what) = match expected {
                    SubjectKind::Equipment => ("equipment", "an equipment"),
                    SubjectKind::Person => ("participants", "a person"),
                };
                return Err(EngineError::validation(field, format!("{} is not {what}", guard.id)));
            }
            if !guard.functional {
                return Err(EngineError::validation(
                    "equipment",
                    format!("{} is out of service", guard.name),
                ));
            }
            Ok(())
        })
        .await
    }

    pub async fn create_radio_session(
        &self,
        input: NewRadioSession,
    ) -> Result<Booking, EngineError> {
        let span = checked_span(input.start, input.end)?;
        let team = match input.radio_team_id {
            Some(id) => Some(
                self.directory
                    .get_radio_team(&id)
                    .ok_or(EngineError::NotFound(id))?,
            ),
            None => None,
        };
        let label = match optional_text(input.label, MAX_LABEL_LEN)? {
            Some(label) => label,
            None => team
                .as_ref()
                .map_or_else(|| "Radio session".to_string(), |t| format!("{} radio session", t.name())),
        };
        let detail = BookingDetail::Radio {
            radio_team_id: input.radio_team_id,
            label,
            location: optional_text(input.location, MAX_LABEL_LEN)?,
        };
        let subjects = dedup_in_order(input.participants);
        self.place_booking(span, subjects, detail, ConflictScope::All, require_person)
            .await
    }

    /// New absences start out pending. Only the person's other absences block one.
    pub async fn create_absence(
        &self,
        person_id: Ulid,
        start: Ms,
        end: Ms,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        let span = checked_span(start, end)?;
        let detail = BookingDetail::Absence {
            reason: optional_text(reason, MAX_LABEL_LEN)?,
            status: AbsenceStatus::Pending,
        };
        self.place_booking(span, vec![person_id], detail, ConflictScope::AbsencesOnly, require_person)
            .await
    }

    /// Lock every subject, run `admit` and the overlap check on each, then
    /// commit. Nothing is written unless every subject passes.
    async fn place_booking(
        &self,
        span: Span,
        subjects: Vec<Ulid>,
        detail: BookingDetail,
        scope: ConflictScope,
        admit: impl Fn(&SubjectState) -> Result<(), EngineError>,
    ) -> Result<Booking, EngineError> {
        if subjects.len() > MAX_SUBJECTS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many subjects on booking"));
        }
        let category = detail.conflict_kind();
        let mut guards = self.lock_subjects(&subjects).await?;
        for guard in &guards {
            let rs: &SubjectState = guard;
            admit(rs)?;
            check_capacity(rs)?;
            record_conflict(
                check_no_conflict(rs, &span, scope, None),
                category_label(category),
            )?;
        }

        let booking = Booking {
            id: Ulid::new(),
            span,
            subjects,
            detail,
        };
        self.commit(&mut guards, &Event::BookingPlaced { booking: booking.clone() })
            .await?;
        tracing::debug!(booking = %booking.id, category = category_label(category), "booking placed");
        Ok(booking)
    }

    /// Re-opening a denied absence re-runs the absence overlap check.
    pub async fn set_absence_status(
        &self,
        id: Ulid,
        status: AbsenceStatus,
    ) -> Result<Booking, EngineError> {
        let (mut guards, booking) = self.lock_booking(id).await?;
        let BookingDetail::Absence { status: current, .. } = &booking.detail else {
            return Err(EngineError::validation("id", "not an absence"));
        };
        if *current == AbsenceStatus::Denied && status != AbsenceStatus::Denied {
            for guard in &guards {
                record_conflict(
                    check_no_conflict(guard, &booking.span, ConflictScope::AbsencesOnly, Some(id)),
                    "absence",
                )?;
            }
        }
        self.commit(&mut guards, &Event::AbsenceReviewed { id, status })
            .await?;
        self.bookings
            .get(&id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let (mut guards, booking) = self.lock_booking(id).await?;
        self.commit(&mut guards, &Event::BookingCancelled { id })
            .await?;
        Ok(booking)
    }

    /// Write-lock a booking's subjects, then re-read the booking under the locks.
    async fn lock_booking(
        &self,
        id: Ulid,
    ) -> Result<(Vec<OwnedRwLockWriteGuard<SubjectState>>, Booking), EngineError> {
        let subjects = self
            .bookings
            .get(&id)
            .map(|b| b.subjects.clone())
            .ok_or(EngineError::NotFound(id))?;
        let guards = self.lock_subjects(&subjects).await?;
        let booking = self
            .bookings
            .get(&id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(id))?;
        Ok((guards, booking))
    }

    // ── Assignments ──────────────────────────────────────────

    /// Persist an assignment, then notify according to how its
    /// `finalized` flag moved. Notification never fails the save.
    pub async fn save_assignment(
        &self,
        assignment: Assignment,
    ) -> Result<SavedAssignment, EngineError> {
        if assignment.members.len() > MAX_ASSIGNMENT_MEMBERS {
            return Err(EngineError::LimitExceeded("too many assignment members"));
        }
        let mut assignment = assignment;
        for member in &mut assignment.members {
            member.role = required_text("role", &member.role, MAX_NAME_LEN)?;
        }

        let _serial = self.assignment_lock.lock().await;
        let session = self
            .bookings
            .get(&assignment.session_id)
            .map(|b| b.clone())
            .ok_or(EngineError::NotFound(assignment.session_id))?;
        let summary = templates::SessionSummary::from_booking(&session)
            .ok_or_else(|| EngineError::validation("session_id", "not a filming session"))?;
        for person_id in assignment.person_ids() {
            if self.directory.get_person(&person_id).is_none() {
                return Err(EngineError::NotFound(person_id));
            }
        }
        let previous = self.assignments.get(&assignment.id).map(|a| a.clone());
        if let Some(prev) = &previous
            && prev.session_id != assignment.session_id
        {
            return Err(EngineError::validation("session_id", "an assignment cannot move to another session"));
        }

        self.commit(&mut [], &Event::AssignmentSaved { assignment: assignment.clone() })
            .await?;

        let transition = detect_transition(previous.as_ref(), &assignment);
        metrics::counter!(ASSIGNMENT_TRANSITIONS_TOTAL, "transition" => transition_label(transition))
            .increment(1);
        match transition {
            TransitionKind::Finalized => {
                let people: Vec<Person> = assignment
                    .person_ids()
                    .iter()
                    .filter_map(|id| self.directory.get_person(id))
                    .collect();
                let roster: Vec<(String, String)> = assignment
                    .members
                    .iter()
                    .filter_map(|m| {
                        let p = self.directory.get_person(&m.person_id)?;
                        Some((p.full_name(), m.role.clone()))
                    })
                    .collect();
                self.outbox.enqueue(templates::assignment_finalized(
                    &summary,
                    &roster,
                    notification::recipients(&people),
                ));
                tracing::info!(assignment = %assignment.id, session = %summary.name, "assignment finalized");
            }
            TransitionKind::Unfinalized => {
                tracing::info!(assignment = %assignment.id, "assignment reopened as draft");
            }
            TransitionKind::Unchanged if assignment.finalized => {
                let change = roster_change(previous.as_ref(), &assignment);
                let people = |ids: &[Ulid]| -> Vec<Person> {
                    ids.iter()
                        .filter_map(|id| self.directory.get_person(id))
                        .collect()
                };
                if !change.added.is_empty() {
                    let to = notification::recipients(&people(&change.added));
                    self.outbox.enqueue(templates::assignment_added(&summary, to));
                }
                if !change.removed.is_empty() {
                    let to = notification::recipients(&people(&change.removed));
                    self.outbox
                        .enqueue(templates::assignment_removed(&summary, to));
                }
            }
            TransitionKind::Unchanged => {}
        }

        Ok(SavedAssignment { assignment, transition })
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event set that recreates current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut events = Vec::new();
        events.extend(self.directory.classes().into_iter().map(|class| Event::ClassCreated { class }));
        events.extend(self.directory.teams().into_iter().map(|team| Event::TeamCreated { team }));
        events.extend(
            self.directory
                .radio_teams()
                .into_iter()
                .map(|radio_team| Event::RadioTeamCreated { radio_team }),
        );
        events.extend(self.directory.persons().into_iter().map(|person| Event::PersonCreated { person }));
        events.extend(
            self.directory
                .equipment()
                .into_iter()
                .map(|equipment| Event::EquipmentCreated { equipment }),
        );
        let mut bookings: Vec<Booking> = self.bookings.iter().map(|b| b.value().clone()).collect();
        bookings.sort_by_key(|b| b.id);
        events.extend(bookings.into_iter().map(|booking| Event::BookingPlaced { booking }));
        let mut assignments: Vec<Assignment> =
            self.assignments.iter().map(|a| a.value().clone()).collect();
        assignments.sort_by_key(|a| a.id);
        events.extend(
            assignments
                .into_iter()
                .map(|assignment| Event::AssignmentSaved { assignment }),
        );

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn require_person(guard: &SubjectState) -> Result<(), EngineError> {
    if guard.kind != SubjectKind::Person {
        return Err(EngineError::validation(
            "participants",
            format!("{} is not a person", guard.id),
        ));
    }
    Ok(())
}

fn dedup_in_order(ids: Vec<Ulid>) -> Vec<Ulid> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

fn category_label(kind: ConflictKind) -> &'static str {
    match kind {
        ConflictKind::FilmingSession => "filming_session",
        ConflictKind::RadioSession => "radio_session",
        ConflictKind::Absence => "absence",
        ConflictKind::NonFunctional => "non_functional",
    }
}

fn transition_label(kind: TransitionKind) -> &'static str {
    match kind {
        TransitionKind::Finalized => "finalized",
        TransitionKind::Unfinalized => "unfinalized",
        TransitionKind::Unchanged => "unchanged",
    }
}
