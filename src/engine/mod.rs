mod availability;
mod conflict;
mod error;
mod import;
mod mutations;
mod queries;
mod store;

pub use availability::{availability, describe, free_spans, merge_overlapping, subtract_intervals};
pub use error::EngineError;
pub use import::ImportPreview;
pub use mutations::{NewEquipment, NewFilmingSession, NewPerson, NewRadioSession, SavedAssignment};
pub use store::DirectoryStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notification::Outbox;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSubjectState = Arc<RwLock<SubjectState>>;

pub const DEFAULT_LOGIN_URL: &str = "http://localhost:8000/login";

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is running are written
/// together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so stray bytes do not leak into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} records: {e}", batch.len());
    }
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

pub struct Engine {
    subjects: DashMap<Ulid, SharedSubjectState>,
    directory: DirectoryStore,
    /// Every live booking, keyed by id (reverse index from booking to subjects).
    bookings: DashMap<Ulid, Booking>,
    assignments: DashMap<Ulid, Assignment>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Commits hold it shared; compaction holds it exclusively while it snapshots.
    commit_gate: RwLock<()>,
    /// Serialises writers of natural keys (person create, import batches).
    directory_lock: Mutex<()>,
    /// Serialises assignment saves so the stored previous value is stable.
    assignment_lock: Mutex<()>,
    pub notify: Arc<NotifyHub>,
    outbox: Outbox,
    login_url: String,
}

/// Apply an event to one subject's schedule (caller holds the lock).
fn apply_to_subject(rs: &mut SubjectState, event: &Event) {
    match event {
        Event::BookingPlaced { booking } if booking.subjects.contains(&rs.id) => {
            rs.insert_interval(Interval {
                id: booking.id,
                span: booking.span,
                detail: booking.detail.clone(),
            });
        }
        Event::AbsenceReviewed { id, status } => rs.set_absence_status(*id, *status),
        Event::BookingCancelled { id } => {
            rs.remove_interval(*id);
        }
        Event::EquipmentUpdated { id, functional } if *id == rs.id => rs.functional = *functional,
        Event::Atomic { events } => {
            for e in events {
                apply_to_subject(rs, e);
            }
        }
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, outbox: Outbox) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            subjects: DashMap::new(),
            directory: DirectoryStore::new(),
            bookings: DashMap::new(),
            assignments: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            directory_lock: Mutex::new(()),
            assignment_lock: Mutex::new(()),
            notify,
            outbox,
            login_url: DEFAULT_LOGIN_URL.to_string(),
        };

        // Nothing else holds these locks yet, so try_write always succeeds.
        // Never block here: replay may run inside an async context.
        for event in &events {
            let targets = engine.event_subjects(event);
            engine.apply_to_directory(event);
            for id in targets {
                if let Some(rs) = engine.get_subject(&id)
                    && let Ok(mut guard) = rs.try_write()
                {
                    apply_to_subject(&mut guard, event);
                }
            }
        }
        tracing::info!(
            events = events.len(),
            persons = engine.directory.person_count(),
            bookings = engine.bookings.len(),
            "engine state rebuilt from {}",
            wal_path.display()
        );

        Ok(engine)
    }

    /// Base URL put into first-login notices.
    pub fn with_login_url(mut self, login_url: impl Into<String>) -> Self {
        self.login_url = login_url.into();
        self
    }

    pub fn directory(&self) -> &DirectoryStore {
        &self.directory
    }

    pub fn get_subject(&self, id: &Ulid) -> Option<SharedSubjectState> {
        self.subjects.get(id).map(|e| e.value().clone())
    }

    /// Subjects whose schedule or feed an event touches. Must be computed
    /// before the event is applied (cancellation forgets the booking).
    fn event_subjects(&self, event: &Event) -> Vec<Ulid> {
        match event {
            Event::PersonCreated { person } => vec![person.id],
            Event::PersonActiveSet { id, .. } => vec![*id],
            Event::EquipmentCreated { equipment } => vec![equipment.id],
            Event::EquipmentUpdated { id, .. } => vec![*id],
            Event::BookingPlaced { booking } => booking.subjects.clone(),
            Event::AbsenceReviewed { id, .. } | Event::BookingCancelled { id } => self
                .bookings
                .get(id)
                .map(|b| b.subjects.clone())
                .unwrap_or_default(),
            Event::Atomic { events } => {
                let mut ids: Vec<Ulid> = events.iter().flat_map(|e| self.event_subjects(e)).collect();
                ids.sort();
                ids.dedup();
                ids
            }
            Event::ClassCreated { .. }
            | Event::ClassTeacherAdded { .. }
            | Event::TeamCreated { .. }
            | Event::RadioTeamCreated { .. }
            | Event::AssignmentSaved { .. } => Vec::new(),
        }
    }

    /// Apply the record-keeping side of an event: directory, booking and
    /// assignment indexes, and subject registration. Schedules are left to
    /// `apply_to_subject`.
    fn apply_to_directory(&self, event: &Event) {
        match event {
            Event::PersonCreated { person } => {
                let rs = SubjectState::new(person.id, SubjectKind::Person, person.full_name());
                self.subjects.insert(person.id, Arc::new(RwLock::new(rs)));
                self.directory.insert_person(person.clone());
            }
            Event::PersonActiveSet { id, active } => self.directory.set_person_active(*id, *active),
            Event::ClassCreated { class } => self.directory.insert_class(class.clone()),
            Event::ClassTeacherAdded { class_id, person_id } => {
                self.directory.add_class_teacher(*class_id, *person_id)
            }
            Event::TeamCreated { team } => self.directory.insert_team(team.clone()),
            Event::RadioTeamCreated { radio_team } => {
                self.directory.insert_radio_team(radio_team.clone())
            }
            Event::EquipmentCreated { equipment } => {
                let mut rs = SubjectState::new(
                    equipment.id,
                    SubjectKind::Equipment,
                    equipment.nickname.clone(),
                );
                rs.functional = equipment.functional;
                self.subjects.insert(equipment.id, Arc::new(RwLock::new(rs)));
                self.directory.insert_equipment(equipment.clone());
            }
            Event::EquipmentUpdated { id, functional } => {
                self.directory.set_equipment_functional(*id, *functional)
            }
            Event::BookingPlaced { booking } => {
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::AbsenceReviewed { id, status } => {
                if let Some(mut b) = self.bookings.get_mut(id)
                    && let BookingDetail::Absence { status: current, .. } = &mut b.detail
                {
                    *current = *status;
                }
            }
            Event::BookingCancelled { id } => {
                self.bookings.remove(id);
            }
            Event::AssignmentSaved { assignment } => {
                self.assignments.insert(assignment.id, assignment.clone());
            }
            Event::Atomic { events } => {
                for e in events {
                    self.apply_to_directory(e);
                }
            }
        }
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, apply and publish one event. `guards` are the write locks
    /// of every subject whose schedule the event changes.
    pub(super) async fn commit(
        &self,
        guards: &mut [OwnedRwLockWriteGuard<SubjectState>],
        event: &Event,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let targets = self.event_subjects(event);
        self.wal_append(event).await?;
        self.apply_to_directory(event);
        for guard in guards.iter_mut() {
            apply_to_subject(guard, event);
        }
        for id in targets {
            self.notify.send(id, event);
        }
        Ok(())
    }

    /// Write locks for `ids`, taken in sorted order.
    pub(super) async fn lock_subjects(
        &self,
        ids: &[Ulid],
    ) -> Result<Vec<OwnedRwLockWriteGuard<SubjectState>>, EngineError> {
        let mut sorted = ids.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for id in &sorted {
            let rs = self.get_subject(id).ok_or(EngineError::NotFound(*id))?;
            guards.push(rs.write_owned().await);
        }
        Ok(guards)
    }
}
