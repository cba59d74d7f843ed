use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Milliseconds since the Unix epoch of the school-local wall clock.
/// No time zone is attached; every timestamp in the system is local.
pub type Ms = i64;

pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// The calendar day `[midnight, next midnight)`.
    pub fn day(date: NaiveDate) -> Self {
        let start = to_ms(date.and_time(NaiveTime::MIN));
        Self::new(start, start + DAY_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

pub fn to_ms(dt: NaiveDateTime) -> Ms {
    dt.and_utc().timestamp_millis()
}

pub fn from_ms(ms: Ms) -> NaiveDateTime {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_default()
        .naive_utc()
}

/// Parse a local date-time. Accepts `2024-03-15T13:30`, `2024-03-15T13:30:00`
/// (optionally with fractional seconds or a space instead of `T`) and RFC 3339
/// with an offset, in which case the wall-clock time in that offset is kept.
pub fn parse_local_datetime(s: &str) -> Option<Ms> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(to_ms(dt.naive_local()));
    }
    const FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];
    FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .map(to_ms)
}

/// Serde adapter: `Ms` as an ISO-8601 local date-time string.
pub mod local_ms {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{Ms, from_ms, parse_local_datetime};

    pub fn serialize<S: Serializer>(ms: &Ms, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&from_ms(*ms).format("%Y-%m-%dT%H:%M:%S"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Ms, D::Error> {
        let raw = String::deserialize(d)?;
        parse_local_datetime(&raw)
            .ok_or_else(|| D::Error::custom(format!("invalid local date-time: {raw}")))
    }
}

/// `HH:MM` clock times; seconds are accepted on input and dropped on output.
pub mod clock_time {
    use chrono::NaiveTime;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&t.format("%H:%M"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(|_| D::Error::custom(format!("invalid clock time: {raw}")))
    }
}

/// The academic year a date belongs to, named by its starting calendar year.
/// A new school year starts in September.
pub fn school_year_of(date: NaiveDate) -> i32 {
    if date.month() >= 9 {
        date.year()
    } else {
        date.year() - 1
    }
}

/// Syntactic email check: one `@`, non-empty local part, dotted domain, no whitespace.
pub fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') || !domain.contains('.') {
        return false;
    }
    domain.split('.').all(|label| !label.is_empty())
}

// ── Directory records ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminType {
    #[default]
    None,
    Teacher,
    SystemAdmin,
    Developer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialRole {
    #[default]
    None,
    ProductionLeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: Ulid,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub admin_type: AdminType,
    pub special_role: SpecialRole,
    pub active: bool,
    pub class_id: Option<Ulid>,
    pub team_id: Option<Ulid>,
    pub radio_team_id: Option<Ulid>,
}

impl Person {
    /// Family name first, the way the school writes names.
    pub fn full_name(&self) -> String {
        format!("{} {}", self.last_name, self.first_name)
    }

    /// Active and reachable by email.
    pub fn is_deliverable(&self) -> bool {
        self.active && is_valid_email(&self.email)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchoolClass {
    pub id: Ulid,
    pub start_year: i32,
    /// Always upper-case.
    pub section: String,
    pub school_year: i32,
    /// Class teachers of record.
    pub teachers: Vec<Ulid>,
}

impl SchoolClass {
    pub fn name(&self) -> String {
        class_name(self.start_year, &self.section)
    }
}

pub fn class_name(start_year: i32, section: &str) -> String {
    format!("{start_year}{section}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioTeam {
    pub id: Ulid,
    pub start_year: i32,
    /// Always upper-case.
    pub code: String,
}

impl RadioTeam {
    pub fn name(&self) -> String {
        radio_team_name(self.start_year, &self.code)
    }
}

pub fn radio_team_name(start_year: i32, code: &str) -> String {
    format!("{start_year} {code}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equipment {
    pub id: Ulid,
    pub nickname: String,
    pub serial_number: Option<String>,
    pub equipment_type: Option<String>,
    pub functional: bool,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Person,
    Equipment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbsenceStatus {
    Pending,
    Approved,
    Denied,
}

/// What a booking is. Everything except a denied absence blocks its subjects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingDetail {
    Filming {
        name: String,
        location: Option<String>,
        contact: Option<String>,
        description: Option<String>,
    },
    Radio {
        radio_team_id: Option<Ulid>,
        label: String,
        location: Option<String>,
    },
    Absence {
        reason: Option<String>,
        status: AbsenceStatus,
    },
}

impl BookingDetail {
    pub fn blocks(&self) -> bool {
        !matches!(
            self,
            BookingDetail::Absence {
                status: AbsenceStatus::Denied,
                ..
            }
        )
    }

    pub fn is_absence(&self) -> bool {
        matches!(self, BookingDetail::Absence { .. })
    }

    pub fn conflict_kind(&self) -> ConflictKind {
        match self {
            BookingDetail::Filming { .. } => ConflictKind::FilmingSession,
            BookingDetail::Radio { .. } => ConflictKind::RadioSession,
            BookingDetail::Absence { .. } => ConflictKind::Absence,
        }
    }

    pub fn label(&self) -> String {
        match self {
            BookingDetail::Filming { name, .. } => name.clone(),
            BookingDetail::Radio { label, .. } => label.clone(),
            BookingDetail::Absence { reason, .. } => reason
                .as_deref()
                .map_or_else(|| "Absence".to_string(), |r| format!("Absence: {r}")),
        }
    }

    pub fn location(&self) -> Option<&str> {
        match self {
            BookingDetail::Filming { location, .. } | BookingDetail::Radio { location, .. } => {
                location.as_deref()
            }
            BookingDetail::Absence { .. } => None,
        }
    }
}

/// A time-bounded commitment of one or more subjects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub span: Span,
    pub subjects: Vec<Ulid>,
    pub detail: BookingDetail,
}

/// Client-facing shape of a booking: flat, with local date-times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingView {
    pub id: Ulid,
    pub category: ConflictKind,
    pub label: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub subjects: Vec<Ulid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radio_team_id: Option<Ulid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AbsenceStatus>,
}

impl From<&Booking> for BookingView {
    fn from(b: &Booking) -> Self {
        let mut view = BookingView {
            id: b.id,
            category: b.detail.conflict_kind(),
            label: b.detail.label(),
            start: from_ms(b.span.start),
            end: from_ms(b.span.end),
            subjects: b.subjects.clone(),
            location: b.detail.location().map(str::to_string),
            contact: None,
            description: None,
            radio_team_id: None,
            status: None,
        };
        match &b.detail {
            BookingDetail::Filming { contact, description, .. } => {
                view.contact = contact.clone();
                view.description = description.clone();
            }
            BookingDetail::Radio { radio_team_id, .. } => view.radio_team_id = *radio_team_id,
            BookingDetail::Absence { status, .. } => view.status = Some(*status),
        }
        view
    }
}

/// One booking as seen from one subject's schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
    pub detail: BookingDetail,
}

#[derive(Debug, Clone)]
pub struct SubjectState {
    pub id: Ulid,
    pub kind: SubjectKind,
    pub name: String,
    /// Persons are always functional.
    pub functional: bool,
    /// Sorted by `(span.start, id)`.
    pub intervals: Vec<Interval>,
}

impl SubjectState {
    pub fn new(id: Ulid, kind: SubjectKind, name: String) -> Self {
        Self {
            id,
            kind,
            name,
            functional: true,
            intervals: Vec::new(),
        }
    }

    /// Insert interval maintaining sort order by `(span.start, id)`.
    pub fn insert_interval(&mut self, interval: Interval) {
        let key = (interval.span.start, interval.id);
        let pos = self
            .intervals
            .binary_search_by_key(&key, |i| (i.span.start, i.id))
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    pub fn set_absence_status(&mut self, id: Ulid, new_status: AbsenceStatus) {
        if let Some(interval) = self.intervals.iter_mut().find(|i| i.id == id)
            && let BookingDetail::Absence { status, .. } = &mut interval.detail
        {
            *status = new_status;
        }
    }

    /// Return only intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self.intervals.partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }
}

// ── Assignments ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentMember {
    pub person_id: Ulid,
    pub role: String,
}

/// Staffing of one filming session (Beosztás).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Ulid,
    pub session_id: Ulid,
    pub members: Vec<AssignmentMember>,
    pub finalized: bool,
}

impl Assignment {
    /// Distinct member person ids in roster order.
    pub fn person_ids(&self) -> Vec<Ulid> {
        let mut seen = Vec::with_capacity(self.members.len());
        for m in &self.members {
            if !seen.contains(&m.person_id) {
                seen.push(m.person_id);
            }
        }
        seen
    }
}

/// The WAL record format. Records are flat except `Atomic`, which groups the
/// writes of one import row so they replay all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PersonCreated { person: Person },
    PersonActiveSet { id: Ulid, active: bool },
    ClassCreated { class: SchoolClass },
    ClassTeacherAdded { class_id: Ulid, person_id: Ulid },
    TeamCreated { team: Team },
    RadioTeamCreated { radio_team: RadioTeam },
    EquipmentCreated { equipment: Equipment },
    EquipmentUpdated { id: Ulid, functional: bool },
    BookingPlaced { booking: Booking },
    AbsenceReviewed { id: Ulid, status: AbsenceStatus },
    BookingCancelled { id: Ulid },
    AssignmentSaved { assignment: Assignment },
    Atomic { events: Vec<Event> },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    FilmingSession,
    RadioSession,
    Absence,
    NonFunctional,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDescriptor {
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    pub id: Ulid,
    pub label: String,
    pub date: NaiveDate,
    #[serde(with = "clock_time")]
    pub time_from: NaiveTime,
    #[serde(with = "clock_time")]
    pub time_to: NaiveTime,
    /// Set only when the booking ends on a later day than it starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityResult {
    pub available: bool,
    pub conflicts: Vec<ConflictDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSlot {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl From<Span> for FreeSlot {
    fn from(span: Span) -> Self {
        Self {
            start: from_ms(span.start),
            end: from_ms(span.end),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectDay {
    pub subject_id: Ulid,
    pub kind: SubjectKind,
    pub name: String,
    pub bookings: Vec<ConflictDescriptor>,
    pub fully_free: bool,
    pub free_slots: Vec<FreeSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyOverview {
    pub date: NaiveDate,
    pub subjects: Vec<SubjectDay>,
}
