use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{availability, describe, free_spans};
use super::conflict::checked_span;
use super::{Engine, EngineError};

/// A read window: non-empty, inside the valid timestamp range and no wider
/// than `MAX_QUERY_WINDOW_MS`.
fn query_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let window = checked_span(start, end)?;
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(window)
}

impl Engine {
    /// Conflicts of `subject_id` in `[start, end)`. Read-only.
    pub async fn check_availability(
        &self,
        subject_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<AvailabilityResult, EngineError> {
        let window = query_window(start, end)?;
        let rs = self
            .get_subject(&subject_id)
            .ok_or(EngineError::NotFound(subject_id))?;
        let guard = rs.read().await;
        Ok(availability(&guard, &window))
    }

    /// Every subject (optionally of one kind) with its bookings on `date`,
    /// ordered by name then id.
    pub async fn daily_overview(&self, date: NaiveDate, kind: Option<SubjectKind>) -> DailyOverview {
        let window = Span::day(date);
        let handles: Vec<_> = self.subjects.iter().map(|e| e.value().clone()).collect();

        let mut subjects = Vec::new();
        for rs in handles {
            let guard = rs.read().await;
            if kind.is_some_and(|k| k != guard.kind) {
                continue;
            }
            let bookings: Vec<ConflictDescriptor> = guard
                .overlapping(&window)
                .filter(|i| i.detail.blocks())
                .map(describe)
                .collect();
            let free: Vec<FreeSlot> = free_spans(&guard, &window).into_iter().map(FreeSlot::from).collect();
            subjects.push(SubjectDay {
                subject_id: guard.id,
                kind: guard.kind,
                name: guard.name.clone(),
                fully_free: availability(&guard, &window).available,
                bookings,
                free_slots: free,
            });
        }
        subjects.sort_by(|a, b| a.name.cmp(&b.name).then(a.subject_id.cmp(&b.subject_id)));
        DailyOverview { date, subjects }
    }

    pub fn get_person(&self, id: &Ulid) -> Option<Person> {
        self.directory.get_person(id)
    }

    pub fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|b| b.clone())
    }

    pub fn get_assignment(&self, id: &Ulid) -> Option<Assignment> {
        self.assignments.get(id).map(|a| a.clone())
    }

    /// Bookings of one subject intersecting `[start, end)`, denied absences included.
    pub async fn subject_bookings(
        &self,
        subject_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<BookingView>, EngineError> {
        let window = query_window(start, end)?;
        let rs = self
            .get_subject(&subject_id)
            .ok_or(EngineError::NotFound(subject_id))?;
        let ids: Vec<Ulid> = rs.read().await.overlapping(&window).map(|i| i.id).collect();
        Ok(ids
            .iter()
            .filter_map(|id| self.get_booking(id))
            .map(|b| BookingView::from(&b))
            .collect())
    }
}
