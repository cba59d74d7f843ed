use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::validation("end", "end must be after start"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Build a span from raw bounds, rejecting empty and inverted windows.
pub(crate) fn checked_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end)
        .ok_or_else(|| EngineError::validation("end", "end must be after start"))?;
    validate_span(&span)?;
    Ok(span)
}

/// Which committed bookings a new booking must stay clear of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConflictScope {
    /// Sessions: every blocking booking.
    All,
    /// Absences are only blocked by other absences.
    AbsencesOnly,
}

/// First blocking interval of `rs` overlapping `span`, skipping `ignore`.
pub(crate) fn find_conflict<'a>(
    rs: &'a SubjectState,
    span: &Span,
    scope: ConflictScope,
    ignore: Option<Ulid>,
) -> Option<&'a Interval> {
    rs.overlapping(span).find(|interval| {
        Some(interval.id) != ignore
            && interval.detail.blocks()
            && (scope == ConflictScope::All || interval.detail.is_absence())
    })
}

pub(crate) fn check_no_conflict(
    rs: &SubjectState,
    span: &Span,
    scope: ConflictScope,
    ignore: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(rs, span, scope, ignore) {
        Some(interval) => Err(EngineError::Conflict {
            subject: rs.id,
            booking: interval.id,
        }),
        None => Ok(()),
    }
}
