use crate::model::*;

// ── Availability ─────────────────────────────────────────────────

/// Conflicts of one subject inside `window`, in `(start, id)` order.
///
/// Denied absences are skipped; pending and approved both count. An
/// out-of-service equipment gets a single `non_functional` entry first,
/// covering the whole window.
pub fn availability(subject: &SubjectState, window: &Span) -> AvailabilityResult {
    let mut conflicts = Vec::new();
    if subject.kind == SubjectKind::Equipment && !subject.functional {
        conflicts.push(out_of_service(subject, window));
    }
    conflicts.extend(
        subject
            .overlapping(window)
            .filter(|i| i.detail.blocks())
            .map(describe),
    );
    AvailabilityResult {
        available: conflicts.is_empty(),
        conflicts,
    }
}

pub fn describe(interval: &Interval) -> ConflictDescriptor {
    let start = from_ms(interval.span.start);
    let end = from_ms(interval.span.end);
    ConflictDescriptor {
        kind: interval.detail.conflict_kind(),
        id: interval.id,
        label: interval.detail.label(),
        date: start.date(),
        time_from: start.time(),
        time_to: end.time(),
        end_date: (end.date() != start.date()).then(|| end.date()),
        location: interval.detail.location().map(str::to_string),
    }
}

fn out_of_service(subject: &SubjectState, window: &Span) -> ConflictDescriptor {
    let start = from_ms(window.start);
    let end = from_ms(window.end);
    ConflictDescriptor {
        kind: ConflictKind::NonFunctional,
        id: subject.id,
        label: format!("{} is out of service", subject.name),
        date: start.date(),
        time_from: start.time(),
        time_to: end.time(),
        end_date: (end.date() != start.date()).then(|| end.date()),
        location: None,
    }
}

/// Maximal spans of `window` not covered by a blocking booking.
/// Out-of-service equipment has none.
pub fn free_spans(subject: &SubjectState, window: &Span) -> Vec<Span> {
    if subject.kind == SubjectKind::Equipment && !subject.functional {
        return Vec::new();
    }
    let mut busy: Vec<Span> = subject
        .overlapping(window)
        .filter(|i| i.detail.blocks())
        .map(|i| Span::new(i.span.start.max(window.start), i.span.end.min(window.end)))
        .collect();
    busy.sort_by_key(|s| s.start);
    subtract_intervals(&[*window], &merge_overlapping(&busy))
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
