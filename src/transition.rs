use serde::Serialize;
use ulid::Ulid;

use crate::model::Assignment;

/// How a save moved an assignment's `finalized` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// draft → finalized. The only transition that notifies the crew.
    Finalized,
    /// finalized → draft. Silent.
    Unfinalized,
    Unchanged,
}

/// A brand-new assignment counts as coming from draft.
pub fn detect_transition(previous: Option<&Assignment>, next: &Assignment) -> TransitionKind {
    let was_final = previous.is_some_and(|p| p.finalized);
    match (was_final, next.finalized) {
        (false, true) => TransitionKind::Finalized,
        (true, false) => TransitionKind::Unfinalized,
        _ => TransitionKind::Unchanged,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterChange {
    pub added: Vec<Ulid>,
    pub removed: Vec<Ulid>,
}

impl RosterChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Persons who joined or left the crew, each in roster order.
pub fn roster_change(previous: Option<&Assignment>, next: &Assignment) -> RosterChange {
    let before = previous.map(Assignment::person_ids).unwrap_or_default();
    let after = next.person_ids();
    RosterChange {
        added: after.iter().filter(|p| !before.contains(p)).copied().collect(),
        removed: before.iter().filter(|p| !after.contains(p)).copied().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AssignmentMember;

    fn assignment(finalized: bool, people: &[Ulid]) -> Assignment {
        Assignment {
            id: Ulid::nil(),
            session_id: Ulid::nil(),
            members: people
                .iter()
                .map(|p| AssignmentMember { person_id: *p, role: "crew".into() })
                .collect(),
            finalized,
        }
    }

    #[test]
    fn transition_table() {
        let draft = assignment(false, &[]);
        let fin = assignment(true, &[]);
        assert_eq!(detect_transition(None, &draft), TransitionKind::Unchanged);
        assert_eq!(detect_transition(None, &fin), TransitionKind::Finalized);
        assert_eq!(detect_transition(Some(&draft), &fin), TransitionKind::Finalized);
        assert_eq!(detect_transition(Some(&fin), &fin), TransitionKind::Unchanged);
        assert_eq!(detect_transition(Some(&fin), &draft), TransitionKind::Unfinalized);
        assert_eq!(detect_transition(Some(&draft), &draft), TransitionKind::Unchanged);
    }

    #[test]
    fn toggling_fires_once_per_upward_edge() {
        let states = [false, true, false, true, true];
        let mut prev: Option<Assignment> = None;
        let mut fired = 0;
        for f in states {
            let next = assignment(f, &[]);
            if detect_transition(prev.as_ref(), &next) == TransitionKind::Finalized {
                fired += 1;
            }
            prev = Some(next);
        }
        assert_eq!(fired, 2);
    }

    #[test]
    fn roster_diff() {
        let (a, b, c) = (Ulid::new(), Ulid::new(), Ulid::new());
        let before = assignment(true, &[a, b]);
        let after = assignment(true, &[b, c]);
        let change = roster_change(Some(&before), &after);
        assert_eq!(change.added, vec![c]);
        assert_eq!(change.removed, vec![a]);
        assert!(roster_change(Some(&after), &after).is_empty());
        assert_eq!(roster_change(None, &after).added, vec![b, c]);
    }
}
