use chrono::{NaiveDate, NaiveTime};

use super::{Notification, NotificationKind};
use crate::model::{Booking, BookingDetail, Person, from_ms};

const SUBJECT_PREFIX: &str = "FTV";

/// What a recipient needs to know about a filming session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub name: String,
    pub date: NaiveDate,
    pub time_from: NaiveTime,
    pub time_to: NaiveTime,
    pub location: Option<String>,
    pub contact: Option<String>,
}

impl SessionSummary {
    /// `None` unless the booking is a filming session.
    pub fn from_booking(booking: &Booking) -> Option<Self> {
        let BookingDetail::Filming { name, location, contact, .. } = &booking.detail else {
            return None;
        };
        let start = from_ms(booking.span.start);
        let end = from_ms(booking.span.end);
        Some(Self {
            name: name.clone(),
            date: start.date(),
            time_from: start.time(),
            time_to: end.time(),
            location: location.clone(),
            contact: contact.clone(),
        })
    }

    fn lines(&self) -> Vec<(&'static str, String)> {
        let mut lines = vec![
            ("Session", self.name.clone()),
            ("Date", self.date.format("%Y-%m-%d").to_string()),
            (
                "Time",
                format!("{}-{}", self.time_from.format("%H:%M"), self.time_to.format("%H:%M")),
            ),
        ];
        if let Some(loc) = &self.location {
            lines.push(("Location", loc.clone()));
        }
        if let Some(contact) = &self.contact {
            lines.push(("Contact", contact.clone()));
        }
        lines
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Render a heading, a paragraph and labelled lines as text and HTML bodies.
fn render(heading: &str, intro: &str, lines: &[(&str, String)]) -> (String, String) {
    let mut text = format!("{heading}\n\n{intro}\n\n");
    let mut html = format!(
        "<h2>{}</h2>\n<p>{}</p>\n<ul>\n",
        escape_html(heading),
        escape_html(intro)
    );
    for (label, value) in lines {
        text.push_str(&format!("{label}: {value}\n"));
        html.push_str(&format!(
            "<li><strong>{}:</strong> {}</li>\n",
            escape_html(label),
            escape_html(value)
        ));
    }
    html.push_str("</ul>\n");
    (text, html)
}

/// One message to the whole roster when an assignment becomes final.
/// `roster` pairs are `(full name, role)`.
pub fn assignment_finalized(
    session: &SessionSummary,
    roster: &[(String, String)],
    recipients: Vec<String>,
) -> Notification {
    let mut lines = session.lines();
    for (name, role) in roster {
        lines.push(("Crew", format!("{name} ({role})")));
    }
    let (text, html) = render(
        "Assignment finalized",
        "The crew for the following filming session has been finalized.",
        &lines,
    );
    Notification {
        kind: NotificationKind::AssignmentFinalized,
        subject: format!("{SUBJECT_PREFIX} - Assignment finalized: {}", session.name),
        text,
        html,
        recipients,
    }
}

pub fn assignment_added(session: &SessionSummary, recipients: Vec<String>) -> Notification {
    let (text, html) = render(
        "You were added to a crew",
        "You have been assigned to the following filming session.",
        &session.lines(),
    );
    Notification {
        kind: NotificationKind::AssignmentAdded,
        subject: format!("{SUBJECT_PREFIX} - Added to assignment: {}", session.name),
        text,
        html,
        recipients,
    }
}

pub fn assignment_removed(session: &SessionSummary, recipients: Vec<String>) -> Notification {
    let (text, html) = render(
        "You were removed from a crew",
        "You are no longer assigned to the following filming session.",
        &session.lines(),
    );
    Notification {
        kind: NotificationKind::AssignmentRemoved,
        subject: format!("{SUBJECT_PREFIX} - Removed from assignment: {}", session.name),
        text,
        html,
        recipients,
    }
}

pub fn first_login(person: &Person, login_url: &str, recipients: Vec<String>) -> Notification {
    let lines = vec![
        ("Name", person.full_name()),
        ("Username", person.username.clone()),
        ("Sign in", login_url.to_string()),
    ];
    let (text, html) = render(
        "Your FTV account is ready",
        "An account has been created for you. Sign in with your username to set a password.",
        &lines,
    );
    Notification {
        kind: NotificationKind::FirstLogin,
        subject: format!("{SUBJECT_PREFIX} - Your account is ready"),
        text,
        html,
        recipients,
    }
}
