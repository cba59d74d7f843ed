//! JSON-lines protocol: one request object per line, one response per line.
//!
//! The first request on a connection must be `auth`. Events for subjects a
//! client `listen`s to arrive interleaved with responses as
//! `{"channel": "<subject id>", "event": {...}}`.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::auth::SharedPassword;
use crate::engine::{Engine, EngineError, NewEquipment, NewFilmingSession, NewPerson, NewRadioSession};
use crate::import::RowInput;
use crate::limits::{MAX_FRAME_BYTES, MAX_SUBSCRIPTIONS_PER_CONNECTION};
use crate::model::*;
use crate::observability::{AUTH_FAILURES_TOTAL, REQUEST_DURATION_SECONDS, REQUESTS_TOTAL, op_label};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Auth {
        password: String,
    },
    CheckAvailability {
        subject_id: Ulid,
        #[serde(with = "local_ms")]
        start: Ms,
        #[serde(with = "local_ms")]
        end: Ms,
    },
    DailyOverview {
        date: NaiveDate,
        #[serde(default)]
        subject_kind: Option<SubjectKind>,
    },
    ListBookings {
        subject_id: Ulid,
        #[serde(with = "local_ms")]
        start: Ms,
        #[serde(with = "local_ms")]
        end: Ms,
    },
    ValidateImport {
        rows: Vec<RowInput>,
    },
    CommitImport {
        rows: Vec<RowInput>,
        #[serde(default)]
        send_emails: bool,
    },
    PreviewImportCsv {
        content: String,
    },
    /// `content` is the workbook, base64-encoded.
    PreviewImportXlsx {
        content: String,
    },
    CreatePerson(NewPerson),
    SetPersonActive {
        id: Ulid,
        active: bool,
    },
    CreateEquipment(NewEquipment),
    SetEquipmentFunctional {
        id: Ulid,
        functional: bool,
    },
    CreateFilmingSession(NewFilmingSession),
    CreateRadioSession(NewRadioSession),
    CreateAbsence {
        person_id: Ulid,
        #[serde(with = "local_ms")]
        start: Ms,
        #[serde(with = "local_ms")]
        end: Ms,
        #[serde(default)]
        reason: Option<String>,
    },
    SetAbsenceStatus {
        id: Ulid,
        status: AbsenceStatus,
    },
    CancelBooking {
        id: Ulid,
    },
    SaveAssignment {
        assignment: Assignment,
    },
    Listen {
        subject_id: Ulid,
    },
    Unlisten {
        subject_id: Ulid,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn data(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                kind: kind.into(),
                message: message.into(),
            }),
        }
    }
}

impl From<EngineError> for Response {
    fn from(e: EngineError) -> Self {
        Response::error(e.kind(), e.to_string())
    }
}

/// A subject event forwarded to a listening client.
#[derive(Debug, Clone, Serialize)]
pub struct Push {
    pub channel: Ulid,
    pub event: Event,
}

/// Per-connection subscriptions; each forwards into the connection's push queue.
struct Listeners {
    tasks: HashMap<Ulid, JoinHandle<()>>,
    tx: mpsc::UnboundedSender<Push>,
}

impl Listeners {
    fn listen(&mut self, engine: &Engine, subject_id: Ulid) -> Result<bool, EngineError> {
        if self.tasks.contains_key(&subject_id) {
            return Ok(false);
        }
        if self.tasks.len() >= MAX_SUBSCRIPTIONS_PER_CONNECTION {
            return Err(EngineError::LimitExceeded("too many subscriptions"));
        }
        if engine.get_subject(&subject_id).is_none() {
            return Err(EngineError::NotFound(subject_id));
        }
        let mut rx = engine.notify.subscribe(subject_id);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send(Push { channel: subject_id, event }).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(subject = %subject_id, "listener lagged, {n} events skipped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.tasks.insert(subject_id, task);
        Ok(true)
    }

    fn unlisten(&mut self, subject_id: Ulid) -> bool {
        match self.tasks.remove(&subject_id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Listeners {
    fn drop(&mut self) {
        for task in self.tasks.values() {
            task.abort();
        }
    }
}

fn to_data<T: Serialize>(value: T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::validation("response", e.to_string()))
}

async fn execute_command(
    engine: &Engine,
    listeners: &mut Listeners,
    req: Request,
) -> Result<Value, EngineError> {
    match req {
        Request::Auth { .. } => Err(EngineError::validation("op", "already authenticated")),
        Request::CheckAvailability { subject_id, start, end } => {
            to_data(engine.check_availability(subject_id, start, end).await?)
        }
        Request::DailyOverview { date, subject_kind } => {
            to_data(engine.daily_overview(date, subject_kind).await)
        }
        Request::ListBookings { subject_id, start, end } => {
            to_data(engine.subject_bookings(subject_id, start, end).await?)
        }
        Request::ValidateImport { rows } => to_data(engine.validate_import(&rows)?),
        Request::CommitImport { rows, send_emails } => {
            to_data(engine.commit_import(&rows, send_emails).await?)
        }
        Request::PreviewImportCsv { content } => to_data(engine.preview_import_csv(&content)?),
        Request::PreviewImportXlsx { content } => {
            let bytes = BASE64
                .decode(content.trim())
                .map_err(|e| EngineError::validation("content", format!("invalid base64: {e}")))?;
            to_data(engine.preview_import_xlsx(&bytes)?)
        }
        Request::CreatePerson(input) => to_data(engine.create_person(input).await?),
        Request::SetPersonActive { id, active } => {
            to_data(engine.set_person_active(id, active).await?)
        }
        Request::CreateEquipment(input) => to_data(engine.create_equipment(input).await?),
        Request::SetEquipmentFunctional { id, functional } => {
            to_data(engine.set_equipment_functional(id, functional).await?)
        }
        Request::CreateFilmingSession(input) => {
            let booking = engine.create_filming_session(input).await?;
            to_data(BookingView::from(&booking))
        }
        Request::CreateRadioSession(input) => {
            let booking = engine.create_radio_session(input).await?;
            to_data(BookingView::from(&booking))
        }
        Request::CreateAbsence { person_id, start, end, reason } => {
            let booking = engine.create_absence(person_id, start, end, reason).await?;
            to_data(BookingView::from(&booking))
        }
        Request::SetAbsenceStatus { id, status } => {
            let booking = engine.set_absence_status(id, status).await?;
            to_data(BookingView::from(&booking))
        }
        Request::CancelBooking { id } => {
            let booking = engine.cancel_booking(id).await?;
            to_data(BookingView::from(&booking))
        }
        Request::SaveAssignment { assignment } => to_data(engine.save_assignment(assignment).await?),
        Request::Listen { subject_id } => {
            let added = listeners.listen(engine, subject_id)?;
            to_data(serde_json::json!({ "channel": subject_id, "added": added }))
        }
        Request::Unlisten { subject_id } => {
            let removed = listeners.unlisten(subject_id);
            to_data(serde_json::json!({ "channel": subject_id, "removed": removed }))
        }
    }
}

async fn handle_line(engine: &Engine, listeners: &mut Listeners, line: &str) -> Response {
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => return Response::error("validation", format!("bad request: {e}")),
    };
    let op = op_label(&req);
    let started = Instant::now();
    let result = execute_command(engine, listeners, req).await;
    let status = match &result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());
    match result {
        Ok(data) => Response::data(data),
        Err(e) => {
            tracing::debug!(op, "request failed: {e}");
            e.into()
        }
    }
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

async fn send_json<T: Serialize>(
    framed: &mut Framed<TcpStream, LinesCodec>,
    value: &T,
) -> io::Result<()> {
    let line = serde_json::to_string(value).map_err(io::Error::other)?;
    framed.send(line).await.map_err(codec_err)
}

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    auth: Arc<SharedPassword>,
) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));

    let first = match framed.next().await {
        Some(line) => line.map_err(codec_err)?,
        None => return Ok(()),
    };
    match serde_json::from_str::<Request>(&first) {
        Ok(Request::Auth { password }) if auth.verify(&password) => {
            send_json(&mut framed, &Response::data(serde_json::json!({ "authenticated": true }))).await?;
        }
        _ => {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!("rejected connection: authentication failed");
            send_json(&mut framed, &Response::error("auth", "authentication failed")).await?;
            return Ok(());
        }
    }

    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    let mut listeners = Listeners {
        tasks: HashMap::new(),
        tx: push_tx,
    };

    loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        send_json(&mut framed, &Response::from(EngineError::LimitExceeded("request too large"))).await?;
                        continue;
                    }
                    Some(Err(e)) => return Err(codec_err(e)),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = handle_line(&engine, &mut listeners, &line).await;
                send_json(&mut framed, &response).await?;
            }
            Some(push) = push_rx.recv() => {
                send_json(&mut framed, &push).await?;
            }
        }
    }
    Ok(())
}
