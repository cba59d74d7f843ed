use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "ftv_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "ftv_request_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "ftv_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "ftv_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "ftv_connections_rejected_total";

/// Counter: failed `auth` handshakes.
pub const AUTH_FAILURES_TOTAL: &str = "ftv_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "ftv_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "ftv_wal_flush_batch_size";

// ── Domain ──────────────────────────────────────────────────────

/// Counter: booking attempts rejected for overlap. Labels: category.
pub const BOOKING_CONFLICTS_TOTAL: &str = "ftv_booking_conflicts_total";

/// Counter: assignment saves by finalization transition. Labels: transition.
pub const ASSIGNMENT_TRANSITIONS_TOTAL: &str = "ftv_assignment_transitions_total";

/// Counter: committed import rows. Labels: outcome (created, failed).
pub const IMPORT_ROWS_TOTAL: &str = "ftv_import_rows_total";

/// Counter: notifications put on the outbox. Labels: kind.
pub const NOTIFICATIONS_ENQUEUED_TOTAL: &str = "ftv_notifications_enqueued_total";

/// Counter: notifications lost because no dispatcher was running. Labels: kind.
pub const NOTIFICATIONS_DROPPED_TOTAL: &str = "ftv_notifications_dropped_total";

/// Counter: notifications handed to the mailer. Labels: kind.
pub const NOTIFICATIONS_SENT_TOTAL: &str = "ftv_notifications_sent_total";

/// Counter: notifications the mailer refused. Labels: kind.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "ftv_notifications_failed_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a request to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Auth { .. } => "auth",
        Request::CheckAvailability { .. } => "check_availability",
        Request::DailyOverview { .. } => "daily_overview",
        Request::ListBookings { .. } => "list_bookings",
        Request::ValidateImport { .. } => "validate_import",
        Request::CommitImport { .. } => "commit_import",
        Request::PreviewImportCsv { .. } => "preview_import_csv",
        Request::PreviewImportXlsx { .. } => "preview_import_xlsx",
        Request::CreatePerson { .. } => "create_person",
        Request::SetPersonActive { .. } => "set_person_active",
        Request::CreateEquipment { .. } => "create_equipment",
        Request::SetEquipmentFunctional { .. } => "set_equipment_functional",
        Request::CreateFilmingSession { .. } => "create_filming_session",
        Request::CreateRadioSession { .. } => "create_radio_session",
        Request::CreateAbsence { .. } => "create_absence",
        Request::SetAbsenceStatus { .. } => "set_absence_status",
        Request::CancelBooking { .. } => "cancel_booking",
        Request::SaveAssignment { .. } => "save_assignment",
        Request::Listen { .. } => "listen",
        Request::Unlisten { .. } => "unlisten",
    }
}
