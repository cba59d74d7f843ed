use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed input; names the offending field.
    Validation { field: &'static str, message: String },
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// `subject` is already committed to `booking` in the requested window.
    Conflict { subject: Ulid, booking: Ulid },
    /// A natural key (email, username, class, team) is already taken.
    Duplicate { field: &'static str, value: String },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field,
            message: message.into(),
        }
    }

    /// Stable machine-readable kind used on the wire and in metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Conflict { .. } | EngineError::Duplicate { .. } => "conflict",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "storage",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation { field, message } => write!(f, "invalid {field}: {message}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict { subject, booking } => {
                write!(f, "subject {subject} is already booked by {booking}")
            }
            EngineError::Duplicate { field, value } => write!(f, "{field} already in use: {value}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
