use crate::model::{BookingId, InvalidWindow, ParseError, TimeWindow, WindowError};

use super::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed weekday, time or class-kind literal.
    Parse(ParseError),
    InvalidWindow(InvalidWindow),
    RoomConflict {
        with: BookingId,
        window: TimeWindow,
    },
    InstructorConflict {
        with: BookingId,
        window: TimeWindow,
    },
    NotFound(BookingId),
    AlreadyExists(BookingId),
    /// A resource lock could not be taken within the configured timeout.
    Busy,
    LimitExceeded(&'static str),
    StorageUnavailable(String),
}

impl EngineError {
    /// Only contention and storage failures are worth retrying. Validation
    /// rejections will fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Busy | EngineError::StorageUnavailable(_))
    }

    /// Short label for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::Parse(_) => "parse",
            EngineError::InvalidWindow(_) => "invalid_window",
            EngineError::RoomConflict { .. } => "room_conflict",
            EngineError::InstructorConflict { .. } => "instructor_conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Busy => "busy",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::StorageUnavailable(_) => "storage_unavailable",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Parse(e) => write!(f, "parse error: {e}"),
            EngineError::InvalidWindow(e) => write!(f, "invalid window: {e}"),
            EngineError::RoomConflict { with, window } => {
                write!(f, "room already booked by {with} on {window}")
            }
            EngineError::InstructorConflict { with, window } => {
                write!(f, "instructor already teaching in booking {with} on {window}")
            }
            EngineError::NotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "booking already exists: {id}"),
            EngineError::Busy => write!(f, "resource busy, try again"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StorageUnavailable(e) => write!(f, "storage unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ParseError> for EngineError {
    fn from(e: ParseError) -> Self {
        EngineError::Parse(e)
    }
}

impl From<InvalidWindow> for EngineError {
    fn from(e: InvalidWindow) -> Self {
        EngineError::InvalidWindow(e)
    }
}

impl From<WindowError> for EngineError {
    fn from(e: WindowError) -> Self {
        match e {
            WindowError::Parse(e) => EngineError::Parse(e),
            WindowError::Invalid(e) => EngineError::InvalidWindow(e),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::StorageUnavailable(e.to_string())
    }
}
