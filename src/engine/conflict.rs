use crate::limits::MAX_LITERAL_LEN;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

/// Reject oversized literals before handing them to the parsers.
pub(crate) fn check_literal(literal: &str) -> Result<&str, EngineError> {
    if literal.len() > MAX_LITERAL_LEN {
        return Err(EngineError::LimitExceeded("literal too long"));
    }
    Ok(literal)
}

/// Admission check for a new booking.
///
/// `existing` may be the whole collection or any superset of the candidate's
/// same-day room and instructor bookings; everything else is ignored. The room
/// is checked before the instructor, and among several conflicting bookings
/// the earliest `(start, id)` is reported so the outcome does not depend on
/// the order of `existing`.
pub fn check_create(candidate: &Booking, existing: &[Booking]) -> Result<(), EngineError> {
    check(candidate, None, existing)
}

/// Admission check for an updated booking. The stored booking `excluding`
/// (the record being replaced) never conflicts with its own new state.
pub fn check_update(
    candidate: &Booking,
    excluding: BookingId,
    existing: &[Booking],
) -> Result<(), EngineError> {
    check(candidate, Some(excluding), existing)
}

fn check(
    candidate: &Booking,
    excluding: Option<BookingId>,
    existing: &[Booking],
) -> Result<(), EngineError> {
    let others = || existing.iter().filter(move |b| Some(b.id) != excluding);

    if let Some(hit) = earliest(others().filter(|b| b.shares_room_with(candidate))) {
        return Err(EngineError::RoomConflict {
            with: hit.id,
            window: hit.window,
        });
    }
    if let Some(hit) = earliest(others().filter(|b| b.shares_instructor_with(candidate))) {
        return Err(EngineError::InstructorConflict {
            with: hit.id,
            window: hit.window,
        });
    }
    Ok(())
}

fn earliest<'a>(hits: impl Iterator<Item = &'a Booking>) -> Option<&'a Booking> {
    hits.min_by_key(|b| (b.window.start, b.id))
}
