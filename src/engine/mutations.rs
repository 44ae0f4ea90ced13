use std::str::FromStr;
use std::time::Instant;

use tracing::{debug, error, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{ADMISSION_DURATION_SECONDS, BOOKINGS_ADMITTED_TOTAL, BOOKINGS_REJECTED_TOTAL};

use super::conflict::{check_create, check_literal, check_update, now_ms};
use super::{Engine, EngineError, LockKey};

fn literal<T: FromStr<Err = ParseError>>(s: &str) -> Result<T, EngineError> {
    Ok(check_literal(s)?.parse()?)
}

fn optional_literal<T: FromStr<Err = ParseError>>(s: Option<&str>) -> Result<Option<T>, EngineError> {
    s.map(literal::<T>).transpose()
}

/// Parsed literals of a partial update, resolved before any store access.
struct ParsedChanges {
    weekday: Option<Weekday>,
    start: Option<ClockTime>,
    end: Option<ClockTime>,
    kind: Option<ClassKind>,
}

impl ParsedChanges {
    fn parse(changes: &BookingChanges) -> Result<Self, EngineError> {
        Ok(Self {
            weekday: optional_literal(changes.weekday.as_deref())?,
            start: optional_literal(changes.start_time.as_deref())?,
            end: optional_literal(changes.end_time.as_deref())?,
            kind: optional_literal(changes.kind.as_deref())?,
        })
    }

    /// Overlay the changes on `current` and validate the result as a whole.
    fn merge(&self, current: &Booking, changes: &BookingChanges) -> Result<Booking, EngineError> {
        let window = TimeWindow::new(
            self.weekday.unwrap_or(current.window.weekday),
            self.start.unwrap_or(current.window.start),
            self.end.unwrap_or(current.window.end),
        )?;
        Ok(Booking {
            id: current.id,
            room_id: changes.room_id.unwrap_or(current.room_id),
            course_id: changes.course_id.unwrap_or(current.course_id),
            instructor_id: changes.instructor_id.unwrap_or(current.instructor_id),
            academic_unit_id: changes.academic_unit_id.unwrap_or(current.academic_unit_id),
            window,
            kind: self.kind.unwrap_or(current.kind),
            created_at: current.created_at,
            updated_at: current.updated_at,
        })
    }
}

fn observe<T>(op: &'static str, started: Instant, result: &Result<T, EngineError>) {
    metrics::histogram!(ADMISSION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
    match result {
        Ok(_) => metrics::counter!(BOOKINGS_ADMITTED_TOTAL, "op" => op).increment(1),
        Err(e) => {
            metrics::counter!(BOOKINGS_REJECTED_TOTAL, "op" => op, "reason" => e.reason())
                .increment(1);
            if let EngineError::StorageUnavailable(msg) = e {
                error!("{op}: storage unavailable: {msg}");
            } else {
                debug!("{op} rejected: {e}");
            }
        }
    }
}

impl Engine {
    /// Validate and admit a new booking.
    ///
    /// Literal errors are reported before the store is touched and an empty or
    /// inverted window before any conflict check. On success the stored
    /// booking (with its id and timestamps) is returned.
    pub async fn create_booking(&self, request: NewBooking) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.admit_create(request).await;
        observe("create", started, &result);
        result
    }

    async fn admit_create(&self, request: NewBooking) -> Result<Booking, EngineError> {
        let weekday: Weekday = literal(&request.weekday)?;
        let start: ClockTime = literal(&request.start_time)?;
        let end: ClockTime = literal(&request.end_time)?;
        let kind: ClassKind = optional_literal(request.kind.as_deref())?.unwrap_or_default();
        let window = TimeWindow::new(weekday, start, end)?;

        let now = now_ms();
        let candidate = Booking {
            id: request.id.unwrap_or_else(Ulid::new),
            room_id: request.room_id,
            course_id: request.course_id,
            instructor_id: request.instructor_id,
            academic_unit_id: request.academic_unit_id,
            window,
            kind,
            created_at: now,
            updated_at: now,
        };

        let locks = self
            .locks
            .acquire(LockKey::for_booking(&candidate), self.lock_timeout)
            .await?;
        if self.store.get(candidate.id).await?.is_some() {
            return Err(EngineError::AlreadyExists(candidate.id));
        }
        let existing = self.same_day_bookings(&candidate).await?;
        check_create(&candidate, &existing)?;

        let slot = self.reserve_slot().await?;
        self.commit(Event::BookingCreated { booking: candidate.clone() }, locks, Some(slot))
            .await?;
        info!(
            "booking {} admitted: room {} instructor {} {}",
            candidate.id, candidate.room_id, candidate.instructor_id, candidate.window
        );
        Ok(candidate)
    }

    /// Validate and apply a partial update to booking `id`.
    ///
    /// Unset fields keep their stored values; the merged record is validated
    /// as a whole with the booking's own prior state excluded from the
    /// conflict set. An update that changes nothing commits nothing.
    pub async fn update_booking(
        &self,
        id: BookingId,
        changes: BookingChanges,
    ) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.admit_update(id, changes).await;
        observe("update", started, &result);
        result
    }

    async fn admit_update(&self, id: BookingId, changes: BookingChanges) -> Result<Booking, EngineError> {
        let parsed = ParsedChanges::parse(&changes)?;

        for _ in 0..MAX_LOCK_ATTEMPTS {
            let current = self.store.get(id).await?.ok_or(EngineError::NotFound(id))?;
            let mut candidate = parsed.merge(&current, &changes)?;

            // Old keys too: the booking leaves those sets.
            let keys = LockKey::for_booking(&current)
                .into_iter()
                .chain(LockKey::for_booking(&candidate));
            let locks = self.locks.acquire(keys, self.lock_timeout).await?;
            if self.store.get(id).await?.as_ref() != Some(&current) {
                debug!("booking {id} changed while waiting for locks, retrying");
                continue;
            }
            if candidate == current {
                return Ok(current);
            }

            let existing = self.same_day_bookings(&candidate).await?;
            check_update(&candidate, id, &existing)?;

            candidate.updated_at = now_ms().max(current.updated_at);
            self.commit(
                Event::BookingUpdated {
                    previous: current,
                    booking: candidate.clone(),
                },
                locks,
                None,
            )
            .await?;
            info!(
                "booking {id} updated: room {} instructor {} {}",
                candidate.room_id, candidate.instructor_id, candidate.window
            );
            return Ok(candidate);
        }
        Err(EngineError::Busy)
    }

    /// Hard-delete booking `id`, returning the removed record.
    pub async fn delete_booking(&self, id: BookingId) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.remove(id).await;
        observe("delete", started, &result);
        result
    }

    async fn remove(&self, id: BookingId) -> Result<Booking, EngineError> {
        for _ in 0..MAX_LOCK_ATTEMPTS {
            let current = self.store.get(id).await?.ok_or(EngineError::NotFound(id))?;
            let locks = self
                .locks
                .acquire(LockKey::for_booking(&current), self.lock_timeout)
                .await?;
            match self.store.get(id).await? {
                None => return Err(EngineError::NotFound(id)),
                Some(latest) if latest != current => continue,
                Some(_) => {}
            }
            self.commit(Event::BookingDeleted { booking: current.clone() }, locks, None)
                .await?;
            info!("booking {id} deleted");
            return Ok(current);
        }
        Err(EngineError::Busy)
    }

    /// Every booking that could conflict with `candidate`: same day and same
    /// room, or same day and same instructor.
    async fn same_day_bookings(&self, candidate: &Booking) -> Result<Vec<Booking>, EngineError> {
        let day = candidate.weekday();
        let mut out = self
            .store
            .find_by_room_and_weekday(candidate.room_id, day)
            .await?;
        out.extend(
            self.store
                .find_by_instructor_and_weekday(candidate.instructor_id, day)
                .await?,
        );
        Ok(out)
    }
}
