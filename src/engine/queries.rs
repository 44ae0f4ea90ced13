use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_booking(&self, id: BookingId) -> Result<Booking, EngineError> {
        self.store.get(id).await?.ok_or(EngineError::NotFound(id))
    }

    /// Bookings matching `filter`, ordered by weekday, start time, then id.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Result<Vec<Booking>, EngineError> {
        let mut bookings = self.store.list(filter).await?;
        bookings.sort_by_key(|b| (b.window.weekday, b.window.start, b.id));
        Ok(bookings)
    }

    pub async fn room_schedule(
        &self,
        room_id: RoomId,
        weekday: Weekday,
    ) -> Result<Vec<Booking>, EngineError> {
        Ok(self.store.find_by_room_and_weekday(room_id, weekday).await?)
    }

    pub async fn instructor_schedule(
        &self,
        instructor_id: InstructorId,
        weekday: Weekday,
    ) -> Result<Vec<Booking>, EngineError> {
        Ok(self
            .store
            .find_by_instructor_and_weekday(instructor_id, weekday)
            .await?)
    }

    pub async fn booking_count(&self) -> Result<usize, EngineError> {
        Ok(self.store.len().await?)
    }
}
