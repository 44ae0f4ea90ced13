use async_trait::async_trait;
use dashmap::DashMap;

use crate::model::*;

/// Failure of the storage layer itself (I/O, writer gone), as opposed to a
/// rejected booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Io(String),
    Closed(&'static str),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
            StoreError::Closed(what) => write!(f, "{what}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Durable collection of bookings as seen by the admission engine.
///
/// Reads return bookings sorted by `(start, id)`. `commit` must make the
/// event durable before it becomes visible to subsequent reads.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn find_by_room_and_weekday(
        &self,
        room_id: RoomId,
        weekday: Weekday,
    ) -> Result<Vec<Booking>, StoreError>;

    async fn find_by_instructor_and_weekday(
        &self,
        instructor_id: InstructorId,
        weekday: Weekday,
    ) -> Result<Vec<Booking>, StoreError>;

    async fn get(&self, id: BookingId) -> Result<Option<Booking>, StoreError>;

    async fn list(&self, filter: &BookingFilter) -> Result<Vec<Booking>, StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;

    async fn commit(&self, event: &Event) -> Result<(), StoreError>;
}

type DayKey<T> = (T, Weekday);

/// Booking table plus per-day room and instructor indexes.
pub struct InMemoryStore {
    bookings: DashMap<BookingId, Booking>,
    by_room: DashMap<DayKey<RoomId>, Vec<BookingId>>,
    by_instructor: DashMap<DayKey<InstructorId>, Vec<BookingId>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            bookings: DashMap::new(),
            by_room: DashMap::new(),
            by_instructor: DashMap::new(),
        }
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }

    pub fn get_booking(&self, id: &BookingId) -> Option<Booking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub fn room_day(&self, room_id: RoomId, weekday: Weekday) -> Vec<Booking> {
        self.resolve(self.by_room.get(&(room_id, weekday)).map(|e| e.value().clone()))
    }

    pub fn instructor_day(&self, instructor_id: InstructorId, weekday: Weekday) -> Vec<Booking> {
        self.resolve(
            self.by_instructor
                .get(&(instructor_id, weekday))
                .map(|e| e.value().clone()),
        )
    }

    pub fn matching(&self, filter: &BookingFilter) -> Vec<Booking> {
        if let Some(id) = filter.id {
            return self.get_booking(&id).filter(|b| filter.matches(b)).into_iter().collect();
        }
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|b| (b.window.weekday, b.window.start, b.id));
        out
    }

    /// Every live booking as a `BookingCreated` event, in id order. Replaying
    /// the result rebuilds the current state.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut bookings: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        bookings.sort_by_key(|b| b.id);
        bookings
            .into_iter()
            .map(|booking| Event::BookingCreated { booking })
            .collect()
    }

    fn resolve(&self, ids: Option<Vec<BookingId>>) -> Vec<Booking> {
        let mut out: Vec<Booking> = ids
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.get_booking(id))
            .collect();
        out.sort_by_key(|b| (b.window.start, b.id));
        out
    }

    // ── Event application ────────────────────────────────────

    /// Apply a committed event. The caller serializes writers per resource key.
    pub fn apply(&self, event: &Event) {
        match event {
            Event::BookingCreated { booking } => self.insert(booking.clone()),
            Event::BookingUpdated { previous, booking } => {
                self.unindex(previous);
                self.insert(booking.clone());
            }
            Event::BookingDeleted { booking } => {
                self.unindex(booking);
                self.bookings.remove(&booking.id);
            }
        }
    }

    fn insert(&self, booking: Booking) {
        let id = booking.id;
        let room_key = (booking.room_id, booking.weekday());
        let instructor_key = (booking.instructor_id, booking.weekday());
        self.bookings.insert(id, booking);
        push_unique(&self.by_room, room_key, id);
        push_unique(&self.by_instructor, instructor_key, id);
    }

    fn unindex(&self, booking: &Booking) {
        remove_from(&self.by_room, &(booking.room_id, booking.weekday()), &booking.id);
        remove_from(
            &self.by_instructor,
            &(booking.instructor_id, booking.weekday()),
            &booking.id,
        );
    }
}

fn push_unique<K: Eq + std::hash::Hash>(index: &DashMap<K, Vec<BookingId>>, key: K, id: BookingId) {
    let mut ids = index.entry(key).or_default();
    if !ids.contains(&id) {
        ids.push(id);
    }
}

fn remove_from<K: Eq + std::hash::Hash>(index: &DashMap<K, Vec<BookingId>>, key: &K, id: &BookingId) {
    if let Some(mut ids) = index.get_mut(key) {
        ids.retain(|b| b != id);
    }
    index.remove_if(key, |_, ids| ids.is_empty());
}

#[async_trait]
impl BookingStore for InMemoryStore {
    async fn find_by_room_and_weekday(
        &self,
        room_id: RoomId,
        weekday: Weekday,
    ) -> Result<Vec<Booking>, StoreError> {
        Ok(self.room_day(room_id, weekday))
    }

    async fn find_by_instructor_and_weekday(
        &self,
        instructor_id: InstructorId,
        weekday: Weekday,
    ) -> Result<Vec<Booking>, StoreError> {
        Ok(self.instructor_day(instructor_id, weekday))
    }

    async fn get(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        Ok(self.get_booking(&id))
    }

    async fn list(&self, filter: &BookingFilter) -> Result<Vec<Booking>, StoreError> {
        Ok(self.matching(filter))
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.booking_count())
    }

    async fn commit(&self, event: &Event) -> Result<(), StoreError> {
        self.apply(event);
        Ok(())
    }
}
