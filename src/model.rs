use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Only used for record metadata, never for scheduling.
pub type Ms = i64;

pub type BookingId = Ulid;
pub type RoomId = u64;
pub type CourseId = u64;
pub type InstructorId = u64;
pub type AcademicUnitId = u64;

const SECS_PER_DAY: u32 = 24 * 3600;

// ── Literal errors ───────────────────────────────────────────────

/// A boundary literal that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Time(String),
    Weekday(String),
    ClassKind(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Time(s) => write!(f, "invalid time {s:?} (expected HH:MM:SS)"),
            ParseError::Weekday(s) => write!(f, "invalid weekday {s:?}"),
            ParseError::ClassKind(s) => write!(f, "invalid class kind {s:?}"),
        }
    }
}

impl std::error::Error for ParseError {}

/// A window whose start is not strictly before its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidWindow {
    pub start: ClockTime,
    pub end: ClockTime,
}

impl fmt::Display for InvalidWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "start {} must be before end {}", self.start, self.end)
    }
}

impl std::error::Error for InvalidWindow {}

// ── Weekday ──────────────────────────────────────────────────────

/// Day of the week. Ordering follows the week starting on Monday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Weekday {
    pub const ALL: [Weekday; 7] = [
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
        Weekday::Saturday,
        Weekday::Sunday,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Weekday::Monday => "Monday",
            Weekday::Tuesday => "Tuesday",
            Weekday::Wednesday => "Wednesday",
            Weekday::Thursday => "Thursday",
            Weekday::Friday => "Friday",
            Weekday::Saturday => "Saturday",
            Weekday::Sunday => "Sunday",
        }
    }
}

impl fmt::Display for Weekday {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Weekday {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Weekday::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseError::Weekday(s.to_string()))
    }
}

// ── ClockTime ────────────────────────────────────────────────────

/// Wall-clock time of day with second precision, stored as seconds since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClockTime(u32);

impl ClockTime {
    pub const MIDNIGHT: ClockTime = ClockTime(0);

    /// Returns `None` when any component is out of range.
    pub fn from_hms(hour: u32, minute: u32, second: u32) -> Option<Self> {
        if hour > 23 || minute > 59 || second > 59 {
            return None;
        }
        Some(Self(hour * 3600 + minute * 60 + second))
    }

    pub fn seconds(self) -> u32 {
        self.0
    }

    pub fn hour(self) -> u32 {
        self.0 / 3600
    }

    pub fn minute(self) -> u32 {
        self.0 % 3600 / 60
    }

    pub fn second(self) -> u32 {
        self.0 % 60
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.hour(), self.minute(), self.second())
    }
}

impl FromStr for ClockTime {
    type Err = ParseError;

    /// Strict `HH:MM:SS`: exactly two ASCII digits per component.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseError::Time(s.to_string());
        let b = s.as_bytes();
        if b.len() != 8 || b[2] != b':' || b[5] != b':' {
            return Err(err());
        }
        let two = |i: usize| -> Option<u32> {
            let (hi, lo) = (b[i], b[i + 1]);
            (hi.is_ascii_digit() && lo.is_ascii_digit())
                .then(|| u32::from(hi - b'0') * 10 + u32::from(lo - b'0'))
        };
        let (h, m, sec) = (two(0).ok_or_else(err)?, two(3).ok_or_else(err)?, two(6).ok_or_else(err)?);
        ClockTime::from_hms(h, m, sec).ok_or_else(err)
    }
}

impl TryFrom<u32> for ClockTime {
    type Error = u32;

    fn try_from(secs: u32) -> Result<Self, Self::Error> {
        if secs < SECS_PER_DAY { Ok(Self(secs)) } else { Err(secs) }
    }
}

// ── TimeWindow ───────────────────────────────────────────────────

/// Half-open interval `[start, end)` on a single weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub weekday: Weekday,
    pub start: ClockTime,
    pub end: ClockTime,
}

impl TimeWindow {
    pub fn new(weekday: Weekday, start: ClockTime, end: ClockTime) -> Result<Self, InvalidWindow> {
        if start >= end {
            return Err(InvalidWindow { start, end });
        }
        Ok(Self { weekday, start, end })
    }

    /// Parse the three boundary literals, then validate ordering.
    pub fn parse(weekday: &str, start: &str, end: &str) -> Result<Self, WindowError> {
        let weekday = weekday.parse()?;
        let start = start.parse()?;
        let end = end.parse()?;
        Ok(Self::new(weekday, start, end)?)
    }

    pub fn duration_secs(&self) -> u32 {
        self.end.seconds() - self.start.seconds()
    }

    /// Touching windows (`a.end == b.start`) do not overlap; different days never do.
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.weekday == other.weekday && self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}, {})", self.weekday, self.start, self.end)
    }
}

/// Either failure from [`TimeWindow::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    Parse(ParseError),
    Invalid(InvalidWindow),
}

impl From<ParseError> for WindowError {
    fn from(e: ParseError) -> Self {
        WindowError::Parse(e)
    }
}

impl From<InvalidWindow> for WindowError {
    fn from(e: InvalidWindow) -> Self {
        WindowError::Invalid(e)
    }
}

// ── ClassKind ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassKind {
    #[default]
    Theory,
    Practice,
    Lab,
    Other,
}

impl ClassKind {
    pub const ALL: [ClassKind; 4] = [
        ClassKind::Theory,
        ClassKind::Practice,
        ClassKind::Lab,
        ClassKind::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ClassKind::Theory => "Theory",
            ClassKind::Practice => "Practice",
            ClassKind::Lab => "Lab",
            ClassKind::Other => "Other",
        }
    }
}

impl fmt::Display for ClassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClassKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClassKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseError::ClassKind(s.to_string()))
    }
}

// ── Booking ──────────────────────────────────────────────────────

/// One weekly class assignment: a room and an instructor held for a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub room_id: RoomId,
    pub course_id: CourseId,
    pub instructor_id: InstructorId,
    pub academic_unit_id: AcademicUnitId,
    pub window: TimeWindow,
    pub kind: ClassKind,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn weekday(&self) -> Weekday {
        self.window.weekday
    }

    /// True when both bookings hold the same room at overlapping times.
    pub fn shares_room_with(&self, other: &Booking) -> bool {
        self.room_id == other.room_id && self.window.overlaps(&other.window)
    }

    /// True when both bookings hold the same instructor at overlapping times.
    pub fn shares_instructor_with(&self, other: &Booking) -> bool {
        self.instructor_id == other.instructor_id && self.window.overlaps(&other.window)
    }
}

/// Fields of a booking to be created. Weekday, times and kind stay as
/// literals so that parsing happens inside the admission path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewBooking {
    pub id: Option<BookingId>,
    pub room_id: RoomId,
    pub course_id: CourseId,
    pub instructor_id: InstructorId,
    pub academic_unit_id: AcademicUnitId,
    pub weekday: String,
    pub start_time: String,
    pub end_time: String,
    pub kind: Option<String>,
}

/// Partial update. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingChanges {
    pub room_id: Option<RoomId>,
    pub course_id: Option<CourseId>,
    pub instructor_id: Option<InstructorId>,
    pub academic_unit_id: Option<AcademicUnitId>,
    pub weekday: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub kind: Option<String>,
}

impl BookingChanges {
    pub fn is_empty(&self) -> bool {
        *self == BookingChanges::default()
    }
}

/// Equality filters for listing; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub id: Option<BookingId>,
    pub room_id: Option<RoomId>,
    pub course_id: Option<CourseId>,
    pub instructor_id: Option<InstructorId>,
    pub academic_unit_id: Option<AcademicUnitId>,
    pub weekday: Option<Weekday>,
}

impl BookingFilter {
    pub fn matches(&self, b: &Booking) -> bool {
        self.id.is_none_or(|v| v == b.id)
            && self.room_id.is_none_or(|v| v == b.room_id)
            && self.course_id.is_none_or(|v| v == b.course_id)
            && self.instructor_id.is_none_or(|v| v == b.instructor_id)
            && self.academic_unit_id.is_none_or(|v| v == b.academic_unit_id)
            && self.weekday.is_none_or(|v| v == b.weekday())
    }
}

/// Committed changes to the booking collection. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        booking: Booking,
    },
    BookingUpdated {
        previous: Booking,
        booking: Booking,
    },
    BookingDeleted {
        booking: Booking,
    },
}

impl Event {
    pub fn booking_id(&self) -> BookingId {
        match self {
            Event::BookingCreated { booking }
            | Event::BookingUpdated { booking, .. }
            | Event::BookingDeleted { booking } => booking.id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Event::BookingCreated { .. } => "created",
            Event::BookingUpdated { .. } => "updated",
            Event::BookingDeleted { .. } => "deleted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> ClockTime {
        s.parse().unwrap()
    }

    fn mon(start: &str, end: &str) -> TimeWindow {
        TimeWindow::new(Weekday::Monday, t(start), t(end)).unwrap()
    }

    #[test]
    fn clock_time_parse_and_display() {
        let c = t("09:05:30");
        assert_eq!((c.hour(), c.minute(), c.second()), (9, 5, 30));
        assert_eq!(c.to_string(), "09:05:30");
        assert_eq!(t("00:00:00"), ClockTime::MIDNIGHT);
        assert_eq!(t("23:59:59").seconds(), 86_399);
    }

    #[test]
    fn clock_time_rejects_malformed_literals() {
        for bad in [
            "", "9:00:00", "09:00", "09:00:00.5", "24:00:00", "12:60:00", "12:00:60",
            "ab:cd:ef", "09-00-00", " 09:00:00", "+9:00:00", "09:0a:00",
        ] {
            assert_eq!(
                bad.parse::<ClockTime>(),
                Err(ParseError::Time(bad.to_string())),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn clock_time_from_seconds() {
        assert_eq!(ClockTime::try_from(3600).unwrap(), t("01:00:00"));
        assert_eq!(ClockTime::try_from(86_400), Err(86_400));
    }

    #[test]
    fn weekday_literals() {
        assert_eq!("Monday".parse::<Weekday>().unwrap(), Weekday::Monday);
        assert_eq!("sunday".parse::<Weekday>().unwrap(), Weekday::Sunday);
        assert_eq!("WEDNESDAY".parse::<Weekday>().unwrap(), Weekday::Wednesday);
        assert!(matches!("Mon".parse::<Weekday>(), Err(ParseError::Weekday(_))));
        for d in Weekday::ALL {
            assert_eq!(d.to_string().parse::<Weekday>().unwrap(), d);
        }
        assert!(Weekday::Monday < Weekday::Sunday);
    }

    #[test]
    fn class_kind_literals() {
        assert_eq!("lab".parse::<ClassKind>().unwrap(), ClassKind::Lab);
        assert_eq!(ClassKind::default(), ClassKind::Theory);
        assert!(matches!("Seminar".parse::<ClassKind>(), Err(ParseError::ClassKind(_))));
    }

    #[test]
    fn window_requires_start_before_end() {
        let nine = t("09:00:00");
        let ten = t("10:00:00");
        assert!(TimeWindow::new(Weekday::Monday, nine, ten).is_ok());
        assert_eq!(
            TimeWindow::new(Weekday::Monday, nine, nine),
            Err(InvalidWindow { start: nine, end: nine })
        );
        assert_eq!(
            TimeWindow::new(Weekday::Monday, ten, nine),
            Err(InvalidWindow { start: ten, end: nine })
        );
    }

    #[test]
    fn window_parse_reports_literal_before_ordering() {
        assert!(matches!(
            TimeWindow::parse("Funday", "10:00:00", "09:00:00"),
            Err(WindowError::Parse(ParseError::Weekday(_)))
        ));
        assert!(matches!(
            TimeWindow::parse("Monday", "10:00:00", "9:00"),
            Err(WindowError::Parse(ParseError::Time(_)))
        ));
        assert!(matches!(
            TimeWindow::parse("Monday", "10:00:00", "09:00:00"),
            Err(WindowError::Invalid(_))
        ));
        let w = TimeWindow::parse("friday", "08:00:00", "09:30:00").unwrap();
        assert_eq!(w.weekday, Weekday::Friday);
        assert_eq!(w.duration_secs(), 5400);
    }

    #[test]
    fn overlap_cases() {
        let a = mon("09:00:00", "10:00:00");
        assert!(a.overlaps(&mon("09:30:00", "10:30:00"))); // tail
        assert!(a.overlaps(&mon("08:30:00", "09:30:00"))); // head
        assert!(a.overlaps(&mon("09:15:00", "09:45:00"))); // inside
        assert!(a.overlaps(&mon("08:00:00", "11:00:00"))); // around
        assert!(!a.overlaps(&mon("10:00:00", "11:00:00"))); // touching after
        assert!(!a.overlaps(&mon("08:00:00", "09:00:00"))); // touching before
        assert!(!a.overlaps(&mon("11:00:00", "12:00:00")));
    }

    #[test]
    fn overlap_is_symmetric_and_reflexive() {
        let times = ["08:00:00", "08:30:00", "09:00:00", "09:30:00", "10:00:00", "11:00:00"];
        let mut windows = Vec::new();
        for (i, s) in times.iter().enumerate() {
            for e in &times[i + 1..] {
                windows.push(mon(s, e));
            }
        }
        for a in &windows {
            assert!(a.overlaps(a));
            for b in &windows {
                assert_eq!(a.overlaps(b), b.overlaps(a), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn different_weekdays_never_overlap() {
        let a = mon("09:00:00", "10:00:00");
        let b = TimeWindow::new(Weekday::Tuesday, t("09:00:00"), t("10:00:00")).unwrap();
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
    }

    #[test]
    fn filter_matches_on_every_set_field() {
        let b = Booking {
            id: Ulid::new(),
            room_id: 1,
            course_id: 2,
            instructor_id: 3,
            academic_unit_id: 4,
            window: mon("09:00:00", "10:00:00"),
            kind: ClassKind::Theory,
            created_at: 0,
            updated_at: 0,
        };
        assert!(BookingFilter::default().matches(&b));
        assert!(BookingFilter { room_id: Some(1), weekday: Some(Weekday::Monday), ..Default::default() }.matches(&b));
        assert!(!BookingFilter { room_id: Some(1), instructor_id: Some(9), ..Default::default() }.matches(&b));
        assert!(!BookingFilter { weekday: Some(Weekday::Friday), ..Default::default() }.matches(&b));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let booking = Booking {
            id: Ulid::new(),
            room_id: 7,
            course_id: 1,
            instructor_id: 3,
            academic_unit_id: 2,
            window: mon("14:00:00", "15:30:00"),
            kind: ClassKind::Lab,
            created_at: 1_700_000_000_000,
            updated_at: 1_700_000_000_000,
        };
        let event = Event::BookingCreated { booking };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
