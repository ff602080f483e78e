use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const WEEK_MS: Ms = 7 * 24 * HOUR_MS;

/// Half-open interval `[start, end)` — a lesson's scheduled time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Shift both endpoints by `delta` milliseconds.
    pub fn shifted(&self, delta: Ms) -> Span {
        Span::new(self.start + delta, self.end + delta)
    }
}

/// Lifecycle of a lesson. Transitions are monotone:
/// Draft → Published, Draft|Published → Archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LessonStatus {
    Draft,
    Published,
    Archived,
}

impl LessonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LessonStatus::Draft => "draft",
            LessonStatus::Published => "published",
            LessonStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(LessonStatus::Draft),
            "published" => Some(LessonStatus::Published),
            "archived" => Some(LessonStatus::Archived),
            _ => None,
        }
    }

    /// Whether `self → next` is a legal lesson transition.
    pub fn can_become(self, next: LessonStatus) -> bool {
        matches!(
            (self, next),
            (LessonStatus::Draft, LessonStatus::Published)
                | (LessonStatus::Draft, LessonStatus::Archived)
                | (LessonStatus::Published, LessonStatus::Archived)
        )
    }
}

/// Booking lifecycle. Pending and Confirmed are live; the rest are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

impl BookingStatus {
    /// Live bookings: not yet cancelled, completed, or no-showed.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    /// Whether `self → next` is a legal transition.
    ///
    /// Pending → Confirmed; Pending|Confirmed → Cancelled|Completed|NoShow.
    /// Terminal states never transition.
    pub fn can_become(self, next: BookingStatus) -> bool {
        match (self, next) {
            (BookingStatus::Pending, BookingStatus::Confirmed) => true,
            (from, BookingStatus::Cancelled)
            | (from, BookingStatus::Completed)
            | (from, BookingStatus::NoShow) => from.is_active(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
            BookingStatus::NoShow => "no_show",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancellationReason {
    UserCancelled,
    InstructorCancelled,
    LessonCancelled,
    Weather,
    Emergency,
    Other,
}

impl CancellationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancellationReason::UserCancelled => "user_cancelled",
            CancellationReason::InstructorCancelled => "instructor_cancelled",
            CancellationReason::LessonCancelled => "lesson_cancelled",
            CancellationReason::Weather => "weather",
            CancellationReason::Emergency => "emergency",
            CancellationReason::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user_cancelled" => Some(CancellationReason::UserCancelled),
            "instructor_cancelled" => Some(CancellationReason::InstructorCancelled),
            "lesson_cancelled" => Some(CancellationReason::LessonCancelled),
            "weather" => Some(CancellationReason::Weather),
            "emergency" => Some(CancellationReason::Emergency),
            "other" => Some(CancellationReason::Other),
            _ => None,
        }
    }
}

/// Where a booking sits: holding a capacity-consuming seat, or queued.
///
/// Written exactly once at admission and once more at promotion; never
/// mutated otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Seat {
    Active,
    Waitlisted { position: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub status: BookingStatus,
    pub seat: Seat,
    pub booked_at: Ms,
    pub cancelled_at: Option<Ms>,
    pub cancellation_reason: Option<CancellationReason>,
}

impl Booking {
    /// Consumes a capacity slot: active seat, live status.
    pub fn holds_seat(&self) -> bool {
        self.seat == Seat::Active && self.status.is_active()
    }

    /// Live entry in the waitlist queue.
    pub fn on_waitlist(&self) -> bool {
        matches!(self.seat, Seat::Waitlisted { .. }) && self.status.is_active()
    }

    pub fn waitlist_position(&self) -> Option<u32> {
        match self.seat {
            Seat::Waitlisted { position } if self.status.is_active() => Some(position),
            _ => None,
        }
    }
}

/// Descriptive lesson fields carried verbatim through a rollover.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonDetails {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub instructor: Option<String>,
    pub location: Option<String>,
    pub level: Option<String>,
}

/// The per-lesson aggregate: the lesson and every booking ever made on it.
/// One of these lives behind each `Arc<RwLock<_>>`; the lock is the
/// transaction boundary for all capacity- and waitlist-affecting writes.
#[derive(Debug, Clone)]
pub struct LessonState {
    pub id: Ulid,
    pub span: Span,
    pub max_capacity: u32,
    pub cancellation_deadline_hours: u32,
    pub status: LessonStatus,
    pub details: LessonDetails,
    pub bookings: Vec<Booking>,
}

impl LessonState {
    pub fn new(
        id: Ulid,
        span: Span,
        max_capacity: u32,
        cancellation_deadline_hours: u32,
        status: LessonStatus,
        details: LessonDetails,
    ) -> Self {
        Self {
            id,
            span,
            max_capacity,
            cancellation_deadline_hours,
            status,
            details,
            bookings: Vec::new(),
        }
    }

    /// The capacity ledger: live seat-holding bookings. Always derived,
    /// never cached.
    pub fn active_count(&self) -> usize {
        self.bookings.iter().filter(|b| b.holds_seat()).count()
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// The user's live booking on this lesson, seated or waitlisted.
    pub fn active_booking_for(&self, user_id: Ulid) -> Option<&Booking> {
        self.bookings
            .iter()
            .find(|b| b.user_id == user_id && b.status.is_active())
    }

    /// Position for the next enqueue: one past the highest live position.
    /// The live sequence stays strictly increasing in `booked_at` order.
    pub fn next_waitlist_position(&self) -> u32 {
        self.bookings
            .iter()
            .filter_map(|b| b.waitlist_position())
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Head of the waitlist queue: lowest live position.
    pub fn waitlist_head(&self) -> Option<Ulid> {
        self.bookings
            .iter()
            .filter(|b| b.on_waitlist())
            .min_by_key(|b| b.waitlist_position())
            .map(|b| b.id)
    }

    /// Live waitlist entries, lowest position first.
    pub fn waitlist(&self) -> Vec<&Booking> {
        let mut queue: Vec<&Booking> =
            self.bookings.iter().filter(|b| b.on_waitlist()).collect();
        queue.sort_by_key(|b| b.waitlist_position());
        queue
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
///
/// A cascade that must survive a crash as a unit is a single record:
/// `BookingCancelled` carries the promotion it caused, `LessonRolledOver`
/// carries the archival, the completions, and the successor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    LessonCreated {
        id: Ulid,
        span: Span,
        max_capacity: u32,
        cancellation_deadline_hours: u32,
        status: LessonStatus,
        details: LessonDetails,
    },
    /// Full-snapshot semantics: carries the merged post-edit values.
    LessonUpdated {
        id: Ulid,
        span: Span,
        max_capacity: u32,
        cancellation_deadline_hours: u32,
        details: LessonDetails,
    },
    LessonPublished {
        id: Ulid,
    },
    LessonArchived {
        id: Ulid,
    },
    LessonDeleted {
        id: Ulid,
    },
    BookingAdmitted {
        id: Ulid,
        lesson_id: Ulid,
        user_id: Ulid,
        seat: Seat,
        status: BookingStatus,
        booked_at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        lesson_id: Ulid,
        reason: CancellationReason,
        cancelled_at: Ms,
        /// Waitlist head promoted into the freed seat, if any.
        promoted: Option<Ulid>,
    },
    AttendanceMarked {
        lesson_id: Ulid,
        booking_ids: Vec<Ulid>,
        attended: bool,
    },
    LessonRolledOver {
        source_id: Ulid,
        successor_id: Ulid,
        successor_span: Span,
        /// Live bookings force-completed on the source.
        completed: Vec<Ulid>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonInfo {
    pub id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub max_capacity: u32,
    pub cancellation_deadline_hours: u32,
    pub status: LessonStatus,
    pub title: Option<String>,
    pub active_count: u32,
    pub waitlist_len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRow {
    pub id: Ulid,
    pub lesson_id: Ulid,
    pub user_id: Ulid,
    pub status: BookingStatus,
    pub waitlisted: bool,
    pub position: Option<u32>,
    pub booked_at: Ms,
    pub cancelled_at: Option<Ms>,
    pub cancellation_reason: Option<CancellationReason>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitlistEntry {
    pub booking_id: Ulid,
    pub lesson_id: Ulid,
    pub user_id: Ulid,
    pub position: u32,
    pub booked_at: Ms,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingStats {
    pub total: u64,
    pub confirmed: u64,
    pub pending: u64,
    pub cancelled: u64,
    pub completed: u64,
    pub no_show: u64,
}
