use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

fn booking_row(lesson_id: Ulid, b: &Booking) -> BookingRow {
    BookingRow {
        id: b.id,
        lesson_id,
        user_id: b.user_id,
        status: b.status,
        waitlisted: matches!(b.seat, Seat::Waitlisted { .. }),
        position: match b.seat {
            Seat::Waitlisted { position } => Some(position),
            Seat::Active => None,
        },
        booked_at: b.booked_at,
        cancelled_at: b.cancelled_at,
        cancellation_reason: b.cancellation_reason,
    }
}

impl Engine {
    /// List lessons, optionally restricted to a schedule window.
    pub async fn list_lessons(&self, window: Option<Span>) -> Result<Vec<LessonInfo>, EngineError> {
        if let Some(w) = &window
            && w.end - w.start > MAX_QUERY_WINDOW_MS {
                return Err(EngineError::LimitExceeded("query window too wide"));
            }

        let arcs: Vec<_> = self.lessons.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for ls_arc in arcs {
            let guard = ls_arc.read().await;
            if let Some(w) = &window
                && !guard.span.overlaps(w) {
                    continue;
                }
            out.push(LessonInfo {
                id: guard.id,
                start: guard.span.start,
                end: guard.span.end,
                max_capacity: guard.max_capacity,
                cancellation_deadline_hours: guard.cancellation_deadline_hours,
                status: guard.status,
                title: guard.details.title.clone(),
                active_count: guard.active_count() as u32,
                waitlist_len: guard.waitlist().len() as u32,
            });
        }
        out.sort_by_key(|l| (l.start, l.id));
        Ok(out)
    }

    /// All bookings on a lesson, admission order. Missing lesson → empty.
    pub async fn get_bookings(&self, lesson_id: Ulid) -> Result<Vec<BookingRow>, EngineError> {
        let ls = match self.get_lesson(&lesson_id) {
            Some(ls) => ls,
            None => return Ok(vec![]),
        };
        let guard = ls.read().await;
        Ok(guard.bookings.iter().map(|b| booking_row(lesson_id, b)).collect())
    }

    /// A user's bookings across all lessons.
    pub async fn get_bookings_for_user(&self, user_id: Ulid) -> Result<Vec<BookingRow>, EngineError> {
        let arcs: Vec<_> = self.lessons.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for ls_arc in arcs {
            let guard = ls_arc.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.user_id == user_id)
                    .map(|b| booking_row(guard.id, b)),
            );
        }
        out.sort_by_key(|b| (b.booked_at, b.id));
        Ok(out)
    }

    /// The live waitlist queue for a lesson, lowest position first.
    pub async fn get_waitlist(&self, lesson_id: Ulid) -> Result<Vec<WaitlistEntry>, EngineError> {
        let ls = match self.get_lesson(&lesson_id) {
            Some(ls) => ls,
            None => return Ok(vec![]),
        };
        let guard = ls.read().await;
        Ok(guard
            .waitlist()
            .into_iter()
            .filter_map(|b| {
                b.waitlist_position().map(|position| WaitlistEntry {
                    booking_id: b.id,
                    lesson_id,
                    user_id: b.user_id,
                    position,
                    booked_at: b.booked_at,
                })
            })
            .collect())
    }

    /// Dashboard counts: bookings grouped by status across all lessons.
    pub async fn booking_stats(&self) -> Result<BookingStats, EngineError> {
        let arcs: Vec<_> = self.lessons.iter().map(|e| e.value().clone()).collect();
        let mut stats = BookingStats::default();
        for ls_arc in arcs {
            let guard = ls_arc.read().await;
            for b in &guard.bookings {
                stats.total += 1;
                match b.status {
                    BookingStatus::Pending => stats.pending += 1,
                    BookingStatus::Confirmed => stats.confirmed += 1,
                    BookingStatus::Cancelled => stats.cancelled += 1,
                    BookingStatus::Completed => stats.completed += 1,
                    BookingStatus::NoShow => stats.no_show += 1,
                }
            }
        }
        Ok(stats)
    }
}
