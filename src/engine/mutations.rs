use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::policy::{can_cancel, now_ms, validate_span};
use super::{apply_to_lesson, rollover_in_place, Engine, EngineError, WalCommand};

/// Outcome of an admission: a seat, or a queue position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Confirmed,
    Waitlisted { position: u32 },
}

/// Outcome of a cancellation: the booking promoted into the freed seat, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancellation {
    pub promoted: Option<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rollover {
    pub successor_id: Ulid,
    pub completed: usize,
}

/// Partial lesson edit; `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct LessonPatch {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub max_capacity: Option<u32>,
    pub cancellation_deadline_hours: Option<u32>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub instructor: Option<String>,
    pub location: Option<String>,
    pub level: Option<String>,
}

fn validate_details(details: &LessonDetails) -> Result<(), EngineError> {
    let fields = [
        &details.title,
        &details.description,
        &details.category,
        &details.instructor,
        &details.location,
        &details.level,
    ];
    for field in fields.into_iter().flatten() {
        if field.len() > MAX_TEXT_LEN {
            return Err(EngineError::LimitExceeded("lesson text field too long"));
        }
    }
    Ok(())
}

fn validate_lesson_shape(
    span: &Span,
    max_capacity: u32,
    cancellation_deadline_hours: u32,
) -> Result<(), EngineError> {
    validate_span(span)?;
    if max_capacity == 0 {
        return Err(EngineError::LimitExceeded("capacity must be positive"));
    }
    if max_capacity > MAX_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    if cancellation_deadline_hours > MAX_DEADLINE_HOURS {
        return Err(EngineError::LimitExceeded("cancellation deadline too far out"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_lesson(
        &self,
        id: Ulid,
        span: Span,
        max_capacity: u32,
        cancellation_deadline_hours: u32,
        status: LessonStatus,
        details: LessonDetails,
    ) -> Result<(), EngineError> {
        if self.lessons.len() >= MAX_LESSONS_PER_STUDIO {
            return Err(EngineError::LimitExceeded("too many lessons"));
        }
        validate_lesson_shape(&span, max_capacity, cancellation_deadline_hours)?;
        validate_details(&details)?;
        if self.lessons.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::LessonCreated {
            id,
            span,
            max_capacity,
            cancellation_deadline_hours,
            status,
            details: details.clone(),
        };
        self.wal_append(&event).await?;
        let ls = LessonState::new(id, span, max_capacity, cancellation_deadline_hours, status, details);
        self.lessons.insert(id, Arc::new(RwLock::new(ls)));
        Ok(())
    }

    /// Merge a partial edit onto the lesson and commit the merged snapshot.
    /// Archived lessons are closed to edits; a capacity below the current
    /// active booking count is refused so the ledger invariant keeps holding.
    pub async fn update_lesson(&self, id: Ulid, patch: LessonPatch) -> Result<(), EngineError> {
        let ls = self
            .get_lesson(&id)
            .ok_or(EngineError::NotFound(id))?;
        let mut guard = ls.write().await;
        if guard.status == LessonStatus::Archived {
            return Err(EngineError::LessonUnavailable(id));
        }

        let span = Span {
            start: patch.start.unwrap_or(guard.span.start),
            end: patch.end.unwrap_or(guard.span.end),
        };
        let max_capacity = patch.max_capacity.unwrap_or(guard.max_capacity);
        let cancellation_deadline_hours = patch
            .cancellation_deadline_hours
            .unwrap_or(guard.cancellation_deadline_hours);
        validate_lesson_shape(&span, max_capacity, cancellation_deadline_hours)?;
        if (max_capacity as usize) < guard.active_count() {
            return Err(EngineError::LimitExceeded("capacity below active bookings"));
        }

        let details = LessonDetails {
            title: patch.title.or_else(|| guard.details.title.clone()),
            description: patch.description.or_else(|| guard.details.description.clone()),
            category: patch.category.or_else(|| guard.details.category.clone()),
            instructor: patch.instructor.or_else(|| guard.details.instructor.clone()),
            location: patch.location.or_else(|| guard.details.location.clone()),
            level: patch.level.or_else(|| guard.details.level.clone()),
        };
        validate_details(&details)?;

        let event = Event::LessonUpdated {
            id,
            span,
            max_capacity,
            cancellation_deadline_hours,
            details,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Publish or archive. Lesson status is monotone: Draft → Published,
    /// Draft|Published → Archived.
    pub async fn set_lesson_status(&self, id: Ulid, status: LessonStatus) -> Result<(), EngineError> {
        let ls = self
            .get_lesson(&id)
            .ok_or(EngineError::NotFound(id))?;
        let mut guard = ls.write().await;
        if !guard.status.can_become(status) {
            return Err(EngineError::InvalidTransition {
                from: guard.status.as_str(),
                to: status.as_str(),
            });
        }
        let event = match status {
            LessonStatus::Published => Event::LessonPublished { id },
            LessonStatus::Archived => Event::LessonArchived { id },
            LessonStatus::Draft => {
                return Err(EngineError::InvalidTransition {
                    from: guard.status.as_str(),
                    to: status.as_str(),
                });
            }
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Bookings are history; a lesson can only be deleted before it has any.
    pub async fn delete_lesson(&self, id: Ulid) -> Result<(), EngineError> {
        let ls = self
            .get_lesson(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = ls.read().await;
        if !guard.bookings.is_empty() {
            return Err(EngineError::HasBookings(id));
        }
        drop(guard);

        let event = Event::LessonDeleted { id };
        self.wal_append(&event).await?;
        self.lessons.remove(&id);
        Ok(())
    }

    /// The admission controller. Reads the capacity ledger and either seats
    /// the booking (Confirmed) or enqueues it (Pending, next position). The
    /// ledger read and the insert happen under one write lock, so two racing
    /// admissions can never both take the last seat.
    pub async fn request_booking(
        &self,
        id: Ulid,
        lesson_id: Ulid,
        user_id: Ulid,
    ) -> Result<Admission, EngineError> {
        if self.booking_to_lesson.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let ls = self
            .get_lesson(&lesson_id)
            .ok_or(EngineError::LessonUnavailable(lesson_id))?;
        let mut guard = ls.write().await;
        if guard.status != LessonStatus::Published {
            return Err(EngineError::LessonUnavailable(lesson_id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_LESSON {
            return Err(EngineError::LimitExceeded("too many bookings on lesson"));
        }
        if guard.active_booking_for(user_id).is_some() {
            return Err(EngineError::AlreadyBooked { lesson_id, user_id });
        }

        let (seat, status, admission) = if guard.active_count() < guard.max_capacity as usize {
            (Seat::Active, BookingStatus::Confirmed, Admission::Confirmed)
        } else {
            let position = guard.next_waitlist_position();
            (
                Seat::Waitlisted { position },
                BookingStatus::Pending,
                Admission::Waitlisted { position },
            )
        };

        let event = Event::BookingAdmitted {
            id,
            lesson_id,
            user_id,
            seat,
            status,
            booked_at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(admission)
    }

    /// Cancel a booking. Gated by the state machine and the deadline policy;
    /// when the cancellation frees a seat, the waitlist head is promoted in
    /// the same atomic unit (same lock scope, same WAL record).
    pub async fn cancel_booking(
        &self,
        id: Ulid,
        reason: CancellationReason,
    ) -> Result<Cancellation, EngineError> {
        let (lesson_id, mut guard) = self.resolve_booking_write(&id).await?;
        let (status, seat) = {
            let b = guard.booking(id).ok_or(EngineError::NotFound(id))?;
            (b.status, b.seat)
        };
        if !status.can_become(BookingStatus::Cancelled) {
            return Err(EngineError::InvalidTransition {
                from: status.as_str(),
                to: BookingStatus::Cancelled.as_str(),
            });
        }
        let now = now_ms();
        if !can_cancel(&guard, now) {
            return Err(EngineError::DeadlinePassed { lesson_id });
        }

        // Only a seated booking frees capacity; a waitlisted one just leaves
        // the queue.
        let promoted = if seat == Seat::Active {
            guard.waitlist_head()
        } else {
            None
        };

        let event = Event::BookingCancelled {
            id,
            lesson_id,
            reason,
            cancelled_at: now,
            promoted,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(Cancellation { promoted })
    }

    /// Bulk attendance marking: every id transitions to Completed (attended)
    /// or NoShow. Ids may span lessons; locks are taken in sorted lesson-id
    /// order and every transition is validated before any is committed.
    pub async fn mark_attendance(
        &self,
        booking_ids: &[Ulid],
        attended: bool,
    ) -> Result<usize, EngineError> {
        if booking_ids.is_empty() {
            return Ok(0);
        }
        if booking_ids.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("attendance batch too large"));
        }
        let target = if attended {
            BookingStatus::Completed
        } else {
            BookingStatus::NoShow
        };

        let mut by_lesson: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
        for id in booking_ids {
            let lesson_id = self
                .lesson_for_booking(id)
                .ok_or(EngineError::NotFound(*id))?;
            let batch = by_lesson.entry(lesson_id).or_default();
            if !batch.contains(id) {
                batch.push(*id);
            }
        }

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut lesson_ids: Vec<Ulid> = by_lesson.keys().copied().collect();
        lesson_ids.sort();

        let mut guards = Vec::with_capacity(lesson_ids.len());
        let mut guard_idx = HashMap::new();
        for lid in &lesson_ids {
            let ls = self.get_lesson(lid).ok_or(EngineError::NotFound(*lid))?;
            let guard = ls.write_owned().await;
            guard_idx.insert(*lid, guards.len());
            guards.push(guard);
        }

        // Phase 1: validate every transition against current state.
        for (lid, bids) in &by_lesson {
            let guard = &guards[guard_idx[lid]];
            for bid in bids {
                let b = guard.booking(*bid).ok_or(EngineError::NotFound(*bid))?;
                if !b.status.can_become(target) {
                    return Err(EngineError::InvalidTransition {
                        from: b.status.as_str(),
                        to: target.as_str(),
                    });
                }
            }
        }

        // Phase 2: all validated — commit one record per lesson.
        let mut marked = 0;
        for lid in &lesson_ids {
            let bids = by_lesson[lid].clone();
            marked += bids.len();
            let event = Event::AttendanceMarked {
                lesson_id: *lid,
                booking_ids: bids,
                attended,
            };
            self.wal_append(&event).await?;
            apply_to_lesson(&mut guards[guard_idx[lid]], &event, &self.booking_to_lesson);
        }

        Ok(marked)
    }

    /// Roll a lesson over to next week, as one atomic unit: archive the
    /// source, force-complete its live bookings (waitlisted included), and
    /// publish a successor one week later with an empty booking set.
    pub async fn rollover_for_next_week(&self, lesson_id: Ulid) -> Result<Rollover, EngineError> {
        if self.lessons.len() >= MAX_LESSONS_PER_STUDIO {
            return Err(EngineError::LimitExceeded("too many lessons"));
        }
        let ls = self
            .get_lesson(&lesson_id)
            .ok_or(EngineError::NotFound(lesson_id))?;
        let mut guard = ls.write().await;
        if guard.status == LessonStatus::Archived {
            return Err(EngineError::InvalidTransition {
                from: LessonStatus::Archived.as_str(),
                to: LessonStatus::Archived.as_str(),
            });
        }

        let successor_span = guard.span.shifted(WEEK_MS);
        validate_span(&successor_span)?;
        let successor_id = Ulid::new();
        let completed: Vec<Ulid> = guard
            .bookings
            .iter()
            .filter(|b| b.status.is_active())
            .map(|b| b.id)
            .collect();

        let event = Event::LessonRolledOver {
            source_id: lesson_id,
            successor_id,
            successor_span,
            completed: completed.clone(),
        };
        self.wal_append(&event).await?;
        let successor = rollover_in_place(&mut guard, successor_id, successor_span, &completed);
        self.lessons
            .insert(successor_id, Arc::new(RwLock::new(successor)));
        Ok(Rollover {
            successor_id,
            completed: completed.len(),
        })
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate
    /// the current state: one create per lesson, one admission per booking,
    /// plus a cancellation record where terminal cancellation details exist.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        let mut seen = HashSet::new();

        let arcs: Vec<_> = self.lessons.iter().map(|e| e.value().clone()).collect();
        for ls_arc in arcs {
            let guard = ls_arc.read().await;
            if !seen.insert(guard.id) {
                continue;
            }
            events.push(Event::LessonCreated {
                id: guard.id,
                span: guard.span,
                max_capacity: guard.max_capacity,
                cancellation_deadline_hours: guard.cancellation_deadline_hours,
                status: guard.status,
                details: guard.details.clone(),
            });
            for b in &guard.bookings {
                if b.status == BookingStatus::Cancelled {
                    events.push(Event::BookingAdmitted {
                        id: b.id,
                        lesson_id: guard.id,
                        user_id: b.user_id,
                        seat: b.seat,
                        status: BookingStatus::Pending,
                        booked_at: b.booked_at,
                    });
                    events.push(Event::BookingCancelled {
                        id: b.id,
                        lesson_id: guard.id,
                        reason: b.cancellation_reason.unwrap_or(CancellationReason::Other),
                        cancelled_at: b.cancelled_at.unwrap_or(b.booked_at),
                        promoted: None,
                    });
                } else {
                    events.push(Event::BookingAdmitted {
                        id: b.id,
                        lesson_id: guard.id,
                        user_id: b.user_id,
                        seat: b.seat,
                        status: b.status,
                        booked_at: b.booked_at,
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::ConcurrentConflict)?;
        rx.await
            .map_err(|_| EngineError::ConcurrentConflict)?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
