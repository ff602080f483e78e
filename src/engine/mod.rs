mod error;
mod mutations;
mod policy;
mod queries;

pub use error::EngineError;
pub use mutations::{Admission, Cancellation, LessonPatch, Rollover};
pub use policy::can_cancel;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedLessonState = Arc<RwLock<LessonState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and group-commits appends. The first
/// Append blocks; every Append already waiting in the channel joins its
/// batch; one fsync covers the whole batch before any caller is answered.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => batch.push((event, response)),
                        other => {
                            // The open batch must hit disk before a
                            // compaction rewrites the file under it.
                            deferred = Some(other);
                            break;
                        }
                    }
                }
                commit_batch(&mut wal, batch);
                if let Some(cmd) = deferred {
                    handle_non_append(&mut wal, cmd);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

/// Buffer the batch, fsync once, then answer every caller with the shared
/// outcome.
fn commit_batch(wal: &mut Wal, batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after an append error: every caller here is told the batch
    // failed, so none of its bytes may linger in the buffer for the next one.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let _ = tx.send(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        });
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub lessons: DashMap<Ulid, SharedLessonState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: booking id → lesson id. Bookings are never deleted,
    /// so entries live as long as the lesson.
    pub(super) booking_to_lesson: DashMap<Ulid, Ulid>,
}

/// Apply an event directly to a LessonState (no locking — caller holds the lock).
///
/// Validation happened before the event was written; application is
/// unconditional so replay stays faithful to the WAL.
fn apply_to_lesson(ls: &mut LessonState, event: &Event, bookings: &DashMap<Ulid, Ulid>) {
    match event {
        Event::LessonUpdated {
            span,
            max_capacity,
            cancellation_deadline_hours,
            details,
            ..
        } => {
            ls.span = *span;
            ls.max_capacity = *max_capacity;
            ls.cancellation_deadline_hours = *cancellation_deadline_hours;
            ls.details = details.clone();
        }
        Event::LessonPublished { .. } => {
            ls.status = LessonStatus::Published;
        }
        Event::LessonArchived { .. } => {
            ls.status = LessonStatus::Archived;
        }
        Event::BookingAdmitted {
            id,
            lesson_id,
            user_id,
            seat,
            status,
            booked_at,
        } => {
            ls.bookings.push(Booking {
                id: *id,
                user_id: *user_id,
                status: *status,
                seat: *seat,
                booked_at: *booked_at,
                cancelled_at: None,
                cancellation_reason: None,
            });
            bookings.insert(*id, *lesson_id);
        }
        Event::BookingCancelled {
            id,
            reason,
            cancelled_at,
            promoted,
            ..
        } => {
            if let Some(b) = ls.booking_mut(*id) {
                b.status = BookingStatus::Cancelled;
                b.cancelled_at = Some(*cancelled_at);
                b.cancellation_reason = Some(*reason);
            }
            // The promotion rides in the same record: the head leaves the
            // waitlist set; nobody else is touched.
            if let Some(pid) = promoted
                && let Some(p) = ls.booking_mut(*pid) {
                    p.seat = Seat::Active;
                    p.status = BookingStatus::Confirmed;
                }
        }
        Event::AttendanceMarked {
            booking_ids,
            attended,
            ..
        } => {
            let target = if *attended {
                BookingStatus::Completed
            } else {
                BookingStatus::NoShow
            };
            for id in booking_ids {
                if let Some(b) = ls.booking_mut(*id) {
                    b.status = target;
                }
            }
        }
        // Created/Deleted/RolledOver touch the lesson map itself and are
        // handled at the Engine level, not here
        Event::LessonCreated { .. }
        | Event::LessonDeleted { .. }
        | Event::LessonRolledOver { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            lessons: DashMap::new(),
            wal_tx,
            booking_to_lesson: DashMap::new(),
        };

        // Replay events — we're the sole owner of these Arcs, so try_read/try_write
        // always succeed instantly (no contention). Never use blocking_read/blocking_write
        // here because this may run inside an async context (e.g. lazy studio creation).
        for event in &events {
            match event {
                Event::LessonCreated {
                    id,
                    span,
                    max_capacity,
                    cancellation_deadline_hours,
                    status,
                    details,
                } => {
                    let ls = LessonState::new(
                        *id,
                        *span,
                        *max_capacity,
                        *cancellation_deadline_hours,
                        *status,
                        details.clone(),
                    );
                    engine.lessons.insert(*id, Arc::new(RwLock::new(ls)));
                }
                Event::LessonDeleted { id } => {
                    engine.lessons.remove(id);
                }
                Event::LessonRolledOver {
                    source_id,
                    successor_id,
                    successor_span,
                    completed,
                } => {
                    if let Some(entry) = engine.lessons.get(source_id) {
                        let ls_arc = entry.value().clone();
                        drop(entry);
                        let mut guard = ls_arc.try_write().expect("replay: uncontended write");
                        let successor =
                            rollover_in_place(&mut guard, *successor_id, *successor_span, completed);
                        engine
                            .lessons
                            .insert(*successor_id, Arc::new(RwLock::new(successor)));
                    }
                }
                other => {
                    if let Some(lesson_id) = event_lesson_id(other)
                        && let Some(entry) = engine.lessons.get(&lesson_id) {
                            let ls_arc = entry.value().clone();
                            drop(entry);
                            let mut guard = ls_arc.try_write().expect("replay: uncontended write");
                            apply_to_lesson(&mut guard, other, &engine.booking_to_lesson);
                        }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    ///
    /// A closed channel means the writer is gone (engine shutting down or
    /// restarting) — surfaced as the retryable ConcurrentConflict.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::ConcurrentConflict)?;
        rx.await
            .map_err(|_| EngineError::ConcurrentConflict)?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_lesson(&self, id: &Ulid) -> Option<SharedLessonState> {
        self.lessons.get(id).map(|e| e.value().clone())
    }

    pub fn lesson_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_lesson.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply in one call. The caller holds the lesson's write
    /// lock across both, which is what makes the unit atomic.
    pub(super) async fn persist_and_apply(
        &self,
        ls: &mut LessonState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_lesson(ls, event, &self.booking_to_lesson);
        Ok(())
    }

    /// Lookup booking → lesson, get lesson, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<LessonState>), EngineError> {
        let lesson_id = self
            .lesson_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let ls = self
            .get_lesson(&lesson_id)
            .ok_or(EngineError::NotFound(lesson_id))?;
        let guard = ls.write_owned().await;
        Ok((lesson_id, guard))
    }
}

/// Archive `source`, force-complete its live bookings, and return the
/// successor lesson state (one week later, same descriptive fields, empty
/// booking set). Shared by the live rollover path and WAL replay.
pub(super) fn rollover_in_place(
    source: &mut LessonState,
    successor_id: Ulid,
    successor_span: Span,
    completed: &[Ulid],
) -> LessonState {
    source.status = LessonStatus::Archived;
    for id in completed {
        if let Some(b) = source.booking_mut(*id) {
            b.status = BookingStatus::Completed;
        }
    }
    LessonState::new(
        successor_id,
        successor_span,
        source.max_capacity,
        source.cancellation_deadline_hours,
        LessonStatus::Published,
        source.details.clone(),
    )
}

/// Extract the lesson_id from an event (for per-lesson events).
fn event_lesson_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::LessonUpdated { id, .. }
        | Event::LessonPublished { id }
        | Event::LessonArchived { id } => Some(*id),
        Event::BookingAdmitted { lesson_id, .. }
        | Event::BookingCancelled { lesson_id, .. }
        | Event::AttendanceMarked { lesson_id, .. } => Some(*lesson_id),
        Event::LessonCreated { .. }
        | Event::LessonDeleted { .. }
        | Event::LessonRolledOver { .. } => None,
    }
}
