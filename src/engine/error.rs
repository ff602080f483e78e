use ulid::Ulid;

#[derive(Debug, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Lesson missing, not Published, or otherwise closed to the operation.
    LessonUnavailable(Ulid),
    /// The user already holds a live booking on this lesson.
    AlreadyBooked { lesson_id: Ulid, user_id: Ulid },
    /// Cancellation attempted past the lesson's deadline window.
    DeadlinePassed { lesson_id: Ulid },
    /// Illegal state-machine move, for bookings and lessons alike.
    InvalidTransition { from: &'static str, to: &'static str },
    /// Lesson deletion refused while bookings exist.
    HasBookings(Ulid),
    LimitExceeded(&'static str),
    /// The commit could not be serialized (engine restarting); retryable.
    ConcurrentConflict,
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LessonUnavailable(id) => write!(f, "lesson unavailable: {id}"),
            EngineError::AlreadyBooked { user_id, .. } => {
                write!(f, "user {user_id} already has a booking on this lesson")
            }
            EngineError::DeadlinePassed { .. } => {
                write!(f, "cancellation window has passed")
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "illegal transition: {from} -> {to}")
            }
            EngineError::HasBookings(id) => {
                write!(f, "cannot delete lesson {id}: bookings exist")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::ConcurrentConflict => {
                write!(f, "could not commit, please retry")
            }
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
