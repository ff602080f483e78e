use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::LimitExceeded("lesson must end after it starts"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("lesson span too wide"));
    }
    Ok(())
}

/// The cancellation policy evaluator. Pure function of the lesson's schedule
/// and the evaluation instant: cancellation is permitted strictly before
/// `start − cancellation_deadline_hours`.
///
/// Applied before every cancellation write, whatever the reason.
pub fn can_cancel(lesson: &LessonState, now: Ms) -> bool {
    let cutoff = lesson.span.start - (lesson.cancellation_deadline_hours as Ms) * HOUR_MS;
    now < cutoff
}
