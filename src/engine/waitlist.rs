use chrono::Duration;
use tracing::info;
use ulid::Ulid;

use crate::limits;
use crate::model::*;

use super::conflict::{self, check_no_conflict, covered_by_open_hours, validate_duration};
use super::{Engine, EngineError};

impl Engine {
    /// Queue a request for an interval that is currently taken. FIFO per
    /// teacher; the interval itself is not reserved until promotion.
    pub async fn join_waitlist(
        &self,
        teacher_id: Ulid,
        student_id: Ulid,
        subject_id: Ulid,
        start: chrono::NaiveDateTime,
        duration_minutes: u32,
    ) -> Result<Ulid, EngineError> {
        validate_duration(duration_minutes)?;
        let ts = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let mut guard = ts.write().await;
        if !guard.policy.enabled {
            return Err(EngineError::PolicyDisabled);
        }
        if guard.waitlist.len() >= limits::MAX_WAITLIST_PER_TEACHER {
            return Err(EngineError::LimitExceeded("waitlist full"));
        }
        let now = conflict::now();
        if start <= now {
            return Err(EngineError::ConfigurationInvalid("start already passed"));
        }
        if let Some(existing) = guard.waitlist.iter().find(|e| {
            e.student_id == student_id && e.start == start && e.duration_minutes == duration_minutes
        }) {
            return Err(EngineError::AlreadyExists(existing.id));
        }
        let id = Ulid::new();
        let event = Event::WaitlistJoined {
            id,
            teacher_id,
            student_id,
            subject_id,
            start,
            duration_minutes,
            queued_at: now,
        };
        self.persist_and_apply(teacher_id, &mut guard, &event)
            .await?;
        Ok(id)
    }

    pub async fn leave_waitlist(&self, entry_id: Ulid) -> Result<(), EngineError> {
        let (teacher_id, mut guard) = self.resolve_entity_write(&entry_id).await?;
        if !guard.waitlist.iter().any(|e| e.id == entry_id) {
            return Err(EngineError::NotFound(entry_id));
        }
        let event = Event::WaitlistLeft {
            id: entry_id,
            teacher_id,
        };
        self.persist_and_apply(teacher_id, &mut guard, &event).await
    }
}

/// Promote the first queued entry whose interval is now free. Runs under
/// the caller's write lock, in the same critical section as the
/// cancellation that freed the interval. At most one entry promotes per
/// call; the promoted lesson starts a fresh group awaiting capture.
///
/// The entry must still clear the open-hours and min-notice checks. The
/// horizon check is skipped: the student queued when the date was in range
/// and the wait itself only brings it closer.
pub(super) async fn promote_from_waitlist(
    engine: &Engine,
    teacher_id: Ulid,
    guard: &mut TeacherState,
) -> Result<Option<Ulid>, EngineError> {
    let now = conflict::now();
    let notice = Duration::hours(guard.policy.min_notice_hours as i64);

    let candidate = guard.waitlist.iter().find(|entry| {
        entry.start >= now + notice
            && check_no_conflict(guard, &entry.span()).is_ok()
            && covered_by_open_hours(guard, &entry.span())
    });
    let Some(entry) = candidate.cloned() else {
        return Ok(None);
    };

    let lesson_id = Ulid::new();
    let deadline = now + Duration::minutes(limits::PAYMENT_CAPTURE_WINDOW_MINUTES);
    let status = if guard.policy.auto_approve {
        LessonStatus::Confirmed
    } else {
        LessonStatus::Pending
    };
    let events = [
        Event::LessonReserved {
            id: lesson_id,
            teacher_id,
            student_id: entry.student_id,
            subject_id: entry.subject_id,
            start: entry.start,
            duration_minutes: entry.duration_minutes,
            status,
            group_id: Ulid::new(),
            payment: PaymentState::AwaitingCapture { deadline },
            location: None,
            message: None,
        },
        Event::WaitlistLeft {
            id: entry.id,
            teacher_id,
        },
    ];
    engine
        .persist_group_and_apply(teacher_id, guard, &events)
        .await?;

    metrics::counter!(crate::observability::WAITLIST_PROMOTIONS_TOTAL).increment(1);
    info!(teacher = %teacher_id, entry = %entry.id, lesson = %lesson_id,
        "waitlist entry promoted");
    Ok(Some(lesson_id))
}
