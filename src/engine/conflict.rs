use chrono::{Duration, NaiveDateTime, NaiveTime};
use ulid::Ulid;

use crate::model::*;

use super::availability::{day_open_intervals, subtract_intervals};
use super::EngineError;

pub(crate) fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

pub(crate) fn validate_time_range(start: NaiveTime, end: NaiveTime) -> Result<(), EngineError> {
    if start >= end {
        return Err(EngineError::ConfigurationInvalid("end must be after start"));
    }
    Ok(())
}

pub(crate) fn validate_duration(minutes: u32) -> Result<(), EngineError> {
    use crate::limits::*;
    if !(MIN_LESSON_MINUTES..=MAX_LESSON_MINUTES).contains(&minutes) {
        return Err(EngineError::ConfigurationInvalid("duration out of range"));
    }
    Ok(())
}

pub(crate) fn validate_policy(policy: &BookingPolicy) -> Result<(), EngineError> {
    use crate::limits::*;
    if policy.buffer_minutes > MAX_BUFFER_MINUTES {
        return Err(EngineError::ConfigurationInvalid("buffer too large"));
    }
    if policy.min_notice_hours > MAX_NOTICE_HOURS {
        return Err(EngineError::ConfigurationInvalid("notice too large"));
    }
    if policy.max_horizon_days == 0 || policy.max_horizon_days > MAX_HORIZON_DAYS {
        return Err(EngineError::ConfigurationInvalid("horizon out of range"));
    }
    Ok(())
}

/// Conflict check against live lesson state. An active lesson occupies
/// `[start, end + buffer)`; the candidate must not touch any such zone.
/// The search window reaches back by `buffer` to catch lessons whose
/// trailing buffer extends into the candidate.
pub(crate) fn check_no_conflict(state: &TeacherState, span: &Span) -> Result<(), Ulid> {
    let buffer = Duration::minutes(state.policy.buffer_minutes as i64);
    let search = Span::new(span.start - buffer, span.end);
    for lesson in state.active_lessons_overlapping(&search) {
        let zone = Span::new(lesson.start, lesson.end() + buffer);
        if zone.overlaps(span) {
            return Err(lesson.id);
        }
    }
    Ok(())
}

/// Notice and horizon bounds: full datetime for notice, date-only for horizon.
pub(crate) fn within_policy_window(
    policy: &BookingPolicy,
    start: NaiveDateTime,
    now: NaiveDateTime,
) -> bool {
    start >= now + Duration::hours(policy.min_notice_hours as i64)
        && start.date() <= (now + Duration::days(policy.max_horizon_days as i64)).date()
}

/// True if the candidate lies entirely inside the date's open intervals
/// (weekly hours plus exceptions). Catches Blocks added after the slot
/// list was generated.
pub(crate) fn covered_by_open_hours(state: &TeacherState, span: &Span) -> bool {
    let open = day_open_intervals(state, span.start.date());
    subtract_intervals(&[*span], &open).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn teacher_with_lesson(buffer: u32, start: &str, minutes: u32) -> TeacherState {
        let mut ts = TeacherState::new(
            Ulid::new(),
            BookingPolicy {
                enabled: true,
                buffer_minutes: buffer,
                min_notice_hours: 0,
                max_horizon_days: 365,
                auto_approve: true,
            },
        );
        ts.insert_lesson(Lesson {
            id: Ulid::new(),
            student_id: Ulid::new(),
            subject_id: Ulid::new(),
            start: dt(start),
            duration_minutes: minutes,
            status: LessonStatus::Confirmed,
            group_id: Ulid::new(),
            payment: PaymentState::Captured,
            location: None,
            message: None,
        });
        ts
    }

    #[test]
    fn direct_overlap_conflicts() {
        let ts = teacher_with_lesson(0, "2026-09-07 10:00", 60);
        let candidate = Span::new(dt("2026-09-07 10:30"), dt("2026-09-07 11:30"));
        assert!(check_no_conflict(&ts, &candidate).is_err());
    }

    #[test]
    fn candidate_before_lesson_is_clear() {
        // Trailing-only buffer: a candidate ending exactly at the lesson
        // start is allowed.
        let ts = teacher_with_lesson(15, "2026-09-07 10:00", 60);
        let candidate = Span::new(dt("2026-09-07 09:00"), dt("2026-09-07 10:00"));
        assert!(check_no_conflict(&ts, &candidate).is_ok());
    }

    #[test]
    fn candidate_inside_trailing_buffer_conflicts() {
        let ts = teacher_with_lesson(15, "2026-09-07 10:00", 60);
        // Lesson zone is [10:00, 11:15)
        let candidate = Span::new(dt("2026-09-07 11:00"), dt("2026-09-07 12:00"));
        assert!(check_no_conflict(&ts, &candidate).is_err());
        let clear = Span::new(dt("2026-09-07 11:15"), dt("2026-09-07 12:15"));
        assert!(check_no_conflict(&ts, &clear).is_ok());
    }

    #[test]
    fn cancelled_lesson_never_conflicts() {
        let mut ts = teacher_with_lesson(0, "2026-09-07 10:00", 60);
        ts.lessons[0].status = LessonStatus::Cancelled;
        let candidate = Span::new(dt("2026-09-07 10:00"), dt("2026-09-07 11:00"));
        assert!(check_no_conflict(&ts, &candidate).is_ok());
    }

    #[test]
    fn policy_window_bounds() {
        let policy = BookingPolicy {
            enabled: true,
            buffer_minutes: 0,
            min_notice_hours: 24,
            max_horizon_days: 7,
            auto_approve: false,
        };
        let now = dt("2026-09-01 12:00");
        assert!(!within_policy_window(&policy, dt("2026-09-02 11:00"), now)); // under notice
        assert!(within_policy_window(&policy, dt("2026-09-02 12:00"), now)); // exactly at notice
        assert!(within_policy_window(&policy, dt("2026-09-08 23:00"), now)); // horizon date ok
        assert!(!within_policy_window(&policy, dt("2026-09-09 00:00"), now)); // past horizon
    }

    #[test]
    fn open_hours_coverage() {
        let mut ts = TeacherState::new(Ulid::new(), BookingPolicy::default());
        ts.weekly.push(WeeklyAvailability {
            id: Ulid::new(),
            weekday: Weekday::Mon,
            start: t(9, 0),
            end: t(17, 0),
        });
        let inside = Span::new(dt("2026-09-07 09:00"), dt("2026-09-07 10:00"));
        assert!(covered_by_open_hours(&ts, &inside));
        let straddling = Span::new(dt("2026-09-07 16:30"), dt("2026-09-07 17:30"));
        assert!(!covered_by_open_hours(&ts, &straddling));

        // A Block carves coverage away
        ts.exceptions.push(AvailabilityException {
            id: Ulid::new(),
            date: inside.start.date(),
            start: t(9, 0),
            end: t(10, 0),
            kind: ExceptionKind::Block,
            reason: None,
        });
        assert!(!covered_by_open_hours(&ts, &inside));
    }
}
