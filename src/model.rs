use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open datetime interval `[start, end)`. Minute granularity by
/// convention; nothing below enforces sub-minute precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Span {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// One recurring open range on a weekday. Ranges for the same teacher and
/// weekday must not overlap (rejected at write time).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyAvailability {
    pub id: Ulid,
    pub weekday: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Direction of a date-scoped calendar override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionKind {
    /// Removes bookable time, even inside weekly availability.
    Block,
    /// Adds bookable time, even outside weekly availability.
    ExtraAvailable,
}

/// A one-off override for a single calendar date. Never recurs; a past
/// exception has no effect on future queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityException {
    pub id: Ulid,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub kind: ExceptionKind,
    pub reason: Option<String>,
}

/// Per-teacher booking configuration. One per teacher, mutated only by the
/// owning teacher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingPolicy {
    /// When false, no slots are ever computed and submissions are refused;
    /// callers fall back to a manual request flow.
    pub enabled: bool,
    /// Idle minutes enforced after each lesson before the next may start.
    pub buffer_minutes: u32,
    /// Earliest a slot may start, in hours relative to now.
    pub min_notice_hours: u32,
    /// Latest a slot may start, in days relative to now (date comparison).
    pub max_horizon_days: u32,
    /// When true, reservations commit as Confirmed; otherwise Pending until
    /// the teacher accepts or rejects.
    pub auto_approve: bool,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            buffer_minutes: 0,
            min_notice_hours: 0,
            max_horizon_days: 365,
            auto_approve: false,
        }
    }
}

/// Lesson lifecycle. Cancellation and rejection are status transitions, not
/// row deletion — history stays for refund/audit reasoning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LessonStatus {
    Pending,
    Confirmed,
    Cancelled,
    Rejected,
}

/// Payment lifecycle of a booking group (tracked per lesson for simplicity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentState {
    /// Reserved, waiting for the external gateway. Past the deadline the
    /// reaper releases the reservation.
    AwaitingCapture { deadline: NaiveDateTime },
    Captured,
    /// Capture failed or never happened; the reservation was cancelled.
    Released,
}

/// The reserved unit: one lesson occupying `[start, start + duration)` on a
/// teacher's calendar, plus a trailing buffer per the teacher's policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: Ulid,
    pub student_id: Ulid,
    pub subject_id: Ulid,
    pub start: NaiveDateTime,
    pub duration_minutes: u32,
    pub status: LessonStatus,
    /// Links lessons submitted together; the whole group commits or fails.
    pub group_id: Ulid,
    pub payment: PaymentState,
    /// Meeting place or format (online link, address). Opaque to the
    /// engine, shared by the group.
    pub location: Option<String>,
    /// Free-text note from the requester, shared by the group.
    pub message: Option<String>,
}

impl Lesson {
    pub fn end(&self) -> NaiveDateTime {
        self.start + Duration::minutes(self.duration_minutes as i64)
    }

    pub fn span(&self) -> Span {
        Span::new(self.start, self.end())
    }

    /// Pending and Confirmed lessons occupy their slot for conflict purposes.
    pub fn is_active(&self) -> bool {
        matches!(self.status, LessonStatus::Pending | LessonStatus::Confirmed)
    }
}

/// A queued request waiting for a matching interval to free up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub student_id: Ulid,
    pub subject_id: Ulid,
    pub start: NaiveDateTime,
    pub duration_minutes: u32,
    pub queued_at: NaiveDateTime,
}

impl WaitlistEntry {
    pub fn span(&self) -> Span {
        Span::new(
            self.start,
            self.start + Duration::minutes(self.duration_minutes as i64),
        )
    }
}

/// Everything the engine tracks for one teacher. Guarded by one RwLock, so
/// mutations for a teacher serialize while other teachers proceed in parallel.
#[derive(Debug, Clone)]
pub struct TeacherState {
    pub id: Ulid,
    pub policy: BookingPolicy,
    pub weekly: Vec<WeeklyAvailability>,
    pub exceptions: Vec<AvailabilityException>,
    /// All lessons ever reserved, sorted by `start`. Terminal lessons stay.
    pub lessons: Vec<Lesson>,
    /// Queue order == promotion order.
    pub waitlist: Vec<WaitlistEntry>,
}

impl TeacherState {
    pub fn new(id: Ulid, policy: BookingPolicy) -> Self {
        Self {
            id,
            policy,
            weekly: Vec::new(),
            exceptions: Vec::new(),
            lessons: Vec::new(),
            waitlist: Vec::new(),
        }
    }

    /// Insert lesson maintaining sort order by start.
    pub fn insert_lesson(&mut self, lesson: Lesson) {
        let pos = self
            .lessons
            .binary_search_by_key(&lesson.start, |l| l.start)
            .unwrap_or_else(|e| e);
        self.lessons.insert(pos, lesson);
    }

    pub fn lesson(&self, id: Ulid) -> Option<&Lesson> {
        self.lessons.iter().find(|l| l.id == id)
    }

    pub fn lesson_mut(&mut self, id: Ulid) -> Option<&mut Lesson> {
        self.lessons.iter_mut().find(|l| l.id == id)
    }

    /// Active lessons whose `[start, end)` overlaps the query window.
    /// Binary search skips lessons starting at or after `query.end`.
    pub fn active_lessons_overlapping(&self, query: &Span) -> impl Iterator<Item = &Lesson> {
        let right_bound = self.lessons.partition_point(|l| l.start < query.end);
        self.lessons[..right_bound]
            .iter()
            .filter(move |l| l.is_active() && l.end() > query.start)
    }

    pub fn weekly_for(&self, weekday: Weekday) -> impl Iterator<Item = &WeeklyAvailability> {
        self.weekly.iter().filter(move |w| w.weekday == weekday)
    }

    pub fn exceptions_for(&self, date: NaiveDate) -> impl Iterator<Item = &AvailabilityException> {
        self.exceptions.iter().filter(move |e| e.date == date)
    }

    pub fn group_lessons(&self, group_id: Ulid) -> impl Iterator<Item = &Lesson> {
        self.lessons.iter().filter(move |l| l.group_id == group_id)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TeacherRegistered {
        id: Ulid,
        policy: BookingPolicy,
    },
    PolicyUpdated {
        teacher_id: Ulid,
        policy: BookingPolicy,
    },
    WeeklyHoursAdded {
        id: Ulid,
        teacher_id: Ulid,
        weekday: Weekday,
        start: NaiveTime,
        end: NaiveTime,
    },
    WeeklyHoursRemoved {
        id: Ulid,
        teacher_id: Ulid,
    },
    WeeklyDayCleared {
        teacher_id: Ulid,
        weekday: Weekday,
    },
    ExceptionAdded {
        id: Ulid,
        teacher_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        kind: ExceptionKind,
        reason: Option<String>,
    },
    ExceptionRemoved {
        id: Ulid,
        teacher_id: Ulid,
    },
    LessonReserved {
        id: Ulid,
        teacher_id: Ulid,
        student_id: Ulid,
        subject_id: Ulid,
        start: NaiveDateTime,
        duration_minutes: u32,
        status: LessonStatus,
        group_id: Ulid,
        payment: PaymentState,
        location: Option<String>,
        message: Option<String>,
    },
    LessonStatusChanged {
        id: Ulid,
        teacher_id: Ulid,
        status: LessonStatus,
    },
    PaymentCaptured {
        teacher_id: Ulid,
        group_id: Ulid,
    },
    PaymentReleased {
        teacher_id: Ulid,
        group_id: Ulid,
    },
    WaitlistJoined {
        id: Ulid,
        teacher_id: Ulid,
        student_id: Ulid,
        subject_id: Ulid,
        start: NaiveDateTime,
        duration_minutes: u32,
        queued_at: NaiveDateTime,
    },
    WaitlistLeft {
        id: Ulid,
        teacher_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

/// A candidate bookable interval. Derived on demand, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: NaiveDateTime,
    pub duration_minutes: u32,
    pub end: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeacherInfo {
    pub id: Ulid,
    pub policy: BookingPolicy,
}

/// One requested slot inside a booking submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub subject_id: Ulid,
    pub start: NaiveDateTime,
    pub duration_minutes: u32,
}

impl Selection {
    pub fn span(&self) -> Span {
        Span::new(
            self.start,
            self.start + Duration::minutes(self.duration_minutes as i64),
        )
    }
}

/// Returned by a successful booking submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub group_id: Ulid,
    pub lesson_ids: Vec<Ulid>,
    pub auto_approved: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    fn lesson_at(start: &str, status: LessonStatus) -> Lesson {
        Lesson {
            id: Ulid::new(),
            student_id: Ulid::new(),
            subject_id: Ulid::new(),
            start: dt(start),
            duration_minutes: 60,
            status,
            group_id: Ulid::new(),
            payment: PaymentState::Captured,
            location: None,
            message: None,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(dt("2026-09-07 09:00"), dt("2026-09-07 10:00"));
        assert_eq!(s.minutes(), 60);
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(dt("2026-09-07 09:00"), dt("2026-09-07 10:00"));
        let b = Span::new(dt("2026-09-07 09:30"), dt("2026-09-07 10:30"));
        let c = Span::new(dt("2026-09-07 10:00"), dt("2026-09-07 11:00"));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(dt("2026-09-07 09:00"), dt("2026-09-07 17:00"));
        let inner = Span::new(dt("2026-09-07 10:00"), dt("2026-09-07 11:00"));
        let partial = Span::new(dt("2026-09-07 08:00"), dt("2026-09-07 10:00"));
        assert!(outer.contains_span(&inner));
        assert!(outer.contains_span(&outer)); // self-containment
        assert!(!outer.contains_span(&partial));
    }

    #[test]
    fn lesson_span_and_activity() {
        let mut lesson = lesson_at("2026-09-07 10:00", LessonStatus::Pending);
        assert_eq!(lesson.end(), dt("2026-09-07 11:00"));
        assert!(lesson.is_active());
        lesson.status = LessonStatus::Confirmed;
        assert!(lesson.is_active());
        lesson.status = LessonStatus::Cancelled;
        assert!(!lesson.is_active());
        lesson.status = LessonStatus::Rejected;
        assert!(!lesson.is_active());
    }

    #[test]
    fn lesson_ordering() {
        let mut ts = TeacherState::new(Ulid::new(), BookingPolicy::default());
        ts.insert_lesson(lesson_at("2026-09-07 14:00", LessonStatus::Confirmed));
        ts.insert_lesson(lesson_at("2026-09-07 09:00", LessonStatus::Confirmed));
        ts.insert_lesson(lesson_at("2026-09-07 11:00", LessonStatus::Confirmed));
        assert_eq!(ts.lessons[0].start, dt("2026-09-07 09:00"));
        assert_eq!(ts.lessons[1].start, dt("2026-09-07 11:00"));
        assert_eq!(ts.lessons[2].start, dt("2026-09-07 14:00"));
    }

    #[test]
    fn overlapping_skips_inactive_and_out_of_window() {
        let mut ts = TeacherState::new(Ulid::new(), BookingPolicy::default());
        ts.insert_lesson(lesson_at("2026-09-07 08:00", LessonStatus::Confirmed)); // before window
        ts.insert_lesson(lesson_at("2026-09-07 10:00", LessonStatus::Cancelled)); // inactive
        ts.insert_lesson(lesson_at("2026-09-07 10:30", LessonStatus::Pending));
        ts.insert_lesson(lesson_at("2026-09-07 15:00", LessonStatus::Confirmed)); // after window

        let query = Span::new(dt("2026-09-07 10:00"), dt("2026-09-07 12:00"));
        let hits: Vec<_> = ts.active_lessons_overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].start, dt("2026-09-07 10:30"));
    }

    #[test]
    fn lesson_adjacent_to_window_not_included() {
        let mut ts = TeacherState::new(Ulid::new(), BookingPolicy::default());
        ts.insert_lesson(lesson_at("2026-09-07 09:00", LessonStatus::Confirmed));
        // Ends exactly at query.start — half-open, not overlapping
        let query = Span::new(dt("2026-09-07 10:00"), dt("2026-09-07 11:00"));
        assert_eq!(ts.active_lessons_overlapping(&query).count(), 0);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::LessonReserved {
            id: Ulid::new(),
            teacher_id: Ulid::new(),
            student_id: Ulid::new(),
            subject_id: Ulid::new(),
            start: dt("2026-09-07 10:00"),
            duration_minutes: 45,
            status: LessonStatus::Pending,
            group_id: Ulid::new(),
            payment: PaymentState::AwaitingCapture {
                deadline: dt("2026-08-24 12:30"),
            },
            location: Some("online".into()),
            message: Some("first two sessions".into()),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn weekly_event_roundtrip() {
        let event = Event::WeeklyHoursAdded {
            id: Ulid::new(),
            teacher_id: Ulid::new(),
            weekday: Weekday::Mon,
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
