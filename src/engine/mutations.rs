use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use tokio::sync::{oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits;
use crate::model::*;
use crate::payment::PaymentGateway;

use super::conflict::{
    self, check_no_conflict, covered_by_open_hours, validate_duration, validate_policy,
    validate_time_range, within_policy_window,
};
use super::waitlist::promote_from_waitlist;
use super::{Engine, EngineError, WalCommand};

impl Engine {
    // ── Teacher registration and policy ──────────────────

    pub async fn register_teacher(&self, policy: BookingPolicy) -> Result<Ulid, EngineError> {
        validate_policy(&policy)?;
        if self.state.len() >= limits::MAX_TEACHERS {
            return Err(EngineError::LimitExceeded("too many teachers"));
        }
        let id = Ulid::new();
        let event = Event::TeacherRegistered { id, policy };
        self.wal_append(&event).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(TeacherState::new(id, policy))));
        self.notify.send(id, &event);
        metrics::gauge!(crate::observability::TEACHERS_ACTIVE).set(self.state.len() as f64);
        info!(teacher = %id, "teacher registered");
        Ok(id)
    }

    pub async fn update_policy(
        &self,
        teacher_id: Ulid,
        policy: BookingPolicy,
    ) -> Result<(), EngineError> {
        validate_policy(&policy)?;
        let ts = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let mut guard = ts.write().await;
        let event = Event::PolicyUpdated { teacher_id, policy };
        self.persist_and_apply(teacher_id, &mut guard, &event).await
    }

    // ── Weekly availability ──────────────────────────────

    /// Add a recurring open range. Ranges on the same weekday must not
    /// overlap; touching end-to-start is fine.
    pub async fn add_weekly_hours(
        &self,
        teacher_id: Ulid,
        weekday: Weekday,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<Ulid, EngineError> {
        validate_time_range(start, end)?;
        let ts = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let mut guard = ts.write().await;
        if guard.weekly.len() >= limits::MAX_WEEKLY_RANGES_PER_TEACHER {
            return Err(EngineError::LimitExceeded("too many weekly ranges"));
        }
        if guard
            .weekly_for(weekday)
            .any(|w| w.start < end && start < w.end)
        {
            return Err(EngineError::ConfigurationInvalid(
                "overlaps an existing range on this weekday",
            ));
        }
        let id = Ulid::new();
        let event = Event::WeeklyHoursAdded {
            id,
            teacher_id,
            weekday,
            start,
            end,
        };
        self.persist_and_apply(teacher_id, &mut guard, &event)
            .await?;
        Ok(id)
    }

    pub async fn remove_weekly_hours(&self, range_id: Ulid) -> Result<(), EngineError> {
        let (teacher_id, mut guard) = self.resolve_entity_write(&range_id).await?;
        if !guard.weekly.iter().any(|w| w.id == range_id) {
            return Err(EngineError::NotFound(range_id));
        }
        let event = Event::WeeklyHoursRemoved {
            id: range_id,
            teacher_id,
        };
        self.persist_and_apply(teacher_id, &mut guard, &event).await
    }

    /// Remove every range on one weekday in a single operation.
    pub async fn clear_weekly_day(
        &self,
        teacher_id: Ulid,
        weekday: Weekday,
    ) -> Result<usize, EngineError> {
        let ts = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let mut guard = ts.write().await;
        let removed = guard.weekly_for(weekday).count();
        if removed == 0 {
            return Ok(0);
        }
        let event = Event::WeeklyDayCleared {
            teacher_id,
            weekday,
        };
        self.persist_and_apply(teacher_id, &mut guard, &event)
            .await?;
        Ok(removed)
    }

    // ── Exceptions ───────────────────────────────────────

    pub async fn add_exception(
        &self,
        teacher_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        kind: ExceptionKind,
        reason: Option<String>,
    ) -> Result<Ulid, EngineError> {
        validate_time_range(start, end)?;
        if let Some(r) = &reason
            && r.len() > limits::MAX_REASON_LEN {
                return Err(EngineError::ConfigurationInvalid("reason too long"));
            }
        let ts = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let mut guard = ts.write().await;
        if guard.exceptions.len() >= limits::MAX_EXCEPTIONS_PER_TEACHER {
            return Err(EngineError::LimitExceeded("too many exceptions"));
        }
        let id = Ulid::new();
        let event = Event::ExceptionAdded {
            id,
            teacher_id,
            date,
            start,
            end,
            kind,
            reason,
        };
        self.persist_and_apply(teacher_id, &mut guard, &event)
            .await?;
        Ok(id)
    }

    pub async fn remove_exception(&self, exception_id: Ulid) -> Result<(), EngineError> {
        let (teacher_id, mut guard) = self.resolve_entity_write(&exception_id).await?;
        if !guard.exceptions.iter().any(|e| e.id == exception_id) {
            return Err(EngineError::NotFound(exception_id));
        }
        let event = Event::ExceptionRemoved {
            id: exception_id,
            teacher_id,
        };
        self.persist_and_apply(teacher_id, &mut guard, &event).await
    }

    // ── Booking transaction ──────────────────────────────

    /// All-or-nothing reservation of one or more selections, then payment
    /// capture outside the lock. The whole group is committed to the WAL
    /// as a single flush unit before any lesson is applied, so neither a
    /// storage error nor a capture failure can leave a half committed
    /// group behind.
    pub async fn submit_booking(
        &self,
        teacher_id: Ulid,
        student_id: Ulid,
        selections: &[Selection],
        location: Option<String>,
        message: Option<String>,
        amount_cents: i64,
        gateway: &dyn PaymentGateway,
    ) -> Result<BookingReceipt, EngineError> {
        if selections.is_empty() {
            return Err(EngineError::ConfigurationInvalid("no selections"));
        }
        if selections.len() > limits::MAX_SELECTIONS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many selections"));
        }
        if let Some(l) = &location
            && l.len() > limits::MAX_LOCATION_LEN {
                return Err(EngineError::ConfigurationInvalid("location too long"));
            }
        if let Some(m) = &message
            && m.len() > limits::MAX_MESSAGE_LEN {
                return Err(EngineError::ConfigurationInvalid("message too long"));
            }
        for sel in selections {
            validate_duration(sel.duration_minutes)?;
        }

        let ts = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let group_id = Ulid::new();
        let auto_approved;

        // Phase 1: validate + reserve under the write lock.
        {
            let mut guard = ts.write().await;
            if !guard.policy.enabled {
                return Err(EngineError::PolicyDisabled);
            }
            if guard.lessons.len() + selections.len() > limits::MAX_LESSONS_PER_TEACHER {
                return Err(EngineError::LimitExceeded("too many lessons"));
            }
            let now = conflict::now();
            let buffer = Duration::minutes(guard.policy.buffer_minutes as i64);

            let mut conflicting = Vec::new();
            let mut violating = Vec::new();
            for (i, sel) in selections.iter().enumerate() {
                let span = sel.span();
                if !within_policy_window(&guard.policy, sel.start, now) {
                    violating.push(i);
                    continue;
                }
                if !covered_by_open_hours(&guard, &span)
                    || check_no_conflict(&guard, &span).is_err()
                {
                    conflicting.push(i);
                }
            }
            // Selections in the same submission must also clear each
            // other's trailing buffer.
            for j in 1..selections.len() {
                if conflicting.contains(&j) {
                    continue;
                }
                let span_j = selections[j].span();
                let collides = selections[..j].iter().enumerate().any(|(i, earlier)| {
                    if conflicting.contains(&i) {
                        return false;
                    }
                    let span_i = earlier.span();
                    let zone_i = Span::new(span_i.start, span_i.end + buffer);
                    let zone_j = Span::new(span_j.start, span_j.end + buffer);
                    zone_i.overlaps(&span_j) || zone_j.overlaps(&span_i)
                });
                if collides {
                    conflicting.push(j);
                }
            }
            if !conflicting.is_empty() {
                metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                return Err(EngineError::SlotConflict { conflicting });
            }
            if !violating.is_empty() {
                return Err(EngineError::PolicyViolation { violating });
            }

            // Phase 2: commit the whole group.
            auto_approved = guard.policy.auto_approve;
            let status = if auto_approved {
                LessonStatus::Confirmed
            } else {
                LessonStatus::Pending
            };
            let deadline = now + Duration::minutes(limits::PAYMENT_CAPTURE_WINDOW_MINUTES);
            let events: Vec<Event> = selections
                .iter()
                .map(|sel| Event::LessonReserved {
                    id: Ulid::new(),
                    teacher_id,
                    student_id,
                    subject_id: sel.subject_id,
                    start: sel.start,
                    duration_minutes: sel.duration_minutes,
                    status,
                    group_id,
                    payment: PaymentState::AwaitingCapture { deadline },
                    location: location.clone(),
                    message: message.clone(),
                })
                .collect();
            self.persist_group_and_apply(teacher_id, &mut guard, &events)
                .await?;
        }

        // Payment capture runs lock-free. A slow gateway holds up only this
        // caller; the teacher's calendar stays live for everyone else.
        match gateway.capture(group_id, amount_cents).await {
            Ok(()) => {
                self.record_capture(teacher_id, &ts, group_id).await?;
            }
            Err(e) => {
                warn!(teacher = %teacher_id, group = %group_id, error = %e,
                    "payment capture failed, releasing reservation");
                metrics::counter!(crate::observability::PAYMENT_FAILURES_TOTAL).increment(1);
                self.release_reservation(group_id).await?;
                return Err(EngineError::PaymentFailure(e.to_string()));
            }
        }

        let lesson_ids = {
            let guard = ts.read().await;
            guard.group_lessons(group_id).map(|l| l.id).collect()
        };
        metrics::counter!(crate::observability::BOOKINGS_TOTAL).increment(1);
        info!(teacher = %teacher_id, group = %group_id,
            lessons = selections.len(), auto_approved, "booking committed");
        Ok(BookingReceipt {
            group_id,
            lesson_ids,
            auto_approved,
        })
    }

    /// Complete payment for a group still awaiting capture. Promoted
    /// waitlist reservations settle through here; regular submissions
    /// capture inline in `submit_booking`. A declined capture releases the
    /// reservation, same as the inline path.
    pub async fn settle_payment(
        &self,
        group_id: Ulid,
        amount_cents: i64,
        gateway: &dyn PaymentGateway,
    ) -> Result<(), EngineError> {
        let teacher_id = self
            .get_teacher_for_entity(&group_id)
            .ok_or(EngineError::NotFound(group_id))?;
        let ts = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        {
            let guard = ts.read().await;
            let awaiting = guard.group_lessons(group_id).any(|l| {
                l.is_active() && matches!(l.payment, PaymentState::AwaitingCapture { .. })
            });
            if !awaiting {
                return Err(EngineError::ConfigurationInvalid(
                    "group not awaiting capture",
                ));
            }
        }
        match gateway.capture(group_id, amount_cents).await {
            Ok(()) => self.record_capture(teacher_id, &ts, group_id).await,
            Err(e) => {
                warn!(teacher = %teacher_id, group = %group_id, error = %e,
                    "payment settlement failed, releasing reservation");
                metrics::counter!(crate::observability::PAYMENT_FAILURES_TOTAL).increment(1);
                self.release_reservation(group_id).await?;
                Err(EngineError::PaymentFailure(e.to_string()))
            }
        }
    }

    /// Record a successful gateway capture in the WAL. If the record cannot
    /// be persisted the funds are already taken, so the reservation is
    /// released (emitting `PaymentReleased`, the refund signal) rather than
    /// left to lapse as unpaid.
    async fn record_capture(
        &self,
        teacher_id: Ulid,
        ts: &Arc<RwLock<TeacherState>>,
        group_id: Ulid,
    ) -> Result<(), EngineError> {
        let result = {
            let mut guard = ts.write().await;
            let event = Event::PaymentCaptured {
                teacher_id,
                group_id,
            };
            self.persist_and_apply(teacher_id, &mut guard, &event).await
        };
        if let Err(e) = result {
            warn!(teacher = %teacher_id, group = %group_id, error = %e,
                "capture succeeded but could not be recorded, refunding");
            metrics::counter!(crate::observability::PAYMENT_FAILURES_TOTAL).increment(1);
            let _ = self.release_reservation(group_id).await;
            return Err(e);
        }
        Ok(())
    }

    // ── Approval flow ────────────────────────────────────

    /// Teacher accepts a pending group: every Pending lesson in it becomes
    /// Confirmed.
    pub async fn accept_booking(&self, group_id: Ulid) -> Result<usize, EngineError> {
        let (teacher_id, mut guard) = self.resolve_entity_write(&group_id).await?;
        let pending: Vec<Ulid> = guard
            .group_lessons(group_id)
            .filter(|l| l.status == LessonStatus::Pending)
            .map(|l| l.id)
            .collect();
        if pending.is_empty() {
            return Err(EngineError::ConfigurationInvalid(
                "no pending lessons in group",
            ));
        }
        let events: Vec<Event> = pending
            .iter()
            .map(|id| Event::LessonStatusChanged {
                id: *id,
                teacher_id,
                status: LessonStatus::Confirmed,
            })
            .collect();
        self.persist_group_and_apply(teacher_id, &mut guard, &events)
            .await?;
        Ok(pending.len())
    }

    /// Teacher rejects a pending group: every Pending lesson becomes
    /// Rejected and the captured payment is released. Freed intervals go
    /// back to slot queries immediately; the waitlist is not consulted,
    /// rejection signals the teacher does not want that booking.
    pub async fn reject_booking(&self, group_id: Ulid) -> Result<usize, EngineError> {
        let (teacher_id, mut guard) = self.resolve_entity_write(&group_id).await?;
        let pending: Vec<Ulid> = guard
            .group_lessons(group_id)
            .filter(|l| l.status == LessonStatus::Pending)
            .map(|l| l.id)
            .collect();
        if pending.is_empty() {
            return Err(EngineError::ConfigurationInvalid(
                "no pending lessons in group",
            ));
        }
        let mut events: Vec<Event> = pending
            .iter()
            .map(|id| Event::LessonStatusChanged {
                id: *id,
                teacher_id,
                status: LessonStatus::Rejected,
            })
            .collect();
        events.push(Event::PaymentReleased {
            teacher_id,
            group_id,
        });
        self.persist_group_and_apply(teacher_id, &mut guard, &events)
            .await?;
        Ok(pending.len())
    }

    // ── Cancellation ─────────────────────────────────────

    /// Cancel one lesson. The freed interval triggers a single waitlist
    /// promotion attempt under the same lock, so a queued student claims
    /// the spot before any live query can race them to it. Returns the id
    /// of the promoted lesson, if any.
    pub async fn cancel_lesson(&self, lesson_id: Ulid) -> Result<Option<Ulid>, EngineError> {
        let (teacher_id, mut guard) = self.resolve_entity_write(&lesson_id).await?;
        match guard.lesson(lesson_id) {
            Some(l) if l.is_active() => {}
            Some(_) => {
                return Err(EngineError::ConfigurationInvalid("lesson not active"));
            }
            None => return Err(EngineError::NotFound(lesson_id)),
        }
        let event = Event::LessonStatusChanged {
            id: lesson_id,
            teacher_id,
            status: LessonStatus::Cancelled,
        };
        self.persist_and_apply(teacher_id, &mut guard, &event)
            .await?;
        info!(teacher = %teacher_id, lesson = %lesson_id, "lesson cancelled");
        promote_from_waitlist(self, teacher_id, &mut guard).await
    }

    /// Cancel every active lesson in a group and release its payment. Used
    /// as the payment-failure compensation and by the reaper for lapsed
    /// reservations.
    pub async fn release_reservation(&self, group_id: Ulid) -> Result<(), EngineError> {
        let (teacher_id, mut guard) = self.resolve_entity_write(&group_id).await?;
        let active: Vec<Ulid> = guard
            .group_lessons(group_id)
            .filter(|l| l.is_active())
            .map(|l| l.id)
            .collect();
        let mut events: Vec<Event> = active
            .iter()
            .map(|id| Event::LessonStatusChanged {
                id: *id,
                teacher_id,
                status: LessonStatus::Cancelled,
            })
            .collect();
        events.push(Event::PaymentReleased {
            teacher_id,
            group_id,
        });
        self.persist_group_and_apply(teacher_id, &mut guard, &events)
            .await?;
        metrics::counter!(crate::observability::RESERVATIONS_RELEASED_TOTAL).increment(1);
        info!(teacher = %teacher_id, group = %group_id,
            lessons = active.len(), "reservation released");
        promote_from_waitlist(self, teacher_id, &mut guard).await?;
        Ok(())
    }

    /// Groups still awaiting capture past their deadline. The reaper feeds
    /// these to `release_reservation`.
    pub async fn collect_lapsed_groups(&self, now: NaiveDateTime) -> Vec<Ulid> {
        let mut lapsed = Vec::new();
        for entry in self.state.iter() {
            let guard = entry.value().read().await;
            for lesson in &guard.lessons {
                if lesson.is_active()
                    && let PaymentState::AwaitingCapture { deadline } = lesson.payment
                    && deadline < now
                    && !lapsed.contains(&lesson.group_id)
                {
                    lapsed.push(lesson.group_id);
                }
            }
        }
        lapsed
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL as a minimal event stream recreating current state.
    /// Terminal lessons are kept (history survives restart); waitlist
    /// entries whose start already passed are dropped.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let now = conflict::now();
        let mut events = Vec::new();
        for entry in self.state.iter() {
            let guard = entry.value().read().await;
            let teacher_id = guard.id;
            events.push(Event::TeacherRegistered {
                id: teacher_id,
                policy: guard.policy,
            });
            for w in &guard.weekly {
                events.push(Event::WeeklyHoursAdded {
                    id: w.id,
                    teacher_id,
                    weekday: w.weekday,
                    start: w.start,
                    end: w.end,
                });
            }
            for e in &guard.exceptions {
                events.push(Event::ExceptionAdded {
                    id: e.id,
                    teacher_id,
                    date: e.date,
                    start: e.start,
                    end: e.end,
                    kind: e.kind,
                    reason: e.reason.clone(),
                });
            }
            for l in &guard.lessons {
                events.push(Event::LessonReserved {
                    id: l.id,
                    teacher_id,
                    student_id: l.student_id,
                    subject_id: l.subject_id,
                    start: l.start,
                    duration_minutes: l.duration_minutes,
                    status: l.status,
                    group_id: l.group_id,
                    payment: l.payment,
                    location: l.location.clone(),
                    message: l.message.clone(),
                });
            }
            for w in &guard.waitlist {
                if w.start <= now {
                    continue;
                }
                events.push(Event::WaitlistJoined {
                    id: w.id,
                    teacher_id,
                    student_id: w.student_id,
                    subject_id: w.subject_id,
                    start: w.start,
                    duration_minutes: w.duration_minutes,
                    queued_at: w.queued_at,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> Result<u64, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))
    }
}
