mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod waitlist;

pub use availability::{compute_slots, day_open_intervals, merge_overlapping, occupied_zones, subtract_intervals};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedTeacherState = Arc<RwLock<TeacherState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    /// A group of events committed with a single flush: either the whole
    /// group becomes durable or none of it does.
    AppendBatch {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    #[cfg(test)]
    FailNextFlush,
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    let flush_err = wal.flush_sync().err();
    if append_err.is_some() || flush_err.is_some() {
        // Partially buffered bytes must not leak into the next batch
        let _ = wal.discard_buffered();
    }
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::AppendBatch { events, response } => {
            let _ = response.send(wal.append_batch(&events));
        }
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        #[cfg(test)]
        WalCommand::FailNextFlush => wal.fail_next_flush(),
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The booking engine: one `TeacherState` behind one RwLock per teacher.
/// Slot queries take read locks and run freely in parallel; booking
/// transactions, cancellations, and calendar edits take the write lock,
/// serializing per teacher while unrelated teachers proceed concurrently.
pub struct Engine {
    pub state: DashMap<Ulid, SharedTeacherState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: entity (weekly range / exception / lesson / group /
    /// waitlist entry) id → teacher id.
    pub(super) entity_to_teacher: DashMap<Ulid, Ulid>,
}

/// Apply an event directly to a TeacherState (no locking — caller holds the lock).
fn apply_to_state(ts: &mut TeacherState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::PolicyUpdated { policy, .. } => {
            ts.policy = *policy;
        }
        Event::WeeklyHoursAdded {
            id,
            teacher_id,
            weekday,
            start,
            end,
        } => {
            ts.weekly.push(WeeklyAvailability {
                id: *id,
                weekday: *weekday,
                start: *start,
                end: *end,
            });
            entity_map.insert(*id, *teacher_id);
        }
        Event::WeeklyHoursRemoved { id, .. } => {
            ts.weekly.retain(|w| w.id != *id);
            entity_map.remove(id);
        }
        Event::WeeklyDayCleared { weekday, .. } => {
            for w in ts.weekly.iter().filter(|w| w.weekday == *weekday) {
                entity_map.remove(&w.id);
            }
            ts.weekly.retain(|w| w.weekday != *weekday);
        }
        Event::ExceptionAdded {
            id,
            teacher_id,
            date,
            start,
            end,
            kind,
            reason,
        } => {
            ts.exceptions.push(AvailabilityException {
                id: *id,
                date: *date,
                start: *start,
                end: *end,
                kind: *kind,
                reason: reason.clone(),
            });
            entity_map.insert(*id, *teacher_id);
        }
        Event::ExceptionRemoved { id, .. } => {
            ts.exceptions.retain(|e| e.id != *id);
            entity_map.remove(id);
        }
        Event::LessonReserved {
            id,
            teacher_id,
            student_id,
            subject_id,
            start,
            duration_minutes,
            status,
            group_id,
            payment,
            location,
            message,
        } => {
            ts.insert_lesson(Lesson {
                id: *id,
                student_id: *student_id,
                subject_id: *subject_id,
                start: *start,
                duration_minutes: *duration_minutes,
                status: *status,
                group_id: *group_id,
                payment: *payment,
                location: location.clone(),
                message: message.clone(),
            });
            entity_map.insert(*id, *teacher_id);
            entity_map.insert(*group_id, *teacher_id);
        }
        Event::LessonStatusChanged { id, status, .. } => {
            if let Some(lesson) = ts.lesson_mut(*id) {
                lesson.status = *status;
            }
        }
        Event::PaymentCaptured { group_id, .. } => {
            for lesson in ts.lessons.iter_mut().filter(|l| l.group_id == *group_id) {
                lesson.payment = PaymentState::Captured;
            }
        }
        Event::PaymentReleased { group_id, .. } => {
            for lesson in ts.lessons.iter_mut().filter(|l| l.group_id == *group_id) {
                lesson.payment = PaymentState::Released;
            }
        }
        Event::WaitlistJoined {
            id,
            teacher_id,
            student_id,
            subject_id,
            start,
            duration_minutes,
            queued_at,
        } => {
            ts.waitlist.push(WaitlistEntry {
                id: *id,
                student_id: *student_id,
                subject_id: *subject_id,
                start: *start,
                duration_minutes: *duration_minutes,
                queued_at: *queued_at,
            });
            entity_map.insert(*id, *teacher_id);
        }
        Event::WaitlistLeft { id, .. } => {
            ts.waitlist.retain(|e| e.id != *id);
            entity_map.remove(id);
        }
        // TeacherRegistered is handled at the DashMap level, not here
        Event::TeacherRegistered { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            entity_to_teacher: DashMap::new(),
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context.
        for event in &events {
            match event {
                Event::TeacherRegistered { id, policy } => {
                    let ts = TeacherState::new(*id, *policy);
                    engine.state.insert(*id, Arc::new(RwLock::new(ts)));
                }
                other => {
                    if let Some(teacher_id) = event_teacher_id(other)
                        && let Some(entry) = engine.state.get(&teacher_id) {
                            let ts_arc = entry.clone();
                            let mut guard = ts_arc.try_write().expect("replay: uncontended write");
                            apply_to_state(&mut guard, other, &engine.entity_to_teacher);
                        }
                }
            }
        }

        metrics::gauge!(crate::observability::TEACHERS_ACTIVE).set(engine.state.len() as f64);
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_teacher(&self, id: &Ulid) -> Option<SharedTeacherState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_teacher_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_teacher.get(entity_id).map(|e| *e.value())
    }

    /// Write a group of events to the WAL as one flush unit.
    pub(super) async fn wal_append_batch(&self, events: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendBatch {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify in one call. Eliminates the repeated 3-line pattern.
    pub(super) async fn persist_and_apply(
        &self,
        teacher_id: Ulid,
        ts: &mut TeacherState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_state(ts, event, &self.entity_to_teacher);
        self.notify.send(teacher_id, event);
        Ok(())
    }

    /// Group-commit variant of `persist_and_apply`: all events become
    /// durable in one flush before any of them is applied or announced,
    /// so a storage error mid-group can never leave a partial commit,
    /// neither in memory nor in the replayed log.
    pub(super) async fn persist_group_and_apply(
        &self,
        teacher_id: Ulid,
        ts: &mut TeacherState,
        events: &[Event],
    ) -> Result<(), EngineError> {
        self.wal_append_batch(events).await?;
        for event in events {
            apply_to_state(ts, event, &self.entity_to_teacher);
            self.notify.send(teacher_id, event);
        }
        Ok(())
    }

    /// Arrange for the next WAL flush to fail, exercising storage-error paths.
    #[cfg(test)]
    pub(super) async fn wal_fail_next_flush(&self) {
        let _ = self.wal_tx.send(WalCommand::FailNextFlush).await;
    }

    /// Lookup entity → teacher, get teacher, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<TeacherState>), EngineError> {
        let teacher_id = self
            .get_teacher_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let ts = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let guard = ts.write_owned().await;
        Ok((teacher_id, guard))
    }
}

/// Extract the teacher_id from an event (for non-Register events).
fn event_teacher_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::PolicyUpdated { teacher_id, .. }
        | Event::WeeklyHoursAdded { teacher_id, .. }
        | Event::WeeklyHoursRemoved { teacher_id, .. }
        | Event::WeeklyDayCleared { teacher_id, .. }
        | Event::ExceptionAdded { teacher_id, .. }
        | Event::ExceptionRemoved { teacher_id, .. }
        | Event::LessonReserved { teacher_id, .. }
        | Event::LessonStatusChanged { teacher_id, .. }
        | Event::PaymentCaptured { teacher_id, .. }
        | Event::PaymentReleased { teacher_id, .. }
        | Event::WaitlistJoined { teacher_id, .. }
        | Event::WaitlistLeft { teacher_id, .. } => Some(*teacher_id),
        Event::TeacherRegistered { .. } => None,
    }
}
