use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits;
use crate::model::*;

use super::conflict::{self, validate_duration};
use super::{availability, Engine, EngineError};

impl Engine {
    /// Bookable slots for one teacher over a date range. Read lock only;
    /// any number of these run concurrently with each other and with
    /// queries for other teachers.
    ///
    /// An unknown teacher yields an empty list rather than an error, the
    /// same shape a caller sees for a teacher whose calendar is disabled.
    pub async fn compute_slots(
        &self,
        teacher_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        duration_minutes: u32,
    ) -> Result<Vec<Slot>, EngineError> {
        if from > to {
            return Err(EngineError::ConfigurationInvalid("from after to"));
        }
        if (to - from).num_days() > limits::MAX_QUERY_DAYS {
            return Err(EngineError::ConfigurationInvalid("date range too wide"));
        }
        validate_duration(duration_minutes)?;

        let Some(ts) = self.get_teacher(&teacher_id) else {
            return Ok(Vec::new());
        };
        let query_start = std::time::Instant::now();
        let guard = ts.read().await;
        let slots =
            availability::compute_slots(&guard, from, to, duration_minutes, conflict::now());
        drop(guard);

        metrics::counter!(crate::observability::SLOT_QUERIES_TOTAL).increment(1);
        metrics::histogram!(crate::observability::SLOT_QUERY_DURATION_SECONDS)
            .record(query_start.elapsed().as_secs_f64());
        Ok(slots)
    }

    pub async fn get_policy(&self, teacher_id: Ulid) -> Result<BookingPolicy, EngineError> {
        let ts = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let guard = ts.read().await;
        Ok(guard.policy)
    }

    pub async fn get_weekly_hours(
        &self,
        teacher_id: Ulid,
    ) -> Result<Vec<WeeklyAvailability>, EngineError> {
        let ts = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let guard = ts.read().await;
        Ok(guard.weekly.clone())
    }

    pub async fn get_exceptions(
        &self,
        teacher_id: Ulid,
    ) -> Result<Vec<AvailabilityException>, EngineError> {
        let ts = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let guard = ts.read().await;
        Ok(guard.exceptions.clone())
    }

    pub async fn get_lessons(&self, teacher_id: Ulid) -> Result<Vec<Lesson>, EngineError> {
        let ts = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let guard = ts.read().await;
        Ok(guard.lessons.clone())
    }

    /// All lessons in a booking group, in start order.
    pub async fn get_group(&self, group_id: Ulid) -> Result<Vec<Lesson>, EngineError> {
        let teacher_id = self
            .get_teacher_for_entity(&group_id)
            .ok_or(EngineError::NotFound(group_id))?;
        let ts = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let guard = ts.read().await;
        Ok(guard.group_lessons(group_id).cloned().collect())
    }

    pub async fn get_waitlist(&self, teacher_id: Ulid) -> Result<Vec<WaitlistEntry>, EngineError> {
        let ts = self
            .get_teacher(&teacher_id)
            .ok_or(EngineError::NotFound(teacher_id))?;
        let guard = ts.read().await;
        Ok(guard.waitlist.clone())
    }

    pub async fn list_teachers(&self) -> Vec<TeacherInfo> {
        let mut out = Vec::with_capacity(self.state.len());
        for entry in self.state.iter() {
            let guard = entry.value().read().await;
            out.push(TeacherInfo {
                id: guard.id,
                policy: guard.policy,
            });
        }
        out
    }
}
