//! JSON-facing request and response shapes. The engine itself speaks
//! domain types; this module is the translation layer an HTTP frontend
//! serializes at the edge.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::{BookingReceipt, Selection, Slot};

/// Slot listing request. `to` defaults to six days past `from`, so the
/// default window is one calendar week.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotQuery {
    pub teacher_id: Ulid,
    pub subject_id: Ulid,
    pub from: NaiveDate,
    #[serde(default)]
    pub to: Option<NaiveDate>,
    pub duration_minutes: u32,
}

impl SlotQuery {
    pub fn date_range(&self) -> (NaiveDate, NaiveDate) {
        (self.from, self.to.unwrap_or(self.from + Duration::days(6)))
    }
}

/// One bookable slot as shown to students.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotEntry {
    pub datetime: NaiveDateTime,
    pub duration_minutes: u32,
    pub end_datetime: NaiveDateTime,
    pub available: bool,
}

impl From<Slot> for SlotEntry {
    fn from(slot: Slot) -> Self {
        Self {
            datetime: slot.start,
            duration_minutes: slot.duration_minutes,
            end_datetime: slot.end,
            available: true,
        }
    }
}

/// One requested interval inside a booking request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestedSlot {
    pub datetime: NaiveDateTime,
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingRequest {
    pub teacher_id: Ulid,
    pub student_id: Ulid,
    pub subject_id: Ulid,
    /// Free-text meeting place (online link, address). Stored on every
    /// lesson in the group, never interpreted by the engine.
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    pub selections: Vec<RequestedSlot>,
    pub amount_cents: i64,
}

impl BookingRequest {
    /// Engine-facing selections: every requested slot inherits the
    /// request's subject.
    pub fn to_selections(&self) -> Vec<Selection> {
        self.selections
            .iter()
            .map(|s| Selection {
                subject_id: self.subject_id,
                start: s.datetime,
                duration_minutes: s.duration_minutes,
            })
            .collect()
    }
}

/// Booking outcome. Serialized untagged: both arms carry a `success`
/// discriminator so clients branch on one field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum BookingResponse {
    Success {
        success: bool,
        booking_group_id: Ulid,
        redirect_target: String,
    },
    Conflict {
        success: bool,
        error: String,
        /// Indices into the submitted selection list that caused the
        /// refusal. Empty for non-selection failures.
        conflicting_selections: Vec<usize>,
    },
}

impl BookingResponse {
    pub fn from_result(result: Result<BookingReceipt, EngineError>) -> Self {
        match result {
            Ok(receipt) => BookingResponse::Success {
                success: true,
                booking_group_id: receipt.group_id,
                redirect_target: format!("/bookings/{}", receipt.group_id),
            },
            Err(e) => {
                let conflicting_selections = match &e {
                    EngineError::SlotConflict { conflicting } => conflicting.clone(),
                    EngineError::PolicyViolation { violating } => violating.clone(),
                    _ => Vec::new(),
                };
                BookingResponse::Conflict {
                    success: false,
                    error: e.to_string(),
                    conflicting_selections,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    #[test]
    fn slot_query_default_range_is_one_week() {
        let q = SlotQuery {
            teacher_id: Ulid::new(),
            subject_id: Ulid::new(),
            from: NaiveDate::from_ymd_opt(2026, 9, 7).unwrap(),
            to: None,
            duration_minutes: 60,
        };
        let (from, to) = q.date_range();
        assert_eq!(from, NaiveDate::from_ymd_opt(2026, 9, 7).unwrap());
        assert_eq!(to, NaiveDate::from_ymd_opt(2026, 9, 13).unwrap());
    }

    #[test]
    fn slot_entry_from_slot() {
        let slot = Slot {
            start: dt("2026-09-07 09:00"),
            duration_minutes: 60,
            end: dt("2026-09-07 10:00"),
        };
        let entry = SlotEntry::from(slot);
        assert_eq!(entry.datetime, dt("2026-09-07 09:00"));
        assert_eq!(entry.end_datetime, dt("2026-09-07 10:00"));
        assert!(entry.available);
    }

    #[test]
    fn request_selections_inherit_subject() {
        let subject = Ulid::new();
        let req = BookingRequest {
            teacher_id: Ulid::new(),
            student_id: Ulid::new(),
            subject_id: subject,
            location: Some("online".into()),
            message: None,
            selections: vec![
                RequestedSlot {
                    datetime: dt("2026-09-07 09:00"),
                    duration_minutes: 45,
                },
                RequestedSlot {
                    datetime: dt("2026-09-14 09:00"),
                    duration_minutes: 45,
                },
            ],
            amount_cents: 9_000,
        };
        let selections = req.to_selections();
        assert_eq!(selections.len(), 2);
        assert!(selections.iter().all(|s| s.subject_id == subject));
        assert_eq!(selections[1].start, dt("2026-09-14 09:00"));
    }

    #[test]
    fn success_response_shape() {
        let group = Ulid::new();
        let resp = BookingResponse::from_result(Ok(BookingReceipt {
            group_id: group,
            lesson_ids: vec![Ulid::new()],
            auto_approved: true,
        }));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["booking_group_id"], group.to_string());
        assert_eq!(json["redirect_target"], format!("/bookings/{group}"));
    }

    #[test]
    fn conflict_response_carries_indices() {
        let resp = BookingResponse::from_result(Err(EngineError::SlotConflict {
            conflicting: vec![0, 2],
        }));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["conflicting_selections"][0], 0);
        assert_eq!(json["conflicting_selections"][1], 2);
    }

    #[test]
    fn booking_request_roundtrip() {
        let req = BookingRequest {
            teacher_id: Ulid::new(),
            student_id: Ulid::new(),
            subject_id: Ulid::new(),
            location: None,
            message: Some("looking forward to it".into()),
            selections: vec![RequestedSlot {
                datetime: dt("2026-09-07 09:00"),
                duration_minutes: 45,
            }],
            amount_cents: 4_500,
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: BookingRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.teacher_id, req.teacher_id);
        assert_eq!(back.selections.len(), 1);
        assert_eq!(back.message.as_deref(), Some("looking forward to it"));
    }
}
