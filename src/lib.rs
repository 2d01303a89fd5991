//! Teacher availability and booking-slot engine.
//!
//! State lives in memory, one `TeacherState` per teacher behind an RwLock,
//! and is made durable through an append-only event WAL with group commit.
//! Slot lists are derived on demand from weekly availability, date
//! exceptions, and live lessons; they are never stored.

pub mod api;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod payment;
pub mod reaper;
pub mod wal;

pub use engine::{Engine, EngineError};
