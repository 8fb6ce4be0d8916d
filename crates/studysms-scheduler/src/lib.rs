//! # studysms scheduler
//!
//! Decides which participant gets which text today, sends it, and records
//! the send so the same stage never fires twice.
//!
//! ## Architecture
//! ```text
//! dispatch::run(today)
//!   ├── ParticipantDb::get_all()          (persistence)
//!   ├── skip ignored / already stamped
//!   ├── schedule::decide(study_date, today)
//!   │     └── exact offset match: -3, 0, 2, 6, 9, 11, 29, 32, 34, 89, 92, 94
//!   ├── SmsTransport::send(to, from, body)
//!   └── on success: ParticipantDb::upsert_stage(name, phone, stage, today)
//! ```
//!
//! Bulk import (`import`) and the run lock (`guard`) sit beside the loop.

pub mod dispatch;
pub mod guard;
pub mod import;
pub mod persistence;
pub mod schedule;

pub use dispatch::{DispatchFailure, DispatchReport, PlannedSend, SentMessage, plan, rehearse, run};
pub use guard::RunGuard;
pub use import::{ImportFormat, ImportSummary, REQUIRED_COLUMNS};
pub use persistence::{KeyUpdate, LogEntry, ParticipantDb, Roster, UnreadableRow};
pub use schedule::{Decision, SCHEDULE, ScheduleEntry, decide};
