//! # studysms core
//! Shared configuration, errors, domain types and the transport trait.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::StudySmsConfig;
pub use error::{Result, StudySmsError};
pub use traits::SmsTransport;
pub use types::{Direction, MessageRecord, NewParticipant, Participant, SmsReceipt, Stage};
