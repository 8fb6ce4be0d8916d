//! Outbound SMS transports.
//!
//! Every transport implements [`studysms_core::SmsTransport`]; the dispatch
//! loop never knows which one it is talking to.

pub mod dry_run;
pub mod twilio;

pub use dry_run::DryRunTransport;
pub use twilio::TwilioTransport;
