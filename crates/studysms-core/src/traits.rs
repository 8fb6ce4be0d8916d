//! Seams between the dispatch loop and the outside world.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::SmsReceipt;

/// Outbound SMS transport.
///
/// Constructed explicitly and passed into the dispatch loop so tests can
/// swap in a fake.
#[async_trait]
pub trait SmsTransport: Send + Sync {
    /// Transport name for logs ("twilio", "dry-run", ...).
    fn name(&self) -> &str;

    /// Number messages are sent from.
    fn from_number(&self) -> &str;

    /// Send one message. An `Err` means the provider did not accept it.
    async fn send(&self, to: &str, from: &str, body: &str) -> Result<SmsReceipt>;
}
