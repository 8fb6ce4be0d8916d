//! Transport that logs instead of sending. Used by `distribute --dry-run`.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

use studysms_core::{Result, SmsReceipt, SmsTransport};

pub struct DryRunTransport {
    from_number: String,
    counter: AtomicU64,
}

impl DryRunTransport {
    pub fn new(from_number: impl Into<String>) -> Self {
        Self {
            from_number: from_number.into(),
            counter: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl SmsTransport for DryRunTransport {
    fn name(&self) -> &str {
        "dry-run"
    }

    fn from_number(&self) -> &str {
        &self.from_number
    }

    async fn send(&self, to: &str, from: &str, body: &str) -> Result<SmsReceipt> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!("[dry-run] {from} → {to}: {body}");
        Ok(SmsReceipt {
            sid: format!("DRY{n:06}"),
            to: to.to_string(),
            from: from.to_string(),
            status: "dry-run".into(),
        })
    }
}
