//! Twilio Programmable Messaging transport.
//!
//! Sends through the REST API (`POST /2010-04-01/Accounts/{sid}/Messages.json`)
//! with form-encoded parameters and HTTP basic auth. Network failures and 5xx
//! answers are retried up to `max_attempts`; a 4xx is final.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use studysms_core::config::TwilioConfig;
use studysms_core::{Result, SmsReceipt, SmsTransport, StudySmsError};

/// Error body returned by the Twilio API.
#[derive(Debug, Deserialize)]
struct TwilioError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

/// Accepted message as returned by the Twilio API.
#[derive(Debug, Deserialize)]
struct TwilioMessage {
    sid: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    from: String,
}

/// One failed attempt and whether another is worth making.
struct AttemptError {
    error: StudySmsError,
    retryable: bool,
}

pub struct TwilioTransport {
    config: TwilioConfig,
    client: reqwest::Client,
}

impl TwilioTransport {
    /// Build a transport; fails when credentials are missing.
    pub fn new(config: TwilioConfig) -> Result<Self> {
        if config.account_sid.is_empty() || config.auth_token.is_empty() {
            return Err(StudySmsError::Config(
                "Twilio account_sid and auth_token must be set (or TWILIO_ACCOUNT_SID / TWILIO_AUTH_TOKEN)".into(),
            ));
        }
        if config.from_number.is_empty() {
            return Err(StudySmsError::Config(
                "Twilio from_number must be set (or TWILIO_FROM_NUMBER)".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| StudySmsError::Config(format!("HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid
        )
    }

    async fn attempt(&self, to: &str, from: &str, body: &str) -> std::result::Result<SmsReceipt, AttemptError> {
        let form = [("To", to), ("From", from), ("Body", body)];
        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| AttemptError {
                error: StudySmsError::Transport(format!("Twilio request failed: {e}")),
                retryable: true,
            })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AttemptError {
                error: StudySmsError::Transport(describe_error(status.as_u16(), &text)),
                retryable: status.is_server_error(),
            });
        }

        let message: TwilioMessage = serde_json::from_str(&text).map_err(|e| AttemptError {
            error: StudySmsError::Transport(format!("Invalid Twilio response: {e}")),
            retryable: false,
        })?;
        Ok(SmsReceipt {
            sid: message.sid,
            to: if message.to.is_empty() { to.to_string() } else { message.to },
            from: if message.from.is_empty() { from.to_string() } else { message.from },
            status: message.status,
        })
    }
}

#[async_trait]
impl SmsTransport for TwilioTransport {
    fn name(&self) -> &str {
        "twilio"
    }

    fn from_number(&self) -> &str {
        &self.config.from_number
    }

    async fn send(&self, to: &str, from: &str, body: &str) -> Result<SmsReceipt> {
        let to = to_e164(to);
        let from = to_e164(from);
        let max_attempts = self.config.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            match self.attempt(&to, &from, body).await {
                Ok(receipt) => {
                    tracing::debug!("Twilio message sent: {} → {}", receipt.sid, to);
                    return Ok(receipt);
                }
                Err(AttemptError { error, retryable }) => {
                    if !retryable || attempt >= max_attempts {
                        return Err(error);
                    }
                    tracing::warn!("Twilio attempt {attempt}/{max_attempts} to {to} failed, retrying: {error}");
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Stored numbers are bare US digits; Twilio wants E.164.
pub fn to_e164(number: &str) -> String {
    let number = number.trim();
    if number.starts_with('+') {
        return number.to_string();
    }
    let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        10 => format!("+1{digits}"),
        11 if digits.starts_with('1') => format!("+{digits}"),
        _ => number.to_string(),
    }
}

/// "Twilio error 400 (21211): The 'To' number ... is not valid".
fn describe_error(status: u16, body: &str) -> String {
    match serde_json::from_str::<TwilioError>(body) {
        Ok(TwilioError { code: Some(code), message }) => {
            format!("Twilio error {status} ({code}): {message}")
        }
        Ok(TwilioError { code: None, message }) if !message.is_empty() => {
            format!("Twilio error {status}: {message}")
        }
        _ => format!("Twilio error {status}: {}", body.trim()),
    }
}
