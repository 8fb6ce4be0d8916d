//! Dispatch loop: one pass over every participant for a given day.
//!
//! A stage is stamped only after the transport accepted the message. A send
//! that fails leaves the participant untouched so a later run on the same
//! offset day can try again.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashSet;

use studysms_core::types::{normalize_name, normalize_phone};
use studysms_core::{Participant, Result, SmsTransport, Stage, StudySmsError};

use crate::persistence::{KeyUpdate, LogEntry, ParticipantDb, UnreadableRow};
use crate::schedule::decide;

/// A message the loop would send today.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedSend {
    pub participant_id: i64,
    pub name: String,
    pub phone_number: String,
    pub stage: Stage,
    pub body: String,
}

/// A message the provider accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentMessage {
    pub name: String,
    pub phone_number: String,
    pub stage: Stage,
    pub sid: String,
}

/// A participant the loop could not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchFailure {
    pub name: String,
    pub phone_number: String,
    pub stage: Stage,
    /// The message went out but the stamp could not be written.
    pub delivered: bool,
    pub error: String,
}

/// Summary of one dispatch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub date: NaiveDate,
    pub transport: String,
    /// Nothing was stamped or logged.
    pub dry_run: bool,
    pub considered: usize,
    pub ignored: usize,
    /// Due today but stamped by an earlier run.
    pub already_sent: usize,
    pub sent: Vec<SentMessage>,
    pub failures: Vec<DispatchFailure>,
    /// `(name, phone)` keys shared by more than one row.
    pub duplicate_keys: Vec<String>,
    /// Rows skipped because they could not be read.
    pub unreadable: Vec<UnreadableRow>,
}

impl DispatchReport {
    fn new(date: NaiveDate, transport: &str, dry_run: bool, considered: usize) -> Self {
        Self {
            date,
            transport: transport.to_string(),
            dry_run,
            considered,
            ignored: 0,
            already_sent: 0,
            sent: Vec::new(),
            failures: Vec::new(),
            duplicate_keys: Vec::new(),
            unreadable: Vec::new(),
        }
    }

    /// Number of messages the provider accepted.
    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.unreadable.is_empty()
    }
}

enum Step {
    Ignored,
    Idle,
    AlreadySent,
    Send(PlannedSend),
}

fn classify(participant: &Participant, today: NaiveDate) -> Step {
    if participant.ignore {
        return Step::Ignored;
    }
    let Some(decision) = decide(participant.date_of_study, today) else {
        return Step::Idle;
    };
    if participant.stamp(decision.stage).is_some() {
        return Step::AlreadySent;
    }
    Step::Send(PlannedSend {
        participant_id: participant.id,
        name: participant.name.clone(),
        phone_number: participant.phone_number.clone(),
        stage: decision.stage,
        body: decision.render(participant.first_name()),
    })
}

/// Messages due on `today`, without sending anything.
pub fn plan(participants: &[Participant], today: NaiveDate) -> Vec<PlannedSend> {
    participants
        .iter()
        .filter_map(|p| match classify(p, today) {
            Step::Send(planned) => Some(planned),
            _ => None,
        })
        .collect()
}

/// Send every message due on `today` and stamp the ones that went out.
pub async fn run(
    db: &ParticipantDb,
    transport: &dyn SmsTransport,
    today: NaiveDate,
) -> Result<DispatchReport> {
    run_inner(db, transport, today, false).await
}

/// Hand every due message to `transport` but leave the store untouched:
/// no stamps and no message log rows.
pub async fn rehearse(
    db: &ParticipantDb,
    transport: &dyn SmsTransport,
    today: NaiveDate,
) -> Result<DispatchReport> {
    run_inner(db, transport, today, true).await
}

async fn run_inner(
    db: &ParticipantDb,
    transport: &dyn SmsTransport,
    today: NaiveDate,
    dry_run: bool,
) -> Result<DispatchReport> {
    let roster = db.roster()?;
    let participants = roster.participants;
    let mut report = DispatchReport::new(today, transport.name(), dry_run, participants.len());
    report.unreadable = roster.unreadable;
    tracing::info!(
        "📤 Dispatch for {} via {}{}: {} participants",
        today,
        transport.name(),
        if dry_run { " (dry run)" } else { "" },
        participants.len()
    );

    // Duplicate rows share a key; the first delivered send covers the rest.
    let mut delivered: HashSet<(String, String, Stage)> = HashSet::new();

    for participant in &participants {
        let planned = match classify(participant, today) {
            Step::Ignored => {
                report.ignored += 1;
                continue;
            }
            Step::Idle => continue,
            Step::AlreadySent => {
                report.already_sent += 1;
                continue;
            }
            Step::Send(planned) => planned,
        };
        let key = dedupe_key(&planned);
        if delivered.contains(&key) {
            report.already_sent += 1;
            if !dry_run {
                cover_duplicate(db, planned, &mut report);
            }
            continue;
        }
        if send_one(db, transport, planned, &mut report).await {
            delivered.insert(key);
        }
    }

    tracing::info!(
        "📤 Dispatch for {} done: {} sent, {} failed, {} ignored, {} already sent",
        today,
        report.sent_count(),
        report.failures.len(),
        report.ignored,
        report.already_sent
    );
    Ok(report)
}

/// Rows whose stored keys differ only in formatting still share one send.
fn dedupe_key(planned: &PlannedSend) -> (String, String, Stage) {
    let phone = normalize_phone(&planned.phone_number)
        .unwrap_or_else(|_| planned.phone_number.clone());
    (normalize_name(&planned.name), phone, planned.stage)
}

/// Stamp the rows keyed exactly as loaded. Zero matching rows is an error:
/// the stage would otherwise stay open and go out again.
fn stamp(
    db: &ParticipantDb,
    name: &str,
    phone_number: &str,
    stage: Stage,
    date: NaiveDate,
) -> Result<KeyUpdate> {
    let outcome = db.stamp_stored(name, phone_number, stage, date)?;
    if outcome.matched == 0 {
        return Err(StudySmsError::NotFound(format!(
            "no row keyed ({name}, {phone_number}) left to stamp"
        )));
    }
    Ok(outcome)
}

/// A duplicate of an already delivered row: stamp it without sending.
fn cover_duplicate(db: &ParticipantDb, planned: PlannedSend, report: &mut DispatchReport) {
    let PlannedSend { name, phone_number, stage, .. } = planned;
    if let Err(e) = stamp(db, &name, &phone_number, stage, report.date) {
        tracing::error!("{stage} for duplicate {name} ({phone_number}) could not be stamped: {e}");
        report.failures.push(DispatchFailure {
            name,
            phone_number,
            stage,
            delivered: true,
            error: e.to_string(),
        });
    }
}

/// Send one message and stamp it. Returns whether the provider accepted it.
async fn send_one(
    db: &ParticipantDb,
    transport: &dyn SmsTransport,
    planned: PlannedSend,
    report: &mut DispatchReport,
) -> bool {
    let PlannedSend {
        name,
        phone_number,
        stage,
        body,
        ..
    } = planned;

    let receipt = match transport
        .send(&phone_number, transport.from_number(), &body)
        .await
    {
        Ok(receipt) => receipt,
        Err(e) => {
            let error = e.to_string();
            tracing::warn!("⚠️ {stage} to {name} ({phone_number}) failed: {error}");
            if !report.dry_run {
                let entry = LogEntry::failed(&phone_number, &body, Some(stage), &error);
                if let Err(log_err) = db.log_message(&entry) {
                    tracing::warn!("Failed to log send failure: {log_err}");
                }
            }
            report.failures.push(DispatchFailure {
                name,
                phone_number,
                stage,
                delivered: false,
                error,
            });
            return false;
        }
    };

    if report.dry_run {
        report.sent.push(SentMessage {
            name,
            phone_number,
            stage,
            sid: receipt.sid,
        });
        return true;
    }

    if let Err(log_err) =
        db.log_message(&LogEntry::sent(&phone_number, &body, Some(stage), &receipt.sid))
    {
        tracing::warn!("Failed to log send: {log_err}");
    }

    match stamp(db, &name, &phone_number, stage, report.date) {
        Ok(outcome) => {
            if outcome.is_duplicate() {
                report
                    .duplicate_keys
                    .push(format!("{name} ({phone_number}): {} rows", outcome.matched));
            }
            tracing::info!("✅ {stage} sent to {name} ({phone_number}) [{}]", receipt.sid);
            report.sent.push(SentMessage {
                name,
                phone_number,
                stage,
                sid: receipt.sid,
            });
        }
        Err(e) => {
            // Delivered but unstamped: a rerun today will send again.
            tracing::error!("{stage} sent to {name} ({phone_number}) but stamping failed: {e}");
            report.sent.push(SentMessage {
                name: name.clone(),
                phone_number: phone_number.clone(),
                stage,
                sid: receipt.sid,
            });
            report.failures.push(DispatchFailure {
                name,
                phone_number,
                stage,
                delivered: true,
                error: e.to_string(),
            });
        }
    }
    true
}
