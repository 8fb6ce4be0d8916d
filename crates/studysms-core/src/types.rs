//! Domain types: participants, contact stages and the message log.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StudySmsError};

/// Storage and display format for every date in the system.
pub const DATE_FORMAT: &str = "%m/%d/%Y";

/// Formats accepted on input, tried in order.
const INPUT_DATE_FORMATS: &[&str] = &[DATE_FORMAT, "%Y-%m-%d", "%Y-%m-%d %H:%M:%S"];

/// One named point in the fixed contact sequence.
///
/// Variants are declared in firing order, so `Ord` follows the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    IntroText,
    Rem1,
    Rem2,
    Rem3,
    Rem4,
    Pay1,
    Rem5,
    Rem6,
    Pay2,
    Rem7,
    Rem8,
    Pay3,
}

impl Stage {
    pub const ALL: [Stage; 12] = [
        Stage::IntroText,
        Stage::Rem1,
        Stage::Rem2,
        Stage::Rem3,
        Stage::Rem4,
        Stage::Pay1,
        Stage::Rem5,
        Stage::Rem6,
        Stage::Pay2,
        Stage::Rem7,
        Stage::Rem8,
        Stage::Pay3,
    ];

    /// Column name in the `participants` table.
    pub fn column(&self) -> &'static str {
        match self {
            Stage::IntroText => "intro_text",
            Stage::Rem1 => "rem1",
            Stage::Rem2 => "rem2",
            Stage::Rem3 => "rem3",
            Stage::Rem4 => "rem4",
            Stage::Pay1 => "pay1",
            Stage::Rem5 => "rem5",
            Stage::Rem6 => "rem6",
            Stage::Pay2 => "pay2",
            Stage::Rem7 => "rem7",
            Stage::Rem8 => "rem8",
            Stage::Pay3 => "pay3",
        }
    }

    pub fn is_payment(&self) -> bool {
        matches!(self, Stage::Pay1 | Stage::Pay2 | Stage::Pay3)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.column())
    }
}

impl FromStr for Stage {
    type Err = StudySmsError;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.column() == s.trim())
            .ok_or_else(|| StudySmsError::Validation(format!("Unknown stage '{s}'")))
    }
}

/// A stored study participant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Participant {
    pub id: i64,
    pub name: String,
    pub phone_number: String,
    #[serde(serialize_with = "serialize_us_date")]
    pub date_of_study: NaiveDate,
    pub ignore: bool,
    /// Send date of every stage that has fired.
    #[serde(serialize_with = "serialize_stamps")]
    pub stamps: BTreeMap<Stage, NaiveDate>,
}

impl Participant {
    /// First word of the name, e.g. "Ian Ferguson" => "Ian".
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or(&self.name)
    }

    pub fn stamp(&self, stage: Stage) -> Option<NaiveDate> {
        self.stamps.get(&stage).copied()
    }
}

/// A validated participant ready to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewParticipant {
    pub name: String,
    pub phone_number: String,
    pub date_of_study: NaiveDate,
}

impl NewParticipant {
    /// Normalize and validate raw form/import input.
    pub fn parse(name: &str, phone_number: &str, date_of_study: &str) -> Result<Self> {
        let name = normalize_name(name);
        if name.is_empty() {
            return Err(StudySmsError::Validation("Subject name is required".into()));
        }
        let phone_number = normalize_phone(phone_number)?;
        let date_of_study = parse_date(date_of_study)?;
        Ok(Self {
            name,
            phone_number,
            date_of_study,
        })
    }
}

/// Title-case every word and collapse whitespace: "  ian  FERGUSON " => "Ian Ferguson".
pub fn normalize_name(raw: &str) -> String {
    raw.split_whitespace()
        .map(title_case_word)
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_case_word(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    let mut boundary = true;
    for c in word.chars() {
        if c.is_alphabetic() {
            if boundary {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            boundary = false;
        } else {
            out.push(c);
            boundary = true;
        }
    }
    out
}

/// Strip `+1`, dashes, dots, parentheses and whitespace; the rest must be digits.
pub fn normalize_phone(raw: &str) -> Result<String> {
    let stripped = raw.trim().replace("+1", "");
    let digits: String = stripped
        .chars()
        .filter(|c| !matches!(c, '-' | '.' | '(' | ')') && !c.is_whitespace())
        .collect();
    if digits.is_empty() {
        return Err(StudySmsError::Validation("Phone number is required".into()));
    }
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(StudySmsError::Validation(format!(
            "Phone number '{}' contains non-digit characters",
            raw.trim()
        )));
    }
    Ok(digits)
}

/// Parse a study date. Accepts `MM/DD/YYYY` and ISO forms.
pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(StudySmsError::Validation("Date of study is required".into()));
    }
    let parsed = INPUT_DATE_FORMATS.iter().find_map(|fmt| {
        NaiveDate::parse_from_str(raw, fmt)
            .or_else(|_| chrono::NaiveDateTime::parse_from_str(raw, fmt).map(|dt| dt.date()))
            .ok()
    });
    match parsed {
        // Two-digit years parse as year 00xx under %Y.
        Some(date) if date.year() >= 1900 => Ok(date),
        _ => Err(StudySmsError::Validation(format!(
            "Date of study '{raw}' is not a valid MM/DD/YYYY date"
        ))),
    }
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Storage encoding of the ignore flag.
pub fn ignore_to_str(ignore: bool) -> &'static str {
    if ignore { "True" } else { "False" }
}

pub fn ignore_from_str(raw: &str) -> bool {
    matches!(raw.trim(), "True" | "true" | "1")
}

fn serialize_us_date<S: Serializer>(date: &NaiveDate, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&format_date(*date))
}

fn serialize_stamps<S: Serializer>(
    stamps: &BTreeMap<Stage, NaiveDate>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    let formatted: BTreeMap<&'static str, String> = stamps
        .iter()
        .map(|(stage, date)| (stage.column(), format_date(*date)))
        .collect();
    formatted.serialize(s)
}

/// Receipt returned by a transport after the provider accepted a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsReceipt {
    /// Provider message id (Twilio `SM...` sid).
    pub sid: String,
    pub to: String,
    pub from: String,
    pub status: String,
}

/// Direction of a logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
        }
    }
}

/// One row of the message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub direction: Direction,
    /// Recipient for outbound messages, sender for inbound ones.
    pub phone_number: String,
    pub body: String,
    pub stage: Option<Stage>,
    /// `sent`, `failed` or `received`.
    pub status: String,
    pub provider_sid: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  ian  FERGUSON "), "Ian Ferguson");
        assert_eq!(normalize_name("mary-jane o'neil"), "Mary-Jane O'Neil");
        assert_eq!(normalize_name("   "), "");
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("+1 (650) 223-5997").unwrap(), "6502235997");
        assert_eq!(normalize_phone("650.223.5997").unwrap(), "6502235997");
        assert!(matches!(normalize_phone(""), Err(StudySmsError::Validation(_))));
        assert!(matches!(normalize_phone("650-CALL-NOW"), Err(StudySmsError::Validation(_))));
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2022, 6, 1).unwrap();
        assert_eq!(parse_date("06/01/2022").unwrap(), expected);
        assert_eq!(parse_date("6/1/2022").unwrap(), expected);
        assert_eq!(parse_date("2022-06-01").unwrap(), expected);
        assert_eq!(parse_date("2022-06-01 00:00:00").unwrap(), expected);
        assert!(parse_date("6/1/22").is_err());
        assert!(parse_date("13/40/2022").is_err());
        assert!(parse_date("").is_err());
    }

    #[test]
    fn test_new_participant_rejects_empty_fields() {
        assert!(NewParticipant::parse("", "6502235997", "06/01/2022").is_err());
        assert!(NewParticipant::parse("Ian Ferguson", " ", "06/01/2022").is_err());
        assert!(NewParticipant::parse("Ian Ferguson", "6502235997", "").is_err());

        let p = NewParticipant::parse("ian ferguson", "+1 650-223-5997", "06/01/2022").unwrap();
        assert_eq!(p.name, "Ian Ferguson");
        assert_eq!(p.phone_number, "6502235997");
    }

    #[test]
    fn test_stage_round_trip_names() {
        for stage in Stage::ALL {
            assert_eq!(stage.column().parse::<Stage>().unwrap(), stage);
        }
        assert!("rem9".parse::<Stage>().is_err());
        assert_eq!(
            serde_json::to_string(&Stage::IntroText).unwrap(),
            "\"intro_text\""
        );
    }

    #[test]
    fn test_participant_serializes_us_dates() {
        let mut stamps = BTreeMap::new();
        stamps.insert(Stage::Rem1, NaiveDate::from_ymd_opt(2022, 6, 1).unwrap());
        let p = Participant {
            id: 1,
            name: "Ian Ferguson".into(),
            phone_number: "6502235997".into(),
            date_of_study: NaiveDate::from_ymd_opt(2022, 6, 1).unwrap(),
            ignore: false,
            stamps,
        };
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["date_of_study"], "06/01/2022");
        assert_eq!(json["stamps"]["rem1"], "06/01/2022");
        assert_eq!(p.first_name(), "Ian");
    }

    #[test]
    fn test_ignore_encoding() {
        assert_eq!(ignore_to_str(true), "True");
        assert!(ignore_from_str("True"));
        assert!(ignore_from_str("1"));
        assert!(!ignore_from_str("False"));
    }
}
