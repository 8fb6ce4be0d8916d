//! Bulk participant import from delimited text or `.xlsx` spreadsheets.
//!
//! The file must carry `subject_name`, `phone_number` and `date_of_study`
//! columns (any order, extra columns ignored). Rows with an empty required
//! cell are dropped; a malformed value rejects the whole file. Valid rows are
//! written in one transaction.

use calamine::{Data, DataType, Reader, Xlsx};
use serde::Serialize;
use std::io::Cursor;
use std::path::Path;

use studysms_core::types::format_date;
use studysms_core::{NewParticipant, Result, StudySmsError};

use crate::persistence::ParticipantDb;

/// Columns every import file must have.
pub const REQUIRED_COLUMNS: [&str; 3] = ["subject_name", "phone_number", "date_of_study"];

/// Supported import file types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportFormat {
    /// Delimited text; comma for `.csv`, tab for `.tsv`/`.txt` unless the
    /// header line says otherwise.
    Delimited { delimiter: u8 },
    Xlsx,
}

impl ImportFormat {
    /// Pick a format from the file extension.
    pub fn from_file_name(name: &str) -> Result<Self> {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "csv" => Ok(Self::Delimited { delimiter: b',' }),
            "tsv" | "txt" => Ok(Self::Delimited { delimiter: b'\t' }),
            "xlsx" => Ok(Self::Xlsx),
            _ => Err(StudySmsError::Validation(format!(
                "Unsupported import file '{name}': use .csv, .tsv, .txt or .xlsx"
            ))),
        }
    }
}

/// Result of a successful import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub inserted: usize,
    /// Rows dropped for an empty required cell.
    pub skipped: usize,
}

/// Header plus data rows, each tagged with its 1-based line number.
struct Table {
    headers: Vec<String>,
    rows: Vec<(usize, Vec<String>)>,
}

/// Import a file from disk.
pub fn import_file(db: &ParticipantDb, path: &Path) -> Result<ImportSummary> {
    let name = path.to_string_lossy();
    let format = ImportFormat::from_file_name(&name)?;
    let bytes = std::fs::read(path)?;
    import_bytes(db, format, &bytes)
}

/// Import an in-memory file (e.g. an upload).
pub fn import_bytes(db: &ParticipantDb, format: ImportFormat, bytes: &[u8]) -> Result<ImportSummary> {
    let (participants, skipped) = parse(format, bytes)?;
    let inserted = db.insert_many(&participants)?;
    tracing::info!("📥 Imported {inserted} participants ({skipped} incomplete rows skipped)");
    Ok(ImportSummary { inserted, skipped })
}

/// Parse and validate without writing. Returns the rows and the skip count.
pub fn parse(format: ImportFormat, bytes: &[u8]) -> Result<(Vec<NewParticipant>, usize)> {
    let table = match format {
        ImportFormat::Delimited { delimiter } => read_delimited(bytes, delimiter)?,
        ImportFormat::Xlsx => read_xlsx(bytes)?,
    };
    to_participants(table)
}

/// Delimiter that occurs most in the header line, or `fallback`.
fn sniff_delimiter(bytes: &[u8], fallback: u8) -> u8 {
    let header = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
    let count = |d: u8| header.iter().filter(|b| **b == d).count();
    [b'\t', b',', b';']
        .into_iter()
        .map(|d| (count(d), d))
        .filter(|(n, _)| *n > 0)
        .max_by_key(|(n, _)| *n)
        .map(|(_, d)| d)
        .unwrap_or(fallback)
}

fn read_delimited(bytes: &[u8], fallback: u8) -> Result<Table> {
    let delimiter = sniff_delimiter(bytes, fallback);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|e| StudySmsError::Validation(format!("Unreadable header line: {e}")))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let line = i + 2;
        let record = record
            .map_err(|e| StudySmsError::Validation(format!("Line {line}: unreadable row: {e}")))?;
        rows.push((line, record.iter().map(str::to_string).collect()));
    }
    Ok(Table { headers, rows })
}

fn read_xlsx(bytes: &[u8]) -> Result<Table> {
    let mut workbook = Xlsx::new(Cursor::new(bytes))
        .map_err(|e| StudySmsError::Validation(format!("Unreadable spreadsheet: {e}")))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| StudySmsError::Validation("Spreadsheet has no sheets".into()))?
        .map_err(|e| StudySmsError::Validation(format!("Unreadable sheet: {e}")))?;

    let mut rows = range.rows();
    let headers = rows
        .next()
        .map(|row| row.iter().map(cell_text).collect())
        .unwrap_or_default();
    let rows = rows
        .enumerate()
        .map(|(i, row)| (i + 2, row.iter().map(cell_text).collect()))
        .collect();
    Ok(Table { headers, rows })
}

/// Spreadsheet cell as the text a person would type.
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        // Phone numbers typed into Excel come back as floats.
        Data::Float(f) if f.fract() == 0.0 => format!("{}", *f as i64),
        Data::Int(i) => i.to_string(),
        Data::DateTime(_) | Data::DateTimeIso(_) => cell
            .as_date()
            .map(format_date)
            .unwrap_or_else(|| cell.to_string()),
        other => other.to_string(),
    }
}

fn to_participants(table: Table) -> Result<(Vec<NewParticipant>, usize)> {
    let normalized: Vec<String> = table
        .headers
        .iter()
        .map(|h| h.trim().trim_start_matches('\u{feff}').to_ascii_lowercase())
        .collect();
    let position = |col: &str| normalized.iter().position(|h| h == col);
    let (Some(name_ix), Some(phone_ix), Some(date_ix)) = (
        position(REQUIRED_COLUMNS[0]),
        position(REQUIRED_COLUMNS[1]),
        position(REQUIRED_COLUMNS[2]),
    ) else {
        return Err(StudySmsError::Schema {
            required: REQUIRED_COLUMNS.iter().map(|c| c.to_string()).collect(),
            found: normalized,
        });
    };

    let mut participants = Vec::with_capacity(table.rows.len());
    let mut skipped = 0;
    for (line, row) in table.rows {
        let cell = |ix: usize| row.get(ix).map(|s| s.trim()).unwrap_or_default();
        let (name, phone, date) = (cell(name_ix), cell(phone_ix), cell(date_ix));
        if row.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        if name.is_empty() || phone.is_empty() || date.is_empty() {
            tracing::debug!("Import line {line}: missing required value, skipped");
            skipped += 1;
            continue;
        }
        let participant = NewParticipant::parse(name, phone, date).map_err(|e| {
            StudySmsError::Validation(format!("Line {line}: {e}"))
        })?;
        participants.push(participant);
    }
    Ok((participants, skipped))
}
