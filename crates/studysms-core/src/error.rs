//! Error types shared by every studysms crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StudySmsError {
    /// A participant field is missing or malformed after normalization.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An import file does not carry the required columns.
    #[error("Schema error: check column names, we need the following: {}", required.join(", "))]
    Schema { required: Vec<String>, found: Vec<String> },

    /// The messaging provider rejected or never received a send.
    #[error("Transport error: {0}")]
    Transport(String),

    /// More than one row shares a (name, phone) key.
    #[error("Duplicate key: {rows} rows match ({name}, {phone})")]
    DuplicateKey { name: String, phone: String, rows: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Another dispatch run holds the lock.
    #[error("Dispatch already running: {0}")]
    Busy(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StudySmsError>;

impl StudySmsError {
    /// Short machine-readable kind, used in API responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Schema { .. } => "schema",
            Self::Transport(_) => "transport",
            Self::DuplicateKey { .. } => "duplicate_key",
            Self::NotFound(_) => "not_found",
            Self::Busy(_) => "busy",
            Self::Database(_) => "database",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_error_names_required_columns() {
        let err = StudySmsError::Schema {
            required: vec!["subject_name".into(), "phone_number".into(), "date_of_study".into()],
            found: vec!["subject_name".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("subject_name, phone_number, date_of_study"));
        assert_eq!(err.kind(), "schema");
    }
}
