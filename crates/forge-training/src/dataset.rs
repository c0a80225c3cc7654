use crate::error::TrainingResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable identifier for a dataset (content hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub String);

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A single instruction/output pair read from a data file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub instruction: String,
    pub output: String,
}

impl TrainingRecord {
    #[must_use]
    pub fn new(instruction: impl Into<String>, output: impl Into<String>) -> Self {
        Self { instruction: instruction.into(), output: output.into() }
    }

    /// Text the model is trained on.
    #[must_use]
    pub fn to_prompt(&self) -> String {
        format!("### Question:\n{}\n\n### Answer:\n{}", self.instruction, self.output)
    }
}

/// Why a non-blank line was not accepted as a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowRejection {
    InvalidJson(String),
    NotAnObject,
    MissingField(&'static str),
    NotAString(&'static str),
}

impl fmt::Display for RowRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson(e) => write!(f, "invalid JSON: {e}"),
            Self::NotAnObject => f.write_str("not a JSON object"),
            Self::MissingField(field) => write!(f, "missing field '{field}'"),
            Self::NotAString(field) => write!(f, "field '{field}' is not a string"),
        }
    }
}

/// Classification of one line of a newline-delimited JSON data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    /// Whitespace only; neither loaded nor skipped.
    Blank,
    Record(TrainingRecord),
    Rejected(RowRejection),
}

/// Classifies a single data file line.
///
/// Extra fields on the object are ignored.
#[must_use]
pub fn parse_line(line: &str) -> ParsedLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ParsedLine::Blank;
    }

    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => return ParsedLine::Rejected(RowRejection::InvalidJson(e.to_string())),
    };
    let Some(obj) = value.as_object() else {
        return ParsedLine::Rejected(RowRejection::NotAnObject);
    };

    let field = |name: &'static str| match obj.get(name) {
        None => Err(RowRejection::MissingField(name)),
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(RowRejection::NotAString(name)),
    };

    match (field("instruction"), field("output")) {
        (Ok(instruction), Ok(output)) => ParsedLine::Record(TrainingRecord { instruction, output }),
        (Err(e), _) | (_, Err(e)) => ParsedLine::Rejected(e),
    }
}

pub fn compute_dataset_id(records: &[TrainingRecord]) -> TrainingResult<DatasetId> {
    let mut hasher = Sha256::new();

    for record in records {
        let bytes = serde_json::to_vec(record)?;
        hasher.update(bytes);
        hasher.update(b"\n");
    }

    Ok(DatasetId(hex::encode(hasher.finalize())))
}
