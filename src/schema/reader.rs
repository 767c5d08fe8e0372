//! Reading examguard.input.v1 streams
//!
//! Records arrive either as NDJSON (one record per line) or as a JSON array.

use crate::error::IntegrityError;
use crate::schema::input::{InputRecord, ValidationError};

/// Parser and batch validator for input records
pub struct RecordReader;

impl RecordReader {
    /// Parse a JSON string containing an array of records
    pub fn parse_array(json: &str) -> Result<Vec<InputRecord>, IntegrityError> {
        let records: Vec<InputRecord> = serde_json::from_str(json)?;
        Ok(records)
    }

    /// Parse NDJSON (newline-delimited JSON) containing records
    pub fn parse_ndjson(ndjson: &str) -> Result<Vec<InputRecord>, IntegrityError> {
        let mut records = Vec::new();
        for (line_num, line) in ndjson.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<InputRecord>(trimmed) {
                Ok(record) => records.push(record),
                Err(e) => {
                    return Err(IntegrityError::ParseError(format!(
                        "Failed to parse line {}: {}",
                        line_num + 1,
                        e
                    )));
                }
            }
        }
        Ok(records)
    }

    /// Validate a batch of records.
    ///
    /// Besides per-record checks, timestamps must not go backwards. Only
    /// failures are returned.
    pub fn validate_records(records: &[InputRecord]) -> Vec<ValidationResult> {
        let mut previous = None;
        let mut failures = Vec::new();

        for (index, record) in records.iter().enumerate() {
            let result = match record.validate() {
                Err(e) => Some(e),
                Ok(()) => match previous {
                    Some(prev) if record.timestamp < prev => Some(ValidationError::OutOfOrder {
                        previous: prev,
                        actual: record.timestamp,
                    }),
                    _ => None,
                },
            };
            previous = Some(previous.map_or(record.timestamp, |p| record.timestamp.max(p)));

            if result.is_some() {
                failures.push(ValidationResult {
                    index,
                    record_id: record.record_id.clone(),
                    result,
                });
            }
        }
        failures
    }
}

/// Result of record validation
#[derive(Debug)]
pub struct ValidationResult {
    pub index: usize,
    pub record_id: Option<String>,
    pub result: Option<ValidationError>,
}
