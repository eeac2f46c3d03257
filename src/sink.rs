//! Append-only result file. The header is taken from the first record written and every later
//! row has to carry exactly the same columns; rows that do not are rejected rather than written
//! out of alignment.
use std::fmt::Display;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use log::{info, warn};

use crate::http::brain::{AlphaDetail, BrainError};

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// One resolved simulation: ordered metric name to value pairs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultRecord {
    fields: Vec<(String, Value)>,
}

impl ResultRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.fields.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.fields.iter().map(|(_, value)| value)
    }

    fn matches(&self, header: &[String]) -> bool {
        self.fields.len() == header.len()
            && self.columns().zip(header).all(|(a, b)| a == b.as_str())
    }
}

/// Counts are truncated to integers, turnover/returns/drawdown become percentages and margin is
/// expressed in basis points, all rounded to two decimals.
impl From<&AlphaDetail> for ResultRecord {
    fn from(value: &AlphaDetail) -> Self {
        let is = &value.in_sample;
        let mut record = ResultRecord::new();
        record.push("alphaId", Value::Text(value.id.clone()));
        record.push("pnl", Value::Integer(is.pnl as i64));
        record.push("longCount", Value::Integer(is.long_count as i64));
        record.push("shortCount", Value::Integer(is.short_count as i64));
        record.push("turnover", Value::Float(round2(is.turnover * 100.0)));
        record.push("returns", Value::Float(round2(is.returns * 100.0)));
        record.push("drawdown", Value::Float(round2(is.drawdown * 100.0)));
        record.push("margin", Value::Float(round2(is.margin * 10_000.0)));
        record.push("sharpe", Value::Float(is.sharpe));
        record.push("fitness", Value::Float(is.fitness));
        record.push("code", Value::Text(value.regular.code.clone()));
        record
    }
}

pub(crate) fn delimiter_byte(delimiter: char) -> Result<u8, BrainError> {
    if delimiter.is_ascii() {
        Ok(delimiter as u8)
    } else {
        warn!("CSV delimiter must be a single ASCII character, got {delimiter:?}");
        Err(BrainError::InvalidDelimiter { delimiter })
    }
}

/// Shared by every worker. `append` holds the sink lock across the header check, the header
/// write and the rows of one batch.
pub struct ResultSink {
    path: PathBuf,
    delimiter: u8,
    header: Mutex<Option<Vec<String>>>,
}

impl ResultSink {
    pub fn new(path: impl AsRef<Path>, delimiter: char) -> Result<Self, BrainError> {
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            delimiter: delimiter_byte(delimiter)?,
            header: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn existing_header(&self) -> Result<Option<Vec<String>>> {
        let has_content = fs::metadata(&self.path)
            .map(|meta| meta.len() > 0)
            .unwrap_or(false);
        if !has_content {
            return Ok(None);
        }
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .from_path(&self.path)?;
        match reader.records().next() {
            Some(record) => Ok(Some(record?.iter().map(|s| s.to_string()).collect())),
            None => Ok(None),
        }
    }

    /// Writes the rows that match the header and returns how many were written. The first
    /// record ever seen for a new file fixes the header.
    pub fn append(&self, records: &[ResultRecord]) -> Result<usize> {
        let Some(first) = records.first() else {
            return Ok(0);
        };

        let mut header = self.header.lock().unwrap_or_else(PoisonError::into_inner);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_writer(file);

        if header.is_none() {
            *header = self.existing_header()?;
        }
        let columns = match header.as_ref() {
            Some(columns) => columns.clone(),
            None => {
                let columns: Vec<String> = first.columns().map(|s| s.to_string()).collect();
                writer.write_record(&columns)?;
                info!("Created result file {}", self.path.display());
                *header = Some(columns.clone());
                columns
            }
        };

        let mut written = 0;
        for record in records {
            if !record.matches(&columns) {
                warn!(
                    "Rejecting result row with columns {:?}, file has {:?}",
                    record.columns().collect::<Vec<_>>(),
                    columns
                );
                continue;
            }
            writer.write_record(record.values().map(|v| v.to_string()))?;
            written += 1;
        }
        writer.flush()?;
        Ok(written)
    }
}
