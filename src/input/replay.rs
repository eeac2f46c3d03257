use std::fs::{File, OpenOptions};
use std::path::Path;

use anyhow::Result;
use log::warn;

use crate::sink::delimiter_byte;

/// Lazy reader over an expression file. Each row is one expression; if a row was split on the
/// delimiter its fields are joined back together.
pub struct ExpressionReader {
    records: csv::StringRecordsIntoIter<File>,
}

impl ExpressionReader {
    pub fn open(path: impl AsRef<Path>, delimiter: char) -> Result<Self> {
        let reader = csv::ReaderBuilder::new()
            .delimiter(delimiter_byte(delimiter)?)
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;
        Ok(Self {
            records: reader.into_records(),
        })
    }
}

impl Iterator for ExpressionReader {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.records.next()? {
                Ok(record) => return Some(record.iter().collect()),
                Err(e) if e.is_io_error() => {
                    warn!("Stopped reading expressions: {e}");
                    return None;
                }
                Err(e) => warn!("Skipping unreadable expression row: {e}"),
            }
        }
    }
}

/// Reads the whole file at once.
pub fn read_expressions(path: impl AsRef<Path>, delimiter: char) -> Result<Vec<String>> {
    Ok(ExpressionReader::open(path, delimiter)?.collect())
}

/// Appends one row per expression, creating the file if needed.
pub fn write_expressions<I, S>(
    path: impl AsRef<Path>,
    expressions: I,
    delimiter: char,
) -> Result<usize>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter_byte(delimiter)?)
        .from_writer(file);

    let mut written = 0;
    for expression in expressions {
        writer.write_record([expression.as_ref()])?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{read_expressions, write_expressions, ExpressionReader};

    #[test]
    fn test_that_expressions_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alphas.csv");
        let expressions = vec![
            "rank(-close)".to_string(),
            "ts_mean(volume, 20) | 1".to_string(),
            "group_neutralize(rank(returns), industry)".to_string(),
            "\"quoted\" text".to_string(),
        ];

        assert_eq!(write_expressions(&path, &expressions, '|').unwrap(), 4);
        assert_eq!(read_expressions(&path, '|').unwrap(), expressions);
    }

    #[test]
    fn test_that_writes_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alphas.csv");

        write_expressions(&path, ["rank(open)"], '|').unwrap();
        write_expressions(&path, ["rank(high)", "rank(low)"], '|').unwrap();

        let read = read_expressions(&path, '|').unwrap();
        assert_eq!(read, vec!["rank(open)", "rank(high)", "rank(low)"]);
    }

    #[test]
    fn test_that_split_rows_are_joined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alphas.csv");
        fs::write(&path, "rank(close),1\nzscore(open)\n").unwrap();

        let mut reader = ExpressionReader::open(&path, ',').unwrap();
        assert_eq!(reader.next().as_deref(), Some("rank(close)1"));
        assert_eq!(reader.next().as_deref(), Some("zscore(open)"));
        assert_eq!(reader.next(), None);
    }

    #[test]
    fn test_that_non_ascii_delimiter_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alphas.csv");
        fs::write(&path, "rank(close)\n").unwrap();

        assert!(ExpressionReader::open(&path, '§').is_err());
    }
}
