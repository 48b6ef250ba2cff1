//! CSV form of an aggregate table: `kind,identifier,count,sum,min,max`.
//! Value columns are empty for facts that carry no value.
use std::io::{Read, Write};
use thiserror::Error;

use super::{AggregateRow, AggregateTable};

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("invalid aggregate row {row}: {message}")]
    InvalidRow { row: usize, message: String },
}

pub fn write_csv<W: Write>(table: &AggregateTable, writer: W) -> Result<(), ExportError> {
    let mut out = csv::Writer::from_writer(writer);
    for row in table.rows() {
        out.serialize(row)?;
    }
    out.flush().map_err(csv::Error::from)?;
    Ok(())
}

pub fn read_csv<R: Read>(reader: R) -> Result<AggregateTable, ExportError> {
    let mut input = csv::Reader::from_reader(reader);
    let mut table = AggregateTable::new();
    for (i, row) in input.deserialize::<AggregateRow>().enumerate() {
        let (key, entry) = row?
            .into_entry()
            .map_err(|message| ExportError::InvalidRow { row: i + 1, message })?;
        table.add_entry(key, &entry);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{FactKind, FactRecord};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn table() -> AggregateTable {
        let fact = |kind, identifier: &str, value| FactRecord {
            kind,
            identifier: identifier.to_string(),
            unit: Arc::from("u"),
            value,
            scope: None,
            line: 1,
        };
        AggregateTable::from_facts(&[
            fact(FactKind::Import, "os", None),
            fact(FactKind::Call, "os.path.join", None),
            fact(FactKind::Metric, "cyclomatic", Some(2.0)),
            fact(FactKind::Metric, "cyclomatic", Some(5.0)),
            fact(FactKind::pattern("bare-except"), "except, really", None),
        ])
    }

    #[test]
    fn test_csv_layout() {
        let mut buf = Vec::new();
        write_csv(&table(), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "kind,identifier,count,sum,min,max");
        assert_eq!(lines[1], "call,os.path.join,1,,,");
        assert!(lines.contains(&"metric,cyclomatic,2,7.0,2.0,5.0"));
        assert!(lines.contains(&"pattern:bare-except,\"except, really\",1,,,"));
    }

    #[test]
    fn test_csv_read_back() {
        let mut buf = Vec::new();
        write_csv(&table(), &mut buf).unwrap();
        assert_eq!(read_csv(buf.as_slice()).unwrap(), table());
    }

    #[test]
    fn test_bad_kind_is_reported_with_row() {
        let text = "kind,identifier,count,sum,min,max\ncall,a,1,,,\nbogus,b,1,,,\n";
        match read_csv(text.as_bytes()) {
            Err(ExportError::InvalidRow { row, .. }) => assert_eq!(row, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
