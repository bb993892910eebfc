//! Changesets: change records as newline-delimited JSON, one record per line.

use std::io::{BufRead, Write};

use crate::clock::ChangeRecord;
use crate::error::{Error, Result};

/// Write `records` to `writer`, returning how many were written.
///
/// Accepts a [`crate::clock::ChangeStream`] directly; the first error from
/// the source stops the write.
pub fn write_ndjson<W, I>(writer: &mut W, records: I) -> Result<usize>
where
	W: Write,
	I: IntoIterator<Item = Result<ChangeRecord>>,
{
	let mut written = 0;
	for record in records {
		let record = record?;
		serde_json::to_writer(&mut *writer, &record).map_err(|source| Error::Changeset {
			line: written + 1,
			source,
		})?;
		writer.write_all(b"\n")?;
		written += 1;
	}
	writer.flush()?;
	Ok(written)
}

/// Read every record from `reader`. Blank lines are skipped; line numbers in
/// errors count from 1.
pub fn read_ndjson<R: BufRead>(reader: R) -> Result<Vec<ChangeRecord>> {
	let mut records = Vec::new();
	for (index, line) in reader.lines().enumerate() {
		let line = line?;
		if line.trim().is_empty() {
			continue;
		}
		let record = serde_json::from_str(&line).map_err(|source| Error::Changeset {
			line: index + 1,
			source,
		})?;
		records.push(record);
	}
	Ok(records)
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::clock::SiteId;
	use crate::codec::{Value, pk};

	fn record(column: &str, value: Value) -> ChangeRecord {
		ChangeRecord {
			table: "foo".to_string(),
			pk: pk::encode(&[Value::Integer(1)]).unwrap(),
			column: column.to_string(),
			value,
			column_version: 1,
			database_version: 1,
			seq: 0,
			origin_site: SiteId::from_bytes(&[7; 16]).unwrap(),
			causal_length: 1,
			is_local_only: true,
			tie_break_value: 1,
		}
	}

	#[test]
	fn test_one_record_per_line() {
		let records = vec![record("b", Value::from("x")), record("c", Value::Null)];
		let mut out = Vec::new();
		let n = write_ndjson(&mut out, records.iter().cloned().map(Ok)).unwrap();
		assert_eq!(n, 2);

		let text = String::from_utf8(out.clone()).unwrap();
		assert_eq!(text.lines().count(), 2);
		assert!(text.lines().all(|l| l.starts_with('{')));

		let back = read_ndjson(out.as_slice()).unwrap();
		assert_eq!(back, records);
	}

	#[test]
	fn test_blank_lines_skipped_and_errors_numbered() {
		let line = serde_json::to_string(&record("b", Value::Integer(3))).unwrap();
		let input = format!("{line}\n\n{line}\n");
		assert_eq!(read_ndjson(input.as_bytes()).unwrap().len(), 2);

		let broken = format!("{line}\n\nnot json\n");
		match read_ndjson(broken.as_bytes()) {
			Err(Error::Changeset { line, .. }) => assert_eq!(line, 3),
			other => panic!("expected changeset error, got {:?}", other),
		}
	}

	#[test]
	fn test_is_local_only_defaults_when_absent() {
		let mut json: serde_json::Value = serde_json::to_value(record("b", Value::Null)).unwrap();
		json.as_object_mut().unwrap().remove("is_local_only");
		let back = read_ndjson(json.to_string().as_bytes()).unwrap();
		assert!(!back[0].is_local_only);
	}
}
