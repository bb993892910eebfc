//! Self-describing primary key encoding.
//!
//! Layout: one byte holding the number of key columns, then per column a
//! tag byte `(len << 3) | type` followed by the payload.
//!
//! | type | payload |
//! |------|---------|
//! | 1 integer | `len` bytes, minimal big-endian two's complement |
//! | 2 real | 8 bytes, big-endian IEEE 754 (`len` is 0) |
//! | 3 text | `len` bytes of big-endian length, then UTF-8 bytes |
//! | 4 blob | `len` bytes of big-endian length, then raw bytes |
//! | 5 null | none |

use crate::codec::Value;
use crate::error::{Error, Result};

const TYPE_INTEGER: u8 = 1;
const TYPE_REAL: u8 = 2;
const TYPE_TEXT: u8 = 3;
const TYPE_BLOB: u8 = 4;
const TYPE_NULL: u8 = 5;

/// Encode primary key values in key column order.
pub fn encode(values: &[Value]) -> Result<Vec<u8>> {
	let count = u8::try_from(values.len())
		.map_err(|_| Error::PrimaryKey(format!("{} key columns exceed 255", values.len())))?;

	let mut out = Vec::with_capacity(1 + values.len() * 9);
	out.push(count);
	for value in values {
		match value {
			Value::Null => out.push(TYPE_NULL),
			Value::Integer(i) => {
				let width = int_width(*i);
				out.push(tag(width, TYPE_INTEGER));
				out.extend_from_slice(&i.to_be_bytes()[8 - width..]);
			}
			Value::Real(r) => {
				out.push(TYPE_REAL);
				out.extend_from_slice(&r.to_be_bytes());
			}
			Value::Text(s) => push_bytes(&mut out, TYPE_TEXT, s.as_bytes()),
			Value::Blob(b) => push_bytes(&mut out, TYPE_BLOB, b),
		}
	}
	Ok(out)
}

/// Decode an encoding produced by [`encode`]. Trailing bytes are rejected.
pub fn decode(bytes: &[u8]) -> Result<Vec<Value>> {
	let mut reader = Reader { bytes, pos: 0 };
	let count = reader.take(1)?[0] as usize;
	let mut values = Vec::with_capacity(count);

	for _ in 0..count {
		let tag = reader.take(1)?[0];
		let len = (tag >> 3) as usize;
		if len > 8 {
			return Err(Error::PrimaryKey(format!("column width {} exceeds 8 bytes", len)));
		}
		let value = match tag & 0x07 {
			TYPE_INTEGER => Value::Integer(read_int(reader.take(len)?)),
			TYPE_REAL => {
				let raw = reader.take(8)?;
				let mut buf = [0u8; 8];
				buf.copy_from_slice(raw);
				Value::Real(f64::from_be_bytes(buf))
			}
			TYPE_TEXT => {
				let n = read_len(reader.take(len)?);
				let raw = reader.take(n)?;
				let text = std::str::from_utf8(raw)
					.map_err(|e| Error::PrimaryKey(format!("text column is not UTF-8: {}", e)))?;
				Value::Text(text.to_string())
			}
			TYPE_BLOB => {
				let n = read_len(reader.take(len)?);
				Value::Blob(reader.take(n)?.to_vec())
			}
			TYPE_NULL => Value::Null,
			other => return Err(Error::PrimaryKey(format!("unknown column type {}", other))),
		};
		values.push(value);
	}

	if reader.pos != bytes.len() {
		return Err(Error::PrimaryKey(format!(
			"{} trailing bytes after {} columns",
			bytes.len() - reader.pos,
			count
		)));
	}
	Ok(values)
}

fn tag(len: usize, ty: u8) -> u8 {
	((len as u8) << 3) | ty
}

/// Number of bytes needed for `i` in two's complement, 0 for zero.
fn int_width(i: i64) -> usize {
	if i == 0 {
		return 0;
	}
	let bytes = i.to_be_bytes();
	let mut skip = 0;
	while skip < 7 {
		let (lead, next) = (bytes[skip], bytes[skip + 1]);
		let redundant = (lead == 0x00 && next & 0x80 == 0) || (lead == 0xFF && next & 0x80 != 0);
		if !redundant {
			break;
		}
		skip += 1;
	}
	8 - skip
}

fn push_bytes(out: &mut Vec<u8>, ty: u8, data: &[u8]) {
	let len = data.len() as u64;
	let width = 8 - len.leading_zeros() as usize / 8;
	out.push(tag(width, ty));
	out.extend_from_slice(&len.to_be_bytes()[8 - width..]);
	out.extend_from_slice(data);
}

fn read_int(raw: &[u8]) -> i64 {
	if raw.is_empty() {
		return 0;
	}
	let fill = if raw[0] & 0x80 != 0 { 0xFF } else { 0x00 };
	let mut buf = [fill; 8];
	buf[8 - raw.len()..].copy_from_slice(raw);
	i64::from_be_bytes(buf)
}

fn read_len(raw: &[u8]) -> usize {
	raw.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize)
}

struct Reader<'a> {
	bytes: &'a [u8],
	pos: usize,
}

impl<'a> Reader<'a> {
	fn take(&mut self, n: usize) -> Result<&'a [u8]> {
		let end = self
			.pos
			.checked_add(n)
			.filter(|end| *end <= self.bytes.len())
			.ok_or_else(|| Error::PrimaryKey(format!("truncated at byte {}", self.pos)))?;
		let slice = &self.bytes[self.pos..end];
		self.pos = end;
		Ok(slice)
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn test_single_integer_layout() {
		assert_eq!(encode(&[Value::Integer(1)]).unwrap(), vec![1, 9, 1]);
		assert_eq!(encode(&[Value::Integer(0)]).unwrap(), vec![1, 1]);
	}

	#[test]
	fn test_integer_widths() {
		assert_eq!(int_width(127), 1);
		assert_eq!(int_width(128), 2);
		assert_eq!(int_width(-1), 1);
		assert_eq!(int_width(-128), 1);
		assert_eq!(int_width(-129), 2);
		assert_eq!(int_width(i64::MIN), 8);
		for i in [0, 1, -1, 127, 128, -129, 65_536, i64::MAX, i64::MIN] {
			let decoded = decode(&encode(&[Value::Integer(i)]).unwrap()).unwrap();
			assert_eq!(decoded, vec![Value::Integer(i)]);
		}
	}

	#[test]
	fn test_composite_key() {
		let key = vec![
			Value::Text("tenant".into()),
			Value::Integer(-42),
			Value::Null,
			Value::Blob(vec![0xde, 0xad]),
			Value::Real(0.5),
		];
		let bytes = encode(&key).unwrap();
		assert_eq!(bytes[0], 5);
		assert_eq!(bytes[1], (1 << 3) | TYPE_TEXT);
		assert_eq!(bytes[2], 6);
		assert_eq!(decode(&bytes).unwrap(), key);
	}

	#[test]
	fn test_empty_text() {
		let bytes = encode(&[Value::Text(String::new())]).unwrap();
		assert_eq!(bytes, vec![1, TYPE_TEXT]);
		assert_eq!(decode(&bytes).unwrap(), vec![Value::Text(String::new())]);
	}

	#[test]
	fn test_rejects_malformed() {
		assert!(decode(&[]).is_err());
		assert!(decode(&[1, 9]).is_err());
		assert!(decode(&[1, 7]).is_err());
		assert!(decode(&[1, 9, 1, 0]).is_err());
		assert!(decode(&[2, 9, 1]).is_err());
	}
}
