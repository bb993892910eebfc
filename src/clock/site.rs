use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Globally unique identity of one replica.
///
/// Ordering follows the 16 identifier bytes; it is the final tie-break
/// between competing writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(Uuid);

impl SiteId {
	pub fn generate() -> Self {
		SiteId(Uuid::new_v4())
	}

	pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
		Ok(SiteId(Uuid::from_slice(bytes)?))
	}

	pub fn as_bytes(&self) -> &[u8; 16] {
		self.0.as_bytes()
	}
}

impl From<Uuid> for SiteId {
	fn from(id: Uuid) -> Self {
		SiteId(id)
	}
}

impl std::str::FromStr for SiteId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Uuid::parse_str(s).map(SiteId)
	}
}

impl fmt::Display for SiteId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl ToSql for SiteId {
	fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
		Ok(ToSqlOutput::Borrowed(ValueRef::Blob(self.0.as_bytes())))
	}
}

impl FromSql for SiteId {
	fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
		let blob = value.as_blob()?;
		Uuid::from_slice(blob)
			.map(SiteId)
			.map_err(|_| FromSqlError::InvalidBlobSize {
				expected_size: 16,
				blob_size: blob.len(),
			})
	}
}

/// Read the persisted site id, generating and storing one on first open.
pub(crate) fn load_or_create(conn: &Connection) -> Result<SiteId> {
	let existing: Option<SiteId> = conn
		.query_row("SELECT site_id FROM crr_site_id WHERE ordinal = 0", [], |row| {
			row.get(0)
		})
		.optional()?;

	if let Some(site) = existing {
		return Ok(site);
	}

	let site = SiteId::generate();
	conn.execute(
		"INSERT INTO crr_site_id (ordinal, site_id) VALUES (0, ?1)",
		[&site],
	)?;
	log::info!("assigned new site id {}", site);
	Ok(site)
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn test_order_follows_bytes() {
		let low = SiteId::from_bytes(&[0u8; 16]).unwrap();
		let mut high_bytes = [0u8; 16];
		high_bytes[0] = 1;
		let high = SiteId::from_bytes(&high_bytes).unwrap();
		assert!(high > low);
		assert_eq!(high.as_bytes(), &high_bytes);
	}

	#[test]
	fn test_display_parses_back() {
		let site = SiteId::generate();
		let parsed: SiteId = site.to_string().parse().unwrap();
		assert_eq!(site, parsed);
	}

	#[test]
	fn test_rejects_short_bytes() {
		assert!(SiteId::from_bytes(&[1, 2, 3]).is_err());
	}
}
