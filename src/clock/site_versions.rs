//! Persisted map from site to the highest site version incorporated from it.

use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::clock::{MIN_VERSION, SiteId};
use crate::error::Result;

/// One row of the site version table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteVersion {
	pub site_id: SiteId,
	pub version: i64,
}

/// Per-origin cursor: everything at or below the version is known.
pub type SiteCursor = BTreeMap<SiteId, i64>;

/// Raise the stored version for `site` to at least `version`.
pub fn record_seen(conn: &Connection, site: &SiteId, version: i64) -> Result<()> {
	conn.execute(
		"INSERT INTO crr_site_versions (site_id, version) VALUES (?1, ?2)
		ON CONFLICT (site_id) DO UPDATE SET version = max(version, excluded.version)",
		rusqlite::params![site, version],
	)?;
	Ok(())
}

/// Stored version for `site`, or [`MIN_VERSION`] when nothing was seen yet.
pub fn last_seen(conn: &Connection, site: &SiteId) -> Result<i64> {
	let version = conn
		.query_row(
			"SELECT version FROM crr_site_versions WHERE site_id = ?1",
			[site],
			|row| row.get(0),
		)
		.optional()?;
	Ok(version.unwrap_or(MIN_VERSION))
}

/// All rows ordered by site id.
pub fn all(conn: &Connection) -> Result<Vec<SiteVersion>> {
	let mut stmt =
		conn.prepare("SELECT site_id, version FROM crr_site_versions ORDER BY site_id")?;
	let rows = stmt.query_map([], |row| {
		Ok(SiteVersion {
			site_id: row.get(0)?,
			version: row.get(1)?,
		})
	})?;
	Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn cursor(conn: &Connection) -> Result<SiteCursor> {
	Ok(all(conn)?
		.into_iter()
		.map(|row| (row.site_id, row.version))
		.collect())
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::store::migrations;

	fn conn() -> Connection {
		let mut conn = Connection::open_in_memory().unwrap();
		migrations::apply(&mut conn).unwrap();
		conn
	}

	#[test]
	fn test_absent_site_reads_baseline() {
		let conn = conn();
		assert_eq!(last_seen(&conn, &SiteId::generate()).unwrap(), MIN_VERSION);
		assert!(all(&conn).unwrap().is_empty());
	}

	#[test]
	fn test_record_seen_never_lowers() {
		let conn = conn();
		let site = SiteId::generate();
		record_seen(&conn, &site, 5).unwrap();
		record_seen(&conn, &site, 3).unwrap();
		assert_eq!(last_seen(&conn, &site).unwrap(), 5);
		record_seen(&conn, &site, 9).unwrap();
		assert_eq!(last_seen(&conn, &site).unwrap(), 9);
	}

	#[test]
	fn test_rows_ordered_by_site() {
		let conn = conn();
		let a = SiteId::generate();
		let b = SiteId::generate();
		record_seen(&conn, &a, 1).unwrap();
		record_seen(&conn, &b, 2).unwrap();
		let rows = all(&conn).unwrap();
		assert_eq!(rows.len(), 2);
		assert!(rows[0].site_id < rows[1].site_id);
		assert_eq!(cursor(&conn).unwrap().get(&b), Some(&2));
	}
}
