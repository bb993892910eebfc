//! Bookkeeping tables created in every replica.

use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

const BOOKKEEPING_DDL: &str = "
	CREATE TABLE IF NOT EXISTS crr_master (
		key TEXT PRIMARY KEY NOT NULL,
		value ANY
	);

	CREATE TABLE IF NOT EXISTS crr_site_id (
		ordinal INTEGER PRIMARY KEY,
		site_id BLOB NOT NULL UNIQUE
	);

	CREATE TABLE IF NOT EXISTS crr_site_versions (
		site_id BLOB PRIMARY KEY NOT NULL,
		version INTEGER NOT NULL
	) WITHOUT ROWID;

	CREATE TABLE IF NOT EXISTS crr_tracked_peers (
		site_id BLOB NOT NULL,
		event INTEGER NOT NULL,
		version INTEGER NOT NULL,
		PRIMARY KEY (site_id, event)
	) WITHOUT ROWID;

	CREATE TABLE IF NOT EXISTS crr_tracked_tables (
		name TEXT PRIMARY KEY NOT NULL
	) WITHOUT ROWID;

	CREATE TABLE IF NOT EXISTS crr_clock (
		tbl TEXT NOT NULL,
		pk BLOB NOT NULL,
		cid TEXT NOT NULL,
		col_version INTEGER NOT NULL,
		db_version INTEGER NOT NULL,
		seq INTEGER NOT NULL,
		site_id BLOB NOT NULL,
		cl INTEGER NOT NULL,
		site_version INTEGER NOT NULL,
		PRIMARY KEY (tbl, pk, cid)
	);

	CREATE INDEX IF NOT EXISTS crr_clock_db_version ON crr_clock (db_version, seq);
";

/// Create the bookkeeping tables and record the schema version.
pub fn apply(conn: &mut Connection) -> Result<()> {
	let tx = conn.transaction()?;
	tx.execute_batch(BOOKKEEPING_DDL)?;
	tx.execute(
		"INSERT INTO crr_master (key, value) VALUES ('schema_version', ?1)
		ON CONFLICT (key) DO NOTHING",
		[SCHEMA_VERSION],
	)?;
	tx.commit()?;
	Ok(())
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn test_apply_is_repeatable() {
		let mut conn = Connection::open_in_memory().unwrap();
		apply(&mut conn).unwrap();
		apply(&mut conn).unwrap();
		let version: i64 = conn
			.query_row(
				"SELECT value FROM crr_master WHERE key = 'schema_version'",
				[],
				|row| row.get(0),
			)
			.unwrap();
		assert_eq!(version, SCHEMA_VERSION);
	}
}
