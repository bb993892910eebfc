use log::{debug, warn};
use rusqlite::Connection;

use crate::error::Result;
use crate::store::ReplicaOptions;

/// Connection settings every replica runs with.
pub(crate) fn apply(conn: &Connection, options: &ReplicaOptions, on_disk: bool) -> Result<()> {
	conn.busy_timeout(options.busy_timeout)?;
	conn.pragma_update(None, "foreign_keys", "ON")?;

	if on_disk && options.wal {
		let mode: String =
			conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
		if !mode.eq_ignore_ascii_case("wal") {
			warn!("journal_mode WAL unavailable, running with '{}'", mode);
		}
		conn.pragma_update(None, "synchronous", "NORMAL")?;
	}
	debug!(
		"connection configured (busy_timeout {:?}, wal {})",
		options.busy_timeout,
		on_disk && options.wal
	);
	Ok(())
}
