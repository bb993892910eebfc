//! Cursors describing what has been exchanged with each peer.
//!
//! `Send` holds the local site version a peer has acknowledged, `Receive`
//! holds the peer's database version up to which its changes were merged.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::clock::SiteId;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerEvent {
	Receive,
	Send,
}

impl ToSql for PeerEvent {
	fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
		let code = match self {
			PeerEvent::Receive => 0,
			PeerEvent::Send => 1,
		};
		Ok(ToSqlOutput::Borrowed(ValueRef::Integer(code)))
	}
}

impl FromSql for PeerEvent {
	fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
		match value.as_i64()? {
			0 => Ok(PeerEvent::Receive),
			1 => Ok(PeerEvent::Send),
			other => Err(FromSqlError::OutOfRange(other)),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedPeer {
	pub site_id: SiteId,
	pub event: PeerEvent,
	pub version: i64,
}

/// Move a peer cursor forward; older versions are ignored.
pub fn advance(conn: &Connection, site: &SiteId, event: PeerEvent, version: i64) -> Result<()> {
	conn.execute(
		"INSERT INTO crr_tracked_peers (site_id, event, version) VALUES (?1, ?2, ?3)
		ON CONFLICT (site_id, event) DO UPDATE SET version = max(version, excluded.version)",
		rusqlite::params![site, event, version],
	)?;
	Ok(())
}

pub fn get(conn: &Connection, site: &SiteId, event: PeerEvent) -> Result<Option<i64>> {
	Ok(conn
		.query_row(
			"SELECT version FROM crr_tracked_peers WHERE site_id = ?1 AND event = ?2",
			rusqlite::params![site, event],
			|row| row.get(0),
		)
		.optional()?)
}

pub fn all(conn: &Connection) -> Result<Vec<TrackedPeer>> {
	let mut stmt = conn
		.prepare("SELECT site_id, event, version FROM crr_tracked_peers ORDER BY site_id, event")?;
	let rows = stmt.query_map([], |row| {
		Ok(TrackedPeer {
			site_id: row.get(0)?,
			event: row.get(1)?,
			version: row.get(2)?,
		})
	})?;
	Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Lowest local site version acknowledged by every peer, `None` without peers.
pub fn send_floor(conn: &Connection) -> Result<Option<i64>> {
	Ok(conn.query_row(
		"SELECT min(version) FROM crr_tracked_peers WHERE event = ?1",
		[PeerEvent::Send],
		|row| row.get(0),
	)?)
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::store::migrations;

	#[test]
	fn test_cursor_moves_forward_only() {
		let mut conn = Connection::open_in_memory().unwrap();
		migrations::apply(&mut conn).unwrap();
		let peer = SiteId::generate();

		assert_eq!(send_floor(&conn).unwrap(), None);
		advance(&conn, &peer, PeerEvent::Send, 4).unwrap();
		advance(&conn, &peer, PeerEvent::Send, 2).unwrap();
		advance(&conn, &peer, PeerEvent::Receive, 7).unwrap();

		assert_eq!(get(&conn, &peer, PeerEvent::Send).unwrap(), Some(4));
		assert_eq!(get(&conn, &peer, PeerEvent::Receive).unwrap(), Some(7));
		assert_eq!(send_floor(&conn).unwrap(), Some(4));
		assert_eq!(all(&conn).unwrap().len(), 2);

		advance(&conn, &SiteId::generate(), PeerEvent::Send, 1).unwrap();
		assert_eq!(send_floor(&conn).unwrap(), Some(1));
	}
}
