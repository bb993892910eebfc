//! Column-level change log.
//!
//! One clock entry exists per (table, primary key, column). Row lifecycle
//! (insert, delete, resurrection) is tracked on the sentinel column `-1`,
//! whose causal length is the row's: odd while the row is alive, even once
//! it has been deleted.

use std::collections::VecDeque;

use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::clock::{MIN_VERSION, SiteCursor, SiteId, peers};
use crate::codec::{Value, pk};
use crate::error::Result;
use crate::store::schema::TrackedTables;

/// Column name used for row lifecycle records.
pub const SENTINEL: &str = "-1";

/// The unit exchanged between replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
	pub table: String,
	/// Encoded primary key, see [`crate::codec::pk`].
	pub pk: Vec<u8>,
	pub column: String,
	pub value: Value,
	pub column_version: i64,
	/// Version of the replica that produced this record.
	pub database_version: i64,
	pub seq: i64,
	pub origin_site: SiteId,
	pub causal_length: i64,
	/// Authored here and not yet acknowledged by every tracked peer.
	#[serde(default)]
	pub is_local_only: bool,
	/// Site version of the origin when it authored the write.
	pub tie_break_value: i64,
}

impl ChangeRecord {
	pub fn is_sentinel(&self) -> bool {
		self.column == SENTINEL
	}

	/// A lifecycle record with an even causal length deletes the row.
	pub fn is_delete(&self) -> bool {
		self.is_sentinel() && self.causal_length % 2 == 0
	}
}

/// Stored clock metadata of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClockEntry {
	pub col_version: i64,
	pub db_version: i64,
	pub seq: i64,
	pub site_id: SiteId,
	pub cl: i64,
	pub site_version: i64,
}

const ENTRY_COLUMNS: &str = "col_version, db_version, seq, site_id, cl, site_version";

fn entry_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<ClockEntry> {
	Ok(ClockEntry {
		col_version: row.get(offset)?,
		db_version: row.get(offset + 1)?,
		seq: row.get(offset + 2)?,
		site_id: row.get(offset + 3)?,
		cl: row.get(offset + 4)?,
		site_version: row.get(offset + 5)?,
	})
}

pub(crate) fn get_entry(
	conn: &Connection,
	table: &str,
	pk: &[u8],
	column: &str,
) -> Result<Option<ClockEntry>> {
	let sql =
		format!("SELECT {ENTRY_COLUMNS} FROM crr_clock WHERE tbl = ?1 AND pk = ?2 AND cid = ?3");
	Ok(conn
		.prepare_cached(&sql)?
		.query_row(rusqlite::params![table, pk, column], |row| entry_from_row(row, 0))
		.optional()?)
}

pub(crate) fn put_entry(
	conn: &Connection,
	table: &str,
	pk: &[u8],
	column: &str,
	entry: &ClockEntry,
) -> Result<()> {
	conn.prepare_cached(
		"INSERT INTO crr_clock
			(tbl, pk, cid, col_version, db_version, seq, site_id, cl, site_version)
		VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
		ON CONFLICT (tbl, pk, cid) DO UPDATE SET
			col_version = excluded.col_version,
			db_version = excluded.db_version,
			seq = excluded.seq,
			site_id = excluded.site_id,
			cl = excluded.cl,
			site_version = excluded.site_version",
	)?
	.execute(rusqlite::params![
		table,
		pk,
		column,
		entry.col_version,
		entry.db_version,
		entry.seq,
		entry.site_id,
		entry.cl,
		entry.site_version,
	])?;
	Ok(())
}

/// Causal length of a row, 0 when the row has never been recorded.
pub(crate) fn row_causal_length(conn: &Connection, table: &str, pk: &[u8]) -> Result<i64> {
	Ok(get_entry(conn, table, pk, SENTINEL)?.map_or(0, |e| e.cl))
}

/// Drop every cell entry of a row, keeping the sentinel.
pub(crate) fn drop_cells(conn: &Connection, table: &str, pk: &[u8]) -> Result<usize> {
	Ok(conn
		.prepare_cached("DELETE FROM crr_clock WHERE tbl = ?1 AND pk = ?2 AND cid != ?3")?
		.execute(rusqlite::params![table, pk, SENTINEL])?)
}

/// Number the entries of one database version 0..n in their current order.
pub(crate) fn compact_seq(conn: &Connection, db_version: i64) -> Result<()> {
	let mut stmt = conn.prepare("SELECT rowid FROM crr_clock WHERE db_version = ?1 ORDER BY seq")?;
	let rowids = stmt
		.query_map([db_version], |row| row.get::<_, i64>(0))?
		.collect::<rusqlite::Result<Vec<_>>>()?;
	let mut update = conn.prepare("UPDATE crr_clock SET seq = ?1 WHERE rowid = ?2")?;
	for (seq, rowid) in rowids.into_iter().enumerate() {
		update.execute(rusqlite::params![seq as i64, rowid])?;
	}
	Ok(())
}

/// Position in the change log; records strictly after it are returned next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeCursor {
	pub db_version: i64,
	pub seq: i64,
}

impl ChangeCursor {
	/// Cursor selecting every record with `database_version > version`.
	pub fn after_version(version: i64) -> Self {
		Self {
			db_version: version,
			seq: i64::MAX,
		}
	}
}

/// Lazy stream of change records ordered by `(database_version, seq)`.
///
/// Rows are fetched a page at a time. [`ChangeStream::position`] returns the
/// cursor of the last record handed out so a consumer can resume later.
pub struct ChangeStream<'r> {
	conn: &'r Connection,
	tables: &'r TrackedTables,
	local_site: SiteId,
	send_floor: Option<i64>,
	unseen_by: Option<SiteCursor>,
	position: ChangeCursor,
	page_size: usize,
	page: VecDeque<(String, Vec<u8>, String, ClockEntry)>,
	exhausted: bool,
}

impl<'r> ChangeStream<'r> {
	pub(crate) fn new(
		conn: &'r Connection,
		tables: &'r TrackedTables,
		local_site: SiteId,
		from: ChangeCursor,
		page_size: usize,
	) -> Result<Self> {
		Ok(Self {
			conn,
			tables,
			local_site,
			send_floor: peers::send_floor(conn)?,
			unseen_by: None,
			position: from,
			page_size: page_size.max(1),
			page: VecDeque::new(),
			exhausted: false,
		})
	}

	/// Only yield records a peer with this site version cursor has not seen.
	pub(crate) fn unseen_by(mut self, cursor: SiteCursor) -> Self {
		self.unseen_by = Some(cursor);
		self
	}

	pub fn position(&self) -> ChangeCursor {
		self.position
	}

	fn fill(&mut self) -> Result<()> {
		let sql = format!(
			"SELECT tbl, pk, cid, {ENTRY_COLUMNS} FROM crr_clock
			WHERE (db_version, seq) > (?1, ?2)
			ORDER BY db_version, seq
			LIMIT ?3"
		);
		let mut stmt = self.conn.prepare_cached(&sql)?;
		let rows = stmt
			.query_map(
				rusqlite::params![
					self.position.db_version,
					self.position.seq,
					self.page_size as i64
				],
				|row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, entry_from_row(row, 3)?)),
			)?
			.collect::<rusqlite::Result<Vec<_>>>()?;
		self.exhausted = rows.len() < self.page_size;
		self.page.extend(rows);
		Ok(())
	}

	fn materialize(
		&self,
		table: String,
		pk_bytes: Vec<u8>,
		column: String,
		entry: ClockEntry,
	) -> Result<ChangeRecord> {
		let value = match self.tables.get(&table) {
			Some(info) if column != SENTINEL => {
				info.read_cell(self.conn, &pk::decode(&pk_bytes)?, &column)?
			}
			_ => Value::Null,
		};
		let is_local_only = entry.site_id == self.local_site
			&& self.send_floor.is_none_or(|floor| entry.site_version > floor);
		Ok(ChangeRecord {
			table,
			pk: pk_bytes,
			column,
			value,
			column_version: entry.col_version,
			database_version: entry.db_version,
			seq: entry.seq,
			origin_site: entry.site_id,
			causal_length: entry.cl,
			is_local_only,
			tie_break_value: entry.site_version,
		})
	}

	/// Row-level records are implied by cell records while a row is in its
	/// first lifecycle; they are only surfaced when a cell record cannot
	/// carry the information.
	fn is_implied(&self, table: &str, column: &str, entry: &ClockEntry) -> bool {
		column == SENTINEL
			&& entry.cl == 1
			&& self.tables.get(table).is_some_and(|info| !info.is_pk_only())
	}

	fn is_seen(&self, entry: &ClockEntry) -> bool {
		self.unseen_by.as_ref().is_some_and(|cursor| {
			entry.site_version <= cursor.get(&entry.site_id).copied().unwrap_or(MIN_VERSION)
		})
	}
}

impl Iterator for ChangeStream<'_> {
	type Item = Result<ChangeRecord>;

	fn next(&mut self) -> Option<Self::Item> {
		loop {
			if self.page.is_empty() {
				if self.exhausted {
					return None;
				}
				if let Err(e) = self.fill() {
					self.exhausted = true;
					return Some(Err(e));
				}
				continue;
			}

			let (table, pk_bytes, column, entry) = self.page.pop_front()?;
			self.position = ChangeCursor {
				db_version: entry.db_version,
				seq: entry.seq,
			};
			if self.is_implied(&table, &column, &entry) || self.is_seen(&entry) {
				continue;
			}
			return Some(self.materialize(table, pk_bytes, column, entry));
		}
	}
}
