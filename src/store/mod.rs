//! Replicas: an SQLite database whose tracked tables carry a change log.

pub mod migrations;
pub mod pragmas;
pub mod schema;
pub mod tx;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use rusqlite::{Connection, TransactionBehavior};

use crate::clock::{
	ChangeCursor, ChangeRecord, ChangeStream, MIN_VERSION, PeerEvent, SENTINEL, SiteCursor, SiteId,
	SiteVersion, TrackedPeer, VersionClock, change_log, peers, site, site_versions,
};
use crate::codec::pk;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::observability::MetricsRegistry;
use crate::sync::merge::{self, MergeReport};

pub use schema::{TableInfo, TrackedTables};
pub use tx::Tx;

/// Connection-level options for a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaOptions {
	pub busy_timeout: Duration,
	pub page_size: usize,
	pub wal: bool,
}

impl Default for ReplicaOptions {
	fn default() -> Self {
		Self {
			busy_timeout: Duration::from_millis(5000),
			page_size: 512,
			wal: true,
		}
	}
}

impl From<&Settings> for ReplicaOptions {
	fn from(s: &Settings) -> Self {
		Self {
			busy_timeout: Duration::from_millis(s.busy_timeout_ms),
			page_size: s.changes_page_size,
			wal: s.journal_wal,
		}
	}
}

/// One site: a database, its identity, its version clock and its tracked
/// tables.
pub struct Replica {
	conn: Connection,
	site_id: SiteId,
	clock: VersionClock,
	tables: TrackedTables,
	page_size: usize,
	metrics: Option<Arc<MetricsRegistry>>,
}

impl Replica {
	pub fn open(path: impl AsRef<Path>) -> Result<Self> {
		Self::open_with(path, &ReplicaOptions::default())
	}

	pub fn open_with(path: impl AsRef<Path>, options: &ReplicaOptions) -> Result<Self> {
		let conn = Connection::open(path.as_ref())?;
		Self::from_connection(conn, options, true)
	}

	pub fn open_in_memory() -> Result<Self> {
		let conn = Connection::open_in_memory()?;
		Self::from_connection(conn, &ReplicaOptions::default(), false)
	}

	pub fn open_with_settings(settings: &Settings) -> Result<Self> {
		Self::open_with(&settings.database, &ReplicaOptions::from(settings))
	}

	fn from_connection(mut conn: Connection, options: &ReplicaOptions, on_disk: bool) -> Result<Self> {
		pragmas::apply(&conn, options, on_disk)?;
		migrations::apply(&mut conn)?;
		let site_id = site::load_or_create(&conn)?;
		let clock = VersionClock::load(&conn, &site_id)?;
		let tables = TrackedTables::load(&conn)?;
		info!(
			"opened replica {} at db_version {} ({} tracked tables)",
			site_id,
			clock.db_version(),
			tables.names().count()
		);
		Ok(Self {
			conn,
			site_id,
			clock,
			tables,
			page_size: options.page_size,
			metrics: None,
		})
	}

	/// Report commits, merges and versions into `metrics`.
	pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
		metrics.db_version.set(self.clock.db_version());
		self.metrics = Some(metrics);
		self
	}

	/// Direct access for reads and schema setup. Writes to tracked tables
	/// through this handle are not recorded; use [`Replica::begin`].
	pub fn connection(&self) -> &Connection {
		&self.conn
	}

	pub fn site_id(&self) -> SiteId {
		self.site_id
	}

	/// Current database version.
	pub fn db_version(&self) -> i64 {
		self.clock.db_version()
	}

	/// Number of committed transactions authored at this site.
	pub fn site_version(&self) -> i64 {
		self.clock.site_version()
	}

	pub fn tables(&self) -> &TrackedTables {
		&self.tables
	}

	/// Begin a write transaction.
	pub fn begin(&mut self) -> Result<Tx<'_>> {
		let txn = self
			.conn
			.transaction_with_behavior(TransactionBehavior::Immediate)?;
		Ok(Tx::new(
			txn,
			self.site_id,
			&mut self.clock,
			&self.tables,
			self.metrics.as_deref(),
		))
	}

	/// Start tracking `table`. Rows already present are recorded as inserts
	/// stamped with one new database version. Tracking a tracked table is a
	/// no-op.
	pub fn track_table(&mut self, table: &str) -> Result<()> {
		if self.tables.contains(table) {
			return Ok(());
		}
		let info = TableInfo::introspect(&self.conn, table)?;

		let mut tx = self.begin()?;
		tx.execute(
			"INSERT OR IGNORE INTO crr_tracked_tables (name) VALUES (?1)",
			[table],
		)?;
		let backfilled = backfill(&mut tx, &info)?;
		tx.commit()?;

		info!("tracking table '{}' ({} existing rows backfilled)", table, backfilled);
		self.tables.insert(info);
		Ok(())
	}

	/// Run `ddl` against a tracked table, then bring its change log in line
	/// with the new shape.
	///
	/// Entries for dropped columns and vanished rows are compacted away. A
	/// changed primary key invalidates every row identity, so the table's
	/// log is rebuilt from scratch. New columns and rows are backfilled.
	pub fn alter_table(&mut self, table: &str, ddl: &str) -> Result<()> {
		let previous = self
			.tables
			.get(table)
			.cloned()
			.ok_or_else(|| Error::schema(table, "table is not tracked"))?;

		let mut tx = self.begin()?;
		let before = tx.db_version();
		tx.connection().execute_batch(ddl)?;
		let info = TableInfo::introspect(tx.connection(), table)?;

		if info.pks != previous.pks {
			tx.execute("DELETE FROM crr_clock WHERE tbl = ?1", [table])?;
		} else {
			compact(&tx, &info)?;
		}
		let backfilled = backfill(&mut tx, &info)?;
		tx.execute(
			"INSERT INTO crr_master (key, value) VALUES ('pre_compact_dbversion', ?1)
			ON CONFLICT (key) DO UPDATE SET value = excluded.value",
			[before],
		)?;
		tx.commit()?;

		info!("altered table '{}' ({} rows backfilled)", table, backfilled);
		self.tables.insert(info);
		Ok(())
	}

	/// Merge a batch of change records atomically.
	pub fn merge(&mut self, records: &[ChangeRecord]) -> Result<MergeReport> {
		let metrics = self.metrics.clone();
		let mut tx = self.begin()?;
		let mut report = match tx.merge(records) {
			Ok(report) => report,
			Err(e) => {
				drop(tx);
				merge::note_failure(&e, metrics.as_deref());
				return Err(e);
			}
		};
		if let Some(version) = tx.commit()? {
			report.db_version = version;
		}
		Ok(report)
	}

	/// Records with `database_version > since`, in `(database_version, seq)`
	/// order.
	pub fn changes_since(&self, since: i64) -> Result<ChangeStream<'_>> {
		self.changes_from(ChangeCursor::after_version(since))
	}

	/// Resume a change stream after `cursor`.
	pub fn changes_from(&self, cursor: ChangeCursor) -> Result<ChangeStream<'_>> {
		ChangeStream::new(&self.conn, &self.tables, self.site_id, cursor, self.page_size)
	}

	/// Records a peer holding site version cursor `cursor` has not seen.
	pub fn changes_for_sites(&self, cursor: &SiteCursor) -> Result<ChangeStream<'_>> {
		Ok(self
			.changes_from(ChangeCursor::after_version(MIN_VERSION))?
			.unseen_by(cursor.clone()))
	}

	pub fn site_versions(&self) -> Result<Vec<SiteVersion>> {
		site_versions::all(&self.conn)
	}

	pub fn site_cursor(&self) -> Result<SiteCursor> {
		site_versions::cursor(&self.conn)
	}

	pub fn last_seen(&self, site: &SiteId) -> Result<i64> {
		site_versions::last_seen(&self.conn, site)
	}

	pub fn tracked_peers(&self) -> Result<Vec<TrackedPeer>> {
		peers::all(&self.conn)
	}

	pub fn peer_cursor(&self, site: &SiteId, event: PeerEvent) -> Result<Option<i64>> {
		peers::get(&self.conn, site, event)
	}

	/// Advance the cursor recorded for a peer.
	pub fn note_peer(&mut self, site: &SiteId, event: PeerEvent, version: i64) -> Result<()> {
		peers::advance(&self.conn, site, event, version)
	}

	pub fn metrics(&self) -> Option<&Arc<MetricsRegistry>> {
		self.metrics.as_ref()
	}
}

/// Record rows of `info` that have no lifecycle entry yet as inserts, and
/// fill in missing cells of live rows. Returns the number of rows inserted.
fn backfill(tx: &mut Tx<'_>, info: &TableInfo) -> Result<usize> {
	let mut inserted = 0;
	for key in info.all_keys(tx.connection())? {
		let pk_bytes = pk::encode(&key)?;
		let cl = change_log::row_causal_length(tx.connection(), &info.name, &pk_bytes)?;
		if cl % 2 == 0 {
			tx.record_insert(info, &pk_bytes, cl)?;
			inserted += 1;
			continue;
		}
		for column in &info.columns {
			let known =
				change_log::get_entry(tx.connection(), &info.name, &pk_bytes, column)?.is_some();
			if !known {
				tx.record_column(&info.name, &pk_bytes, column, cl)?;
			}
		}
	}
	Ok(inserted)
}

/// Drop entries for columns that no longer exist and the cell entries of
/// rows that are gone. A vanished row keeps its lifecycle entry when that
/// entry records a delete; otherwise the whole row is dropped.
fn compact(tx: &Tx<'_>, info: &TableInfo) -> Result<()> {
	let conn = tx.connection();
	let mut stmt = conn.prepare("SELECT DISTINCT cid FROM crr_clock WHERE tbl = ?1")?;
	let columns = stmt
		.query_map([&info.name], |row| row.get::<_, String>(0))?
		.collect::<rusqlite::Result<Vec<_>>>()?;
	for column in columns {
		if column != SENTINEL && !info.has_column(&column) {
			conn.execute(
				"DELETE FROM crr_clock WHERE tbl = ?1 AND cid = ?2",
				rusqlite::params![info.name, column],
			)?;
		}
	}

	let mut stmt = conn.prepare("SELECT DISTINCT pk FROM crr_clock WHERE tbl = ?1")?;
	let keys = stmt
		.query_map([&info.name], |row| row.get::<_, Vec<u8>>(0))?
		.collect::<rusqlite::Result<Vec<_>>>()?;
	for pk_bytes in keys {
		let key = pk::decode(&pk_bytes)?;
		if info.row_exists(conn, &key)? {
			continue;
		}
		let cl = change_log::row_causal_length(conn, &info.name, &pk_bytes)?;
		if cl % 2 == 0 {
			change_log::drop_cells(conn, &info.name, &pk_bytes)?;
		} else {
			conn.execute(
				"DELETE FROM crr_clock WHERE tbl = ?1 AND pk = ?2",
				rusqlite::params![info.name, pk_bytes],
			)?;
		}
	}
	Ok(())
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::codec::Value;

	#[test]
	fn test_fresh_replica_baseline() {
		let r = Replica::open_in_memory().unwrap();
		assert_eq!(r.db_version(), MIN_VERSION);
		assert_eq!(r.site_version(), MIN_VERSION);
		assert!(r.site_versions().unwrap().is_empty());
		assert_eq!(r.changes_since(MIN_VERSION).unwrap().count(), 0);
	}

	#[test]
	fn test_track_backfills_existing_rows() {
		let mut r = Replica::open_in_memory().unwrap();
		r.connection()
			.execute_batch(
				"CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);
				INSERT INTO t VALUES (1, 'one'), (2, 'two');",
			)
			.unwrap();
		r.track_table("t").unwrap();
		r.track_table("t").unwrap();

		assert_eq!(r.db_version(), 1);
		let changes: Vec<_> = r
			.changes_since(MIN_VERSION)
			.unwrap()
			.collect::<Result<Vec<_>>>()
			.unwrap();
		assert_eq!(changes.len(), 2);
		assert_eq!(changes[0].value, Value::from("one"));
		assert_eq!(changes[1].value, Value::from("two"));
		assert!(changes.iter().all(|c| c.database_version == 1));
	}

	#[test]
	fn test_track_rejects_without_side_effects() {
		let mut r = Replica::open_in_memory().unwrap();
		r.connection().execute_batch("CREATE TABLE bare (v TEXT)").unwrap();
		assert!(matches!(r.track_table("bare"), Err(Error::Schema { .. })));
		assert!(!r.tables().contains("bare"));
		assert_eq!(r.db_version(), MIN_VERSION);
	}

	#[test]
	fn test_alter_compacts_and_backfills() {
		let mut r = Replica::open_in_memory().unwrap();
		r.connection()
			.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, old TEXT, keep TEXT)")
			.unwrap();
		r.track_table("t").unwrap();
		let mut tx = r.begin().unwrap();
		tx.insert("t", &[("id", Value::Integer(1)), ("old", Value::from("x"))])
			.unwrap();
		tx.commit().unwrap();

		r.alter_table(
			"t",
			"ALTER TABLE t DROP COLUMN old; ALTER TABLE t ADD COLUMN fresh INTEGER DEFAULT 7;",
		)
		.unwrap();

		let changes: Vec<_> = r
			.changes_since(MIN_VERSION)
			.unwrap()
			.collect::<Result<Vec<_>>>()
			.unwrap();
		let columns: Vec<&str> = changes.iter().map(|c| c.column.as_str()).collect();
		assert_eq!(columns, vec!["keep", "fresh"]);
		assert_eq!(changes[1].value, Value::Integer(7));
		assert_eq!(changes[1].database_version, 2);
		assert!(r.tables().get("t").unwrap().has_column("fresh"));
	}
}
