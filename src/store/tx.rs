use rusqlite::{Connection, Transaction, params_from_iter};

use crate::clock::change_log::{self, ClockEntry};
use crate::clock::version::{Author, CellKey, TxClock};
use crate::clock::{SENTINEL, SiteId, VersionClock, site_versions, version};
use crate::codec::{Value, pk};
use crate::error::{Error, Result};
use crate::observability::MetricsRegistry;
use crate::store::schema::{TableInfo, TrackedTables, quote};
use crate::sync::merge::{self, MergeReport, Rank};

/// A write transaction against a replica.
///
/// Tracked writes made through a `Tx` are recorded in the change log and
/// share one database version. Dropping a `Tx` without calling
/// [`Tx::commit`] rolls everything back, including the pending versions.
pub struct Tx<'r> {
	txn: Transaction<'r>,
	site_id: SiteId,
	clock: &'r mut VersionClock,
	tables: &'r TrackedTables,
	pending: TxClock,
	metrics: Option<&'r MetricsRegistry>,
	outcome: RollbackCounter<'r>,
}

/// Counts the transaction as rolled back unless a commit succeeded.
struct RollbackCounter<'r> {
	metrics: Option<&'r MetricsRegistry>,
	committed: bool,
}

impl Drop for RollbackCounter<'_> {
	fn drop(&mut self) {
		if self.committed {
			return;
		}
		if let Some(m) = self.metrics {
			m.rollbacks_total.inc();
		}
	}
}

impl<'r> Tx<'r> {
	pub(crate) fn new(
		txn: Transaction<'r>,
		site_id: SiteId,
		clock: &'r mut VersionClock,
		tables: &'r TrackedTables,
		metrics: Option<&'r MetricsRegistry>,
	) -> Self {
		let pending = clock.begin();
		Self {
			txn,
			site_id,
			clock,
			tables,
			pending,
			metrics,
			outcome: RollbackCounter {
				metrics,
				committed: false,
			},
		}
	}

	/// Read access to the underlying connection, inside the transaction.
	pub fn connection(&self) -> &Connection {
		&self.txn
	}

	/// Run raw SQL. Writes to tracked tables made this way must be reported
	/// with [`Tx::record`] or [`Tx::record_delete`].
	pub fn execute<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<usize> {
		Ok(self.txn.execute(sql, params)?)
	}

	/// Database version the transaction will commit with, or the current one
	/// while nothing has been written.
	pub fn db_version(&self) -> i64 {
		self.pending.current_db_version()
	}

	pub fn site_id(&self) -> SiteId {
		self.site_id
	}

	/// Insert a row and record every column of it.
	pub fn insert(&mut self, table: &str, values: &[(&str, Value)]) -> Result<()> {
		let info = self.table(table)?;
		for (column, _) in values {
			if !info.is_pk(column) && !info.has_column(column) {
				return Err(Error::invalid_write(table, format!("unknown column '{}'", column)));
			}
		}
		let key = info
			.pks
			.iter()
			.map(|pk| {
				values
					.iter()
					.find(|(c, _)| *c == pk.as_str())
					.map(|(_, v)| v.clone())
					.ok_or_else(|| {
						Error::invalid_write(table, format!("missing primary key column '{}'", pk))
					})
			})
			.collect::<Result<Vec<_>>>()?;

		let columns = values.iter().map(|(c, _)| quote(c)).collect::<Vec<_>>();
		let slots = (1..=values.len()).map(|i| format!("?{}", i)).collect::<Vec<_>>();
		let sql = format!(
			"INSERT INTO {} ({}) VALUES ({})",
			quote(table),
			columns.join(", "),
			slots.join(", ")
		);
		self.txn
			.execute(&sql, params_from_iter(values.iter().map(|(_, v)| v)))?;

		let pk_bytes = pk::encode(&key)?;
		let cl = change_log::row_causal_length(&self.txn, table, &pk_bytes)?;
		self.record_insert(info, &pk_bytes, cl)
	}

	/// Update non-key columns of a row. Returns `false` when the row does
	/// not exist.
	pub fn update(&mut self, table: &str, key: &[Value], values: &[(&str, Value)]) -> Result<bool> {
		let info = self.table(table)?;
		check_key(info, key)?;
		if values.is_empty() {
			return Ok(false);
		}
		for (column, _) in values {
			if info.is_pk(column) {
				return Err(Error::invalid_write(
					table,
					format!("primary key column '{}' cannot be updated; delete and insert instead", column),
				));
			}
			if !info.has_column(column) {
				return Err(Error::invalid_write(table, format!("unknown column '{}'", column)));
			}
		}

		let assignments = values
			.iter()
			.enumerate()
			.map(|(i, (c, _))| format!("{} = ?{}", quote(c), i + 1))
			.collect::<Vec<_>>();
		let sql = format!(
			"UPDATE {} SET {} WHERE {}",
			quote(table),
			assignments.join(", "),
			info.pk_predicate(values.len() + 1)
		);
		let params = values.iter().map(|(_, v)| v).chain(key.iter());
		let changed = self.txn.execute(&sql, params_from_iter(params))?;
		if changed == 0 {
			return Ok(false);
		}

		let pk_bytes = pk::encode(key)?;
		for (column, _) in values {
			self.record_cell(info, &pk_bytes, column)?;
		}
		Ok(true)
	}

	/// Delete a row. Returns `false` when the row does not exist.
	pub fn delete(&mut self, table: &str, key: &[Value]) -> Result<bool> {
		let info = self.table(table)?;
		check_key(info, key)?;
		let sql = format!("DELETE FROM {} WHERE {}", quote(table), info.pk_predicate(1));
		let changed = self.txn.execute(&sql, params_from_iter(key))?;
		if changed == 0 {
			return Ok(false);
		}
		self.record_delete(table, key)?;
		Ok(true)
	}

	/// Report a write to one column of a row. Passing [`SENTINEL`] as the
	/// column reports an insert of the whole row.
	pub fn record(&mut self, table: &str, key: &[Value], column: &str) -> Result<()> {
		let info = self.table(table)?;
		check_key(info, key)?;
		let pk_bytes = pk::encode(key)?;
		if column == SENTINEL {
			let cl = change_log::row_causal_length(&self.txn, table, &pk_bytes)?;
			if cl % 2 == 1 {
				return Ok(());
			}
			return self.record_insert(info, &pk_bytes, cl);
		}
		if !info.has_column(column) {
			return Err(Error::invalid_write(table, format!("unknown column '{}'", column)));
		}
		self.record_cell(info, &pk_bytes, column)
	}

	/// Report that a row was deleted.
	pub fn record_delete(&mut self, table: &str, key: &[Value]) -> Result<()> {
		let info = self.table(table)?;
		check_key(info, key)?;
		let pk_bytes = pk::encode(key)?;
		let cl = match change_log::row_causal_length(&self.txn, table, &pk_bytes)? {
			0 => 2,
			cl if cl % 2 == 1 => cl + 1,
			_ => return Ok(()),
		};
		self.drop_cells(table, &pk_bytes)?;
		self.stamp_local(table, &pk_bytes, SENTINEL, cl, cl)
	}

	/// Merge change records from another replica into this transaction.
	pub fn merge(&mut self, records: &[crate::clock::ChangeRecord]) -> Result<MergeReport> {
		merge::merge_batch(self, records)
	}

	/// Commit the transaction and publish its versions.
	///
	/// Returns the database version the transaction committed with, or
	/// `None` when it made no tracked write.
	pub fn commit(self) -> Result<Option<i64>> {
		let Tx {
			txn,
			site_id,
			clock,
			pending,
			metrics,
			mut outcome,
			..
		} = self;

		let committed = pending.finish();
		if let Some(c) = &committed {
			change_log::compact_seq(&txn, c.db_version)?;
			version::persist(&txn, c.db_version)?;
			if let Some(site_version) = c.site_version {
				site_versions::record_seen(&txn, &site_id, site_version)?;
			}
		}
		txn.commit()?;
		outcome.committed = true;

		if let Some(m) = metrics {
			m.commits_total.inc();
		}
		Ok(committed.map(|c| {
			clock.apply(c);
			if let Some(m) = metrics {
				m.db_version.set(c.db_version);
			}
			log::debug!("committed db_version {}", c.db_version);
			c.db_version
		}))
	}

	/// Roll back every write of the transaction.
	pub fn rollback(self) -> Result<()> {
		Ok(self.txn.rollback()?)
	}

	pub(crate) fn tables(&self) -> &'r TrackedTables {
		self.tables
	}

	fn table(&self, name: &str) -> Result<&'r TableInfo> {
		let tables: &'r TrackedTables = self.tables;
		tables
			.get(name)
			.ok_or_else(|| Error::invalid_write(name, "table is not tracked"))
	}

	/// Record an insert (or resurrection) of a row whose previous causal
	/// length is `prev_cl`: every column, plus a new lifecycle when the row
	/// was deleted. A row the log still holds as alive keeps its lifecycle.
	pub(crate) fn record_insert(&mut self, info: &TableInfo, pk_bytes: &[u8], prev_cl: i64) -> Result<()> {
		let cl = if prev_cl % 2 == 1 { prev_cl } else { prev_cl + 1 };
		if cl != prev_cl {
			self.stamp_local(&info.name, pk_bytes, SENTINEL, cl, cl)?;
		}
		for column in &info.columns {
			self.record_column(&info.name, pk_bytes, column, cl)?;
		}
		Ok(())
	}

	fn record_cell(&mut self, info: &TableInfo, pk_bytes: &[u8], column: &str) -> Result<()> {
		let cl = change_log::row_causal_length(&self.txn, &info.name, pk_bytes)?;
		if cl % 2 == 0 {
			return self.record_insert(info, pk_bytes, cl);
		}
		self.record_column(&info.name, pk_bytes, column, cl)
	}

	/// Stamp one column as written locally within lifecycle `cl`. Repeated
	/// local writes in one transaction collapse into the first.
	pub(crate) fn record_column(&mut self, table: &str, pk_bytes: &[u8], column: &str, cl: i64) -> Result<()> {
		let key: CellKey = (table.to_string(), pk_bytes.to_vec(), column.to_string());
		if self.pending.written_locally(&key) {
			return Ok(());
		}
		let col_version = match change_log::get_entry(&self.txn, table, pk_bytes, column)? {
			Some(prev) if prev.cl == cl => prev.col_version + 1,
			_ => 1,
		};
		self.stamp_local(table, pk_bytes, column, col_version, cl)
	}

	fn stamp_local(
		&mut self,
		table: &str,
		pk_bytes: &[u8],
		column: &str,
		col_version: i64,
		cl: i64,
	) -> Result<()> {
		let key: CellKey = (table.to_string(), pk_bytes.to_vec(), column.to_string());
		let seq = self.pending.stamp(key, Author::Local);
		let entry = ClockEntry {
			col_version,
			db_version: self.pending.db_version(),
			seq,
			site_id: self.site_id,
			cl,
			site_version: self.pending.site_version(),
		};
		change_log::put_entry(&self.txn, table, pk_bytes, column, &entry)?;
		if let Some(m) = self.metrics {
			m.changes_recorded_total.inc();
		}
		Ok(())
	}

	/// Stamp a cell with the metadata of a winning remote record.
	pub(crate) fn stamp_merged(&mut self, table: &str, pk_bytes: &[u8], column: &str, rank: &Rank) -> Result<()> {
		let key: CellKey = (table.to_string(), pk_bytes.to_vec(), column.to_string());
		let seq = self.pending.stamp(key, Author::Merge);
		let entry = ClockEntry {
			col_version: rank.column_version,
			db_version: self.pending.db_version(),
			seq,
			site_id: rank.origin_site,
			cl: rank.causal_length,
			site_version: rank.tie_break,
		};
		change_log::put_entry(&self.txn, table, pk_bytes, column, &entry)
	}

	/// Drop the cell entries of a row, in storage and in the pending clock.
	pub(crate) fn drop_cells(&mut self, table: &str, pk_bytes: &[u8]) -> Result<()> {
		change_log::drop_cells(&self.txn, table, pk_bytes)?;
		self.pending.forget_cells(table, pk_bytes, SENTINEL);
		Ok(())
	}

	pub(crate) fn metrics(&self) -> Option<&'r MetricsRegistry> {
		self.metrics
	}
}

fn check_key(info: &TableInfo, key: &[Value]) -> Result<()> {
	if key.len() != info.pks.len() {
		return Err(Error::invalid_write(
			&info.name,
			format!("expected {} primary key values, got {}", info.pks.len(), key.len()),
		));
	}
	Ok(())
}

#[cfg(feature = "unit-tests")]
mod tests {
	use crate::clock::{ChangeCursor, MIN_VERSION, SENTINEL};
	use crate::codec::{Value, pk};
	use crate::store::Replica;

	fn replica() -> Replica {
		let mut replica = Replica::open_in_memory().unwrap();
		replica
			.connection()
			.execute_batch("CREATE TABLE foo (a INTEGER PRIMARY KEY, b, c)")
			.unwrap();
		replica.track_table("foo").unwrap();
		replica
	}

	fn all_changes(replica: &Replica) -> Vec<crate::clock::ChangeRecord> {
		replica
			.changes_since(MIN_VERSION)
			.unwrap()
			.collect::<crate::error::Result<Vec<_>>>()
			.unwrap()
	}

	#[test]
	fn test_insert_records_every_column() {
		let mut r = replica();
		let mut tx = r.begin().unwrap();
		tx.insert("foo", &[("a", Value::Integer(1)), ("b", Value::from("x"))])
			.unwrap();
		assert_eq!(tx.commit().unwrap(), Some(1));

		let changes = all_changes(&r);
		let columns: Vec<&str> = changes.iter().map(|c| c.column.as_str()).collect();
		assert_eq!(columns, vec!["b", "c"]);
		assert!(changes.iter().all(|c| c.database_version == 1));
		assert!(changes.iter().all(|c| c.causal_length == 1 && c.column_version == 1));
		assert_eq!(changes[0].value, Value::from("x"));
		assert_eq!(changes[1].value, Value::Null);
	}

	#[test]
	fn test_writes_to_one_cell_collapse() {
		let mut r = replica();
		let mut tx = r.begin().unwrap();
		tx.insert("foo", &[("a", Value::Integer(1))]).unwrap();
		tx.commit().unwrap();

		let mut tx = r.begin().unwrap();
		let key = [Value::Integer(1)];
		tx.update("foo", &key, &[("b", Value::Integer(1))]).unwrap();
		tx.update("foo", &key, &[("c", Value::Integer(1))]).unwrap();
		tx.update("foo", &key, &[("b", Value::Integer(2))]).unwrap();
		tx.commit().unwrap();

		let changes: Vec<_> = r
			.changes_since(1)
			.unwrap()
			.collect::<crate::error::Result<Vec<_>>>()
			.unwrap();
		assert_eq!(changes.len(), 2);
		assert_eq!(changes[0].column, "b");
		assert_eq!(changes[0].column_version, 2);
		assert_eq!(changes[0].value, Value::Integer(2));
		assert_eq!(changes[0].seq, 0);
		assert_eq!(changes[1].column, "c");
		assert_eq!(changes[1].seq, 1);
	}

	#[test]
	fn test_delete_keeps_only_lifecycle_record() {
		let mut r = replica();
		let mut tx = r.begin().unwrap();
		tx.insert("foo", &[("a", Value::Integer(1)), ("b", Value::Integer(5))])
			.unwrap();
		tx.commit().unwrap();

		let mut tx = r.begin().unwrap();
		assert!(tx.delete("foo", &[Value::Integer(1)]).unwrap());
		assert!(!tx.delete("foo", &[Value::Integer(1)]).unwrap());
		tx.commit().unwrap();

		let changes = all_changes(&r);
		assert_eq!(changes.len(), 1);
		assert_eq!(changes[0].column, SENTINEL);
		assert_eq!(changes[0].causal_length, 2);
		assert!(changes[0].is_delete());
		assert_eq!(changes[0].pk, pk::encode(&[Value::Integer(1)]).unwrap());
	}

	#[test]
	fn test_reinsert_starts_new_lifecycle() {
		let mut r = replica();
		for _ in 0..2 {
			let mut tx = r.begin().unwrap();
			tx.insert("foo", &[("a", Value::Integer(1)), ("b", Value::Integer(5))])
				.unwrap();
			tx.delete("foo", &[Value::Integer(1)]).unwrap();
			tx.commit().unwrap();
		}
		let mut tx = r.begin().unwrap();
		tx.insert("foo", &[("a", Value::Integer(1)), ("b", Value::Integer(6))])
			.unwrap();
		tx.commit().unwrap();

		let changes = all_changes(&r);
		let sentinel = changes.iter().find(|c| c.is_sentinel()).unwrap();
		assert_eq!(sentinel.causal_length, 5);
		let b = changes.iter().find(|c| c.column == "b").unwrap();
		assert_eq!((b.causal_length, b.column_version), (5, 1));
		assert_eq!(r.db_version(), 3);
	}

	#[test]
	fn test_reinsert_after_unrecorded_delete_keeps_lifecycle() {
		let mut r = replica();
		let mut tx = r.begin().unwrap();
		tx.insert("foo", &[("a", Value::Integer(1)), ("b", Value::from("v"))])
			.unwrap();
		tx.commit().unwrap();
		r.connection().execute("DELETE FROM foo WHERE a = 1", []).unwrap();

		let mut tx = r.begin().unwrap();
		tx.insert("foo", &[("a", Value::Integer(1)), ("b", Value::from("again"))])
			.unwrap();
		assert_eq!(tx.commit().unwrap(), Some(2));

		let changes = all_changes(&r);
		assert!(changes.iter().all(|c| c.causal_length == 1));
		let b = changes.iter().find(|c| c.column == "b").unwrap();
		assert_eq!((b.column_version, b.database_version), (2, 2));
		assert_eq!(b.value, Value::from("again"));

		let mut other = replica();
		let report = other.merge(&changes).unwrap();
		assert_eq!(report.rows_impacted, 1);
	}

	#[test]
	fn test_rejects_invalid_writes() {
		let mut r = replica();
		let mut tx = r.begin().unwrap();
		assert!(tx.insert("bar", &[("a", Value::Integer(1))]).is_err());
		assert!(tx.insert("foo", &[("b", Value::Integer(1))]).is_err());
		assert!(tx.insert("foo", &[("a", Value::Integer(1)), ("zz", Value::Null)]).is_err());
		assert!(
			tx.update("foo", &[Value::Integer(1)], &[("a", Value::Integer(2))])
				.is_err()
		);
		assert!(tx.record("foo", &[], "b").is_err());
		tx.rollback().unwrap();
		assert_eq!(r.db_version(), MIN_VERSION);
	}

	#[test]
	fn test_raw_writes_reported_through_hook() {
		let mut r = replica();
		let mut tx = r.begin().unwrap();
		tx.execute("INSERT INTO foo (a, b) VALUES (7, 'raw')", []).unwrap();
		tx.record("foo", &[Value::Integer(7)], SENTINEL).unwrap();
		tx.execute("UPDATE foo SET c = 3 WHERE a = 7", []).unwrap();
		tx.record("foo", &[Value::Integer(7)], "c").unwrap();
		tx.commit().unwrap();

		let changes = all_changes(&r);
		let c = changes.iter().find(|c| c.column == "c").unwrap();
		assert_eq!(c.value, Value::Integer(3));
		assert_eq!(c.column_version, 1);
		assert_eq!(r.changes_from(ChangeCursor::after_version(1)).unwrap().count(), 0);
	}
}
