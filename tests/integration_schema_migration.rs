mod common;

use common::*;
use vanopticon_bifrost::codec::pk;
use vanopticon_bifrost::{Error, MIN_VERSION, Replica, SENTINEL, Value, sync};

#[cfg(feature = "integration-tests")]
mod integration_tests {
	use super::*;

	#[test]
	fn test_incompatible_tables_are_rejected() {
		let mut r = Replica::open_in_memory().unwrap();
		r.connection()
			.execute_batch(
				"CREATE TABLE nopk (v TEXT);
				CREATE TABLE strict_col (id INTEGER PRIMARY KEY, v TEXT NOT NULL);
				CREATE TABLE uniq (id INTEGER PRIMARY KEY, email TEXT UNIQUE);
				CREATE TABLE gen (id INTEGER PRIMARY KEY, v INTEGER, w INTEGER AS (v * 2));",
			)
			.unwrap();
		for table in ["nopk", "strict_col", "uniq", "gen", "crr_clock", "absent"] {
			assert!(
				matches!(r.track_table(table), Err(Error::Schema { .. })),
				"{} should be rejected",
				table
			);
		}
		assert_eq!(r.tables().names().count(), 0);
		assert_eq!(r.db_version(), MIN_VERSION);
	}

	#[test]
	fn test_untracked_writes_are_rejected() {
		let mut r = replica_with_foo();
		r.connection()
			.execute_batch("CREATE TABLE plain (id INTEGER PRIMARY KEY)")
			.unwrap();
		let mut tx = r.begin().unwrap();
		assert!(matches!(
			tx.insert("plain", &[("id", Value::Integer(1))]),
			Err(Error::InvalidWrite { .. })
		));
	}

	/// Rows written before tracking started are replicated like inserts.
	#[test]
	fn test_backfilled_rows_replicate() {
		let mut a = Replica::open_in_memory().unwrap();
		a.connection()
			.execute_batch(
				"CREATE TABLE foo (a INTEGER PRIMARY KEY, b, c);
				INSERT INTO foo VALUES (1, 'one', NULL), (2, 'two', 2);",
			)
			.unwrap();
		a.track_table("foo").unwrap();
		assert_eq!(a.db_version(), 1);

		let mut b = replica_with_foo();
		merge_all(&a, &mut b);
		assert_eq!(snapshot(&a), snapshot(&b));
		assert!(changes(&a).iter().all(|c| c.causal_length == 1 && c.column_version == 1));
	}

	/// Changing the key shape rebuilds the table's change log around the new
	/// keys.
	#[test]
	fn test_alter_primary_key_rebuilds_log() {
		let mut r = Replica::open_in_memory().unwrap();
		r.connection()
			.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, part TEXT DEFAULT 'x', v TEXT)")
			.unwrap();
		r.track_table("t").unwrap();
		let mut tx = r.begin().unwrap();
		tx.insert("t", &[("id", Value::Integer(1)), ("v", Value::from("a"))])
			.unwrap();
		tx.commit().unwrap();

		r.alter_table(
			"t",
			"CREATE TABLE t_new (id INTEGER, part TEXT DEFAULT 'x', v TEXT, PRIMARY KEY (id, part));
			INSERT INTO t_new SELECT id, part, v FROM t;
			DROP TABLE t;
			ALTER TABLE t_new RENAME TO t;",
		)
		.unwrap();

		assert_eq!(r.tables().get("t").unwrap().pks, vec!["id", "part"]);
		let records = changes(&r);
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].column, "v");
		assert_eq!(records[0].database_version, 2);
		assert_eq!(
			records[0].pk,
			pk::encode(&[Value::Integer(1), Value::from("x")]).unwrap()
		);

		let pre: i64 = r
			.connection()
			.query_row(
				"SELECT value FROM crr_master WHERE key = 'pre_compact_dbversion'",
				[],
				|row| row.get(0),
			)
			.unwrap();
		assert_eq!(pre, 1);
	}

	#[test]
	fn test_alter_requires_tracked_table() {
		let mut r = replica_with_foo();
		assert!(matches!(
			r.alter_table("nope", "ALTER TABLE nope ADD COLUMN x"),
			Err(Error::Schema { .. })
		));
	}

	/// Rows removed behind the log's back lose their cell entries on alter.
	#[test]
	fn test_alter_compacts_vanished_rows() {
		let mut r = replica_with_foo();
		put(&mut r, 1, "keep");
		put(&mut r, 2, "gone");
		r.connection().execute("DELETE FROM foo WHERE a = 2", []).unwrap();

		r.alter_table("foo", "ALTER TABLE foo ADD COLUMN d INTEGER").unwrap();
		let records = changes(&r);
		let keys: Vec<_> = records.iter().map(|c| c.pk.clone()).collect();
		let two = pk::encode(&[Value::Integer(2)]).unwrap();
		assert!(!keys.contains(&two));
		assert!(records.iter().any(|c| c.column == "d"));
	}

	fn clock_rows(replica: &Replica, a: i64) -> Vec<(String, i64)> {
		let key = pk::encode(&[Value::Integer(a)]).unwrap();
		let mut stmt = replica
			.connection()
			.prepare("SELECT cid, cl FROM crr_clock WHERE tbl = 'foo' AND pk = ?1 ORDER BY cid")
			.unwrap();
		stmt.query_map([key], |row| Ok((row.get(0)?, row.get(1)?)))
			.unwrap()
			.collect::<rusqlite::Result<Vec<_>>>()
			.unwrap()
	}

	/// A recorded delete survives alter compaction and still beats stale
	/// edits from a peer that never saw it.
	#[test]
	fn test_alter_keeps_delete_records() {
		let mut a = replica_with_foo();
		let mut b = replica_with_foo();
		put(&mut a, 1, "original");
		sync(&mut a, &mut b).unwrap();
		remove(&mut a, 1);
		assert_eq!(clock_rows(&a, 1), vec![(SENTINEL.to_string(), 2)]);

		a.alter_table("foo", "ALTER TABLE foo ADD COLUMN d INTEGER").unwrap();
		assert_eq!(clock_rows(&a, 1), vec![(SENTINEL.to_string(), 2)]);

		put(&mut b, 1, "edited on b");
		let report = sync(&mut b, &mut a).unwrap();
		assert_eq!(report.merge.rows_impacted, 0);
		assert_eq!(cell(&a, 1, "b"), None);
		assert_eq!(clock_rows(&a, 1), vec![(SENTINEL.to_string(), 2)]);

		sync(&mut a, &mut b).unwrap();
		assert_eq!(cell(&b, 1, "b"), None);
	}
}
