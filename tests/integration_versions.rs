mod common;

use common::*;
use vanopticon_bifrost::{ChangeCursor, MIN_VERSION, Replica, ReplicaOptions, SENTINEL, Value};

#[cfg(feature = "integration-tests")]
mod integration_tests {
	use super::*;

	/// Transactions without tracked writes and rolled back transactions
	/// leave no gap in the database version.
	#[test]
	fn test_versions_have_no_holes() {
		let mut r = replica_with_foo();

		let tx = r.begin().unwrap();
		assert_eq!(tx.commit().unwrap(), None);

		let mut tx = r.begin().unwrap();
		tx.insert("foo", &[("a", Value::Integer(1))]).unwrap();
		assert_eq!(tx.db_version(), 1);
		tx.rollback().unwrap();
		assert_eq!(r.db_version(), MIN_VERSION);

		let mut tx = r.begin().unwrap();
		tx.insert("foo", &[("a", Value::Integer(1))]).unwrap();
		drop(tx);
		assert_eq!(r.db_version(), MIN_VERSION);
		assert!(snapshot(&r).is_empty());

		put(&mut r, 1, "x");
		put(&mut r, 2, "y");
		assert_eq!(r.db_version(), 2);
		assert_eq!(r.site_version(), 2);
		let versions: Vec<i64> = changes(&r).iter().map(|c| c.database_version).collect();
		assert_eq!(versions, vec![1, 1, 2, 2]);
	}

	/// Every write of one transaction shares a version; sequence numbers
	/// follow write order.
	#[test]
	fn test_one_version_per_transaction() {
		let mut r = replica_with_foo();
		let mut tx = r.begin().unwrap();
		for a in 1..=3 {
			tx.insert("foo", &[("a", Value::Integer(a)), ("b", Value::Integer(a * 10))])
				.unwrap();
		}
		tx.delete("foo", &[Value::Integer(2)]).unwrap();
		assert_eq!(tx.commit().unwrap(), Some(1));

		let records = changes(&r);
		assert!(records.iter().all(|c| c.database_version == 1));
		assert!(records.windows(2).all(|w| w[0].seq < w[1].seq));
		let deleted = records.iter().find(|c| c.column == SENTINEL).unwrap();
		assert_eq!(deleted.causal_length, 2);
		assert_eq!(records.len(), 5);
	}

	/// Clock state survives closing and reopening the database.
	#[test]
	fn test_reopen_restores_clock() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("replica.db");

		let (site, before) = {
			let mut r = Replica::open(&path).unwrap();
			r.connection()
				.execute_batch("CREATE TABLE foo (a INTEGER PRIMARY KEY, b, c)")
				.unwrap();
			r.track_table("foo").unwrap();
			put(&mut r, 1, "x");
			put(&mut r, 1, "y");
			(r.site_id(), (changes(&r), r.site_versions().unwrap()))
		};
		let (before, site_versions) = before;

		let mut r = Replica::open(&path).unwrap();
		assert_eq!(r.site_id(), site);
		assert_eq!(r.db_version(), 2);
		assert_eq!(r.site_version(), 2);
		assert!(r.tables().contains("foo"));
		assert_eq!(changes(&r), before);
		assert_eq!(r.site_versions().unwrap(), site_versions);

		put(&mut r, 1, "z");
		assert_eq!(r.db_version(), 3);
		let b = changes(&r).into_iter().find(|c| c.column == "b").unwrap();
		assert_eq!((b.column_version, b.tie_break_value), (3, 3));
	}

	#[test]
	fn test_options_apply_to_file_replicas() {
		let dir = tempfile::tempdir().unwrap();
		let options = ReplicaOptions {
			page_size: 1,
			..ReplicaOptions::default()
		};
		let mut r = Replica::open_with(dir.path().join("paged.db"), &options).unwrap();
		let mode: String = r
			.connection()
			.query_row("PRAGMA journal_mode", [], |row| row.get(0))
			.unwrap();
		assert_eq!(mode.to_lowercase(), "wal");

		r.connection()
			.execute_batch("CREATE TABLE foo (a INTEGER PRIMARY KEY, b, c)")
			.unwrap();
		r.track_table("foo").unwrap();
		for a in 0..4 {
			put(&mut r, a, a);
		}
		// One row per page still yields every record.
		assert_eq!(changes(&r).len(), 8);
	}

	/// A change stream can be resumed from the position it stopped at.
	#[test]
	fn test_resume_from_position() {
		let mut r = replica_with_foo();
		for a in 0..5 {
			put(&mut r, a, "v");
		}
		let mut stream = r.changes_since(MIN_VERSION).unwrap();
		let head: Vec<_> = stream.by_ref().take(3).collect::<Result<_, _>>().unwrap();
		let position = stream.position();
		drop(stream);

		let tail: Vec<_> = r
			.changes_from(position)
			.unwrap()
			.collect::<Result<_, _>>()
			.unwrap();
		assert_eq!(head.len() + tail.len(), 10);
		assert_eq!(tail[0].database_version, 2);
		assert_eq!(tail[0].column, "c");
		assert_eq!(r.changes_from(ChangeCursor::after_version(5)).unwrap().count(), 0);
	}

	/// Tables made only of their primary key surface their lifecycle record.
	#[test]
	fn test_pk_only_table_emits_lifecycle() {
		let mut r = Replica::open_in_memory().unwrap();
		r.connection()
			.execute_batch("CREATE TABLE tags (name TEXT PRIMARY KEY)")
			.unwrap();
		r.track_table("tags").unwrap();
		let mut tx = r.begin().unwrap();
		tx.insert("tags", &[("name", Value::from("red"))]).unwrap();
		tx.commit().unwrap();

		let records = changes(&r);
		assert_eq!(records.len(), 1);
		assert!(records[0].is_sentinel());
		assert_eq!(records[0].causal_length, 1);
	}
}
