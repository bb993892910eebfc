mod common;

use common::*;
use vanopticon_bifrost::codec::pk;
use vanopticon_bifrost::{Error, MIN_VERSION, Rank, Replica, SENTINEL, Value, sync};

#[cfg(feature = "integration-tests")]
mod integration_tests {
	use super::*;

	fn b_record(replica: &Replica) -> vanopticon_bifrost::ChangeRecord {
		changes(replica)
			.into_iter()
			.find(|c| c.column == "b")
			.unwrap()
	}

	/// Two replicas edit one cell in turn; the causally later write wins on
	/// both and the Site Version Tables end identical.
	#[test]
	fn test_two_site_scenario() {
		let mut a = replica_with_foo();
		let mut b = replica_with_foo();

		let mut tx = a.begin().unwrap();
		tx.insert("foo", &[("a", Value::Integer(1))]).unwrap();
		assert_eq!(tx.commit().unwrap(), Some(1));
		sync(&mut a, &mut b).unwrap();

		put(&mut a, 1, 1i64);
		assert_eq!(a.db_version(), 2);
		sync(&mut a, &mut b).unwrap();

		put(&mut b, 1, 2i64);
		sync(&mut b, &mut a).unwrap();

		let record = b_record(&a);
		assert_eq!(record.value, Value::Integer(2));
		assert_eq!(record.column_version, 3);
		assert_eq!(record.database_version, 3);
		assert_eq!(record.origin_site, b.site_id());
		assert_eq!(record.causal_length, 1);
		assert_eq!(record.seq, 0);
		assert_eq!(record.tie_break_value, 1);

		put(&mut a, 1, 3i64);
		let record = b_record(&a);
		assert_eq!(record.value, Value::Integer(3));
		assert_eq!(record.column_version, 4);
		assert_eq!(record.database_version, 4);
		assert_eq!(record.origin_site, a.site_id());
		assert_eq!(record.tie_break_value, 3);

		sync(&mut a, &mut b).unwrap();
		assert_eq!(cell(&b, 1, "b"), Some(Value::Integer(3)));
		assert_eq!(b_record(&b).origin_site, a.site_id());

		let expected = vec![(a.site_id(), 3), (b.site_id(), 1)]
			.into_iter()
			.collect::<std::collections::BTreeMap<_, _>>();
		assert_eq!(a.site_cursor().unwrap(), expected);
		assert_eq!(b.site_cursor().unwrap(), expected);
		assert_eq!(a.site_versions().unwrap(), b.site_versions().unwrap());
	}

	/// Higher column versions win regardless of site; equal versions fall to
	/// the greater site id.
	#[test]
	fn test_column_version_then_site_precedence() {
		let mut a = replica_with_foo();
		let mut b = replica_with_foo();
		put(&mut a, 1, "base");
		sync(&mut a, &mut b).unwrap();

		// a: cv 2 and 3, b: cv 2
		put(&mut a, 1, "a1");
		put(&mut a, 1, "a2");
		put(&mut b, 1, "b1");
		sync(&mut a, &mut b).unwrap();
		sync(&mut b, &mut a).unwrap();
		assert_eq!(cell(&a, 1, "b"), Some(Value::from("a2")));
		assert_eq!(cell(&b, 1, "b"), Some(Value::from("a2")));

		// Both at cv 4 now.
		put(&mut a, 1, "from a");
		put(&mut b, 1, "from b");
		sync(&mut a, &mut b).unwrap();
		sync(&mut b, &mut a).unwrap();
		let winner = if a.site_id() > b.site_id() { "from a" } else { "from b" };
		assert_eq!(cell(&a, 1, "b"), Some(Value::from(winner)));
		assert_eq!(cell(&b, 1, "b"), Some(Value::from(winner)));
	}

	/// A delete outranks concurrent edits of the row it removes; a later
	/// insert resurrects the row everywhere.
	#[test]
	fn test_delete_and_resurrection_converge() {
		let mut a = replica_with_foo();
		let mut b = replica_with_foo();
		put(&mut a, 1, "v");
		sync(&mut a, &mut b).unwrap();

		remove(&mut a, 1);
		put(&mut b, 1, "edited");
		put(&mut b, 1, "edited again");
		sync(&mut a, &mut b).unwrap();
		sync(&mut b, &mut a).unwrap();
		assert_eq!(cell(&a, 1, "b"), None);
		assert_eq!(cell(&b, 1, "b"), None);

		let lifecycle = changes(&b);
		assert_eq!(lifecycle.len(), 1);
		assert_eq!(lifecycle[0].column, SENTINEL);
		assert_eq!(lifecycle[0].causal_length, 2);

		put(&mut b, 1, "back");
		sync(&mut b, &mut a).unwrap();
		assert_eq!(cell(&a, 1, "b"), Some(Value::from("back")));
		assert_eq!(snapshot(&a), snapshot(&b));
		let b_cell = changes(&a).into_iter().find(|c| c.column == "b").unwrap();
		assert_eq!((b_cell.causal_length, b_cell.column_version), (3, 1));
	}

	/// Re-merging everything a replica already holds changes nothing.
	#[test]
	fn test_merge_is_idempotent() {
		let mut a = replica_with_foo();
		let mut b = replica_with_foo();
		put(&mut a, 1, "x");
		put(&mut a, 2, "y");
		remove(&mut a, 2);

		let first = merge_all(&a, &mut b);
		assert!(first.applied > 0);
		let version = b.db_version();

		let second = merge_all(&a, &mut b);
		assert_eq!(second.applied, 0);
		assert_eq!(second.rows_impacted, 0);
		assert_eq!(second.discarded, second.received);
		assert_eq!(b.db_version(), version);
		assert_eq!(snapshot(&a), snapshot(&b));
	}

	/// Concurrent deletes only move lifecycle bookkeeping; no row content
	/// changes on either side.
	#[test]
	fn test_concurrent_deletes_impact_no_rows() {
		let mut a = replica_with_foo();
		let mut b = replica_with_foo();
		put(&mut a, 1, "x");
		merge_all(&a, &mut b);
		remove(&mut a, 1);
		remove(&mut b, 1);

		let (from_a, from_b) = (changes(&a), changes(&b));
		let into_b = b.merge(&from_a).unwrap();
		let into_a = a.merge(&from_b).unwrap();
		assert_eq!(into_a.applied + into_b.applied, 1);
		assert_eq!(into_a.rows_impacted + into_b.rows_impacted, 0);
		assert_eq!(into_a.rows_deleted + into_b.rows_deleted, 0);
	}

	/// One malformed record rolls back the whole batch.
	#[test]
	fn test_malformed_batch_is_atomic() {
		let mut a = replica_with_foo();
		let mut b = replica_with_foo();
		put(&mut a, 1, "x");

		let mut records = changes(&a);
		let mut bad = records[0].clone();
		bad.table = "missing".to_string();
		records.push(bad);

		match b.merge(&records) {
			Err(Error::MalformedChange { index, .. }) => assert_eq!(index, records.len() - 1),
			other => panic!("expected malformed change, got {:?}", other),
		}
		assert_eq!(b.db_version(), MIN_VERSION);
		assert!(snapshot(&b).is_empty());
		assert!(b.site_versions().unwrap().is_empty());
	}

	#[test]
	fn test_malformed_records_rejected() {
		let mut a = replica_with_foo();
		let mut b = replica_with_foo();
		put(&mut a, 1, "x");
		let good = changes(&a).remove(0);

		let mut cases = Vec::new();
		let mut r = good.clone();
		r.column = "nope".to_string();
		cases.push(r);
		let mut r = good.clone();
		r.pk = vec![9, 9, 9];
		cases.push(r);
		let mut r = good.clone();
		r.pk = pk::encode(&[Value::Integer(1), Value::Integer(2)]).unwrap();
		cases.push(r);
		let mut r = good.clone();
		r.causal_length = 0;
		cases.push(r);
		let mut r = good.clone();
		r.column_version = 0;
		cases.push(r);
		let mut r = good.clone();
		r.causal_length = 2;
		cases.push(r);

		for record in cases {
			assert!(matches!(
				b.merge(std::slice::from_ref(&record)),
				Err(Error::MalformedChange { index: 0, .. })
			));
		}
		assert_eq!(b.db_version(), MIN_VERSION);
	}

	/// The record ordering used by the merge matches what replicas decide.
	#[test]
	fn test_rank_agrees_with_merge() {
		let mut a = replica_with_foo();
		let mut b = replica_with_foo();
		put(&mut a, 1, "a");
		put(&mut b, 1, "b");
		let ra = b_record(&a);
		let rb = b_record(&b);

		merge_all(&b, &mut a);
		let expected = if Rank::of(&ra).beats(&ra.value, &Rank::of(&rb), &rb.value) {
			"a"
		} else {
			"b"
		};
		assert_eq!(cell(&a, 1, "b"), Some(Value::from(expected)));
	}

	/// Merged winners are stamped with the receiver's database version but
	/// keep the origin's metadata.
	#[test]
	fn test_merged_records_keep_origin_metadata() {
		let mut a = replica_with_foo();
		let mut b = replica_with_foo();
		for i in 0..3 {
			put(&mut b, 10 + i, i);
		}
		put(&mut a, 1, "local");

		let report = merge_all(&b, &mut a);
		assert_eq!(report.db_version, 2);
		assert_eq!(report.seen.get(&b.site_id()), Some(&3));

		let merged: Vec<_> = changes(&a)
			.into_iter()
			.filter(|c| c.origin_site == b.site_id())
			.collect();
		assert!(merged.iter().all(|c| c.database_version == 2));
		assert_eq!(merged.len(), 6);
		assert!(merged.windows(2).all(|w| w[0].seq < w[1].seq));

		// Sequence numbers of one version are dense, lifecycle entries included.
		let (count, max_seq): (i64, i64) = a
			.connection()
			.query_row(
				"SELECT count(*), max(seq) FROM crr_clock WHERE db_version = 2",
				[],
				|row| Ok((row.get(0)?, row.get(1)?)),
			)
			.unwrap();
		assert_eq!(max_seq, count - 1);
		assert_eq!(a.last_seen(&b.site_id()).unwrap(), 3);
		assert_eq!(a.site_version(), 1);
	}
}
