/// Common test utilities and helpers for integration tests.
use vanopticon_bifrost::{ChangeRecord, MIN_VERSION, MergeReport, Replica, Value};

/// An in-memory replica tracking `foo(a INTEGER PRIMARY KEY, b, c)`.
pub fn replica_with_foo() -> Replica {
	let mut replica = Replica::open_in_memory().unwrap();
	replica
		.connection()
		.execute_batch("CREATE TABLE foo (a INTEGER PRIMARY KEY, b, c)")
		.unwrap();
	replica.track_table("foo").unwrap();
	replica
}

/// Every change record of a replica, oldest first.
pub fn changes(replica: &Replica) -> Vec<ChangeRecord> {
	replica
		.changes_since(MIN_VERSION)
		.unwrap()
		.collect::<vanopticon_bifrost::Result<Vec<_>>>()
		.unwrap()
}

/// Merge every change of `from` into `into`.
#[allow(dead_code)]
pub fn merge_all(from: &Replica, into: &mut Replica) -> MergeReport {
	let records = changes(from);
	into.merge(&records).unwrap()
}

/// Insert or update `foo.b` for row `a` in one transaction.
#[allow(dead_code)]
pub fn put(replica: &mut Replica, a: i64, b: impl Into<Value>) {
	let b = b.into();
	let mut tx = replica.begin().unwrap();
	let key = [Value::Integer(a)];
	if !tx.update("foo", &key, &[("b", b.clone())]).unwrap() {
		tx.insert("foo", &[("a", Value::Integer(a)), ("b", b)]).unwrap();
	}
	tx.commit().unwrap();
}

/// Delete row `a` of `foo` in one transaction.
#[allow(dead_code)]
pub fn remove(replica: &mut Replica, a: i64) {
	let mut tx = replica.begin().unwrap();
	tx.delete("foo", &[Value::Integer(a)]).unwrap();
	tx.commit().unwrap();
}

/// Current value of one cell of `foo`, `None` when the row is absent.
#[allow(dead_code)]
pub fn cell(replica: &Replica, a: i64, column: &str) -> Option<Value> {
	use rusqlite::OptionalExtension;
	replica
		.connection()
		.query_row(&format!("SELECT {} FROM foo WHERE a = ?1", column), [a], |row| row.get(0))
		.optional()
		.unwrap()
}

/// The whole content of `foo`, ordered by key.
#[allow(dead_code)]
pub fn snapshot(replica: &Replica) -> Vec<(i64, Value, Value)> {
	let mut stmt = replica
		.connection()
		.prepare("SELECT a, b, c FROM foo ORDER BY a")
		.unwrap();
	stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
		.unwrap()
		.collect::<rusqlite::Result<Vec<_>>>()
		.unwrap()
}

/// Cell clock entries of `foo` without the per-replica stamps
/// (database version and sequence).
#[allow(dead_code)]
pub fn cell_clock(replica: &Replica) -> Vec<(Vec<u8>, String, i64, Vec<u8>, i64, i64)> {
	let mut stmt = replica
		.connection()
		.prepare(
			"SELECT pk, cid, col_version, site_id, cl, site_version FROM crr_clock
			WHERE tbl = 'foo' AND cid != '-1' ORDER BY pk, cid",
		)
		.unwrap();
	stmt.query_map([], |row| {
		Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
	})
	.unwrap()
	.collect::<rusqlite::Result<Vec<_>>>()
	.unwrap()
}
