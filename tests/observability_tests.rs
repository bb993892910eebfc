mod common;

use std::sync::Arc;

use common::*;
use vanopticon_bifrost::observability::MetricsRegistry;
use vanopticon_bifrost::{Replica, Value};

fn instrumented() -> (Replica, Arc<MetricsRegistry>) {
	let metrics = Arc::new(MetricsRegistry::new("test").unwrap());
	(replica_with_foo().with_metrics(metrics.clone()), metrics)
}

#[cfg(feature = "unit-tests")]
#[test]
fn test_metrics_registry_creation() {
	let registry = MetricsRegistry::new("test").unwrap();
	let output = registry.encode();

	assert!(output.contains("bifrost_commits_total"));
	assert!(output.contains("bifrost_changes_recorded_total"));
	assert!(output.contains("bifrost_merge_records_applied_total"));
	assert!(output.contains("bifrost_merge_duration_seconds"));
}

#[cfg(feature = "integration-tests")]
#[test]
fn test_commits_and_rollbacks_are_counted() {
	let (mut r, metrics) = instrumented();
	put(&mut r, 1, "x");
	put(&mut r, 1, "y");
	// insert: b and c plus the lifecycle entry, update: b
	assert_eq!(metrics.changes_recorded_total.get(), 4);

	let mut tx = r.begin().unwrap();
	tx.insert("foo", &[("a", Value::Integer(2))]).unwrap();
	tx.rollback().unwrap();

	assert_eq!(metrics.commits_total.get(), 2);
	assert_eq!(metrics.rollbacks_total.get(), 1);
	assert_eq!(metrics.db_version.get(), 2);
}

#[cfg(feature = "integration-tests")]
#[test]
fn test_merge_outcomes_are_counted() {
	let (mut a, _) = instrumented();
	let (mut b, metrics) = instrumented();
	put(&mut a, 1, "x");

	let records = changes(&a);
	b.merge(&records).unwrap();
	b.merge(&records).unwrap();
	assert_eq!(metrics.merge_records_received_total.get(), 4);
	assert_eq!(metrics.merge_records_applied_total.get(), 2);
	assert_eq!(metrics.merge_records_discarded_total.get(), 2);
	assert_eq!(metrics.merge_duration_seconds.get_sample_count(), 2);

	let mut bad = records[0].clone();
	bad.causal_length = 0;
	assert!(b.merge(&[bad]).is_err());
	assert_eq!(metrics.merge_failures_total.get(), 1);
	assert_eq!(metrics.merge_records_received_total.get(), 4);
	assert_eq!(metrics.rollbacks_total.get(), 1);
	assert_eq!(metrics.commits_total.get(), 2);
}

#[cfg(feature = "integration-tests")]
#[test]
fn test_dropped_transaction_counts_as_rollback() {
	let (mut r, metrics) = instrumented();
	{
		let mut tx = r.begin().unwrap();
		tx.insert("foo", &[("a", Value::Integer(1))]).unwrap();
	}
	{
		let _idle = r.begin().unwrap();
	}
	assert_eq!(metrics.rollbacks_total.get(), 2);
	assert_eq!(metrics.commits_total.get(), 0);
	assert_eq!(cell(&r, 1, "b"), None);
}
