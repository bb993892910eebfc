use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use log::{debug, warn};
use rusqlite::params_from_iter;
use serde::{Deserialize, Serialize};

use crate::clock::change_log::{self, ClockEntry};
use crate::clock::{ChangeRecord, SENTINEL, SiteId, site_versions};
use crate::codec::{Value, pk};
use crate::error::{Error, Result};
use crate::store::Tx;
use crate::store::schema::{TableInfo, quote};

/// Metadata half of the merge order.
///
/// Field order is precedence order: the derived `Ord` compares causal
/// length, then column version, then origin site, then the origin's site
/// version. Records equal on all four fall back to comparing values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rank {
	pub causal_length: i64,
	pub column_version: i64,
	pub origin_site: SiteId,
	pub tie_break: i64,
}

impl Rank {
	pub fn of(record: &ChangeRecord) -> Self {
		Self {
			causal_length: record.causal_length,
			column_version: record.column_version,
			origin_site: record.origin_site,
			tie_break: record.tie_break_value,
		}
	}

	pub(crate) fn of_entry(entry: &ClockEntry) -> Self {
		Self {
			causal_length: entry.cl,
			column_version: entry.col_version,
			origin_site: entry.site_id,
			tie_break: entry.site_version,
		}
	}

	/// Whether a write ranked `self` with `value` beats one ranked `other`
	/// holding `other_value`.
	pub fn beats(&self, value: &Value, other: &Rank, other_value: &Value) -> bool {
		match self.cmp(other) {
			Ordering::Greater => true,
			Ordering::Less => false,
			Ordering::Equal => value.total_cmp(other_value) == Ordering::Greater,
		}
	}
}

/// Outcome of merging one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
	pub received: usize,
	pub applied: usize,
	pub discarded: usize,
	/// Base rows removed by winning delete records.
	pub rows_deleted: usize,
	/// Distinct rows whose base content changed.
	pub rows_impacted: usize,
	/// Database version after the merge.
	pub db_version: i64,
	/// Highest site version merged from each origin.
	pub seen: BTreeMap<SiteId, i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
	Applied { rows_deleted: usize, content_changed: bool },
	Discarded,
}

/// Apply `records` in order inside `tx`.
///
/// Any malformed record aborts the batch with [`Error::MalformedChange`];
/// the caller drops the transaction, which undoes the records applied so far.
pub(crate) fn merge_batch(tx: &mut Tx<'_>, records: &[ChangeRecord]) -> Result<MergeReport> {
	let started = Instant::now();
	let mut report = MergeReport::default();
	let mut impacted = BTreeSet::new();

	for (index, record) in records.iter().enumerate() {
		report.received += 1;
		let (info, key) = validate(tx, index, record)?;
		match apply(tx, info, &key, record)? {
			Outcome::Applied {
				rows_deleted,
				content_changed,
			} => {
				report.applied += 1;
				report.rows_deleted += rows_deleted;
				if content_changed {
					impacted.insert((record.table.as_str(), record.pk.as_slice()));
				}
			}
			Outcome::Discarded => report.discarded += 1,
		}
		let seen = report.seen.entry(record.origin_site).or_insert(record.tie_break_value);
		*seen = (*seen).max(record.tie_break_value);
	}

	report.rows_impacted = impacted.len();

	for (site, version) in &report.seen {
		site_versions::record_seen(tx.connection(), site, *version)?;
	}
	report.db_version = tx.db_version();

	if let Some(m) = tx.metrics() {
		m.merge_records_received_total.inc_by(report.received as u64);
		m.merge_records_applied_total.inc_by(report.applied as u64);
		m.merge_records_discarded_total.inc_by(report.discarded as u64);
		m.merge_duration_seconds.observe(started.elapsed().as_secs_f64());
	}
	debug!(
		"merged batch: {} received, {} applied, {} discarded, {} rows impacted",
		report.received, report.applied, report.discarded, report.rows_impacted
	);
	Ok(report)
}

fn validate<'r>(tx: &Tx<'r>, index: usize, record: &ChangeRecord) -> Result<(&'r TableInfo, Vec<Value>)> {
	let malformed = |reason: String| Error::MalformedChange { index, reason };

	let info = tx
		.tables()
		.get(&record.table)
		.ok_or_else(|| malformed(format!("unknown table '{}'", record.table)))?;
	if !record.is_sentinel() && !info.has_column(&record.column) {
		return Err(malformed(format!(
			"unknown column '{}' in table '{}'",
			record.column, record.table
		)));
	}
	let key = pk::decode(&record.pk).map_err(|e| malformed(e.to_string()))?;
	if key.len() != info.pks.len() {
		return Err(malformed(format!(
			"primary key has {} columns, table '{}' has {}",
			key.len(),
			record.table,
			info.pks.len()
		)));
	}
	if record.causal_length < 1 || record.column_version < 1 {
		return Err(malformed(format!(
			"causal length {} and column version {} must be positive",
			record.causal_length, record.column_version
		)));
	}
	if !record.is_sentinel() && record.causal_length % 2 == 0 {
		return Err(malformed(format!(
			"column '{}' carries deleted-row causal length {}",
			record.column, record.causal_length
		)));
	}
	Ok((info, key))
}

fn apply(tx: &mut Tx<'_>, info: &TableInfo, key: &[Value], record: &ChangeRecord) -> Result<Outcome> {
	let rank = Rank::of(record);
	let local_cl = change_log::row_causal_length(tx.connection(), &info.name, &record.pk)?;

	if record.causal_length < local_cl {
		debug!(
			"discard {}.{}: causal length {} behind {}",
			record.table, record.column, record.causal_length, local_cl
		);
		return Ok(Outcome::Discarded);
	}

	if record.causal_length > local_cl {
		if record.causal_length % 2 == 0 {
			let rows_deleted = delete_row(tx, info, key)?;
			tx.drop_cells(&info.name, &record.pk)?;
			tx.stamp_merged(&info.name, &record.pk, SENTINEL, &rank)?;
			return Ok(Outcome::Applied {
				rows_deleted,
				content_changed: rows_deleted > 0,
			});
		}

		// A newer lifecycle of the row: older cell history no longer applies.
		ensure_row(tx, info, key)?;
		tx.drop_cells(&info.name, &record.pk)?;
		let lifecycle = Rank {
			column_version: record.causal_length,
			..rank
		};
		tx.stamp_merged(&info.name, &record.pk, SENTINEL, &lifecycle)?;
		if !record.is_sentinel() {
			write_cell(tx, info, key, &record.column, &record.value)?;
			tx.stamp_merged(&info.name, &record.pk, &record.column, &rank)?;
		}
		return Ok(Outcome::Applied {
			rows_deleted: 0,
			content_changed: true,
		});
	}

	let local = change_log::get_entry(tx.connection(), &info.name, &record.pk, &record.column)?;
	if record.is_sentinel() {
		// Same lifecycle: only the bookkeeping of the lifecycle record moves.
		let wins = local.is_none_or(|e| rank > Rank::of_entry(&e));
		if !wins {
			return Ok(Outcome::Discarded);
		}
		tx.stamp_merged(&info.name, &record.pk, SENTINEL, &rank)?;
		return Ok(Outcome::Applied {
			rows_deleted: 0,
			content_changed: false,
		});
	}

	let wins = match local {
		None => true,
		Some(entry) => {
			let local_value = info.read_cell(tx.connection(), key, &record.column)?;
			rank.beats(&record.value, &Rank::of_entry(&entry), &local_value)
		}
	};
	if !wins {
		debug!("discard {}.{}: local write dominates", record.table, record.column);
		return Ok(Outcome::Discarded);
	}

	ensure_row(tx, info, key)?;
	write_cell(tx, info, key, &record.column, &record.value)?;
	tx.stamp_merged(&info.name, &record.pk, &record.column, &rank)?;
	Ok(Outcome::Applied {
		rows_deleted: 0,
		content_changed: true,
	})
}

fn delete_row(tx: &Tx<'_>, info: &TableInfo, key: &[Value]) -> Result<usize> {
	let sql = format!("DELETE FROM {} WHERE {}", quote(&info.name), info.pk_predicate(1));
	Ok(tx.connection().execute(&sql, params_from_iter(key))?)
}

fn ensure_row(tx: &Tx<'_>, info: &TableInfo, key: &[Value]) -> Result<()> {
	let columns = info.pks.iter().map(|c| quote(c)).collect::<Vec<_>>();
	let slots = (1..=key.len()).map(|i| format!("?{}", i)).collect::<Vec<_>>();
	let sql = format!(
		"INSERT OR IGNORE INTO {} ({}) VALUES ({})",
		quote(&info.name),
		columns.join(", "),
		slots.join(", ")
	);
	tx.connection()
		.prepare_cached(&sql)?
		.execute(params_from_iter(key))?;
	Ok(())
}

fn write_cell(tx: &Tx<'_>, info: &TableInfo, key: &[Value], column: &str, value: &Value) -> Result<()> {
	let sql = format!(
		"UPDATE {} SET {} = ?1 WHERE {}",
		quote(&info.name),
		quote(column),
		info.pk_predicate(2)
	);
	let params = std::iter::once(value).chain(key.iter());
	tx.connection()
		.prepare_cached(&sql)?
		.execute(params_from_iter(params))?;
	Ok(())
}

/// Log and count a batch that failed; the transaction is already gone.
pub(crate) fn note_failure(err: &Error, metrics: Option<&crate::observability::MetricsRegistry>) {
	warn!("merge batch rejected: {}", err);
	if let Some(m) = metrics {
		m.merge_failures_total.inc();
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	fn site(byte: u8) -> SiteId {
		SiteId::from_bytes(&[byte; 16]).unwrap()
	}

	fn rank(cl: i64, cv: i64, origin: u8, tie: i64) -> Rank {
		Rank {
			causal_length: cl,
			column_version: cv,
			origin_site: site(origin),
			tie_break: tie,
		}
	}

	#[test]
	fn test_causal_length_dominates() {
		let deleted = rank(2, 1, 0, 1);
		let busy = rank(1, 50, 9, 50);
		assert!(deleted.beats(&Value::Null, &busy, &Value::Integer(1)));
		assert!(!busy.beats(&Value::Integer(1), &deleted, &Value::Null));
	}

	#[test]
	fn test_column_version_then_site() {
		let v = Value::Integer(1);
		assert!(rank(1, 3, 0, 1).beats(&v, &rank(1, 2, 9, 9), &v));
		assert!(rank(1, 2, 9, 1).beats(&v, &rank(1, 2, 1, 9), &v));
		assert!(!rank(1, 2, 1, 9).beats(&v, &rank(1, 2, 9, 1), &v));
	}

	#[test]
	fn test_full_tie_falls_back_to_value() {
		let r = rank(1, 2, 3, 4);
		assert!(r.beats(&Value::Integer(2), &r, &Value::Integer(1)));
		assert!(!r.beats(&Value::Integer(1), &r, &Value::Integer(1)));
	}

	#[test]
	fn test_rank_order_is_total() {
		let mut ranks = vec![rank(1, 1, 2, 1), rank(3, 1, 0, 0), rank(1, 2, 0, 0), rank(1, 1, 1, 7)];
		ranks.sort();
		assert_eq!(ranks[0], rank(1, 1, 1, 7));
		assert_eq!(ranks[3], rank(3, 1, 0, 0));
	}
}
