//! Database and site version counters.
//!
//! A replica owns a [`VersionClock`] holding the committed counters. Each
//! transaction works against a [`TxClock`] that hands out the pending
//! versions lazily; the committed clock only moves when the transaction
//! commits, so an aborted transaction leaves no gap.

use std::collections::HashMap;

use rusqlite::Connection;

use crate::clock::SiteId;
use crate::clock::site_versions;
use crate::error::Result;

/// Baseline of every database and site version.
pub const MIN_VERSION: i64 = 0;

const DB_VERSION_KEY: &str = "db_version";

/// Committed counters of one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionClock {
	db_version: i64,
	site_version: i64,
}

impl VersionClock {
	/// Resume from persisted state: the recorded database version or the
	/// highest version stamped in the change log, whichever is greater.
	pub(crate) fn load(conn: &Connection, site: &SiteId) -> Result<Self> {
		let db_version: i64 = conn.query_row(
			"SELECT max(
				coalesce((SELECT value FROM crr_master WHERE key = ?1), ?2),
				coalesce((SELECT max(db_version) FROM crr_clock), ?2)
			)",
			rusqlite::params![DB_VERSION_KEY, MIN_VERSION],
			|row| row.get(0),
		)?;
		let site_version = site_versions::last_seen(conn, site)?;
		Ok(Self {
			db_version,
			site_version,
		})
	}

	pub fn db_version(&self) -> i64 {
		self.db_version
	}

	pub fn site_version(&self) -> i64 {
		self.site_version
	}

	pub(crate) fn begin(&self) -> TxClock {
		TxClock {
			base_db_version: self.db_version,
			base_site_version: self.site_version,
			db_version: None,
			site_version: None,
			next_seq: 0,
			touched: HashMap::new(),
		}
	}

	pub(crate) fn apply(&mut self, committed: Committed) {
		self.db_version = committed.db_version;
		if let Some(site_version) = committed.site_version {
			self.site_version = site_version;
		}
	}
}

/// Record the database version of a committing transaction.
pub(crate) fn persist(conn: &Connection, db_version: i64) -> Result<()> {
	conn.execute(
		"INSERT INTO crr_master (key, value) VALUES (?1, ?2)
		ON CONFLICT (key) DO UPDATE SET value = excluded.value",
		rusqlite::params![DB_VERSION_KEY, db_version],
	)?;
	Ok(())
}

/// Who last stamped a cell within the current transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Author {
	Local,
	Merge,
}

pub(crate) type CellKey = (String, Vec<u8>, String);

/// Versions that become visible once a transaction commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Committed {
	pub db_version: i64,
	pub site_version: Option<i64>,
}

/// Pending clock state of one open transaction.
#[derive(Debug)]
pub(crate) struct TxClock {
	base_db_version: i64,
	base_site_version: i64,
	db_version: Option<i64>,
	site_version: Option<i64>,
	next_seq: i64,
	touched: HashMap<CellKey, (i64, Author)>,
}

impl TxClock {
	/// The database version every tracked write of this transaction shares.
	pub fn db_version(&mut self) -> i64 {
		*self.db_version.get_or_insert(self.base_db_version + 1)
	}

	/// The site version of this transaction, claimed by local writes only.
	pub fn site_version(&mut self) -> i64 {
		*self.site_version.get_or_insert(self.base_site_version + 1)
	}

	/// Database version visible to readers inside the transaction.
	pub fn current_db_version(&self) -> i64 {
		self.db_version.unwrap_or(self.base_db_version)
	}

	/// Sequence slot for a cell. A cell touched earlier in the transaction
	/// keeps its first slot.
	pub fn stamp(&mut self, key: CellKey, author: Author) -> i64 {
		if let Some((seq, previous)) = self.touched.get_mut(&key) {
			*previous = author;
			return *seq;
		}
		let seq = self.next_seq;
		self.next_seq += 1;
		self.touched.insert(key, (seq, author));
		seq
	}

	/// Whether the cell was already written locally in this transaction.
	pub fn written_locally(&self, key: &CellKey) -> bool {
		matches!(self.touched.get(key), Some((_, Author::Local)))
	}

	/// Drop the non-sentinel cells of a row, e.g. after it was deleted.
	pub fn forget_cells(&mut self, table: &str, pk: &[u8], sentinel: &str) {
		self.touched
			.retain(|(t, p, c), _| !(t == table && p.as_slice() == pk && c != sentinel));
	}

	pub fn finish(self) -> Option<Committed> {
		self.db_version.map(|db_version| Committed {
			db_version,
			site_version: self.site_version,
		})
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	fn clock(db_version: i64, site_version: i64) -> VersionClock {
		VersionClock {
			db_version,
			site_version,
		}
	}

	#[test]
	fn test_untouched_transaction_commits_nothing() {
		let tx = clock(4, 2).begin();
		assert_eq!(tx.current_db_version(), 4);
		assert_eq!(tx.finish(), None);
	}

	#[test]
	fn test_versions_claimed_once() {
		let mut tx = clock(4, 2).begin();
		assert_eq!(tx.db_version(), 5);
		assert_eq!(tx.db_version(), 5);
		assert_eq!(tx.site_version(), 3);
		assert_eq!(
			tx.finish(),
			Some(Committed {
				db_version: 5,
				site_version: Some(3)
			})
		);
	}

	#[test]
	fn test_merge_only_transaction_keeps_site_version() {
		let mut base = clock(1, 1);
		let mut tx = base.begin();
		tx.db_version();
		base.apply(tx.finish().unwrap());
		assert_eq!(base.db_version(), 2);
		assert_eq!(base.site_version(), 1);
	}

	#[test]
	fn test_repeated_cell_keeps_sequence() {
		let mut tx = clock(0, 0).begin();
		let a = ("t".to_string(), vec![1, 9, 1], "a".to_string());
		let b = ("t".to_string(), vec![1, 9, 1], "b".to_string());
		assert_eq!(tx.stamp(a.clone(), Author::Local), 0);
		assert_eq!(tx.stamp(b.clone(), Author::Merge), 1);
		assert_eq!(tx.stamp(a.clone(), Author::Local), 0);
		assert!(tx.written_locally(&a));
		assert!(!tx.written_locally(&b));

		tx.stamp(a.clone(), Author::Merge);
		assert!(!tx.written_locally(&a));

		tx.forget_cells("t", &[1, 9, 1], "-1");
		assert_eq!(tx.stamp(a, Author::Local), 2);
	}
}
