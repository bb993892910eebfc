//! Introspection of tracked tables.

use std::collections::BTreeMap;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params_from_iter};

use crate::clock::SENTINEL;
use crate::codec::Value;
use crate::error::{Error, Result};

/// Shape of a tracked table as far as the change log is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
	pub name: String,
	/// Primary key columns in key order.
	pub pks: Vec<String>,
	/// Remaining columns in declaration order.
	pub columns: Vec<String>,
}

struct ColumnRow {
	name: String,
	not_null: bool,
	has_default: bool,
	pk: i64,
	hidden: i64,
}

impl TableInfo {
	/// Read a table's shape and check that it can be tracked.
	pub fn introspect(conn: &Connection, name: &str) -> Result<Self> {
		if name.starts_with("crr_") || name.starts_with("sqlite_") {
			return Err(Error::schema(name, "name uses a reserved prefix"));
		}

		let exists: Option<i64> = conn
			.query_row(
				"SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
				[name],
				|row| row.get(0),
			)
			.optional()?;
		if exists.is_none() {
			return Err(Error::schema(name, "no such table"));
		}

		let mut stmt = conn.prepare(&format!("PRAGMA table_xinfo({})", quote(name)))?;
		let rows = stmt
			.query_map([], |row| {
				Ok(ColumnRow {
					name: row.get(1)?,
					not_null: row.get::<_, i64>(3)? != 0,
					has_default: row.get_ref(4)?.data_type() != Type::Null,
					pk: row.get(5)?,
					hidden: row.get(6)?,
				})
			})?
			.collect::<rusqlite::Result<Vec<_>>>()?;

		let mut keyed: Vec<(i64, String)> = Vec::new();
		let mut columns = Vec::new();
		for col in rows {
			if col.hidden == 2 || col.hidden == 3 {
				return Err(Error::schema(
					name,
					format!("generated column '{}' is not supported", col.name),
				));
			}
			if col.name == SENTINEL {
				return Err(Error::schema(name, "column name collides with the row sentinel"));
			}
			if col.pk > 0 {
				keyed.push((col.pk, col.name));
			} else {
				if col.not_null && !col.has_default {
					return Err(Error::schema(
						name,
						format!("column '{}' is NOT NULL without a DEFAULT", col.name),
					));
				}
				columns.push(col.name);
			}
		}

		if keyed.is_empty() {
			return Err(Error::schema(name, "a primary key is required"));
		}
		if keyed.len() > u8::MAX as usize {
			return Err(Error::schema(name, "too many primary key columns"));
		}
		keyed.sort();

		check_unique_indexes(conn, name)?;

		Ok(Self {
			name: name.to_string(),
			pks: keyed.into_iter().map(|(_, n)| n).collect(),
			columns,
		})
	}

	pub fn has_column(&self, column: &str) -> bool {
		self.columns.iter().any(|c| c == column)
	}

	pub fn is_pk(&self, column: &str) -> bool {
		self.pks.iter().any(|c| c == column)
	}

	/// A table whose only columns are its primary key.
	pub fn is_pk_only(&self) -> bool {
		self.columns.is_empty()
	}

	/// `"a" = ?N AND "b" = ?N+1 ...` for the key columns, numbering from `first`.
	pub(crate) fn pk_predicate(&self, first: usize) -> String {
		self.pks
			.iter()
			.enumerate()
			.map(|(i, pk)| format!("{} = ?{}", quote(pk), first + i))
			.collect::<Vec<_>>()
			.join(" AND ")
	}

	/// Current value of one cell, NULL when the row is gone.
	pub(crate) fn read_cell(&self, conn: &Connection, pk: &[Value], column: &str) -> Result<Value> {
		let sql = format!(
			"SELECT {} FROM {} WHERE {}",
			quote(column),
			quote(&self.name),
			self.pk_predicate(1)
		);
		let value = conn
			.prepare_cached(&sql)?
			.query_row(params_from_iter(pk), |row| row.get(0))
			.optional()?;
		Ok(value.unwrap_or(Value::Null))
	}

	pub(crate) fn row_exists(&self, conn: &Connection, pk: &[Value]) -> Result<bool> {
		let sql = format!("SELECT 1 FROM {} WHERE {}", quote(&self.name), self.pk_predicate(1));
		let found: Option<i64> = conn
			.prepare_cached(&sql)?
			.query_row(params_from_iter(pk), |row| row.get(0))
			.optional()?;
		Ok(found.is_some())
	}

	/// Every primary key currently present in the base table.
	pub(crate) fn all_keys(&self, conn: &Connection) -> Result<Vec<Vec<Value>>> {
		let cols = self.pks.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
		let mut stmt = conn.prepare(&format!("SELECT {} FROM {}", cols, quote(&self.name)))?;
		let width = self.pks.len();
		let keys = stmt
			.query_map([], |row| (0..width).map(|i| row.get(i)).collect())?
			.collect::<rusqlite::Result<Vec<Vec<Value>>>>()?;
		Ok(keys)
	}
}

fn check_unique_indexes(conn: &Connection, name: &str) -> Result<()> {
	let mut stmt = conn.prepare(&format!("PRAGMA index_list({})", quote(name)))?;
	let offending = stmt
		.query_map([], |row| {
			let index: String = row.get(1)?;
			let unique: i64 = row.get(2)?;
			let origin: String = row.get(3)?;
			Ok((index, unique != 0 && origin != "pk"))
		})?
		.collect::<rusqlite::Result<Vec<_>>>()?
		.into_iter()
		.find(|(_, bad)| *bad);
	match offending {
		Some((index, _)) => Err(Error::schema(
			name,
			format!("unique index '{}' besides the primary key is not supported", index),
		)),
		None => Ok(()),
	}
}

/// Quote an identifier for interpolation into SQL.
pub fn quote(ident: &str) -> String {
	format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Tracked tables of one replica, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct TrackedTables(BTreeMap<String, TableInfo>);

impl TrackedTables {
	/// Restore the tracked set recorded in `crr_tracked_tables`. Tables that
	/// disappeared or no longer qualify are skipped with a warning.
	pub(crate) fn load(conn: &Connection) -> Result<Self> {
		let mut stmt = conn.prepare("SELECT name FROM crr_tracked_tables ORDER BY name")?;
		let names = stmt
			.query_map([], |row| row.get::<_, String>(0))?
			.collect::<rusqlite::Result<Vec<_>>>()?;

		let mut tables = BTreeMap::new();
		for name in names {
			match TableInfo::introspect(conn, &name) {
				Ok(info) => {
					tables.insert(name, info);
				}
				Err(Error::Schema { reason, .. }) => {
					log::warn!("tracked table '{}' skipped: {}", name, reason);
				}
				Err(e) => return Err(e),
			}
		}
		Ok(Self(tables))
	}

	pub fn get(&self, name: &str) -> Option<&TableInfo> {
		self.0.get(name)
	}

	pub fn contains(&self, name: &str) -> bool {
		self.0.contains_key(name)
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.0.keys().map(String::as_str)
	}

	pub(crate) fn insert(&mut self, info: TableInfo) {
		self.0.insert(info.name.clone(), info);
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	fn conn(ddl: &str) -> Connection {
		let conn = Connection::open_in_memory().unwrap();
		conn.execute_batch(ddl).unwrap();
		conn
	}

	#[test]
	fn test_composite_key_order() {
		let conn = conn("CREATE TABLE t (x TEXT, b INTEGER, a INTEGER, PRIMARY KEY (a, b));");
		let info = TableInfo::introspect(&conn, "t").unwrap();
		assert_eq!(info.pks, vec!["a", "b"]);
		assert_eq!(info.columns, vec!["x"]);
		assert_eq!(info.pk_predicate(3), "\"a\" = ?3 AND \"b\" = ?4");
	}

	#[test]
	fn test_rejects_incompatible_tables() {
		let conn = conn(
			"CREATE TABLE nopk (a INTEGER);
			CREATE TABLE strict_col (id INTEGER PRIMARY KEY, v TEXT NOT NULL);
			CREATE TABLE uniq (id INTEGER PRIMARY KEY, email TEXT UNIQUE);
			CREATE TABLE crr_mine (id INTEGER PRIMARY KEY);",
		);
		for name in ["nopk", "strict_col", "uniq", "crr_mine", "missing"] {
			match TableInfo::introspect(&conn, name) {
				Err(Error::Schema { table, .. }) => assert_eq!(table, name),
				other => panic!("expected schema error for {}, got {:?}", name, other),
			}
		}
	}

	#[test]
	fn test_not_null_with_default_is_accepted() {
		let conn = conn("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT NOT NULL DEFAULT '');");
		let info = TableInfo::introspect(&conn, "t").unwrap();
		assert!(info.has_column("v"));
		assert!(info.is_pk("id"));
		assert!(!info.is_pk_only());
	}

	#[test]
	fn test_quote_escapes() {
		assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
	}
}
