use thiserror::Error;

/// Errors surfaced by replicas, the merge engine and changeset IO.
///
/// Losing a conflict or re-merging an already seen record is not an error;
/// those outcomes are reported through [`crate::sync::MergeReport`].
#[derive(Debug, Error)]
pub enum Error {
	/// The host store failed; the enclosing transaction is rolled back.
	#[error("storage error: {0}")]
	Storage(#[from] rusqlite::Error),

	/// A table cannot be tracked (or altered) in its current shape.
	#[error("table '{table}' cannot be tracked: {reason}")]
	Schema { table: String, reason: String },

	/// An incoming change record was rejected; the whole batch was rolled back.
	#[error("malformed change record #{index}: {reason}")]
	MalformedChange { index: usize, reason: String },

	/// A local write referenced something the tracked schema does not have.
	#[error("invalid write to '{table}': {reason}")]
	InvalidWrite { table: String, reason: String },

	/// A primary key encoding could not be decoded.
	#[error("invalid primary key encoding: {0}")]
	PrimaryKey(String),

	#[error("invalid site id: {0}")]
	SiteId(#[from] uuid::Error),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	/// A changeset line did not hold a change record.
	#[error("changeset line {line}: {source}")]
	Changeset {
		line: usize,
		#[source]
		source: serde_json::Error,
	},
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
	pub(crate) fn schema(table: &str, reason: impl Into<String>) -> Self {
		Error::Schema {
			table: table.to_string(),
			reason: reason.into(),
		}
	}

	pub(crate) fn invalid_write(table: &str, reason: impl Into<String>) -> Self {
		Error::InvalidWrite {
			table: table.to_string(),
			reason: reason.into(),
		}
	}
}
