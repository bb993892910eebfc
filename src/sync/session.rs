//! One-way exchange between two replicas.

use log::info;
use serde::{Deserialize, Serialize};

use crate::clock::{ChangeRecord, PeerEvent, SiteId};
use crate::error::Result;
use crate::store::Replica;
use crate::sync::merge::MergeReport;

/// Outcome of one [`sync`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
	pub from: SiteId,
	pub into: SiteId,
	/// Records sent after filtering by the receiver's site version cursor.
	pub sent: usize,
	pub merge: MergeReport,
}

/// Send `into` every change of `from` it has not seen, and merge them.
///
/// The receiver's Site Version Table is the cursor, so repeated calls only
/// ship new writes. Both sides record tracked-peer cursors: `into` the
/// highest database version of `from` it received, `from` the site version
/// of its own writes that `into` now holds.
pub fn sync(from: &mut Replica, into: &mut Replica) -> Result<SyncReport> {
	let cursor = into.site_cursor()?;
	let records = from
		.changes_for_sites(&cursor)?
		.collect::<Result<Vec<ChangeRecord>>>()?;

	let merge = into.merge(&records)?;

	if let Some(received) = records.iter().map(|r| r.database_version).max() {
		into.note_peer(&from.site_id(), PeerEvent::Receive, received)?;
	}
	let acknowledged = into.last_seen(&from.site_id())?;
	from.note_peer(&into.site_id(), PeerEvent::Send, acknowledged)?;

	info!(
		"synced {} -> {}: {} sent, {} applied, {} discarded",
		from.site_id(),
		into.site_id(),
		records.len(),
		merge.applied,
		merge.discarded
	);

	Ok(SyncReport {
		from: from.site_id(),
		into: into.site_id(),
		sent: records.len(),
		merge,
	})
}
