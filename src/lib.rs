//! Bifrost: conflict-free replicated relations on top of SQLite.
//!
//! A [`Replica`] tracks ordinary tables. Every write made through a [`Tx`]
//! lands in a column-level change log stamped with a database version and
//! the writing site, and change records from other replicas merge into it
//! deterministically: causal length first, then column version, then the
//! originating site.

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod observability;
pub mod store;
pub mod sync;

pub use clock::{
	ChangeCursor, ChangeRecord, ChangeStream, MIN_VERSION, PeerEvent, SENTINEL, SiteCursor, SiteId,
	SiteVersion, TrackedPeer,
};
pub use codec::Value;
pub use error::{Error, Result};
pub use store::{Replica, ReplicaOptions, Tx};
pub use sync::{MergeReport, Rank, SyncReport, sync};
