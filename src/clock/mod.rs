//! Versioning primitives: site identity, version counters, the change log,
//! the site version table and peer cursors.

pub mod change_log;
pub mod peers;
pub mod site;
pub mod site_versions;
pub mod version;

pub use change_log::{ChangeCursor, ChangeRecord, ChangeStream, SENTINEL};
pub use peers::{PeerEvent, TrackedPeer};
pub use site::SiteId;
pub use site_versions::{SiteCursor, SiteVersion};
pub use version::{MIN_VERSION, VersionClock};
