pub mod changeset;
pub mod merge;
pub mod session;

pub use changeset::{read_ndjson, write_ndjson};
pub use merge::{MergeReport, Rank};
pub use session::{SyncReport, sync};
