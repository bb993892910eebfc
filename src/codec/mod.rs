//! Value and primary key representations shared by the change log and the
//! changeset format.

pub mod pk;
pub mod value;

pub use value::Value;
