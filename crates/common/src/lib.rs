//! Shared error taxonomy and envelope wire format for `blobvault` crates.

pub mod envelope;
pub mod error;

pub use envelope::{AadKind, Eg2Header, EnvelopeError, LegacyHeader};
pub use error::StorageError;
