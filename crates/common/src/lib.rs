//! Common crate
//!
//! Shared record types, descriptors and the error taxonomy used by every
//! Cellar connector.
//!
//! # Example
//! ```rust
//! use cellar_common::{ConfigError, Error};
//! let err = Error::Config(ConfigError::Missing("credentials".to_string()));
//! assert!(!err.is_transient());
//! ```

pub mod error;
pub mod record;

pub use error::{ConfigError, Error, Result};
pub use record::{
    EntryDescriptor, EntryKind, FileInfo, MutationResult, Punctuation, Record, RowRecord,
    WriteOutput,
};
