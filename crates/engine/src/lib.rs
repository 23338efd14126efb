//! Engine crate
//!
//! The scan, read, write and mutation connectors, and the flush policy,
//! name templates and time parameters they are configured with.

pub mod flush;
pub mod operators;
pub mod template;
pub mod time;

pub use flush::FlushPolicy;
pub use operators::{
    shutdown_requested, CheckOptions, FileFormat, GetRequest, Mutation, MutationConfig, MutationConnector,
    MutationOptions, ReadConfig, ReadConnector, ReadOptions, RecordIter, ScanConfig, ScanCursor, ScanOptions,
    ScanSource, ScanState, Watermark, WriteConfig, WriteConnector, WriteOptions, WriteTarget,
};
pub use template::NameTemplate;
pub use time::{check_time_param, TimeParam};
