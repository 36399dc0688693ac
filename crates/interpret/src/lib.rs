//! Turns a structLog execution trace into an ordered storage access
//! sequence with call-frame address attribution.

pub mod access;
pub mod context;
pub mod parse;
pub mod step;

pub use access::{AccessKind, StorageAccess};
pub use parse::{remap_addresses, storage_accesses, ParseError};
pub use step::{EvmStep, ExecutionTrace};
