//! Storage access records produced by walking a trace.

use ethers::types::{H160, H256};
use serde::{Deserialize, Serialize};

/// Whether an access read or wrote the slot.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    Read,
    Write,
}

/// A single storage read or write, in execution order.
///
/// Produced fresh per execution and never mutated after the address
/// remapping pass.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageAccess {
    /// Contract whose storage was touched, after call-frame attribution.
    pub address: H160,
    /// 32-byte storage key.
    pub slot: H256,
    pub kind: AccessKind,
    /// Stored value for writes; observed value for reads when the trace
    /// exposes it on the following step.
    pub value: Option<H256>,
    pub pc: u64,
    pub op: String,
}
