//! For single EVM instruction/opcode representations from a structLog trace.
//!
//! Note that a line in a trace is pre-application of the opcode. E.g., the opcode will
//! use the values in the stack on the same line; its result appears on the next line.

use serde::{Deserialize, Serialize};

/// A single EVM step as reported by the structLog tracer.
///
/// Stack items are hex strings, bottom first, and are not necessarily
/// zero-padded to full words.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvmStep {
    pub pc: u64,
    pub op: String,
    pub depth: u64,
    #[serde(default)]
    pub stack: Option<Vec<String>>,
}

/// A full trace for one executed transaction or simulated call.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTrace {
    #[serde(default)]
    pub struct_logs: Vec<EvmStep>,
    #[serde(default)]
    pub gas: Option<u64>,
    #[serde(default)]
    pub failed: Option<bool>,
    #[serde(default)]
    pub return_value: Option<String>,
}
