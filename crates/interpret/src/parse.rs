//! Walks trace steps in order and extracts every storage read and write,
//! attributed to the contract whose frame executed the opcode.
//!
//! Call-family opcodes name the callee in the second-from-top stack slot of
//! the pre-call step; the low 20 bytes of that word are the callee address.
//! That convention holds for the structLog format of the backends driven
//! here and should be re-checked before pointing this at another client.

use std::collections::HashSet;

use ethers::types::{H160, H256};
use thiserror::Error;

use crate::{
    access::{AccessKind, StorageAccess},
    context::{CallStack, ContextError},
    step::{EvmStep, ExecutionTrace},
};

const CALL_OPCODES: [&str; 4] = ["CALL", "CALLCODE", "DELEGATECALL", "STATICCALL"];
const CREATE_OPCODES: [&str; 2] = ["CREATE", "CREATE2"];

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("Context error {0}")]
    Context(#[from] ContextError),
    #[error("{op} at pc {pc} requires {needed} stack items, found {found}")]
    StackTooShort {
        op: String,
        pc: u64,
        needed: usize,
        found: usize,
    },
    #[error("Stack item {item} is not a valid 32-byte hex word")]
    BadStackItem { item: String },
    #[error("Step at pc {pc} increases depth without a preceding call or create")]
    UnexpectedDepthIncrease { pc: u64 },
}

/// Extracts the ordered storage access sequence from a trace that entered
/// execution at `entry`.
///
/// A trace with no storage opcodes yields an empty sequence.
pub fn storage_accesses(
    trace: &ExecutionTrace,
    entry: H160,
) -> Result<Vec<StorageAccess>, ParseError> {
    let steps = &trace.struct_logs;
    let mut frames = CallStack::new(entry);
    let mut accesses = Vec::new();

    for (index, step) in steps.iter().enumerate() {
        if index > 0 {
            let previous = &steps[index - 1];
            if step.depth > previous.depth {
                let op = previous.op.as_str();
                if CALL_OPCODES.contains(&op) {
                    frames.push(callee_address(stack_nth(previous, 1)?)?);
                } else if CREATE_OPCODES.contains(&op) {
                    // The created address is not on the pre-call stack.
                    // Duplicate the creator frame so the matching pop
                    // still balances.
                    frames.push(frames.current());
                } else {
                    return Err(ParseError::UnexpectedDepthIncrease { pc: step.pc });
                }
            } else if step.depth < previous.depth {
                for _ in 0..(previous.depth - step.depth) {
                    frames.pop()?;
                }
            }
        }

        match step.op.as_str() {
            "SLOAD" => {
                let slot = parse_word(stack_nth(step, 0)?)?;
                // The loaded value replaces the key on the next step's stack.
                let value = match steps.get(index + 1) {
                    Some(next) if next.depth == step.depth => observed_word(next),
                    _ => None,
                };
                accesses.push(StorageAccess {
                    address: frames.current(),
                    slot,
                    kind: AccessKind::Read,
                    value,
                    pc: step.pc,
                    op: step.op.clone(),
                });
            }
            "SSTORE" => {
                let slot = parse_word(stack_nth(step, 0)?)?;
                let value = parse_word(stack_nth(step, 1)?)?;
                accesses.push(StorageAccess {
                    address: frames.current(),
                    slot,
                    kind: AccessKind::Write,
                    value: Some(value),
                    pc: step.pc,
                    op: step.op.clone(),
                });
            }
            _ => {}
        }
    }

    Ok(accesses)
}

/// Rewrites every access at a member address to the shared backing address.
///
/// The execution environment physically backs all member contracts' durable
/// state in one storage contract; a naive reading of the trace reports the
/// member address instead.
pub fn remap_addresses(
    accesses: Vec<StorageAccess>,
    members: &HashSet<H160>,
    backing: H160,
) -> Vec<StorageAccess> {
    accesses
        .into_iter()
        .map(|mut access| {
            if members.contains(&access.address) {
                access.address = backing;
            }
            access
        })
        .collect()
}

/// Stack item `index` places below the top. Stack arrays are bottom-first.
fn stack_nth(step: &EvmStep, index: usize) -> Result<&str, ParseError> {
    let stack = step.stack.as_deref().unwrap_or(&[]);
    stack
        .len()
        .checked_sub(index + 1)
        .and_then(|position| stack.get(position))
        .map(String::as_str)
        .ok_or(ParseError::StackTooShort {
            op: step.op.clone(),
            pc: step.pc,
            needed: index + 1,
            found: stack.len(),
        })
}

/// Best-effort read of the top of a step's stack, for observed SLOAD values.
fn observed_word(step: &EvmStep) -> Option<H256> {
    stack_nth(step, 0).ok().and_then(|item| parse_word(item).ok())
}

/// Normalizes a hex stack item to a 32-byte word, left-padding short items.
fn parse_word(item: &str) -> Result<H256, ParseError> {
    let trimmed = item.trim_start_matches("0x");
    if trimmed.len() > 64 {
        return Err(ParseError::BadStackItem {
            item: item.to_string(),
        });
    }
    let padded = format!("{trimmed:0>64}");
    let bytes = hex::decode(padded).map_err(|_| ParseError::BadStackItem {
        item: item.to_string(),
    })?;
    Ok(H256::from_slice(&bytes))
}

/// The callee named by a call-family opcode: low 20 bytes, right-justified.
fn callee_address(item: &str) -> Result<H160, ParseError> {
    let word = parse_word(item)?;
    Ok(H160::from_slice(&word.as_bytes()[12..]))
}

#[cfg(test)]
mod test {
    use super::*;

    fn address(last_byte: u8) -> H160 {
        let mut bytes = [0u8; 20];
        bytes[19] = last_byte;
        H160(bytes)
    }

    fn word(last_byte: u8) -> H256 {
        let mut bytes = [0u8; 32];
        bytes[31] = last_byte;
        H256(bytes)
    }

    fn step(pc: u64, op: &str, depth: u64, stack: &[&str]) -> EvmStep {
        EvmStep {
            pc,
            op: op.to_string(),
            depth,
            stack: Some(stack.iter().map(|item| item.to_string()).collect()),
        }
    }

    fn trace(steps: Vec<EvmStep>) -> ExecutionTrace {
        ExecutionTrace {
            struct_logs: steps,
            ..Default::default()
        }
    }

    #[test]
    fn empty_trace_yields_empty_sequence() {
        let accesses = storage_accesses(&trace(vec![]), address(0xaa)).unwrap();
        assert!(accesses.is_empty());
    }

    #[test]
    fn trace_without_storage_opcodes_yields_empty_sequence() {
        let steps = vec![
            step(0, "PUSH1", 1, &[]),
            step(2, "PUSH1", 1, &["0x1"]),
            step(4, "ADD", 1, &["0x1", "0x2"]),
        ];
        let accesses = storage_accesses(&trace(steps), address(0xaa)).unwrap();
        assert!(accesses.is_empty());
    }

    #[test]
    fn simple_write_is_attributed_to_entry() {
        // SSTORE: key on top, value below it.
        let steps = vec![step(7, "SSTORE", 1, &["0x2a", "0x0"])];
        let accesses = storage_accesses(&trace(steps), address(0xaa)).unwrap();
        assert_eq!(accesses.len(), 1);
        assert_eq!(accesses[0].address, address(0xaa));
        assert_eq!(accesses[0].slot, word(0x00));
        assert_eq!(accesses[0].kind, AccessKind::Write);
        assert_eq!(accesses[0].value, Some(word(0x2a)));
        assert_eq!(accesses[0].pc, 7);
    }

    #[test]
    fn read_captures_observed_value_from_next_step() {
        let steps = vec![
            step(3, "SLOAD", 1, &["0x0"]),
            step(4, "PUSH1", 1, &["0x2a"]),
        ];
        let accesses = storage_accesses(&trace(steps), address(0xaa)).unwrap();
        assert_eq!(accesses.len(), 1);
        assert_eq!(accesses[0].kind, AccessKind::Read);
        assert_eq!(accesses[0].value, Some(word(0x2a)));
    }

    #[test]
    fn read_at_end_of_trace_has_no_observed_value() {
        let steps = vec![step(3, "SLOAD", 1, &["0x0"])];
        let accesses = storage_accesses(&trace(steps), address(0xaa)).unwrap();
        assert_eq!(accesses[0].value, None);
    }

    #[test]
    fn read_then_write_preserves_execution_order() {
        let steps = vec![
            step(3, "SLOAD", 1, &["0x0"]),
            step(4, "PUSH1", 1, &["0xa"]),
            step(9, "SSTORE", 1, &["0xb", "0x0"]),
        ];
        let accesses = storage_accesses(&trace(steps), address(0xaa)).unwrap();
        assert_eq!(accesses.len(), 2);
        assert_eq!(accesses[0].kind, AccessKind::Read);
        assert_eq!(accesses[1].kind, AccessKind::Write);
        assert!(accesses[1].pc > accesses[0].pc);
    }

    #[test]
    fn nested_call_attributes_to_callee_despite_colliding_slots() {
        // CALL stack (bottom first): ..., callee address, gas on top.
        let callee = "0xbb";
        let steps = vec![
            step(3, "SLOAD", 1, &["0x0"]),
            step(10, "CALL", 1, &["0x0", "0x0", "0x0", "0x0", "0x0", callee, "0xffff"]),
            step(0, "PUSH1", 2, &[]),
            step(5, "SLOAD", 2, &["0x0"]),
        ];
        let accesses = storage_accesses(&trace(steps), address(0xaa)).unwrap();
        assert_eq!(accesses.len(), 2);
        assert_eq!(accesses[0].address, address(0xaa));
        assert_eq!(accesses[1].address, address(0xbb));
        assert_eq!(accesses[0].slot, accesses[1].slot);
    }

    #[test]
    fn returning_restores_caller_attribution() {
        let steps = vec![
            step(10, "STATICCALL", 1, &["0x0", "0x0", "0x0", "0x0", "0xbb", "0xffff"]),
            step(0, "SLOAD", 2, &["0x1"]),
            step(12, "SLOAD", 1, &["0x2"]),
        ];
        let accesses = storage_accesses(&trace(steps), address(0xaa)).unwrap();
        assert_eq!(accesses[0].address, address(0xbb));
        assert_eq!(accesses[1].address, address(0xaa));
    }

    #[test]
    fn reentrant_call_back_into_entry_is_attributed_to_entry() {
        let steps = vec![
            step(10, "CALL", 1, &["0x0", "0x0", "0x0", "0x0", "0x0", "0xbb", "0xffff"]),
            step(20, "CALL", 2, &["0x0", "0x0", "0x0", "0x0", "0x0", "0xaa", "0xffff"]),
            step(0, "SSTORE", 3, &["0x5", "0x1"]),
            step(22, "SLOAD", 2, &["0x3"]),
            step(12, "SLOAD", 1, &["0x4"]),
        ];
        let accesses = storage_accesses(&trace(steps), address(0xaa)).unwrap();
        assert_eq!(accesses[0].address, address(0xaa));
        assert_eq!(accesses[1].address, address(0xbb));
        assert_eq!(accesses[2].address, address(0xaa));
    }

    #[test]
    fn create_frame_keeps_creator_attribution_and_balances() {
        let steps = vec![
            step(10, "CREATE", 1, &["0x0", "0x0", "0x20"]),
            step(0, "SSTORE", 2, &["0x1", "0x0"]),
            step(12, "SLOAD", 1, &["0x0"]),
        ];
        let accesses = storage_accesses(&trace(steps), address(0xaa)).unwrap();
        assert_eq!(accesses.len(), 2);
        assert_eq!(accesses[0].address, address(0xaa));
        assert_eq!(accesses[1].address, address(0xaa));
    }

    #[test]
    fn callee_word_is_truncated_to_low_twenty_bytes() {
        // Some clients leave dirty high bytes in the address word.
        let dirty = "0xffffffffffffffffffffffff00000000000000000000000000000000000000bb";
        let steps = vec![
            step(10, "CALL", 1, &["0x0", "0x0", "0x0", "0x0", "0x0", dirty, "0xffff"]),
            step(0, "SLOAD", 2, &["0x0"]),
        ];
        let accesses = storage_accesses(&trace(steps), address(0xaa)).unwrap();
        assert_eq!(accesses[0].address, address(0xbb));
    }

    #[test]
    fn short_hex_slot_is_left_padded() {
        let steps = vec![step(3, "SLOAD", 1, &["0x1"])];
        let accesses = storage_accesses(&trace(steps), address(0xaa)).unwrap();
        assert_eq!(accesses[0].slot, word(0x01));
    }

    #[test]
    fn sstore_with_short_stack_is_an_error() {
        let steps = vec![step(3, "SSTORE", 1, &["0x0"])];
        let result = storage_accesses(&trace(steps), address(0xaa));
        assert_eq!(
            result,
            Err(ParseError::StackTooShort {
                op: "SSTORE".to_string(),
                pc: 3,
                needed: 2,
                found: 1,
            })
        );
    }

    #[test]
    fn depth_increase_without_call_is_an_error() {
        let steps = vec![
            step(0, "PUSH1", 1, &[]),
            step(1, "SLOAD", 2, &["0x0"]),
        ];
        let result = storage_accesses(&trace(steps), address(0xaa));
        assert_eq!(result, Err(ParseError::UnexpectedDepthIncrease { pc: 1 }));
    }

    #[test]
    fn return_past_entry_frame_is_an_error() {
        let steps = vec![
            step(0, "PUSH1", 1, &[]),
            step(1, "PUSH1", 0, &[]),
        ];
        let result = storage_accesses(&trace(steps), address(0xaa));
        assert_eq!(
            result,
            Err(ParseError::Context(ContextError::PoppedEntryFrame))
        );
    }

    #[test]
    fn remap_rewrites_member_addresses_only() {
        let members: HashSet<H160> = [address(0x64), address(0x6b)].into_iter().collect();
        let backing = address(0xfe);
        let accesses = vec![
            StorageAccess {
                address: address(0x64),
                slot: word(0x0),
                kind: AccessKind::Read,
                value: None,
                pc: 1,
                op: "SLOAD".to_string(),
            },
            StorageAccess {
                address: address(0xaa),
                slot: word(0x0),
                kind: AccessKind::Read,
                value: None,
                pc: 2,
                op: "SLOAD".to_string(),
            },
        ];
        let remapped = remap_addresses(accesses, &members, backing);
        assert_eq!(remapped[0].address, backing);
        assert_eq!(remapped[1].address, address(0xaa));
    }
}
