//! Runs one logical operation against one backend and normalizes the
//! outcome.
//!
//! EVM reverts are captured as data and never thrown past this boundary;
//! RPC and trace failures propagate as fatal.

use std::collections::{HashMap, HashSet};

use arbdiff_interpret::{storage_accesses, ExecutionTrace, ParseError, StorageAccess};
use ethers::abi::{Function, HumanReadableParser, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Bytes, Log, TransactionReceipt, H160, H256, U256, U64};
use log::debug;
use thiserror::Error;

use crate::precompiles::RemapRule;
use crate::rpc::{BackendClient, CallReturn, RpcError};
use crate::utils::hex_encode;

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("Rpc error {0}")]
    Rpc(#[from] RpcError),
    #[error("Trace parse error {0}")]
    Trace(#[from] ParseError),
    #[error("Invalid operation signature: {0}")]
    BadSignature(String),
    #[error("Abi error {0}")]
    Abi(String),
    #[error("Could not decode output {output} of {operation}")]
    Decode { operation: String, output: String },
}

/// A typed operation descriptor: resolved once per scenario, reused against
/// both backends and every identity.
#[derive(Clone, Debug)]
pub struct Operation {
    function: Function,
}

impl Operation {
    /// Parses a human readable signature, e.g.
    /// `function setBrotliCompressionLevel(uint64 level)`.
    pub fn parse(signature: &str) -> Result<Self, InvokeError> {
        let function = HumanReadableParser::parse_function(signature)
            .map_err(|error| InvokeError::BadSignature(error.to_string()))?;
        Ok(Self { function })
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// ABI-encodes calldata (selector plus arguments).
    pub fn encode(&self, args: &[Token]) -> Result<Bytes, InvokeError> {
        Ok(self
            .function
            .encode_input(args)
            .map_err(|error| InvokeError::Abi(error.to_string()))?
            .into())
    }

    /// Decodes a return payload into tokens.
    pub fn decode(&self, output: &Bytes) -> Result<Vec<Token>, InvokeError> {
        self.function
            .decode_output(output.as_ref())
            .map_err(|_| InvokeError::Decode {
                operation: self.function.name.clone(),
                output: hex_encode(output),
            })
    }
}

/// Everything observed from one invocation against one backend.
#[derive(Clone, Debug, Default)]
pub struct ExecutionResult {
    pub static_result: Option<Vec<Token>>,
    pub static_reverted: bool,
    pub static_error: Option<String>,
    pub tx_hash: Option<H256>,
    pub receipt: Option<TransactionReceipt>,
    pub reverted: bool,
    pub revert_reason: Option<String>,
    pub storage_accesses: Vec<StorageAccess>,
    pub final_storage_values: HashMap<(H160, H256), H256>,
    pub events: Vec<Log>,
}

/// Read-only invocation: static call, then a simulated-call trace for the
/// storage access sequence when the call succeeded.
pub async fn execute_call(
    client: &BackendClient,
    remap: &RemapRule,
    operation: &Operation,
    to: H160,
    args: &[Token],
    from: H160,
) -> Result<ExecutionResult, InvokeError> {
    let data = operation.encode(args)?;
    let mut result = ExecutionResult::default();

    match client.call(to, &data, from, None).await? {
        CallReturn::Ok(output) => {
            result.static_result = Some(operation.decode(&output)?);
        }
        CallReturn::Reverted { message } => {
            debug!("{}: {} reverted: {message}", client.name, operation.name());
            result.static_reverted = true;
            result.static_error = Some(message);
            return Ok(result);
        }
    }

    let trace = client.trace_call(to, &data, from).await?;
    result.storage_accesses = parse_accesses(&trace, to, remap)?;
    Ok(result)
}

/// State-mutating invocation: static pre-check, then the real transaction.
///
/// Chain state on the backend has changed when this returns, even when the
/// transaction reverted.
pub async fn execute_tx(
    client: &BackendClient,
    remap: &RemapRule,
    operation: &Operation,
    to: H160,
    args: &[Token],
    wallet: &LocalWallet,
    value: Option<U256>,
) -> Result<ExecutionResult, InvokeError> {
    let data = operation.encode(args)?;
    let from = wallet.address();
    let mut result = ExecutionResult::default();

    // Pre-check so return values stay comparable once the transaction mines.
    match client.call(to, &data, from, value).await? {
        CallReturn::Ok(output) => result.static_result = Some(operation.decode(&output)?),
        CallReturn::Reverted { message } => {
            result.static_reverted = true;
            result.static_error = Some(message);
        }
    }

    match client.send_transaction(wallet, to, data, value).await {
        Ok((tx_hash, receipt)) => {
            debug!("{}: {} mined as {tx_hash:?}", client.name, operation.name());
            result.tx_hash = Some(tx_hash);
            if receipt.status == Some(U64::zero()) {
                result.reverted = true;
                result.revert_reason = Some("transaction mined with failed status".to_owned());
            }
            result.events = receipt.logs.clone();
            result.receipt = Some(receipt);
        }
        Err(error) => match rejection_revert_reason(&error) {
            Some(reason) => {
                result.reverted = true;
                result.revert_reason = Some(reason);
                return Ok(result);
            }
            None => return Err(error.into()),
        },
    }

    if !result.reverted {
        if let Some(tx_hash) = result.tx_hash {
            let trace = client.trace_transaction(tx_hash).await?;
            result.storage_accesses = parse_accesses(&trace, to, remap)?;
            result.final_storage_values =
                fetch_final_values(client, &result.storage_accesses).await?;
        }
    }
    Ok(result)
}

fn parse_accesses(
    trace: &ExecutionTrace,
    entry: H160,
    remap: &RemapRule,
) -> Result<Vec<StorageAccess>, InvokeError> {
    Ok(remap.apply(storage_accesses(trace, entry)?))
}

/// A submission-time rejection that carries revert diagnostics is semantic;
/// anything else is infrastructure.
fn rejection_revert_reason(error: &RpcError) -> Option<String> {
    match error {
        RpcError::JsonRpc { message, .. } if message.to_lowercase().contains("revert") => {
            Some(message.clone())
        }
        _ => None,
    }
}

/// Reads back the committed value at every (address, slot) the transaction
/// touched.
async fn fetch_final_values(
    client: &BackendClient,
    accesses: &[StorageAccess],
) -> Result<HashMap<(H160, H256), H256>, InvokeError> {
    let mut touched: HashSet<(H160, H256)> = HashSet::new();
    for access in accesses {
        touched.insert((access.address, access.slot));
    }
    let mut values = HashMap::new();
    for (address, slot) in touched {
        values.insert((address, slot), client.storage_at(address, slot).await?);
    }
    Ok(values)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn operation_encodes_selector_and_argument() {
        let operation =
            Operation::parse("function setBrotliCompressionLevel(uint64 level)").unwrap();
        let data = operation
            .encode(&[Token::Uint(U256::from(11u64))])
            .unwrap();
        // 4-byte selector plus one 32-byte word.
        assert_eq!(data.len(), 36);
        assert_eq!(data[35], 11);
    }

    #[test]
    fn operation_decodes_uint_output() {
        let operation =
            Operation::parse("function getBrotliCompressionLevel() view returns (uint64)")
                .unwrap();
        let mut word = [0u8; 32];
        word[31] = 0x0b;
        let tokens = operation.decode(&Bytes::from(word.to_vec())).unwrap();
        assert_eq!(tokens, vec![Token::Uint(U256::from(11u64))]);
    }

    #[test]
    fn operation_decode_failure_names_the_operation() {
        let operation =
            Operation::parse("function getMinimumGasPrice() view returns (uint256)").unwrap();
        let error = operation.decode(&Bytes::from(vec![0x01])).unwrap_err();
        match error {
            InvokeError::Decode { operation, output } => {
                assert_eq!(operation, "getMinimumGasPrice");
                assert_eq!(output, "0x01");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn bad_signature_is_rejected() {
        assert!(matches!(
            Operation::parse("not a function"),
            Err(InvokeError::BadSignature(_))
        ));
    }

    #[test]
    fn rejection_with_revert_text_is_semantic() {
        let error = RpcError::JsonRpc {
            backend: "mock".to_owned(),
            code: 3,
            message: "execution reverted (nope)".to_owned(),
        };
        assert_eq!(
            rejection_revert_reason(&error),
            Some("execution reverted (nope)".to_owned())
        );
    }

    #[test]
    fn rejection_without_revert_text_is_fatal() {
        let error = RpcError::JsonRpc {
            backend: "mock".to_owned(),
            code: -32601,
            message: "method not found".to_owned(),
        };
        assert_eq!(rejection_revert_reason(&error), None);
    }
}
