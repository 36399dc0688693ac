//! JSON-RPC plumbing for one backend node.
//!
//! Typed operations go through an ethers provider; the tracing facility and
//! revert-classifying calls use hand-built requests so the error envelope
//! stays visible to the caller. Transport failures are fatal and never
//! conflated with EVM-level reverts.

use arbdiff_interpret::ExecutionTrace;
use ethers::abi::{decode as abi_decode, ParamType, Token};
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer, WalletError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Bytes, TransactionReceipt, TransactionRequest, H160, H256, U256};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use url::Url;

use crate::utils::hex_decode;

/// Fixed limit so a reverting transaction still mines and is classified by
/// receipt status instead of failing client-side gas estimation.
const TX_GAS_LIMIT: u64 = 10_000_000;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Reqwest error {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Url error {0}")]
    Url(#[from] url::ParseError),
    #[error("Provider error {0}")]
    Provider(#[from] ethers::providers::ProviderError),
    #[error("Wallet error {0}")]
    Wallet(#[from] WalletError),
    #[error("Backend {backend} returned JSON-RPC error {code}: {message}")]
    JsonRpc {
        backend: String,
        code: i64,
        message: String,
    },
    #[error("Backend {backend} returned neither result nor error")]
    EmptyResponse { backend: String },
    #[error("Transaction dropped before a receipt was produced")]
    MissingReceipt,
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonRpcRequest {
    jsonrpc: String,
    method: String,
    params: Vec<Value>,
    id: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RpcResponse<T> {
    pub(crate) result: Option<T>,
    pub(crate) error: Option<JsonRpcError>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct JsonRpcError {
    pub(crate) code: i64,
    pub(crate) message: String,
    #[serde(default)]
    pub(crate) data: Option<Value>,
}

impl JsonRpcError {
    /// Message with the decoded revert reason appended when the node
    /// attached an Error(string) payload.
    pub(crate) fn full_message(&self) -> String {
        match self.data.as_ref().and_then(decode_revert_string) {
            Some(reason) => format!("{} ({reason})", self.message),
            None => self.message.clone(),
        }
    }
}

/// Extracts the human readable reason from an ABI-encoded Error(string)
/// revert payload.
fn decode_revert_string(data: &Value) -> Option<String> {
    let payload = match data {
        Value::String(payload) => payload.as_str(),
        Value::Object(fields) => fields.get("data")?.as_str()?,
        _ => return None,
    };
    let bytes = hex_decode(payload).ok()?;
    let inner = bytes.strip_prefix(&[0x08, 0xc3, 0x79, 0xa0][..])?;
    match abi_decode(&[ParamType::String], inner).ok()?.first() {
        Some(Token::String(reason)) => Some(reason.clone()),
        _ => None,
    }
}

fn trace_config() -> Value {
    json!({
        "enableMemory": false,
        "enableReturnData": false,
        "disableStorage": false
    })
}

fn call_object(to: H160, data: &Bytes, from: H160, value: Option<U256>) -> Value {
    let mut call = json!({"from": from, "to": to, "data": data});
    if let Some(value) = value {
        call["value"] = json!(value);
    }
    call
}

/// Generates a JSON-RPC request for eth_call for the given call parameters.
pub(crate) fn eth_call(to: H160, data: &Bytes, from: H160, value: Option<U256>) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: "2.0".to_owned(),
        method: "eth_call".to_owned(),
        params: vec![call_object(to, data, from, value), json!("latest")],
        id: 1,
    }
}

/// Generates a JSON-RPC request for debug_traceTransaction for
/// the given transaction.
pub(crate) fn debug_trace_transaction(tx_hash: H256) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: "2.0".to_owned(),
        method: "debug_traceTransaction".to_owned(),
        params: vec![json!(tx_hash), trace_config()],
        id: 1,
    }
}

/// Generates a JSON-RPC request for debug_traceCall for a simulated call
/// at the latest block.
pub(crate) fn debug_trace_call(to: H160, data: &Bytes, from: H160) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: "2.0".to_owned(),
        method: "debug_traceCall".to_owned(),
        params: vec![
            call_object(to, data, from, None),
            json!("latest"),
            trace_config(),
        ],
        id: 1,
    }
}

/// Outcome of a read-only call: the EVM either returned or reverted.
#[derive(Clone, Debug)]
pub enum CallReturn {
    Ok(Bytes),
    Reverted { message: String },
}

/// One endpoint of the pair.
#[derive(Clone, Debug)]
pub struct BackendClient {
    pub name: String,
    url: Url,
    http: Client,
    provider: Provider<Http>,
    chain_id: U256,
}

impl BackendClient {
    /// Connects and pins the backend's chain id for transaction signing.
    pub async fn connect(name: &str, url: &str) -> Result<Self, RpcError> {
        let url = Url::parse(url)?;
        let provider = Provider::<Http>::try_from(url.as_str())?;
        let chain_id = provider.get_chainid().await?;
        Ok(Self {
            name: name.to_owned(),
            url,
            http: Client::new(),
            provider,
            chain_id,
        })
    }

    async fn request<T: DeserializeOwned>(&self, request: &JsonRpcRequest) -> Result<T, RpcError> {
        let response: RpcResponse<T> = self
            .http
            .post(self.url.clone())
            .json(request)
            .send()
            .await?
            .json()
            .await?;
        match (response.result, response.error) {
            (Some(result), _) => Ok(result),
            (None, Some(error)) => Err(RpcError::JsonRpc {
                backend: self.name.clone(),
                code: error.code,
                message: error.full_message(),
            }),
            (None, None) => Err(RpcError::EmptyResponse {
                backend: self.name.clone(),
            }),
        }
    }

    /// Read-only call. An error in the JSON-RPC envelope is an EVM revert;
    /// transport failures surface as `RpcError`.
    pub async fn call(
        &self,
        to: H160,
        data: &Bytes,
        from: H160,
        value: Option<U256>,
    ) -> Result<CallReturn, RpcError> {
        let request = eth_call(to, data, from, value);
        let response: RpcResponse<Bytes> = self
            .http
            .post(self.url.clone())
            .json(&request)
            .send()
            .await?
            .json()
            .await?;
        match (response.result, response.error) {
            (Some(output), _) => Ok(CallReturn::Ok(output)),
            (None, Some(error)) => Ok(CallReturn::Reverted {
                message: error.full_message(),
            }),
            (None, None) => Err(RpcError::EmptyResponse {
                backend: self.name.clone(),
            }),
        }
    }

    /// Signs and submits a transaction, then waits for its receipt.
    pub async fn send_transaction(
        &self,
        wallet: &LocalWallet,
        to: H160,
        data: Bytes,
        value: Option<U256>,
    ) -> Result<(H256, TransactionReceipt), RpcError> {
        let wallet = wallet.clone().with_chain_id(self.chain_id.as_u64());
        let from = wallet.address();
        let nonce = self.provider.get_transaction_count(from, None).await?;
        let gas_price = self.provider.get_gas_price().await?;

        let mut request = TransactionRequest::new()
            .from(from)
            .to(to)
            .data(data)
            .nonce(nonce)
            .gas(TX_GAS_LIMIT)
            .gas_price(gas_price)
            .chain_id(self.chain_id.as_u64());
        if let Some(value) = value {
            request = request.value(value);
        }
        let typed: TypedTransaction = request.into();
        let signature = wallet.sign_transaction(&typed).await?;
        let raw = typed.rlp_signed(&signature);

        let pending = self.provider.send_raw_transaction(raw).await?;
        let tx_hash = *pending;
        let receipt = pending.await?.ok_or(RpcError::MissingReceipt)?;
        Ok((tx_hash, receipt))
    }

    /// Step-level trace of a past transaction.
    pub async fn trace_transaction(&self, tx_hash: H256) -> Result<ExecutionTrace, RpcError> {
        self.request(&debug_trace_transaction(tx_hash)).await
    }

    /// Step-level trace of a simulated call at the latest block.
    pub async fn trace_call(
        &self,
        to: H160,
        data: &Bytes,
        from: H160,
    ) -> Result<ExecutionTrace, RpcError> {
        self.request(&debug_trace_call(to, data, from)).await
    }

    /// Current value at (address, slot).
    pub async fn storage_at(&self, address: H160, slot: H256) -> Result<H256, RpcError> {
        Ok(self.provider.get_storage_at(address, slot, None).await?)
    }

    /// Whether non-trivial code is present at the address. Used to decide
    /// if mock deployment is still needed before a scenario starts.
    pub async fn has_code(&self, address: H160) -> Result<bool, RpcError> {
        let code = self.provider.get_code(address, None).await?;
        Ok(!code.0.is_empty())
    }
}

/// The two independently running nodes under comparison.
#[derive(Clone, Debug)]
pub struct BackendPair {
    pub mock: BackendClient,
    pub underlying: BackendClient,
}

impl BackendPair {
    pub async fn connect(mock_url: &str, underlying_url: &str) -> Result<Self, RpcError> {
        Ok(Self {
            mock: BackendClient::connect("mock", mock_url).await?,
            underlying: BackendClient::connect("underlying", underlying_url).await?,
        })
    }
}
