#![forbid(unsafe_code)]

//! JSON-RPC surface over the chain handle. The handler table is built at
//! construction and never mutated; the server is a thin line-delimited
//! JSON-RPC 2.0 loop for the wallet and tooling on localhost.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::block::Block;
use crate::blockchain::ChainHandle;
use crate::crypto;
use crate::safebox::tx::Operation;

#[derive(Clone, Debug, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    fn method_not_found(method: &str) -> Self {
        RpcError {
            code: -32601,
            message: format!("unknown method {method}"),
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        RpcError {
            code: -32602,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        RpcError {
            code: -32603,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        RpcError {
            code: -32004,
            message: message.into(),
        }
    }
}

pub type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

fn param_u32(params: &Value, key: &str) -> Result<u32, RpcError> {
    params
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| RpcError::invalid_params(format!("missing or invalid '{key}'")))
}

fn param_u32_or(params: &Value, key: &str, default: u32) -> Result<u32, RpcError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(_) => param_u32(params, key),
    }
}

fn param_hex(params: &Value, key: &str) -> Result<Vec<u8>, RpcError> {
    let text = params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid_params(format!("missing or invalid '{key}'")))?;
    hex::decode(text).map_err(|_| RpcError::invalid_params(format!("'{key}' is not hex")))
}

fn block_to_json(index: u32, block: &Block) -> Value {
    let header = &block.header;
    json!({
        "block": index,
        "version": header.version,
        "timestamp": header.timestamp,
        "reward": header.reward,
        "fee": header.fee_total,
        "nonce": header.nonce,
        "target": format!("{:08x}", header.compact_target),
        "enc_pubkey": hex::encode(crypto::serialize_public(&header.reward_public_key)),
        "payload": hex::encode(&header.payload),
        "oph": hex::encode(header.operations_merkle_root),
        "sbh": hex::encode(header.safebox_hash_after),
        "pow": hex::encode(header.pow_digest()),
        "operations": block.operations.len(),
    })
}

/// The RPC method table; handlers are injected once at construction.
pub struct Api {
    handlers: HashMap<&'static str, Handler>,
}

impl Api {
    pub fn new(chain: ChainHandle) -> Arc<Self> {
        let mut handlers: HashMap<&'static str, Handler> = HashMap::new();

        let handle = chain.clone();
        handlers.insert(
            "getblockcount",
            Arc::new(move |_params| {
                let chain = handle.clone();
                Box::pin(async move {
                    let state = chain
                        .get_state()
                        .await
                        .map_err(|err| RpcError::internal(err.to_string()))?;
                    Ok(json!(state.height))
                })
            }),
        );

        let handle = chain.clone();
        handlers.insert(
            "getaccount",
            Arc::new(move |params| {
                let chain = handle.clone();
                Box::pin(async move {
                    let number = param_u32(&params, "account")?;
                    let account = chain
                        .get_account(number)
                        .await
                        .map_err(|err| RpcError::internal(err.to_string()))?
                        .ok_or_else(|| RpcError::not_found(format!("account {number}")))?;
                    serde_json::to_value(account)
                        .map_err(|err| RpcError::internal(err.to_string()))
                })
            }),
        );

        let handle = chain.clone();
        handlers.insert(
            "getblock",
            Arc::new(move |params| {
                let chain = handle.clone();
                Box::pin(async move {
                    let index = param_u32(&params, "block")?;
                    let data = chain
                        .get_block(index)
                        .await
                        .map_err(|err| RpcError::internal(err.to_string()))?
                        .ok_or_else(|| RpcError::not_found(format!("block {index}")))?;
                    let mut buf = data.as_slice();
                    let block = Block::deserialize(&mut buf)
                        .map_err(|err| RpcError::internal(format!("stored block: {err}")))?;
                    Ok(block_to_json(index, &block))
                })
            }),
        );

        let handle = chain.clone();
        handlers.insert(
            "findaccounts",
            Arc::new(move |params| {
                let chain = handle.clone();
                Box::pin(async move {
                    let key_bytes = param_hex(&params, "enc_pubkey")?;
                    let public_key = crypto::parse_public(&key_bytes)
                        .map_err(|_| RpcError::invalid_params("'enc_pubkey' is not a point"))?;
                    let start = param_u32_or(&params, "start", 0)?;
                    let max = param_u32_or(&params, "max", 100)?;
                    let accounts = chain
                        .find_accounts(public_key, start, max)
                        .await
                        .map_err(|err| RpcError::internal(err.to_string()))?;
                    serde_json::to_value(accounts)
                        .map_err(|err| RpcError::internal(err.to_string()))
                })
            }),
        );

        // key management lives in the wallet; sendto relays a signed op
        let handle = chain.clone();
        handlers.insert(
            "sendto",
            Arc::new(move |params| {
                let chain = handle.clone();
                Box::pin(async move {
                    let raw = param_hex(&params, "rawoperation")?;
                    let mut buf = raw.as_slice();
                    let operation = Operation::deserialize(&mut buf)
                        .map_err(|err| RpcError::invalid_params(format!("operation: {err}")))?;
                    let mut results = chain
                        .add_operations(vec![operation])
                        .await
                        .map_err(|err| RpcError::internal(err.to_string()))?;
                    match results.pop() {
                        Some(Ok(digest)) => Ok(json!({ "ophash": hex::encode(digest) })),
                        Some(Err(reason)) => Err(RpcError::invalid_params(reason)),
                        None => Err(RpcError::internal("no result")),
                    }
                })
            }),
        );

        Arc::new(Api { handlers })
    }

    pub async fn dispatch(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match self.handlers.get(method) {
            Some(handler) => handler(params).await,
            None => Err(RpcError::method_not_found(method)),
        }
    }

    async fn handle_line(&self, line: &str) -> Value {
        let request: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                return json!({
                    "jsonrpc": "2.0",
                    "id": Value::Null,
                    "error": { "code": -32700, "message": format!("parse error: {err}") },
                })
            }
        };
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request.get("method").and_then(Value::as_str).unwrap_or("");
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        match self.dispatch(method, params).await {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
        }
    }
}

/// Serves line-delimited JSON-RPC until the shutdown signal flips.
pub async fn serve(api: Arc<Api>, addr: String, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind rpc address {addr}"))?;
    info!(addr = %addr, "rpc listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let api = Arc::clone(&api);
                    tokio::spawn(async move {
                        let (read, mut write) = stream.into_split();
                        let mut lines = BufReader::new(read).lines();
                        loop {
                            match lines.next_line().await {
                                Ok(Some(line)) => {
                                    let response = api.handle_line(&line).await;
                                    let mut out = response.to_string().into_bytes();
                                    out.push(b'\n');
                                    if let Err(err) = write.write_all(&out).await {
                                        debug!(%remote, "rpc write failed: {err}");
                                        break;
                                    }
                                }
                                Ok(None) => break,
                                Err(err) => {
                                    debug!(%remote, "rpc read failed: {err}");
                                    break;
                                }
                            }
                        }
                    });
                }
                Err(err) => warn!("rpc accept failed: {err}"),
            },
            _ = shutdown.changed() => break,
        }
    }
    Ok(())
}
