//! The chain client facade.
//!
//! [`Client`] is the single entry point the rest of the node uses to talk to
//! one EVM chain. Reads are routed through the pool's active primary, writes
//! are broadcast to every eligible endpoint, and send failures are mapped to
//! a [`SendOutcome`] by the [`SendErrorClassifier`].

use std::collections::BTreeMap;

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chainclient_core::{
    parse_hex_u64, BroadcastError, BroadcastReport, ChainType, ConfigError, JsonRpcRequest,
    JsonRpcResponse, NamedTransport, Pool, PoolConfig, TransportError,
};

use crate::send_error::{SendError, SendErrorClassifier, SendErrorKind, SendOutcome};
use crate::subscription::{HeadForwarder, HeadSubscription, LogForwarder, Subscription};
use crate::types::{
    to_block_number_arg, Block, CallArgs, Head, Header, Log, LogFilter, SignedTransaction,
    TransactionReceipt,
};

/// `balanceOf(address)`
pub const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

/// Calldata of an ERC-20 `balanceOf(account)` call.
pub fn balance_of_calldata(account: Address) -> Bytes {
    let mut data = Vec::with_capacity(36);
    data.extend_from_slice(&BALANCE_OF_SELECTOR);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(account.as_slice());
    data.into()
}

/// One logical EVM chain client backed by a [`Pool`].
#[derive(Debug, Clone)]
pub struct Client {
    pool: Pool,
    classifier: SendErrorClassifier,
}

impl Client {
    pub fn new(
        config: PoolConfig,
        chain_id: u64,
        chain_type: ChainType,
        primaries: Vec<NamedTransport>,
        send_only: Vec<NamedTransport>,
    ) -> Result<Self, ConfigError> {
        let pool = Pool::new(config, chain_id, chain_type, primaries, send_only)?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self {
            pool,
            classifier: SendErrorClassifier::default(),
        }
    }

    /// Replace the built-in send-error patterns.
    pub fn with_classifier(mut self, classifier: SendErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn classifier(&self) -> &SendErrorClassifier {
        &self.classifier
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────────

    pub async fn dial(&self) -> Result<(), TransportError> {
        self.pool.dial().await.map_err(|e| {
            tracing::error!(chain_id = self.pool.chain_id(), error = %e, "failed to dial pool");
            e
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn chain_id(&self) -> u64 {
        self.pool.chain_id()
    }

    pub fn chain_type(&self) -> ChainType {
        self.pool.chain_type()
    }

    /// Endpoint name → state. May be empty.
    pub fn node_states(&self) -> BTreeMap<String, String> {
        self.pool.node_states()
    }

    // ─── Generic calls ────────────────────────────────────────────────────────

    /// Call an arbitrary method on the active primary.
    pub async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
        self.pool.request(method, params).await
    }

    pub async fn batch_call(
        &self,
        reqs: Vec<JsonRpcRequest>,
    ) -> Result<Vec<JsonRpcResponse>, TransportError> {
        self.pool.batch(reqs).await
    }

    /// Execute the batch on every endpoint, send-only ones included.
    ///
    /// Only safe for mass retransmission of already signed transactions.
    pub async fn batch_call_all(
        &self,
        reqs: Vec<JsonRpcRequest>,
    ) -> Result<Vec<JsonRpcResponse>, TransportError> {
        self.pool.batch_all(reqs).await
    }

    /// Decode a result, mapping `null` to [`TransportError::NotFound`].
    async fn fetch<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, TransportError> {
        match self.pool.request(method, params).await? {
            Value::Null => Err(TransportError::NotFound),
            value => Ok(serde_json::from_value(value)?),
        }
    }

    async fn fetch_quantity(&self, method: &str, params: Vec<Value>) -> Result<u64, TransportError> {
        let value = self.pool.request(method, params).await?;
        value
            .as_str()
            .and_then(parse_hex_u64)
            .ok_or_else(|| TransportError::Other(format!("{method}: expected hex quantity, got {value}")))
    }

    // ─── Balances ─────────────────────────────────────────────────────────────

    /// ERC-20 `balanceOf(account)` on `token`, at the latest block.
    pub async fn erc20_balance(&self, account: Address, token: Address) -> Result<U256, TransportError> {
        let call = CallArgs {
            to: Some(token),
            data: balance_of_calldata(account),
            ..Default::default()
        };
        let raw = self.call_contract(&call, None).await?;
        if raw.is_empty() {
            return Err(TransportError::Other(format!(
                "balanceOf returned no data, is {token} a token contract?"
            )));
        }
        U256::try_from_be_slice(&raw)
            .ok_or_else(|| TransportError::Other(format!("balanceOf returned {} bytes", raw.len())))
    }

    /// Native balance in wei. `None` reads the latest block.
    pub async fn native_balance(
        &self,
        account: Address,
        block: Option<u64>,
    ) -> Result<U256, TransportError> {
        self.balance_at(account, block).await
    }

    pub async fn balance_at(&self, account: Address, block: Option<u64>) -> Result<U256, TransportError> {
        self.fetch("eth_getBalance", vec![json!(account), json!(to_block_number_arg(block))])
            .await
    }

    // ─── Heads & blocks ───────────────────────────────────────────────────────

    fn stamp(&self, mut head: Head) -> Head {
        head.chain_id = Some(self.chain_id());
        head
    }

    /// Head at `number`, or the latest head for `None`.
    pub async fn head_by_number(&self, number: Option<u64>) -> Result<Head, TransportError> {
        let head = self
            .fetch(
                "eth_getBlockByNumber",
                vec![json!(to_block_number_arg(number)), json!(false)],
            )
            .await?;
        Ok(self.stamp(head))
    }

    pub async fn head_by_hash(&self, hash: B256) -> Result<Head, TransportError> {
        let head = self
            .fetch("eth_getBlockByHash", vec![json!(hash), json!(false)])
            .await?;
        Ok(self.stamp(head))
    }

    pub async fn header_by_number(&self, number: Option<u64>) -> Result<Header, TransportError> {
        self.fetch(
            "eth_getBlockByNumber",
            vec![json!(to_block_number_arg(number)), json!(false)],
        )
        .await
    }

    pub async fn header_by_hash(&self, hash: B256) -> Result<Header, TransportError> {
        self.fetch("eth_getBlockByHash", vec![json!(hash), json!(false)])
            .await
    }

    pub async fn block_by_number(&self, number: Option<u64>) -> Result<Block, TransportError> {
        self.fetch(
            "eth_getBlockByNumber",
            vec![json!(to_block_number_arg(number)), json!(true)],
        )
        .await
    }

    pub async fn block_by_hash(&self, hash: B256) -> Result<Block, TransportError> {
        self.fetch("eth_getBlockByHash", vec![json!(hash), json!(true)])
            .await
    }

    /// Receipt of a mined transaction. Unknown and still pending transactions
    /// are [`TransportError::NotFound`].
    pub async fn transaction_receipt(&self, hash: B256) -> Result<TransactionReceipt, TransportError> {
        let value = match self.request("eth_getTransactionReceipt", vec![json!(hash)]).await {
            Ok(value) => value,
            Err(e) if e.node_message().contains("missing required field") => {
                return Err(TransportError::NotFound)
            }
            Err(e) => return Err(e),
        };
        if value.get("blockNumber").map_or(true, Value::is_null) {
            return Err(TransportError::NotFound);
        }
        Ok(serde_json::from_value(value)?)
    }

    // ─── Accounts & state ─────────────────────────────────────────────────────

    pub async fn nonce_at(&self, account: Address, block: Option<u64>) -> Result<u64, TransportError> {
        self.fetch_quantity(
            "eth_getTransactionCount",
            vec![json!(account), json!(to_block_number_arg(block))],
        )
        .await
    }

    pub async fn pending_nonce_at(&self, account: Address) -> Result<u64, TransportError> {
        self.fetch_quantity("eth_getTransactionCount", vec![json!(account), json!("pending")])
            .await
    }

    pub async fn code_at(&self, account: Address, block: Option<u64>) -> Result<Bytes, TransportError> {
        self.fetch("eth_getCode", vec![json!(account), json!(to_block_number_arg(block))])
            .await
    }

    pub async fn pending_code_at(&self, account: Address) -> Result<Bytes, TransportError> {
        self.fetch("eth_getCode", vec![json!(account), json!("pending")])
            .await
    }

    pub async fn call_contract(&self, call: &CallArgs, block: Option<u64>) -> Result<Bytes, TransportError> {
        self.fetch("eth_call", vec![json!(call), json!(to_block_number_arg(block))])
            .await
    }

    pub async fn estimate_gas(&self, call: &CallArgs) -> Result<u64, TransportError> {
        self.fetch_quantity("eth_estimateGas", vec![json!(call)]).await
    }

    pub async fn suggest_gas_price(&self) -> Result<U256, TransportError> {
        self.fetch("eth_gasPrice", vec![]).await
    }

    pub async fn suggest_gas_tip_cap(&self) -> Result<U256, TransportError> {
        self.fetch("eth_maxPriorityFeePerGas", vec![]).await
    }

    pub async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, TransportError> {
        self.fetch("eth_getLogs", vec![filter.to_params()]).await
    }

    // ─── Sending ──────────────────────────────────────────────────────────────

    /// Broadcast to every eligible endpoint, send-only ones included.
    pub async fn send_transaction(
        &self,
        tx: &SignedTransaction,
    ) -> Result<BroadcastReport, BroadcastError> {
        let req = JsonRpcRequest::new(0, "eth_sendRawTransaction", vec![json!(tx.raw())]);
        let report = self.pool.broadcast(req).await?;
        tracing::debug!(
            tx_hash = %tx.hash(),
            accepted = ?report.accepted,
            rejected = report.failures.len(),
            "transaction broadcast"
        );
        Ok(report)
    }

    /// Broadcast `tx` and classify the result.
    ///
    /// The error, if any, is always returned next to the outcome so the caller
    /// can record it.
    pub async fn send_transaction_and_return_error_type(
        &self,
        tx: &SignedTransaction,
        from: Address,
    ) -> (SendOutcome, Option<SendError>) {
        let err = self.send_transaction(tx).await.err().map(SendError::from);
        let classification = self
            .classifier
            .classify_detailed(err.as_ref(), self.chain_type().is_l2());
        let Some(err) = err else {
            return (SendOutcome::Successful, None);
        };
        let tx_hash = tx.hash();

        let err = match (classification.outcome, classification.kind) {
            (SendOutcome::Successful, Some(SendErrorKind::AlreadyInMempool)) => {
                tracing::debug!(%tx_hash, node_error = %err, "transaction already in mempool");
                err
            }
            (SendOutcome::Successful, Some(SendErrorKind::TemporarilyUnderpriced)) => {
                tracing::info!(%tx_hash, error = %err, "transaction temporarily underpriced");
                err
            }
            (SendOutcome::Unsupported, _) => err.context("this error type only handled for L2s"),
            (SendOutcome::Retryable, Some(SendErrorKind::NonceTooHigh)) => {
                tracing::warn!(%tx_hash, error = %err, "transaction has a nonce gap");
                err
            }
            (SendOutcome::Retryable, Some(SendErrorKind::InsufficientFunds)) => {
                tracing::error!(
                    severity = "critical",
                    error = %err,
                    "Tx {} with type 0x{:x} was rejected due to insufficient eth: {}\n\
                     ACTION REQUIRED: wallet with address {} is OUT OF FUNDS",
                    tx_hash,
                    tx.tx_type(),
                    err,
                    from,
                );
                err
            }
            (SendOutcome::Retryable, Some(SendErrorKind::Timeout)) => {
                err.context(format!("timeout while sending transaction {tx_hash}"))
            }
            (SendOutcome::Fatal, _) => {
                tracing::error!(severity = "critical", %tx_hash, error = %err, "Fatal error sending transaction");
                err
            }
            (SendOutcome::Unknown, Some(SendErrorKind::TxFeeExceedsCap)) => {
                tracing::error!(
                    severity = "critical",
                    id = "RPCTxFeeCapExceeded",
                    %tx_hash,
                    error = %err,
                    "Sending transaction failed (treating this error as of type Unknown); \
                     the RPC node's tx fee cap is configured too low"
                );
                err
            }
            _ => err,
        };
        (classification.outcome, Some(err))
    }

    // ─── Subscriptions ────────────────────────────────────────────────────────

    /// Relay new heads from the active primary into `dest`.
    pub async fn subscribe_new_head(
        &self,
        dest: mpsc::Sender<Head>,
        cancel: CancellationToken,
    ) -> Result<HeadSubscription, TransportError> {
        let upstream = self.pool.subscribe("newHeads", vec![]).await?;
        Ok(HeadForwarder::new(self.chain_id(), dest)
            .with_unsubscribe_timeout(self.pool.config().query_timeout)
            .start(upstream, cancel))
    }

    /// Relay logs matching `filter` into `dest`.
    pub async fn subscribe_filter_logs(
        &self,
        filter: &LogFilter,
        dest: mpsc::Sender<Log>,
        cancel: CancellationToken,
    ) -> Result<Subscription, TransportError> {
        tracing::debug!(filter = %filter.to_subscription_params(), "subscribing to logs");
        let upstream = self
            .pool
            .subscribe("logs", vec![filter.to_subscription_params()])
            .await?;
        Ok(LogForwarder::new(dest)
            .with_unsubscribe_timeout(self.pool.config().query_timeout)
            .start(upstream, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_of_calldata_layout() {
        let account = Address::repeat_byte(0xab);
        let data = balance_of_calldata(account);
        assert_eq!(data.len(), 36);
        assert_eq!(&data[..4], &[0x70, 0xa0, 0x82, 0x31]);
        assert!(data[4..16].iter().all(|b| *b == 0));
        assert_eq!(&data[16..], account.as_slice());
    }
}
