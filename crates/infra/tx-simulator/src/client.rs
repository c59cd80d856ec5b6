//! Remote ledger access used by the dispatch engine.

use alloy_network::{ReceiptResponse, TransactionResponse};
use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_provider::{Provider, ProviderBuilder, RootProvider};
use async_trait::async_trait;
use eyre::WrapErr;

use crate::LedgerError;

/// Visibility of a submitted transaction on the remote ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Known to the node but not yet in a block.
    Pending,
    /// Included in a block.
    Included,
    /// Not known to the node.
    Unknown,
}

/// The parts of a receipt the sequential workloads care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptSummary {
    /// Block the transaction was included in.
    pub block_number: Option<u64>,
    /// Address of the created contract, for deployments.
    pub contract_address: Option<Address>,
    /// Whether execution succeeded.
    pub success: bool,
}

/// Capability set the engine consumes from the remote ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync + 'static {
    /// Returns the next usable nonce for `address`, counting pending transactions.
    async fn pending_nonce(&self, address: Address) -> Result<u64, LedgerError>;

    /// Returns the current balance of `address` in wei.
    async fn balance(&self, address: Address) -> Result<U256, LedgerError>;

    /// Returns the node's suggested gas price in wei.
    async fn gas_price(&self) -> Result<u128, LedgerError>;

    /// Submits an encoded, signed transaction.
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<(), LedgerError>;

    /// Looks up whether a transaction is pending, included, or unknown.
    async fn transaction_status(&self, hash: B256) -> Result<TxStatus, LedgerError>;

    /// Returns the receipt of an included transaction, if any.
    async fn transaction_receipt(&self, hash: B256)
    -> Result<Option<ReceiptSummary>, LedgerError>;

    /// Returns the chain id used for replay protection.
    async fn chain_id(&self) -> Result<u64, LedgerError>;
}

/// [`LedgerClient`] backed by an alloy HTTP provider.
#[derive(Debug, Clone)]
pub struct AlloyLedgerClient {
    provider: RootProvider,
}

impl AlloyLedgerClient {
    /// Connects to the JSON-RPC endpoint at `url`.
    pub fn new_http(url: &str) -> eyre::Result<Self> {
        let url: url::Url = url.parse().wrap_err("Invalid RPC URL")?;
        eyre::ensure!(
            matches!(url.scheme(), "http" | "https"),
            "Unsupported RPC URL scheme {}, only http and https are supported",
            url.scheme()
        );
        let provider = ProviderBuilder::new().disable_recommended_fillers().connect_http(url);
        Ok(Self { provider })
    }

    /// Returns a reference to the underlying provider.
    pub const fn provider(&self) -> &RootProvider {
        &self.provider
    }
}

#[async_trait]
impl LedgerClient for AlloyLedgerClient {
    async fn pending_nonce(&self, address: Address) -> Result<u64, LedgerError> {
        self.provider
            .get_transaction_count(address)
            .pending()
            .await
            .map_err(|e| LedgerError::query("eth_getTransactionCount", e))
    }

    async fn balance(&self, address: Address) -> Result<U256, LedgerError> {
        self.provider.get_balance(address).await.map_err(|e| LedgerError::query("eth_getBalance", e))
    }

    async fn gas_price(&self) -> Result<u128, LedgerError> {
        self.provider.get_gas_price().await.map_err(|e| LedgerError::query("eth_gasPrice", e))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<(), LedgerError> {
        self.provider.send_raw_transaction(&raw).await.map_err(LedgerError::submit)?;
        Ok(())
    }

    async fn transaction_status(&self, hash: B256) -> Result<TxStatus, LedgerError> {
        let tx = self
            .provider
            .get_transaction_by_hash(hash)
            .await
            .map_err(|e| LedgerError::query("eth_getTransactionByHash", e))?;

        Ok(match tx {
            Some(tx) if tx.block_number().is_some() => TxStatus::Included,
            Some(_) => TxStatus::Pending,
            None => TxStatus::Unknown,
        })
    }

    async fn transaction_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<ReceiptSummary>, LedgerError> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| LedgerError::query("eth_getTransactionReceipt", e))?;

        Ok(receipt.map(|r| ReceiptSummary {
            block_number: r.block_number(),
            contract_address: r.contract_address(),
            success: r.status(),
        }))
    }

    async fn chain_id(&self) -> Result<u64, LedgerError> {
        self.provider.get_chain_id().await.map_err(|e| LedgerError::query("eth_chainId", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_url() {
        assert!(AlloyLedgerClient::new_http("not a url").is_err());
    }

    #[test]
    fn test_accepts_http_url() {
        assert!(AlloyLedgerClient::new_http("http://127.0.0.1:8545").is_ok());
    }

    #[test]
    fn test_rejects_websocket_url() {
        assert!(AlloyLedgerClient::new_http("ws://127.0.0.1:8546").is_err());
    }
}
